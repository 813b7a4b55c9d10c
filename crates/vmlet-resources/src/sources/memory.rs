//! Main memory source: host bytes minus an operator reservation.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;
use vmlet_api::{Machine, Quantity, ResourceList, ResourceName};
use vmlet_host::HostProbe;

use crate::error::{ResourceError, Result};
use crate::sources::{instances_that_fit, Source};

pub const SOURCE_MEMORY: &str = "memory";

/// Accounts main memory in bytes. Must not be registered together with
/// [`crate::sources::HugepagesSource`], which owns `memory` itself.
pub struct MemorySource {
    probe: Arc<dyn HostProbe>,
    reserved: u64,
    available: Quantity,
}

impl MemorySource {
    pub fn new(probe: Arc<dyn HostProbe>, reserved: u64) -> Self {
        Self {
            probe,
            reserved,
            available: Quantity::ZERO,
        }
    }
}

impl Source for MemorySource {
    fn name(&self) -> &'static str {
        SOURCE_MEMORY
    }

    fn init(&mut self) -> Result<BTreeSet<ResourceName>> {
        let total = self.probe.memory_total()?;
        if self.reserved > total {
            return Err(ResourceError::InvalidConfig(format!(
                "reserved memory ({} B) exceeds host total ({total} B)",
                self.reserved
            )));
        }

        self.available = Quantity::binary(total - self.reserved);
        debug!(total, reserved = self.reserved, "memory source initialized");
        Ok(BTreeSet::from([ResourceName::memory()]))
    }

    fn allocate(
        &mut self,
        _machine: &mut Machine,
        required: &ResourceList,
    ) -> Result<ResourceList> {
        let Some(requested) = required.get(ResourceName::MEMORY) else {
            return Ok(ResourceList::new());
        };

        self.available = self
            .available
            .checked_sub(requested)
            .ok_or_else(|| ResourceError::ResourceNotAvailable(ResourceName::memory()))?;

        Ok([(ResourceName::memory(), *requested)].into_iter().collect())
    }

    fn deallocate(&mut self, _machine: &mut Machine, released: &ResourceList) -> Vec<ResourceName> {
        let Some(requested) = released.get(ResourceName::MEMORY) else {
            return Vec::new();
        };

        self.available = self.available.saturating_add(requested);
        vec![ResourceName::memory()]
    }

    fn available(&self) -> ResourceList {
        [(ResourceName::memory(), self.available)]
            .into_iter()
            .collect()
    }

    fn calc_quantity(&self, _resource: &ResourceName, per_instance: &Quantity) -> Option<i64> {
        instances_that_fit(self.available.value(), per_instance)
    }
}
