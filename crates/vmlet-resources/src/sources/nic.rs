//! NIC-count source: a configured interface budget.

use std::collections::BTreeSet;

use vmlet_api::{Machine, Quantity, ResourceList, ResourceName};

use crate::error::{ResourceError, Result};
use crate::sources::{instances_that_fit, Source};

pub const SOURCE_NIC: &str = "nic";

/// Accounts network interfaces against a configured limit. Alternative to
/// [`crate::sources::MellanoxSource`]; both own `nic`, so registering both
/// is a startup conflict.
pub struct NicSource {
    limit: u64,
    reserved: u64,
    available: Quantity,
}

impl NicSource {
    pub fn new(limit: u64, reserved: u64) -> Self {
        Self {
            limit,
            reserved,
            available: Quantity::ZERO,
        }
    }
}

impl Source for NicSource {
    fn name(&self) -> &'static str {
        SOURCE_NIC
    }

    fn init(&mut self) -> Result<BTreeSet<ResourceName>> {
        if self.reserved > self.limit {
            return Err(ResourceError::InvalidConfig(format!(
                "reserved NICs ({}) exceed the NIC limit ({})",
                self.reserved, self.limit
            )));
        }

        self.available = Quantity::decimal(self.limit - self.reserved);
        Ok(BTreeSet::from([ResourceName::nic()]))
    }

    fn allocate(
        &mut self,
        _machine: &mut Machine,
        required: &ResourceList,
    ) -> Result<ResourceList> {
        let Some(requested) = required.get(ResourceName::NIC) else {
            return Ok(ResourceList::new());
        };

        self.available = self
            .available
            .checked_sub(requested)
            .ok_or_else(|| ResourceError::ResourceNotAvailable(ResourceName::nic()))?;

        Ok([(ResourceName::nic(), *requested)].into_iter().collect())
    }

    fn deallocate(&mut self, _machine: &mut Machine, released: &ResourceList) -> Vec<ResourceName> {
        let Some(requested) = released.get(ResourceName::NIC) else {
            return Vec::new();
        };

        self.available = self.available.saturating_add(requested);
        vec![ResourceName::nic()]
    }

    fn available(&self) -> ResourceList {
        [(ResourceName::nic(), self.available)].into_iter().collect()
    }

    fn calc_quantity(&self, _resource: &ResourceName, per_instance: &Quantity) -> Option<i64> {
        instances_that_fit(self.available.value(), per_instance)
    }
}
