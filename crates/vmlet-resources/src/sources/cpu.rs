//! CPU source: physical cores with over-commit, accounted in millicpu.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;
use vmlet_api::{Machine, Quantity, ResourceList, ResourceName};
use vmlet_host::HostProbe;

use crate::error::{ResourceError, Result};
use crate::sources::{instances_that_fit, Source};

pub const SOURCE_CPU: &str = "cpu";

/// Accounts CPU time in thousandths of a core. Capacity is the physical
/// core count scaled by the over-commit factor.
pub struct CpuSource {
    probe: Arc<dyn HostProbe>,
    overcommit: f64,
    available: Quantity,
}

impl CpuSource {
    pub fn new(probe: Arc<dyn HostProbe>, overcommit: f64) -> Self {
        Self {
            probe,
            overcommit,
            available: Quantity::ZERO,
        }
    }
}

impl Source for CpuSource {
    fn name(&self) -> &'static str {
        SOURCE_CPU
    }

    fn init(&mut self) -> Result<BTreeSet<ResourceName>> {
        // Guard against rounding artifacts around zero.
        if self.overcommit < 1e-9 {
            return Err(ResourceError::InvalidConfig(
                "CPU over-commit factor must be positive".to_string(),
            ));
        }

        let cores = self.probe.cpu_cores()?;
        let millis = ((cores * 1000) as f64 * self.overcommit).floor() as u64;
        self.available = Quantity::decimal(millis);

        debug!(cores, overcommit = self.overcommit, millicpu = millis, "CPU source initialized");
        Ok(BTreeSet::from([ResourceName::cpu()]))
    }

    fn allocate(
        &mut self,
        _machine: &mut Machine,
        required: &ResourceList,
    ) -> Result<ResourceList> {
        let Some(requested) = required.get(ResourceName::CPU) else {
            return Ok(ResourceList::new());
        };

        self.available = self
            .available
            .checked_sub(requested)
            .ok_or_else(|| ResourceError::ResourceNotAvailable(ResourceName::cpu()))?;

        Ok([(ResourceName::cpu(), *requested)].into_iter().collect())
    }

    fn deallocate(&mut self, _machine: &mut Machine, released: &ResourceList) -> Vec<ResourceName> {
        let Some(requested) = released.get(ResourceName::CPU) else {
            return Vec::new();
        };

        self.available = self.available.saturating_add(requested);
        vec![ResourceName::cpu()]
    }

    fn available(&self) -> ResourceList {
        [(ResourceName::cpu(), self.available)].into_iter().collect()
    }

    fn calc_quantity(&self, _resource: &ResourceName, per_instance: &Quantity) -> Option<i64> {
        instances_that_fit(self.available.value(), per_instance)
    }
}
