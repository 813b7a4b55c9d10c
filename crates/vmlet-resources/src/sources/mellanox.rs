//! Mellanox source: NIC budget derived from counting Mellanox PCI devices.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;
use vmlet_api::{Machine, Quantity, ResourceList, ResourceName};
use vmlet_host::HostProbe;

use crate::error::{ResourceError, Result};
use crate::sources::{instances_that_fit, Source};

pub const SOURCE_MELLANOX: &str = "mellanox";

const MELLANOX_VENDOR_ID: &str = "0x15b3";
const ATTRIBUTE_VENDOR: &str = "vendor";

/// Counts PCI devices carrying the Mellanox vendor ID and offers them as
/// the `nic` budget. Alternative to [`crate::sources::NicSource`]; both
/// own `nic`, so registering both is a startup conflict.
pub struct MellanoxSource {
    probe: Arc<dyn HostProbe>,
    reserved: u64,
    available: Quantity,
}

impl MellanoxSource {
    pub fn new(probe: Arc<dyn HostProbe>, reserved: u64) -> Self {
        Self {
            probe,
            reserved,
            available: Quantity::ZERO,
        }
    }
}

impl Source for MellanoxSource {
    fn name(&self) -> &'static str {
        SOURCE_MELLANOX
    }

    fn init(&mut self) -> Result<BTreeSet<ResourceName>> {
        let mut count = 0u64;
        for dir in self.probe.pci_device_dirs()? {
            match self.probe.pci_attribute(&dir, ATTRIBUTE_VENDOR) {
                Ok(vendor) if vendor == MELLANOX_VENDOR_ID => count += 1,
                Ok(_) => {}
                Err(err) => {
                    debug!(device = %dir.display(), error = %err, "skipping unreadable PCI device");
                }
            }
        }

        if self.reserved > count {
            return Err(ResourceError::InvalidConfig(format!(
                "reserved NICs ({}) exceed the {count} Mellanox devices found",
                self.reserved
            )));
        }

        self.available = Quantity::decimal(count - self.reserved);
        debug!(count, reserved = self.reserved, "mellanox source initialized");
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

#[cfg(test)]
mod tests {
    use super::*;
    use vmlet_host::{FakePciDevice, FakeProbe};

    fn probe_with_nics() -> FakeProbe {
        FakeProbe::default().with_pci_devices(vec![
            FakePciDevice::new("0000:3b:00.0", "0x15b3", "0x020000"),
            FakePciDevice::new("0000:3b:00.1", "0x15b3", "0x020000"),
            FakePciDevice::new("0000:65:00.0", "0x8086", "0x020000"),
        ])
    }

    #[test]
    fn test_counts_only_mellanox_devices() {
        let mut source = MellanoxSource::new(Arc::new(probe_with_nics()), 0);
        source.init().unwrap();
        assert_eq!(source.available().get("nic").unwrap().value(), 2);
    }

    #[test]
    fn test_reservation_is_subtracted() {
        let mut source = MellanoxSource::new(Arc::new(probe_with_nics()), 1);
        source.init().unwrap();
        assert_eq!(source.available().get("nic").unwrap().value(), 1);
    }

    #[test]
    fn test_reservation_above_count_fails() {
        let mut source = MellanoxSource::new(Arc::new(probe_with_nics()), 3);
        assert!(matches!(
            source.init(),
            Err(ResourceError::InvalidConfig(_))
        ));
    }
}
