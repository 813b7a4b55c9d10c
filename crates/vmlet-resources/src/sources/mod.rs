//! Resource sources: one per physical concern of the host.

use std::collections::BTreeSet;

use vmlet_api::{Machine, Quantity, ResourceList, ResourceName};

use crate::error::Result;

mod cpu;
mod dummy;
mod hugepages;
mod mellanox;
mod memory;
mod nic;
mod pci;

pub use cpu::{CpuSource, SOURCE_CPU};
pub use dummy::{DummySource, RESOURCE_DUMMY, SOURCE_DUMMY};
pub use hugepages::{HugepagesSource, SOURCE_HUGEPAGES};
pub use mellanox::{MellanoxSource, SOURCE_MELLANOX};
pub use memory::{MemorySource, SOURCE_MEMORY};
pub use nic::{NicSource, SOURCE_NIC};
pub use pci::{CatalogDevice, CatalogVendor, DeviceCatalog, PciSource, SOURCE_PCI};

/// A provider that owns the accounting for one or more named host
/// resources.
///
/// The manager serialises every call under its lock, so implementations
/// never see concurrent access and keep plain mutable state.
pub trait Source: Send {
    /// Unique source name.
    fn name(&self) -> &'static str;

    /// Probes the host and returns the set of resource names this source
    /// owns from now on.
    fn init(&mut self) -> Result<BTreeSet<ResourceName>>;

    /// Class-time transformation of a machine class's capabilities. May
    /// round existing entries and insert derived ones.
    fn modify_class(&self, _capabilities: &mut ResourceList) -> Result<()> {
        Ok(())
    }

    /// Charges the resources this source owns out of `required` against
    /// the machine. Returns exactly what was charged so the manager can
    /// roll it back; an empty list means nothing in `required` concerned
    /// this source. All-or-nothing: on error no state was mutated.
    fn allocate(&mut self, machine: &mut Machine, required: &ResourceList)
        -> Result<ResourceList>;

    /// Returns charged resources to the pool. Best-effort: returns the
    /// names actually released.
    fn deallocate(&mut self, machine: &mut Machine, released: &ResourceList)
        -> Vec<ResourceName>;

    /// Snapshot of what is currently available.
    fn available(&self) -> ResourceList;

    /// How many instances needing `per_instance` of `resource` still fit,
    /// as far as this source is concerned. `None` means the source does
    /// not cap the count.
    fn calc_quantity(&self, resource: &ResourceName, per_instance: &Quantity) -> Option<i64>;
}

/// Floor division of an availability by a per-instance requirement.
/// A zero requirement does not cap the class count.
pub(crate) fn instances_that_fit(available: u64, per_instance: &Quantity) -> Option<i64> {
    if per_instance.is_zero() {
        return None;
    }
    Some(i64::try_from(available / per_instance.value()).unwrap_or(i64::MAX))
}
