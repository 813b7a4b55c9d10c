//! The persisted machine record.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::object::StoreObject;
use crate::resources::{ResourceList, ResourceName};

/// Machine lifecycle state as reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineState {
    /// Machine record exists but resources are not yet reserved.
    #[default]
    Pending,
    /// Resources reserved and domain running.
    Running,
    /// Soft-deleted, waiting for finalizers.
    Terminating,
    /// Domain gone, record about to disappear.
    Terminated,
}

/// Object metadata shared by every persisted record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineMetadata {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    #[serde(default)]
    pub resource_version: u64,
}

/// Desired state of a machine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineSpec {
    /// Name of the machine class this VM was admitted under.
    pub class_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub network_interfaces: Vec<NetworkInterface>,
    /// Resources currently charged against the host for this machine.
    #[serde(default, skip_serializing_if = "ResourceList::is_empty")]
    pub allocated: ResourceList,
}

/// Observed state of a machine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineStatus {
    #[serde(default)]
    pub state: MachineState,
    /// Concrete PCI devices reserved for this machine.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pci_devices: Vec<PciDevice>,
}

/// A network interface attached to the machine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub name: String,
}

/// A PCI device reserved for a machine: the derived resource name it was
/// requested under, plus its concrete host address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PciDevice {
    pub name: ResourceName,
    pub address: PciAddress,
}

/// A PCI address in `domain:bus:slot.function` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PciAddress {
    pub domain: u16,
    pub bus: u8,
    pub slot: u8,
    pub function: u8,
}

/// Error parsing a sysfs PCI address.
#[derive(Debug, Error)]
#[error("invalid PCI address {0:?}")]
pub struct ParsePciAddressError(String);

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.slot, self.function
        )
    }
}

impl FromStr for PciAddress {
    type Err = ParsePciAddressError;

    /// Parses the sysfs directory form, e.g. `0000:3b:00.1`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParsePciAddressError(s.to_string());

        let (domain, rest) = s.split_once(':').ok_or_else(err)?;
        let (bus, rest) = rest.split_once(':').ok_or_else(err)?;
        let (slot, function) = rest.split_once('.').ok_or_else(err)?;

        if domain.len() != 4 || bus.len() != 2 || slot.len() != 2 || function.len() != 1 {
            return Err(err());
        }

        Ok(PciAddress {
            domain: u16::from_str_radix(domain, 16).map_err(|_| err())?,
            bus: u8::from_str_radix(bus, 16).map_err(|_| err())?,
            slot: u8::from_str_radix(slot, 16).map_err(|_| err())?,
            function: u8::from_str_radix(function, 16).map_err(|_| err())?,
        })
    }
}

/// The persisted machine record. One JSON file per machine in the store
/// directory; every mutation goes through the store's update path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    pub metadata: MachineMetadata,
    pub spec: MachineSpec,
    #[serde(default)]
    pub status: MachineStatus,
}

impl Machine {
    pub fn new(id: impl Into<String>, class_name: impl Into<String>) -> Self {
        Self {
            metadata: MachineMetadata {
                id: id.into(),
                ..MachineMetadata::default()
            },
            spec: MachineSpec {
                class_name: class_name.into(),
                ..MachineSpec::default()
            },
            status: MachineStatus::default(),
        }
    }

    /// Whether any host resources are currently charged to this machine.
    pub fn has_allocated_resources(&self) -> bool {
        !self.spec.allocated.is_empty()
    }

    /// Adds a finalizer if not already present.
    pub fn add_finalizer(&mut self, finalizer: impl Into<String>) {
        let finalizer = finalizer.into();
        if !self.metadata.finalizers.contains(&finalizer) {
            self.metadata.finalizers.push(finalizer);
        }
    }

    /// Removes a finalizer. Returns whether it was present.
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let before = self.metadata.finalizers.len();
        self.metadata.finalizers.retain(|f| f != finalizer);
        self.metadata.finalizers.len() != before
    }
}

impl StoreObject for Machine {
    fn id(&self) -> &str {
        &self.metadata.id
    }

    fn created_at(&self) -> Option<DateTime<Utc>> {
        self.metadata.created_at
    }

    fn set_created_at(&mut self, at: DateTime<Utc>) {
        self.metadata.created_at = Some(at);
    }

    fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.metadata.deleted_at
    }

    fn set_deleted_at(&mut self, at: DateTime<Utc>) {
        self.metadata.deleted_at = Some(at);
    }

    fn finalizers(&self) -> &[String] {
        &self.metadata.finalizers
    }

    fn resource_version(&self) -> u64 {
        self.metadata.resource_version
    }

    fn set_resource_version(&mut self, version: u64) {
        self.metadata.resource_version = version;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantity::Quantity;

    #[test]
    fn test_pci_address_roundtrip() {
        let addr: PciAddress = "0000:3b:00.1".parse().unwrap();
        assert_eq!(addr.domain, 0);
        assert_eq!(addr.bus, 0x3b);
        assert_eq!(addr.slot, 0);
        assert_eq!(addr.function, 1);
        assert_eq!(addr.to_string(), "0000:3b:00.1");
    }

    #[test]
    fn test_pci_address_rejects_garbage() {
        assert!("3b:00.1".parse::<PciAddress>().is_err());
        assert!("0000:3b:00".parse::<PciAddress>().is_err());
        assert!("zzzz:3b:00.1".parse::<PciAddress>().is_err());
    }

    #[test]
    fn test_machine_record_json_roundtrip() {
        let mut machine = Machine::new("m-1", "t3-small");
        machine
            .spec
            .allocated
            .insert(ResourceName::cpu(), Quantity::decimal(2000));
        machine.add_finalizer("vmlet.io/domain");

        let json = serde_json::to_string(&machine).unwrap();
        let back: Machine = serde_json::from_str(&json).unwrap();
        assert_eq!(back, machine);
        // Canonical form is stable across a second round trip.
        assert_eq!(serde_json::to_string(&back).unwrap(), json);
    }

    #[test]
    fn test_finalizer_helpers() {
        let mut machine = Machine::new("m-1", "t3-small");
        machine.add_finalizer("a");
        machine.add_finalizer("a");
        assert_eq!(machine.finalizers().len(), 1);
        assert!(machine.remove_finalizer("a"));
        assert!(!machine.remove_finalizer("a"));
    }
}
