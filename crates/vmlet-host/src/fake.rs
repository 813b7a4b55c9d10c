//! Test double returning fixed hardware numbers.

use std::path::{Path, PathBuf};

use crate::error::{HostError, Result};
use crate::probe::HostProbe;

/// One fake PCI device: its sysfs address and scalar attributes.
#[derive(Debug, Clone)]
pub struct FakePciDevice {
    pub address: String,
    pub vendor: String,
    pub class: String,
}

impl FakePciDevice {
    pub fn new(
        address: impl Into<String>,
        vendor: impl Into<String>,
        class: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            vendor: vendor.into(),
            class: class.into(),
        }
    }
}

/// Probe returning fixed numbers, for tests.
#[derive(Debug, Clone)]
pub struct FakeProbe {
    pub cpu_cores: u64,
    pub memory_total: u64,
    pub hugepage_size: u64,
    pub hugepages_total: u64,
    pub hugepages_free: u64,
    pub pci_devices: Vec<FakePciDevice>,
}

impl Default for FakeProbe {
    fn default() -> Self {
        Self {
            cpu_cores: 8,
            memory_total: 16 << 30,
            hugepage_size: 2 << 20,
            hugepages_total: 1024,
            hugepages_free: 1024,
            pci_devices: Vec::new(),
        }
    }
}

impl FakeProbe {
    pub fn with_pci_devices(mut self, devices: Vec<FakePciDevice>) -> Self {
        self.pci_devices = devices;
        self
    }

    fn device(&self, dir: &Path) -> Result<&FakePciDevice> {
        let name = dir.file_name().map(|n| n.to_string_lossy().to_string());
        self.pci_devices
            .iter()
            .find(|d| Some(&d.address) == name.as_ref())
            .ok_or_else(|| HostError::Missing {
                what: "pci device",
                path: dir.to_path_buf(),
            })
    }
}

impl HostProbe for FakeProbe {
    fn cpu_cores(&self) -> Result<u64> {
        Ok(self.cpu_cores)
    }

    fn memory_total(&self) -> Result<u64> {
        Ok(self.memory_total)
    }

    fn hugepage_size(&self) -> Result<u64> {
        Ok(self.hugepage_size)
    }

    fn hugepages_total(&self) -> Result<u64> {
        Ok(self.hugepages_total)
    }

    fn hugepages_free(&self) -> Result<u64> {
        Ok(self.hugepages_free)
    }

    fn pci_device_dirs(&self) -> Result<Vec<PathBuf>> {
        let mut dirs: Vec<PathBuf> = self
            .pci_devices
            .iter()
            .map(|d| PathBuf::from(&d.address))
            .collect();
        dirs.sort();
        Ok(dirs)
    }

    fn pci_attribute(&self, device_dir: &Path, attribute: &str) -> Result<String> {
        let device = self.device(device_dir)?;
        let value = match attribute {
            "vendor" => &device.vendor,
            "class" => &device.class,
            _ => {
                return Err(HostError::Missing {
                    what: "pci attribute",
                    path: device_dir.join(attribute),
                })
            }
        };
        Ok(value.trim().to_lowercase())
    }
}
