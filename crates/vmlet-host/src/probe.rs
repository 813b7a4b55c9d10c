//! The host probe trait and its `/proc` + `/sys` implementation.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{HostError, Result};

/// Scalar sysfs attribute files hold at most 15 bytes of hex text plus a
/// newline; anything larger is not the file we think it is.
const MAX_ATTRIBUTE_LEN: usize = 16;

/// Read access to the host hardware inventory.
///
/// The production implementation is [`SysProbe`]; tests use
/// [`crate::FakeProbe`] with fixed numbers.
pub trait HostProbe: Send + Sync {
    /// Number of physical CPU cores.
    fn cpu_cores(&self) -> Result<u64>;

    /// Total main memory in bytes.
    fn memory_total(&self) -> Result<u64>;

    /// Size of one hugepage in bytes.
    fn hugepage_size(&self) -> Result<u64>;

    /// Total number of hugepages configured on the host.
    fn hugepages_total(&self) -> Result<u64>;

    /// Number of hugepages currently free.
    fn hugepages_free(&self) -> Result<u64>;

    /// Directories of all PCI devices, one per device, sorted by address.
    fn pci_device_dirs(&self) -> Result<Vec<PathBuf>>;

    /// A scalar attribute (`vendor`, `class`, ...) of one PCI device,
    /// trimmed and lowercased.
    fn pci_attribute(&self, device_dir: &Path, attribute: &str) -> Result<String>;
}

/// Probe backed by the real `/proc` and `/sys` trees.
///
/// The filesystem root is injectable so tests can point the probe at a
/// fixture tree under a tempdir.
pub struct SysProbe {
    root: PathBuf,
}

impl Default for SysProbe {
    fn default() -> Self {
        Self::new("/")
    }
}

impl SysProbe {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn meminfo_path(&self) -> PathBuf {
        self.root.join("proc/meminfo")
    }

    fn cpu_possible_path(&self) -> PathBuf {
        self.root.join("sys/devices/system/cpu/possible")
    }

    fn pci_devices_path(&self) -> PathBuf {
        self.root.join("sys/bus/pci/devices")
    }

    /// Reads one field of `/proc/meminfo`, returning the value in bytes.
    /// Fields suffixed `kB` are scaled; bare counts are returned as-is.
    fn meminfo_field(&self, field: &'static str) -> Result<u64> {
        let path = self.meminfo_path();
        let content = fs::read_to_string(&path).map_err(|e| HostError::io(&path, e))?;

        for line in content.lines() {
            let Some(rest) = line.strip_prefix(field) else {
                continue;
            };
            let Some(rest) = rest.strip_prefix(':') else {
                continue;
            };
            let mut parts = rest.split_whitespace();
            let value: u64 = parts
                .next()
                .ok_or_else(|| HostError::parse(field, &path, "empty value"))?
                .parse()
                .map_err(|e| HostError::parse(field, &path, format!("{e}")))?;
            return match parts.next() {
                Some("kB") => Ok(value * 1024),
                Some(unit) => Err(HostError::parse(field, &path, format!("unknown unit {unit}"))),
                None => Ok(value),
            };
        }

        Err(HostError::Missing { what: field, path })
    }
}

impl HostProbe for SysProbe {
    fn cpu_cores(&self) -> Result<u64> {
        let path = self.cpu_possible_path();
        let content = fs::read_to_string(&path).map_err(|e| HostError::io(&path, e))?;
        parse_cpu_ranges(content.trim())
            .ok_or_else(|| HostError::parse("cpu ranges", &path, content.trim().to_string()))
    }

    fn memory_total(&self) -> Result<u64> {
        self.meminfo_field("MemTotal")
    }

    fn hugepage_size(&self) -> Result<u64> {
        self.meminfo_field("Hugepagesize")
    }

    fn hugepages_total(&self) -> Result<u64> {
        self.meminfo_field("HugePages_Total")
    }

    fn hugepages_free(&self) -> Result<u64> {
        self.meminfo_field("HugePages_Free")
    }

    fn pci_device_dirs(&self) -> Result<Vec<PathBuf>> {
        let path = self.pci_devices_path();
        let entries = fs::read_dir(&path).map_err(|e| HostError::io(&path, e))?;

        let mut dirs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| HostError::io(&path, e))?;
            dirs.push(entry.path());
        }
        // Deterministic order so PCI address pools come out stable across
        // restarts.
        dirs.sort();
        debug!(count = dirs.len(), "enumerated PCI devices");
        Ok(dirs)
    }

    fn pci_attribute(&self, device_dir: &Path, attribute: &str) -> Result<String> {
        let path = device_dir.join(attribute);
        let raw = fs::read(&path).map_err(|e| HostError::io(&path, e))?;
        if raw.len() >= MAX_ATTRIBUTE_LEN {
            return Err(HostError::AttributeTooLarge(path));
        }
        let text = String::from_utf8_lossy(&raw);
        Ok(text.trim().to_lowercase())
    }
}

/// Parses `/sys/devices/system/cpu/possible` content such as `0-7` or
/// `0,2-3` into a core count.
fn parse_cpu_ranges(s: &str) -> Option<u64> {
    let mut count = 0u64;
    for part in s.split(',') {
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: u64 = lo.trim().parse().ok()?;
                let hi: u64 = hi.trim().parse().ok()?;
                if hi < lo {
                    return None;
                }
                count += hi - lo + 1;
            }
            None => {
                let _: u64 = part.trim().parse().ok()?;
                count += 1;
            }
        }
    }
    if count == 0 {
        None
    } else {
        Some(count)
    }
}
