//! Source configuration, cross-validation and construction.

use std::path::PathBuf;
use std::sync::Arc;

use vmlet_host::HostProbe;

use crate::error::{ResourceError, Result};
use crate::sources::{
    CpuSource, HugepagesSource, MellanoxSource, MemorySource, NicSource, PciSource, Source,
    SOURCE_CPU, SOURCE_HUGEPAGES, SOURCE_MELLANOX, SOURCE_MEMORY, SOURCE_NIC, SOURCE_PCI,
};

/// Operator-supplied knobs shared by all sources.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// CPU over-commit factor; 1.0 means no over-commit.
    pub overcommit_vcpu: f64,
    /// Memory withheld from guests, in bytes.
    pub reserved_memory: u64,
    /// Hugepages withheld from guests.
    pub blocked_hugepages: u64,
    /// Total NIC budget of the host.
    pub nic_limit: u64,
    /// NICs withheld from guests.
    pub reserved_nics: u64,
    /// Path to the PCI passthrough catalog.
    pub pci_catalog: Option<PathBuf>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            overcommit_vcpu: 1.0,
            reserved_memory: 0,
            blocked_hugepages: 0,
            nic_limit: 0,
            reserved_nics: 0,
            pci_catalog: None,
        }
    }
}

/// Source names enabled when the operator does not choose any.
pub fn default_source_names() -> Vec<String> {
    vec![SOURCE_CPU.to_string(), SOURCE_MEMORY.to_string()]
}

/// Checks that every knob in `config` belongs to a source that is actually
/// enabled, so a typo in the source list fails loudly instead of silently
/// dropping a reservation.
pub fn validate_config(enabled: &[String], config: &SourceConfig) -> Result<()> {
    // Guard against rounding artifacts around zero.
    if config.overcommit_vcpu < 1e-9 {
        return Err(ResourceError::InvalidConfig(
            "CPU over-commit factor must be positive".to_string(),
        ));
    }

    let has = |name: &str| enabled.iter().any(|s| s == name);

    if config.reserved_memory != 0 && !has(SOURCE_MEMORY) {
        return Err(ResourceError::InvalidConfig(format!(
            "reserved memory requires the {SOURCE_MEMORY} source"
        )));
    }
    if config.blocked_hugepages != 0 && !has(SOURCE_HUGEPAGES) {
        return Err(ResourceError::InvalidConfig(format!(
            "blocked hugepages require the {SOURCE_HUGEPAGES} source"
        )));
    }
    if config.nic_limit != 0 && !has(SOURCE_NIC) {
        return Err(ResourceError::InvalidConfig(format!(
            "a NIC limit requires the {SOURCE_NIC} source"
        )));
    }
    if has(SOURCE_NIC) && config.nic_limit == 0 {
        return Err(ResourceError::InvalidConfig(format!(
            "the {SOURCE_NIC} source requires a NIC limit"
        )));
    }
    if config.reserved_nics != 0 && !has(SOURCE_NIC) && !has(SOURCE_MELLANOX) {
        return Err(ResourceError::InvalidConfig(format!(
            "reserved NICs require the {SOURCE_NIC} or {SOURCE_MELLANOX} source"
        )));
    }
    if config.pci_catalog.is_some() && !has(SOURCE_PCI) {
        return Err(ResourceError::InvalidConfig(format!(
            "a PCI catalog requires the {SOURCE_PCI} source"
        )));
    }
    if has(SOURCE_PCI) && config.pci_catalog.is_none() {
        return Err(ResourceError::InvalidConfig(format!(
            "the {SOURCE_PCI} source requires a PCI catalog"
        )));
    }

    Ok(())
}

/// Builds one source by name.
pub fn build_source(
    name: &str,
    config: &SourceConfig,
    probe: Arc<dyn HostProbe>,
) -> Result<Box<dyn Source>> {
    match name {
        SOURCE_CPU => Ok(Box::new(CpuSource::new(probe, config.overcommit_vcpu))),
        SOURCE_MEMORY => Ok(Box::new(MemorySource::new(probe, config.reserved_memory))),
        SOURCE_HUGEPAGES => Ok(Box::new(HugepagesSource::new(
            probe,
            config.blocked_hugepages,
        ))),
        SOURCE_NIC => Ok(Box::new(NicSource::new(
            config.nic_limit,
            config.reserved_nics,
        ))),
        SOURCE_MELLANOX => Ok(Box::new(MellanoxSource::new(probe, config.reserved_nics))),
        SOURCE_PCI => {
            let catalog = config.pci_catalog.clone().ok_or_else(|| {
                ResourceError::InvalidConfig(format!(
                    "the {SOURCE_PCI} source requires a PCI catalog"
                ))
            })?;
            Ok(Box::new(PciSource::new(probe, catalog)))
        }
        other => Err(ResourceError::InvalidConfig(format!(
            "unsupported source {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmlet_host::FakeProbe;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_default_config_passes_with_default_sources() {
        validate_config(&default_source_names(), &SourceConfig::default()).unwrap();
    }

    #[test]
    fn test_zero_overcommit_rejected() {
        let config = SourceConfig {
            overcommit_vcpu: 0.0,
            ..SourceConfig::default()
        };
        assert!(validate_config(&default_source_names(), &config).is_err());
    }

    #[test]
    fn test_reserved_memory_needs_memory_source() {
        let config = SourceConfig {
            reserved_memory: 1024,
            ..SourceConfig::default()
        };
        assert!(validate_config(&names(&["cpu"]), &config).is_err());
        assert!(validate_config(&names(&["cpu", "memory"]), &config).is_ok());
    }

    #[test]
    fn test_nic_source_needs_limit() {
        let config = SourceConfig::default();
        assert!(validate_config(&names(&["cpu", "memory", "nic"]), &config).is_err());

        let config = SourceConfig {
            nic_limit: 4,
            ..SourceConfig::default()
        };
        assert!(validate_config(&names(&["cpu", "memory", "nic"]), &config).is_ok());
    }

    #[test]
    fn test_pci_source_needs_catalog() {
        let config = SourceConfig::default();
        assert!(validate_config(&names(&["cpu", "memory", "pci"]), &config).is_err());
        assert!(build_source(SOURCE_PCI, &config, Arc::new(FakeProbe::default())).is_err());
    }

    #[test]
    fn test_build_unknown_source_fails() {
        let config = SourceConfig::default();
        assert!(build_source("warp-drive", &config, Arc::new(FakeProbe::default())).is_err());
    }

    #[test]
    fn test_builds_every_known_source() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = dir.path().join("pci.yaml");
        std::fs::write(&catalog, "vendors: []\n").unwrap();

        let config = SourceConfig {
            nic_limit: 4,
            pci_catalog: Some(catalog),
            ..SourceConfig::default()
        };
        for name in [
            SOURCE_CPU,
            SOURCE_MEMORY,
            SOURCE_HUGEPAGES,
            SOURCE_NIC,
            SOURCE_MELLANOX,
            SOURCE_PCI,
        ] {
            let source = build_source(name, &config, Arc::new(FakeProbe::default())).unwrap();
            assert_eq!(source.name(), name);
        }
    }
}
