//! PCI passthrough source: catalog-driven pools of concrete addresses.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, warn};
use vmlet_api::{Machine, PciAddress, PciDevice, Quantity, ResourceList, ResourceName};
use vmlet_host::HostProbe;

use crate::error::{ResourceError, Result};
use crate::sources::{instances_that_fit, Source};

pub const SOURCE_PCI: &str = "pci";

const ATTRIBUTE_VENDOR: &str = "vendor";
const ATTRIBUTE_CLASS: &str = "class";

/// The declarative catalog of passthrough-capable hardware.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceCatalog {
    pub vendors: Vec<CatalogVendor>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogVendor {
    /// Hex vendor ID as it appears in sysfs, e.g. `0x10de`.
    pub id: String,
    pub name: String,
    pub devices: Vec<CatalogDevice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogDevice {
    /// Hex class ID as it appears in sysfs, e.g. `0x030200`.
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl DeviceCatalog {
    /// Parses and validates a YAML catalog. IDs are lowercased so they
    /// compare cleanly against sysfs values.
    pub fn parse(data: &str) -> Result<Self> {
        let mut catalog: DeviceCatalog = serde_yaml::from_str(data)
            .map_err(|e| ResourceError::InvalidConfig(format!("PCI catalog: {e}")))?;

        let mut vendor_ids = BTreeSet::new();
        for vendor in &mut catalog.vendors {
            vendor.id = vendor.id.to_lowercase();
            validate_hex_id(&vendor.id)?;
            if !vendor_ids.insert(vendor.id.clone()) {
                return Err(ResourceError::InvalidConfig(format!(
                    "PCI catalog: duplicate vendor ID {}",
                    vendor.id
                )));
            }

            let mut device_ids = BTreeSet::new();
            let mut device_names = BTreeSet::new();
            for device in &mut vendor.devices {
                device.id = device.id.to_lowercase();
                validate_hex_id(&device.id)?;
                if !device_ids.insert(device.id.clone()) {
                    return Err(ResourceError::InvalidConfig(format!(
                        "PCI catalog: duplicate device ID {} under vendor {}",
                        device.id, vendor.name
                    )));
                }
                if !device_names.insert(device.name.clone()) {
                    return Err(ResourceError::InvalidConfig(format!(
                        "PCI catalog: duplicate device name {} under vendor {}",
                        device.name, vendor.name
                    )));
                }
            }
        }

        Ok(catalog)
    }
}

fn validate_hex_id(id: &str) -> Result<()> {
    let digits = id.strip_prefix("0x").unwrap_or(id);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ResourceError::InvalidConfig(format!(
            "PCI catalog: {id:?} is not a hex ID"
        )));
    }
    Ok(())
}

/// Offers concrete PCI addresses for passthrough. Every catalog-matched
/// device lands in a pool keyed by the derived resource name
/// `<type>.<vendor>/<device>`; allocation hands out specific addresses,
/// not just counts.
pub struct PciSource {
    probe: Arc<dyn HostProbe>,
    catalog_path: PathBuf,
    pools: BTreeMap<ResourceName, Vec<PciAddress>>,
}

impl PciSource {
    pub fn new(probe: Arc<dyn HostProbe>, catalog_path: impl Into<PathBuf>) -> Self {
        Self {
            probe,
            catalog_path: catalog_path.into(),
            pools: BTreeMap::new(),
        }
    }

    fn discover(&mut self, catalog: &DeviceCatalog) -> Result<()> {
        for dir in self.probe.pci_device_dirs()? {
            if let Err(err) = self.match_device(catalog, &dir) {
                debug!(device = %dir.display(), error = %err, "skipping PCI device");
            }
        }
        Ok(())
    }

    fn match_device(&mut self, catalog: &DeviceCatalog, dir: &Path) -> Result<()> {
        let vendor_id = self.probe.pci_attribute(dir, ATTRIBUTE_VENDOR)?;
        let Some(vendor) = catalog.vendors.iter().find(|v| v.id == vendor_id) else {
            return Err(ResourceError::InvalidConfig(format!(
                "vendor {vendor_id} not in catalog"
            )));
        };

        let class_id = self.probe.pci_attribute(dir, ATTRIBUTE_CLASS)?;
        let Some(device) = vendor.devices.iter().find(|d| d.id == class_id) else {
            return Err(ResourceError::InvalidConfig(format!(
                "class {class_id} not in catalog for vendor {}",
                vendor.name
            )));
        };

        let basename = dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let address: PciAddress = basename.parse().map_err(|_| {
            ResourceError::InvalidConfig(format!("bad PCI address {basename:?}"))
        })?;

        let resource =
            ResourceName::from(format!("{}.{}/{}", device.kind, vendor.name, device.name));
        self.pools.entry(resource).or_default().push(address);
        Ok(())
    }

    /// Picks `count` addresses out of `pool`, preferring addresses the
    /// machine already holds in its status so startup replay reclaims
    /// exactly the devices it had before the restart.
    fn pick_addresses(
        pool: &mut Vec<PciAddress>,
        count: u64,
        resource: &ResourceName,
        machine: &Machine,
    ) -> Vec<PciAddress> {
        let mut picked = Vec::with_capacity(count as usize);

        for device in &machine.status.pci_devices {
            if picked.len() as u64 == count {
                break;
            }
            if &device.name != resource {
                continue;
            }
            if let Some(pos) = pool.iter().position(|a| *a == device.address) {
                picked.push(pool.remove(pos));
            }
        }
        while (picked.len() as u64) < count {
            picked.push(pool.remove(0));
        }

        picked
    }
}

impl Source for PciSource {
    fn name(&self) -> &'static str {
        SOURCE_PCI
    }

    fn init(&mut self) -> Result<BTreeSet<ResourceName>> {
        let data = std::fs::read_to_string(&self.catalog_path).map_err(|e| {
            ResourceError::InvalidConfig(format!(
                "PCI catalog {}: {e}",
                self.catalog_path.display()
            ))
        })?;
        let catalog = DeviceCatalog::parse(&data)?;
        self.discover(&catalog)?;

        for (resource, pool) in &self.pools {
            debug!(resource = %resource, devices = pool.len(), "PCI pool ready");
        }
        Ok(self.pools.keys().cloned().collect())
    }

    /// Two-pass allocation: first verify every required pool holds enough
    /// addresses on a scratch copy, then commit. A shortfall leaves the
    /// pools and the machine status untouched.
    fn allocate(
        &mut self,
        machine: &mut Machine,
        required: &ResourceList,
    ) -> Result<ResourceList> {
        let mut scratch = self.pools.clone();
        let mut charged = ResourceList::new();
        let mut reserved = Vec::new();

        for (resource, quantity) in required {
            let Some(pool) = scratch.get_mut(resource) else {
                continue;
            };

            if (pool.len() as u64) < quantity.value() {
                return Err(ResourceError::ResourceNotAvailable(resource.clone()));
            }

            for address in Self::pick_addresses(pool, quantity.value(), resource, machine) {
                reserved.push(PciDevice {
                    name: resource.clone(),
                    address,
                });
            }
            charged.insert(resource.clone(), *quantity);
        }

        if !reserved.is_empty() {
            self.pools = scratch;
            machine.status.pci_devices = reserved;
        }

        Ok(charged)
    }

    fn deallocate(&mut self, machine: &mut Machine, _released: &ResourceList) -> Vec<ResourceName> {
        let mut deallocated = Vec::new();

        for device in machine.status.pci_devices.drain(..) {
            match self.pools.get_mut(&device.name) {
                Some(pool) => {
                    pool.push(device.address);
                    deallocated.push(device.name);
                }
                None => {
                    warn!(resource = %device.name, address = %device.address,
                        "released PCI device has no pool");
                }
            }
        }

        deallocated
    }

    fn available(&self) -> ResourceList {
        self.pools
            .iter()
            .map(|(resource, pool)| {
                (resource.clone(), Quantity::decimal(pool.len() as u64))
            })
            .collect()
    }

    fn calc_quantity(&self, resource: &ResourceName, per_instance: &Quantity) -> Option<i64> {
        match self.pools.get(resource) {
            Some(pool) => instances_that_fit(pool.len() as u64, per_instance),
            None => Some(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmlet_host::{FakePciDevice, FakeProbe};

    const CATALOG: &str = r#"
vendors:
  - id: "0x10DE"
    name: nvidia
    devices:
      - id: "0x030200"
        name: ga100gl
        type: gpu
      - id: "0x030000"
        name: t4
        type: gpu
"#;

    fn gpu_probe() -> FakeProbe {
        FakeProbe::default().with_pci_devices(vec![
            FakePciDevice::new("0000:3b:00.0", "0x10de", "0x030200"),
            FakePciDevice::new("0000:3b:00.1", "0x10de", "0x030200"),
            FakePciDevice::new("0000:65:00.0", "0x10de", "0x030000"),
            // Not in the catalog; must be skipped.
            FakePciDevice::new("0000:00:1f.0", "0x8086", "0x060100"),
        ])
    }

    fn catalog_file(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("pci-devices.yaml");
        std::fs::write(&path, CATALOG).unwrap();
        path
    }

    fn gpu_source(dir: &tempfile::TempDir) -> PciSource {
        let mut source = PciSource::new(Arc::new(gpu_probe()), catalog_file(dir));
        source.init().unwrap();
        source
    }

    #[test]
    fn test_catalog_rejects_duplicate_vendor_ids() {
        let data = r#"
vendors:
  - { id: "0x10de", name: nvidia, devices: [] }
  - { id: "0x10DE", name: nvidia2, devices: [] }
"#;
        assert!(matches!(
            DeviceCatalog::parse(data),
            Err(ResourceError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_catalog_rejects_duplicate_device_names() {
        let data = r#"
vendors:
  - id: "0x10de"
    name: nvidia
    devices:
      - { id: "0x030200", name: ga100gl, type: gpu }
      - { id: "0x030000", name: ga100gl, type: gpu }
"#;
        assert!(matches!(
            DeviceCatalog::parse(data),
            Err(ResourceError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_catalog_rejects_non_hex_ids() {
        let data = r#"
vendors:
  - { id: "nvidia", name: nvidia, devices: [] }
"#;
        assert!(matches!(
            DeviceCatalog::parse(data),
            Err(ResourceError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_init_builds_pools_from_sysfs() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = PciSource::new(Arc::new(gpu_probe()), catalog_file(&dir));
        let owned = source.init().unwrap();

        assert_eq!(
            owned,
            BTreeSet::from([
                ResourceName::from("gpu.nvidia/ga100gl"),
                ResourceName::from("gpu.nvidia/t4"),
            ])
        );
        let available = source.available();
        assert_eq!(available.get("gpu.nvidia/ga100gl").unwrap().value(), 2);
        assert_eq!(available.get("gpu.nvidia/t4").unwrap().value(), 1);
    }

    #[test]
    fn test_allocate_writes_concrete_addresses() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = gpu_source(&dir);
        let mut machine = Machine::default();

        let required: ResourceList =
            [(ResourceName::from("gpu.nvidia/ga100gl"), Quantity::decimal(2))]
                .into_iter()
                .collect();
        let charged = source.allocate(&mut machine, &required).unwrap();

        assert_eq!(charged.get("gpu.nvidia/ga100gl").unwrap().value(), 2);
        let addresses: Vec<String> = machine
            .status
            .pci_devices
            .iter()
            .map(|d| d.address.to_string())
            .collect();
        assert_eq!(addresses, ["0000:3b:00.0", "0000:3b:00.1"]);
        assert_eq!(source.available().get("gpu.nvidia/ga100gl").unwrap().value(), 0);
    }

    #[test]
    fn test_shortfall_rolls_back_both_pools() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = gpu_source(&dir);
        let mut machine = Machine::default();

        // ga100gl fits, t4 is one device short.
        let required: ResourceList = [
            (ResourceName::from("gpu.nvidia/ga100gl"), Quantity::decimal(1)),
            (ResourceName::from("gpu.nvidia/t4"), Quantity::decimal(2)),
        ]
        .into_iter()
        .collect();

        assert_eq!(
            source.allocate(&mut machine, &required),
            Err(ResourceError::ResourceNotAvailable(ResourceName::from(
                "gpu.nvidia/t4"
            )))
        );
        assert!(machine.status.pci_devices.is_empty());
        assert_eq!(source.available().get("gpu.nvidia/ga100gl").unwrap().value(), 2);
        assert_eq!(source.available().get("gpu.nvidia/t4").unwrap().value(), 1);
    }

    #[test]
    fn test_deallocate_returns_addresses_to_pool() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = gpu_source(&dir);
        let mut machine = Machine::default();

        let required: ResourceList =
            [(ResourceName::from("gpu.nvidia/t4"), Quantity::decimal(1))]
                .into_iter()
                .collect();
        let charged = source.allocate(&mut machine, &required).unwrap();
        assert_eq!(source.available().get("gpu.nvidia/t4").unwrap().value(), 0);

        let released = source.deallocate(&mut machine, &charged);
        assert_eq!(released, vec![ResourceName::from("gpu.nvidia/t4")]);
        assert!(machine.status.pci_devices.is_empty());
        assert_eq!(source.available().get("gpu.nvidia/t4").unwrap().value(), 1);
    }

    #[test]
    fn test_replay_reclaims_previously_held_addresses() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = gpu_source(&dir);

        // The machine held 0000:3b:00.1 before the restart.
        let mut machine = Machine::default();
        machine.status.pci_devices = vec![PciDevice {
            name: ResourceName::from("gpu.nvidia/ga100gl"),
            address: "0000:3b:00.1".parse().unwrap(),
        }];

        let required: ResourceList =
            [(ResourceName::from("gpu.nvidia/ga100gl"), Quantity::decimal(1))]
                .into_iter()
                .collect();
        source.allocate(&mut machine, &required).unwrap();

        assert_eq!(machine.status.pci_devices.len(), 1);
        assert_eq!(
            machine.status.pci_devices[0].address.to_string(),
            "0000:3b:00.1"
        );
        // The other card is still in the pool.
        let available = source.available();
        assert_eq!(available.get("gpu.nvidia/ga100gl").unwrap().value(), 1);
    }
}
