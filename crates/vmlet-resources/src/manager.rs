//! The resource manager: admission control over a set of sources.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use vmlet_api::{Machine, MachineSpec, Quantity, ResourceList, ResourceName};

use crate::class::{load_classes_file, MachineClass};
use crate::error::{ResourceError, Result};
use crate::sources::Source;

/// Callback producing the persisted machines replayed during startup.
pub type MachineLister<'a> = Box<
    dyn FnOnce() -> std::result::Result<Vec<Machine>, Box<dyn std::error::Error + Send + Sync>>
        + 'a,
>;

/// A machine class together with how many instances of it currently fit
/// on the host.
#[derive(Debug, Clone, PartialEq)]
pub struct MachineClassStatus {
    pub class: MachineClass,
    pub available: i64,
}

struct ClassEntry {
    class: MachineClass,
    available: i64,
}

#[derive(Default)]
struct ManagerState {
    /// Sources by name, ordered so conflict detection is deterministic.
    sources: BTreeMap<String, Box<dyn Source>>,
    /// Resource name to the name of the source that owns it.
    registered: BTreeMap<ResourceName, String>,
    classes: Vec<ClassEntry>,
    staged_classes: Vec<MachineClass>,
    classes_file: Option<PathBuf>,
    vm_limit: u64,
    available_vm_slots: i64,
    initialized: bool,
    /// Invariant errors latch here and poison every later operation.
    operation_error: Option<ResourceError>,
    cancel: Option<CancellationToken>,
}

/// Serialises every admission decision for one host under a single lock.
///
/// Construct it once at startup, register sources and classes, then call
/// [`ResourceManager::initialize`] exactly once. Afterwards
/// [`ResourceManager::allocate`] and [`ResourceManager::deallocate`] are
/// the only ways host accounting changes.
#[derive(Default)]
pub struct ResourceManager {
    state: Mutex<ManagerState>,
}

impl ResourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ManagerState>> {
        self.state.lock().map_err(|_| ResourceError::LockPoisoned)
    }

    /// Registers a source. Only valid before initialisation.
    pub fn add_source(&self, source: Box<dyn Source>) -> Result<()> {
        let mut state = self.lock()?;
        if state.initialized {
            return Err(ResourceError::ManagerAlreadyInitialized);
        }
        let name = source.name().to_string();
        if state.sources.contains_key(&name) {
            return Err(ResourceError::InvalidConfig(format!(
                "source {name} registered twice"
            )));
        }
        state.sources.insert(name, source);
        Ok(())
    }

    /// Sets the maximum number of live machines. Zero disables the limit.
    pub fn set_vm_limit(&self, limit: u64) -> Result<()> {
        let mut state = self.lock()?;
        if state.initialized {
            return Err(ResourceError::ManagerAlreadyInitialized);
        }
        state.vm_limit = limit;
        Ok(())
    }

    /// Points the manager at a machine-class file, read at initialisation.
    pub fn set_machine_classes_file(&self, path: impl Into<PathBuf>) -> Result<()> {
        let mut state = self.lock()?;
        if state.initialized {
            return Err(ResourceError::ManagerAlreadyInitialized);
        }
        state.classes_file = Some(path.into());
        Ok(())
    }

    /// Stages an already-parsed class catalog, mostly for tests; a
    /// configured file overrides it.
    pub fn set_machine_classes(&self, classes: Vec<MachineClass>) -> Result<()> {
        let mut state = self.lock()?;
        if state.initialized {
            return Err(ResourceError::ManagerAlreadyInitialized);
        }
        state.staged_classes = classes;
        Ok(())
    }

    /// One-shot startup: probes every source, builds the resource
    /// registry, validates the class catalog, replays the persisted
    /// machines against the sources and computes per-class availability.
    ///
    /// A replay failure means the host no longer holds what its records
    /// claim — an operator problem, so startup aborts rather than
    /// admitting anything.
    pub fn initialize(
        &self,
        cancel: CancellationToken,
        list_machines: Option<MachineLister<'_>>,
    ) -> Result<()> {
        let mut state = self.lock()?;
        if state.initialized {
            return Err(ResourceError::ManagerAlreadyInitialized);
        }
        if state.sources.is_empty() {
            return Err(ResourceError::ManagerSourcesMissing);
        }
        let Some(list_machines) = list_machines else {
            return Err(ResourceError::ManagerListFuncInvalid);
        };

        state.cancel = Some(cancel);
        state.init_sources()?;
        state.init_machine_classes()?;

        let mut machines =
            list_machines().map_err(|e| ResourceError::ListMachines(e.to_string()))?;
        state.available_vm_slots = state.vm_limit as i64 - machines.len() as i64;

        for machine in &mut machines {
            if !machine.has_allocated_resources() {
                continue;
            }
            let required = machine.spec.allocated.clone();
            state.charge_sources(machine, &required)?;
            debug!(machine = %machine.metadata.id, resources = %required,
                "replayed persisted allocation");
        }

        state.recompute_class_availability()?;
        state.operation_error = None;
        state.initialized = true;
        Ok(())
    }

    /// Reserves `required` for `machine`. All-or-nothing: either every
    /// source accepts its share and the union is merged into
    /// `machine.spec.allocated`, or nothing changes.
    pub fn allocate(&self, machine: &mut Machine, required: &ResourceList) -> Result<()> {
        let mut state = self.lock()?;
        state.check_operational()?;

        if state.vm_limit > 0 && state.available_vm_slots <= 0 {
            return Err(ResourceError::VmLimitReached);
        }

        let charged = state.charge_sources(machine, required)?;
        for (_, list) in &charged {
            machine.spec.allocated.merge(list);
        }

        state.available_vm_slots -= 1;
        state.recompute_sticky()?;
        Ok(())
    }

    /// Releases `to_release` from `machine`. Best-effort: a source that
    /// fails to take resources back is logged, not surfaced, because
    /// refusing the release would leak the resources forever.
    pub fn deallocate(&self, machine: &mut Machine, to_release: &ResourceList) -> Result<()> {
        let mut state = self.lock()?;
        state.check_operational()?;

        let mut released = Vec::new();
        for source in state.sources.values_mut() {
            released.extend(source.deallocate(machine, to_release));
        }
        for name in &released {
            machine.spec.allocated.remove(name.as_str());
        }

        let unreleased: Vec<_> = to_release
            .names()
            .filter(|&n| !released.contains(n))
            .collect();
        if !unreleased.is_empty() {
            warn!(machine = %machine.metadata.id, resources = ?unreleased,
                "no source released these resources");
        }

        state.available_vm_slots += 1;
        state.recompute_sticky()?;
        Ok(())
    }

    /// Per-class availability, in catalog order.
    pub fn machine_class_status(&self) -> Result<Vec<MachineClassStatus>> {
        let state = self.lock()?;
        Ok(state
            .classes
            .iter()
            .map(|entry| MachineClassStatus {
                class: entry.class.clone(),
                available: entry.available,
            })
            .collect())
    }

    /// Derives the full resource list a machine of this spec needs: the
    /// class capabilities plus one `nic` per requested interface.
    pub fn get_required_resources(&self, spec: &MachineSpec) -> Result<ResourceList> {
        let state = self.lock()?;
        let entry = state
            .classes
            .iter()
            .find(|entry| entry.class.name == spec.class_name)
            .ok_or_else(|| ResourceError::MachineClassMissing(spec.class_name.clone()))?;

        let mut required = entry.class.capabilities.clone();
        if !spec.network_interfaces.is_empty() {
            required.insert(
                ResourceName::nic(),
                Quantity::decimal(spec.network_interfaces.len() as u64),
            );
        }
        Ok(required)
    }

    /// Merged availability snapshot across all sources.
    pub fn available_resources(&self) -> Result<ResourceList> {
        let state = self.lock()?;
        let mut merged = ResourceList::new();
        for source in state.sources.values() {
            for (name, quantity) in &source.available() {
                merged.insert(name.clone(), *quantity);
            }
        }
        Ok(merged)
    }
}

impl ManagerState {
    /// Sticky-error and cancellation gate run by every runtime operation.
    fn check_operational(&mut self) -> Result<()> {
        if let Some(err) = &self.operation_error {
            return Err(err.clone());
        }
        if let Some(cancel) = &self.cancel {
            if cancel.is_cancelled() {
                self.operation_error = Some(ResourceError::Cancelled);
                return Err(ResourceError::Cancelled);
            }
        }
        Ok(())
    }

    /// Initialises every source and indexes the resources it claims.
    fn init_sources(&mut self) -> Result<()> {
        // Rebuilt from scratch so a failed initialize can be retried.
        self.registered.clear();

        let mut claims = Vec::new();
        for (name, source) in &mut self.sources {
            let owned = source.init()?;
            debug!(source = %name, resources = ?owned, "source initialized");
            for resource in owned {
                claims.push((resource, name.clone()));
            }
        }

        for (resource, source_name) in claims {
            if let Some(first) = self.registered.get(&resource) {
                return Err(ResourceError::CommonResources {
                    resource,
                    first: first.clone(),
                    second: source_name,
                });
            }
            self.registered.insert(resource, source_name);
        }
        Ok(())
    }

    /// Loads, validates and transforms the class catalog against the
    /// registered resources.
    fn init_machine_classes(&mut self) -> Result<()> {
        let staged = match &self.classes_file {
            Some(path) => load_classes_file(path)?,
            None => self.staged_classes.clone(),
        };

        self.classes.clear();
        'classes: for mut class in staged {
            for base in [ResourceName::cpu(), ResourceName::memory()] {
                if !class.capabilities.contains(base.as_str()) {
                    return Err(ResourceError::ResourceMissing(base));
                }
            }

            // A class mix is host-specific; classes referring to hardware
            // this host does not have are simply not offered.
            for resource in class.capabilities.names() {
                if !self.registered.contains_key(resource) {
                    warn!(class = %class.name, resource = %resource,
                        "dropping machine class with unsupported resource");
                    continue 'classes;
                }
            }

            for source in self.sources.values() {
                source.modify_class(&mut class.capabilities)?;
            }

            self.classes.push(ClassEntry {
                class,
                available: 0,
            });
        }
        Ok(())
    }

    /// Charges `required` against the owning sources, all-or-nothing.
    /// Returns what each source was charged so callers can merge it into
    /// the machine spec.
    fn charge_sources(
        &mut self,
        machine: &mut Machine,
        required: &ResourceList,
    ) -> Result<Vec<(String, ResourceList)>> {
        // Each source is called once with the full request even if it
        // owns several of the keys.
        let mut source_names: Vec<String> = Vec::new();
        for resource in required.names() {
            let Some(source_name) = self.registered.get(resource) else {
                return Err(ResourceError::ResourceUnsupported(resource.clone()));
            };
            if !source_names.contains(source_name) {
                source_names.push(source_name.clone());
            }
        }

        let mut charged: Vec<(String, ResourceList)> = Vec::new();
        for source_name in source_names {
            let Some(source) = self.sources.get_mut(&source_name) else {
                self.rollback(machine, &charged);
                return Err(ResourceError::ManagerSourcesMissing);
            };
            match source.allocate(machine, required) {
                Ok(list) => {
                    if !list.is_empty() {
                        charged.push((source_name, list));
                    }
                }
                Err(err) => {
                    self.rollback(machine, &charged);
                    return Err(err);
                }
            }
        }
        Ok(charged)
    }

    /// Returns already-charged resources after a partial failure.
    fn rollback(&mut self, machine: &mut Machine, charged: &[(String, ResourceList)]) {
        for (source_name, list) in charged {
            let Some(source) = self.sources.get_mut(source_name) else {
                continue;
            };
            let released = source.deallocate(machine, list);
            if released.is_empty() {
                warn!(source = %source_name, resources = %list,
                    "rollback released nothing");
            }
        }
    }

    /// Recompute wrapper for runtime paths: a failure here means the
    /// catalog and the live sources disagree, which latches the manager.
    fn recompute_sticky(&mut self) -> Result<()> {
        if let Err(err) = self.recompute_class_availability() {
            self.operation_error = Some(err.clone());
            return Err(err);
        }
        Ok(())
    }

    fn recompute_class_availability(&mut self) -> Result<()> {
        let mut counts = Vec::with_capacity(self.classes.len());
        for entry in &self.classes {
            let mut count: Option<i64> = None;
            for (resource, per_instance) in &entry.class.capabilities {
                let source = self
                    .registered
                    .get(resource)
                    .and_then(|name| self.sources.get(name))
                    .ok_or(ResourceError::ManagerSourcesMissing)?;
                if let Some(fits) = source.calc_quantity(resource, per_instance) {
                    count = Some(count.map_or(fits, |c| c.min(fits)));
                }
            }

            let mut count = count.unwrap_or(i64::MAX);
            if self.vm_limit > 0 {
                count = count.min(self.available_vm_slots);
            }
            counts.push(count.max(0));
        }

        for (entry, count) in self.classes.iter_mut().zip(counts) {
            entry.available = count;
        }
        Ok(())
    }
}
