//! In-memory source with an adjustable budget, used by the manager test
//! suite and by anything that needs a predictable source.

use std::collections::BTreeSet;

use vmlet_api::{Machine, Quantity, ResourceList, ResourceName};

use crate::error::{ResourceError, Result};
use crate::sources::Source;

pub const SOURCE_DUMMY: &str = "dummy";
pub const RESOURCE_DUMMY: &str = "dummy";

/// Test source. Owns `dummy` plus the base resources so machine classes
/// validate against it, and lets tests steer the class count directly,
/// including into the ignore sentinel and below zero.
pub struct DummySource {
    available: i64,
    class_count_ignored: bool,
}

impl DummySource {
    pub fn new(available: i64) -> Self {
        Self {
            available,
            class_count_ignored: false,
        }
    }

    /// Overrides the remaining budget.
    pub fn set_quantity(&mut self, quantity: i64) {
        self.available = quantity;
    }

    /// Makes `calc_quantity` report the ignore sentinel.
    pub fn set_class_count_ignored(&mut self, ignored: bool) {
        self.class_count_ignored = ignored;
    }
}

impl Source for DummySource {
    fn name(&self) -> &'static str {
        SOURCE_DUMMY
    }

    fn init(&mut self) -> Result<BTreeSet<ResourceName>> {
        Ok(BTreeSet::from([
            ResourceName::from(RESOURCE_DUMMY),
            ResourceName::cpu(),
            ResourceName::memory(),
        ]))
    }

    fn modify_class(&self, capabilities: &mut ResourceList) -> Result<()> {
        // A class asking for the dummy resource directly exercises the
        // manager's modify-failure path.
        if capabilities.contains(RESOURCE_DUMMY) {
            return Err(ResourceError::InvalidCapability {
                resource: ResourceName::from(RESOURCE_DUMMY),
                detail: "dummy resource cannot appear in a class".to_string(),
            });
        }
        Ok(())
    }

    fn allocate(
        &mut self,
        _machine: &mut Machine,
        required: &ResourceList,
    ) -> Result<ResourceList> {
        let Some(requested) = required.get(RESOURCE_DUMMY) else {
            return Ok(ResourceList::new());
        };

        let remaining = self.available - requested.value() as i64;
        if remaining < 0 {
            return Err(ResourceError::ResourceNotAvailable(ResourceName::from(
                RESOURCE_DUMMY,
            )));
        }

        self.available = remaining;
        Ok([(ResourceName::from(RESOURCE_DUMMY), *requested)]
            .into_iter()
            .collect())
    }

    fn deallocate(&mut self, _machine: &mut Machine, released: &ResourceList) -> Vec<ResourceName> {
        let Some(requested) = released.get(RESOURCE_DUMMY) else {
            return Vec::new();
        };

        self.available += requested.value() as i64;
        vec![ResourceName::from(RESOURCE_DUMMY)]
    }

    fn available(&self) -> ResourceList {
        [(
            ResourceName::from(RESOURCE_DUMMY),
            Quantity::decimal(self.available.max(0) as u64),
        )]
        .into_iter()
        .collect()
    }

    fn calc_quantity(&self, _resource: &ResourceName, _per_instance: &Quantity) -> Option<i64> {
        if self.class_count_ignored {
            None
        } else {
            Some(self.available)
        }
    }
}
