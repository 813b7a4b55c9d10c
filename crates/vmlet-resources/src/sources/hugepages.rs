//! Hugepages source: owns both `memory` and the derived `hugepages` count.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;
use vmlet_api::{Machine, Quantity, ResourceList, ResourceName};
use vmlet_host::HostProbe;

use crate::error::{ResourceError, Result};
use crate::sources::{instances_that_fit, Source};

pub const SOURCE_HUGEPAGES: &str = "hugepages";

/// Backs guest memory with hugepages. When this source is active it owns
/// `memory` outright, so the plain memory source must not be registered
/// alongside it; the manager detects that as a resource conflict.
pub struct HugepagesSource {
    probe: Arc<dyn HostProbe>,
    blocked: u64,
    page_size: u64,
    available_memory: Quantity,
    available_pages: Quantity,
}

impl HugepagesSource {
    pub fn new(probe: Arc<dyn HostProbe>, blocked: u64) -> Self {
        Self {
            probe,
            blocked,
            page_size: 0,
            available_memory: Quantity::ZERO,
            available_pages: Quantity::ZERO,
        }
    }
}

impl Source for HugepagesSource {
    fn name(&self) -> &'static str {
        SOURCE_HUGEPAGES
    }

    fn init(&mut self) -> Result<BTreeSet<ResourceName>> {
        self.page_size = self.probe.hugepage_size()?;
        if self.page_size == 0 {
            return Err(ResourceError::Probe(
                "host reports a hugepage size of zero".to_string(),
            ));
        }

        let total = self.probe.hugepages_total()?;
        if self.blocked > total {
            return Err(ResourceError::InvalidConfig(format!(
                "blocked hugepages ({}) exceed host total ({total})",
                self.blocked
            )));
        }

        let pages = total - self.blocked;
        self.available_pages = Quantity::decimal(pages);
        self.available_memory = Quantity::binary(pages * self.page_size);

        debug!(
            page_size = self.page_size,
            pages, "hugepages source initialized"
        );
        Ok(BTreeSet::from([
            ResourceName::memory(),
            ResourceName::hugepages(),
        ]))
    }

    /// Rounds the class's `memory` up to a whole number of pages and
    /// records the page count as a derived `hugepages` capability.
    /// Idempotent once memory is page-aligned.
    fn modify_class(&self, capabilities: &mut ResourceList) -> Result<()> {
        let Some(memory) = capabilities.get(ResourceName::MEMORY) else {
            return Err(ResourceError::ResourceMissing(ResourceName::memory()));
        };
        if memory.is_zero() {
            return Err(ResourceError::InvalidCapability {
                resource: ResourceName::memory(),
                detail: "memory must be non-zero".to_string(),
            });
        }

        let pages = memory.value().div_ceil(self.page_size);
        capabilities.insert(ResourceName::hugepages(), Quantity::decimal(pages));
        capabilities.insert(
            ResourceName::memory(),
            Quantity::binary(pages * self.page_size),
        );
        Ok(())
    }

    fn allocate(
        &mut self,
        _machine: &mut Machine,
        required: &ResourceList,
    ) -> Result<ResourceList> {
        let Some(memory) = required.get(ResourceName::MEMORY) else {
            return Ok(ResourceList::new());
        };
        let memory = *memory;

        // Memory without a page count means the class skipped
        // modify_class; refusing here keeps the two ledgers in sync.
        let Some(pages) = required.get(ResourceName::HUGEPAGES) else {
            return Err(ResourceError::ResourceMissing(ResourceName::hugepages()));
        };
        let pages = *pages;

        let new_memory = self
            .available_memory
            .checked_sub(&memory)
            .ok_or_else(|| ResourceError::ResourceNotAvailable(ResourceName::memory()))?;
        let new_pages = self
            .available_pages
            .checked_sub(&pages)
            .ok_or_else(|| ResourceError::ResourceNotAvailable(ResourceName::hugepages()))?;

        self.available_memory = new_memory;
        self.available_pages = new_pages;

        Ok([
            (ResourceName::memory(), memory),
            (ResourceName::hugepages(), pages),
        ]
        .into_iter()
        .collect())
    }

    fn deallocate(&mut self, _machine: &mut Machine, released: &ResourceList) -> Vec<ResourceName> {
        let mut deallocated = Vec::new();

        if let Some(memory) = released.get(ResourceName::MEMORY) {
            self.available_memory = self.available_memory.saturating_add(memory);
            deallocated.push(ResourceName::memory());
        }
        if let Some(pages) = released.get(ResourceName::HUGEPAGES) {
            self.available_pages = self.available_pages.saturating_add(pages);
            deallocated.push(ResourceName::hugepages());
        }

        deallocated
    }

    fn available(&self) -> ResourceList {
        [
            (ResourceName::memory(), self.available_memory),
            (ResourceName::hugepages(), self.available_pages),
        ]
        .into_iter()
        .collect()
    }

    fn calc_quantity(&self, resource: &ResourceName, per_instance: &Quantity) -> Option<i64> {
        match resource.as_str() {
            ResourceName::MEMORY => {
                instances_that_fit(self.available_memory.value(), per_instance)
            }
            ResourceName::HUGEPAGES => {
                instances_that_fit(self.available_pages.value(), per_instance)
            }
            _ => None,
        }
    }
}
