//! Resource names and resource lists.

use std::borrow::Borrow;
use std::collections::btree_map;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::quantity::Quantity;

/// Opaque name of a host resource (`cpu`, `memory`, `hugepages`, `nic`,
/// or a derived name such as `gpu.nvidia/ga100gl.rev.a1`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceName(String);

impl ResourceName {
    pub const CPU: &'static str = "cpu";
    pub const MEMORY: &'static str = "memory";
    pub const HUGEPAGES: &'static str = "hugepages";
    pub const NIC: &'static str = "nic";

    pub fn cpu() -> Self {
        Self(Self::CPU.to_string())
    }

    pub fn memory() -> Self {
        Self(Self::MEMORY.to_string())
    }

    pub fn hugepages() -> Self {
        Self(Self::HUGEPAGES.to_string())
    }

    pub fn nic() -> Self {
        Self(Self::NIC.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ResourceName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ResourceName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Borrow<str> for ResourceName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Mapping from resource name to quantity. Keys are unique; iteration
/// order is the lexical order of the names, which keeps serialised
/// records and log lines deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceList(BTreeMap<ResourceName, Quantity>);

impl ResourceList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: ResourceName, quantity: Quantity) -> Option<Quantity> {
        self.0.insert(name, quantity)
    }

    pub fn get(&self, name: &str) -> Option<&Quantity> {
        self.0.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Quantity> {
        self.0.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, ResourceName, Quantity> {
        self.0.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &ResourceName> {
        self.0.keys()
    }

    /// Merges `other` into `self`, adding quantities for keys present in
    /// both lists.
    pub fn merge(&mut self, other: &ResourceList) {
        for (name, quantity) in other.iter() {
            match self.0.get_mut(name) {
                Some(existing) => *existing = existing.saturating_add(quantity),
                None => {
                    self.0.insert(name.clone(), *quantity);
                }
            }
        }
    }
}

impl FromIterator<(ResourceName, Quantity)> for ResourceList {
    fn from_iter<I: IntoIterator<Item = (ResourceName, Quantity)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a ResourceList {
    type Item = (&'a ResourceName, &'a Quantity);
    type IntoIter = btree_map::Iter<'a, ResourceName, Quantity>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl fmt::Display for ResourceList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, quantity) in &self.0 {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{name}={quantity}")?;
            first = false;
        }
        Ok(())
    }
}
