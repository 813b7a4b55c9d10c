//! # vmlet-api
//!
//! Shared domain types for vmlet: the persisted machine record, resource
//! names and quantities, and the object contract the durable store relies
//! on. Every other vmlet crate depends on this one.

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

pub mod machine;
pub mod object;
pub mod quantity;
pub mod resources;

pub use machine::{
    Machine, MachineMetadata, MachineSpec, MachineState, MachineStatus, NetworkInterface,
    PciAddress, PciDevice,
};
pub use object::{MissingObjectId, ObjectMeta, StoreObject};
pub use quantity::{Format, Quantity};
pub use resources::{ResourceList, ResourceName};
