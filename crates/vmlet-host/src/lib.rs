//! # vmlet-host
//!
//! Thin adapter over the host's `/proc` and `/sys` trees: CPU core count,
//! memory and hugepage totals, and the PCI device tree. The resource
//! sources consume this through the [`HostProbe`] trait so tests can swap
//! in fixed numbers.

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

mod error;
mod fake;
mod probe;

pub use error::{HostError, Result};
pub use fake::{FakePciDevice, FakeProbe};
pub use probe::{HostProbe, SysProbe};
