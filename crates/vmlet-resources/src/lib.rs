//! # vmlet-resources
//!
//! Host resource accounting and admission control.
//!
//! A set of [`Source`]s each own the bookkeeping for one physical concern
//! (CPU, memory, hugepages, NICs, PCI passthrough devices). The
//! [`ResourceManager`] orchestrates them: it maps declarative machine
//! classes onto the registered resources, answers how many instances of a
//! class still fit on the host, and atomically reserves or releases the
//! resources backing a concrete VM.

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

pub mod class;
pub mod config;
mod error;
pub mod manager;
pub mod sources;

pub use class::{load_classes, load_classes_file, MachineClass};
pub use config::{build_source, validate_config, SourceConfig};
pub use error::{ResourceError, Result};
pub use manager::{MachineClassStatus, MachineLister, ResourceManager};
pub use sources::Source;
