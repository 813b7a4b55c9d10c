//! # vmlet-store
//!
//! Durable map from object ID to a typed, JSON-encoded record. One file
//! per object, crash-safe writes via write-and-rename, optimistic
//! concurrency via resource versions, finalizer-gated deletion and a
//! best-effort watch bus.

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

mod error;
mod lock;
mod store;

pub use error::{Result, StoreError};
pub use store::{Store, StoreOptions, Watch, WatchEvent, WatchEventType};
