//! Error types for resource accounting.

use thiserror::Error;
use vmlet_api::ResourceName;

/// Result type alias for resource operations.
pub type Result<T> = std::result::Result<T, ResourceError>;

/// Errors surfaced by the resource manager and its sources.
///
/// Variants are stable identifiers: callers match on them rather than on
/// message text. The enum is `Clone` because the manager latches invariant
/// errors and replays them to every later caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceError {
    /// `initialize` was called a second time, or a setup method was called
    /// after initialisation.
    #[error("resource manager is already initialized")]
    ManagerAlreadyInitialized,

    /// No sources were registered before `initialize`.
    #[error("no resource sources are registered")]
    ManagerSourcesMissing,

    /// `initialize` was called without a machine-list callback.
    #[error("machine list callback is missing")]
    ManagerListFuncInvalid,

    /// Two sources claimed ownership of the same resource name.
    #[error("sources {first} and {second} both register resource {resource}")]
    CommonResources {
        resource: ResourceName,
        first: String,
        second: String,
    },

    /// A required resource is not registered by any source.
    #[error("resource {0} is not supported by any source")]
    ResourceUnsupported(ResourceName),

    /// A source does not hold enough of the resource.
    #[error("resource {0} is not available")]
    ResourceNotAvailable(ResourceName),

    /// A required companion resource is absent from the request.
    #[error("required resource {0} is missing")]
    ResourceMissing(ResourceName),

    /// The requested machine class is not in the catalog.
    #[error("machine class {0} not found")]
    MachineClassMissing(String),

    /// The host already runs the configured maximum number of VMs.
    #[error("VM limit reached")]
    VmLimitReached,

    /// The manager's context was cancelled; latched until restart.
    #[error("operation cancelled")]
    Cancelled,

    /// Two machine classes in the catalog share a name.
    #[error("multiple machine classes named {0}")]
    DuplicateClass(String),

    /// A class capability value a source cannot work with.
    #[error("invalid capability {resource}: {detail}")]
    InvalidCapability {
        resource: ResourceName,
        detail: String,
    },

    /// Invalid source or manager configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The host probe failed.
    #[error("host probe failure: {0}")]
    Probe(String),

    /// The machine-class catalog could not be read or parsed.
    #[error("machine class catalog: {0}")]
    ClassFile(String),

    /// The machine-list callback failed during startup replay.
    #[error("listing persisted machines: {0}")]
    ListMachines(String),

    /// The manager mutex was poisoned by a panicking thread.
    #[error("resource manager lock poisoned")]
    LockPoisoned,
}

impl From<vmlet_host::HostError> for ResourceError {
    fn from(err: vmlet_host::HostError) -> Self {
        Self::Probe(err.to_string())
    }
}
