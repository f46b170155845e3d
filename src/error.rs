use thiserror::Error;

/// Errors reported by the synchronization primitives and the runtime.
///
/// Every public operation returns a status instead of panicking; callers
/// that intercept platform threading calls can map these onto `errno`
/// values without losing information.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum Error {
    /// A primitive handle carries a foreign tag or was never initialized.
    #[error("primitive handle is not a valid treesync primitive")]
    InvalidHandle,

    /// The primitive was destroyed or an inconsistent state was observed.
    #[error("primitive used after destroy or in an inconsistent state")]
    InvalidState,

    /// A condition variable was used with two different mutexes.
    #[error("condition variable is already bound to a different mutex")]
    MutexMismatch,

    /// An allocation or thread-spawn request failed.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// The operation is declared but intentionally unimplemented.
    #[error("operation not implemented")]
    NotImplemented,

    /// The kernel wait queue returned a result the protocol cannot
    /// account for, e.g. a wake count above the requested maximum.
    #[error("unexpected result from the wait facility: {0}")]
    KernelFault(i64),

    /// None of the topology sources produced a usable machine shape.
    #[error("topology discovery failed: {0}")]
    Topology(String),
}

/// Crate-wide result alias.
pub type Result<T, E = Error> = core::result::Result<T, E>;
