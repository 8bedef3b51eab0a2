//! Error surface for the shared map, per the control-block protocol's
//! failure modes (attach/create, lock, framing, parameter mismatch).

use std::io;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not attach shared memory segment '{name}': {source}")]
    CannotAttach { name: String, source: io::Error },

    #[error("shared_lock=true was requested but the atomic lock primitive is unavailable: {0}")]
    MissingDependency(String),

    #[error("{field}={requested} was set but the creator used {field}={actual}")]
    ParameterMismatch {
        field: &'static str,
        requested: bool,
        actual: bool,
    },

    #[error("failed to acquire lock after {spins} spins")]
    CannotAcquireLock { spins: u32 },

    #[error("our lock for pid {our_pid} was stolen by pid {other_pid}")]
    LockStolen { our_pid: u32, other_pid: u32 },

    #[error("full dump too large: needed {needed} bytes, fixed dump segment has {available}")]
    DumpTooLarge { needed: usize, available: usize },

    #[error("stream corruption at position {position}: {reason}")]
    Corruption { position: u32, reason: String },

    #[error("map handle already closed, only `snapshot()` remains available")]
    AlreadyClosed,

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("serializer error: {0}")]
    Serialization(String),
}
