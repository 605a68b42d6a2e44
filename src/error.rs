use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the lifecycle engine.
///
/// Variants carry structured fields so that callers can react to the kind of
/// failure instead of matching on message text.
#[derive(Debug, Error)]
pub enum Error {
    /// A VM failed to reach the running state.
    #[error("instance failed to start: {name}: {reason}")]
    StartFailure { name: String, reason: String },

    /// The requested feature is unsupported by the QEMU backend.
    #[error("feature not implemented on this backend")]
    NotImplementedOnThisBackend,

    /// A memory or disk size string did not parse.
    #[error("{value:?} is not a valid memory size")]
    InvalidMemorySize { value: String },

    /// A settings value violated the contract for its key.
    #[error("invalid setting {key}={value:?}: {reason}")]
    InvalidSetting {
        key: String,
        value: String,
        reason: String,
    },

    /// An instance-settings operation hit an instance in the wrong state,
    /// or an unknown, deleted, or still-preparing instance.
    #[error("{operation}; instance: {instance}; reason: {reason}")]
    InstanceSettings {
        operation: String,
        instance: String,
        reason: String,
    },

    /// An explicit deadline expired.
    #[error("timed out {operation}")]
    Timeout { operation: String },

    /// File or process I/O failure not classified above.
    #[error("i/o failure on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The QMP channel to a supervised process broke down.
    #[error("qmp channel failure: {0}")]
    QmpChannel(String),
}

/// Convenient alias for results returned by this crate.
pub type Result<T> = std::result::Result<T, Error>;
