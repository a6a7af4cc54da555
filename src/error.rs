//! Error taxonomy for the accessor boundary.
//!
//! Every accessor operation returns a status drawn from this closed set.
//! Workers never propagate errors across the boundary; they deposit a
//! terminal status into the request and signal its completion condition.

use thiserror::Error;

/// Errors surfaced by accessor operations.
#[derive(Debug, Error)]
pub enum AccessorError {
    /// Invalid descriptor, zero-size or null buffer, unusable path, or a
    /// mapping/allocation failure that survived the retry bound.
    #[error("bad value: {0}")]
    BadValue(String),

    /// Operation against a request in the wrong state, or a submission to a
    /// back-end whose pool is not running.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Growth of the task queue or the request registry failed.
    #[error("no memory: {0}")]
    NoMemory(String),

    /// Sentinel/non-sentinel admission mismatch while the pool is closing.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A wait exceeded its deadline.
    #[error("timed out after {0} ms")]
    TimedOut(u64),

    /// Unclassified failure from a kernel primitive.
    #[error("unknown I/O failure: {0}")]
    Unknown(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = AccessorError::BadValue("zero-size request".into());
        assert!(err.to_string().contains("zero-size request"));

        let err = AccessorError::TimedOut(25);
        assert!(err.to_string().contains("25 ms"));
    }

    #[test]
    fn io_errors_convert_to_unknown() {
        let io = std::io::Error::from_raw_os_error(libc::EIO);
        let err: AccessorError = io.into();
        assert!(matches!(err, AccessorError::Unknown(_)));
    }
}
