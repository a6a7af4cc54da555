//! Asynchronous file access behind interchangeable back-ends.
//!
//! Callers submit read/write requests against the local filesystem, continue
//! doing other work, and later wait on, cancel, or reap the results. Two
//! back-ends implement the same request-lifecycle contract:
//!
//! - **AIO**: a thin driver over POSIX asynchronous IO. The kernel executes
//!   the transfer and a thread-dispatched completion callback advances the
//!   request state.
//! - **MMAP**: asynchrony realised in user space. A fixed pool of worker
//!   threads drains a task queue; each task performs mmap-based data movement
//!   and msync commits.
//!
//! # Example
//!
//! ```no_run
//! use async_file_accessor::{get_instance, AccessorKind, Direction, RequestInfo};
//!
//! let accessor = get_instance(AccessorKind::Mmap);
//! let request = accessor.get_request(RequestInfo {
//!     direction: Direction::Write,
//!     path: "./sample.bin".into(),
//!     size: 1024,
//!     offset: 0,
//! })?;
//!
//! let mut buf = accessor.alloc_write_buf(&request)?;
//! buf.as_mut_slice().fill(b'a');
//! accessor.put_request(&request)?;
//! accessor.wait_request(&request, 0)?;
//! accessor.release_all()?;
//! # Ok::<(), async_file_accessor::AccessorError>(())
//! ```

pub mod accessor;
pub mod error;
pub mod pool;
pub mod request;

// Re-export the API surface.
pub use accessor::{get_instance, AccessorKind, FileAccessor};
pub use error::AccessorError;
pub use request::{Direction, Request, RequestInfo, RequestStatus, WriteBuf};

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, AccessorError>;
