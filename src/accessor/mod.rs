//! Accessor contract and back-end dispatch.
//!
//! The [`FileAccessor`] trait is the capability set every back-end exposes;
//! callers obtain a request, bind a buffer, submit, then wait on, cancel, or
//! reap the result. Both back-ends present the same externally visible state
//! machine; they differ only in who performs the transfer (the kernel's AIO
//! facility, or the MMAP back-end's worker pool).
//!
//! [`get_instance`] dispatches to one lazily initialised, process-wide
//! singleton per back-end kind. Accessors are also directly constructible
//! for callers that want a private instance.

pub mod aio;
pub mod mmap;

use crate::pool::queue::QUEUE_CHUNK;
use crate::request::{Request, RequestInfo, WriteBuf};
use crate::Result;
use crate::error::AccessorError;
use log::{debug, warn};
use std::sync::{Arc, Mutex, OnceLock};

pub use aio::AioAccessor;
pub use mmap::MmapAccessor;

/// Back-end selector for [`get_instance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessorKind {
    /// Kernel asynchronous IO (POSIX aio).
    Aio,
    /// Memory-mapped IO served by a worker-thread pool.
    Mmap,
}

impl std::fmt::Display for AccessorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessorKind::Aio => write!(f, "aio"),
            AccessorKind::Mmap => write!(f, "mmap"),
        }
    }
}

/// The capability set every back-end implements.
///
/// # Lifecycle
///
/// 1. `get_request` validates a descriptor and opens the target file.
/// 2. `alloc_write_buf` (writes) or `import_read_buf` (reads) binds the
///    data buffer.
/// 3. `put_request` hands the request to the back-end; the status moves to
///    `Submitted`.
/// 4. `wait_request` / `wait_all` block until completion; `cancel_request` /
///    `cancel_all` flip in-flight requests to `Cancelled`.
/// 5. `release_all` reclaims every registered request and, for MMAP, drains
///    the worker pool. The accessor stays usable afterwards.
///
/// # Thread safety
///
/// Accessors may be called from any thread; per-request transitions are
/// serialised by the request's own lock.
pub trait FileAccessor: Send + Sync {
    /// The back-end tag of this accessor.
    fn kind(&self) -> AccessorKind;

    /// Validate a descriptor and create a request in `Init`.
    ///
    /// The target opens read-only for reads, and read+write/create/truncate
    /// for writes, with a bounded retry on transient failure. The request is
    /// registered with the accessor so `release_all` can reclaim it.
    ///
    /// # Errors
    ///
    /// `BadValue` on a zero size, an over-long path, or a path that does not
    /// open with the required access mode; `NoMemory` if registry growth
    /// fails.
    fn get_request(&self, info: RequestInfo) -> Result<Arc<Request>>;

    /// Reserve the write source buffer for a write request and expose it to
    /// the caller. The request owns the storage (heap for AIO, a shared
    /// file mapping for MMAP) and releases it on terminal transition.
    ///
    /// # Errors
    ///
    /// `BadValue` on a read request or a mapping failure that survived the
    /// retry bound; `InvalidOperation` if a buffer is already bound.
    fn alloc_write_buf(&self, request: &Arc<Request>) -> Result<WriteBuf>;

    /// Record the caller's destination buffer for a read request. Ownership
    /// stays with the caller.
    ///
    /// # Safety contract
    ///
    /// `buf` must point to at least `info.size` writable bytes and remain
    /// valid until the request reaches a terminal status.
    ///
    /// # Errors
    ///
    /// `BadValue` on a write request or a null pointer; `InvalidOperation`
    /// if a buffer is already bound.
    fn import_read_buf(&self, request: &Arc<Request>, buf: *mut u8) -> Result<()>;

    /// Submit the request: `Init` to `Submitted`. On a failed submission any
    /// accessor-owned buffer is released and the request is `Cancelled`.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` on a non-`Init` request or a pool that is not
    /// running; `NoMemory` on queue growth failure; `Unknown` when the
    /// kernel refuses the enqueue.
    fn put_request(&self, request: &Arc<Request>) -> Result<()>;

    /// Block until the request leaves `Submitted` or the timeout elapses.
    /// `timeout_ms == 0` waits indefinitely. The MMAP back-end promotes an
    /// expired request to `Cancelled`; the AIO back-end surfaces `TimedOut`.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` if the request is not in `Submitted`.
    fn wait_request(&self, request: &Arc<Request>, timeout_ms: u64) -> Result<()>;

    /// Cancel an in-flight request: flip the status to `Cancelled` and
    /// signal the completion condition. Cancelling a finished request is a
    /// warning, not an error; repeated cancels are idempotent.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` on a request that was never submitted.
    fn cancel_request(&self, request: &Arc<Request>) -> Result<()>;

    /// Block until every registered request has left `Submitted`. An empty
    /// registry succeeds trivially. Returns the bitwise OR of the terminal
    /// status bits, for observability only.
    fn wait_all(&self, timeout_ms: u64) -> Result<u32>;

    /// Flip every still-`Submitted` registered request to `Cancelled`.
    fn cancel_all(&self) -> Result<()>;

    /// Drive shutdown: drain the worker pool (MMAP), close every kernel
    /// handle, free every owned buffer, and clear the registry. The accessor
    /// re-initialises lazily on the next `get_request`.
    fn release_all(&self) -> Result<()>;
}

/// Process-wide singleton accessor of the requested kind.
pub fn get_instance(kind: AccessorKind) -> &'static dyn FileAccessor {
    static AIO: OnceLock<AioAccessor> = OnceLock::new();
    static MMAP: OnceLock<MmapAccessor> = OnceLock::new();

    match kind {
        AccessorKind::Aio => AIO.get_or_init(AioAccessor::new),
        AccessorKind::Mmap => MMAP.get_or_init(MmapAccessor::new),
    }
}

/// Live requests owned by one accessor. Written by request creation and
/// `release_all`; completion contexts only read through their own `Arc`.
pub(crate) struct Registry {
    list: Mutex<Vec<Arc<Request>>>,
}

impl Registry {
    pub(crate) fn new() -> Registry {
        Registry {
            list: Mutex::new(Vec::new()),
        }
    }

    /// Append a request; the backing vector grows in the same fixed chunks
    /// as the task queue.
    pub(crate) fn register(&self, request: Arc<Request>) -> Result<()> {
        let mut list = self.list.lock().unwrap();
        if list.len() % QUEUE_CHUNK == 0 {
            if let Err(err) = list.try_reserve_exact(QUEUE_CHUNK) {
                return Err(AccessorError::NoMemory(format!(
                    "request registry growth failed: {err}"
                )));
            }
        }
        list.push(request);
        Ok(())
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<Request>> {
        self.list.lock().unwrap().clone()
    }

    pub(crate) fn drain(&self) -> Vec<Arc<Request>> {
        std::mem::take(&mut *self.list.lock().unwrap())
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.list.lock().unwrap().is_empty()
    }
}

/// Shared `wait_all` body: park on each still-submitted request's completion
/// condition and OR the terminal bits together.
pub(crate) fn wait_all_registered(registry: &Registry, timeout_ms: u64) -> u32 {
    if timeout_ms > 0 {
        warn!("wait_all: timeout is not supported, waiting indefinitely");
    }
    if registry.is_empty() {
        debug!("wait_all: no registered requests");
        return 0;
    }

    let mut mask = 0;
    for request in registry.snapshot() {
        request.wait_done();
        let status = request.status();
        if status.is_terminal() {
            mask |= status.bit();
        }
    }
    mask
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Direction, RequestStatus};
    use tempfile::TempDir;

    #[test]
    fn instances_are_singletons_per_kind() {
        let a1 = get_instance(AccessorKind::Aio);
        let a2 = get_instance(AccessorKind::Aio);
        let m = get_instance(AccessorKind::Mmap);

        assert!(std::ptr::eq(a1 as *const _ as *const u8, a2 as *const _ as *const u8));
        assert_eq!(a1.kind(), AccessorKind::Aio);
        assert_eq!(m.kind(), AccessorKind::Mmap);
    }

    #[test]
    fn wait_all_on_empty_registry_is_trivial() {
        let registry = Registry::new();
        assert_eq!(wait_all_registered(&registry, 0), 0);
    }

    // Observational parity: the same write-then-read flow produces the same
    // file bytes under both back-ends.
    #[test]
    fn backends_produce_identical_files() {
        let dir = TempDir::new().unwrap();
        let size = 1024usize;
        let mut contents: Vec<Vec<u8>> = Vec::new();

        let aio = AioAccessor::new();
        let mmap = MmapAccessor::new();
        let backends: [(&str, &dyn FileAccessor); 2] = [("aio", &aio), ("mmap", &mmap)];
        for (tag, accessor) in backends {
            let path = dir.path().join(format!("parity_{tag}.bin"));
            let request = accessor
                .get_request(RequestInfo {
                    direction: Direction::Write,
                    path: path.clone(),
                    size,
                    offset: 0,
                })
                .unwrap();
            let mut buf = accessor.alloc_write_buf(&request).unwrap();
            for (i, byte) in buf.as_mut_slice().iter_mut().enumerate() {
                *byte = (i % 256) as u8;
            }
            accessor.put_request(&request).unwrap();
            match accessor.wait_request(&request, 0) {
                // A fast back-end can finish before the wait is issued.
                Ok(()) | Err(crate::AccessorError::InvalidOperation(_)) => {}
                Err(err) => panic!("wait failed: {err}"),
            }
            assert_eq!(request.status(), RequestStatus::IoSuccess);
            accessor.release_all().unwrap();

            contents.push(std::fs::read(&path).unwrap());
        }

        assert_eq!(contents[0], contents[1]);
        assert_eq!(contents[0].len(), size);
    }
}
