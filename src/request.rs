//! Request descriptor, status state machine, and the request object shared
//! between callers, accessors, and completion contexts.
//!
//! A request is created by an accessor's `get_request`, mutated by the buffer
//! binding operations and `put_request`, completed by a worker thread or an
//! AIO callback, and reclaimed by `release_all`. Status transitions are
//! serialised by the per-request lock and advance monotonically:
//!
//! ```text
//! Init -> Submitted -> {IoSuccess, IoFail, Cancelled}
//! ```
//!
//! Buffer ownership follows the submission path: write buffers allocated by
//! an accessor belong to the request and are released on its behalf; read
//! destinations imported by the caller stay with the caller.

use crate::error::AccessorError;
use crate::Result;
use log::{error, warn};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::ptr;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

/// Longest accepted file path, in bytes.
pub const MAX_PATH_LEN: usize = 511;

/// Additional attempts after a failed open or map.
pub const RETRY_TIMES: u32 = 2;

/// Transfer direction of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// File content is copied into a caller-imported buffer.
    Read,
    /// An accessor-allocated buffer is committed to the file.
    Write,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Read => write!(f, "read"),
            Direction::Write => write!(f, "write"),
        }
    }
}

/// Descriptor of one file operation. Immutable once the request exists.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    /// Read or write.
    pub direction: Direction,
    /// Target file path, at most [`MAX_PATH_LEN`] bytes.
    pub path: PathBuf,
    /// Number of bytes to transfer. Must be non-zero.
    pub size: usize,
    /// Starting byte offset within the file.
    pub offset: u64,
}

/// Lifecycle label of a request.
///
/// Only `Submitted` requests may be waited on or cancelled; the three
/// right-hand states are terminal and never transition again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RequestStatus {
    /// Created, not yet handed to a back-end.
    Init,
    /// In flight with the kernel or the worker pool.
    Submitted,
    /// Transfer finished successfully.
    IoSuccess,
    /// Transfer failed.
    IoFail,
    /// Cancelled by the caller, a timeout, or a failed submission.
    Cancelled,
}

impl RequestStatus {
    /// Whether the status is one of the three terminal states.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestStatus::IoSuccess | RequestStatus::IoFail | RequestStatus::Cancelled
        )
    }

    /// Observability bit used in `wait_all`'s OR-summary.
    pub fn bit(self) -> u32 {
        match self {
            RequestStatus::Init => 1,
            RequestStatus::Submitted => 1 << 1,
            RequestStatus::IoSuccess => 1 << 2,
            RequestStatus::IoFail => 1 << 3,
            RequestStatus::Cancelled => 1 << 4,
        }
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            RequestStatus::Init => "init",
            RequestStatus::Submitted => "submitted",
            RequestStatus::IoSuccess => "io-success",
            RequestStatus::IoFail => "io-fail",
            RequestStatus::Cancelled => "cancelled",
        };
        write!(f, "{label}")
    }
}

/// A live mmap region.
///
/// The base address is page-aligned as the kernel requires; `data()` points
/// at the caller's requested offset within the mapping. Unmapped on drop.
pub(crate) struct MapRegion {
    base: *mut u8,
    map_len: usize,
    delta: usize,
    len: usize,
}

// Safety: the region is only touched by whichever thread currently holds the
// request lock, or by a worker that is the sole writer for the request.
unsafe impl Send for MapRegion {}

impl MapRegion {
    /// Map `len` bytes of `fd` starting at `offset`.
    ///
    /// The file offset handed to the kernel is aligned down to the page
    /// boundary; the intra-page delta is carried so callers keep working
    /// with arbitrary offsets.
    pub(crate) fn map(
        fd: RawFd,
        len: usize,
        offset: u64,
        prot: libc::c_int,
        flags: libc::c_int,
    ) -> io::Result<MapRegion> {
        let page = page_size() as u64;
        let delta = (offset % page) as usize;
        let map_off = (offset - delta as u64) as libc::off_t;
        let map_len = len + delta;

        let base = unsafe {
            libc::mmap(ptr::null_mut(), map_len, prot, flags, fd, map_off)
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(MapRegion {
            base: base as *mut u8,
            map_len,
            delta,
            len,
        })
    }

    /// Pointer to the first requested byte.
    pub(crate) fn data(&self) -> *mut u8 {
        unsafe { self.base.add(self.delta) }
    }

    /// Requested byte count (excludes the alignment delta).
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Raw extent for out-of-lock msync.
    pub(crate) fn extent(&self) -> (*mut u8, usize) {
        (self.base, self.map_len)
    }
}

impl Drop for MapRegion {
    fn drop(&mut self) {
        let rc = unsafe { libc::munmap(self.base as *mut libc::c_void, self.map_len) };
        if rc != 0 {
            warn!("munmap failed: {}", io::Error::last_os_error());
        }
    }
}

/// Commit a mapped extent to its file with a synchronous msync.
pub(crate) fn sync_extent(base: *mut u8, map_len: usize) -> io::Result<()> {
    let rc = unsafe { libc::msync(base as *mut libc::c_void, map_len, libc::MS_SYNC) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Storage behind a request's buffer pointer.
pub(crate) enum BufferSlot {
    /// No buffer bound yet.
    Empty,
    /// Caller-owned read destination; the caller keeps at least
    /// `info.size` bytes writable until the request is terminal.
    Imported { ptr: *mut u8 },
    /// Request-owned heap source for AIO writes.
    Heap { data: Box<[u8]> },
    /// Request-owned MAP_SHARED region for MMAP writes.
    Mapped { region: MapRegion },
}

/// Writable view of a request-owned write buffer.
///
/// Returned by `alloc_write_buf`. The view stays valid until the request
/// reaches a terminal status; callers must stop using it once `put_request`
/// hands the bytes to the back-end.
pub struct WriteBuf {
    ptr: *mut u8,
    len: usize,
}

// Safety: the view aliases request-owned storage whose lifetime outlasts the
// in-flight window; concurrent access is excluded by the usage contract
// above (the caller writes only between allocation and submission).
unsafe impl Send for WriteBuf {}

impl WriteBuf {
    pub(crate) fn new(ptr: *mut u8, len: usize) -> WriteBuf {
        WriteBuf { ptr, len }
    }

    /// Length of the writable region in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The region as a mutable slice.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

/// Mutable request state, guarded by the per-request lock.
pub(crate) struct RequestState {
    pub(crate) status: RequestStatus,
    /// Open handle on the target file; `None` once released.
    pub(crate) file: Option<File>,
    pub(crate) buffer: BufferSlot,
    /// Validation cache; avoids repeated filesystem probes.
    pub(crate) is_valid: bool,
    pub(crate) bytes_transferred: usize,
    /// AIO control block; `None` for MMAP-backed requests. Boxed so the
    /// address handed to the kernel stays stable.
    pub(crate) aio_cb: Option<Box<libc::aiocb>>,
}

impl RequestState {
    /// Drop any buffer the request owns. Imported buffers stay with the
    /// caller; owned mappings are unmapped and heap buffers freed. Safe to
    /// call more than once.
    pub(crate) fn release_owned_buffer(&mut self) {
        match std::mem::replace(&mut self.buffer, BufferSlot::Empty) {
            BufferSlot::Mapped { region } => drop(region),
            BufferSlot::Heap { data } => drop(data),
            BufferSlot::Imported { .. } | BufferSlot::Empty => {}
        }
    }

    pub(crate) fn raw_fd(&self) -> Option<RawFd> {
        self.file.as_ref().map(|f| f.as_raw_fd())
    }
}

/// One submitted (or submittable) file operation.
///
/// Shared as `Arc<Request>` between the caller, the accessor's registry, and
/// whichever execution context completes it. The embedded mutex serialises
/// every state transition; the condvar is the completion signal waiters park
/// on.
pub struct Request {
    info: RequestInfo,
    pub(crate) state: Mutex<RequestState>,
    pub(crate) done: Condvar,
}

// Safety: the raw pointers inside `RequestState` (imported destinations,
// owned mappings, the AIO control block) are only dereferenced under the
// state mutex or by the single completion context that owns the transfer;
// imported pointer validity is the caller's documented contract.
unsafe impl Send for Request {}
unsafe impl Sync for Request {}

impl Request {
    pub(crate) fn new(info: RequestInfo, file: File) -> Arc<Request> {
        Arc::new(Request {
            info,
            state: Mutex::new(RequestState {
                status: RequestStatus::Init,
                file: Some(file),
                buffer: BufferSlot::Empty,
                is_valid: true,
                bytes_transferred: 0,
                aio_cb: None,
            }),
            done: Condvar::new(),
        })
    }

    /// The descriptor this request was created from.
    pub fn info(&self) -> &RequestInfo {
        &self.info
    }

    /// Current lifecycle status.
    pub fn status(&self) -> RequestStatus {
        self.lock().status
    }

    /// Bytes actually moved by a finished transfer.
    pub fn bytes_transferred(&self) -> usize {
        self.lock().bytes_transferred
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, RequestState> {
        self.state.lock().unwrap()
    }

    /// Wake every waiter parked on the completion condition.
    pub(crate) fn signal_done(&self) {
        self.done.notify_all();
    }

    /// Block until the status leaves `Submitted`.
    pub(crate) fn wait_done(&self) {
        let mut st = self.lock();
        while st.status == RequestStatus::Submitted {
            st = self.done.wait(st).unwrap();
        }
    }

    /// Revalidate the descriptor unless the cached result is still good.
    /// `get_request` primes the cache, so this normally costs one lock.
    pub(crate) fn ensure_valid(&self) -> Result<()> {
        {
            let st = self.lock();
            if st.is_valid {
                return Ok(());
            }
        }
        validate_info(&self.info)?;
        self.lock().is_valid = true;
        Ok(())
    }

    /// Terminal transition performed by a completion context. A raced
    /// cancellation wins and is preserved.
    pub(crate) fn finish(&self, outcome: RequestStatus, bytes: usize) {
        debug_assert!(outcome.is_terminal());
        let mut st = self.lock();
        if st.status != RequestStatus::Cancelled {
            st.status = outcome;
            st.bytes_transferred = bytes;
        }
        self.signal_done();
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("info", &self.info)
            .field("status", &self.status())
            .finish()
    }
}

/// Descriptor validation: non-zero size, bounded path, and a probe open with
/// the access mode the transfer will use. The probe handle is closed again;
/// the result is cached on the request as `is_valid`.
pub(crate) fn validate_info(info: &RequestInfo) -> Result<()> {
    if info.size == 0 {
        return Err(AccessorError::BadValue("zero-size request".into()));
    }
    if info.path.as_os_str().len() > MAX_PATH_LEN {
        return Err(AccessorError::BadValue(format!(
            "path exceeds {MAX_PATH_LEN} bytes"
        )));
    }

    let probe = match info.direction {
        Direction::Read => OpenOptions::new().read(true).open(&info.path),
        Direction::Write => OpenOptions::new().write(true).create(true).open(&info.path),
    };
    match probe {
        Ok(_) => Ok(()),
        Err(err) => {
            error!(
                "invalid request: cannot open {} for {}: {err}",
                info.path.display(),
                info.direction
            );
            Err(AccessorError::BadValue(format!(
                "path {} not accessible: {err}",
                info.path.display()
            )))
        }
    }
}

/// Open the real transfer handle with a bounded retry. Reads open read-only;
/// writes open read+write, create, truncate (truncate-on-write is the
/// documented contract).
pub(crate) fn open_request_file(info: &RequestInfo) -> Result<File> {
    let mut attempt = 0;
    loop {
        let opened = match info.direction {
            Direction::Read => OpenOptions::new().read(true).open(&info.path),
            Direction::Write => OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&info.path),
        };
        match opened {
            Ok(file) => return Ok(file),
            Err(err) if attempt < RETRY_TIMES => {
                attempt += 1;
                warn!(
                    "open {} failed: {err}; retrying [{attempt}]",
                    info.path.display()
                );
            }
            Err(err) => {
                error!("open {} failed: {err}", info.path.display());
                return Err(AccessorError::BadValue(format!(
                    "cannot open {}: {err}",
                    info.path.display()
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::TempDir;

    fn info(direction: Direction, path: PathBuf, size: usize) -> RequestInfo {
        RequestInfo {
            direction,
            path,
            size,
            offset: 0,
        }
    }

    #[test]
    fn status_terminality() {
        assert!(!RequestStatus::Init.is_terminal());
        assert!(!RequestStatus::Submitted.is_terminal());
        assert!(RequestStatus::IoSuccess.is_terminal());
        assert!(RequestStatus::IoFail.is_terminal());
        assert!(RequestStatus::Cancelled.is_terminal());
    }

    #[test]
    fn status_bits_are_distinct() {
        let bits = [
            RequestStatus::Init.bit(),
            RequestStatus::Submitted.bit(),
            RequestStatus::IoSuccess.bit(),
            RequestStatus::IoFail.bit(),
            RequestStatus::Cancelled.bit(),
        ];
        let mut mask = 0;
        for b in bits {
            assert_eq!(mask & b, 0);
            mask |= b;
        }
    }

    #[test]
    fn zero_size_is_rejected() {
        let res = validate_info(&info(Direction::Read, "./whatever".into(), 0));
        assert!(matches!(res, Err(AccessorError::BadValue(_))));
    }

    #[test]
    fn over_long_path_is_rejected() {
        let path: PathBuf = std::iter::repeat('a').take(MAX_PATH_LEN + 1).collect::<String>().into();
        let res = validate_info(&info(Direction::Write, path, 16));
        assert!(matches!(res, Err(AccessorError::BadValue(_))));
    }

    #[test]
    fn missing_file_fails_read_validation() {
        let dir = TempDir::new().unwrap();
        let res = validate_info(&info(Direction::Read, dir.path().join("absent.bin"), 16));
        assert!(matches!(res, Err(AccessorError::BadValue(_))));
    }

    #[test]
    fn write_open_truncates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("w.bin");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"old content that should vanish").unwrap();
        drop(f);

        let file = open_request_file(&info(Direction::Write, path.clone(), 8)).unwrap();
        assert_eq!(file.metadata().unwrap().len(), 0);
    }

    #[test]
    fn finish_preserves_cancellation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("c.bin");
        std::fs::write(&path, b"data").unwrap();

        let file = std::fs::File::open(&path).unwrap();
        let req = Request::new(info(Direction::Read, path, 4), file);
        {
            let mut st = req.lock();
            st.status = RequestStatus::Cancelled;
        }
        req.finish(RequestStatus::IoSuccess, 4);
        assert_eq!(req.status(), RequestStatus::Cancelled);
        assert_eq!(req.bytes_transferred(), 0);
    }

    #[test]
    fn map_region_handles_unaligned_offsets() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("m.bin");
        let payload: Vec<u8> = (0u32..8192).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &payload).unwrap();

        let file = std::fs::File::open(&path).unwrap();
        let offset = 4099u64; // deliberately not page-aligned
        let len = 512usize;
        let region = MapRegion::map(
            file.as_raw_fd(),
            len,
            offset,
            libc::PROT_READ,
            libc::MAP_PRIVATE,
        )
        .unwrap();

        let got = unsafe { std::slice::from_raw_parts(region.data(), len) };
        assert_eq!(got, &payload[offset as usize..offset as usize + len]);
    }
}
