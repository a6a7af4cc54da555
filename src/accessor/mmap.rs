//! MMAP back-end: the accessor contract implemented on a worker-thread pool.
//!
//! Each submitted request becomes a task whose payload performs mmap-based
//! data movement. Reads map the file region privately and copy it into the
//! caller-imported buffer; writes msync the shared mapping that was produced
//! at buffer-allocation time. Asynchrony, cancellation, and timeout are all
//! realised in user space:
//!
//! - workers observe a cancelled status when they dequeue (or mid-cycle) and
//!   suppress the transfer, releasing any owned mapping instead;
//! - a single-request wait with a deadline spawns a short-lived watchdog
//!   thread that promotes a still-submitted request to cancelled once the
//!   deadline passes;
//! - shutdown flushes one sentinel task per worker and joins the pool.

use crate::accessor::{wait_all_registered, AccessorKind, FileAccessor, Registry};
use crate::error::AccessorError;
use crate::pool::queue::Task;
use crate::pool::{ThreadPool, POOL_SIZE};
use crate::request::{
    open_request_file, sync_extent, validate_info, BufferSlot, Direction, MapRegion, Request,
    RequestInfo, RequestStatus, WriteBuf, RETRY_TIMES,
};
use crate::Result;
use log::{debug, error, trace, warn};
use std::ptr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// File accessor backed by memory mapping and a fixed worker pool.
pub struct MmapAccessor {
    pub(crate) pool: ThreadPool,
    registry: Registry,
}

impl MmapAccessor {
    /// Accessor with the standard pool size. Workers spawn lazily on the
    /// first request.
    pub fn new() -> MmapAccessor {
        MmapAccessor::with_workers(POOL_SIZE)
    }

    pub(crate) fn with_workers(workers: usize) -> MmapAccessor {
        MmapAccessor {
            pool: ThreadPool::new(workers),
            registry: Registry::new(),
        }
    }
}

impl Default for MmapAccessor {
    fn default() -> Self {
        Self::new()
    }
}

impl FileAccessor for MmapAccessor {
    fn kind(&self) -> AccessorKind {
        AccessorKind::Mmap
    }

    fn get_request(&self, info: RequestInfo) -> Result<Arc<Request>> {
        validate_info(&info)?;
        self.pool.ensure_running();

        let file = open_request_file(&info)?;
        if info.direction == Direction::Write {
            // The shared mapping needs the file to back the whole region.
            let backing = info.offset + info.size as u64;
            file.set_len(backing).map_err(|err| {
                AccessorError::BadValue(format!(
                    "cannot extend {} to {backing} bytes: {err}",
                    info.path.display()
                ))
            })?;
        }

        let request = Request::new(info, file);
        self.registry.register(Arc::clone(&request))?;
        Ok(request)
    }

    fn alloc_write_buf(&self, request: &Arc<Request>) -> Result<WriteBuf> {
        request.ensure_valid()?;
        let info = request.info();
        if info.direction != Direction::Write {
            return Err(AccessorError::BadValue(
                "write buffer requested for a read request".into(),
            ));
        }

        let mut st = request.lock();
        if !matches!(st.buffer, BufferSlot::Empty) {
            return Err(AccessorError::InvalidOperation(
                "request buffer already bound".into(),
            ));
        }
        let fd = st.raw_fd().ok_or_else(|| {
            AccessorError::InvalidOperation("request already released".into())
        })?;

        let mut attempt = 0;
        let region = loop {
            match MapRegion::map(
                fd,
                info.size,
                info.offset,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
            ) {
                Ok(region) => break region,
                Err(err) if attempt < RETRY_TIMES => {
                    attempt += 1;
                    warn!(
                        "write mapping of {} failed: {err}; retrying [{attempt}]",
                        info.path.display()
                    );
                }
                Err(err) => {
                    error!("write buffer alloc for {} failed: {err}", info.path.display());
                    return Err(AccessorError::BadValue(format!(
                        "cannot map {} for writing: {err}",
                        info.path.display()
                    )));
                }
            }
        };

        let buf = WriteBuf::new(region.data(), region.len());
        st.buffer = BufferSlot::Mapped { region };
        Ok(buf)
    }

    fn import_read_buf(&self, request: &Arc<Request>, buf: *mut u8) -> Result<()> {
        request.ensure_valid()?;
        if request.info().direction != Direction::Read {
            return Err(AccessorError::BadValue(
                "read buffer imported into a write request".into(),
            ));
        }
        if buf.is_null() {
            return Err(AccessorError::BadValue("imported buffer is null".into()));
        }

        let mut st = request.lock();
        if !matches!(st.buffer, BufferSlot::Empty) {
            return Err(AccessorError::InvalidOperation(
                "request buffer already bound".into(),
            ));
        }
        st.buffer = BufferSlot::Imported { ptr: buf };
        Ok(())
    }

    fn put_request(&self, request: &Arc<Request>) -> Result<()> {
        request.ensure_valid()?;
        let direction = request.info().direction;
        {
            let mut st = request.lock();
            if st.status != RequestStatus::Init {
                return Err(AccessorError::InvalidOperation(format!(
                    "cannot submit a request in state {}",
                    st.status
                )));
            }
            if st.raw_fd().is_none() {
                return Err(AccessorError::InvalidOperation(
                    "request already released".into(),
                ));
            }
            let bound = matches!(
                (direction, &st.buffer),
                (Direction::Read, BufferSlot::Imported { .. })
                    | (Direction::Write, BufferSlot::Mapped { .. })
            );
            if !bound {
                return Err(AccessorError::BadValue(
                    "no buffer bound for the request direction".into(),
                ));
            }
            st.status = RequestStatus::Submitted;
        }

        let task = {
            let request = Arc::clone(request);
            match direction {
                Direction::Read => Task::new(move || mmap_read(&request)),
                Direction::Write => Task::new(move || mmap_write(&request)),
            }
        };

        match self.pool.submit(task) {
            Ok(()) => Ok(()),
            Err(err) => {
                let mut st = request.lock();
                st.release_owned_buffer();
                st.status = RequestStatus::Cancelled;
                drop(st);
                request.signal_done();
                error!(
                    "submission of {} failed, request cancelled: {err}",
                    request.info().path.display()
                );
                Err(match err {
                    AccessorError::AlreadyExists(_) => AccessorError::InvalidOperation(
                        "thread pool is not running".into(),
                    ),
                    other => other,
                })
            }
        }
    }

    fn wait_request(&self, request: &Arc<Request>, timeout_ms: u64) -> Result<()> {
        request.ensure_valid()?;
        {
            let st = request.lock();
            if st.status != RequestStatus::Submitted {
                return Err(AccessorError::InvalidOperation(format!(
                    "cannot wait a request in state {}",
                    st.status
                )));
            }
        }

        if timeout_ms > 0 {
            let watchdog = {
                let request = Arc::clone(request);
                std::thread::spawn(move || timeout_watchdog(&request, timeout_ms))
            };
            request.wait_done();
            if watchdog.join().is_err() {
                warn!("timeout watchdog panicked before join");
            }
        } else {
            request.wait_done();
        }
        Ok(())
    }

    fn cancel_request(&self, request: &Arc<Request>) -> Result<()> {
        request.ensure_valid()?;
        let mut st = request.lock();
        match st.status {
            RequestStatus::Init => Err(AccessorError::InvalidOperation(
                "cannot cancel a request that was never submitted".into(),
            )),
            status if status.is_terminal() => {
                warn!(
                    "request for {} already finished, nothing to cancel",
                    request.info().path.display()
                );
                Ok(())
            }
            _ => {
                st.status = RequestStatus::Cancelled;
                drop(st);
                request.signal_done();
                Ok(())
            }
        }
    }

    fn wait_all(&self, timeout_ms: u64) -> Result<u32> {
        Ok(wait_all_registered(&self.registry, timeout_ms))
    }

    fn cancel_all(&self) -> Result<()> {
        for request in self.registry.snapshot() {
            let mut st = request.lock();
            if st.status == RequestStatus::Submitted {
                st.status = RequestStatus::Cancelled;
            }
            drop(st);
            request.signal_done();
        }
        Ok(())
    }

    fn release_all(&self) -> Result<()> {
        self.pool.shutdown()?;
        let drained = self.registry.drain();
        debug!("releasing {} mmap requests", drained.len());
        for request in drained {
            let mut st = request.lock();
            st.release_owned_buffer();
            st.file = None;
        }
        Ok(())
    }
}

/// Read task payload. The imported buffer receives the file bytes; the copy
/// length is clamped at EOF so short files read what is available.
fn mmap_read(request: &Request) {
    // Early cancel: nothing mapped yet, nothing to release.
    if request.status() == RequestStatus::Cancelled {
        return;
    }

    let info = request.info();
    trace!("mmap read start: {}", info.path.display());

    let (fd, dest, file_len) = {
        let st = request.lock();
        let dest = match st.buffer {
            BufferSlot::Imported { ptr } => Some(ptr),
            _ => None,
        };
        let file_len = st.file.as_ref().and_then(|f| f.metadata().ok()).map(|m| m.len());
        (st.raw_fd(), dest, file_len)
    };
    let (Some(fd), Some(dest), Some(file_len)) = (fd, dest, file_len) else {
        error!("read of {} failed: request released or unbound", info.path.display());
        request.finish(RequestStatus::IoFail, 0);
        return;
    };

    let available = file_len.saturating_sub(info.offset) as usize;
    let copy_len = info.size.min(available);
    if copy_len == 0 {
        debug!("read of {} starts at or past EOF", info.path.display());
        request.finish(RequestStatus::IoSuccess, 0);
        return;
    }

    let mut attempt = 0;
    let region = loop {
        match MapRegion::map(fd, copy_len, info.offset, libc::PROT_READ, libc::MAP_PRIVATE) {
            Ok(region) => break Some(region),
            Err(err) if attempt < RETRY_TIMES => {
                attempt += 1;
                warn!(
                    "read mapping of {} failed: {err}; retrying [{attempt}]",
                    info.path.display()
                );
            }
            Err(err) => {
                error!("read of {} failed: {err}", info.path.display());
                break None;
            }
        }
    };

    match region {
        Some(region) => {
            unsafe { ptr::copy_nonoverlapping(region.data() as *const u8, dest, copy_len) };
            request.finish(RequestStatus::IoSuccess, copy_len);
        }
        None => request.finish(RequestStatus::IoFail, 0),
    }
    trace!("mmap read done: {}", info.path.display());
}

/// Write task payload. Commits the shared mapping with a synchronous msync
/// and always unmaps it afterwards. A cancelled request drops the mapping
/// without committing, discarding the caller's buffered bytes.
fn mmap_write(request: &Request) {
    {
        let mut st = request.lock();
        if st.status == RequestStatus::Cancelled {
            st.release_owned_buffer();
            return;
        }
    }

    let info = request.info();
    trace!("mmap write start: {}", info.path.display());

    // Snapshot the extent so the msync runs without the request lock held;
    // nothing unmaps an owned region while its task is in flight.
    let extent = {
        let st = request.lock();
        match &st.buffer {
            BufferSlot::Mapped { region } => Some(region.extent()),
            _ => None,
        }
    };

    let (outcome, bytes) = match extent {
        Some((base, map_len)) => match sync_extent(base, map_len) {
            Ok(()) => (RequestStatus::IoSuccess, info.size),
            Err(err) => {
                error!("write of {} failed: {err}", info.path.display());
                (RequestStatus::IoFail, 0)
            }
        },
        None => {
            error!("write of {} failed: mapping missing", info.path.display());
            (RequestStatus::IoFail, 0)
        }
    };

    request.finish(outcome, bytes);
    request.lock().release_owned_buffer();
    trace!("mmap write done: {}", info.path.display());
}

/// Deadline watchdog for a single-request wait. Parks on the completion
/// condition so an early completion releases it immediately; once the
/// deadline passes, a still-submitted request is promoted to cancelled.
fn timeout_watchdog(request: &Request, timeout_ms: u64) {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    let mut st = request.lock();
    while st.status == RequestStatus::Submitted {
        let now = Instant::now();
        if now >= deadline {
            st.status = RequestStatus::Cancelled;
            debug!(
                "wait on {} passed its {timeout_ms} ms deadline, request cancelled",
                request.info().path.display()
            );
            drop(st);
            request.signal_done();
            return;
        }
        let (guard, _) = request.done.wait_timeout(st, deadline - now).unwrap();
        st = guard;
    }
}
