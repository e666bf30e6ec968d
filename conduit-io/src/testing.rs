//! Test doubles: an in-memory backend and an allocator that counts releases.

use std::cell::{Cell, RefCell};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::ptr::NonNull;
use std::rc::Rc;

use crate::backend::{Backend, BackendKind};
use crate::memory::{RegionAllocator, RegionError, SystemAllocator};

/// Call counts observed by a [`CountingAllocator`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AllocStats {
    pub allocations: usize,
    pub frees: usize,
    pub maps: usize,
    pub unmaps: usize,
}

/// Delegates to [`SystemAllocator`] and counts every call.
#[derive(Debug, Default)]
pub struct CountingAllocator {
    inner: SystemAllocator,
    stats: Cell<AllocStats>,
    fail_unmaps: Cell<bool>,
}

impl CountingAllocator {
    pub fn stats(&self) -> AllocStats {
        self.stats.get()
    }

    /// Makes subsequent unmaps report failure. The mapping is still removed.
    pub fn set_fail_unmaps(&self, fail: bool) {
        self.fail_unmaps.set(fail);
    }

    fn bump(&self, f: impl FnOnce(&mut AllocStats)) {
        let mut stats = self.stats.get();
        f(&mut stats);
        self.stats.set(stats);
    }
}

impl RegionAllocator for CountingAllocator {
    fn allocate(&self, len: usize) -> Result<NonNull<u8>, RegionError> {
        let ptr = self.inner.allocate(len)?;
        self.bump(|s| s.allocations += 1);
        Ok(ptr)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, len: usize) {
        self.bump(|s| s.frees += 1);
        // SAFETY: forwarded caller contract.
        unsafe { self.inner.free(ptr, len) }
    }

    fn map(&self, len: usize) -> Result<NonNull<u8>, RegionError> {
        let ptr = self.inner.map(len)?;
        self.bump(|s| s.maps += 1);
        Ok(ptr)
    }

    unsafe fn unmap(&self, ptr: NonNull<u8>, len: usize) -> Result<(), RegionError> {
        self.bump(|s| s.unmaps += 1);
        // SAFETY: forwarded caller contract.
        unsafe { self.inner.unmap(ptr, len) }?;
        if self.fail_unmaps.get() {
            return Err(RegionError::UnmapFailed {
                len,
                source: io::Error::from(io::ErrorKind::Other),
            });
        }
        Ok(())
    }
}

/// Order in which logging backends were closed, shared between them.
#[derive(Debug, Clone, Default)]
pub struct CloseLog(Rc<RefCell<Vec<String>>>);

impl CloseLog {
    pub fn entries(&self) -> Vec<String> {
        self.0.borrow().clone()
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    data: Cursor<Vec<u8>>,
    /// Separate output for socket-like backends.
    sent: Option<Vec<u8>>,
    reads: usize,
    writes: usize,
    flushes: usize,
    closes: usize,
    fail_writes: bool,
}

/// Inspection handle shared with a [`MemoryBackend`].
#[derive(Debug, Clone, Default)]
pub struct MemoryProbe(Rc<RefCell<MemoryState>>);

impl MemoryProbe {
    /// Everything currently stored in the backend.
    pub fn contents(&self) -> Vec<u8> {
        self.0.borrow().data.get_ref().clone()
    }

    pub fn read_calls(&self) -> usize {
        self.0.borrow().reads
    }

    pub fn write_calls(&self) -> usize {
        self.0.borrow().writes
    }

    pub fn flush_calls(&self) -> usize {
        self.0.borrow().flushes
    }

    pub fn close_calls(&self) -> usize {
        self.0.borrow().closes
    }

    /// Bytes written to a backend created with [`MemoryBackend::socket`].
    pub fn sent(&self) -> Vec<u8> {
        self.0.borrow().sent.clone().unwrap_or_default()
    }

    /// Backend position, as a file would report it.
    pub fn position(&self) -> u64 {
        self.0.borrow().data.position()
    }

    /// Makes subsequent writes fail with `BrokenPipe`.
    pub fn set_fail_writes(&self, fail: bool) {
        self.0.borrow_mut().fail_writes = fail;
    }
}

/// File-like backend over a shared byte vector.
#[derive(Debug)]
pub struct MemoryBackend {
    state: MemoryProbe,
    seekable: bool,
    close_log: Option<(CloseLog, String)>,
}

impl MemoryBackend {
    /// Empty, seekable backend.
    pub fn new() -> (Self, MemoryProbe) {
        Self::with_input(Vec::new())
    }

    /// Seekable backend positioned at the start of `input`.
    pub fn with_input(input: impl Into<Vec<u8>>) -> (Self, MemoryProbe) {
        let probe = MemoryProbe::default();
        probe.0.borrow_mut().data = Cursor::new(input.into());
        (
            Self {
                state: probe.clone(),
                seekable: true,
                close_log: None,
            },
            probe,
        )
    }

    /// Socket-like backend: reads drain `input`, writes go to a separate
    /// buffer (see [`MemoryProbe::sent`]), seeking is unsupported.
    pub fn socket(input: impl Into<Vec<u8>>) -> (Self, MemoryProbe) {
        let (backend, probe) = Self::with_input(input);
        probe.0.borrow_mut().sent = Some(Vec::new());
        (backend.unseekable(), probe)
    }

    /// Turns the backend into a pipe: seeking fails with `Unsupported`.
    pub fn unseekable(mut self) -> Self {
        self.seekable = false;
        self
    }

    /// Records `name` in `log` when the backend is closed.
    pub fn logging_closes(mut self, log: &CloseLog, name: impl Into<String>) -> Self {
        self.close_log = Some((log.clone(), name.into()));
        self
    }
}

impl Backend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.0.borrow_mut();
        state.reads += 1;
        state.data.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.0.borrow_mut();
        if state.fail_writes {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        state.writes += 1;
        match state.sent.as_mut() {
            Some(sent) => {
                sent.extend_from_slice(buf);
                Ok(buf.len())
            }
            None => state.data.write(buf),
        }
    }

    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        if !self.seekable {
            return Err(crate::backend::unsupported("seek"));
        }
        self.state.0.borrow_mut().data.seek(pos)
    }

    fn is_seekable(&self) -> bool {
        self.seekable
    }

    fn flush(&mut self) -> io::Result<()> {
        self.state.0.borrow_mut().flushes += 1;
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.state.0.borrow_mut().closes += 1;
        if let Some((log, name)) = &self.close_log {
            log.0.borrow_mut().push(name.clone());
        }
        Ok(())
    }
}
