//! Buffer descriptor: origin and role of a stream's buffer.
//!
//! Origin lives in the [`Region`] variant, so a buffer is exactly one of heap,
//! mapped or external. Role is a separate tag saying which directions the
//! buffer serves; it is distinct from the directions the stream permits.
//! [`BufferFlags`] is the flattened view reported by [`IoObject::classify`].

use std::io;

use bitflags::bitflags;
use conduit_io::memory::{ExternalRegion, HeapRegion, MappedRegion};
use conduit_io::{Backend, BufferOrigin, OpenMode, Region, RegionError};
use log::debug;

use crate::error::Result;
use crate::object::IoObject;
use crate::size::BufferSize;

bitflags! {
    /// Flag view of a buffer descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BufferFlags: u32 {
        /// Buffer memory was allocated by this layer.
        const HEAP_OWNED = 0o1;
        const READ_ROLE = 0o2;
        const WRITE_ROLE = 0o4;
        /// Buffer memory is a mapping owned by this layer.
        const MEMORY_MAPPED = 0o10;
    }
}

/// Which directions a stream's buffer serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferRole {
    Read,
    Write,
    Both,
}

impl BufferRole {
    pub fn for_mode(mode: OpenMode) -> Self {
        match (mode.readable(), mode.writable()) {
            (true, true) => BufferRole::Both,
            (false, _) => BufferRole::Write,
            (true, false) => BufferRole::Read,
        }
    }

    pub fn readable(self) -> bool {
        matches!(self, BufferRole::Read | BufferRole::Both)
    }

    pub fn writable(self) -> bool {
        matches!(self, BufferRole::Write | BufferRole::Both)
    }

    /// Union of both roles.
    pub fn with(self, other: BufferRole) -> Self {
        if self == other {
            self
        } else {
            BufferRole::Both
        }
    }

    pub fn flags(self) -> BufferFlags {
        match self {
            BufferRole::Read => BufferFlags::READ_ROLE,
            BufferRole::Write => BufferFlags::WRITE_ROLE,
            BufferRole::Both => BufferFlags::READ_ROLE | BufferFlags::WRITE_ROLE,
        }
    }
}

fn origin_flags(origin: BufferOrigin) -> BufferFlags {
    match origin {
        BufferOrigin::SelfAllocated => BufferFlags::HEAP_OWNED,
        BufferOrigin::MemoryMapped => BufferFlags::MEMORY_MAPPED,
        BufferOrigin::External => BufferFlags::empty(),
    }
}

/// What the buffer currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fill {
    Empty,
    /// Read-ahead: bytes `pos..end` have not been consumed yet.
    Read { pos: usize, end: usize },
    /// Bytes `0..len` are waiting to be written.
    Write { len: usize },
}

#[derive(Debug)]
pub(crate) struct StreamBuffer {
    pub(crate) region: Region,
    pub(crate) fill: Fill,
}

impl StreamBuffer {
    pub(crate) fn new(region: Region) -> Self {
        Self {
            region,
            fill: Fill::Empty,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.region.len()
    }

    pub(crate) fn unread(&self) -> &[u8] {
        match self.fill {
            Fill::Read { pos, end } => &self.region.as_slice()[pos..end],
            _ => &[],
        }
    }

    pub(crate) fn pending(&self) -> &[u8] {
        match self.fill {
            Fill::Write { len } => &self.region.as_slice()[..len],
            _ => &[],
        }
    }

    /// Marks `n` read-ahead bytes as consumed.
    pub(crate) fn consume(&mut self, n: usize) {
        if let Fill::Read { pos, end } = self.fill {
            let pos = pos + n;
            self.fill = if pos >= end {
                Fill::Empty
            } else {
                Fill::Read { pos, end }
            };
        }
    }

    /// Copies read-ahead into `out`, returning the number of bytes copied.
    pub(crate) fn copy_unread(&mut self, out: &mut [u8]) -> usize {
        let unread = self.unread();
        let n = unread.len().min(out.len());
        out[..n].copy_from_slice(&unread[..n]);
        self.consume(n);
        n
    }

    /// Writes pending output to `backend`. The buffer empties only on success.
    pub(crate) fn drain_into(&mut self, backend: &mut dyn Backend) -> io::Result<()> {
        if self.pending().is_empty() {
            return Ok(());
        }
        backend.write_all(self.pending())?;
        self.fill = Fill::Empty;
        Ok(())
    }

    /// Appends to pending output. The caller guarantees there is room.
    pub(crate) fn append(&mut self, data: &[u8]) {
        let len = self.pending().len();
        self.region.as_mut_slice()[len..len + data.len()].copy_from_slice(data);
        self.fill = Fill::Write {
            len: len + data.len(),
        };
    }
}

impl IoObject {
    /// Current origin and role flags.
    pub fn classify(&self) -> BufferFlags {
        let origin = self
            .buffer
            .as_ref()
            .map_or(BufferFlags::empty(), |b| origin_flags(b.region.origin()));
        origin | self.role.flags()
    }

    /// Origin of the attached buffer, if any.
    pub fn buffer_origin(&self) -> Option<BufferOrigin> {
        self.buffer.as_ref().map(|b| b.region.origin())
    }

    /// Capacity of the attached buffer, if any.
    pub fn buffer_capacity(&self) -> Option<usize> {
        self.buffer.as_ref().map(StreamBuffer::capacity)
    }

    /// Backs the stream with `capacity` bytes allocated by this layer.
    ///
    /// A no-op if the buffer is already heap-owned.
    ///
    /// # Errors
    /// [`crate::IoError::OwnershipViolation`] if the current buffer is mapped or
    /// externally supplied; [`crate::IoError::SentinelMisuse`] for an unbound capacity.
    pub fn mark_heap_owned(&mut self, capacity: BufferSize) -> Result<()> {
        const OP: &str = "mark_heap_owned";
        self.check_open(OP)?;
        if self.claim(BufferOrigin::SelfAllocated, OP)? {
            return Ok(());
        }
        let len = capacity.get(OP)?;
        let region =
            HeapRegion::allocate(&self.allocator, len).map_err(|e| self.region_error(OP, e))?;
        self.install(Region::Heap(region));
        Ok(())
    }

    /// Backs the stream with an anonymous mapping of at least `capacity` bytes.
    ///
    /// A no-op if the buffer is already mapped. A heap-owned buffer is not
    /// converted: it must be released first.
    ///
    /// # Errors
    /// [`crate::IoError::OwnershipViolation`] if the current buffer is heap-owned or
    /// externally supplied; [`crate::IoError::SentinelMisuse`] for an unbound capacity.
    pub fn mark_memory_mapped(&mut self, capacity: BufferSize) -> Result<()> {
        const OP: &str = "mark_memory_mapped";
        self.check_open(OP)?;
        if self.claim(BufferOrigin::MemoryMapped, OP)? {
            return Ok(());
        }
        let len = capacity.get(OP)?;
        let region =
            MappedRegion::map(&self.allocator, len).map_err(|e| self.region_error(OP, e))?;
        self.install(Region::Mapped(region));
        Ok(())
    }

    /// Installs caller-owned memory as the stream buffer. It is never freed here.
    ///
    /// # Errors
    /// [`crate::IoError::Region`] for an empty region,
    /// [`crate::IoError::OwnershipViolation`] if a buffer is already attached.
    pub fn attach_external(&mut self, region: ExternalRegion) -> Result<()> {
        const OP: &str = "attach_external";
        self.check_open(OP)?;
        if region.is_empty() {
            return Err(self.region_error(OP, RegionError::ZeroCapacity));
        }
        if self.buffer.is_some() {
            return Err(self.ownership(OP, "a buffer is already attached; release it first"));
        }
        self.install(Region::External(region));
        Ok(())
    }

    /// Makes sure the stream has a buffer serving reads.
    ///
    /// Without a buffer, allocates `default_capacity` bytes on the heap. With one,
    /// only adds the read role to the buffer. The stream's own access is not
    /// widened. Returns whether memory was allocated.
    pub fn ensure_read_buffer(&mut self, default_capacity: BufferSize) -> Result<bool> {
        const OP: &str = "ensure_read_buffer";
        self.check_open(OP)?;
        if self.buffer.is_some() {
            self.role = self.role.with(BufferRole::Read);
            return Ok(false);
        }
        let len = default_capacity.get(OP)?;
        let region =
            HeapRegion::allocate(&self.allocator, len).map_err(|e| self.region_error(OP, e))?;
        self.install(Region::Heap(region));
        self.role = self.role.with(BufferRole::Read);
        Ok(true)
    }

    /// Gives the buffers back according to their origin and clears them.
    ///
    /// Pending output is written first and unread read-ahead is discarded,
    /// rewinding seekable backends; if either fails nothing changes. After that
    /// the buffers are detached and then released. A failed unmap is reported,
    /// but the stream no longer holds the mapping and it is never unmapped
    /// again. Calling this on a stream without a buffer is a no-op.
    pub fn release(&mut self) -> Result<()> {
        const OP: &str = "release";
        if self.buffer.is_none() && self.outbound.is_none() {
            return Ok(());
        }
        self.flush_buffer(OP)?;
        self.discard_read_ahead(OP)?;

        let detached = self.detach_buffers();
        let mut first_error = None;
        for region in detached {
            let origin = region.origin();
            match region.release() {
                Ok(()) => debug!("Released {:?} buffer of {}", origin, self.name()),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), |e| Err(self.region_error(OP, e)))
    }

    /// Takes both buffers off the stream, output buffer first.
    pub(crate) fn detach_buffers(&mut self) -> Vec<Region> {
        self.outbound
            .take()
            .into_iter()
            .chain(self.buffer.take())
            .map(|buffer| buffer.region)
            .collect()
    }

    /// Checks whether a buffer of `origin` may be installed. `Ok(true)` means one
    /// already is.
    fn claim(&self, origin: BufferOrigin, op: &'static str) -> Result<bool> {
        match self.buffer_origin() {
            None => Ok(false),
            Some(current) if current == origin => Ok(true),
            Some(BufferOrigin::External) => {
                Err(self.ownership(op, "buffer is externally supplied"))
            }
            Some(BufferOrigin::SelfAllocated) => {
                Err(self.ownership(op, "buffer is heap-owned; release it first"))
            }
            Some(BufferOrigin::MemoryMapped) => {
                Err(self.ownership(op, "buffer is memory-mapped; release it first"))
            }
        }
    }

    pub(crate) fn install(&mut self, region: Region) {
        debug!(
            "Attached {:?} buffer of {} bytes to {}",
            region.origin(),
            region.len(),
            self.name()
        );
        self.buffer = Some(StreamBuffer::new(region));
    }
}
