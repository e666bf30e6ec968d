use std::fmt;
use std::io::{self, SeekFrom};
use std::net::SocketAddr;
use std::path::Path;

use conduit_io::memory::HeapRegion;
use conduit_io::net::{SocketBackend, DEFAULT_BACKLOG};
use conduit_io::{
    system_allocator, Accepted, AllocatorRef, Backend, BackendKind, FileBackend, OpenMode, Region,
    RegionError,
};
use log::{debug, warn};

use crate::buffer::{BufferRole, Fill, StreamBuffer};
use crate::error::{Descriptor, IoError, Result};
use crate::size::BufferSize;

/// Per-stream state: backend, buffer and bookkeeping.
///
/// `access` is the set of directions the stream permits and never changes.
/// `role` is the set of directions its buffer serves, reported by `classify`.
/// Bidirectional streams over backends that cannot seek (sockets, pipes) keep
/// output in a separate heap buffer so writes never disturb read-ahead.
///
/// Not synchronised. Callers serialise access to one object, which the
/// `Rc<RefCell<_>>` handles of a [`crate::HandleTable`] enforce per thread.
pub struct IoObject {
    name: String,
    pub(crate) descriptor: Option<Descriptor>,
    access: BufferRole,
    pub(crate) role: BufferRole,
    pub(crate) buffer: Option<StreamBuffer>,
    pub(crate) outbound: Option<StreamBuffer>,
    buffer_size: BufferSize,
    line_buffered: bool,
    pub(crate) allocator: AllocatorRef,
    backend: Box<dyn Backend>,
    closed: bool,
    eof: bool,
}

impl IoObject {
    /// Wraps `backend`. Buffers come from the process allocator and default to
    /// [`BufferSize::DEFAULT`]; nothing is allocated until first use.
    pub fn new(name: impl Into<String>, role: BufferRole, backend: Box<dyn Backend>) -> Self {
        Self {
            name: name.into(),
            descriptor: None,
            access: role,
            role,
            buffer: None,
            outbound: None,
            buffer_size: BufferSize::DEFAULT,
            line_buffered: false,
            allocator: system_allocator(),
            backend,
            closed: false,
            eof: false,
        }
    }

    pub fn with_allocator(mut self, allocator: AllocatorRef) -> Self {
        self.allocator = allocator;
        self
    }

    pub fn with_buffer_size(mut self, size: BufferSize) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn line_buffered(mut self, enabled: bool) -> Self {
        self.line_buffered = enabled;
        self
    }

    /// Opens a file stream.
    pub fn open_file(path: impl AsRef<Path>, mode: OpenMode) -> Result<Self> {
        let path = path.as_ref();
        let backend = FileBackend::open(path, mode).map_err(|source| IoError::Backend {
            descriptor: None,
            op: "open",
            source,
        })?;
        Ok(Self::new(
            path.display().to_string(),
            BufferRole::for_mode(mode),
            Box::new(backend),
        ))
    }

    /// Opens a listening TCP stream. Only [`IoObject::accept`] is valid on it.
    pub fn listen(addr: SocketAddr) -> Result<Self> {
        let backend =
            SocketBackend::listen(addr, DEFAULT_BACKLOG).map_err(|source| IoError::Backend {
                descriptor: None,
                op: "listen",
                source,
            })?;
        let name = match backend.local_addr() {
            Ok(local) => format!("listener:{local}"),
            Err(_) => format!("listener:{addr}"),
        };
        Ok(Self::new(name, BufferRole::Both, Box::new(backend)))
    }

    /// Opens a connected TCP stream.
    pub fn connect(addr: SocketAddr) -> Result<Self> {
        let backend = SocketBackend::connect(addr).map_err(|source| IoError::Backend {
            descriptor: None,
            op: "connect",
            source,
        })?;
        Ok(Self::new(format!("socket:{addr}"), BufferRole::Both, Box::new(backend)))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn descriptor(&self) -> Option<Descriptor> {
        self.descriptor
    }

    /// Directions the stream permits.
    pub fn access(&self) -> BufferRole {
        self.access
    }

    /// Directions the stream's buffer serves.
    pub fn role(&self) -> BufferRole {
        self.role
    }

    pub fn buffer_size(&self) -> BufferSize {
        self.buffer_size
    }

    pub fn is_line_buffered(&self) -> bool {
        self.line_buffered
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// True once a read has hit end of stream; cleared by a successful read or seek.
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Bytes written but not yet handed to the backend.
    pub fn pending_output(&self) -> usize {
        [&self.outbound, &self.buffer]
            .into_iter()
            .flatten()
            .map(|b| b.pending().len())
            .sum()
    }

    /// Bytes read ahead from the backend but not yet consumed.
    pub fn buffered_input(&self) -> usize {
        self.buffer.as_ref().map_or(0, |b| b.unread().len())
    }

    /// Reads up to `out.len()` bytes. `Ok(0)` means end of stream.
    ///
    /// Buffered read-ahead is served first. Requests at least as large as the
    /// buffer bypass it.
    pub fn read(&mut self, out: &mut [u8]) -> Result<usize> {
        const OP: &str = "read";
        self.check_readable(OP)?;
        if out.is_empty() {
            return Ok(0);
        }
        self.flush_buffer(OP)?;

        if let Some(buffer) = self.buffer.as_mut() {
            let n = buffer.copy_unread(out);
            if n > 0 {
                return Ok(n);
            }
        }

        let buffered = self.prepare_buffer(OP)?;
        let capacity = self.buffer.as_ref().map_or(0, StreamBuffer::capacity);
        if !buffered || out.len() >= capacity {
            let n = self.backend.read(out).map_err(|e| self.backend_error(OP, e))?;
            self.eof = n == 0;
            return Ok(n);
        }

        if self.fill_buffer(OP)? == 0 {
            return Ok(0);
        }
        Ok(self.buffer.as_mut().map_or(0, |b| b.copy_unread(out)))
    }

    /// Reads through the next `\n` (included) or to end of stream.
    pub fn read_line(&mut self) -> Result<Vec<u8>> {
        const OP: &str = "read_line";
        self.check_readable(OP)?;
        self.flush_buffer(OP)?;
        let mut line = Vec::new();

        if !self.prepare_buffer(OP)? {
            let mut byte = [0u8; 1];
            while self.read(&mut byte)? == 1 {
                line.push(byte[0]);
                if byte[0] == b'\n' {
                    break;
                }
            }
            return Ok(line);
        }

        loop {
            if self.buffered_input() == 0 && self.fill_buffer(OP)? == 0 {
                break;
            }
            let Some(buffer) = self.buffer.as_mut() else {
                break;
            };
            let unread = buffer.unread();
            match unread.iter().position(|&b| b == b'\n') {
                Some(i) => {
                    line.extend_from_slice(&unread[..=i]);
                    buffer.consume(i + 1);
                    break;
                }
                None => {
                    let n = unread.len();
                    line.extend_from_slice(unread);
                    buffer.consume(n);
                }
            }
        }
        Ok(line)
    }

    /// Returns the next byte without consuming it, or `None` at end of stream.
    ///
    /// # Errors
    /// [`IoError::Unsupported`] on unbuffered streams.
    pub fn peek(&mut self) -> Result<Option<u8>> {
        const OP: &str = "peek";
        self.check_readable(OP)?;
        self.flush_buffer(OP)?;
        if !self.prepare_buffer(OP)? {
            return Err(self.unsupported(OP, "stream is unbuffered"));
        }
        if self.buffered_input() == 0 && self.fill_buffer(OP)? == 0 {
            return Ok(None);
        }
        Ok(self
            .buffer
            .as_ref()
            .and_then(|b| b.unread().first().copied()))
    }

    /// Writes all of `data`, buffering when the stream is buffered.
    ///
    /// Returns `data.len()`. Line-buffered streams push everything up to the last
    /// newline through to the backend before returning.
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        const OP: &str = "write";
        self.check_open(OP)?;
        if !self.access.writable() {
            return Err(self.unsupported(OP, "stream is not writable"));
        }
        if data.is_empty() {
            return Ok(0);
        }

        let has_buffer = if self.is_duplex() {
            self.prepare_outbound(OP)?
        } else {
            self.discard_read_ahead(OP)?;
            self.prepare_buffer(OP)?
        };
        if !has_buffer {
            self.write_through(data, OP)?;
            return Ok(data.len());
        }

        let (direct, buffered) = match data.iter().rposition(|&b| b == b'\n') {
            Some(i) if self.line_buffered => data.split_at(i + 1),
            _ => (&data[..0], data),
        };
        if !direct.is_empty() {
            self.flush_buffer(OP)?;
            self.write_through(direct, OP)?;
        }
        self.buffer_output(buffered, OP)?;
        Ok(data.len())
    }

    /// Writes pending output and flushes the backend.
    pub fn flush(&mut self) -> Result<()> {
        const OP: &str = "flush";
        self.check_open(OP)?;
        self.flush_buffer(OP)?;
        self.backend.flush().map_err(|e| self.backend_error(OP, e))
    }

    /// Repositions the stream. Pending output is written first and read-ahead
    /// is dropped; `SeekFrom::Current` is relative to the caller's position.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        const OP: &str = "seek";
        self.check_open(OP)?;
        if !self.backend.is_seekable() {
            return Err(self.unsupported(OP, "stream is not seekable"));
        }
        self.flush_buffer(OP)?;
        let target = match pos {
            SeekFrom::Current(offset) => {
                let relative = i64::try_from(self.buffered_input())
                    .ok()
                    .and_then(|unread| offset.checked_sub(unread));
                match relative {
                    Some(relative) => SeekFrom::Current(relative),
                    None => {
                        let e = io::Error::new(
                            io::ErrorKind::InvalidInput,
                            "relative seek offset overflows",
                        );
                        return Err(self.backend_error(OP, e));
                    }
                }
            }
            other => other,
        };
        let position = self
            .backend
            .seek(target)
            .map_err(|e| self.backend_error(OP, e))?;
        if let Some(buffer) = self.buffer.as_mut() {
            buffer.fill = Fill::Empty;
        }
        self.eof = false;
        Ok(position)
    }

    /// Caller-visible position: backend position adjusted for buffered bytes.
    pub fn tell(&mut self) -> Result<u64> {
        const OP: &str = "tell";
        self.check_open(OP)?;
        if !self.backend.is_seekable() {
            return Err(self.unsupported(OP, "stream is not seekable"));
        }
        let position = self
            .backend
            .seek(SeekFrom::Current(0))
            .map_err(|e| self.backend_error(OP, e))?;
        Ok(position + self.pending_output() as u64 - self.buffered_input() as u64)
    }

    /// Changes the buffer size. The current buffer is released (after writing
    /// pending output); the next transfer allocates at the new size.
    /// [`BufferSize::UNBOUND`] or zero makes the stream unbuffered.
    pub fn set_buffer_size(&mut self, size: BufferSize) -> Result<()> {
        self.check_open("set_buffer_size")?;
        self.release()?;
        self.buffer_size = size;
        Ok(())
    }

    /// Accepts a connection on a listening stream.
    ///
    /// The new stream inherits this stream's allocator and buffer size.
    pub fn accept(&mut self) -> Result<(IoObject, Option<SocketAddr>)> {
        const OP: &str = "accept";
        self.check_open(OP)?;
        let Accepted { backend, peer } = self
            .backend
            .accept()
            .map_err(|e| self.backend_error(OP, e))?;
        let name = match peer {
            Some(peer) => format!("socket:{peer}"),
            None => "socket".to_owned(),
        };
        let object = IoObject::new(name, BufferRole::Both, backend)
            .with_allocator(self.allocator.clone())
            .with_buffer_size(self.buffer_size);
        Ok((object, peer))
    }

    /// Local address of a socket stream.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.check_open("local_addr")?;
        self.backend
            .local_addr()
            .map_err(|e| self.backend_error("local_addr", e))
    }

    /// Writes pending output, releases the buffers and closes the backend.
    ///
    /// If writing pending output fails the stream stays open and unchanged.
    /// Past that point the stream is closed and its buffers detached even when
    /// closing the backend or releasing memory fails; the first failure is
    /// returned.
    pub fn close(&mut self) -> Result<()> {
        const OP: &str = "close";
        self.check_open(OP)?;
        self.flush_buffer(OP)?;
        let detached = self.detach_buffers();
        self.closed = true;

        let closed = self.backend.close();
        let released = detached
            .into_iter()
            .map(Region::release)
            .fold(Ok(()), |acc, r| acc.and(r));
        closed.map_err(|e| self.backend_error(OP, e))?;
        released.map_err(|e| self.region_error(OP, e))?;
        debug!("Closed {}", self.name);
        Ok(())
    }

    pub(crate) fn check_open(&self, op: &'static str) -> Result<()> {
        if self.closed {
            Err(IoError::StreamClosed {
                descriptor: self.descriptor,
                op,
            })
        } else {
            Ok(())
        }
    }

    fn check_readable(&self, op: &'static str) -> Result<()> {
        self.check_open(op)?;
        if self.access.readable() {
            Ok(())
        } else {
            Err(self.unsupported(op, "stream is not readable"))
        }
    }

    /// Makes sure a buffer exists when the stream is buffered. Returns false for
    /// unbuffered streams without an attached buffer.
    fn prepare_buffer(&mut self, op: &'static str) -> Result<bool> {
        if self.buffer.is_some() {
            return Ok(true);
        }
        let Some(len) = self.buffer_size.buffered_capacity() else {
            return Ok(false);
        };
        let region =
            HeapRegion::allocate(&self.allocator, len).map_err(|e| self.region_error(op, e))?;
        self.install(Region::Heap(region));
        Ok(true)
    }

    fn is_duplex(&self) -> bool {
        self.access == BufferRole::Both && !self.backend.is_seekable()
    }

    /// Makes sure the separate output buffer of a duplex stream exists when the
    /// stream is buffered.
    fn prepare_outbound(&mut self, op: &'static str) -> Result<bool> {
        if self.outbound.is_some() {
            return Ok(true);
        }
        let Some(len) = self.buffer_size.buffered_capacity() else {
            return Ok(false);
        };
        let region =
            HeapRegion::allocate(&self.allocator, len).map_err(|e| self.region_error(op, e))?;
        debug!("Attached {} byte output buffer to {}", len, self.name);
        self.outbound = Some(StreamBuffer::new(Region::Heap(region)));
        Ok(true)
    }

    /// Refills an empty buffer from the backend. Returns the bytes read.
    fn fill_buffer(&mut self, op: &'static str) -> Result<usize> {
        let result = match self.buffer.as_mut() {
            Some(buffer) => self.backend.read(buffer.region.as_mut_slice()),
            None => return Ok(0),
        };
        let n = result.map_err(|e| self.backend_error(op, e))?;
        self.eof = n == 0;
        if let Some(buffer) = self.buffer.as_mut() {
            buffer.fill = if n == 0 {
                Fill::Empty
            } else {
                Fill::Read { pos: 0, end: n }
            };
        }
        Ok(n)
    }

    /// Hands pending output to the backend. A buffer whose write fails keeps
    /// its pending bytes.
    pub(crate) fn flush_buffer(&mut self, op: &'static str) -> Result<()> {
        for buffer in [self.outbound.as_mut(), self.buffer.as_mut()]
            .into_iter()
            .flatten()
        {
            if let Err(e) = buffer.drain_into(self.backend.as_mut()) {
                return Err(IoError::Backend {
                    descriptor: self.descriptor,
                    op,
                    source: e,
                });
            }
        }
        Ok(())
    }

    /// Drops unread read-ahead, moving seekable backends back to the caller's
    /// position first.
    pub(crate) fn discard_read_ahead(&mut self, op: &'static str) -> Result<()> {
        let unread = self.buffered_input();
        if unread > 0 && self.backend.is_seekable() {
            self.backend
                .seek(SeekFrom::Current(-(unread as i64)))
                .map_err(|e| self.backend_error(op, e))?;
        }
        if let Some(buffer) = self.buffer.as_mut() {
            if let Fill::Read { .. } = buffer.fill {
                buffer.fill = Fill::Empty;
            }
        }
        Ok(())
    }

    fn write_through(&mut self, data: &[u8], op: &'static str) -> Result<()> {
        self.backend
            .write_all(data)
            .map_err(|e| self.backend_error(op, e))
    }

    /// The buffer that collects output: the separate one if present.
    fn output_mut(&mut self) -> Option<&mut StreamBuffer> {
        match self.outbound {
            Some(ref mut outbound) => Some(outbound),
            None => self.buffer.as_mut(),
        }
    }

    fn buffer_output(&mut self, data: &[u8], op: &'static str) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let Some((pending, capacity)) = self
            .output_mut()
            .map(|buffer| (buffer.pending().len(), buffer.capacity()))
        else {
            return self.write_through(data, op);
        };
        if pending + data.len() > capacity {
            self.flush_buffer(op)?;
        }
        if data.len() >= capacity {
            return self.write_through(data, op);
        }
        if let Some(buffer) = self.output_mut() {
            buffer.append(data);
        }
        Ok(())
    }

    pub(crate) fn backend_error(&self, op: &'static str, source: io::Error) -> IoError {
        IoError::Backend {
            descriptor: self.descriptor,
            op,
            source,
        }
    }

    pub(crate) fn region_error(&self, op: &'static str, source: RegionError) -> IoError {
        IoError::Region {
            descriptor: self.descriptor,
            op,
            source,
        }
    }

    pub(crate) fn ownership(&self, op: &'static str, detail: &'static str) -> IoError {
        IoError::OwnershipViolation {
            descriptor: self.descriptor,
            op,
            detail,
        }
    }

    fn unsupported(&self, op: &'static str, detail: &'static str) -> IoError {
        IoError::Unsupported {
            descriptor: self.descriptor,
            op,
            detail,
        }
    }
}

impl fmt::Debug for IoObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoObject")
            .field("name", &self.name)
            .field("descriptor", &self.descriptor)
            .field("access", &self.access)
            .field("role", &self.role)
            .field("origin", &self.buffer_origin())
            .field("buffer_size", &self.buffer_size)
            .field("backend", &self.backend.kind())
            .field("closed", &self.closed)
            .finish()
    }
}

impl Drop for IoObject {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.flush_buffer("drop") {
            warn!("Discarding unflushed output of {}: {}", self.name, e);
        }
    }
}
