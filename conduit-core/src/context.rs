use std::mem;
use std::net::SocketAddr;
use std::path::Path;

use conduit_io::platform::socklen::native_socket_length;
use conduit_io::{
    socket_length_width, system_allocator, AllocatorRef, Backend, OpenMode, SocketLengthWidth,
    StdStream,
};
use log::{info, warn};

use crate::buffer::BufferRole;
use crate::error::{Descriptor, IoError, Result};
use crate::object::IoObject;
use crate::size::BufferSize;
use crate::table::{HandleTable, IoHandle};

/// Development flag for asynchronous I/O. Inert: streams stay synchronous.
pub const ASYNC_IO: bool = cfg!(feature = "async-devel");

/// Buffering policy applied to streams created through a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextConfig {
    /// Buffer size for files, sockets and standard input.
    pub default_buffer_size: BufferSize,
    /// Flush standard output at every newline.
    pub stdout_line_buffered: bool,
    /// Standard error is unbuffered unless configured otherwise.
    pub stderr_buffer_size: BufferSize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            default_buffer_size: BufferSize::DEFAULT,
            stdout_line_buffered: true,
            stderr_buffer_size: BufferSize::UNBOUND,
        }
    }
}

impl ContextConfig {
    pub fn buffer_size(mut self, size: BufferSize) -> Self {
        self.default_buffer_size = size;
        self
    }

    pub fn stdout_line_buffered(mut self, enabled: bool) -> Self {
        self.stdout_line_buffered = enabled;
        self
    }

    pub fn stderr_buffer_size(mut self, size: BufferSize) -> Self {
        self.stderr_buffer_size = size;
        self
    }
}

/// Backends installed in descriptors 0, 1 and 2.
#[derive(Debug)]
pub struct StdBackends {
    pub stdin: Box<dyn Backend>,
    pub stdout: Box<dyn Backend>,
    pub stderr: Box<dyn Backend>,
}

impl StdBackends {
    /// The process's own standard streams.
    pub fn process() -> Self {
        Self {
            stdin: Box::new(StdStream::stdin()),
            stdout: Box::new(StdStream::stdout()),
            stderr: Box::new(StdStream::stderr()),
        }
    }
}

#[derive(Debug)]
enum Lifecycle {
    Created,
    Running(HandleTable),
    ShutDown,
}

/// One runtime context's view of I/O: configuration plus its own handle table.
///
/// Contexts share nothing, so several can coexist in one process. A context is
/// confined to the thread that created it.
#[derive(Debug)]
pub struct IoContext {
    config: ContextConfig,
    allocator: AllocatorRef,
    state: Lifecycle,
}

impl IoContext {
    pub fn new(config: ContextConfig) -> Self {
        Self::with_allocator(config, system_allocator())
    }

    /// A context whose stream buffers all come from `allocator`.
    pub fn with_allocator(config: ContextConfig, allocator: AllocatorRef) -> Self {
        Self {
            config,
            allocator,
            state: Lifecycle::Created,
        }
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn allocator(&self) -> &AllocatorRef {
        &self.allocator
    }

    pub fn is_initialized(&self) -> bool {
        matches!(self.state, Lifecycle::Running(_))
    }

    /// Creates the handle table with the process's standard streams.
    ///
    /// # Errors
    /// [`IoError::AlreadyInitialized`] on any call after the first, including
    /// after teardown.
    pub fn initialize(&mut self) -> Result<()> {
        self.initialize_with(StdBackends::process())
    }

    /// Creates the handle table with caller-supplied standard-stream backends.
    pub fn initialize_with(&mut self, backends: StdBackends) -> Result<()> {
        const OP: &str = "initialize";
        if !matches!(self.state, Lifecycle::Created) {
            return Err(IoError::AlreadyInitialized { op: OP });
        }
        if let Err(e) = native_socket_length() {
            warn!("{}", IoError::Configuration { op: OP, source: e });
        }
        if ASYNC_IO {
            warn!("async-devel is enabled but asynchronous I/O is not implemented; streams stay synchronous");
        }

        let StdBackends {
            stdin,
            stdout,
            stderr,
        } = backends;
        let stdin = self.object("stdin", BufferRole::Read, stdin);
        let stdout = self
            .object("stdout", BufferRole::Write, stdout)
            .line_buffered(self.config.stdout_line_buffered);
        let stderr = self
            .object("stderr", BufferRole::Write, stderr)
            .with_buffer_size(self.config.stderr_buffer_size);
        self.state = Lifecycle::Running(HandleTable::new(stdin, stdout, stderr));

        let width = socket_length_width();
        info!(
            "I/O context initialized (buffer: {}, socket length: {} bytes, {:?})",
            self.config.default_buffer_size,
            width.bytes(),
            width.source()
        );
        Ok(())
    }

    /// Builds a stream that uses this context's allocator and buffer size.
    pub fn object(
        &self,
        name: impl Into<String>,
        role: BufferRole,
        backend: Box<dyn Backend>,
    ) -> IoObject {
        IoObject::new(name, role, backend)
            .with_allocator(self.allocator.clone())
            .with_buffer_size(self.config.default_buffer_size)
    }

    pub fn table(&self) -> Result<&HandleTable> {
        match &self.state {
            Lifecycle::Running(table) => Ok(table),
            _ => Err(IoError::NotInitialized { op: "table" }),
        }
    }

    pub fn table_mut(&mut self) -> Result<&mut HandleTable> {
        match &mut self.state {
            Lifecycle::Running(table) => Ok(table),
            _ => Err(IoError::NotInitialized { op: "table" }),
        }
    }

    pub fn register(&mut self, object: IoObject) -> Result<Descriptor> {
        Ok(self.table_mut()?.register(object))
    }

    pub fn lookup(&self, descriptor: Descriptor) -> Result<IoHandle> {
        self.table()?.lookup(descriptor)
    }

    pub fn unregister(&mut self, descriptor: Descriptor) -> Result<()> {
        self.table_mut()?.unregister(descriptor)
    }

    pub fn stdin(&self) -> Result<IoHandle> {
        Ok(self.table()?.stdin().clone())
    }

    pub fn stdout(&self) -> Result<IoHandle> {
        Ok(self.table()?.stdout().clone())
    }

    pub fn stderr(&self) -> Result<IoHandle> {
        Ok(self.table()?.stderr().clone())
    }

    /// Opens `path` and registers it.
    pub fn open(&mut self, path: impl AsRef<Path>, mode: OpenMode) -> Result<Descriptor> {
        self.table()?;
        let object = IoObject::open_file(path, mode)?
            .with_allocator(self.allocator.clone())
            .with_buffer_size(self.config.default_buffer_size);
        self.register(object)
    }

    /// Binds a listening socket and registers it.
    pub fn listen(&mut self, addr: SocketAddr) -> Result<Descriptor> {
        self.table()?;
        let object = IoObject::listen(addr)?
            .with_allocator(self.allocator.clone())
            .with_buffer_size(self.config.default_buffer_size);
        self.register(object)
    }

    /// Connects to `addr` and registers the stream.
    pub fn connect(&mut self, addr: SocketAddr) -> Result<Descriptor> {
        self.table()?;
        let object = IoObject::connect(addr)?
            .with_allocator(self.allocator.clone())
            .with_buffer_size(self.config.default_buffer_size);
        self.register(object)
    }

    /// Accepts one connection on the listener at `listener` and registers it.
    pub fn accept(&mut self, listener: Descriptor) -> Result<(Descriptor, Option<SocketAddr>)> {
        let handle = self.lookup(listener)?;
        let (object, peer) = handle
            .try_borrow_mut()
            .map_err(|_| IoError::Busy {
                descriptor: listener,
                op: "accept",
            })?
            .accept()?;
        Ok((self.register(object)?, peer))
    }

    /// Resolved socket-length width, identical for every context in the process.
    pub fn socket_length_width(&self) -> SocketLengthWidth {
        socket_length_width()
    }

    /// Flushes, releases and closes every stream, then drops the table.
    ///
    /// Idempotent once the context has shut down.
    ///
    /// # Errors
    /// [`IoError::NotInitialized`] if the context was never initialized; otherwise
    /// the first failure among the streams.
    pub fn teardown(&mut self) -> Result<()> {
        match mem::replace(&mut self.state, Lifecycle::ShutDown) {
            Lifecycle::Running(table) => table.teardown(),
            Lifecycle::ShutDown => Ok(()),
            Lifecycle::Created => {
                self.state = Lifecycle::Created;
                Err(IoError::NotInitialized { op: "teardown" })
            }
        }
    }
}

impl Default for IoContext {
    fn default() -> Self {
        Self::new(ContextConfig::default())
    }
}

impl Drop for IoContext {
    fn drop(&mut self) {
        if self.is_initialized() {
            if let Err(e) = self.teardown() {
                warn!("I/O context teardown failed: {}", e);
            }
        }
    }
}
