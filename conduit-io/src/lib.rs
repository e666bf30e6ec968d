//! Conduit I/O: the platform layer beneath buffered streams.
//!
//! This crate owns everything that touches the OS directly: buffer memory and
//! its origin, the socket-length width, and the reference backends for
//! standard streams, files and TCP sockets.

pub mod backend;
pub mod memory;
pub mod net;
pub mod platform;
pub mod storage;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

// Re-exports for easier access by conduit-core
pub use backend::{Accepted, Backend, BackendKind, StdStream, StdStreamKind};
pub use memory::{system_allocator, AllocatorRef, BufferOrigin, Region, RegionAllocator, RegionError};
pub use net::SocketBackend;
pub use platform::socklen::{socket_length_width, SockLen, SocketLengthWidth};
pub use storage::{FileBackend, OpenMode};
