//! Conduit core: uniform buffered streams over files, pipes and sockets.
//!
//! An [`IoContext`] owns one [`HandleTable`]. Descriptors 0, 1 and 2 hold the
//! standard streams from initialization to teardown; everything else is
//! registered at the lowest free descriptor. Each [`IoObject`] tracks where its
//! buffer memory came from so that memory is released exactly once, by the
//! party that owns it.

pub mod buffer;
pub mod context;
pub mod error;
pub mod object;
pub mod size;
pub mod table;

pub use buffer::{BufferFlags, BufferRole};
pub use context::{ContextConfig, IoContext, StdBackends, ASYNC_IO};
pub use error::{Descriptor, IoError, Result};
pub use object::IoObject;
pub use size::BufferSize;
pub use table::{HandleTable, IoHandle};

pub use conduit_io::{socket_length_width, BufferOrigin, OpenMode, SockLen, SocketLengthWidth};
