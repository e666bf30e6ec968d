//! Backend dispatch: the raw transfer layer beneath buffered streams.
//!
//! A backend moves bytes between the OS and caller memory and nothing else. It
//! owns no stream buffer and knows nothing about descriptors. Interrupted system
//! calls are retried here so the buffered layer only ever sees real failures.

use std::fmt;
use std::io::{self, Read, SeekFrom, Write};
use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Console,
    File,
    Socket,
    Memory,
}

/// A connection produced by [`Backend::accept`].
#[derive(Debug)]
pub struct Accepted {
    pub backend: Box<dyn Backend>,
    pub peer: Option<SocketAddr>,
}

/// OS-level transfer primitives for one stream.
pub trait Backend: fmt::Debug {
    fn kind(&self) -> BackendKind;

    /// Reads up to `buf.len()` bytes. `Ok(0)` means end of stream.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    fn seek(&mut self, _pos: SeekFrom) -> io::Result<u64> {
        Err(unsupported("seek"))
    }

    fn is_seekable(&self) -> bool {
        false
    }

    fn flush(&mut self) -> io::Result<()>;

    /// Releases the native resource. Later calls on a closed backend fail.
    fn close(&mut self) -> io::Result<()>;

    fn accept(&mut self) -> io::Result<Accepted> {
        Err(unsupported("accept"))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Err(unsupported("local_addr"))
    }

    /// Writes the whole of `buf`, retrying short writes.
    fn write_all(&mut self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            match self.write(buf) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => buf = &buf[n..],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Error for an operation the backend cannot perform.
pub fn unsupported(op: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        format!("{op} is not supported by this backend"),
    )
}

/// Error for an operation on a backend that was already closed.
pub fn closed(op: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, format!("{op} on a closed backend"))
}

/// Runs `f` until it returns something other than `Interrupted`.
pub fn retry_interrupted<T>(mut f: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    loop {
        match f() {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            result => return result,
        }
    }
}

/// The three process-wide standard streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StdStreamKind {
    Input,
    Output,
    Error,
}

impl StdStreamKind {
    /// The descriptor this stream occupies in every handle table.
    pub const fn fileno(self) -> usize {
        match self {
            StdStreamKind::Input => 0,
            StdStreamKind::Output => 1,
            StdStreamKind::Error => 2,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            StdStreamKind::Input => "stdin",
            StdStreamKind::Output => "stdout",
            StdStreamKind::Error => "stderr",
        }
    }
}

/// Portable backend over the process's standard streams.
///
/// Closing only flushes: the process keeps its descriptors.
#[derive(Debug)]
pub struct StdStream {
    kind: StdStreamKind,
    closed: bool,
}

impl StdStream {
    pub fn new(kind: StdStreamKind) -> Self {
        Self {
            kind,
            closed: false,
        }
    }

    pub fn stdin() -> Self {
        Self::new(StdStreamKind::Input)
    }

    pub fn stdout() -> Self {
        Self::new(StdStreamKind::Output)
    }

    pub fn stderr() -> Self {
        Self::new(StdStreamKind::Error)
    }

    pub fn stream_kind(&self) -> StdStreamKind {
        self.kind
    }

    fn check_open(&self, op: &str) -> io::Result<()> {
        if self.closed {
            Err(closed(op))
        } else {
            Ok(())
        }
    }
}

impl Backend for StdStream {
    fn kind(&self) -> BackendKind {
        BackendKind::Console
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.check_open("read")?;
        match self.kind {
            StdStreamKind::Input => retry_interrupted(|| io::stdin().lock().read(buf)),
            _ => Err(unsupported("read")),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.check_open("write")?;
        match self.kind {
            StdStreamKind::Output => retry_interrupted(|| io::stdout().lock().write(buf)),
            StdStreamKind::Error => retry_interrupted(|| io::stderr().lock().write(buf)),
            StdStreamKind::Input => Err(unsupported("write")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.kind {
            StdStreamKind::Output => io::stdout().flush(),
            StdStreamKind::Error => io::stderr().flush(),
            StdStreamKind::Input => Ok(()),
        }
    }

    fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.flush()?;
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Flaky {
        interruptions: usize,
        written: Vec<u8>,
    }

    impl Backend for Flaky {
        fn kind(&self) -> BackendKind {
            BackendKind::Memory
        }

        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }

        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.interruptions > 0 {
                self.interruptions -= 1;
                return Err(io::Error::from(io::ErrorKind::Interrupted));
            }
            // Short writes: one byte at a time.
            self.written.push(buf[0]);
            Ok(1)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }

        fn close(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn write_all_survives_interrupts_and_short_writes() {
        let mut backend = Flaky {
            interruptions: 3,
            written: Vec::new(),
        };
        backend.write_all(b"hello").unwrap();
        assert_eq!(backend.written, b"hello");
    }

    #[test]
    fn default_seek_and_accept_are_unsupported() {
        let mut backend = Flaky {
            interruptions: 0,
            written: Vec::new(),
        };
        assert_eq!(
            backend.seek(SeekFrom::Start(0)).unwrap_err().kind(),
            io::ErrorKind::Unsupported
        );
        assert_eq!(
            backend.accept().unwrap_err().kind(),
            io::ErrorKind::Unsupported
        );
    }

    #[test]
    fn retry_stops_on_real_error() {
        let mut calls = 0;
        let result: io::Result<()> = retry_interrupted(|| {
            calls += 1;
            if calls < 3 {
                Err(io::Error::from(io::ErrorKind::Interrupted))
            } else {
                Err(io::Error::from(io::ErrorKind::PermissionDenied))
            }
        });
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::PermissionDenied);
        assert_eq!(calls, 3);
    }

    #[test]
    fn std_stream_directions() {
        let mut input = StdStream::stdin();
        assert_eq!(input.write(b"x").unwrap_err().kind(), io::ErrorKind::Unsupported);
        let mut output = StdStream::stdout();
        assert_eq!(
            output.read(&mut [0u8; 1]).unwrap_err().kind(),
            io::ErrorKind::Unsupported
        );
        output.close().unwrap();
        assert_eq!(output.write(b"x").unwrap_err().kind(), io::ErrorKind::NotConnected);
        assert_eq!(StdStreamKind::Error.fileno(), 2);
    }
}
