use std::fmt;
use std::io;

use conduit_io::platform::PlatformError;
use conduit_io::RegionError;
use thiserror::Error;

pub type Result<T, E = IoError> = std::result::Result<T, E>;

/// Small non-negative integer naming an open stream within one context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Descriptor(usize);

impl Descriptor {
    pub const STDIN: Self = Self(0);
    pub const STDOUT: Self = Self(1);
    pub const STDERR: Self = Self(2);
    /// Lowest descriptor handed out by `register`.
    pub const FIRST_USER: Self = Self(3);

    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> usize {
        self.0
    }

    /// Whether this descriptor is one of the three standard-stream slots.
    pub const fn is_reserved(self) -> bool {
        self.0 < Self::FIRST_USER.0
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Descriptor> for usize {
    fn from(d: Descriptor) -> usize {
        d.0
    }
}

fn subject(descriptor: &Option<Descriptor>) -> String {
    match descriptor {
        Some(d) => format!("descriptor {d}"),
        None => "unregistered stream".to_owned(),
    }
}

#[derive(Error, Debug)]
pub enum IoError {
    #[error("{op}: {source}")]
    Configuration {
        op: &'static str,
        #[source]
        source: PlatformError,
    },
    #[error("{op}: descriptor {descriptor} is not open")]
    NotOpen {
        descriptor: Descriptor,
        op: &'static str,
    },
    #[error("{op}: descriptor {descriptor} is already closed")]
    AlreadyClosed {
        descriptor: Descriptor,
        op: &'static str,
    },
    #[error("{op}: descriptor {descriptor} is reserved for a standard stream")]
    Reserved {
        descriptor: Descriptor,
        op: &'static str,
    },
    #[error("{op}: descriptor {descriptor} is in use by an outstanding borrow")]
    Busy {
        descriptor: Descriptor,
        op: &'static str,
    },
    #[error("{op} on {}: stream is closed", subject(.descriptor))]
    StreamClosed {
        descriptor: Option<Descriptor>,
        op: &'static str,
    },
    #[error("{op} on {}: {detail}", subject(.descriptor))]
    OwnershipViolation {
        descriptor: Option<Descriptor>,
        op: &'static str,
        detail: &'static str,
    },
    #[error("{op}: unbound buffer size used as a byte count")]
    SentinelMisuse { op: &'static str },
    #[error("{op}: I/O context is already initialized")]
    AlreadyInitialized { op: &'static str },
    #[error("{op}: I/O context is not initialized")]
    NotInitialized { op: &'static str },
    #[error("{op} on {}: {detail}", subject(.descriptor))]
    Unsupported {
        descriptor: Option<Descriptor>,
        op: &'static str,
        detail: &'static str,
    },
    #[error("{op} on {}: {source}", subject(.descriptor))]
    Backend {
        descriptor: Option<Descriptor>,
        op: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("{op} on {}: {source}", subject(.descriptor))]
    Region {
        descriptor: Option<Descriptor>,
        op: &'static str,
        #[source]
        source: RegionError,
    },
}

impl IoError {
    /// The operation that failed.
    pub fn op(&self) -> &'static str {
        match self {
            IoError::Configuration { op, .. }
            | IoError::NotOpen { op, .. }
            | IoError::AlreadyClosed { op, .. }
            | IoError::Reserved { op, .. }
            | IoError::Busy { op, .. }
            | IoError::StreamClosed { op, .. }
            | IoError::OwnershipViolation { op, .. }
            | IoError::SentinelMisuse { op }
            | IoError::AlreadyInitialized { op }
            | IoError::NotInitialized { op }
            | IoError::Unsupported { op, .. }
            | IoError::Backend { op, .. }
            | IoError::Region { op, .. } => op,
        }
    }

    /// The offending descriptor, when the failure concerns a registered stream.
    pub fn descriptor(&self) -> Option<Descriptor> {
        match self {
            IoError::NotOpen { descriptor, .. }
            | IoError::AlreadyClosed { descriptor, .. }
            | IoError::Reserved { descriptor, .. }
            | IoError::Busy { descriptor, .. } => Some(*descriptor),
            IoError::StreamClosed { descriptor, .. }
            | IoError::OwnershipViolation { descriptor, .. }
            | IoError::Unsupported { descriptor, .. }
            | IoError::Backend { descriptor, .. }
            | IoError::Region { descriptor, .. } => *descriptor,
            IoError::Configuration { .. }
            | IoError::SentinelMisuse { .. }
            | IoError::AlreadyInitialized { .. }
            | IoError::NotInitialized { .. } => None,
        }
    }

    /// True for failures reported by the OS or a backend, false for table and
    /// ownership problems detected by this layer.
    pub fn is_backend(&self) -> bool {
        matches!(self, IoError::Backend { .. } | IoError::Region { .. })
    }
}
