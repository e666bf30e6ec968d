use std::fmt;

use crate::error::{IoError, Result};

/// Buffer capacity used when a context is not configured otherwise.
pub const DEFAULT_BUFFER_BYTES: usize = 4096;

/// Configured capacity of a stream buffer.
///
/// [`BufferSize::UNBOUND`] is a reserved value meaning "no fixed capacity"; a stream
/// configured with it is unbuffered. The sentinel is never a byte count: every
/// accessor that would use it as one fails with [`IoError::SentinelMisuse`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferSize(usize);

impl BufferSize {
    pub const UNBOUND: Self = Self(usize::MAX);
    pub const DEFAULT: Self = Self(DEFAULT_BUFFER_BYTES);

    /// A concrete size of `bytes`.
    ///
    /// # Errors
    /// `usize::MAX` is the sentinel's representation and is rejected.
    pub fn new(bytes: usize) -> Result<Self> {
        if bytes == usize::MAX {
            Err(IoError::SentinelMisuse { op: "BufferSize::new" })
        } else {
            Ok(Self(bytes))
        }
    }

    pub const fn is_unbound(self) -> bool {
        self.0 == usize::MAX
    }

    /// Capacity to allocate for buffered streams, or `None` for unbuffered ones
    /// (unbound or zero).
    pub const fn buffered_capacity(self) -> Option<usize> {
        if self.is_unbound() || self.0 == 0 {
            None
        } else {
            Some(self.0)
        }
    }

    /// The size as a byte count.
    ///
    /// # Errors
    /// [`IoError::SentinelMisuse`] if `self` is unbound.
    pub fn get(self, op: &'static str) -> Result<usize> {
        if self.is_unbound() {
            Err(IoError::SentinelMisuse { op })
        } else {
            Ok(self.0)
        }
    }
}

impl Default for BufferSize {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Debug for BufferSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unbound() {
            f.write_str("BufferSize::UNBOUND")
        } else {
            write!(f, "BufferSize({})", self.0)
        }
    }
}

impl fmt::Display for BufferSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unbound() {
            f.write_str("unbound")
        } else {
            write!(f, "{} bytes", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbound_is_never_a_byte_count() {
        let unbound = BufferSize::UNBOUND;
        assert!(matches!(unbound.get("t"), Err(IoError::SentinelMisuse { op: "t" })));
        assert_eq!(unbound.buffered_capacity(), None);
        assert_eq!(BufferSize::new(12).unwrap().get("t").unwrap(), 12);
    }

    #[test]
    fn sentinel_cannot_be_constructed_as_concrete() {
        assert!(matches!(
            BufferSize::new(usize::MAX),
            Err(IoError::SentinelMisuse { .. })
        ));
        assert!(BufferSize::new(usize::MAX - 1).unwrap().get("t").is_ok());
    }

    #[test]
    fn zero_means_unbuffered() {
        assert_eq!(BufferSize::new(0).unwrap().buffered_capacity(), None);
        assert_eq!(BufferSize::DEFAULT.buffered_capacity(), Some(DEFAULT_BUFFER_BYTES));
    }

    #[test]
    fn display() {
        assert_eq!(BufferSize::UNBOUND.to_string(), "unbound");
        assert_eq!(BufferSize::DEFAULT.to_string(), "4096 bytes");
    }
}
