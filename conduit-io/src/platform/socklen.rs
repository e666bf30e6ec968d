//! Socket address-length width.
//!
//! `accept`, `getpeername` and friends take a pointer to an address length whose
//! integer type differs between platforms. [`SockLen`] is bound exactly once, here,
//! and every backend allocates its length variable with this type. Call sites never
//! branch on the platform again.

use std::mem;

use super::PlatformError;

/// The integer type passed by pointer to `accept`-style calls.
#[cfg(unix)]
pub type SockLen = libc::socklen_t;

/// The integer type passed by pointer to `accept`-style calls.
#[cfg(not(unix))]
pub type SockLen = i32;

/// Whether the target exposes a native `socklen_t`.
pub const HAS_NATIVE_SOCKLEN: bool = cfg!(unix);

/// Where the resolved width came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SockLenSource {
    /// The platform's own `socklen_t`.
    Native,
    /// No native type; a signed 32-bit integer is used.
    PortableDefault,
}

/// Resolved width of [`SockLen`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketLengthWidth {
    bytes: usize,
    source: SockLenSource,
}

impl SocketLengthWidth {
    /// Width in bytes.
    #[inline]
    pub const fn bytes(self) -> usize {
        self.bytes
    }

    /// Width in bits.
    #[inline]
    pub const fn bits(self) -> usize {
        self.bytes * 8
    }

    #[inline]
    pub const fn source(self) -> SockLenSource {
        self.source
    }

    #[inline]
    pub const fn is_native(self) -> bool {
        matches!(self.source, SockLenSource::Native)
    }
}

const RESOLVED: SocketLengthWidth = SocketLengthWidth {
    bytes: mem::size_of::<SockLen>(),
    source: if HAS_NATIVE_SOCKLEN {
        SockLenSource::Native
    } else {
        SockLenSource::PortableDefault
    },
};

#[cfg(unix)]
const _: () = assert!(mem::size_of::<SockLen>() == mem::size_of::<libc::socklen_t>());

#[cfg(not(unix))]
const _: () = assert!(mem::size_of::<SockLen>() == mem::size_of::<i32>());

/// Returns the width every backend must use for address-length variables.
///
/// Pure and constant for the lifetime of the process.
#[inline]
pub const fn socket_length_width() -> SocketLengthWidth {
    RESOLVED
}

/// Returns the native width, or reports that the portable default is in use.
///
/// # Errors
/// Returns [`PlatformError::Unavailable`] when the platform has no `socklen_t`.
/// The fallback is still valid; the error exists so callers can surface it.
pub fn native_socket_length() -> Result<SocketLengthWidth, PlatformError> {
    if RESOLVED.is_native() {
        Ok(RESOLVED)
    } else {
        Err(PlatformError::Unavailable {
            capability: "socklen_t",
            fallback: "i32",
        })
    }
}

/// Size of `T` expressed as a [`SockLen`], for initialising `accept` length arguments.
///
/// # Panics
/// Panics at compile time (in const contexts) or at runtime if `T` is larger than
/// `SockLen` can describe. Socket address structures are at most a few hundred bytes.
#[inline]
pub const fn length_of<T>() -> SockLen {
    let size = mem::size_of::<T>();
    assert!(size <= i32::MAX as usize);
    size as SockLen
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn width_matches_alias() {
        let width = socket_length_width();
        assert_eq!(width.bytes(), mem::size_of::<SockLen>());
        assert_eq!(width.bits(), width.bytes() * 8);
    }

    #[test]
    fn width_is_constant() {
        let first = socket_length_width();
        for _ in 0..16 {
            assert_eq!(socket_length_width(), first);
        }
    }

    #[cfg(unix)]
    #[test]
    fn unix_uses_native_socklen() {
        assert_eq!(socket_length_width().source(), SockLenSource::Native);
        assert_eq!(socket_length_width().bytes(), mem::size_of::<libc::socklen_t>());
        assert!(native_socket_length().is_ok());
    }

    #[cfg(not(unix))]
    #[test]
    fn fallback_is_signed_32_bit() {
        assert_eq!(socket_length_width().bytes(), 4);
        assert!(matches!(
            native_socket_length(),
            Err(PlatformError::Unavailable { .. })
        ));
    }

    #[test]
    fn length_of_reports_struct_size() {
        assert_eq!(length_of::<[u8; 16]>() as usize, 16);
    }
}
