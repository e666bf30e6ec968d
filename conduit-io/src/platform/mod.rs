//! Platform facts resolved once: the socket-length width and the page size.

pub mod socklen;

use std::sync::OnceLock;
use thiserror::Error;

pub use socklen::{socket_length_width, SockLen, SockLenSource, SocketLengthWidth};

/// Used when the OS refuses to report its page size.
const FALLBACK_PAGE_SIZE: usize = 4096;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    #[error("{capability} is not available on this platform; using {fallback}")]
    Unavailable {
        capability: &'static str,
        fallback: &'static str,
    },
}

/// Returns the system page size. Queried on first use, constant afterwards.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(query_page_size)
}

/// Rounds `len` up to a whole number of pages.
///
/// Returns `None` if the rounded length does not fit in `usize`.
pub fn round_to_pages(len: usize) -> Option<usize> {
    let page = page_size();
    len.checked_add(page - 1).map(|n| n / page * page)
}

#[cfg(unix)]
fn query_page_size() -> usize {
    // SAFETY: sysconf has no preconditions and only reads system configuration.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        log::warn!(
            "Failed to detect page size via sysconf. Fallback to {}.",
            FALLBACK_PAGE_SIZE
        );
        FALLBACK_PAGE_SIZE
    } else {
        size as usize
    }
}

#[cfg(not(unix))]
fn query_page_size() -> usize {
    FALLBACK_PAGE_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_stable_power_of_two() {
        let first = page_size();
        assert!(first.is_power_of_two());
        assert_eq!(first, page_size());
    }

    #[test]
    fn rounding_covers_partial_pages() {
        let page = page_size();
        assert_eq!(round_to_pages(0), Some(0));
        assert_eq!(round_to_pages(1), Some(page));
        assert_eq!(round_to_pages(page), Some(page));
        assert_eq!(round_to_pages(page + 1), Some(2 * page));
        assert_eq!(round_to_pages(usize::MAX), None);
    }
}
