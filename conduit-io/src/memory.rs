use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fmt;
use std::io;
use std::ptr::NonNull;
use std::rc::Rc;
use std::slice;

use log::{debug, warn};
use thiserror::Error;

use crate::platform;

/// Alignment of heap-backed stream buffers (one cache line).
const BUFFER_ALIGN: usize = 64;

#[derive(Error, Debug)]
pub enum RegionError {
    #[error("buffer capacity must be non-zero")]
    ZeroCapacity,
    #[error("invalid buffer layout for {0} bytes")]
    InvalidLayout(usize),
    #[error("failed to allocate {0} bytes")]
    AllocationFailed(usize),
    #[error("failed to map {len} bytes: {source}")]
    MapFailed {
        len: usize,
        #[source]
        source: io::Error,
    },
    #[error("failed to unmap {len} bytes: {source}")]
    UnmapFailed {
        len: usize,
        #[source]
        source: io::Error,
    },
}

/// Where a stream buffer's memory came from, and therefore who releases it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferOrigin {
    /// Allocated by this layer; freed exactly once on release.
    SelfAllocated,
    /// Anonymous mapping created by this layer; unmapped on release.
    MemoryMapped,
    /// Supplied by the caller; never released here.
    External,
}

/// Source of buffer memory.
///
/// The system implementation uses the global allocator and anonymous mappings.
/// Tests substitute a counting implementation to observe release behaviour.
pub trait RegionAllocator: fmt::Debug {
    /// Allocates `len` zeroed bytes.
    fn allocate(&self, len: usize) -> Result<NonNull<u8>, RegionError>;

    /// Returns memory obtained from [`RegionAllocator::allocate`].
    ///
    /// # Safety
    /// `ptr` must have been returned by `allocate(len)` on this allocator and not freed since.
    unsafe fn free(&self, ptr: NonNull<u8>, len: usize);

    /// Maps `len` bytes of anonymous, private, read-write memory.
    /// `len` is already a whole number of pages.
    fn map(&self, len: usize) -> Result<NonNull<u8>, RegionError>;

    /// Removes a mapping created by [`RegionAllocator::map`].
    ///
    /// # Safety
    /// `ptr`/`len` must describe a live mapping returned by `map(len)` on this allocator.
    unsafe fn unmap(&self, ptr: NonNull<u8>, len: usize) -> Result<(), RegionError>;
}

/// Shared handle to the allocator a stream draws its buffers from.
pub type AllocatorRef = Rc<dyn RegionAllocator>;

/// Returns a handle to the process allocator.
pub fn system_allocator() -> AllocatorRef {
    Rc::new(SystemAllocator)
}

/// Global allocator plus `mmap`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

impl SystemAllocator {
    fn layout(len: usize) -> Result<Layout, RegionError> {
        if len == 0 {
            return Err(RegionError::ZeroCapacity);
        }
        Layout::from_size_align(len, BUFFER_ALIGN).map_err(|_| RegionError::InvalidLayout(len))
    }
}

impl RegionAllocator for SystemAllocator {
    fn allocate(&self, len: usize) -> Result<NonNull<u8>, RegionError> {
        let layout = Self::layout(len)?;
        // SAFETY: layout has a non-zero size, checked above.
        let ptr = unsafe { alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or(RegionError::AllocationFailed(len))
    }

    unsafe fn free(&self, ptr: NonNull<u8>, len: usize) {
        // The layout was valid when the block was allocated, so it is valid now.
        if let Ok(layout) = Self::layout(len) {
            // SAFETY: caller guarantees ptr came from allocate(len).
            unsafe { dealloc(ptr.as_ptr(), layout) };
        }
    }

    #[cfg(unix)]
    fn map(&self, len: usize) -> Result<NonNull<u8>, RegionError> {
        use nix::sys::mman::{mmap_anonymous, MapFlags, ProtFlags};
        use std::num::NonZeroUsize;

        let length = NonZeroUsize::new(len).ok_or(RegionError::ZeroCapacity)?;
        // SAFETY: a fresh private anonymous mapping with no address hint cannot alias
        // any existing memory.
        let ptr = unsafe {
            mmap_anonymous(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
            )
        }
        .map_err(|errno| RegionError::MapFailed {
            len,
            source: errno.into(),
        })?;
        Ok(ptr.cast())
    }

    #[cfg(not(unix))]
    fn map(&self, len: usize) -> Result<NonNull<u8>, RegionError> {
        Err(RegionError::MapFailed {
            len,
            source: io::Error::new(
                io::ErrorKind::Unsupported,
                "anonymous mappings are not available on this platform",
            ),
        })
    }

    #[cfg(unix)]
    unsafe fn unmap(&self, ptr: NonNull<u8>, len: usize) -> Result<(), RegionError> {
        // SAFETY: caller guarantees ptr/len describe a live mapping from map(len).
        unsafe { nix::sys::mman::munmap(ptr.cast(), len) }.map_err(|errno| {
            RegionError::UnmapFailed {
                len,
                source: errno.into(),
            }
        })
    }

    #[cfg(not(unix))]
    unsafe fn unmap(&self, _ptr: NonNull<u8>, len: usize) -> Result<(), RegionError> {
        Err(RegionError::UnmapFailed {
            len,
            source: io::Error::from(io::ErrorKind::Unsupported),
        })
    }
}

/// Buffer memory allocated by this layer. Freed exactly once, on drop.
#[derive(Debug)]
pub struct HeapRegion {
    ptr: NonNull<u8>,
    len: usize,
    allocator: AllocatorRef,
}

impl HeapRegion {
    /// Allocates `len` zeroed bytes from `allocator`.
    ///
    /// # Errors
    /// Fails if `len` is zero or the allocator is exhausted.
    pub fn allocate(allocator: &AllocatorRef, len: usize) -> Result<Self, RegionError> {
        let ptr = allocator.allocate(len)?;
        debug!("Allocated {} byte stream buffer", len);
        Ok(Self {
            ptr,
            len,
            allocator: Rc::clone(allocator),
        })
    }
}

impl Drop for HeapRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from allocator.allocate and this is the only release path.
        unsafe { self.allocator.free(self.ptr, self.len) };
        debug!("Freed {} byte stream buffer", self.len);
    }
}

/// Anonymous mapping owned by this layer. Unmapped once, either explicitly
/// through [`MappedRegion::unmap`] or on drop.
#[derive(Debug)]
pub struct MappedRegion {
    ptr: NonNull<u8>,
    len: usize,
    allocator: AllocatorRef,
    live: bool,
}

impl MappedRegion {
    /// Maps at least `len` bytes; the length is rounded up to whole pages.
    ///
    /// # Errors
    /// Fails if `len` is zero, overflows when rounded, or the mapping is refused.
    pub fn map(allocator: &AllocatorRef, len: usize) -> Result<Self, RegionError> {
        if len == 0 {
            return Err(RegionError::ZeroCapacity);
        }
        let rounded = platform::round_to_pages(len).ok_or(RegionError::InvalidLayout(len))?;
        let ptr = allocator.map(rounded)?;
        debug!("Mapped {} byte stream buffer", rounded);
        Ok(Self {
            ptr,
            len: rounded,
            allocator: Rc::clone(allocator),
            live: true,
        })
    }

    /// Unmaps the region, reporting failure.
    ///
    /// # Errors
    /// Returns [`RegionError::UnmapFailed`] if the OS rejects the unmap. The region is
    /// considered released either way and will not be unmapped again.
    pub fn unmap(mut self) -> Result<(), RegionError> {
        self.unmap_once()
    }

    fn unmap_once(&mut self) -> Result<(), RegionError> {
        if !self.live {
            return Ok(());
        }
        self.live = false;
        // SAFETY: the mapping is live (checked above) and was created by this allocator.
        unsafe { self.allocator.unmap(self.ptr, self.len) }?;
        debug!("Unmapped {} byte stream buffer", self.len);
        Ok(())
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        if let Err(e) = self.unmap_once() {
            warn!("Leaking stream buffer mapping: {}", e);
        }
    }
}

/// Caller-supplied buffer memory. Never freed by this layer.
#[derive(Debug)]
pub struct ExternalRegion {
    ptr: NonNull<u8>,
    len: usize,
}

impl ExternalRegion {
    /// Borrows `len` bytes at `ptr` as stream buffer memory.
    ///
    /// # Safety
    /// `ptr` must be valid for reads and writes of `len` bytes for as long as the
    /// region (or any stream holding it) exists, and nothing else may access that
    /// memory in the meantime.
    pub unsafe fn from_raw_parts(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len }
    }

    /// Borrows a leaked or static slice as stream buffer memory.
    pub fn from_static(buf: &'static mut [u8]) -> Self {
        let len = buf.len();
        Self {
            ptr: NonNull::from(buf).cast(),
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Memory behind a stream buffer, tagged by origin.
#[derive(Debug)]
pub enum Region {
    Heap(HeapRegion),
    Mapped(MappedRegion),
    External(ExternalRegion),
}

impl Region {
    pub fn origin(&self) -> BufferOrigin {
        match self {
            Region::Heap(_) => BufferOrigin::SelfAllocated,
            Region::Mapped(_) => BufferOrigin::MemoryMapped,
            Region::External(_) => BufferOrigin::External,
        }
    }

    pub fn len(&self) -> usize {
        self.raw_parts().1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        let (ptr, len) = self.raw_parts();
        // SAFETY: every variant holds memory valid for len bytes while the region lives;
        // the shared borrow of self prevents concurrent mutation.
        unsafe { slice::from_raw_parts(ptr.as_ptr(), len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let (ptr, len) = self.raw_parts();
        // SAFETY: as above; the exclusive borrow of self makes this the only access.
        unsafe { slice::from_raw_parts_mut(ptr.as_ptr(), len) }
    }

    /// Gives the memory back according to its origin.
    ///
    /// Heap regions are freed, mappings are unmapped, external regions are
    /// forgotten without touching the memory. Consuming `self` makes a second
    /// release unrepresentable.
    ///
    /// # Errors
    /// Only an unmap can fail; see [`MappedRegion::unmap`].
    pub fn release(self) -> Result<(), RegionError> {
        match self {
            Region::Heap(heap) => {
                drop(heap);
                Ok(())
            }
            Region::Mapped(mapped) => mapped.unmap(),
            Region::External(_) => Ok(()),
        }
    }

    fn raw_parts(&self) -> (NonNull<u8>, usize) {
        match self {
            Region::Heap(r) => (r.ptr, r.len),
            Region::Mapped(r) => (r.ptr, r.len),
            Region::External(r) => (r.ptr, r.len),
        }
    }
}
