//! Process-local views over mapped channel memory.
//!
//! Cross-process structures are always named by byte offset (and, for the
//! buffer pool, by frame index); pointer values are meaningful only within
//! one mapping. A [`MemView`] resolves those offsets into typed pointers
//! for the current process, after validating that the span they name
//! actually fits the mapping. Untrusted offsets (anything read out of a
//! peer-written header) go through [`MemView::check_span`] first so the
//! caller can refuse them instead of faulting.

use core::mem::{align_of, size_of};
use core::ptr::NonNull;

/// A span that does not fit the mapping it was resolved against, or is
/// misaligned for its use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanError {
    /// Requested byte offset.
    pub offset: usize,
    /// Requested span length.
    pub bytes: usize,
    /// Mapping length the span was checked against.
    pub len: usize,
}

impl core::fmt::Display for SpanError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "span {}+{} does not fit mapping of {} bytes",
            self.offset, self.bytes, self.len
        )
    }
}

/// One process's view of a mapped byte range.
///
/// A view is plain data: it does not own the mapping and is freely
/// copyable. Whoever creates it keeps the mapping alive for as long as any
/// copy is in use.
#[derive(Clone, Copy)]
pub struct MemView {
    base: NonNull<u8>,
    len: usize,
}

unsafe impl Send for MemView {}
unsafe impl Sync for MemView {}

impl MemView {
    /// Wrap `len` bytes of mapped memory starting at `base`.
    ///
    /// # Safety
    ///
    /// `base` must be valid for reads and writes of `len` bytes for the
    /// lifetime of every copy of the view.
    #[inline]
    pub const unsafe fn new(base: NonNull<u8>, len: usize) -> Self {
        Self { base, len }
    }

    /// Mapping length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true for a zero-length view.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Base pointer of the mapping.
    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Check that `bytes` bytes at `offset` fall inside the mapping and
    /// that `offset` is a multiple of `align`.
    pub fn check_span(&self, offset: usize, bytes: usize, align: usize) -> Result<(), SpanError> {
        let err = SpanError {
            offset,
            bytes,
            len: self.len,
        };
        let end = offset.checked_add(bytes).ok_or(err)?;
        if end > self.len || !offset.is_multiple_of(align) {
            return Err(err);
        }
        Ok(())
    }

    /// Typed pointer to the `T` at `offset`.
    ///
    /// Panics when the `T` does not fit or `offset` is misaligned for it;
    /// untrusted offsets are validated with [`MemView::check_span`] before
    /// reaching this.
    #[inline]
    pub fn typed_at<T>(&self, offset: usize) -> NonNull<T> {
        self.check_span(offset, size_of::<T>(), align_of::<T>())
            .expect("typed span out of bounds");
        // Span checked above; base is non-null.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset) as *mut T) }
    }

    /// Pointer to the `index`-th `stride`-byte block of the array starting
    /// at `offset`. This is the frame-by-index addressing used for the
    /// buffer pool.
    #[inline]
    pub fn block_at(&self, offset: usize, stride: usize, index: u32) -> NonNull<u8> {
        let block = offset + index as usize * stride;
        self.check_span(block, stride, 1)
            .expect("block span out of bounds");
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(block)) }
    }
}

#[cfg(any(test, feature = "alloc"))]
mod heap {
    use core::ptr::NonNull;

    use super::MemView;

    #[repr(C, align(64))]
    #[derive(Clone, Copy)]
    struct CacheLine([u8; 64]);

    /// Heap backing with the alignment guarantees of a real mapping, for
    /// tests and single-process use of the shared structures.
    ///
    /// Storage is a vector of cache lines, so the base is 64-byte aligned
    /// and the memory stays put for the life of the value.
    pub struct HeapMem {
        lines: alloc::vec::Vec<CacheLine>,
        len: usize,
    }

    impl HeapMem {
        /// Allocate `size` zeroed bytes.
        pub fn zeroed(size: usize) -> Self {
            let lines = alloc::vec![CacheLine([0; 64]); size.div_ceil(64).max(1)];
            Self { lines, len: size }
        }

        /// A view of this allocation.
        #[inline]
        pub fn view(&self) -> MemView {
            let base = NonNull::new(self.lines.as_ptr() as *mut u8).expect("vec base");
            unsafe { MemView::new(base, self.len) }
        }

        /// Allocation size in bytes.
        #[inline]
        pub fn len(&self) -> usize {
            self.len
        }

        /// Returns true for a zero-length allocation.
        #[inline]
        pub fn is_empty(&self) -> bool {
            self.len == 0
        }
    }
}

#[cfg(any(test, feature = "alloc"))]
pub use heap::HeapMem;
