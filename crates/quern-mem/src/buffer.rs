//! Owned aligned byte buffers on top of the accounting allocator.
//!
//! Columnar operators and decoders should hold their payloads in an
//! [`AlignedBuf`] rather than calling the raw engine directly: construction
//! zero-fills, resizing re-runs the admission checks, and drop returns the
//! accounted bytes.

use std::ops::{Deref, DerefMut};
use std::ptr::{self, NonNull};
use std::slice;

use crate::allocator::Allocator;
use crate::error::Result;
use crate::source::{HeapMemory, RawMemory};

/// Owned, aligned, always-initialized byte buffer.
pub struct AlignedBuf<M: RawMemory = HeapMemory> {
    alloc: Allocator<M>,
    ptr: NonNull<u8>,
    len: usize,
    align: usize,
}

// SAFETY: the buffer exclusively owns its allocation, and the allocator
// handle is Send + Sync.
unsafe impl<M: RawMemory> Send for AlignedBuf<M> {}
// SAFETY: no interior mutability; &AlignedBuf only permits reads.
unsafe impl<M: RawMemory> Sync for AlignedBuf<M> {}

impl<M: RawMemory> AlignedBuf<M> {
    /// Allocate `len` zero-filled bytes aligned to `align`.
    pub fn new_zeroed(alloc: &Allocator<M>, len: usize, align: usize) -> Result<Self> {
        let ptr = alloc.allocate(len, align)?;
        if !alloc.clears_memory() && len > 0 {
            // SAFETY: the fresh allocation spans len bytes.
            unsafe { ptr::write_bytes(ptr.as_ptr(), 0, len) };
        }
        Ok(Self {
            alloc: alloc.clone(),
            ptr,
            len,
            align,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn alignment(&self) -> usize {
        self.align
    }

    /// Resize in place (possibly moving the backing memory). Growth runs the
    /// admission checks and the new tail comes back zeroed; shrinking always
    /// succeeds against the limits.
    pub fn resize(&mut self, new_len: usize) -> Result<()> {
        let old_len = self.len;
        // SAFETY: ptr/len/align always describe the live allocation.
        let new_ptr = unsafe {
            self.alloc
                .reallocate(self.ptr, old_len, new_len, self.align)?
        };
        self.ptr = new_ptr;
        self.len = new_len;
        if new_len > old_len && !self.alloc.clears_memory() {
            // SAFETY: the grown tail lies within the resized allocation.
            unsafe { ptr::write_bytes(new_ptr.as_ptr().add(old_len), 0, new_len - old_len) };
        }
        Ok(())
    }

    pub fn as_slice(&self) -> &[u8] {
        self
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self
    }
}

impl<M: RawMemory> Deref for AlignedBuf<M> {
    type Target = [u8];
    fn deref(&self) -> &Self::Target {
        // SAFETY: ptr is valid for len initialized bytes for the buffer's
        // lifetime (zero-filled at construction and on growth).
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl<M: RawMemory> DerefMut for AlignedBuf<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: as above, plus &mut self guarantees exclusive access.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl<M: RawMemory> Drop for AlignedBuf<M> {
    fn drop(&mut self) {
        // SAFETY: ptr/len/align describe the live allocation; the buffer is
        // never used afterwards.
        unsafe { self.alloc.deallocate(self.ptr, self.len, self.align) };
    }
}

impl<M: RawMemory> std::fmt::Debug for AlignedBuf<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuf")
            .field("len", &self.len)
            .field("align", &self.align)
            .finish()
    }
}
