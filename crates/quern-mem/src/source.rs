//! Raw memory sources behind the accounting allocator.
//!
//! A source hands out raw byte buffers and knows nothing about limits or
//! trackers; [`crate::allocator::Allocator`] layers the checks and
//! bookkeeping on top. Three strategies exist: plain heap, page-mapped for
//! large requests, and a record-keeping wrapper used to validate that every
//! allocation is freed with the size it was allocated with.

use std::alloc::{self, Layout};
use std::collections::HashMap;
use std::ptr::{self, NonNull};
use std::sync::Mutex;

use once_cell::sync::Lazy;

use crate::error::{Error, Result};

/// Requests at or above this size go through `mmap` for the mapped source.
pub const MMAP_THRESHOLD: usize = 64 * 1024;

static PAGE_SIZE: Lazy<usize> = Lazy::new(|| {
    // SAFETY: sysconf has no memory-safety preconditions.
    let v = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if v <= 0 {
        4096
    } else {
        v as usize
    }
});

/// Capability interface for obtaining raw byte buffers.
///
/// `clear` requests zero-filled memory; `populate` requests pre-faulted
/// pages and is honored only by mapped ranges.
pub trait RawMemory: Clone + Send + Sync {
    /// Obtain `layout.size()` bytes aligned to `layout.align()`.
    ///
    /// Zero-sized layouts return a well-aligned dangling pointer without
    /// touching the underlying source.
    fn allocate(&self, layout: Layout, clear: bool, populate: bool) -> Result<NonNull<u8>>;

    /// Resize a buffer; the returned pointer may differ from `ptr`, and the
    /// old pointer must be considered dead either way. Contents up to
    /// `min(old, new)` bytes are preserved.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `allocate`/`resize` on this source
    /// with exactly `old_layout`, and must not be used again afterwards.
    unsafe fn resize(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
        clear: bool,
        populate: bool,
    ) -> Result<NonNull<u8>>;

    /// Return a buffer to the source.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `allocate`/`resize` on this source
    /// with exactly `layout`, and must not be used again afterwards.
    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout);
}

/// The address handed out for zero-sized requests.
fn dangling(layout: Layout) -> NonNull<u8> {
    // SAFETY: an alignment is never zero, so the pointer is never null.
    unsafe { NonNull::new_unchecked(layout.align() as *mut u8) }
}

// ---------------------------------------------------------------------------
// Heap strategy
// ---------------------------------------------------------------------------

/// Standard aligned heap allocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapMemory;

impl RawMemory for HeapMemory {
    fn allocate(&self, layout: Layout, clear: bool, _populate: bool) -> Result<NonNull<u8>> {
        if layout.size() == 0 {
            return Ok(dangling(layout));
        }
        // SAFETY: layout has non-zero size.
        let raw = unsafe {
            if clear {
                alloc::alloc_zeroed(layout)
            } else {
                alloc::alloc(layout)
            }
        };
        NonNull::new(raw).ok_or_else(|| {
            Error::AllocFailed(format!(
                "heap source returned null for {} bytes (alignment {})",
                layout.size(),
                layout.align()
            ))
        })
    }

    unsafe fn resize(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
        clear: bool,
        populate: bool,
    ) -> Result<NonNull<u8>> {
        if old_layout.size() == 0 {
            return self.allocate(new_layout, clear, populate);
        }
        if new_layout.size() == 0 {
            // SAFETY: forwarded caller contract.
            unsafe { self.free(ptr, old_layout) };
            return Ok(dangling(new_layout));
        }
        // SAFETY: caller guarantees ptr was allocated with old_layout;
        // realloc keeps the original alignment.
        let raw = unsafe { alloc::realloc(ptr.as_ptr(), old_layout, new_layout.size()) };
        let new_ptr = NonNull::new(raw).ok_or_else(|| {
            Error::AllocFailed(format!(
                "heap source failed to resize {} -> {} bytes",
                old_layout.size(),
                new_layout.size()
            ))
        })?;
        if clear && new_layout.size() > old_layout.size() {
            // realloc leaves the grown tail uninitialized.
            // SAFETY: the tail lies within the freshly resized buffer.
            unsafe {
                ptr::write_bytes(
                    new_ptr.as_ptr().add(old_layout.size()),
                    0,
                    new_layout.size() - old_layout.size(),
                );
            }
        }
        Ok(new_ptr)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() == 0 {
            return;
        }
        // SAFETY: forwarded caller contract.
        unsafe { alloc::dealloc(ptr.as_ptr(), layout) }
    }
}

// ---------------------------------------------------------------------------
// Page-mapped strategy
// ---------------------------------------------------------------------------

/// Virtual-memory mapping for requests at or above [`MMAP_THRESHOLD`],
/// falling back to the heap below it. Mapped ranges are page-aligned and
/// come back zeroed from the kernel.
#[derive(Debug, Clone, Copy, Default)]
pub struct MappedMemory;

impl MappedMemory {
    fn uses_mmap(layout: Layout) -> bool {
        layout.size() >= MMAP_THRESHOLD
    }
}

fn mmap_region(len: usize, populate: bool) -> Result<NonNull<u8>> {
    #[cfg(target_os = "linux")]
    let populate_flag = if populate { libc::MAP_POPULATE } else { 0 };
    #[cfg(not(target_os = "linux"))]
    let populate_flag = {
        let _ = populate;
        0
    };
    let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | populate_flag;
    // SAFETY: anonymous mapping, no fd, kernel picks the address.
    let raw = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            flags,
            -1,
            0,
        )
    };
    if raw == libc::MAP_FAILED {
        return Err(Error::AllocFailed(format!(
            "mmap of {len} bytes failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    NonNull::new(raw.cast::<u8>())
        .ok_or_else(|| Error::AllocFailed(format!("mmap of {len} bytes returned null")))
}

/// # Safety
///
/// `ptr`/`len` must describe a live mapping created by [`mmap_region`].
unsafe fn unmap_region(ptr: NonNull<u8>, len: usize) {
    // SAFETY: forwarded caller contract.
    let rc = unsafe { libc::munmap(ptr.as_ptr().cast(), len) };
    if rc != 0 {
        tracing::error!(len, error = %std::io::Error::last_os_error(), "munmap failed");
    }
}

#[cfg(target_os = "linux")]
unsafe fn remap_region(
    ptr: NonNull<u8>,
    old_len: usize,
    new_len: usize,
    _populate: bool,
) -> Result<NonNull<u8>> {
    // SAFETY: caller guarantees ptr maps old_len bytes. New pages arrive
    // zeroed, so a grow needs no explicit clear.
    let raw = unsafe {
        libc::mremap(
            ptr.as_ptr().cast(),
            old_len,
            new_len,
            libc::MREMAP_MAYMOVE,
        )
    };
    if raw == libc::MAP_FAILED {
        return Err(Error::AllocFailed(format!(
            "mremap {old_len} -> {new_len} bytes failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    NonNull::new(raw.cast::<u8>())
        .ok_or_else(|| Error::AllocFailed(format!("mremap to {new_len} bytes returned null")))
}

#[cfg(not(target_os = "linux"))]
unsafe fn remap_region(
    ptr: NonNull<u8>,
    old_len: usize,
    new_len: usize,
    populate: bool,
) -> Result<NonNull<u8>> {
    let new_ptr = mmap_region(new_len, populate)?;
    // SAFETY: both regions are live and disjoint.
    unsafe {
        ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), old_len.min(new_len));
        unmap_region(ptr, old_len);
    }
    Ok(new_ptr)
}

impl RawMemory for MappedMemory {
    fn allocate(&self, layout: Layout, clear: bool, populate: bool) -> Result<NonNull<u8>> {
        if !Self::uses_mmap(layout) {
            return HeapMemory.allocate(layout, clear, populate);
        }
        if layout.align() > *PAGE_SIZE {
            return Err(Error::AllocFailed(format!(
                "alignment {} exceeds the page size supported by mapped ranges",
                layout.align()
            )));
        }
        mmap_region(layout.size(), populate)
    }

    unsafe fn resize(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
        clear: bool,
        populate: bool,
    ) -> Result<NonNull<u8>> {
        match (Self::uses_mmap(old_layout), Self::uses_mmap(new_layout)) {
            // SAFETY blocks below forward the caller contract on ptr/old_layout.
            (false, false) => unsafe {
                HeapMemory.resize(ptr, old_layout, new_layout, clear, populate)
            },
            (true, true) => unsafe {
                remap_region(ptr, old_layout.size(), new_layout.size(), populate)
            },
            (false, true) => {
                let new_ptr = self.allocate(new_layout, clear, populate)?;
                // SAFETY: old buffer is live for old_layout.size() bytes and
                // the mapped range is at least as large.
                unsafe {
                    ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), old_layout.size());
                    HeapMemory.free(ptr, old_layout);
                }
                Ok(new_ptr)
            }
            (true, false) => {
                let new_ptr = HeapMemory.allocate(new_layout, clear, populate)?;
                // SAFETY: shrinking below the threshold, so new_layout.size()
                // bytes fit inside the old mapping.
                unsafe {
                    ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), new_layout.size());
                    unmap_region(ptr, old_layout.size());
                }
                Ok(new_ptr)
            }
        }
    }

    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout) {
        if Self::uses_mmap(layout) {
            // SAFETY: forwarded caller contract.
            unsafe { unmap_region(ptr, layout.size()) };
        } else {
            // SAFETY: forwarded caller contract.
            unsafe { HeapMemory.free(ptr, layout) };
        }
    }
}

// ---------------------------------------------------------------------------
// Record-keeping strategy (debug)
// ---------------------------------------------------------------------------

/// Outstanding allocations of [`RecordingMemory`]: address -> size.
static OUTSTANDING: Lazy<Mutex<HashMap<usize, usize>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// Heap source that records every live allocation in a global table, used to
/// validate that frees always carry the size they were allocated with and to
/// spot leaks in tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordingMemory;

impl RecordingMemory {
    /// Number of live recorded allocations.
    pub fn outstanding_len() -> usize {
        OUTSTANDING.lock().unwrap().len()
    }

    /// Total bytes across live recorded allocations.
    pub fn outstanding_bytes() -> usize {
        OUTSTANDING.lock().unwrap().values().sum()
    }

    /// Size recorded for a live allocation, if any.
    pub fn recorded_size(ptr: NonNull<u8>) -> Option<usize> {
        OUTSTANDING.lock().unwrap().get(&(ptr.as_ptr() as usize)).copied()
    }
}

impl RawMemory for RecordingMemory {
    fn allocate(&self, layout: Layout, clear: bool, populate: bool) -> Result<NonNull<u8>> {
        let ptr = HeapMemory.allocate(layout, clear, populate)?;
        if layout.size() > 0 {
            // Zero-sized buffers share the dangling address; never record them.
            OUTSTANDING
                .lock()
                .unwrap()
                .insert(ptr.as_ptr() as usize, layout.size());
        }
        Ok(ptr)
    }

    unsafe fn resize(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
        clear: bool,
        populate: bool,
    ) -> Result<NonNull<u8>> {
        // SAFETY: forwarded caller contract.
        let new_ptr = unsafe { HeapMemory.resize(ptr, old_layout, new_layout, clear, populate)? };
        // Old and new entry swap under one lock acquisition so no reader
        // observes the buffer twice or not at all.
        let mut table = OUTSTANDING.lock().unwrap();
        if old_layout.size() > 0 {
            table.remove(&(ptr.as_ptr() as usize));
        }
        if new_layout.size() > 0 {
            table.insert(new_ptr.as_ptr() as usize, new_layout.size());
        }
        Ok(new_ptr)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() > 0 {
            let removed = OUTSTANDING.lock().unwrap().remove(&(ptr.as_ptr() as usize));
            match removed {
                Some(recorded) if recorded == layout.size() => {}
                Some(recorded) => tracing::error!(
                    addr = ptr.as_ptr() as usize,
                    recorded,
                    freed = layout.size(),
                    "allocation freed with a size different from the recorded one"
                ),
                None => tracing::error!(
                    addr = ptr.as_ptr() as usize,
                    freed = layout.size(),
                    "freeing an allocation with no outstanding record"
                ),
            }
        }
        // SAFETY: forwarded caller contract.
        unsafe { HeapMemory.free(ptr, layout) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_respects_alignment() {
        let layout = Layout::from_size_align(64, 4096).unwrap();
        let ptr = HeapMemory.allocate(layout, false, false).unwrap();
        assert_eq!(ptr.as_ptr() as usize % 4096, 0);
        unsafe { HeapMemory.free(ptr, layout) };
    }

    #[test]
    fn zero_sized_requests_do_not_touch_the_source() {
        let layout = Layout::from_size_align(0, 8).unwrap();
        let ptr = HeapMemory.allocate(layout, true, false).unwrap();
        assert_eq!(ptr.as_ptr() as usize, 8);
        unsafe { HeapMemory.free(ptr, layout) };
    }

    #[test]
    fn heap_clear_zeroes_grown_tail() {
        let old = Layout::from_size_align(16, 8).unwrap();
        let new = Layout::from_size_align(64, 8).unwrap();
        let ptr = HeapMemory.allocate(old, true, false).unwrap();
        let ptr = unsafe { HeapMemory.resize(ptr, old, new, true, false).unwrap() };
        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 64) };
        assert!(bytes.iter().all(|&b| b == 0));
        unsafe { HeapMemory.free(ptr, new) };
    }
}
