//! Arena allocator for persistent backend state and planned memory.
//!
//! Pre-allocates a single contiguous block and bump-allocates from it. There
//! is no per-allocation free. Every [`ArenaSlice`] shares ownership of the
//! block, so memory handed to a compiled backend stays valid for as long as
//! the backend holds on to it, even if the `Arena` handle itself is dropped.

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{DelegateError, Result};

/// Allocation alignment, wide enough for SIMD loads.
pub const ARENA_ALIGN: usize = 16;

struct Block {
    ptr: NonNull<u8>,
    layout: Layout,
    capacity: usize,
    offset: Mutex<usize>,
}

// The block is only written through disjoint `ArenaSlice` regions.
unsafe impl Send for Block {}
unsafe impl Sync for Block {}

impl Drop for Block {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// A bump-pointer arena with shared ownership of its backing block.
///
/// Cloning an `Arena` yields another handle to the same block.
#[derive(Clone)]
pub struct Arena {
    block: Arc<Block>,
}

impl Arena {
    /// Create an arena with the given capacity in bytes.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.min(isize::MAX as usize - ARENA_ALIGN);
        let size = capacity.max(ARENA_ALIGN);
        let layout = match Layout::from_size_align(size, ARENA_ALIGN) {
            Ok(layout) => layout,
            Err(_) => Layout::new::<[u128; 1]>(),
        };
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = match NonNull::new(raw) {
            Some(ptr) => ptr,
            None => alloc::handle_alloc_error(layout),
        };
        Self {
            block: Arc::new(Block { ptr, layout, capacity, offset: Mutex::new(0) }),
        }
    }

    /// Allocate `nbytes`, 16-byte aligned.
    /// Fails with `OutOfMemory` when the arena is exhausted.
    pub fn allocate(&self, nbytes: usize) -> Result<ArenaSlice> {
        let mut offset = self.block.offset.lock();
        let aligned = align_up(*offset, ARENA_ALIGN);
        let end = aligned
            .checked_add(nbytes)
            .filter(|&end| end <= self.block.capacity)
            .ok_or(DelegateError::OutOfMemory {
                requested: nbytes,
                available: self.block.capacity.saturating_sub(aligned),
            })?;
        *offset = end;

        // aligned <= capacity <= layout.size(), so the pointer stays in bounds.
        let ptr = unsafe { NonNull::new_unchecked(self.block.ptr.as_ptr().add(aligned)) };
        Ok(ArenaSlice { _block: Arc::clone(&self.block), ptr, len: nbytes })
    }

    /// Allocate space for `n` f32 values.
    pub fn allocate_f32(&self, n: usize) -> Result<ArenaSlice> {
        let nbytes = n.checked_mul(4).ok_or(DelegateError::OutOfMemory {
            requested: usize::MAX,
            available: self.remaining(),
        })?;
        self.allocate(nbytes)
    }

    /// Reset the arena for reuse. Does not deallocate.
    ///
    /// Only possible while no other handle or slice shares the block;
    /// returns `false` otherwise.
    pub fn reset(&mut self) -> bool {
        match Arc::get_mut(&mut self.block) {
            Some(block) => {
                *block.offset.get_mut() = 0;
                true
            }
            None => false,
        }
    }

    /// Current bytes used.
    pub fn used(&self) -> usize {
        *self.block.offset.lock()
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.block.capacity
    }

    /// Remaining bytes available.
    pub fn remaining(&self) -> usize {
        self.block.capacity.saturating_sub(self.used())
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("used", &self.used())
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// A region carved out of an [`Arena`].
///
/// Regions never overlap, so each slice has exclusive access to its bytes.
pub struct ArenaSlice {
    _block: Arc<Block>,
    ptr: NonNull<u8>,
    len: usize,
}

unsafe impl Send for ArenaSlice {}
unsafe impl Sync for ArenaSlice {}

impl ArenaSlice {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// View as f32 values. The start is 16-byte aligned; trailing bytes
    /// that do not fill a whole f32 are ignored.
    pub fn as_f32(&self) -> &[f32] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr() as *const f32, self.len / 4) }
    }

    pub fn as_f32_mut(&mut self) -> &mut [f32] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr() as *mut f32, self.len / 4) }
    }
}

impl fmt::Debug for ArenaSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArenaSlice")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

pub(crate) fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_alloc() {
        let arena = Arena::new(1024);
        let s = arena.allocate(100).unwrap();
        assert_eq!(s.len(), 100);
        assert!(arena.used() >= 100);
    }

    #[test]
    fn test_allocate_f32() {
        let arena = Arena::new(1024);
        let mut s = arena.allocate_f32(10).unwrap();
        assert_eq!(s.as_f32().len(), 10);
        s.as_f32_mut()[0] = 42.0;
        assert_eq!(s.as_f32()[0], 42.0);
    }

    #[test]
    fn test_exhaustion() {
        let arena = Arena::new(64);
        assert!(arena.allocate(32).is_ok());
        let err = arena.allocate(64).unwrap_err();
        assert_eq!(err, DelegateError::OutOfMemory { requested: 64, available: 32 });
    }

    #[test]
    fn test_alignment() {
        let arena = Arena::new(1024);
        let _one = arena.allocate(1).unwrap();
        let s = arena.allocate_f32(1).unwrap();
        assert_eq!(s.as_ptr() as usize % ARENA_ALIGN, 0, "f32 alloc not aligned");
    }

    #[test]
    fn test_regions_do_not_overlap() {
        let arena = Arena::new(256);
        let mut a = arena.allocate(16).unwrap();
        let mut b = arena.allocate(16).unwrap();
        a.as_bytes_mut().fill(1);
        b.as_bytes_mut().fill(2);
        assert!(a.as_bytes().iter().all(|&v| v == 1));
        assert!(b.as_bytes().iter().all(|&v| v == 2));
    }

    #[test]
    fn test_reset_requires_unique_owner() {
        let mut arena = Arena::new(256);
        let slice = arena.allocate(200).unwrap();
        assert!(!arena.reset());
        drop(slice);
        assert!(arena.reset());
        assert_eq!(arena.used(), 0);
        arena.allocate(200).unwrap();
    }

    #[test]
    fn test_slice_outlives_arena_handle() {
        let arena = Arena::new(64);
        let mut slice = arena.allocate_f32(4).unwrap();
        drop(arena);
        slice.as_f32_mut().copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(slice.as_f32(), &[1.0, 2.0, 3.0, 4.0]);
    }
}
