//! Memory plan and planned tensors.
//!
//! Planned buffers are carved from one arena up front; every tensor with an
//! [`Allocation`] points into one of them. Everything else a method needs at
//! load or run time (constants, unplanned tensors, backend state, regrown
//! unbound tensors) comes from the method allocator.

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use kore_delegate::{Arena, ArenaSlice, DelegateError, DelegateTensor};
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::format::{align_up, Allocation, TensorShapeDynamism, PLAN_ALIGNMENT};
use crate::{EdgeError, Result};

/// Default size of the method allocator.
pub const DEFAULT_RUNTIME_ARENA_BYTES: usize = 4 << 20;

/// Planned buffers addressed by `(buffer_id, offset)`.
#[derive(Debug, Default)]
pub struct HierarchicalAllocator {
    buffers: Vec<Arc<ArenaSlice>>,
}

impl HierarchicalAllocator {
    pub fn new(buffers: Vec<ArenaSlice>) -> Self {
        Self { buffers: buffers.into_iter().map(Arc::new).collect() }
    }

    /// Carve one buffer per entry of `sizes` out of a fresh arena.
    pub fn with_sizes(sizes: &[usize]) -> Result<Self> {
        let total = sizes
            .iter()
            .try_fold(0usize, |acc, &s| {
                let padded = s.checked_add(PLAN_ALIGNMENT - 1).map(|_| align_up(s, PLAN_ALIGNMENT))?;
                acc.checked_add(padded)
            })
            .ok_or_else(|| EdgeError::program("planned buffer sizes overflow"))?;
        let arena = Arena::new(total);
        let buffers = sizes
            .iter()
            .map(|&s| arena.allocate(s))
            .collect::<kore_delegate::Result<Vec<_>>>()?;
        Ok(Self::new(buffers))
    }

    pub fn num_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn buffer_size(&self, buffer_id: usize) -> Option<usize> {
        self.buffers.get(buffer_id).map(|b| b.len())
    }

    /// Storage for `numel` f32 values at `allocation`.
    pub fn tensor_storage(&self, allocation: Allocation, numel: usize) -> Result<Storage> {
        let buffer = self.buffers.get(allocation.buffer_id).ok_or_else(|| {
            EdgeError::program(format!(
                "buffer {} out of range ({} planned buffers)",
                allocation.buffer_id,
                self.buffers.len()
            ))
        })?;
        let end = numel.checked_mul(4).and_then(|n| allocation.offset.checked_add(n));
        if allocation.offset % 4 != 0 || end.map_or(true, |end| end > buffer.len()) {
            return Err(EdgeError::program(format!(
                "{} values at offset {} do not fit buffer {} of {} bytes",
                numel,
                allocation.offset,
                allocation.buffer_id,
                buffer.len()
            )));
        }
        // SAFETY: the range was checked against the buffer above.
        let ptr = unsafe { buffer.as_ptr().add(allocation.offset) as *mut f32 };
        let ptr = NonNull::new(ptr).ok_or_else(|| EdgeError::program("null planned buffer"))?;
        Ok(Storage::Planned { _buffer: Arc::clone(buffer), ptr, capacity: numel })
    }
}

/// All memory one loaded method draws from.
#[derive(Debug)]
pub struct MemoryManager {
    method_allocator: Arena,
    planned_memory: HierarchicalAllocator,
}

impl MemoryManager {
    pub fn new(method_allocator: Arena, planned_memory: HierarchicalAllocator) -> Self {
        Self { method_allocator, planned_memory }
    }

    /// Plan for a method with the given buffer sizes and runtime arena size.
    pub fn for_plan(planned_buffer_sizes: &[usize], runtime_arena_bytes: usize) -> Result<Self> {
        let planned = HierarchicalAllocator::with_sizes(planned_buffer_sizes)?;
        debug!(
            buffers = planned.num_buffers(),
            runtime_arena_bytes, "created memory manager"
        );
        Ok(Self::new(Arena::new(runtime_arena_bytes), planned))
    }

    pub fn method_allocator(&self) -> &Arena {
        &self.method_allocator
    }

    pub fn planned_memory(&self) -> &HierarchicalAllocator {
        &self.planned_memory
    }
}

/// Backing memory of a [`Tensor`].
pub enum Storage {
    /// A region of a planned buffer. Planned regions of live tensors never
    /// overlap.
    Planned {
        _buffer: Arc<ArenaSlice>,
        ptr: NonNull<f32>,
        capacity: usize,
    },
    /// A dedicated allocation from the method allocator.
    Arena(ArenaSlice),
    /// Caller-owned memory, see [`crate::Method::set_output_data_ptr`].
    External { ptr: NonNull<f32>, capacity: usize },
}

// Each Storage owns its region exclusively, or holds it on loan from a
// caller that promised exclusive access.
unsafe impl Send for Storage {}

impl Storage {
    fn capacity(&self) -> usize {
        match self {
            Storage::Planned { capacity, .. } => *capacity,
            Storage::Arena(slice) => slice.len() / 4,
            Storage::External { capacity, .. } => *capacity,
        }
    }

    fn as_ptr(&self) -> NonNull<f32> {
        match self {
            Storage::Planned { ptr, .. } => *ptr,
            Storage::Arena(slice) => slice_ptr(slice),
            Storage::External { ptr, .. } => *ptr,
        }
    }
}

fn slice_ptr(slice: &ArenaSlice) -> NonNull<f32> {
    // Arena slices are never null; fall back to a dangling pointer for the
    // zero-capacity case only.
    NonNull::new(slice.as_ptr() as *mut f32).unwrap_or(NonNull::dangling())
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Storage::Planned { ptr, capacity, .. } => f
                .debug_struct("Planned")
                .field("ptr", ptr)
                .field("capacity", capacity)
                .finish(),
            Storage::Arena(slice) => f.debug_tuple("Arena").field(slice).finish(),
            Storage::External { ptr, capacity } => f
                .debug_struct("External")
                .field("ptr", ptr)
                .field("capacity", capacity)
                .finish(),
        }
    }
}

/// An f32 tensor living in method memory.
#[derive(Debug)]
pub struct Tensor {
    sizes: SmallVec<[usize; 4]>,
    dynamism: TensorShapeDynamism,
    storage: Storage,
    /// Where an unbound tensor allocates when it outgrows its storage.
    grow_from: Option<Arena>,
}

impl Tensor {
    pub fn new(sizes: &[usize], dynamism: TensorShapeDynamism, storage: Storage) -> Result<Self> {
        let numel = kore_kernels::numel(sizes);
        if numel > storage.capacity() {
            return Err(EdgeError::program(format!(
                "tensor {:?} needs {} values, storage holds {}",
                sizes,
                numel,
                storage.capacity()
            )));
        }
        Ok(Self { sizes: SmallVec::from_slice(sizes), dynamism, storage, grow_from: None })
    }

    /// Tensor with a dedicated allocation of `sizes` from `arena`.
    pub fn allocate(sizes: &[usize], dynamism: TensorShapeDynamism, arena: &Arena) -> Result<Self> {
        let slice = arena.allocate_f32(kore_kernels::numel(sizes))?;
        Self::new(sizes, dynamism, Storage::Arena(slice))
    }

    /// Let an unbound tensor regrow from `arena`.
    pub fn with_growth(mut self, arena: &Arena) -> Self {
        self.grow_from = Some(arena.clone());
        self
    }

    pub fn dynamism(&self) -> TensorShapeDynamism {
        self.dynamism
    }

    pub fn numel(&self) -> usize {
        kore_kernels::numel(&self.sizes)
    }

    /// Number of f32 values the storage can hold.
    pub fn capacity(&self) -> usize {
        self.storage.capacity()
    }

    pub fn as_f32(&self) -> &[f32] {
        // SAFETY: numel <= capacity is kept by `new`, `set_storage` and
        // `resize`, and the storage region is exclusive to this tensor.
        unsafe { std::slice::from_raw_parts(self.storage.as_ptr().as_ptr(), self.numel()) }
    }

    pub fn as_f32_mut(&mut self) -> &mut [f32] {
        // SAFETY: as for `as_f32`, with exclusive access through `&mut self`.
        unsafe { std::slice::from_raw_parts_mut(self.storage.as_ptr().as_ptr(), self.numel()) }
    }

    /// Replace the backing storage, keeping the current shape.
    pub(crate) fn set_storage(&mut self, storage: Storage) -> Result<()> {
        if self.numel() > storage.capacity() {
            return Err(EdgeError::invalid(format!(
                "tensor {:?} needs {} values, buffer holds {}",
                self.sizes.as_slice(),
                self.numel(),
                storage.capacity()
            )));
        }
        self.storage = storage;
        Ok(())
    }

    /// Copy `data` in after resizing to `sizes`.
    pub fn assign(&mut self, sizes: &[usize], data: &[f32]) -> Result<()> {
        if sizes.len() != self.sizes.len() {
            return Err(EdgeError::invalid(format!(
                "expected a rank {} tensor but given rank {}",
                self.sizes.len(),
                sizes.len()
            )));
        }
        self.resize(sizes)?;
        let dst = self.as_f32_mut();
        if dst.len() != data.len() {
            return Err(EdgeError::invalid(format!(
                "tensor of shape {:?} given {} values",
                sizes,
                data.len()
            )));
        }
        dst.copy_from_slice(data);
        Ok(())
    }
}

impl DelegateTensor for Tensor {
    fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    fn nbytes(&self) -> usize {
        self.numel() * 4
    }

    fn data_ptr(&mut self) -> NonNull<u8> {
        self.storage.as_ptr().cast()
    }

    fn resize(&mut self, sizes: &[usize]) -> kore_delegate::Result<()> {
        if sizes == self.sizes.as_slice() {
            return Ok(());
        }
        if sizes.len() != self.sizes.len() {
            return Err(DelegateError::unsupported(format!(
                "tensor rank can't change from {} to {}",
                self.sizes.len(),
                sizes.len()
            )));
        }
        let numel = kore_kernels::numel(sizes);
        match self.dynamism {
            TensorShapeDynamism::Static => {
                return Err(DelegateError::unsupported(format!(
                    "static tensor {:?} can't be resized to {:?}",
                    self.sizes.as_slice(),
                    sizes
                )));
            }
            TensorShapeDynamism::DynamicBound => {
                if numel > self.capacity() {
                    return Err(DelegateError::invalid(format!(
                        "{:?} exceeds the bound of {} values",
                        sizes,
                        self.capacity()
                    )));
                }
            }
            TensorShapeDynamism::DynamicUnbound => {
                if numel > self.capacity() {
                    if let Storage::External { capacity, .. } = self.storage {
                        return Err(DelegateError::invalid(format!(
                            "{:?} exceeds the caller buffer of {} values",
                            sizes, capacity
                        )));
                    }
                    let arena = self.grow_from.as_ref().ok_or_else(|| {
                        DelegateError::internal("unbound tensor has no allocator to grow from")
                    })?;
                    let slice = arena.allocate_f32(numel)?;
                    trace!(from = self.capacity(), to = numel, "regrew unbound tensor");
                    self.storage = Storage::Arena(slice);
                }
            }
        }
        self.sizes = SmallVec::from_slice(sizes);
        Ok(())
    }
}
