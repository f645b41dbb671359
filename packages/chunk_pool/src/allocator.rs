//! Memory providers for containers that manage their own element storage.
//!
//! A container is written against [`ContainerAllocator`] and can then keep its nodes either in
//! the registry's default pool for the node type ([`PoolAllocator`]) or directly on the heap
//! ([`HeapAllocator`]).

use std::alloc::{self, Layout};
use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::rc::Rc;

use crate::error::Result;
use crate::{AllocationError, PoolRegistry, SharedFixedPool};

/// Hands out uninitialized storage for values of `T`.
///
/// A request for `count` values returns a pointer to the first slot. The remaining slots follow
/// at [`slot_stride()`](Self::slot_stride) byte intervals, which is not necessarily
/// `size_of::<T>()`. Containers that store more than one value per allocation must reach the
/// other slots through [`slot()`](Self::slot).
///
/// # Safety
///
/// Implementations must return storage that is aligned for `T`, valid for `count` slots laid out
/// as described above and that stays valid until it is passed to
/// [`deallocate()`](Self::deallocate) with the same `count`.
pub unsafe trait ContainerAllocator<T> {
    /// Allocates storage for `count` values.
    ///
    /// # Errors
    ///
    /// Returns [`AllocationError::EmptyBlock`] if `count` is zero and
    /// [`AllocationError::BlockTooLarge`] if `count` exceeds [`max_size()`](Self::max_size).
    fn allocate(&self, count: usize) -> Result<NonNull<T>>;

    /// Returns storage obtained from [`allocate()`](Self::allocate).
    ///
    /// # Safety
    ///
    /// `ptr` and `count` must be the result and argument of one earlier `allocate()` call on an
    /// equal allocator. Any values in the storage must already be destroyed.
    unsafe fn deallocate(&self, ptr: NonNull<T>, count: usize);

    /// The distance in bytes between consecutive slots of one allocation.
    fn slot_stride(&self) -> usize;

    /// The largest `count` that [`allocate()`](Self::allocate) can serve.
    fn max_size(&self) -> usize;

    /// Returns the slot at `index` of an allocation that starts at `first`.
    ///
    /// # Safety
    ///
    /// `first` must come from an allocation of more than `index` slots.
    unsafe fn slot(&self, first: NonNull<T>, index: usize) -> NonNull<T> {
        // Cannot overflow because the slot lies within an existing allocation.
        let offset = index.wrapping_mul(self.slot_stride());

        // SAFETY: The caller guarantees the slot lies within the allocation.
        unsafe { first.byte_add(offset) }
    }

    /// Moves `value` into the slot.
    ///
    /// # Safety
    ///
    /// `ptr` must be a slot of a live allocation that holds no value.
    unsafe fn construct(&self, ptr: NonNull<T>, value: T) {
        // SAFETY: The caller guarantees the slot is allocated and vacant.
        unsafe {
            ptr.write(value);
        }
    }

    /// Drops the value in the slot, leaving it vacant.
    ///
    /// # Safety
    ///
    /// `ptr` must be a slot of a live allocation that holds a value.
    unsafe fn destroy(&self, ptr: NonNull<T>) {
        // SAFETY: The caller guarantees the slot holds a value.
        unsafe {
            ptr.drop_in_place();
        }
    }
}

/// Keeps container storage in the default pool of a [`PoolRegistry`] for the element type.
///
/// Pool blocks never span chunks, so one allocation holds at most as many slots as a chunk has
/// entries. This suits node-based containers that allocate one element at a time; containers
/// that grow one large buffer will hit [`AllocationError::BlockTooLarge`].
///
/// Allocators that share a pool compare equal and may release each other's storage.
///
/// # Example
///
/// ```
/// use chunk_pool::{ContainerAllocator, PoolAllocator, PoolRegistry};
///
/// let registry = PoolRegistry::new();
/// let allocator = PoolAllocator::<u64>::new(&registry);
///
/// let slot = allocator.allocate(1).unwrap();
///
/// // SAFETY: The slot is allocated and vacant, then destroyed and returned exactly once.
/// unsafe {
///     allocator.construct(slot, 42);
///     assert_eq!(*slot.as_ref(), 42);
///     allocator.destroy(slot);
///     allocator.deallocate(slot, 1);
/// }
///
/// drop(allocator);
/// registry.deinit();
/// ```
pub struct PoolAllocator<T> {
    pool: SharedFixedPool,

    _item: PhantomData<fn() -> T>,
}

impl<T: 'static> PoolAllocator<T> {
    /// Creates an allocator that uses the registry's default pool for `T`.
    #[must_use]
    pub fn new(registry: &PoolRegistry) -> Self {
        Self {
            pool: registry.default_pool::<T>(),
            _item: PhantomData,
        }
    }

    /// Creates an allocator for another element type, backed by the registry's default pool
    /// for that type.
    ///
    /// Containers use this to turn an allocator for their elements into one for their nodes.
    #[must_use]
    #[expect(
        clippy::unused_self,
        reason = "called on an allocator to derive its counterpart for another type"
    )]
    pub fn rebind<U: 'static>(&self, registry: &PoolRegistry) -> PoolAllocator<U> {
        PoolAllocator::new(registry)
    }
}

impl<T> PoolAllocator<T> {
    /// The pool that backs this allocator.
    #[must_use]
    pub fn pool(&self) -> &SharedFixedPool {
        &self.pool
    }
}

// SAFETY: Pool blocks are aligned for the pool's item layout, which is the layout of `T` because
// the pool is the registry's default pool for `T`. Consecutive entries are one entry stride apart
// and stay allocated until returned via `deallocate_block()`.
unsafe impl<T> ContainerAllocator<T> for PoolAllocator<T> {
    fn allocate(&self, count: usize) -> Result<NonNull<T>> {
        self.pool
            .borrow_mut()
            .allocate_block(Layout::new::<T>(), count)
            .map(NonNull::cast)
    }

    unsafe fn deallocate(&self, ptr: NonNull<T>, count: usize) {
        // SAFETY: Forwarding the caller's guarantee that this block came from our pool.
        unsafe {
            self.pool.borrow_mut().deallocate_block(ptr.cast(), count);
        }
    }

    fn slot_stride(&self) -> usize {
        self.pool.borrow().entry_stride()
    }

    fn max_size(&self) -> usize {
        usize::from(self.pool.borrow().chunk_capacity().get())
    }
}

impl<T> Clone for PoolAllocator<T> {
    fn clone(&self) -> Self {
        Self {
            pool: Rc::clone(&self.pool),
            _item: PhantomData,
        }
    }
}

impl<T> PartialEq for PoolAllocator<T> {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.pool, &other.pool)
    }
}

impl<T> Eq for PoolAllocator<T> {}

impl<T> fmt::Debug for PoolAllocator<T> {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolAllocator")
            .field("item", &std::any::type_name::<T>())
            .field("pool", &self.pool.borrow().id())
            .finish()
    }
}

/// Keeps container storage directly on the heap, one contiguous array per allocation.
///
/// All heap allocators are interchangeable and compare equal.
pub struct HeapAllocator<T> {
    _item: PhantomData<fn() -> T>,
}

impl<T> HeapAllocator<T> {
    /// Creates a heap allocator.
    #[must_use]
    pub const fn new() -> Self {
        Self { _item: PhantomData }
    }
}

impl<T> Default for HeapAllocator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for HeapAllocator<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for HeapAllocator<T> {}

impl<T> PartialEq for HeapAllocator<T> {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

impl<T> Eq for HeapAllocator<T> {}

impl<T> fmt::Debug for HeapAllocator<T> {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapAllocator")
            .field("item", &std::any::type_name::<T>())
            .finish()
    }
}

// SAFETY: Storage comes from the global allocator as one `[T; count]` array, so slots are
// `size_of::<T>()` apart, and it is only released in `deallocate()`.
unsafe impl<T> ContainerAllocator<T> for HeapAllocator<T> {
    fn allocate(&self, count: usize) -> Result<NonNull<T>> {
        if count == 0 {
            return Err(AllocationError::EmptyBlock);
        }

        let Ok(layout) = Layout::array::<T>(count) else {
            return Err(AllocationError::BlockTooLarge {
                requested: count,
                capacity: self.max_size(),
            });
        };

        if layout.size() == 0 {
            return Ok(NonNull::dangling());
        }

        // SAFETY: The layout has a non-zero size.
        let raw = unsafe { alloc::alloc(layout) };

        Ok(NonNull::new(raw)
            .unwrap_or_else(|| alloc::handle_alloc_error(layout))
            .cast())
    }

    unsafe fn deallocate(&self, ptr: NonNull<T>, count: usize) {
        let layout = Layout::array::<T>(count)
            .expect("the layout was valid when the storage was allocated");

        if layout.size() == 0 {
            return;
        }

        // SAFETY: The caller guarantees the storage came from `allocate()` with this count,
        // which used this same layout.
        unsafe {
            alloc::dealloc(ptr.as_ptr().cast(), layout);
        }
    }

    fn slot_stride(&self) -> usize {
        size_of::<T>()
    }

    fn max_size(&self) -> usize {
        isize::MAX
            .unsigned_abs()
            .checked_div(size_of::<T>())
            .unwrap_or(usize::MAX)
    }
}
