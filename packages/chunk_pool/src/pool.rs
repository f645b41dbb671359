use std::alloc::Layout;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{self, AtomicU64};

use crate::entry::EntryHeader;
use crate::fatal::invariant;

/// Global counter for generating unique pool IDs.
static POOL_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a pool instance.
///
/// Every entry records the identity of the pool that allocated it, which is how a pool detects
/// pointers that belong to a different pool.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct PoolId(u64);

impl PoolId {
    pub(crate) fn generate() -> Self {
        Self(POOL_ID_COUNTER.fetch_add(1, atomic::Ordering::Relaxed))
    }

    #[cfg(test)]
    pub(crate) const fn for_tests(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pool#{}", self.0)
    }
}

/// The family a pool belongs to.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum PoolKind {
    /// A [`FixedPool`][crate::FixedPool], dispensing same-sized entries from chunks.
    Fixed,

    /// A [`GenericPool`][crate::GenericPool], performing one heap allocation per entry.
    Generic,
}

/// Untyped allocation capability shared by all pool kinds.
///
/// The returned pointers point at uninitialized memory of the requested layout. They stay valid
/// until handed back to [`deallocate()`](Self::deallocate) of the same pool or until the pool is
/// dropped. A pool must be empty when it is dropped.
///
/// For typed access see [`PoolExt`].
pub trait Pool {
    /// The family this pool belongs to.
    fn kind(&self) -> PoolKind;

    /// The unique identity of this pool.
    fn id(&self) -> PoolId;

    /// The number of allocated entries.
    fn len(&self) -> usize;

    /// Whether the pool has no allocated entries.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Allocates memory for one item of the given layout.
    ///
    /// # Panics
    ///
    /// Panics if the pool cannot serve items of this layout.
    fn allocate(&mut self, layout: Layout) -> NonNull<u8>;

    /// Returns an entry to the pool.
    ///
    /// # Panics
    ///
    /// Panics if the pointer does not belong to this pool, if the entry is already free or if a
    /// [`Ptr`][crate::Ptr] still references it.
    ///
    /// # Safety
    ///
    /// The caller must not access the memory after this call. Any value stored in the entry must
    /// already have been dropped or moved out.
    unsafe fn deallocate(&mut self, ptr: NonNull<u8>);

    /// Verifies that `ptr` is a live entry allocated by this pool.
    ///
    /// # Panics
    ///
    /// Panics if it is not.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by one of the pools of this crate. It does not need to be
    /// from this pool and does not need to be live.
    unsafe fn check_entry(&self, ptr: NonNull<u8>);
}

/// Typed object lifecycle on top of any [`Pool`].
pub trait PoolExt: Pool {
    /// Allocates an entry and moves `value` into it.
    ///
    /// # Example
    ///
    /// ```
    /// use chunk_pool::{FixedPool, PoolExt};
    ///
    /// let mut pool = FixedPool::builder().layout_of::<u64>().build();
    ///
    /// let item = pool.create(42_u64);
    ///
    /// // SAFETY: The item was created by this pool and is not used after this point.
    /// let value = unsafe { pool.take(item) };
    /// assert_eq!(value, 42);
    /// ```
    fn create<T>(&mut self, value: T) -> NonNull<T> {
        let ptr = self.allocate(Layout::new::<T>()).cast::<T>();

        // SAFETY: The pool returned memory sized and aligned for `T` that nobody else uses.
        unsafe {
            ptr.write(value);
        }

        ptr
    }

    /// Drops the object in place and returns its entry to the pool.
    ///
    /// Ownership is verified before the object is dropped.
    ///
    /// # Panics
    ///
    /// Panics if the entry does not belong to this pool or is still referenced by a
    /// [`Ptr`][crate::Ptr].
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`create()`](Self::create) of a pool of this crate and must point to a
    /// live `T`. The caller must not access the object after this call.
    unsafe fn destroy<T>(&mut self, ptr: NonNull<T>) {
        // SAFETY: Forwarding the caller's guarantee about the origin of the pointer.
        unsafe {
            self.check_entry(ptr.cast());
            ensure_unreferenced(ptr.cast());
        }

        // SAFETY: The caller guarantees a live `T`, which we drop exactly once here.
        unsafe {
            ptr.drop_in_place();
        }

        // SAFETY: The value has been dropped, ownership was verified above.
        unsafe {
            self.deallocate(ptr.cast());
        }
    }

    /// Moves the object out of the pool and returns its entry to the pool.
    ///
    /// # Panics
    ///
    /// Panics if the entry does not belong to this pool or is still referenced by a
    /// [`Ptr`][crate::Ptr].
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`create()`](Self::create) of a pool of this crate and must point to a
    /// live `T`. The caller must not access the entry after this call.
    #[must_use]
    unsafe fn take<T>(&mut self, ptr: NonNull<T>) -> T {
        // SAFETY: Forwarding the caller's guarantee about the origin of the pointer.
        unsafe {
            self.check_entry(ptr.cast());
            ensure_unreferenced(ptr.cast());
        }

        // SAFETY: The caller guarantees a live `T`. We move it out and never read it again.
        let value = unsafe { ptr.read() };

        // SAFETY: The value has been moved out, ownership was verified above.
        unsafe {
            self.deallocate(ptr.cast());
        }

        value
    }
}

impl<P: Pool + ?Sized> PoolExt for P {}

/// # Safety
///
/// `ptr` must be a live entry of one of the pools of this crate.
unsafe fn ensure_unreferenced(ptr: NonNull<u8>) {
    // SAFETY: Forwarding the caller's guarantee, the header is valid for reads.
    let header = unsafe { EntryHeader::from_data(ptr).as_ref() };

    invariant!(
        header.ref_count() == 0,
        "cannot drop an object that {} Ptr handles still reference",
        header.ref_count()
    );
}
