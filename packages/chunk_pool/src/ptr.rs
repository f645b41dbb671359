use std::fmt;
use std::ops::Deref;
use std::ptr::NonNull;

use crate::entry::EntryHeader;
use crate::fatal;
use crate::{Pool, PoolExt};

/// A reference-counted handle to an object allocated from one of the pools of this crate.
///
/// The reference count lives in the entry header of the object, next to the object itself.
/// Cloning a handle increments it, dropping a handle decrements it. Dropping the last handle
/// does not free the object: objects are destroyed explicitly via [`destroy()`](Self::destroy),
/// which insists on being called through the only remaining handle. A pool also refuses to free
/// an entry that handles still reference. Together, these checks turn dangling handles into
/// immediate, descriptive panics.
///
/// A handle is either null or bound to an object. Access goes through [`Deref`], which panics
/// on a null handle, or through [`get()`](Self::get).
///
/// # Example
///
/// ```
/// use chunk_pool::{FixedPool, PoolExt, Ptr};
///
/// let mut pool = FixedPool::builder().layout_of::<String>().build();
///
/// // SAFETY: The object was just created by the pool and is live.
/// let mut a = unsafe { Ptr::from_raw(pool.create("hello".to_string())) };
/// let b = a.clone();
/// assert_eq!(a.ref_count(), 2);
/// assert_eq!(&*b, "hello");
///
/// drop(b);
/// a.destroy(&mut pool);
///
/// assert!(a.is_null());
/// assert!(pool.is_empty());
/// ```
///
/// # Thread safety
///
/// The handle is single-threaded. It is neither [`Send`] nor [`Sync`].
pub struct Ptr<T> {
    ptr: Option<NonNull<T>>,
}

impl<T> Ptr<T> {
    /// Creates a handle that does not reference any object.
    #[must_use]
    pub const fn null() -> Self {
        Self { ptr: None }
    }

    /// Creates a handle to a pool-allocated object, incrementing its reference count.
    ///
    /// # Panics
    ///
    /// Panics if the entry is not allocated.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a live, initialized `T` that was allocated by one of the pools of this
    /// crate. The object must outlive every handle that references it.
    #[must_use]
    pub unsafe fn from_raw(ptr: NonNull<T>) -> Self {
        // SAFETY: Forwarding the caller's guarantee.
        unsafe {
            acquire(ptr);
        }

        Self { ptr: Some(ptr) }
    }

    /// Rebinds the handle to another object, or to nothing.
    ///
    /// The previous target loses a reference and the new one gains one. Rebinding to the
    /// current target leaves the reference count unchanged.
    ///
    /// # Safety
    ///
    /// Same as [`from_raw()`](Self::from_raw) when `ptr` is `Some`.
    pub unsafe fn assign_raw(&mut self, ptr: Option<NonNull<T>>) {
        if self.ptr == ptr {
            return;
        }

        if let Some(ptr) = ptr {
            // SAFETY: Forwarding the caller's guarantee.
            unsafe {
                acquire(ptr);
            }
        }

        self.release();
        self.ptr = ptr;
    }

    /// Releases the referenced object, if any, leaving the handle null.
    pub fn set_null(&mut self) {
        self.release();
        self.ptr = None;
    }

    /// Whether the handle references no object.
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.ptr.is_none()
    }

    /// The number of handles referencing the same object, 0 for a null handle.
    #[must_use]
    pub fn ref_count(&self) -> u32 {
        self.ptr.map_or(0, |ptr| {
            // SAFETY: A bound handle keeps its object alive, so the header is readable.
            unsafe { header_of(ptr).as_ref() }.ref_count()
        })
    }

    /// A reference to the object, or `None` for a null handle.
    #[must_use]
    pub fn get(&self) -> Option<&T> {
        // SAFETY: A bound handle keeps its object alive and only hands out shared references.
        self.ptr.map(|ptr| unsafe { ptr.as_ref() })
    }

    /// Destroys the referenced object and returns its entry to `pool`, leaving the handle null.
    /// Does nothing for a null handle.
    ///
    /// # Panics
    ///
    /// Panics if the object does not belong to `pool` or if any other handle references it,
    /// because those handles would dangle.
    pub fn destroy<P: Pool + ?Sized>(&mut self, pool: &mut P) {
        drop(self.take(pool));
    }

    /// Moves the referenced object out of `pool`, returning its entry to the pool and leaving the
    /// handle null. Returns `None` for a null handle.
    ///
    /// This is [`destroy()`](Self::destroy) without dropping the object, which lets the caller
    /// drop it after releasing any borrow of the pool.
    ///
    /// # Panics
    ///
    /// Panics if the object does not belong to `pool` or if any other handle references it,
    /// because those handles would dangle.
    #[must_use]
    pub fn take<P: Pool + ?Sized>(&mut self, pool: &mut P) -> Option<T> {
        let ptr = self.ptr?;

        // SAFETY: A bound handle keeps its object alive, so the header is readable.
        unsafe {
            pool.check_entry(ptr.cast());
        }

        self.forget_last_reference(ptr);

        // SAFETY: We verified that the pool owns the object and that no other handle can reach
        // it, and this handle no longer references it.
        Some(unsafe { pool.take(ptr) })
    }

    fn forget_last_reference(&mut self, ptr: NonNull<T>) {
        // SAFETY: A bound handle keeps its object alive, so the header is valid.
        unsafe { header_of(ptr).as_mut() }.forget_last_reference();

        self.ptr = None;
    }

    fn release(&mut self) {
        if let Some(ptr) = self.ptr {
            // SAFETY: A bound handle keeps its object alive, so the header is valid.
            unsafe { header_of(ptr).as_mut() }.release();
        }
    }
}

/// # Safety
///
/// `ptr` must point to an entry allocated by one of the pools of this crate.
unsafe fn acquire<T>(ptr: NonNull<T>) {
    // SAFETY: Forwarding the caller's guarantee.
    unsafe { header_of(ptr).as_mut() }.acquire();
}

/// # Safety
///
/// `ptr` must point to an entry allocated by one of the pools of this crate.
unsafe fn header_of<T>(ptr: NonNull<T>) -> NonNull<EntryHeader> {
    // SAFETY: Forwarding the caller's guarantee.
    unsafe { EntryHeader::from_data(ptr.cast()) }
}

impl<T> Default for Ptr<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> Clone for Ptr<T> {
    fn clone(&self) -> Self {
        if let Some(ptr) = self.ptr {
            // SAFETY: A bound handle keeps its object alive.
            unsafe {
                acquire(ptr);
            }
        }

        Self { ptr: self.ptr }
    }

    fn clone_from(&mut self, source: &Self) {
        // SAFETY: A bound source handle keeps its object alive.
        unsafe {
            self.assign_raw(source.ptr);
        }
    }
}

impl<T> Drop for Ptr<T> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<T> Deref for Ptr<T> {
    type Target = T;

    #[track_caller]
    fn deref(&self) -> &Self::Target {
        let Some(ptr) = self.ptr else {
            fatal::violation(
                "!self.is_null()",
                format_args!("dereferenced a null Ptr<{}>", std::any::type_name::<T>()),
            );
        };

        // SAFETY: A bound handle keeps its object alive and only hands out shared references.
        unsafe { ptr.as_ref() }
    }
}

impl<T> PartialEq for Ptr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<T> Eq for Ptr<T> {}

impl<T> fmt::Debug for Ptr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ptr")
            .field("ptr", &self.ptr)
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::cell::Cell;
    use std::panic::{self, AssertUnwindSafe};

    use static_assertions::assert_not_impl_any;

    use super::*;
    use crate::{FixedPool, GenericPool};

    assert_not_impl_any!(Ptr<u32>: Send, Sync);

    fn pool_of<T>() -> FixedPool {
        FixedPool::builder().layout_of::<T>().build()
    }

    #[test]
    fn null_handle() {
        let ptr = Ptr::<u32>::null();

        assert!(ptr.is_null());
        assert_eq!(ptr.ref_count(), 0);
        assert_eq!(ptr.get(), None);
        assert_eq!(ptr, Ptr::default());
    }

    #[test]
    fn clones_and_drops_adjust_count() {
        let mut pool = pool_of::<u32>();

        // SAFETY: The object was just created by the pool.
        let mut a = unsafe { Ptr::from_raw(pool.create(7_u32)) };
        assert_eq!(a.ref_count(), 1);

        let handles: Vec<_> = (0..4).map(|_| a.clone()).collect();
        assert_eq!(a.ref_count(), 5);
        assert!(handles.iter().all(|handle| *handle == a));

        drop(handles);
        assert_eq!(a.ref_count(), 1);
        assert_eq!(*a, 7);

        a.destroy(&mut pool);
        assert!(pool.is_empty());
    }

    #[test]
    fn self_assignment_keeps_count() {
        let mut pool = pool_of::<u32>();

        // SAFETY: The object was just created by the pool.
        let mut a = unsafe { Ptr::from_raw(pool.create(1_u32)) };
        let b = a.clone();

        a.clone_from(&b);
        assert_eq!(a.ref_count(), 2);

        let alias = a.clone();
        a.clone_from(&alias);
        assert_eq!(a.ref_count(), 3);

        drop(alias);
        drop(b);
        a.destroy(&mut pool);
    }

    #[test]
    fn assign_raw_rebinds_between_objects() {
        let mut pool = pool_of::<u32>();
        let raw_a = pool.create(1_u32);
        let raw_b = pool.create(2_u32);

        // SAFETY: Both objects were just created by the pool.
        let (mut a, mut b) = unsafe { (Ptr::from_raw(raw_a), Ptr::from_raw(raw_b)) };

        // SAFETY: The new target is a live object of the same pool.
        unsafe { a.assign_raw(Some(raw_b)) };
        assert_eq!(*a, 2);
        assert_eq!(a, b);
        assert_eq!(b.ref_count(), 2);

        // SAFETY: Unbinding needs no target.
        unsafe { a.assign_raw(None) };
        assert!(a.is_null());
        assert_eq!(b.ref_count(), 1);

        // The first object lost its only handle but is still allocated.
        assert_eq!(pool.len(), 2);

        // SAFETY: The first object is still live in the pool.
        unsafe { a.assign_raw(Some(raw_a)) };
        assert_eq!(a.ref_count(), 1);
        assert_eq!(*a, 1);

        a.destroy(&mut pool);
        b.destroy(&mut pool);
        assert!(pool.is_empty());
    }

    #[test]
    fn assignment_moves_reference() {
        let mut pool = pool_of::<u32>();

        // SAFETY: The objects were just created by the pool.
        let (mut a, mut b) = unsafe {
            (
                Ptr::from_raw(pool.create(1_u32)),
                Ptr::from_raw(pool.create(2_u32)),
            )
        };

        let mut c = a.clone();
        assert_eq!(a.ref_count(), 2);

        c.clone_from(&b);
        assert_eq!(a.ref_count(), 1);
        assert_eq!(b.ref_count(), 2);
        assert_eq!(*c, 2);

        c.set_null();
        assert!(c.is_null());
        assert_eq!(b.ref_count(), 1);

        a.destroy(&mut pool);
        b.destroy(&mut pool);
        assert!(pool.is_empty());
    }

    #[test]
    fn destroy_runs_drop() {
        struct Tracked<'a>(&'a Cell<u32>);

        impl Drop for Tracked<'_> {
            fn drop(&mut self) {
                self.0.set(self.0.get() + 1);
            }
        }

        let drops = Cell::new(0);
        let mut pool = pool_of::<Tracked<'_>>();

        // SAFETY: The object was just created by the pool.
        let mut ptr = unsafe { Ptr::from_raw(pool.create(Tracked(&drops))) };
        ptr.destroy(&mut pool);

        assert_eq!(drops.get(), 1);
        assert!(ptr.is_null());
    }

    #[test]
    fn take_moves_value_out() {
        let mut pool = pool_of::<String>();

        // SAFETY: The object was just created by the pool.
        let mut ptr = unsafe { Ptr::from_raw(pool.create("moved".to_string())) };

        assert_eq!(ptr.take(&mut pool).as_deref(), Some("moved"));
        assert!(ptr.is_null());
        assert!(pool.is_empty());
        assert_eq!(ptr.take(&mut pool), None);
    }

    #[test]
    fn destroy_of_null_is_noop() {
        let mut pool = GenericPool::new();
        let mut ptr = Ptr::<u64>::null();

        ptr.destroy(&mut pool);
        assert!(ptr.is_null());
    }

    #[test]
    fn works_with_generic_pool() {
        let mut pool = GenericPool::new();

        // SAFETY: The object was just created by the pool.
        let mut ptr = unsafe { Ptr::from_raw(pool.create(vec![1, 2, 3])) };
        assert_eq!(ptr.len(), 3);

        ptr.destroy(&mut pool);
        assert!(pool.is_empty());
    }

    #[test]
    fn destroy_with_alias_is_rejected() {
        let mut pool = pool_of::<u64>();

        // SAFETY: The object was just created by the pool.
        let mut a = unsafe { Ptr::from_raw(pool.create(42_u64)) };
        let b = a.clone();

        let result = panic::catch_unwind(AssertUnwindSafe(|| a.destroy(&mut pool)));
        let message = result
            .expect_err("destroy must refuse while an alias exists")
            .downcast::<String>()
            .expect("panic payload is a formatted string");
        assert!(message.contains("would dangle"));

        // Nothing was freed and both handles remain valid.
        assert_eq!(*a, 42);
        assert_eq!(b.ref_count(), 2);
        assert_eq!(pool.len(), 1);

        drop(b);
        a.destroy(&mut pool);
        assert!(pool.is_empty());
    }

    #[test]
    #[should_panic(expected = "cannot be handled by")]
    fn destroy_through_wrong_pool_panics() {
        let mut right = pool_of::<u64>();
        let mut wrong = pool_of::<u64>();
        let _keep = wrong.create(0_u64);

        // SAFETY: The object was just created by a pool of this crate.
        let mut ptr = unsafe { Ptr::from_raw(right.create(1_u64)) };
        ptr.destroy(&mut wrong);
    }

    #[test]
    #[should_panic(expected = "dereferenced a null Ptr")]
    fn deref_of_null_panics() {
        let ptr = Ptr::<u64>::null();
        let _value = *ptr;
    }

    #[test]
    #[should_panic(expected = "still reference it")]
    fn raw_free_of_referenced_entry_panics() {
        let mut pool = pool_of::<u64>();
        let raw = pool.create(5_u64);

        // SAFETY: The object was just created by the pool.
        let _handle = unsafe { Ptr::from_raw(raw) };

        // SAFETY: The value is a plain integer that needs no drop. The pool rejects the free.
        unsafe { pool.deallocate(raw.cast()) };
    }
}
