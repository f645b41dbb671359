use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::thread;

use foldhash::{HashMap, HashMapExt};

use crate::entry::{EntryHeader, EntryInfo, EntryLayout, EventCounter};
use crate::fatal::{self, invariant};
use crate::{Pool, PoolId, PoolKind};

/// A fallback pool that performs one heap allocation per entry, for any layout.
///
/// Entries carry the same header as [`FixedPool`][crate::FixedPool] entries, so [`Ptr`]
/// reference counting works the same way. The pool remembers every live entry, which lets it
/// reject pointers it never handed out and entries that were already freed.
///
/// # Example
///
/// ```
/// use chunk_pool::{GenericPool, PoolExt};
///
/// let mut pool = GenericPool::new();
///
/// let small = pool.create(1_u8);
/// let large = pool.create([0_u64; 64]);
/// assert_eq!(pool.len(), 2);
///
/// // SAFETY: The items were created by this pool and are not used afterwards.
/// unsafe {
///     pool.destroy(small);
///     pool.destroy(large);
/// }
/// assert!(pool.is_empty());
/// ```
///
/// [`Ptr`]: crate::Ptr
#[derive(Debug)]
pub struct GenericPool {
    pool_id: PoolId,

    /// Data pointer to item layout of every live entry.
    live: HashMap<NonNull<u8>, Layout>,

    events: EventCounter,
}

impl GenericPool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self {
            pool_id: PoolId::generate(),
            live: HashMap::new(),
            events: EventCounter::default(),
        }
    }

    /// The unique identity of this pool.
    #[must_use]
    #[inline]
    pub fn id(&self) -> PoolId {
        self.pool_id
    }

    /// The number of allocated entries.
    #[must_use]
    #[inline]
    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// Whether the pool has no allocated entries.
    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Allocates one entry for an item of `layout` and returns a pointer to its uninitialized
    /// data.
    pub fn allocate(&mut self, layout: Layout) -> NonNull<u8> {
        let entry_layout = EntryLayout::for_item(layout);

        // SAFETY: Entry layouts always have non-zero size because they contain the header.
        let raw = unsafe { alloc::alloc(entry_layout.entry()) };
        let entry = NonNull::new(raw).unwrap_or_else(|| alloc::handle_alloc_error(entry_layout.entry()));

        // SAFETY: The header offset lies within the entry and is aligned for the header,
        // as guaranteed by `EntryLayout`.
        let mut header = unsafe { entry.byte_add(entry_layout.header_offset()) }.cast::<EntryHeader>();

        // SAFETY: See above. The memory is ours and uninitialized.
        unsafe {
            header.write(EntryHeader::new(self.pool_id, 0));
        }

        // SAFETY: We just initialized the header.
        unsafe { header.as_mut() }.mark_allocated(self.events.next());

        // SAFETY: The data offset lies within the entry, as guaranteed by `EntryLayout`.
        let data = unsafe { entry.byte_add(entry_layout.data_offset()) };

        self.live.insert(data, layout);

        tracing::trace!(pool = %self.pool_id, ?data, ?layout, "allocated generic entry");

        data
    }

    /// Returns an entry to the pool, releasing its memory.
    ///
    /// # Panics
    ///
    /// Panics if the pointer is not a live entry of this pool or is still referenced by a
    /// [`Ptr`][crate::Ptr].
    ///
    /// # Safety
    ///
    /// The caller must not access the entry after this call. A pointer that was never handed out
    /// by this pool is detected without being dereferenced.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        let Some(layout) = self.live.get(&ptr).copied() else {
            fatal::violation(
                "live.contains_key(ptr)",
                format_args!(
                    "{ptr:?} is not a live entry of {}, it was freed already or never allocated here",
                    self.pool_id
                ),
            );
        };

        // SAFETY: Live entries have a valid header right before their data.
        let header = unsafe { EntryHeader::from_data(ptr).as_mut() };
        header.mark_deallocated(self.events.next());

        self.live.remove(&ptr);

        // SAFETY: Same layout as in `allocate()`, so the entry start is at the same offset.
        unsafe {
            release(ptr, layout);
        }

        tracing::trace!(pool = %self.pool_id, ?ptr, "released generic entry");
    }

    /// Returns the debug information recorded for a live entry of this pool.
    ///
    /// # Panics
    ///
    /// Panics if the pointer is not a live entry of this pool.
    #[must_use]
    pub fn entry_info(&self, ptr: NonNull<u8>) -> EntryInfo {
        self.check_live(ptr);

        // SAFETY: Live entries have a valid header right before their data.
        unsafe { EntryHeader::from_data(ptr).as_ref() }.info()
    }

    fn check_live(&self, ptr: NonNull<u8>) {
        invariant!(
            self.live.contains_key(&ptr),
            "{ptr:?} is not a live entry of {}",
            self.pool_id
        );
    }
}

impl Default for GenericPool {
    fn default() -> Self {
        Self::new()
    }
}

/// # Safety
///
/// `data` must be the data pointer of a live entry allocated for an item of `layout`.
unsafe fn release(data: NonNull<u8>, layout: Layout) {
    let entry_layout = EntryLayout::for_item(layout);

    // SAFETY: The caller guarantees the data offset of this layout leads back to the entry start.
    let entry = unsafe { data.byte_sub(entry_layout.data_offset()) };

    // SAFETY: The entry was allocated with this same layout.
    unsafe {
        alloc::dealloc(entry.as_ptr(), entry_layout.entry());
    }
}

impl Pool for GenericPool {
    fn kind(&self) -> PoolKind {
        PoolKind::Generic
    }

    fn id(&self) -> PoolId {
        self.pool_id
    }

    fn len(&self) -> usize {
        self.live.len()
    }

    fn allocate(&mut self, layout: Layout) -> NonNull<u8> {
        Self::allocate(self, layout)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        // SAFETY: Forwarding the caller's guarantee.
        unsafe {
            Self::deallocate(self, ptr);
        }
    }

    unsafe fn check_entry(&self, ptr: NonNull<u8>) {
        self.check_live(ptr);
    }
}

impl Drop for GenericPool {
    fn drop(&mut self) {
        let leaked = self.live.len();

        // Handles may still reference live entries, so their memory is leaked.
        if leaked > 0 {
            tracing::warn!(pool = %self.pool_id, leaked, "leaking allocated entries");
            self.live.clear();
        }

        // If we are already panicking, we do not want to panic again because that will
        // simply obscure whatever the original panic was, leading to debug difficulties.
        if !thread::panicking() {
            invariant!(
                leaked == 0,
                "{} dropped with {leaked} allocated entries",
                self.pool_id
            );
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_not_impl_any;

    use super::*;
    use crate::{FixedPool, PoolExt};

    assert_not_impl_any!(GenericPool: Send, Sync);

    #[test]
    fn round_trip_returns_to_empty() {
        let mut pool = GenericPool::new();

        let ptr = pool.allocate(Layout::new::<[u8; 100]>());
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.kind(), PoolKind::Generic);

        // SAFETY: The pointer came from this pool and is not used afterwards.
        unsafe { pool.deallocate(ptr) };
        assert!(pool.is_empty());
    }

    #[test]
    fn data_respects_alignment() {
        #[repr(align(64))]
        struct Aligned([u8; 3]);

        let mut pool = GenericPool::new();
        let item = pool.create(Aligned([1, 2, 3]));

        assert_eq!(item.as_ptr().addr() % 64, 0);

        // SAFETY: The item is live.
        assert_eq!(unsafe { item.as_ref() }.0, [1, 2, 3]);

        // SAFETY: The item was created by this pool and is not used afterwards.
        unsafe { pool.destroy(item) };
    }

    #[test]
    fn entry_info_reports_busy_entry() {
        let mut pool = GenericPool::new();
        let ptr = pool.allocate(Layout::new::<u32>());

        let info = pool.entry_info(ptr);
        assert!(info.is_busy());
        assert_eq!(info.ref_count(), 0);

        // SAFETY: The pointer came from this pool and is not used afterwards.
        unsafe { pool.deallocate(ptr) };
    }

    #[test]
    #[should_panic(expected = "is not a live entry")]
    fn foreign_pointer_panics() {
        let mut pool = GenericPool::new();
        let local = 5_u64;

        // SAFETY: The pool never dereferences pointers it does not know.
        unsafe { pool.deallocate(NonNull::from(&local).cast()) };
    }

    #[test]
    #[should_panic(expected = "is not a live entry")]
    fn entry_of_other_pool_panics() {
        let mut fixed = FixedPool::builder().layout_of::<u64>().build();
        let mut generic = GenericPool::new();

        let ptr = fixed.allocate(Layout::new::<u64>());

        // SAFETY: The pool never dereferences pointers it does not know.
        unsafe { generic.deallocate(ptr) };
    }

    #[test]
    #[should_panic(expected = "is not a live entry")]
    fn double_free_panics() {
        let mut pool = GenericPool::new();
        let ptr = pool.allocate(Layout::new::<u64>());

        // SAFETY: The pointer came from this pool.
        unsafe { pool.deallocate(ptr) };

        // SAFETY: The pool never dereferences pointers it does not know.
        unsafe { pool.deallocate(ptr) };
    }

    #[test]
    #[should_panic(expected = "dropped with 1 allocated entries")]
    fn dropping_non_empty_pool_panics() {
        let mut pool = GenericPool::new();
        let _ptr = pool.allocate(Layout::new::<u64>());

        drop(pool);
    }

    #[test]
    fn dropping_non_empty_pool_keeps_live_entries_readable() {
        let mut pool = GenericPool::new();
        let item = pool.create(String::from("still here"));

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || drop(pool)));
        assert!(result.is_err());

        // SAFETY: Live entries are leaked by the dropped pool, so the item remains valid.
        assert_eq!(unsafe { item.as_ref() }, "still here");
    }
}
