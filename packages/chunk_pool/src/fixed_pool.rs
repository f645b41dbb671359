use std::alloc::Layout;
use std::iter;
use std::num::NonZero;
use std::ptr::NonNull;
use std::thread;

use crate::chunk::{Chunk, ChunkLayout, ChunkList};
use crate::entry::{EntryHeader, EntryInfo, EventCounter};
use crate::error::Result;
use crate::fatal::{self, invariant};
use crate::{AllocationError, FixedPoolBuilder, Pool, PoolId, PoolKind, PoolStats};

/// A pool of same-sized entries, carved out of chunks of up to [`MAX_CHUNK_ENTRIES`] entries.
///
/// The item layout is fixed when the pool is built. Allocating and deallocating an entry is O(1)
/// apart from the occasional chunk creation or release, which is one heap call.
///
/// The pool keeps two intrusive lists of chunks: one with every chunk and one with the chunks
/// that have free entries. The head of the second list is the designated free chunk that all
/// allocations are served from. When a chunk becomes empty it is released, unless it is the
/// designated free chunk, so at most one empty chunk is retained to absorb alloc/free churn at
/// chunk boundaries.
///
/// Besides single entries, the pool can hand out blocks of consecutive entries from one chunk
/// via [`allocate_block()`](Self::allocate_block). Such blocks can never be larger than a chunk.
///
/// Every entry carries a header that records the owning pool and allocation events, so handing
/// a pointer to the wrong pool, freeing it twice or leaking it is detected and reported.
///
/// # Example
///
/// ```
/// use std::alloc::Layout;
///
/// use chunk_pool::FixedPool;
///
/// let mut pool = FixedPool::builder().layout_of::<u64>().build();
///
/// let ptr = pool.allocate(Layout::new::<u64>());
/// assert_eq!(pool.len(), 1);
///
/// // SAFETY: The pointer came from this pool and is not used after this point.
/// unsafe { pool.deallocate(ptr) };
/// assert!(pool.is_empty());
/// ```
///
/// # Thread safety
///
/// The pool is single-threaded. It is neither [`Send`] nor [`Sync`].
///
/// [`MAX_CHUNK_ENTRIES`]: crate::MAX_CHUNK_ENTRIES
#[derive(Debug)]
pub struct FixedPool {
    pool_id: PoolId,

    /// The layout requested by the pool's users. Entries are larger because of their header.
    item_layout: Layout,
    chunk_layout: ChunkLayout,

    /// Head of the list of all chunks.
    first_chunk: Option<NonNull<Chunk>>,

    /// Head of the list of chunks with free entries. Allocations are served from this chunk.
    free_chunk: Option<NonNull<Chunk>>,

    entry_count: usize,

    events: EventCounter,
    stats: PoolStats,
}

/// Identity of a chunk of a [`FixedPool`], for telling apart entries placed in different chunks.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ChunkId(usize);

impl FixedPool {
    /// Creates a builder for configuring and constructing a [`FixedPool`].
    ///
    /// You must specify an item memory layout using either `.layout()` or `.layout_of::<T>()`
    /// before calling `.build()`.
    #[inline]
    pub fn builder() -> FixedPoolBuilder {
        FixedPoolBuilder::new()
    }

    #[must_use]
    pub(crate) fn new_inner(item_layout: Layout, chunk_capacity: NonZero<u8>) -> Self {
        Self {
            pool_id: PoolId::generate(),
            item_layout,
            chunk_layout: ChunkLayout::new(item_layout, chunk_capacity),
            first_chunk: None,
            free_chunk: None,
            entry_count: 0,
            events: EventCounter::default(),
            stats: PoolStats::default(),
        }
    }

    /// The unique identity of this pool.
    #[must_use]
    #[inline]
    pub fn id(&self) -> PoolId {
        self.pool_id
    }

    /// The memory layout of items in this pool.
    #[must_use]
    #[inline]
    pub fn item_layout(&self) -> Layout {
        self.item_layout
    }

    /// The number of entries in each chunk, which is also the largest block the pool can serve.
    #[must_use]
    #[inline]
    pub fn chunk_capacity(&self) -> NonZero<u8> {
        self.chunk_layout.capacity()
    }

    /// The distance in bytes between the data of consecutive entries of a block.
    ///
    /// Entries are larger than items because each one carries a header.
    #[must_use]
    #[inline]
    pub fn entry_stride(&self) -> usize {
        self.chunk_layout.stride()
    }

    /// The number of allocated entries.
    #[must_use]
    #[inline]
    pub fn len(&self) -> usize {
        self.entry_count
    }

    /// Whether the pool has no allocated entries.
    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    /// The number of entries the pool can hold without creating another chunk.
    #[must_use]
    pub fn capacity(&self) -> usize {
        // Cannot overflow because every chunk is a live allocation.
        self.chunk_count()
            .wrapping_mul(usize::from(self.chunk_capacity().get()))
    }

    /// The number of chunks the pool currently owns.
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunks(ChunkList::All).count()
    }

    /// The number of chunks that have at least one free entry.
    #[must_use]
    pub fn free_chunk_count(&self) -> usize {
        self.chunks(ChunkList::Free).count()
    }

    /// Counters describing the pool's activity since it was created.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let mut stats = self.stats;
        stats.set_free_chunks(self.free_chunk_count());
        stats
    }

    /// Allocates one entry and returns a pointer to its uninitialized data.
    ///
    /// # Panics
    ///
    /// Panics if `layout` is not compatible with the item layout of the pool (same size, no
    /// stricter alignment).
    pub fn allocate(&mut self, layout: Layout) -> NonNull<u8> {
        self.check_layout(layout);

        let mut chunk = match self.free_chunk {
            Some(chunk) => chunk,
            None => self.allocate_chunk(),
        };

        // SAFETY: Chunks reachable from our list heads are live and owned by this pool.
        let chunk_ref = unsafe { chunk.as_mut() };

        let ptr = chunk_ref.allocate_entry(&mut self.events);

        if !chunk_ref.is_free() {
            self.retire_full_chunk(chunk);
        }

        // Cannot overflow because every entry occupies memory.
        self.entry_count = self.entry_count.wrapping_add(1);
        self.stats.record_entries_allocated(1);

        ptr
    }

    /// Allocates `count` entries with consecutive positions in one chunk and returns a pointer to
    /// the uninitialized data of the first one.
    ///
    /// Entry data is not contiguous, consecutive entries are one entry stride apart. A block of
    /// one entry is the same as [`allocate()`](Self::allocate).
    ///
    /// # Errors
    ///
    /// Returns [`AllocationError::EmptyBlock`] if `count` is zero and
    /// [`AllocationError::BlockTooLarge`] if `count` exceeds the chunk capacity. The pool is not
    /// modified in either case.
    ///
    /// # Panics
    ///
    /// Panics if `layout` is not compatible with the item layout of the pool.
    ///
    /// # Example
    ///
    /// ```
    /// use std::alloc::Layout;
    ///
    /// use chunk_pool::{AllocationError, FixedPool};
    ///
    /// let mut pool = FixedPool::builder().layout_of::<u32>().build();
    /// let layout = Layout::new::<u32>();
    ///
    /// let block = pool.allocate_block(layout, 10).unwrap();
    /// assert_eq!(pool.len(), 10);
    ///
    /// assert!(matches!(
    ///     pool.allocate_block(layout, 300),
    ///     Err(AllocationError::BlockTooLarge { .. })
    /// ));
    /// assert_eq!(pool.len(), 10);
    ///
    /// // SAFETY: The block came from this pool with this size and is not used afterwards.
    /// unsafe { pool.deallocate_block(block, 10) };
    /// ```
    pub fn allocate_block(&mut self, layout: Layout, count: usize) -> Result<NonNull<u8>> {
        let capacity = self.chunk_capacity().get();

        if count == 0 {
            return Err(AllocationError::EmptyBlock);
        }

        let Some(entries) = u8::try_from(count).ok().filter(|entries| *entries <= capacity) else {
            return Err(AllocationError::BlockTooLarge {
                requested: count,
                capacity: usize::from(capacity),
            });
        };

        if entries == 1 {
            return Ok(self.allocate(layout));
        }

        self.check_layout(layout);

        let _span = tracing::trace_span!("allocate_block", pool = %self.pool_id, entries).entered();

        let mut chunk = match self.free_chunk {
            Some(mut chunk) => {
                // SAFETY: Chunks reachable from our list heads are live and owned by this pool.
                let chunk_ref = unsafe { chunk.as_mut() };

                if chunk_ref.max_block_size() < entries && chunk_ref.is_empty() {
                    tracing::trace!("rebuilding free list of empty chunk");
                    chunk_ref.reset_free_list();
                }

                if chunk_ref.max_block_size() >= entries {
                    chunk
                } else {
                    tracing::trace!(
                        available = chunk_ref.max_block_size(),
                        "free chunk has no room for block, allocating new chunk"
                    );
                    self.allocate_chunk()
                }
            }
            None => self.allocate_chunk(),
        };

        // SAFETY: Chunks reachable from our list heads are live and owned by this pool.
        let chunk_ref = unsafe { chunk.as_mut() };

        let ptr = chunk_ref.allocate_block(entries, &mut self.events);
        tracing::trace!(?ptr, "allocated block");

        if !chunk_ref.is_free() {
            self.retire_full_chunk(chunk);
        }

        // Cannot overflow because every entry occupies memory.
        self.entry_count = self.entry_count.wrapping_add(count);
        self.stats.record_entries_allocated(count);

        Ok(ptr)
    }

    /// Returns an entry to the pool.
    ///
    /// # Panics
    ///
    /// Panics if the entry does not belong to this pool, is already free or is still referenced
    /// by a [`Ptr`][crate::Ptr].
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by one of the pools of this crate, and that pool must still
    /// exist. The caller must not access the entry after this call.
    ///
    /// Freeing an entry twice is only detected while its chunk is still live. Once a chunk has
    /// been released, passing any of its former entries here reads freed memory.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        invariant!(
            self.entry_count > 0,
            "{} has no allocated entries, cannot deallocate {ptr:?}",
            self.pool_id
        );

        // SAFETY: Forwarding the caller's guarantee.
        let (mut chunk, pos) = unsafe { self.locate(ptr) };

        // SAFETY: `locate()` only returns live chunks of this pool.
        let chunk_ref = unsafe { chunk.as_mut() };

        let was_full = !chunk_ref.is_free();
        chunk_ref.deallocate_entry(pos, self.events.next());

        self.after_release(chunk, was_full);

        // Cannot underflow because we checked above that there is an allocated entry.
        self.entry_count = self.entry_count.wrapping_sub(1);
        self.stats.record_entries_deallocated(1);

        #[cfg(debug_assertions)]
        self.integrity_check();
    }

    /// Returns a block of `count` entries obtained from
    /// [`allocate_block()`](Self::allocate_block). A `count` of zero does nothing.
    ///
    /// # Panics
    ///
    /// Panics if the entries do not belong to this pool, do not fit into one chunk, or any of them
    /// is already free.
    ///
    /// # Safety
    ///
    /// `ptr` must be the first entry of a block obtained from one of the pools of this crate, and
    /// that pool must still exist. The caller must not access the entries after this call.
    ///
    /// As with [`deallocate()`](Self::deallocate), freeing a block twice is only detected while
    /// its chunk is still live.
    pub unsafe fn deallocate_block(&mut self, ptr: NonNull<u8>, count: usize) {
        if count == 0 {
            return;
        }

        let capacity = self.chunk_capacity().get();

        let Some(entries) = u8::try_from(count).ok().filter(|entries| *entries <= capacity) else {
            fatal::violation(
                "count <= chunk_capacity",
                format_args!("a block of {count} entries cannot come from chunks of {capacity}"),
            );
        };

        invariant!(
            self.entry_count >= count,
            "{} has only {} allocated entries, cannot deallocate a block of {count}",
            self.pool_id,
            self.entry_count
        );

        // SAFETY: Forwarding the caller's guarantee.
        let (mut chunk, first) = unsafe { self.locate(ptr) };

        // SAFETY: `locate()` only returns live chunks of this pool.
        let chunk_ref = unsafe { chunk.as_mut() };

        let was_full = !chunk_ref.is_free();
        chunk_ref.deallocate_block(first, entries, &mut self.events);

        self.after_release(chunk, was_full);

        // Cannot underflow because we checked the count above.
        self.entry_count = self.entry_count.wrapping_sub(count);
        self.stats.record_entries_deallocated(count);

        #[cfg(debug_assertions)]
        self.integrity_check();
    }

    /// Identifies the chunk an entry is placed in.
    ///
    /// # Panics
    ///
    /// Panics if the entry does not belong to this pool.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by one of the pools of this crate, and that pool must still
    /// exist.
    #[must_use]
    pub unsafe fn chunk_of(&self, ptr: NonNull<u8>) -> ChunkId {
        // SAFETY: Forwarding the caller's guarantee.
        let (chunk, _) = unsafe { self.locate(ptr) };

        ChunkId(chunk.as_ptr().addr())
    }

    /// Returns the debug information recorded for an entry of this pool.
    ///
    /// # Panics
    ///
    /// Panics if the entry does not belong to this pool.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by one of the pools of this crate, and that pool must still
    /// exist. The entry may already be free, as long as its chunk has not been released since.
    /// A chunk is released once all of its entries are free and it is not the designated free
    /// chunk, after which its former entries must not be passed here.
    #[must_use]
    pub unsafe fn entry_info(&self, ptr: NonNull<u8>) -> EntryInfo {
        // SAFETY: Forwarding the caller's guarantee.
        let (chunk, pos) = unsafe { self.locate(ptr) };

        // SAFETY: `locate()` only returns live chunks of this pool.
        unsafe { chunk.as_ref() }.entry_info(pos)
    }

    /// Recovers the chunk and position of an entry from its data pointer, verifying that the
    /// entry belongs to this pool.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by one of the pools of this crate, and that pool must still
    /// exist.
    unsafe fn locate(&self, ptr: NonNull<u8>) -> (NonNull<Chunk>, u8) {
        // SAFETY: Every pool of this crate places a header right before the data.
        let header = unsafe { EntryHeader::from_data(ptr).as_ref() };

        invariant!(
            header.owner() == self.pool_id,
            "entry {ptr:?} belongs to {} and cannot be handled by {}",
            header.owner(),
            self.pool_id
        );

        let pos = header.pos();

        invariant!(
            pos < self.chunk_capacity().get(),
            "entry {ptr:?} claims position {pos} in chunks of {} entries",
            self.chunk_capacity()
        );

        // SAFETY: The entry was allocated by this pool, so it is the entry at `pos` of one of our
        // chunks, all of which share our chunk layout.
        let chunk = unsafe { Chunk::from_data(ptr, pos, &self.chunk_layout) };

        // SAFETY: See above, the chunk is live.
        let chunk_ref = unsafe { chunk.as_ref() };

        invariant!(
            chunk_ref.owner() == self.pool_id,
            "entry {ptr:?} resolves to a chunk of {}, not {}",
            chunk_ref.owner(),
            self.pool_id
        );
        invariant!(
            chunk_ref.contains(ptr) && chunk_ref.data_ptr(pos) == ptr,
            "{ptr:?} is not the start of an entry of {}",
            self.pool_id
        );

        (chunk, pos)
    }

    fn check_layout(&self, layout: Layout) {
        invariant!(
            layout.size() == self.item_layout.size() && layout.align() <= self.item_layout.align(),
            "layout {layout:?} is not compatible with the item layout {:?} of {}",
            self.item_layout,
            self.pool_id
        );
    }

    /// Creates a chunk and makes it the head of both chunk lists.
    fn allocate_chunk(&mut self) -> NonNull<Chunk> {
        let chunk = Chunk::create(self.chunk_layout, self.pool_id);

        // SAFETY: The new chunk is in no list yet and the current list heads are live.
        unsafe {
            Chunk::attach(chunk, ChunkList::All, self.first_chunk);
        }

        // SAFETY: As above.
        unsafe {
            Chunk::attach(chunk, ChunkList::Free, self.free_chunk);
        }

        self.first_chunk = Some(chunk);
        self.free_chunk = Some(chunk);
        self.stats.record_chunk_allocated();

        tracing::debug!(
            pool = %self.pool_id,
            ?chunk,
            capacity = self.chunk_capacity().get(),
            "allocated chunk"
        );

        chunk
    }

    /// Detaches an empty chunk from both lists and releases its memory.
    fn deallocate_chunk(&mut self, chunk: NonNull<Chunk>) {
        let (next_all, next_free) = {
            // SAFETY: Only live chunks of this pool are passed here.
            let chunk_ref = unsafe { chunk.as_ref() };

            invariant!(
                chunk_ref.is_empty(),
                "cannot release a chunk of {} whose entry allocated by event {:?} is still busy",
                self.pool_id,
                chunk_ref.first_busy_event()
            );

            (chunk_ref.next(ChunkList::All), chunk_ref.next(ChunkList::Free))
        };

        if self.first_chunk == Some(chunk) {
            self.first_chunk = next_all;
        }

        if self.free_chunk == Some(chunk) {
            self.free_chunk = next_free;
        }

        // SAFETY: The chunk and its neighbors are live chunks of this pool.
        unsafe {
            Chunk::detach(chunk, ChunkList::All);
        }

        // SAFETY: As above.
        unsafe {
            Chunk::detach(chunk, ChunkList::Free);
        }

        // SAFETY: The chunk is no longer reachable through any list and we forget it now.
        unsafe {
            Chunk::destroy(chunk);
        }

        self.stats.record_chunk_released();

        tracing::debug!(pool = %self.pool_id, ?chunk, "released empty chunk");
    }

    /// Removes the designated free chunk, which just became full, from the free list.
    fn retire_full_chunk(&mut self, chunk: NonNull<Chunk>) {
        invariant!(
            self.free_chunk == Some(chunk),
            "only the designated free chunk of {} can become full",
            self.pool_id
        );

        // SAFETY: The free chunk is live.
        self.free_chunk = unsafe { chunk.as_ref() }.next(ChunkList::Free);

        // SAFETY: The chunk and its neighbors are live chunks of this pool.
        unsafe {
            Chunk::detach(chunk, ChunkList::Free);
        }
    }

    /// Updates the chunk lists after entries were returned to `chunk`.
    fn after_release(&mut self, chunk: NonNull<Chunk>, was_full: bool) {
        if self.free_chunk == Some(chunk) {
            return;
        }

        if was_full {
            let previous = self.free_chunk;

            // SAFETY: A full chunk is not in the free list. The current head is live.
            unsafe {
                Chunk::attach(chunk, ChunkList::Free, previous);
            }

            self.free_chunk = Some(chunk);

            if let Some(previous) = previous {
                // SAFETY: Chunks reachable from our list heads are live.
                if unsafe { previous.as_ref() }.is_empty() {
                    self.deallocate_chunk(previous);
                }
            }
        } else {
            // SAFETY: The chunk is live, its entries were just returned to it.
            if unsafe { chunk.as_ref() }.is_empty() {
                self.deallocate_chunk(chunk);
            }
        }
    }

    fn chunks(&self, list: ChunkList) -> impl Iterator<Item = NonNull<Chunk>> {
        let head = match list {
            ChunkList::All => self.first_chunk,
            ChunkList::Free => self.free_chunk,
        };

        // SAFETY: Chunks reachable from our list heads are live.
        iter::successors(head, move |chunk| unsafe { chunk.as_ref() }.next(list))
    }

    #[cfg(debug_assertions)]
    #[cfg_attr(test, mutants::skip)] // Mutations only weaken the checks.
    fn integrity_check(&self) {
        let mut busy: usize = 0;

        for chunk in self.chunks(ChunkList::All) {
            // SAFETY: Chunks reachable from our list heads are live.
            let chunk_ref = unsafe { chunk.as_ref() };

            assert_eq!(chunk_ref.owner(), self.pool_id);
            busy = busy.wrapping_add(usize::from(
                chunk_ref.capacity().wrapping_sub(chunk_ref.num_free()),
            ));
        }

        assert_eq!(busy, self.entry_count, "entry count does not match chunk contents");

        for chunk in self.chunks(ChunkList::Free) {
            // SAFETY: Chunks reachable from our list heads are live.
            let chunk_ref = unsafe { chunk.as_ref() };

            assert!(chunk_ref.is_free(), "full chunk found in the free list");

            if Some(chunk) != self.free_chunk {
                assert!(
                    !chunk_ref.is_empty(),
                    "only the designated free chunk may be empty"
                );
            }
        }

        if let Some(head) = self.free_chunk {
            // SAFETY: Chunks reachable from our list heads are live.
            assert!(unsafe { head.as_ref() }.prev(ChunkList::Free).is_none());
        }
    }
}

impl Pool for FixedPool {
    fn kind(&self) -> PoolKind {
        PoolKind::Fixed
    }

    fn id(&self) -> PoolId {
        self.pool_id
    }

    fn len(&self) -> usize {
        self.entry_count
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
        // SAFETY: Forwarding the caller's guarantee.
        let (chunk, pos) = unsafe { self.locate(ptr) };

        // SAFETY: `locate()` only returns live chunks of this pool.
        let info = unsafe { chunk.as_ref() }.entry_info(pos);

        invariant!(
            info.is_busy(),
            "entry {ptr:?} of {} is not allocated (freed by event {})",
            self.pool_id,
            info.dealloc_event()
        );
    }
}

impl Drop for FixedPool {
    fn drop(&mut self) {
        let leaked = self.entry_count;

        let first_leak = self.chunks(ChunkList::All).find_map(|chunk| {
            // SAFETY: Chunks reachable from our list heads are live.
            unsafe { chunk.as_ref() }.first_busy_event()
        });

        self.free_chunk = None;

        while let Some(chunk) = self.first_chunk {
            // SAFETY: Chunks reachable from our list heads are live.
            let chunk_ref = unsafe { chunk.as_ref() };
            self.first_chunk = chunk_ref.next(ChunkList::All);

            // Handles may still reference busy entries, so their chunks are leaked.
            if !chunk_ref.is_empty() {
                tracing::warn!(
                    pool = %self.pool_id,
                    ?chunk,
                    "leaking chunk with allocated entries"
                );
                continue;
            }

            // SAFETY: The chunk has no allocated entries and the pool is going away,
            // so nothing can reach the chunk anymore.
            unsafe {
                Chunk::destroy(chunk);
            }
        }

        // If we are already panicking, we do not want to panic again because that will
        // simply obscure whatever the original panic was, leading to debug difficulties.
        if !thread::panicking() {
            invariant!(
                leaked == 0,
                "{} dropped with {leaked} allocated entries, the first still allocated by event {}",
                self.pool_id,
                first_leak.unwrap_or_default()
            );
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use new_zealand::nz;
    use static_assertions::assert_not_impl_any;

    use super::*;
    use crate::PoolExt;

    assert_not_impl_any!(FixedPool: Send, Sync);

    fn u64_pool(capacity: NonZero<u8>) -> FixedPool {
        FixedPool::builder()
            .layout_of::<u64>()
            .chunk_capacity(capacity)
            .build()
    }

    #[test]
    fn new_pool_has_no_chunks() {
        let pool = u64_pool(nz!(4));

        assert!(pool.is_empty());
        assert_eq!(pool.chunk_count(), 0);
        assert_eq!(pool.capacity(), 0);
        assert_eq!(pool.kind(), PoolKind::Fixed);
    }

    #[test]
    fn first_allocation_creates_chunk() {
        let mut pool = u64_pool(nz!(4));

        let ptr = pool.allocate(Layout::new::<u64>());
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.chunk_count(), 1);
        assert_eq!(pool.capacity(), 4);

        // SAFETY: The pointer came from this pool and is not used afterwards.
        unsafe { pool.deallocate(ptr) };

        // The designated free chunk is kept even when empty.
        assert!(pool.is_empty());
        assert_eq!(pool.chunk_count(), 1);
    }

    #[test]
    fn overflowing_capacity_creates_second_chunk_and_shrinks_back() {
        let mut pool = u64_pool(nz!(4));
        let layout = Layout::new::<u64>();

        let ptrs: Vec<_> = (0..5).map(|_| pool.allocate(layout)).collect();
        assert_eq!(pool.len(), 5);
        assert_eq!(pool.chunk_count(), 2);

        // SAFETY: The pointers came from this pool and are distinct.
        unsafe {
            assert_ne!(pool.chunk_of(ptrs[0]), pool.chunk_of(ptrs[4]));
        }

        for ptr in ptrs {
            // SAFETY: The pointer came from this pool and is not used afterwards.
            unsafe { pool.deallocate(ptr) };
        }

        assert!(pool.is_empty());
        assert_eq!(pool.chunk_count(), 1);
        assert_eq!(pool.free_chunk_count(), 1);
    }

    #[test]
    fn oversized_block_is_rejected_without_changes() {
        let mut pool = u64_pool(nz!(4));
        let layout = Layout::new::<u64>();

        let ptr = pool.allocate(layout);
        let stats_before = pool.stats();

        assert_eq!(
            pool.allocate_block(layout, 5),
            Err(AllocationError::BlockTooLarge {
                requested: 5,
                capacity: 4
            })
        );
        assert_eq!(
            pool.allocate_block(layout, 1000),
            Err(AllocationError::BlockTooLarge {
                requested: 1000,
                capacity: 4
            })
        );
        assert_eq!(
            pool.allocate_block(layout, 0),
            Err(AllocationError::EmptyBlock)
        );

        assert_eq!(pool.len(), 1);
        assert_eq!(pool.chunk_count(), 1);
        assert_eq!(pool.stats(), stats_before);

        // SAFETY: The pointer came from this pool and is not used afterwards.
        unsafe { pool.deallocate(ptr) };
    }

    #[test]
    fn block_of_one_is_single_entry() {
        let mut pool = u64_pool(nz!(4));
        let layout = Layout::new::<u64>();

        let block = pool.allocate_block(layout, 1).unwrap();
        assert_eq!(pool.len(), 1);

        // SAFETY: The pointer came from this pool and is not used afterwards.
        unsafe { pool.deallocate(block) };
        assert!(pool.is_empty());
    }

    #[test]
    fn block_that_does_not_fit_gets_new_chunk() {
        let mut pool = u64_pool(nz!(4));
        let layout = Layout::new::<u64>();

        let single = pool.allocate(layout);
        let block = pool.allocate_block(layout, 4).unwrap();

        assert_eq!(pool.len(), 5);
        assert_eq!(pool.chunk_count(), 2);

        // SAFETY: The pointers came from this pool.
        unsafe {
            assert_ne!(pool.chunk_of(single), pool.chunk_of(block));
        }

        // SAFETY: The block came from this pool with this size and is not used afterwards.
        unsafe { pool.deallocate_block(block, 4) };

        // SAFETY: The pointer came from this pool and is not used afterwards.
        unsafe { pool.deallocate(single) };

        assert!(pool.is_empty());
        assert_eq!(pool.chunk_count(), 1);
    }

    #[test]
    fn fragmented_empty_chunk_is_reused_for_block() {
        let mut pool = u64_pool(nz!(4));
        let layout = Layout::new::<u64>();

        let a = pool.allocate(layout);
        let b = pool.allocate(layout);

        // Freeing in allocation order leaves a run estimate of one.
        // SAFETY: The pointers came from this pool and are not used afterwards.
        unsafe {
            pool.deallocate(a);
        }
        // SAFETY: As above.
        unsafe {
            pool.deallocate(b);
        }

        let block = pool.allocate_block(layout, 4).unwrap();
        assert_eq!(pool.chunk_count(), 1);

        // SAFETY: The block came from this pool with this size and is not used afterwards.
        unsafe { pool.deallocate_block(block, 4) };
    }

    #[test]
    fn zero_block_deallocation_is_noop() {
        let mut pool = u64_pool(nz!(4));
        let ptr = pool.allocate(Layout::new::<u64>());

        // SAFETY: The pointer came from this pool, a block of zero touches nothing.
        unsafe { pool.deallocate_block(ptr, 0) };
        assert_eq!(pool.len(), 1);

        // SAFETY: The pointer came from this pool and is not used afterwards.
        unsafe { pool.deallocate(ptr) };
    }

    #[test]
    fn entry_info_tracks_events() {
        let mut pool = u64_pool(nz!(4));
        let layout = Layout::new::<u64>();

        let first = pool.allocate(layout);
        let second = pool.allocate(layout);

        // SAFETY: The pointers came from this pool.
        let (first_info, second_info) = unsafe { (pool.entry_info(first), pool.entry_info(second)) };
        assert!(first_info.is_busy());
        assert!(second_info.alloc_event() > first_info.alloc_event());

        // SAFETY: The pointer came from this pool and is not used afterwards.
        unsafe { pool.deallocate(first) };

        // SAFETY: The entry is free but its chunk is still alive.
        let freed = unsafe { pool.entry_info(first) };
        assert!(!freed.is_busy());
        assert!(freed.dealloc_event() > second_info.alloc_event());

        // SAFETY: The pointer came from this pool and is not used afterwards.
        unsafe { pool.deallocate(second) };
    }

    #[test]
    fn stats_count_activity() {
        let mut pool = u64_pool(nz!(2));
        let layout = Layout::new::<u64>();

        let ptrs: Vec<_> = (0..3).map(|_| pool.allocate(layout)).collect();
        for ptr in ptrs {
            // SAFETY: The pointer came from this pool and is not used afterwards.
            unsafe { pool.deallocate(ptr) };
        }

        let stats = pool.stats();
        assert_eq!(stats.entries_allocated(), 3);
        assert_eq!(stats.entries_deallocated(), 3);
        assert_eq!(stats.chunks_allocated(), 2);
        assert_eq!(stats.live_chunks(), 1);
        assert_eq!(stats.free_chunks(), 1);
    }

    #[test]
    fn zero_sized_items_are_pooled() {
        let mut pool = FixedPool::builder().layout_of::<()>().build();

        let unit = pool.create(());
        assert_eq!(pool.len(), 1);

        // SAFETY: The item was created by this pool and is not used afterwards.
        unsafe { pool.destroy(unit) };
        assert!(pool.is_empty());
    }

    #[test]
    fn typed_create_and_destroy_run_drop() {
        let mut pool = FixedPool::builder().layout_of::<String>().build();

        let item = pool.create("pooled".to_string());

        // SAFETY: The item is live.
        assert_eq!(unsafe { item.as_ref() }, "pooled");

        // SAFETY: The item was created by this pool and is not used afterwards.
        unsafe { pool.destroy(item) };
        assert!(pool.is_empty());
    }

    #[test]
    #[should_panic(expected = "cannot be handled by")]
    fn foreign_entry_panics() {
        let mut pool_a = u64_pool(nz!(4));
        let mut pool_b = u64_pool(nz!(4));

        let ptr = pool_a.allocate(Layout::new::<u64>());
        let _keep = pool_b.allocate(Layout::new::<u64>());

        // SAFETY: The pointer came from a pool of this crate that is still alive.
        unsafe { pool_b.deallocate(ptr) };
    }

    #[test]
    #[should_panic(expected = "already free")]
    fn double_free_panics() {
        let mut pool = u64_pool(nz!(4));
        let layout = Layout::new::<u64>();

        let ptr = pool.allocate(layout);
        let _keep = pool.allocate(layout);

        // SAFETY: The pointer came from this pool.
        unsafe { pool.deallocate(ptr) };

        // SAFETY: The chunk is still alive, so the header is readable. The pool detects the
        // double free.
        unsafe { pool.deallocate(ptr) };
    }

    #[test]
    #[should_panic(expected = "not compatible")]
    fn mismatched_layout_panics() {
        let mut pool = u64_pool(nz!(4));

        let _ptr = pool.allocate(Layout::new::<u32>());
    }

    #[test]
    #[should_panic(expected = "dropped with 1 allocated entries")]
    fn dropping_non_empty_pool_panics() {
        let mut pool = u64_pool(nz!(4));
        let _ptr = pool.allocate(Layout::new::<u64>());

        drop(pool);
    }

    #[test]
    fn dropping_non_empty_pool_keeps_busy_entries_readable() {
        let mut pool = u64_pool(nz!(2));

        // The first chunk ends up full and the second empty, so only the first one is leaked.
        let first = pool.create(11_u64);
        let second = pool.create(22_u64);
        let spare = pool.create(33_u64);

        // SAFETY: The item was created by this pool and is not used afterwards.
        unsafe { pool.destroy(spare) };
        assert_eq!(pool.chunk_count(), 2);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || drop(pool)));
        assert!(result.is_err());

        // SAFETY: Chunks with allocated entries are leaked, so the items remain valid.
        unsafe {
            assert_eq!(*first.as_ref(), 11);
            assert_eq!(*second.as_ref(), 22);
        }
    }
}
