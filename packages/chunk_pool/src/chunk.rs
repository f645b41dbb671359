use std::alloc::{self, Layout};
use std::iter;
use std::mem;
use std::num::NonZero;
use std::ptr::NonNull;

use new_zealand::nz;

use crate::PoolId;
use crate::entry::{EntryHeader, EntryInfo, EntryLayout, EventCounter};
use crate::fatal::invariant;

/// The largest number of entries a chunk can hold.
///
/// Entry positions are stored in a single byte and the highest byte value is reserved as the
/// end-of-list marker, so a chunk holds at most 255 entries.
pub const MAX_CHUNK_ENTRIES: NonZero<u8> = nz!(255);

/// End-of-list marker in the free list of a chunk.
pub(crate) const UNDEF_POS: u8 = u8::MAX;

/// Memory layout of a chunk: the `Chunk` struct itself, padding, then `capacity` entries.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct ChunkLayout {
    entry: EntryLayout,
    capacity: NonZero<u8>,
    entries_offset: usize,
    allocation: Layout,
}

impl ChunkLayout {
    pub(crate) fn new(item: Layout, capacity: NonZero<u8>) -> Self {
        let entry = EntryLayout::for_item(item);

        let entries_size = entry
            .entry()
            .size()
            .checked_mul(usize::from(capacity.get()))
            .expect("chunk size overflows usize");

        let entries = Layout::from_size_align(entries_size, entry.entry().align())
            .expect("chunk layout exceeds the maximum supported allocation size");

        let (allocation, entries_offset) = Layout::new::<Chunk>()
            .extend(entries)
            .expect("chunk layout exceeds the maximum supported allocation size");

        Self {
            entry,
            capacity,
            entries_offset,
            allocation: allocation.pad_to_align(),
        }
    }

    pub(crate) fn capacity(&self) -> NonZero<u8> {
        self.capacity
    }

    /// Distance in bytes between the data of consecutive entries.
    pub(crate) fn stride(&self) -> usize {
        self.entry.entry().size()
    }

    /// Offset from the start of the chunk to the data of the entry at `pos`.
    fn data_offset(&self, pos: u8) -> usize {
        // Cannot overflow because the layout of the whole chunk was validated on construction
        // and every caller passes an in-bounds position.
        self.entries_offset
            .wrapping_add(usize::from(pos).wrapping_mul(self.stride()))
            .wrapping_add(self.entry.data_offset())
    }
}

/// The chunk lists a chunk can be a member of.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ChunkList {
    /// Every chunk of a pool.
    All,

    /// Chunks with at least one free entry.
    Free,
}

#[derive(Clone, Copy, Debug, Default)]
struct Links {
    prev: Option<NonNull<Chunk>>,
    next: Option<NonNull<Chunk>>,
}

/// A block of up to 255 same-sized entries, placed at the start of its own heap allocation.
///
/// Free entries form a singly-linked list threaded through `next_free`, an index array parallel
/// to the entries, so the free list never overlays entry storage. Positions only ever travel
/// through this list, chunk-relative and one byte wide.
///
/// `max_block_size` is a lower bound of the length of the ascending run of positions at the head
/// of the free list. It lets the pool decide in O(1) whether a block request fits.
#[derive(Debug)]
pub(crate) struct Chunk {
    // Start of the allocation. The chunk struct lives here, the entries follow it.
    base: NonNull<u8>,
    layout: ChunkLayout,
    owner: PoolId,

    all: Links,
    free: Links,

    // Head of the free list, `UNDEF_POS` if the chunk is full.
    free_entry: u8,
    busy: u8,
    max_block_size: u8,

    next_free: Box<[u8]>,
}

impl Chunk {
    /// Allocates a new chunk with all entries free, in ascending position order.
    pub(crate) fn create(layout: ChunkLayout, owner: PoolId) -> NonNull<Self> {
        // SAFETY: The layout has non-zero size because it includes the chunk struct itself.
        let raw = unsafe { alloc::alloc(layout.allocation) };
        let base = NonNull::new(raw).unwrap_or_else(|| alloc::handle_alloc_error(layout.allocation));

        let capacity = layout.capacity.get();

        let next_free = (1..capacity)
            .chain(iter::once(UNDEF_POS))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let mut chunk = base.cast::<Self>();

        // SAFETY: The allocation starts with space for the chunk struct, aligned for it
        // because `Layout::extend()` starts from the chunk struct layout.
        unsafe {
            chunk.write(Self {
                base,
                layout,
                owner,
                all: Links::default(),
                free: Links::default(),
                free_entry: 0,
                busy: 0,
                max_block_size: capacity,
                next_free,
            });
        }

        // SAFETY: We just initialized the chunk struct and nobody else has seen it yet.
        let chunk_ref = unsafe { chunk.as_mut() };

        for pos in 0..capacity {
            let header = chunk_ref.header_ptr(pos);

            // SAFETY: The header lies within the allocation and is suitably aligned,
            // as guaranteed by `EntryLayout`.
            unsafe {
                header.write(EntryHeader::new(owner, pos));
            }
        }

        #[cfg(debug_assertions)]
        chunk_ref.integrity_check();

        chunk
    }

    /// Releases the memory of a chunk.
    ///
    /// # Safety
    ///
    /// `chunk` must come from `create()` and must not be used after this call, neither directly
    /// nor through a chunk list. The values in its entries are not dropped.
    pub(crate) unsafe fn destroy(chunk: NonNull<Self>) {
        let (base, allocation) = {
            // SAFETY: The caller guarantees the chunk is still live.
            let chunk_ref = unsafe { chunk.as_ref() };
            (chunk_ref.base, chunk_ref.layout.allocation)
        };

        // SAFETY: The chunk struct is initialized and never used again, so we can drop it
        // (which releases the free list array).
        unsafe {
            chunk.drop_in_place();
        }

        // SAFETY: The allocation was made in `create()` with this same layout.
        unsafe {
            alloc::dealloc(base.as_ptr(), allocation);
        }
    }

    /// Locates the chunk containing the entry at position `pos` whose data starts at `data`.
    ///
    /// # Safety
    ///
    /// `data` must be the data pointer of the entry at position `pos` of some chunk that was
    /// created with `layout`.
    pub(crate) unsafe fn from_data(data: NonNull<u8>, pos: u8, layout: &ChunkLayout) -> NonNull<Self> {
        // SAFETY: Forwarding the caller's guarantee, so we remain within the chunk allocation.
        unsafe { data.byte_sub(layout.data_offset(pos)) }.cast()
    }

    pub(crate) fn owner(&self) -> PoolId {
        self.owner
    }

    pub(crate) fn capacity(&self) -> u8 {
        self.layout.capacity.get()
    }

    pub(crate) fn is_free(&self) -> bool {
        self.free_entry != UNDEF_POS
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.busy == 0
    }

    pub(crate) fn num_free(&self) -> u8 {
        // Cannot underflow because busy never exceeds capacity.
        self.capacity().wrapping_sub(self.busy)
    }

    pub(crate) fn max_block_size(&self) -> u8 {
        self.max_block_size
    }

    /// The data pointer of the entry at `pos`.
    pub(crate) fn data_ptr(&self, pos: u8) -> NonNull<u8> {
        invariant!(
            pos < self.capacity(),
            "position {pos} is outside of a chunk of {} entries",
            self.capacity()
        );

        // SAFETY: The position is in bounds, so the offset stays within the chunk allocation.
        unsafe { self.base.byte_add(self.layout.data_offset(pos)) }
    }

    /// Whether `data` is the data pointer of one of the entries of this chunk.
    pub(crate) fn contains(&self, data: NonNull<u8>) -> bool {
        let first = self.data_ptr(0).addr().get();
        let address = data.addr().get();
        let stride = self.layout.stride();

        let Some(offset) = address.checked_sub(first) else {
            return false;
        };

        // The stride is never zero because every entry contains a header.
        #[expect(clippy::integer_division, reason = "we are computing an index, remainder checked")]
        let index = offset / stride;

        offset % stride == 0 && index < usize::from(self.capacity())
    }

    pub(crate) fn entry_info(&self, pos: u8) -> EntryInfo {
        // SAFETY: Headers are initialized in `create()` and live as long as the chunk.
        unsafe { self.header_ptr(pos).as_ref() }.info()
    }

    /// The allocation event of the busy entry with the lowest position, if any.
    pub(crate) fn first_busy_event(&self) -> Option<u64> {
        (0..self.capacity())
            .map(|pos| self.entry_info(pos))
            .find(EntryInfo::is_busy)
            .map(|info| info.alloc_event())
    }

    /// Takes the entry at the head of the free list.
    pub(crate) fn allocate_entry(&mut self, events: &mut EventCounter) -> NonNull<u8> {
        invariant!(
            self.is_free(),
            "cannot allocate an entry from a full chunk"
        );

        let pos = self.free_entry;
        self.header_mut(pos).mark_allocated(events.next());
        self.free_entry = self.next_free(pos);

        // Cannot overflow because the chunk had a free entry.
        self.busy = self.busy.wrapping_add(1);
        self.max_block_size = self.max_block_size.saturating_sub(1);

        #[cfg(debug_assertions)]
        self.integrity_check();

        self.data_ptr(pos)
    }

    /// Takes `count` entries with consecutive positions from the head of the free list and
    /// returns the data pointer of the first one.
    pub(crate) fn allocate_block(&mut self, count: u8, events: &mut EventCounter) -> NonNull<u8> {
        invariant!(count > 0, "cannot allocate a block of zero entries");
        invariant!(
            self.max_block_size >= count,
            "block of {count} entries requested from a chunk with a contiguous run of only {}",
            self.max_block_size
        );

        let first = self.free_entry;

        for offset in 0..count {
            let pos = self.free_entry;

            invariant!(
                u16::from(pos) == u16::from(first) + u16::from(offset),
                "free list is not contiguous at position {pos} of a block starting at {first}"
            );

            self.header_mut(pos).mark_allocated(events.next());
            self.free_entry = self.next_free(pos);
        }

        // Cannot overflow or underflow because the estimate is a lower bound of free entries.
        self.busy = self.busy.wrapping_add(count);
        self.max_block_size = self.max_block_size.wrapping_sub(count);

        #[cfg(debug_assertions)]
        self.integrity_check();

        self.data_ptr(first)
    }

    /// Returns the entry at `pos` to the head of the free list.
    pub(crate) fn deallocate_entry(&mut self, pos: u8, event: u64) {
        invariant!(
            !self.is_empty(),
            "cannot deallocate an entry of a chunk that has no allocated entries"
        );

        self.push_free(pos, event);

        // Cannot underflow because we just checked that the chunk is not empty.
        self.busy = self.busy.wrapping_sub(1);

        #[cfg(debug_assertions)]
        self.integrity_check();
    }

    /// Returns `count` entries with consecutive positions starting at `first`, from the highest
    /// position down, so the block ends up as an ascending run at the head of the free list.
    pub(crate) fn deallocate_block(&mut self, first: u8, count: u8, events: &mut EventCounter) {
        invariant!(
            self.busy >= count,
            "cannot deallocate {count} entries from a chunk with only {} allocated",
            self.busy
        );
        invariant!(
            u16::from(first) + u16::from(count) <= u16::from(self.capacity()),
            "block of {count} entries at position {first} does not fit into one chunk"
        );

        for offset in (0..count).rev() {
            // Cannot overflow because we checked the block bounds above.
            self.push_free(first.wrapping_add(offset), events.next());
        }

        // Cannot underflow because we checked the busy count above.
        self.busy = self.busy.wrapping_sub(count);

        #[cfg(debug_assertions)]
        self.integrity_check();
    }

    /// Rebuilds the free list of an empty chunk in ascending order, restoring the contiguous run
    /// estimate to the full capacity.
    pub(crate) fn reset_free_list(&mut self) {
        invariant!(
            self.is_empty(),
            "only a chunk without allocated entries can have its free list rebuilt"
        );

        let capacity = self.capacity();

        for (slot, next) in self
            .next_free
            .iter_mut()
            .zip((1..capacity).chain(iter::once(UNDEF_POS)))
        {
            *slot = next;
        }

        self.free_entry = 0;
        self.max_block_size = capacity;

        #[cfg(debug_assertions)]
        self.integrity_check();
    }

    fn push_free(&mut self, pos: u8, event: u64) {
        self.header_mut(pos).mark_deallocated(event);

        // Extending the ascending run at the head keeps the estimate, anything else
        // starts a new run of one.
        if u16::from(pos) + 1 == u16::from(self.free_entry) {
            self.max_block_size = self.max_block_size.saturating_add(1).min(self.capacity());
        } else {
            self.max_block_size = 1;
        }

        let head = self.free_entry;
        *self.next_free_mut(pos) = head;
        self.free_entry = pos;
    }

    fn next_free(&self, pos: u8) -> u8 {
        *self
            .next_free
            .get(usize::from(pos))
            .expect("free list positions are always within chunk capacity")
    }

    fn next_free_mut(&mut self, pos: u8) -> &mut u8 {
        self.next_free
            .get_mut(usize::from(pos))
            .expect("free list positions are always within chunk capacity")
    }

    fn header_ptr(&self, pos: u8) -> NonNull<EntryHeader> {
        // SAFETY: `data_ptr()` only returns data pointers of entries of this chunk.
        unsafe { EntryHeader::from_data(self.data_ptr(pos)) }
    }

    fn header_mut(&mut self, pos: u8) -> &mut EntryHeader {
        // SAFETY: Headers are initialized in `create()` and live as long as the chunk. They are
        // outside the chunk struct, so this does not alias `self`.
        unsafe { self.header_ptr(pos).as_mut() }
    }

    fn links(&self, list: ChunkList) -> &Links {
        match list {
            ChunkList::All => &self.all,
            ChunkList::Free => &self.free,
        }
    }

    fn links_mut(&mut self, list: ChunkList) -> &mut Links {
        match list {
            ChunkList::All => &mut self.all,
            ChunkList::Free => &mut self.free,
        }
    }

    pub(crate) fn next(&self, list: ChunkList) -> Option<NonNull<Self>> {
        self.links(list).next
    }

    pub(crate) fn prev(&self, list: ChunkList) -> Option<NonNull<Self>> {
        self.links(list).prev
    }

    /// Inserts `chunk` into `list` in front of `peer`. With no peer, the chunk forms a list
    /// of its own.
    ///
    /// # Safety
    ///
    /// All involved chunks must be live and `chunk` must not currently be a member of `list`.
    pub(crate) unsafe fn attach(mut chunk: NonNull<Self>, list: ChunkList, peer: Option<NonNull<Self>>) {
        // SAFETY: The caller guarantees the peer is live.
        let prev = peer.and_then(|peer| unsafe { peer.as_ref() }.prev(list));

        {
            // SAFETY: The caller guarantees the chunk is live. No other reference to it exists.
            let links = unsafe { chunk.as_mut() }.links_mut(list);
            links.prev = prev;
            links.next = peer;
        }

        if let Some(mut prev) = prev {
            // SAFETY: Members of a list are live, as guaranteed by the caller.
            unsafe { prev.as_mut() }.links_mut(list).next = Some(chunk);
        }

        if let Some(mut peer) = peer {
            // SAFETY: The caller guarantees the peer is live.
            unsafe { peer.as_mut() }.links_mut(list).prev = Some(chunk);
        }
    }

    /// Removes `chunk` from `list`, joining its neighbors. Does nothing if the chunk has
    /// no neighbors in the list.
    ///
    /// # Safety
    ///
    /// `chunk` and its neighbors in `list` must be live.
    pub(crate) unsafe fn detach(mut chunk: NonNull<Self>, list: ChunkList) {
        // SAFETY: The caller guarantees the chunk is live. No other reference to it exists.
        let links = mem::take(unsafe { chunk.as_mut() }.links_mut(list));

        if let Some(mut prev) = links.prev {
            // SAFETY: The caller guarantees the neighbors are live.
            unsafe { prev.as_mut() }.links_mut(list).next = links.next;
        }

        if let Some(mut next) = links.next {
            // SAFETY: The caller guarantees the neighbors are live.
            unsafe { next.as_mut() }.links_mut(list).prev = links.prev;
        }
    }

    /// Walks the chunk and panics if any bookkeeping is inconsistent.
    #[cfg(debug_assertions)]
    #[cfg_attr(test, mutants::skip)] // Mutations only weaken the checks.
    pub(crate) fn integrity_check(&self) {
        let capacity = self.capacity();
        let mut seen = vec![false; usize::from(capacity)];

        let mut free_count: u8 = 0;
        let mut run: u8 = 0;
        let mut run_open = true;
        let mut previous: Option<u8> = None;

        let mut pos = self.free_entry;

        while pos != UNDEF_POS {
            assert!(pos < capacity, "free list position {pos} out of bounds");

            let slot = seen
                .get_mut(usize::from(pos))
                .expect("we just checked that the position is in bounds");
            assert!(!*slot, "free list visits position {pos} twice");
            *slot = true;

            assert!(
                !self.entry_info(pos).is_busy(),
                "busy entry {pos} is in the free list"
            );

            if run_open {
                match previous {
                    Some(previous) if u16::from(previous) + 1 != u16::from(pos) => {
                        run_open = false;
                    }
                    _ => run = run.wrapping_add(1),
                }
            }

            previous = Some(pos);
            free_count = free_count.wrapping_add(1);
            pos = self.next_free(pos);
        }

        assert_eq!(
            u16::from(free_count) + u16::from(self.busy),
            u16::from(capacity),
            "free and busy entries do not add up to the chunk capacity"
        );

        let busy_headers = (0..capacity)
            .filter(|pos| self.entry_info(*pos).is_busy())
            .count();
        assert_eq!(busy_headers, usize::from(self.busy));

        assert!(
            self.max_block_size <= run,
            "contiguous run estimate {} exceeds the actual run of {run}",
            self.max_block_size
        );
    }
}
