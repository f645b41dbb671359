use std::alloc::Layout;
use std::ptr::NonNull;

use crate::PoolId;
use crate::fatal::invariant;

/// Bookkeeping stored directly in front of the data of every pool entry.
///
/// The header always ends exactly where the data starts. This lets any pool-allocated pointer be
/// traced back to its header with a fixed negative offset, independent of the pool kind and of
/// the item layout.
#[derive(Debug)]
#[repr(C)]
pub(crate) struct EntryHeader {
    owner: PoolId,
    alloc_event: u64,
    dealloc_event: u64,
    ref_count: u32,
    pos: u8,
    busy: bool,
}

impl EntryHeader {
    pub(crate) const fn new(owner: PoolId, pos: u8) -> Self {
        Self {
            owner,
            alloc_event: 0,
            dealloc_event: 0,
            ref_count: 0,
            pos,
            busy: false,
        }
    }

    /// Locates the header of the entry whose data starts at `data`.
    ///
    /// # Safety
    ///
    /// `data` must be a data pointer previously returned by one of the pools of this crate.
    pub(crate) unsafe fn from_data(data: NonNull<u8>) -> NonNull<Self> {
        // SAFETY: Every entry places its header immediately before its data, within the same
        // allocation, as guaranteed by `EntryLayout`.
        unsafe { data.byte_sub(size_of::<Self>()) }.cast()
    }

    pub(crate) fn owner(&self) -> PoolId {
        self.owner
    }

    pub(crate) fn pos(&self) -> u8 {
        self.pos
    }

    pub(crate) fn ref_count(&self) -> u32 {
        self.ref_count
    }

    pub(crate) fn mark_allocated(&mut self, event: u64) {
        invariant!(
            !self.busy,
            "entry at position {} is handed out while still busy (allocated by event {})",
            self.pos,
            self.alloc_event
        );

        self.busy = true;
        self.alloc_event = event;
        self.ref_count = 0;
    }

    pub(crate) fn mark_deallocated(&mut self, event: u64) {
        invariant!(
            self.busy,
            "entry at position {} is already free (allocated by event {}, freed by event {})",
            self.pos,
            self.alloc_event,
            self.dealloc_event
        );
        invariant!(
            self.ref_count == 0,
            "entry allocated by event {} is freed while {} Ptr handles still reference it",
            self.alloc_event,
            self.ref_count
        );

        self.busy = false;
        self.dealloc_event = event;
    }

    pub(crate) fn acquire(&mut self) {
        invariant!(
            self.busy,
            "cannot reference an entry that is not allocated (last freed by event {})",
            self.dealloc_event
        );

        self.ref_count = self
            .ref_count
            .checked_add(1)
            .expect("reference count overflow is not realistic for in-memory handles");
    }

    pub(crate) fn release(&mut self) {
        invariant!(
            self.ref_count > 0,
            "reference count of entry allocated by event {} would drop below zero",
            self.alloc_event
        );

        // Cannot underflow because we just checked that it is non-zero.
        self.ref_count = self.ref_count.wrapping_sub(1);
    }

    /// Clears the reference count of an object that is about to be destroyed through its
    /// only remaining handle.
    pub(crate) fn forget_last_reference(&mut self) {
        invariant!(
            self.ref_count == 1,
            "cannot destroy object allocated by event {} because {} handles reference it \
             and the others would dangle",
            self.alloc_event,
            self.ref_count
        );

        self.ref_count = 0;
    }

    pub(crate) fn info(&self) -> EntryInfo {
        EntryInfo {
            alloc_event: self.alloc_event,
            dealloc_event: self.dealloc_event,
            ref_count: self.ref_count,
            busy: self.busy,
        }
    }
}

/// Debug information recorded for a pool entry.
///
/// Event ids are per-pool sequence numbers shared by allocations and deallocations. When a leak or
/// a double free is reported, the event ids tell which operation produced the entry in question.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EntryInfo {
    alloc_event: u64,
    dealloc_event: u64,
    ref_count: u32,
    busy: bool,
}

impl EntryInfo {
    /// The event id of the most recent allocation of this entry.
    #[must_use]
    pub fn alloc_event(&self) -> u64 {
        self.alloc_event
    }

    /// The event id of the most recent deallocation of this entry, 0 if it was never freed.
    #[must_use]
    pub fn dealloc_event(&self) -> u64 {
        self.dealloc_event
    }

    /// The number of live [`Ptr`][crate::Ptr] handles referencing this entry.
    #[must_use]
    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    /// Whether the entry is currently allocated.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.busy
    }
}

/// Per-pool sequence of allocation and deallocation events. The first event is 1.
#[derive(Debug, Default)]
pub(crate) struct EventCounter {
    last: u64,
}

impl EventCounter {
    pub(crate) fn next(&mut self) -> u64 {
        // Wrapping is harmless, event ids are diagnostics only.
        self.last = self.last.wrapping_add(1);
        self.last
    }
}

/// Memory layout of a single entry: padding, header, then data.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct EntryLayout {
    entry: Layout,
    data_offset: usize,
}

impl EntryLayout {
    pub(crate) fn for_item(item: Layout) -> Self {
        let header = Layout::new::<EntryHeader>();

        // The data offset is a multiple of both alignments and at least as large as the header,
        // so the header sits properly aligned right in front of the data.
        let data_offset = header
            .align_to(item.align())
            .expect("aligning the entry header to a valid item alignment cannot overflow")
            .pad_to_align()
            .size();

        let size = data_offset
            .checked_add(item.size())
            .expect("entry size overflows usize");

        let entry = Layout::from_size_align(size, header.align().max(item.align()))
            .expect("entry layout exceeds the maximum supported allocation size")
            .pad_to_align();

        Self { entry, data_offset }
    }

    /// Layout of the whole entry. The size is also the stride between entries in a chunk.
    pub(crate) fn entry(&self) -> Layout {
        self.entry
    }

    /// Offset from the start of the entry to its header.
    pub(crate) fn header_offset(&self) -> usize {
        // Cannot underflow because the data offset is padded from the header size upwards.
        self.data_offset.wrapping_sub(size_of::<EntryHeader>())
    }

    pub(crate) fn data_offset(&self) -> usize {
        self.data_offset
    }
}
