use std::fmt;

/// Counters describing the lifetime activity of a [`FixedPool`][crate::FixedPool].
///
/// # Example
///
/// ```
/// use chunk_pool::{FixedPool, PoolExt};
///
/// let mut pool = FixedPool::builder().layout_of::<u32>().build();
///
/// let item = pool.create(5_u32);
/// // SAFETY: The item was created by this pool and is not used afterwards.
/// unsafe { pool.destroy(item) };
///
/// let stats = pool.stats();
/// assert_eq!(stats.entries_allocated(), 1);
/// assert_eq!(stats.entries_deallocated(), 1);
/// assert_eq!(stats.live_chunks(), 1);
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PoolStats {
    entries_allocated: u64,
    entries_deallocated: u64,
    chunks_allocated: u64,
    chunks_released: u64,
    free_chunks: u64,
}

impl PoolStats {
    /// Total number of entries handed out since the pool was created.
    #[must_use]
    pub fn entries_allocated(&self) -> u64 {
        self.entries_allocated
    }

    /// Total number of entries returned since the pool was created.
    #[must_use]
    pub fn entries_deallocated(&self) -> u64 {
        self.entries_deallocated
    }

    /// Total number of chunks created since the pool was created.
    #[must_use]
    pub fn chunks_allocated(&self) -> u64 {
        self.chunks_allocated
    }

    /// Total number of chunks released since the pool was created.
    #[must_use]
    pub fn chunks_released(&self) -> u64 {
        self.chunks_released
    }

    /// Number of chunks currently owned by the pool.
    #[must_use]
    pub fn live_chunks(&self) -> u64 {
        // Cannot underflow because a chunk is released at most once.
        self.chunks_allocated.wrapping_sub(self.chunks_released)
    }

    /// Number of chunks that currently have at least one free entry.
    #[must_use]
    pub fn free_chunks(&self) -> u64 {
        self.free_chunks
    }

    pub(crate) fn record_entries_allocated(&mut self, count: usize) {
        self.entries_allocated = self.entries_allocated.wrapping_add(widen(count));
    }

    pub(crate) fn record_entries_deallocated(&mut self, count: usize) {
        self.entries_deallocated = self.entries_deallocated.wrapping_add(widen(count));
    }

    pub(crate) fn record_chunk_allocated(&mut self) {
        self.chunks_allocated = self.chunks_allocated.wrapping_add(1);
    }

    pub(crate) fn record_chunk_released(&mut self) {
        self.chunks_released = self.chunks_released.wrapping_add(1);
    }

    pub(crate) fn set_free_chunks(&mut self, free_chunks: usize) {
        self.free_chunks = widen(free_chunks);
    }
}

fn widen(count: usize) -> u64 {
    u64::try_from(count).expect("usize fits in u64 on every supported target")
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "entries allocated:   {}", self.entries_allocated)?;
        writeln!(f, "entries deallocated: {}", self.entries_deallocated)?;
        writeln!(f, "chunks allocated:    {}", self.chunks_allocated)?;
        writeln!(f, "chunks released:     {}", self.chunks_released)?;
        writeln!(f, "live chunks:         {}", self.live_chunks())?;
        write!(f, "free chunks:         {}", self.free_chunks)
    }
}
