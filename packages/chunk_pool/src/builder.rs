use std::alloc::Layout;
use std::cell::Cell;
use std::marker::PhantomData;
use std::num::NonZero;

use crate::{FixedPool, MAX_CHUNK_ENTRIES, PoolRegistry};

/// Builder for creating an instance of [`FixedPool`].
///
/// [`FixedPool`] requires the item memory layout to be specified at construction time.
/// Use either `.layout()` to provide a specific layout or `.layout_of::<T>()` to generate
/// a layout based on the provided type.
///
/// The layout is mandatory, whereas other settings are optional.
///
/// # Examples
///
/// ```
/// use std::alloc::Layout;
///
/// use chunk_pool::FixedPool;
///
/// let pool = FixedPool::builder().layout(Layout::new::<u32>()).build();
/// assert_eq!(pool.chunk_capacity().get(), 255);
/// ```
///
/// Smaller chunks:
///
/// ```
/// use chunk_pool::FixedPool;
/// use new_zealand::nz;
///
/// let pool = FixedPool::builder()
///     .layout_of::<u64>()
///     .chunk_capacity(nz!(16))
///     .build();
/// assert_eq!(pool.chunk_capacity().get(), 16);
/// ```
///
/// # Thread safety
///
/// The builder is thread-mobile ([`Send`]) but not thread-safe ([`Sync`]).
#[derive(Debug)]
#[must_use]
pub struct FixedPoolBuilder {
    item_layout: Option<Layout>,
    chunk_capacity: NonZero<u8>,

    _not_sync: PhantomData<Cell<()>>,
}

impl FixedPoolBuilder {
    #[inline]
    pub(crate) fn new() -> Self {
        Self {
            item_layout: None,
            chunk_capacity: MAX_CHUNK_ENTRIES,
            _not_sync: PhantomData,
        }
    }

    /// Sets the memory layout for items stored in the pool.
    ///
    /// Zero-sized layouts are accepted, every entry still carries its header.
    #[inline]
    pub fn layout(mut self, layout: Layout) -> Self {
        self.item_layout = Some(layout);
        self
    }

    /// Sets the memory layout for items stored in the pool based on a type.
    #[inline]
    pub fn layout_of<T>(mut self) -> Self {
        self.item_layout = Some(Layout::new::<T>());
        self
    }

    /// Sets the number of entries in each chunk. Defaults to [`MAX_CHUNK_ENTRIES`].
    ///
    /// This is also the largest block that [`FixedPool::allocate_block()`] can serve.
    #[inline]
    pub fn chunk_capacity(mut self, capacity: NonZero<u8>) -> Self {
        self.chunk_capacity = capacity;
        self
    }

    /// Builds the pool with the specified configuration.
    ///
    /// # Panics
    ///
    /// Panics if no layout has been set using either [`layout`](Self::layout) or
    /// [`layout_of`](Self::layout_of).
    #[must_use]
    #[inline]
    pub fn build(self) -> FixedPool {
        let layout = self.item_layout.expect(
            "Layout must be set using .layout() or .layout_of::<T>() before calling .build()",
        );

        FixedPool::new_inner(layout, self.chunk_capacity)
    }
}

/// Builder for creating an instance of [`PoolRegistry`].
///
/// # Examples
///
/// ```
/// use chunk_pool::PoolRegistry;
/// use new_zealand::nz;
///
/// let registry = PoolRegistry::builder().chunk_capacity(nz!(32)).build();
///
/// let pool = registry.default_pool::<u64>();
/// assert_eq!(pool.borrow().chunk_capacity().get(), 32);
/// # drop(pool);
/// # registry.deinit();
/// ```
#[derive(Debug)]
#[must_use]
pub struct PoolRegistryBuilder {
    chunk_capacity: NonZero<u8>,

    _not_sync: PhantomData<Cell<()>>,
}

impl PoolRegistryBuilder {
    #[inline]
    pub(crate) fn new() -> Self {
        Self {
            chunk_capacity: MAX_CHUNK_ENTRIES,
            _not_sync: PhantomData,
        }
    }

    /// Sets the chunk capacity of the default pools the registry creates.
    /// Defaults to [`MAX_CHUNK_ENTRIES`].
    #[inline]
    pub fn chunk_capacity(mut self, capacity: NonZero<u8>) -> Self {
        self.chunk_capacity = capacity;
        self
    }

    /// Builds the registry. No pools exist until first requested.
    #[must_use]
    #[inline]
    pub fn build(self) -> PoolRegistry {
        PoolRegistry::new_inner(self.chunk_capacity)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::fmt::Debug;

    use new_zealand::nz;
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;

    assert_impl_all!(FixedPoolBuilder: Send, Debug);
    assert_not_impl_any!(FixedPoolBuilder: Sync);
    assert_impl_all!(PoolRegistryBuilder: Send, Debug);
    assert_not_impl_any!(PoolRegistryBuilder: Sync);

    #[test]
    fn new_builder_has_defaults() {
        let builder = FixedPoolBuilder::new();

        assert!(builder.item_layout.is_none());
        assert_eq!(builder.chunk_capacity, MAX_CHUNK_ENTRIES);
    }

    #[test]
    fn layout_of_sets_layout() {
        let builder = FixedPoolBuilder::new().layout_of::<String>();

        assert_eq!(builder.item_layout, Some(Layout::new::<String>()));
    }

    #[test]
    fn zero_sized_layout_is_accepted() {
        let pool = FixedPoolBuilder::new().layout_of::<()>().build();

        assert_eq!(pool.item_layout().size(), 0);
    }

    #[test]
    fn chunk_capacity_is_applied() {
        let pool = FixedPoolBuilder::new()
            .layout_of::<u16>()
            .chunk_capacity(nz!(3))
            .build();

        assert_eq!(pool.chunk_capacity(), nz!(3));
    }

    #[test]
    #[should_panic]
    fn build_without_layout_panics() {
        let _pool = FixedPoolBuilder::new().build();
    }

    #[test]
    fn registry_builder_has_default_capacity() {
        let builder = PoolRegistryBuilder::new();

        assert_eq!(builder.chunk_capacity, MAX_CHUNK_ENTRIES);
    }
}
