use std::any::{self, TypeId};
use std::cell::RefCell;
use std::mem;
use std::num::NonZero;
use std::ptr::NonNull;
use std::rc::Rc;
use std::thread;

use foldhash::HashMap;

use crate::fatal::invariant;
use crate::{FixedPool, GenericPool, Pool, PoolExt, PoolRegistryBuilder, Ptr};

/// A [`FixedPool`] shared between a registry, allocators and strategies.
pub type SharedFixedPool = Rc<RefCell<FixedPool>>;

/// A [`GenericPool`] shared between a registry and its users.
pub type SharedGenericPool = Rc<RefCell<GenericPool>>;

/// Selects the pool that backs an object created through a [`PoolRegistry`].
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum Strategy {
    /// The registry's default [`FixedPool`] for the object's type, created on first use.
    DefaultFixedPool,

    /// The registry's [`GenericPool`], one heap allocation per object.
    GenericPool,

    /// A [`FixedPool`] supplied by the caller. Its item layout must fit the object's type.
    CustomPool(SharedFixedPool),
}

#[derive(Debug, Default)]
struct DefaultPools {
    by_type: HashMap<TypeId, SharedFixedPool>,

    // Type names in creation order, for teardown in reverse and for diagnostics.
    creation_order: Vec<(TypeId, &'static str)>,
}

/// Owns the per-type default pools and the shared generic pool of a program.
///
/// Default pools are created lazily, the first time a type asks for one, with the chunk capacity
/// configured on the registry. The registry is explicitly constructed and explicitly torn down:
/// [`deinit()`](Self::deinit) (or dropping the registry) releases the pools in reverse creation
/// order and reports any pool that is still shared or still holds objects.
///
/// # Example
///
/// ```
/// use chunk_pool::{PoolRegistry, Strategy};
///
/// let registry = PoolRegistry::new();
///
/// let mut pooled = registry.create(&Strategy::DefaultFixedPool, 17_u32);
/// let mut boxed = registry.create(&Strategy::GenericPool, [0_u8; 1000]);
/// assert_eq!(registry.len(), 2);
///
/// registry.destroy(&Strategy::DefaultFixedPool, &mut pooled);
/// registry.destroy(&Strategy::GenericPool, &mut boxed);
///
/// registry.deinit();
/// ```
#[derive(Debug)]
pub struct PoolRegistry {
    chunk_capacity: NonZero<u8>,
    default_pools: RefCell<DefaultPools>,
    generic: SharedGenericPool,
}

impl PoolRegistry {
    /// Creates a registry with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Creates a builder for configuring and constructing a [`PoolRegistry`].
    #[inline]
    pub fn builder() -> PoolRegistryBuilder {
        PoolRegistryBuilder::new()
    }

    pub(crate) fn new_inner(chunk_capacity: NonZero<u8>) -> Self {
        tracing::debug!(chunk_capacity = chunk_capacity.get(), "created pool registry");

        Self {
            chunk_capacity,
            default_pools: RefCell::new(DefaultPools::default()),
            generic: Rc::new(RefCell::new(GenericPool::new())),
        }
    }

    /// The chunk capacity of the default pools this registry creates.
    #[must_use]
    #[inline]
    pub fn chunk_capacity(&self) -> NonZero<u8> {
        self.chunk_capacity
    }

    /// Returns the default pool for `T`, creating it on first use.
    #[must_use]
    pub fn default_pool<T: 'static>(&self) -> SharedFixedPool {
        let mut pools = self.default_pools.borrow_mut();
        let type_id = TypeId::of::<T>();

        if let Some(pool) = pools.by_type.get(&type_id) {
            return Rc::clone(pool);
        }

        let pool = FixedPool::builder()
            .layout_of::<T>()
            .chunk_capacity(self.chunk_capacity)
            .build();

        tracing::debug!(
            item_type = any::type_name::<T>(),
            pool = %pool.id(),
            "created default pool"
        );

        let pool = Rc::new(RefCell::new(pool));
        pools.by_type.insert(type_id, Rc::clone(&pool));
        pools.creation_order.push((type_id, any::type_name::<T>()));

        pool
    }

    /// Returns the generic pool of the registry.
    #[must_use]
    pub fn generic_pool(&self) -> SharedGenericPool {
        Rc::clone(&self.generic)
    }

    /// The number of objects currently allocated from the registry's pools.
    #[must_use]
    pub fn len(&self) -> usize {
        let pools = self.default_pools.borrow();

        pools
            .by_type
            .values()
            .map(|pool| pool.borrow().len())
            .sum::<usize>()
            .wrapping_add(self.generic.borrow().len())
    }

    /// Whether no objects are allocated from the registry's pools.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Moves `value` into the pool selected by `strategy` and returns a handle to it.
    ///
    /// # Panics
    ///
    /// Panics if a custom pool's item layout does not fit `T`.
    #[must_use]
    pub fn create<T: 'static>(&self, strategy: &Strategy, value: T) -> Ptr<T> {
        let raw = match strategy {
            Strategy::DefaultFixedPool => create_in(&self.default_pool::<T>(), value),
            Strategy::GenericPool => create_in(&self.generic, value),
            Strategy::CustomPool(pool) => create_in(pool, value),
        };

        // SAFETY: The object was just created by a pool of this crate. A pool dropped while it
        // still holds objects leaks their memory instead of releasing it, so the handle stays
        // valid even if it outlives the pool.
        unsafe { Ptr::from_raw(raw) }
    }

    /// Destroys the object referenced by `ptr`, which must be its only handle, leaving `ptr`
    /// null. Does nothing for a null handle.
    ///
    /// The object is moved out of the pool before it is dropped, so its `Drop` implementation may
    /// itself destroy other objects through the registry.
    ///
    /// # Panics
    ///
    /// Panics if the object was not created with the same `strategy` or if other handles still
    /// reference it.
    pub fn destroy<T: 'static>(&self, strategy: &Strategy, ptr: &mut Ptr<T>) {
        if ptr.is_null() {
            return;
        }

        let value = match strategy {
            Strategy::DefaultFixedPool => take_from(&self.default_pool::<T>(), ptr),
            Strategy::GenericPool => take_from(&self.generic, ptr),
            Strategy::CustomPool(pool) => take_from(pool, ptr),
        };

        drop(value);
    }

    /// Tears down the registry, releasing its pools in reverse creation order.
    ///
    /// Dropping the registry has the same effect.
    ///
    /// # Panics
    ///
    /// Panics if any pool is still shared, for example by a live
    /// [`PoolAllocator`][crate::PoolAllocator], or still holds objects.
    pub fn deinit(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        let pools = mem::take(self.default_pools.get_mut());

        if !pools.creation_order.is_empty() {
            tracing::debug!(
                default_pools = pools.creation_order.len(),
                "tearing down pool registry"
            );
        }

        let DefaultPools {
            mut by_type,
            creation_order,
        } = pools;

        for (type_id, type_name) in creation_order.into_iter().rev() {
            let Some(pool) = by_type.remove(&type_id) else {
                continue;
            };

            // Cannot underflow because we hold one reference ourselves.
            let sharers = Rc::strong_count(&pool).wrapping_sub(1);

            // If we are already panicking, we do not want to panic again because that will
            // simply obscure whatever the original panic was, leading to debug difficulties.
            if !thread::panicking() {
                invariant!(
                    sharers == 0,
                    "default pool for {type_name} is still shared by {sharers} other handles \
                     at registry teardown"
                );
            }

            tracing::debug!(item_type = type_name, "releasing default pool");

            // The pool itself reports any objects still allocated from it.
            drop(pool);
        }

        if !thread::panicking() {
            let generic_sharers = Rc::strong_count(&self.generic).wrapping_sub(1);

            invariant!(
                generic_sharers == 0,
                "generic pool is still shared by {generic_sharers} other handles at registry \
                 teardown"
            );
            invariant!(
                self.generic.borrow().is_empty(),
                "generic pool still holds {} objects at registry teardown",
                self.generic.borrow().len()
            );
        }
    }
}

fn create_in<P: Pool, T>(pool: &RefCell<P>, value: T) -> NonNull<T> {
    pool.borrow_mut().create(value)
}

fn take_from<P: Pool, T>(pool: &RefCell<P>, ptr: &mut Ptr<T>) -> Option<T> {
    ptr.take(&mut *pool.borrow_mut())
}

impl Default for PoolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PoolRegistry {
    fn drop(&mut self) {
        self.teardown();
    }
}
