//! Chunked memory pools for single-threaded programs that create and destroy many small objects.
//!
//! This crate provides [`FixedPool`], which carves same-sized entries out of chunks of up to
//! [`MAX_CHUNK_ENTRIES`] entries, and [`GenericPool`], a fallback that performs one heap
//! allocation per entry. Every entry carries a small header that records which pool owns it and
//! how many [`Ptr`] handles reference it, so misuse is detected instead of corrupting memory.
//!
//! # Key Features
//!
//! - **Cheap allocation**: a free entry is taken from an in-chunk free list in O(1)
//! - **Chunk caching**: at most one empty chunk is retained, so churn at a chunk boundary does
//!   not hit the heap on every call
//! - **Blocks**: up to a chunk's worth of consecutive entries can be allocated at once
//! - **Counted handles**: [`Ptr<T>`] counts references and refuses to destroy a shared object
//! - **Registry**: [`PoolRegistry`] lazily creates one default pool per type and picks a pool
//!   per call through a [`Strategy`]
//! - **Container adapter**: [`PoolAllocator`] lets node-based containers keep their nodes in
//!   pools through the [`ContainerAllocator`] trait
//!
//! # Misuse handling
//!
//! Recoverable conditions, such as a block request larger than a chunk, are reported as
//! [`AllocationError`]. Programming errors, such as freeing an entry twice, handing an entry to
//! the wrong pool, destroying an object that other handles still reference or dropping a pool
//! with live entries, are reported through `tracing` and then panic with an
//! [`InvariantViolation`] message.
//!
//! # Example
//!
//! ```
//! use chunk_pool::{PoolRegistry, Ptr, Strategy};
//!
//! let registry = PoolRegistry::new();
//!
//! let mut first = registry.create(&Strategy::DefaultFixedPool, String::from("pooled"));
//! let mut second = Ptr::clone(&first);
//! assert_eq!(first.ref_count(), 2);
//! assert_eq!(second.len(), 6);
//!
//! // Only the last handle may destroy the object.
//! second.set_null();
//! registry.destroy(&Strategy::DefaultFixedPool, &mut first);
//! assert!(first.is_null());
//!
//! registry.deinit();
//! ```
//!
//! # Thread safety
//!
//! Pools, handles and registries are single-threaded. They are neither [`Send`] nor [`Sync`].

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

mod allocator;
mod builder;
mod chunk;
mod entry;
mod error;
mod fatal;
mod fixed_pool;
mod generic_pool;
mod pool;
mod ptr;
mod registry;
mod stats;

pub use allocator::*;
pub use builder::*;
pub use chunk::MAX_CHUNK_ENTRIES;
pub use entry::EntryInfo;
pub use error::{AllocationError, InvariantViolation};
pub use fixed_pool::{ChunkId, FixedPool};
pub use generic_pool::GenericPool;
pub use pool::{Pool, PoolExt, PoolId, PoolKind};
pub use ptr::Ptr;
pub use registry::{PoolRegistry, SharedFixedPool, SharedGenericPool, Strategy};
pub use stats::PoolStats;
