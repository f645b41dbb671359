//! Pooled objects through a registry, with pool activity logged to the terminal.
//!
//! Run with `cargo run --example pooled_objects` to see chunks being created and released as the
//! number of live objects crosses a chunk boundary.

use chunk_pool::{PoolRegistry, Ptr, Strategy};
use new_zealand::nz;

struct Particle {
    position: (f32, f32),
    velocity: (f32, f32),
}

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    // Small chunks make chunk creation and release visible with few objects.
    let registry = PoolRegistry::builder().chunk_capacity(nz!(16)).build();

    let mut particles: Vec<Ptr<Particle>> = (0..40_u8)
        .map(|index| {
            registry.create(
                &Strategy::DefaultFixedPool,
                Particle {
                    position: (f32::from(index), 0.0),
                    velocity: (1.0, f32::from(index) / 10.0),
                },
            )
        })
        .collect();

    let pool = registry.default_pool::<Particle>();
    println!(
        "{} particles live in {} chunks",
        pool.borrow().len(),
        pool.borrow().chunk_count()
    );

    // A second handle to the same particle shares the object and its reference count.
    let tracked = Ptr::clone(&particles[7]);
    println!(
        "particle 7 at {:?} moving {:?} has {} handles",
        tracked.position,
        tracked.velocity,
        tracked.ref_count()
    );
    drop(tracked);

    for particle in &mut particles {
        registry.destroy(&Strategy::DefaultFixedPool, particle);
    }

    println!(
        "after destroying all particles: {} chunk retained\n{}",
        pool.borrow().chunk_count(),
        pool.borrow().stats()
    );

    // Objects of any size can use the generic pool instead.
    let mut frame = registry.create(&Strategy::GenericPool, [0_u8; 4096]);
    println!("frame buffer of {} bytes", frame.len());
    registry.destroy(&Strategy::GenericPool, &mut frame);

    drop(pool);
    drop(particles);
    registry.deinit();
}
