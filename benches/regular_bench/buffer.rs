use criterion::black_box;
use criterion::Criterion;

use g1_refine::queue::BufferAllocator;

pub fn bench(c: &mut Criterion) {
    let allocator = BufferAllocator::new("bench", 256);

    c.bench_function("buffer allocate and release", |b| {
        b.iter(|| {
            let node = allocator.allocate();
            black_box(allocator.index(&node));
            allocator.release(node);
        })
    });

    c.bench_function("buffer allocate and release, 64 at a time", |b| {
        b.iter(|| {
            let nodes: Vec<_> = (0..64).map(|_| allocator.allocate()).collect();
            for node in nodes {
                allocator.release(node);
            }
        })
    });
}
