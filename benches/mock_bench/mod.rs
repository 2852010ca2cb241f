pub use criterion::Criterion;

pub mod barrier;
pub mod refine;

pub fn bench(c: &mut Criterion) {
    barrier::bench(c);
    refine::bench(c);
}
