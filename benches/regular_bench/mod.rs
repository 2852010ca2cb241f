pub use criterion::Criterion;

pub mod buffer;

pub fn bench(c: &mut Criterion) {
    buffer::bench(c);
}
