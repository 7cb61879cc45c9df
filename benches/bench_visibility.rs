use criterion::{Criterion, black_box, criterion_group, criterion_main};
use image::{Rgb, Rgb32FImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use imgcmp::{Comparator, Device, ViewingParameters};

fn noisy_pair(width: u32, height: u32) -> (Rgb32FImage, Rgb32FImage) {
    let mut rng = StdRng::seed_from_u64(42);
    let reference = Rgb32FImage::from_fn(width, height, |x, y| {
        let v = ((x ^ y) & 0xff) as f32 / 255.0;
        Rgb([v, 1.0 - v, 0.5])
    });
    let mut candidate = reference.clone();
    for value in candidate.iter_mut() {
        *value = (*value + rng.random_range(-0.02..0.02)).clamp(0.0, 1.0);
    }
    (reference, candidate)
}

fn bench_cpu_frame(c: &mut Criterion) {
    let viewing = ViewingParameters::default();
    let mut group = c.benchmark_group("cpu_frame");
    for size in [128u32, 512] {
        let (reference, candidate) = noisy_pair(size, size);
        let mut comparator = Comparator::new(Device::Cpu).expect("cpu comparator");
        group.bench_function(format!("{size}x{size}"), |b| {
            b.iter(|| {
                let output = comparator
                    .compute_frame(Some(&reference), Some(&candidate), &viewing)
                    .expect("frame");
                black_box(output.visibility().map(|map| map.pixels()[0]));
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_cpu_frame);
criterion_main!(benches);
