use criterion::{criterion_group, criterion_main, Criterion};
use kaze::image::{gaussian_kernel, horizontal_filter, vertical_filter, GrayFloatImage};
use kaze::{Kaze, Options};

fn test_image(size: usize) -> GrayFloatImage {
    let mut image = GrayFloatImage::new(size, size);
    for y in 0..size {
        for x in 0..size {
            let tile = ((x / 16 + y / 16) % 2) as f32;
            let dx = x as f32 - size as f32 / 2.0;
            let dy = y as f32 - size as f32 / 2.0;
            let blob = (-(dx * dx + dy * dy) / 512.0).exp();
            image.put(x, y, 0.5 * tile + 0.5 * blob);
        }
    }
    image
}

fn extract(c: &mut Criterion) {
    let image = test_image(256);
    let options = Options {
        img_width: 256,
        img_height: 256,
        ..Options::default()
    };
    let mut engine = Kaze::new(options).unwrap();
    c.bench_function("detect_and_compute", |b| {
        b.iter(|| engine.detect_and_compute(&image).unwrap())
    });
}

criterion_group!(
    name = kaze;
    config = Criterion::default().sample_size(10);
    targets = extract
);

fn bench_horizontal_filter(c: &mut Criterion) {
    let image = test_image(256);
    let small_kernel = gaussian_kernel(1.0, 7);
    c.bench_function("horizontal_filter_small_kernel", |b| {
        b.iter(|| horizontal_filter(&image, &small_kernel))
    });
    let large_kernel = gaussian_kernel(10.0, 71);
    c.bench_function("horizontal_filter_large_kernel", |b| {
        b.iter(|| horizontal_filter(&image, &large_kernel))
    });
}

fn bench_vertical_filter(c: &mut Criterion) {
    let image = test_image(256);
    let small_kernel = gaussian_kernel(1.0, 7);
    c.bench_function("vertical_filter_small_kernel", |b| {
        b.iter(|| vertical_filter(&image, &small_kernel))
    });
    let large_kernel = gaussian_kernel(10.0, 71);
    c.bench_function("vertical_filter_large_kernel", |b| {
        b.iter(|| vertical_filter(&image, &large_kernel))
    });
}

criterion_group!(
    name = kaze_image;
    config = Criterion::default().sample_size(10);
    targets = bench_horizontal_filter, bench_vertical_filter
);

criterion_main!(kaze, kaze_image);
