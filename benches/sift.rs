use divan::{black_box, Bencher};
use image::GrayImage;
use ndarray::Array2;

use sift_gpu::{cpu, SiftOptions};

fn main() {
    divan::main();
}

/// Deterministic textured test image (no asset files needed).
fn textured_image(size: u32) -> GrayImage {
    let mut rng = 0x2545f491u32;
    let mut noise = vec![0u8; (size * size) as usize];
    for v in noise.iter_mut() {
        rng = rng.wrapping_mul(1664525).wrapping_add(1013904223);
        *v = (rng >> 24) as u8;
    }
    let img = GrayImage::from_vec(size, size, noise).unwrap();
    // Low-pass a little so the noise has structure at detectable scales.
    image::imageops::resize(
        &image::imageops::resize(&img, size / 4, size / 4, image::imageops::FilterType::Triangle),
        size,
        size,
        image::imageops::FilterType::Triangle,
    )
}

#[divan::bench]
fn cpu_detect_and_compute(bencher: Bencher) {
    let img = textured_image(256);
    let options = SiftOptions::default();
    bencher.bench_local(|| black_box(cpu::detect_and_compute(&img, &options).unwrap()));
}

#[divan::bench]
fn cpu_scale_space_only(bencher: Bencher) {
    let img = textured_image(256);
    let gray = Array2::from_shape_fn((256, 256), |(y, x)| {
        img.get_pixel(x as u32, y as u32).0[0] as f32 / 255.0
    });
    let options = SiftOptions::default();
    bencher.bench_local(|| black_box(cpu::build_scale_space(&gray, &options)));
}

#[divan::bench(args = [64, 256])]
fn cpu_match_descriptors(bencher: Bencher, n: usize) {
    let mut rng = 0x9e3779b9u32;
    let mut desc = Array2::<f32>::zeros((n, 128));
    for mut row in desc.rows_mut() {
        for v in row.iter_mut() {
            rng = rng.wrapping_mul(1664525).wrapping_add(1013904223);
            *v = (rng >> 16) as f32 / 65535.0;
        }
        let norm: f32 = row.iter().map(|v| v * v).sum::<f32>().sqrt();
        row.mapv_inplace(|v| v / norm);
    }
    bencher.bench_local(|| black_box(cpu::match_descriptors(&desc, &desc, 0.75)));
}
