//! End-to-end scenarios run against the CPU reference implementation, which
//! shares kernels, thresholds and descriptor math with the shaders. The
//! GPU-backed versions of these scenarios live in tests/gpu.rs and only run
//! when an adapter is present.

use image::GrayImage;
use sift_gpu::{cpu, Descriptors, SiftOptions};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Deterministic blobby test image: low-passed LCG noise.
fn textured_image(width: u32, height: u32) -> GrayImage {
    let mut rng = 0x2545f491u32;
    let mut noise = vec![0u8; (width * height) as usize];
    for v in noise.iter_mut() {
        rng = rng.wrapping_mul(1664525).wrapping_add(1013904223);
        *v = (rng >> 24) as u8;
    }
    let img = GrayImage::from_vec(width, height, noise).unwrap();
    let small = image::imageops::resize(
        &img,
        (width / 4).max(1),
        (height / 4).max(1),
        image::imageops::FilterType::Triangle,
    );
    image::imageops::resize(&small, width, height, image::imageops::FilterType::Triangle)
}

fn float_descriptors(d: &Descriptors) -> &ndarray::Array2<f32> {
    match d {
        Descriptors::Float(a) => a,
        _ => panic!("expected float descriptors"),
    }
}

#[test]
fn rotated_image_matches_itself() {
    init_logger();
    let img = textured_image(128, 128);
    let rotated = image::imageops::rotate90(&img);

    let options = SiftOptions {
        contrast_threshold: 0.02,
        ..Default::default()
    };
    let a = cpu::detect_and_compute(&img, &options).unwrap();
    let b = cpu::detect_and_compute(&rotated, &options).unwrap();
    assert!(a.keypoints.len() >= 10, "too few keypoints: {}", a.keypoints.len());

    let matches = cpu::match_descriptors(
        float_descriptors(&a.descriptors),
        float_descriptors(&b.descriptors),
        0.75,
    );
    assert!(matches.len() >= 5, "only {} matches", matches.len());

    // rotate90 maps source pixel (x, y) to (height - 1 - y, x). Coarser
    // octaves quantize positions to 2^o, so the tolerance grows with the
    // query's octave.
    let h = img.height() as f32;
    let inliers = matches
        .iter()
        .filter(|m| {
            let ka = &a.keypoints[m.query_idx];
            let kb = &b.keypoints[m.train_idx];
            let predicted = (h - 1.0 - ka.y, ka.x);
            let d = ((predicted.0 - kb.x).powi(2) + (predicted.1 - kb.y).powi(2)).sqrt();
            let tol = 4.0 + 2.0 * (1u32 << ka.octave) as f32;
            d <= tol
        })
        .count();
    assert!(
        inliers * 2 >= matches.len(),
        "{inliers} inliers out of {} matches",
        matches.len()
    );
}

#[test]
fn quantized_run_agrees_with_float_run() {
    init_logger();
    let img = textured_image(128, 128);
    let rotated = image::imageops::rotate90(&img);
    let float_opts = SiftOptions {
        contrast_threshold: 0.02,
        ..Default::default()
    };
    let quant_opts = SiftOptions {
        quantize_descriptors: true,
        ..float_opts.clone()
    };

    let fa = cpu::detect_and_compute(&img, &float_opts).unwrap();
    let fb = cpu::detect_and_compute(&rotated, &float_opts).unwrap();
    let qa = cpu::detect_and_compute(&img, &quant_opts).unwrap();
    let qb = cpu::detect_and_compute(&rotated, &quant_opts).unwrap();

    // Quantization changes descriptor storage only, never detection.
    assert_eq!(fa.keypoints.len(), qa.keypoints.len());
    assert_eq!(fb.keypoints.len(), qb.keypoints.len());

    let float_matches = cpu::match_descriptors(
        float_descriptors(&fa.descriptors),
        float_descriptors(&fb.descriptors),
        0.75,
    );
    let (da, db) = match (&qa.descriptors, &qb.descriptors) {
        (Descriptors::Quantized(a), Descriptors::Quantized(b)) => (a, b),
        _ => panic!("expected quantized descriptors"),
    };
    let quant_matches = cpu::match_quantized(da, db, 0.75);

    let common = quant_matches
        .iter()
        .filter(|qm| {
            float_matches
                .iter()
                .any(|fm| fm.query_idx == qm.query_idx && fm.train_idx == qm.train_idx)
        })
        .count();
    assert!(
        common * 10 >= float_matches.len() * 8,
        "only {common} of {} float matches survive quantization",
        float_matches.len()
    );
}

#[test]
fn odd_dimensions_are_handled() {
    init_logger();
    let img = textured_image(63, 47);
    let options = SiftOptions {
        contrast_threshold: 0.01,
        ..Default::default()
    };
    let result = cpu::detect_and_compute(&img, &options).unwrap();
    for kp in &result.keypoints {
        assert!(kp.x >= 0.0 && kp.x <= 64.0, "x out of range: {}", kp.x);
        assert!(kp.y >= 0.0 && kp.y <= 48.0, "y out of range: {}", kp.y);
        assert!(kp.orientation >= 0.0 && kp.orientation < 2.0 * std::f32::consts::PI);
    }
    assert_eq!(result.descriptors.len(), result.keypoints.len());
}

#[test]
fn keypoint_count_respects_cap() {
    init_logger();
    let img = textured_image(128, 128);
    let options = SiftOptions {
        contrast_threshold: 0.005,
        max_keypoints: 5,
        ..Default::default()
    };
    let result = cpu::detect_and_compute(&img, &options).unwrap();
    assert!(result.keypoints.len() <= 5);
    assert!(result.truncated, "cap of 5 should truncate this image");
}

#[test]
fn tiny_image_is_rejected() {
    init_logger();
    let img = textured_image(6, 6);
    let err = cpu::detect_keypoints(&img, &SiftOptions::default());
    assert!(matches!(err, Err(sift_gpu::SiftError::BadConfig(_))));
}
