//! CPU reference implementation of the GPU pipeline.
//!
//! Single-threaded and written for clarity over speed: its job is to pin
//! down the semantics the shaders implement (same Gaussian kernels, same
//! thresholds, same descriptor math, same two-stage normalization) so the
//! GPU results can be verified against it. It deliberately mirrors the GPU
//! pipeline rather than OpenCV: no sub-pixel refinement, one dominant
//! orientation per keypoint.
//!
//! The scale space uses the same per-octave dimensions as the packed GPU
//! textures (even widths and heights, edge-replicated), so keypoint
//! coordinates line up between the two implementations.

use std::f32::consts::PI;

use image::GrayImage;
use itertools::izip;
use ndarray::Array2;
use nshare::AsNdarray2;

use crate::context::{gaussian_kernel, kernel_radius};
use crate::error::Result;
use crate::{
    sigma_for_scale, Descriptors, KeyPoint, Match, SiftOptions, SiftResult,
    DESCRIPTOR_MAGNITUDE_CAP, DESCRIPTOR_QUANT_SCALE, DESCRIPTOR_SAMPLE_STEP, DESCRIPTOR_SIZE,
    ORIENTATION_HISTOGRAM_BINS, ORIENTATION_SIGMA_FACTOR,
};

const TWO_PI: f32 = 2.0 * PI;

/// Gaussian and DoG stacks for every octave, logical (unpacked) layout.
pub struct ScaleSpace {
    /// `gaussian[o][s]` for `s` in `0..S+3`.
    pub gaussian: Vec<Vec<Array2<f32>>>,
    /// `dog[o][s] = gaussian[o][s+1] - gaussian[o][s]` for `s` in `0..S+2`.
    pub dog: Vec<Vec<Array2<f32>>>,
    sigma_base: f32,
    scales_per_octave: usize,
}

/// Detects keypoints and computes descriptors, the reference counterpart of
/// [`crate::SiftGpu::detect_and_compute`].
pub fn detect_and_compute(img: &GrayImage, options: &SiftOptions) -> Result<SiftResult> {
    options.validate()?;
    check_min_side(img)?;
    let (gray, scale_restore) = prepare_input(img, options);
    let ss = build_scale_space(&gray, options);
    let (mut keypoints, truncated) = find_keypoints(&ss, options);
    let float_desc = compute_descriptors(&ss, &keypoints);
    for kp in &mut keypoints {
        kp.x *= scale_restore;
        kp.y *= scale_restore;
        kp.sigma *= scale_restore;
    }
    let descriptors = if options.quantize_descriptors {
        Descriptors::Quantized(float_desc.mapv(|d| {
            (d * DESCRIPTOR_QUANT_SCALE).round().min(255.0) as u8
        }))
    } else {
        Descriptors::Float(float_desc)
    };
    Ok(SiftResult {
        keypoints,
        descriptors,
        truncated,
    })
}

/// Detects keypoints only.
pub fn detect_keypoints(img: &GrayImage, options: &SiftOptions) -> Result<Vec<KeyPoint>> {
    options.validate()?;
    check_min_side(img)?;
    let (gray, scale_restore) = prepare_input(img, options);
    let ss = build_scale_space(&gray, options);
    let (mut keypoints, _) = find_keypoints(&ss, options);
    for kp in &mut keypoints {
        kp.x *= scale_restore;
        kp.y *= scale_restore;
        kp.sigma *= scale_restore;
    }
    Ok(keypoints)
}

fn check_min_side(img: &GrayImage) -> Result<()> {
    if img.width().min(img.height()) < 8 {
        return Err(crate::SiftError::BadConfig(format!(
            "image too small: {}x{}, min side is 8",
            img.width(),
            img.height()
        )));
    }
    Ok(())
}

/// Normalized luminance plus the coordinate restore factor for images that
/// exceeded `max_image_dimension`.
fn prepare_input(img: &GrayImage, options: &SiftOptions) -> (Array2<f32>, f32) {
    let longest = img.width().max(img.height());
    if options.max_image_dimension > 0 && longest > options.max_image_dimension {
        let scale = options.max_image_dimension as f32 / longest as f32;
        let new_w = ((img.width() as f32 * scale).round() as u32).max(8);
        let new_h = ((img.height() as f32 * scale).round() as u32).max(8);
        let resized = image::imageops::resize(
            img,
            new_w,
            new_h,
            image::imageops::FilterType::Triangle,
        );
        let restore = img.width() as f32 / new_w as f32;
        (normalize(&resized), restore)
    } else {
        (normalize(img), 1.0)
    }
}

fn normalize(img: &GrayImage) -> Array2<f32> {
    img.as_ndarray2().mapv(|v| v as f32 / 255.0)
}

/// Builds the Gaussian and DoG stacks with the same octave dimensions the
/// packed GPU textures use (even, edge-replicated).
pub fn build_scale_space(gray: &Array2<f32>, options: &SiftOptions) -> ScaleSpace {
    let scales = options.scales_per_octave;
    let base = pad_to_even(gray);

    let mut gaussian: Vec<Vec<Array2<f32>>> = Vec::with_capacity(options.num_octaves);
    for o in 0..options.num_octaves {
        let seed = if o == 0 {
            blur(&base, options.sigma_base)
        } else {
            decimate(&gaussian[o - 1][scales])
        };
        let mut octave = Vec::with_capacity(scales + 3);
        octave.push(seed);
        for s in 1..scales + 3 {
            let sigma = crate::delta_sigma(options.sigma_base, s, scales);
            let next = blur(&octave[s - 1], sigma);
            octave.push(next);
        }
        gaussian.push(octave);
    }

    let dog = gaussian
        .iter()
        .map(|octave| {
            (0..scales + 2)
                .map(|s| &octave[s + 1] - &octave[s])
                .collect()
        })
        .collect();

    ScaleSpace {
        gaussian,
        dog,
        sigma_base: options.sigma_base,
        scales_per_octave: scales,
    }
}

/// Pads to even dimensions by replicating the last row/column, mirroring
/// the packed texel layout of the GPU path.
fn pad_to_even(img: &Array2<f32>) -> Array2<f32> {
    let (h, w) = img.dim();
    let ph = h + h % 2;
    let pw = w + w % 2;
    if ph == h && pw == w {
        return img.clone();
    }
    Array2::from_shape_fn((ph, pw), |(y, x)| img[(y.min(h - 1), x.min(w - 1))])
}

/// Separable Gaussian blur with clamp-to-edge sampling, sharing
/// [`gaussian_kernel`] with the GPU kernel cache.
fn blur(img: &Array2<f32>, sigma: f32) -> Array2<f32> {
    let radius = kernel_radius(sigma) as i32;
    let kernel = gaussian_kernel(sigma, radius as u32);
    let (h, w) = img.dim();

    let mut horizontal = Array2::<f32>::zeros((h, w));
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0.0;
            for (t, k) in kernel.iter().enumerate() {
                let sx = (x as i32 + t as i32 - radius).clamp(0, w as i32 - 1) as usize;
                acc += k * img[(y, sx)];
            }
            horizontal[(y, x)] = acc;
        }
    }
    let mut out = Array2::<f32>::zeros((h, w));
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0.0;
            for (t, k) in kernel.iter().enumerate() {
                let sy = (y as i32 + t as i32 - radius).clamp(0, h as i32 - 1) as usize;
                acc += k * horizontal[(sy, x)];
            }
            out[(y, x)] = acc;
        }
    }
    out
}

/// Keeps every other pixel. The destination dimensions follow the packed
/// halving sequence: `2 * max(packed / 2, 1)` per axis.
fn decimate(img: &Array2<f32>) -> Array2<f32> {
    let (h, w) = img.dim();
    let dw = 2 * ((w / 2) / 2).max(1);
    let dh = 2 * ((h / 2) / 2).max(1);
    Array2::from_shape_fn((dh, dw), |(y, x)| img[(2 * y, 2 * x)])
}

/// Scale-space extrema with contrast, 26-neighbor and edge rejection,
/// orientation assigned immediately after. Truncates at `max_keypoints`.
fn find_keypoints(ss: &ScaleSpace, options: &SiftOptions) -> (Vec<KeyPoint>, bool) {
    let scales = options.scales_per_octave;
    let threshold = options.contrast_threshold / scales as f32;
    let mut keypoints = Vec::new();
    let mut truncated = false;

    'octaves: for (o, dog_octave) in ss.dog.iter().enumerate() {
        let upscale = (1u32 << o) as f32;
        for s in 1..=scales {
            let prev = &dog_octave[s - 1];
            let curr = &dog_octave[s];
            let next = &dog_octave[s + 1];
            let (h, w) = curr.dim();
            if w < 4 || h < 4 {
                continue;
            }
            // The GPU skips packed boundary texels, i.e. the outermost two
            // logical pixels on every side.
            for y in 2..h - 2 {
                for x in 2..w - 2 {
                    if !is_extremum(prev, curr, next, x, y, threshold) {
                        continue;
                    }
                    if is_on_edge(curr, x, y, options.edge_threshold) {
                        continue;
                    }
                    let sigma = sigma_for_scale(ss.sigma_base, s, scales) * upscale;
                    let orientation = assign_orientation(
                        &ss.gaussian[o][s],
                        x as f32,
                        y as f32,
                        sigma / upscale,
                    );
                    keypoints.push(KeyPoint {
                        x: x as f32 * upscale,
                        y: y as f32 * upscale,
                        octave: o,
                        scale: s,
                        sigma,
                        orientation,
                    });
                    if keypoints.len() >= options.max_keypoints {
                        truncated = true;
                        log::warn!(
                            "keypoint count reached the cap of {}",
                            options.max_keypoints
                        );
                        break 'octaves;
                    }
                }
            }
        }
    }
    (keypoints, truncated)
}

fn is_extremum(
    prev: &Array2<f32>,
    curr: &Array2<f32>,
    next: &Array2<f32>,
    x: usize,
    y: usize,
    threshold: f32,
) -> bool {
    let v = curr[(y, x)];
    if v.abs() < threshold {
        return false;
    }
    let positive = v > 0.0;
    for (plane, skip_center) in [(curr, true), (prev, false), (next, false)] {
        for dy in -1i32..=1 {
            for dx in -1i32..=1 {
                if skip_center && dx == 0 && dy == 0 {
                    continue;
                }
                let n = plane[((y as i32 + dy) as usize, (x as i32 + dx) as usize)];
                if positive && v <= n {
                    return false;
                }
                if !positive && v >= n {
                    return false;
                }
            }
        }
    }
    true
}

fn is_on_edge(curr: &Array2<f32>, x: usize, y: usize, edge_threshold: f32) -> bool {
    let v2 = 2.0 * curr[(y, x)];
    let dxx = curr[(y, x + 1)] + curr[(y, x - 1)] - v2;
    let dyy = curr[(y + 1, x)] + curr[(y - 1, x)] - v2;
    let dxy = (curr[(y + 1, x + 1)] - curr[(y + 1, x - 1)] - curr[(y - 1, x + 1)]
        + curr[(y - 1, x - 1)])
        * 0.25;
    let tr = dxx + dyy;
    let det = dxx * dyy - dxy * dxy;
    if det <= 0.0 {
        return true;
    }
    tr * tr * edge_threshold >= (edge_threshold + 1.0) * (edge_threshold + 1.0) * det
}

/// Dominant gradient orientation from a smoothed 36-bin histogram over a
/// Gaussian-weighted circular window, parabolic peak refinement included.
fn assign_orientation(img: &Array2<f32>, x: f32, y: f32, sigma_local: f32) -> f32 {
    let n_bins = ORIENTATION_HISTOGRAM_BINS;
    let (h, w) = img.dim();
    let cx = x.round() as i32;
    let cy = y.round() as i32;
    let win_sigma = ORIENTATION_SIGMA_FACTOR * sigma_local;
    let radius = (win_sigma * 3.0).round() as i32;
    let inv_denom = -1.0 / (2.0 * win_sigma * win_sigma);

    let mut hist = vec![0.0f32; n_bins];
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            if dx * dx + dy * dy > radius * radius {
                continue;
            }
            let px = cx + dx;
            let py = cy + dy;
            if px < 1 || px >= w as i32 - 1 || py < 1 || py >= h as i32 - 1 {
                continue;
            }
            let (px, py) = (px as usize, py as usize);
            let gx = img[(py, px + 1)] - img[(py, px - 1)];
            let gy = img[(py + 1, px)] - img[(py - 1, px)];
            let mag = (gx * gx + gy * gy).sqrt();
            let mut theta = gy.atan2(gx);
            if theta < 0.0 {
                theta += TWO_PI;
            }
            let weight = mag * ((dx * dx + dy * dy) as f32 * inv_denom).exp();
            let bin = ((theta * n_bins as f32 / TWO_PI).floor() as usize) % n_bins;
            hist[bin] += weight;
        }
    }

    // Circular three-tap smoothing [0.25, 0.5, 0.25].
    let smoothed: Vec<f32> = (0..n_bins)
        .map(|k| {
            let prev = hist[(k + n_bins - 1) % n_bins];
            let next = hist[(k + 1) % n_bins];
            0.25 * prev + 0.5 * hist[k] + 0.25 * next
        })
        .collect();

    let best = smoothed
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|(k, _)| k)
        .expect("histogram is not empty");
    let l = smoothed[(best + n_bins - 1) % n_bins];
    let c = smoothed[best];
    let r = smoothed[(best + 1) % n_bins];
    let denom = l - 2.0 * c + r;
    let mut peak = best as f32;
    if denom.abs() > 1e-12 {
        peak += 0.5 * (l - r) / denom;
    }
    let mut orientation = peak * TWO_PI / n_bins as f32;
    if orientation < 0.0 {
        orientation += TWO_PI;
    }
    if orientation >= TWO_PI {
        orientation -= TWO_PI;
    }
    orientation
}

/// Descriptors for a keypoint list, row `i` for keypoint `i`. Rows are
/// unit-norm after the clamp-and-renormalize stage.
pub fn compute_descriptors(ss: &ScaleSpace, keypoints: &[KeyPoint]) -> Array2<f32> {
    let mut desc = Array2::<f32>::zeros((keypoints.len(), DESCRIPTOR_SIZE));
    for (row, kp) in desc.rows_mut().into_iter().zip(keypoints) {
        let img = &ss.gaussian[kp.octave][kp.scale.clamp(1, ss.scales_per_octave)];
        let upscale = (1u32 << kp.octave) as f32;
        let d = compute_descriptor(
            img,
            kp.x / upscale,
            kp.y / upscale,
            kp.sigma / upscale,
            kp.orientation,
        );
        for (el, v) in row.into_iter().zip(d) {
            *el = v;
        }
    }
    desc
}

fn bilinear(img: &Array2<f32>, x: f32, y: f32) -> f32 {
    let (h, w) = img.dim();
    let x0 = x.floor() as i32;
    let y0 = y.floor() as i32;
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;
    let at = |xx: i32, yy: i32| {
        img[(
            yy.clamp(0, h as i32 - 1) as usize,
            xx.clamp(0, w as i32 - 1) as usize,
        )]
    };
    let top = at(x0, y0) * (1.0 - fx) + at(x0 + 1, y0) * fx;
    let bottom = at(x0, y0 + 1) * (1.0 - fx) + at(x0 + 1, y0 + 1) * fx;
    top * (1.0 - fy) + bottom * fy
}

/// The 128-bin descriptor of one keypoint in octave-local coordinates.
/// Matches the shader: 16x16 sample grid spaced `0.75 * sigma`, rotated to
/// the reference orientation, trilinear accumulation into 4x4x8 bins and
/// the two-stage L2 normalization.
pub fn compute_descriptor(
    img: &Array2<f32>,
    x: f32,
    y: f32,
    sigma_local: f32,
    orientation: f32,
) -> [f32; DESCRIPTOR_SIZE] {
    let (h, w) = img.dim();
    let step = DESCRIPTOR_SAMPLE_STEP * sigma_local;
    let (sin_t, cos_t) = orientation.sin_cos();
    let mut hist = [0.0f32; DESCRIPTOR_SIZE];

    for r in -8i32..8 {
        for c in -8i32..8 {
            let (fr, fc) = (r as f32, c as f32);
            let sx = x + step * (fc * cos_t - fr * sin_t);
            let sy = y + step * (fc * sin_t + fr * cos_t);
            if sx < 2.0 || sx > w as f32 - 3.0 || sy < 2.0 || sy > h as f32 - 3.0 {
                continue;
            }
            let gx = bilinear(img, sx + 1.0, sy) - bilinear(img, sx - 1.0, sy);
            let gy = bilinear(img, sx, sy + 1.0) - bilinear(img, sx, sy - 1.0);
            let mag = (gx * gx + gy * gy).sqrt() * (-(fr * fr + fc * fc) / 128.0).exp();
            let mut ori = gy.atan2(gx) - orientation;
            ori -= (ori / TWO_PI).floor() * TWO_PI;
            let obin = ori * 8.0 / TWO_PI;

            let rbin = (fr + 8.0) / 4.0 - 0.5;
            let cbin = (fc + 8.0) / 4.0 - 0.5;
            let (r0, c0, o0) = (rbin.floor(), cbin.floor(), obin.floor());
            let (frr, frc, fro) = (rbin - r0, cbin - c0, obin - o0);

            for dr in 0..2 {
                let ri = r0 as i32 + dr;
                if !(0..4).contains(&ri) {
                    continue;
                }
                let wr = if dr == 1 { frr } else { 1.0 - frr };
                for dc in 0..2 {
                    let ci = c0 as i32 + dc;
                    if !(0..4).contains(&ci) {
                        continue;
                    }
                    let wc = if dc == 1 { frc } else { 1.0 - frc };
                    for dd in 0..2 {
                        let oi = (o0 as i32 + dd).rem_euclid(8);
                        let wo = if dd == 1 { fro } else { 1.0 - fro };
                        hist[((ri * 4 + ci) * 8 + oi) as usize] += mag * wr * wc * wo;
                    }
                }
            }
        }
    }

    normalize_descriptor(&mut hist);
    hist
}

/// Unit L2, clamp each component at 0.2, unit L2 again.
pub(crate) fn normalize_descriptor(d: &mut [f32; DESCRIPTOR_SIZE]) {
    let norm: f32 = d.iter().map(|v| v * v).sum::<f32>().sqrt();
    let inv = 1.0 / norm.max(1e-12);
    for v in d.iter_mut() {
        *v = (*v * inv).min(DESCRIPTOR_MAGNITUDE_CAP);
    }
    let norm2: f32 = d.iter().map(|v| v * v).sum::<f32>().sqrt();
    let inv2 = 1.0 / norm2.max(1e-12);
    for v in d.iter_mut() {
        *v *= inv2;
    }
}

/// Reference brute-force matcher with Lowe's ratio test.
pub fn match_descriptors(a: &Array2<f32>, b: &Array2<f32>, ratio: f32) -> Vec<Match> {
    let ratio_sq = ratio * ratio;
    let mut matches = Vec::new();
    for (i, qa) in a.rows().into_iter().enumerate() {
        let mut best = f32::MAX;
        let mut second = f32::MAX;
        let mut best_idx = -1i64;
        for (j, qb) in b.rows().into_iter().enumerate() {
            let dist: f32 = izip!(qa.iter(), qb.iter())
                .map(|(&x, &y)| (x - y) * (x - y))
                .sum();
            if dist < best {
                second = best;
                best = dist;
                best_idx = j as i64;
            } else if dist < second {
                second = dist;
            }
        }
        if best_idx >= 0 && best < ratio_sq * second {
            matches.push(Match {
                query_idx: i,
                train_idx: best_idx as usize,
                distance: best.sqrt(),
            });
        }
    }
    matches
}

/// Reference quantized matcher; distances on the [0, 255] scale.
pub fn match_quantized(a: &Array2<u8>, b: &Array2<u8>, ratio: f32) -> Vec<Match> {
    let ratio_sq = ratio * ratio;
    let mut matches = Vec::new();
    for (i, qa) in a.rows().into_iter().enumerate() {
        let mut best = f32::MAX;
        let mut second = f32::MAX;
        let mut best_idx = -1i64;
        for (j, qb) in b.rows().into_iter().enumerate() {
            let dist: f32 = izip!(qa.iter(), qb.iter())
                .map(|(&x, &y)| {
                    let d = x as f32 - y as f32;
                    d * d
                })
                .sum();
            if dist < best {
                second = best;
                best = dist;
                best_idx = j as i64;
            } else if dist < second {
                second = dist;
            }
        }
        if best_idx >= 0 && best < ratio_sq * second {
            matches.push(Match {
                query_idx: i,
                train_idx: best_idx as usize,
                distance: best.sqrt(),
            });
        }
    }
    matches
}

/// Reference guided matcher: candidates farther than `threshold` pixels
/// from the epipolar line are never considered. `f` is row-major.
pub fn match_guided(
    a: &Array2<f32>,
    kp_a: &[KeyPoint],
    b: &Array2<f32>,
    kp_b: &[KeyPoint],
    f: &[f32; 9],
    threshold: f32,
    ratio: f32,
) -> Vec<Match> {
    let ratio_sq = ratio * ratio;
    let mut matches = Vec::new();
    for (i, qa) in a.rows().into_iter().enumerate() {
        let (x, y) = (kp_a[i].x, kp_a[i].y);
        let line = [
            f[0] * x + f[1] * y + f[2],
            f[3] * x + f[4] * y + f[5],
            f[6] * x + f[7] * y + f[8],
        ];
        let line_norm = (line[0] * line[0] + line[1] * line[1]).sqrt();
        let mut best = f32::MAX;
        let mut second = f32::MAX;
        let mut best_idx = -1i64;
        if line_norm > 1e-12 {
            for (j, qb) in b.rows().into_iter().enumerate() {
                let q = &kp_b[j];
                let dist_to_line = (line[0] * q.x + line[1] * q.y + line[2]).abs() / line_norm;
                if dist_to_line > threshold {
                    continue;
                }
                let dist: f32 = izip!(qa.iter(), qb.iter())
                    .map(|(&x, &y)| (x - y) * (x - y))
                    .sum();
                if dist < best {
                    second = best;
                    best = dist;
                    best_idx = j as i64;
                } else if dist < second {
                    second = dist;
                }
            }
        }
        if best_idx >= 0 && best < ratio_sq * second {
            matches.push(Match {
                query_idx: i,
                train_idx: best_idx as usize,
                distance: best.sqrt(),
            });
        }
    }
    matches
}
