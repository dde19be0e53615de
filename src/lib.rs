//! GPU implementation of the SIFT image descriptor on top of `wgpu` compute
//! shaders, plus brute-force descriptor matching and a CPU reference
//! implementation used for verification.
//!
//! Useful resources:
//! - [1]: [Lowe 1999](https://www.cs.ubc.ca/~lowe/papers/iccv99.pdf)
//! - [2]: [Lowe 2004](https://www.cs.ubc.ca/~lowe/papers/ijcv04.pdf)
//! - [3]: [Rey-Otero 2014](https://www.ipol.im/pub/art/2014/82/article.pdf)
//!
//! The pipeline packs four logical luminance pixels into every `rgba32float`
//! texel (a 2×2 block), builds the Gaussian and difference-of-Gaussians scale
//! spaces with tiled separable blurs, detects scale-space extrema into an
//! atomically appended keypoint buffer, sizes the orientation and descriptor
//! dispatches *on the GPU* from that count (indirect dispatch), and reads
//! keypoints and 128-bin descriptors back through host-visible staging.
//!
//! Unlike OpenCV's implementation there is no sub-pixel extremum refinement
//! and each keypoint carries a single dominant orientation; descriptors from
//! the two libraries are therefore similar but not interchangeable.

use ndarray::Array2;

pub mod cpu;
mod error;
pub mod io;

mod context;
mod detector;
mod matcher;
mod pyramid;
mod staging;

pub use context::GpuContext;
pub use detector::SiftGpu;
pub use error::{Result, SiftError};
pub use matcher::{Match, SiftMatcher};
pub use staging::{StagingRing, TexturePool};

/// Gradient-orientation histogram bins used for reference orientations.
pub(crate) const ORIENTATION_HISTOGRAM_BINS: usize = 36;
/// The Gaussian window around a keypoint has sigma `1.5 * keypoint sigma`.
pub(crate) const ORIENTATION_SIGMA_FACTOR: f32 = 1.5;

/// Descriptor layout: 4x4 spatial histograms of 8 orientation bins each.
pub(crate) const DESCRIPTOR_N_HISTOGRAMS: usize = 4;
pub(crate) const DESCRIPTOR_N_BINS: usize = 8;
pub(crate) const DESCRIPTOR_SIZE: usize =
    DESCRIPTOR_N_HISTOGRAMS * DESCRIPTOR_N_HISTOGRAMS * DESCRIPTOR_N_BINS;
/// After the first L2 normalization no component may exceed this value.
pub(crate) const DESCRIPTOR_MAGNITUDE_CAP: f32 = 0.2;
/// Scale applied when quantizing a unit-norm descriptor to bytes.
pub(crate) const DESCRIPTOR_QUANT_SCALE: f32 = 512.0;
/// Spacing of descriptor sample points in units of the keypoint sigma.
pub(crate) const DESCRIPTOR_SAMPLE_STEP: f32 = 0.75;

/// Sigma assigned to scale index `s` within an octave.
pub(crate) fn sigma_for_scale(sigma_base: f32, s: usize, scales_per_octave: usize) -> f32 {
    sigma_base * 2f32.powf(s as f32 / scales_per_octave as f32)
}

/// Incremental blur turning `G[s-1]` into `G[s]`.
pub(crate) fn delta_sigma(sigma_base: f32, s: usize, scales_per_octave: usize) -> f32 {
    debug_assert!(s >= 1);
    let curr = sigma_for_scale(sigma_base, s, scales_per_octave);
    let prev = sigma_for_scale(sigma_base, s - 1, scales_per_octave);
    (curr * curr - prev * prev).sqrt()
}

/// Pixel layout of the bytes handed to [`SiftGpu::load_image`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PixelFormat {
    Rgba8,
    Rgb8,
    Gray8,
}

impl PixelFormat {
    pub(crate) fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgba8 => 4,
            PixelFormat::Rgb8 => 3,
            PixelFormat::Gray8 => 1,
        }
    }
}

/// Detection parameters. The defaults reproduce the usual SIFT constants.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SiftOptions {
    pub num_octaves: usize,
    /// Scales per octave. The compute shaders bind the three middle Gaussian
    /// scales as separate bindings, so the GPU path supports exactly 3.
    pub scales_per_octave: usize,
    pub sigma_base: f32,
    pub contrast_threshold: f32,
    pub edge_threshold: f32,
    /// Capacity of the keypoint append buffer. Detection truncates silently
    /// at this count and flags [`SiftResult::truncated`].
    pub max_keypoints: usize,
    /// Images whose longest side exceeds this are downsampled before upload;
    /// returned coordinates and sigmas are restored to the original frame.
    /// `0` disables the cap.
    pub max_image_dimension: u32,
    /// Store descriptors as bytes (four per 32-bit word) instead of floats.
    pub quantize_descriptors: bool,
}

impl Default for SiftOptions {
    fn default() -> Self {
        SiftOptions {
            num_octaves: 4,
            scales_per_octave: 3,
            sigma_base: 1.6,
            contrast_threshold: 0.03,
            edge_threshold: 10.0,
            max_keypoints: 100_000,
            max_image_dimension: 3000,
            quantize_descriptors: false,
        }
    }
}

impl SiftOptions {
    /// Rejects values outside sane ranges before any GPU resource is touched.
    pub fn validate(&self) -> Result<()> {
        if !(1..=8).contains(&self.num_octaves) {
            return Err(SiftError::BadConfig(format!(
                "num_octaves must be in 1..=8, got {}",
                self.num_octaves
            )));
        }
        if self.scales_per_octave != 3 {
            return Err(SiftError::BadConfig(format!(
                "the GPU pipeline supports scales_per_octave = 3 only, got {}",
                self.scales_per_octave
            )));
        }
        if !(0.5..=4.0).contains(&self.sigma_base) {
            return Err(SiftError::BadConfig(format!(
                "sigma_base must be in 0.5..=4.0, got {}",
                self.sigma_base
            )));
        }
        if !(self.contrast_threshold > 0.0 && self.contrast_threshold < 1.0) {
            return Err(SiftError::BadConfig(format!(
                "contrast_threshold must be in (0, 1), got {}",
                self.contrast_threshold
            )));
        }
        if self.edge_threshold < 1.0 {
            return Err(SiftError::BadConfig(format!(
                "edge_threshold must be >= 1, got {}",
                self.edge_threshold
            )));
        }
        if self.max_keypoints == 0 || self.max_keypoints > 1 << 24 {
            return Err(SiftError::BadConfig(format!(
                "max_keypoints must be in 1..=2^24, got {}",
                self.max_keypoints
            )));
        }
        Ok(())
    }
}

/// A detected keypoint in original-image coordinates.
#[derive(Debug, Clone, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct KeyPoint {
    pub x: f32,
    pub y: f32,
    /// Pyramid octave the extremum was found in.
    pub octave: usize,
    /// Scale index within the octave (one of the middle scales).
    pub scale: usize,
    /// Blur level in original-image units.
    pub sigma: f32,
    /// Dominant gradient orientation in `[0, 2*pi)`.
    pub orientation: f32,
}

/// Descriptor storage, parallel to the keypoint list: row `i` describes
/// keypoint `i`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Descriptors {
    /// Unit-norm 128-vectors.
    Float(Array2<f32>),
    /// `round(min(255, d * 512))` quantization of the unit-norm vectors.
    Quantized(Array2<u8>),
}

impl Descriptors {
    pub fn len(&self) -> usize {
        match self {
            Descriptors::Float(a) => a.nrows(),
            Descriptors::Quantized(a) => a.nrows(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Keypoints plus their descriptors.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SiftResult {
    pub keypoints: Vec<KeyPoint>,
    pub descriptors: Descriptors,
    /// Set when the keypoint append buffer overflowed `max_keypoints` and
    /// detection truncated. Never an error.
    pub truncated: bool,
}
