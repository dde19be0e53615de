//! Brute-force descriptor matching on the GPU.
//!
//! Three shader variants share one driver: plain float descriptors,
//! byte-quantized descriptors, and epipolar-guided matching that prunes
//! candidates by their distance to the epipolar line before measuring
//! descriptor distance. The variant is chosen by entry point, not by
//! subtype.

use std::sync::mpsc;

use bytemuck::{Pod, Zeroable};
use ndarray::Array2;

use crate::context::GpuContext;
use crate::error::{Result, SiftError};
use crate::{KeyPoint, DESCRIPTOR_SIZE};

/// An accepted correspondence between descriptor `query_idx` of the first
/// set and `train_idx` of the second. `distance` is the L2 distance.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Match {
    pub query_idx: usize,
    pub train_idx: usize,
    pub distance: f32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
struct GpuMatchResult {
    best_idx: i32,
    best_dist_sq: f32,
    second_dist_sq: f32,
    _pad: f32,
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct MatchParams {
    count_a: u32,
    count_b: u32,
    _pad0: u32,
    _pad1: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct GuidedParams {
    count_a: u32,
    count_b: u32,
    threshold: f32,
    _pad: u32,
    f_col0: [f32; 4],
    f_col1: [f32; 4],
    f_col2: [f32; 4],
}

/// GPU descriptor matcher. Owns its own device context, like the detector.
pub struct SiftMatcher {
    ctx: GpuContext,
}

impl SiftMatcher {
    /// Compiles the three matcher pipelines up front.
    pub fn new(mut ctx: GpuContext) -> Result<Self> {
        for name in ["matcher", "matcher_quantized", "matcher_guided"] {
            ctx.get_pipeline(name)?;
        }
        Ok(SiftMatcher { ctx })
    }

    /// Lowe-ratio matching of float descriptors: a match is kept iff the
    /// best squared distance is below `ratio^2` times the second best.
    pub fn match_descriptors(
        &mut self,
        desc_a: &Array2<f32>,
        desc_b: &Array2<f32>,
        ratio: f32,
    ) -> Result<Vec<Match>> {
        check_dims(desc_a.ncols(), desc_b.ncols())?;
        let (count_a, count_b) = (desc_a.nrows(), desc_b.nrows());
        if count_a == 0 || count_b == 0 {
            return Ok(Vec::new());
        }
        let buf_a = self.upload(bytemuck::cast_slice(as_slice(desc_a)?));
        let buf_b = self.upload(bytemuck::cast_slice(as_slice(desc_b)?));
        let params = self.ctx.uniform(&MatchParams {
            count_a: count_a as u32,
            count_b: count_b as u32,
            _pad0: 0,
            _pad1: 0,
        });
        let results = self.dispatch("matcher", &params, &buf_a, &buf_b, &[], count_a)?;
        Ok(accept(&results, ratio))
    }

    /// Lowe-ratio matching of byte-quantized descriptors. Distances are
    /// measured on the [0, 255] scale, which preserves ordering, so the
    /// ratio threshold semantics are unchanged.
    pub fn match_quantized(
        &mut self,
        desc_a: &Array2<u8>,
        desc_b: &Array2<u8>,
        ratio: f32,
    ) -> Result<Vec<Match>> {
        check_dims(desc_a.ncols(), desc_b.ncols())?;
        let (count_a, count_b) = (desc_a.nrows(), desc_b.nrows());
        if count_a == 0 || count_b == 0 {
            return Ok(Vec::new());
        }
        let buf_a = self.upload(as_slice(desc_a)?);
        let buf_b = self.upload(as_slice(desc_b)?);
        let params = self.ctx.uniform(&MatchParams {
            count_a: count_a as u32,
            count_b: count_b as u32,
            _pad0: 0,
            _pad1: 0,
        });
        let results = self.dispatch("matcher_quantized", &params, &buf_a, &buf_b, &[], count_a)?;
        Ok(accept(&results, ratio))
    }

    /// Epipolar-guided matching: candidate `j` is considered only when its
    /// distance to the epipolar line `F * (x_i, y_i, 1)` is at most
    /// `epipolar_threshold` pixels. `f` is the 3x3 fundamental matrix in
    /// row-major order.
    #[allow(clippy::too_many_arguments)]
    pub fn match_guided(
        &mut self,
        desc_a: &Array2<f32>,
        kp_a: &[KeyPoint],
        desc_b: &Array2<f32>,
        kp_b: &[KeyPoint],
        f: &[f32; 9],
        epipolar_threshold: f32,
        ratio: f32,
    ) -> Result<Vec<Match>> {
        check_dims(desc_a.ncols(), desc_b.ncols())?;
        if kp_a.len() != desc_a.nrows() || kp_b.len() != desc_b.nrows() {
            return Err(SiftError::BadConfig(
                "keypoint and descriptor counts disagree".into(),
            ));
        }
        let (count_a, count_b) = (desc_a.nrows(), desc_b.nrows());
        if count_a == 0 || count_b == 0 {
            return Ok(Vec::new());
        }
        let buf_a = self.upload(bytemuck::cast_slice(as_slice(desc_a)?));
        let buf_b = self.upload(bytemuck::cast_slice(as_slice(desc_b)?));
        let coords = |kps: &[KeyPoint]| -> Vec<f32> {
            kps.iter().flat_map(|k| [k.x, k.y]).collect()
        };
        let kp_buf_a = self.upload(bytemuck::cast_slice(&coords(kp_a)));
        let kp_buf_b = self.upload(bytemuck::cast_slice(&coords(kp_b)));
        let params = self.ctx.uniform(&GuidedParams {
            count_a: count_a as u32,
            count_b: count_b as u32,
            threshold: epipolar_threshold,
            _pad: 0,
            f_col0: [f[0], f[3], f[6], 0.0],
            f_col1: [f[1], f[4], f[7], 0.0],
            f_col2: [f[2], f[5], f[8], 0.0],
        });
        let results = self.dispatch(
            "matcher_guided",
            &params,
            &buf_a,
            &buf_b,
            &[&kp_buf_a, &kp_buf_b],
            count_a,
        )?;
        Ok(accept(&results, ratio))
    }

    fn upload(&self, bytes: &[u8]) -> wgpu::Buffer {
        use wgpu::util::DeviceExt;
        self.ctx
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("matcher descriptors"),
                contents: bytes,
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            })
    }

    fn dispatch(
        &mut self,
        shader: &'static str,
        params: &wgpu::Buffer,
        buf_a: &wgpu::Buffer,
        buf_b: &wgpu::Buffer,
        extra: &[&wgpu::Buffer],
        count_a: usize,
    ) -> Result<Vec<GpuMatchResult>> {
        let pipeline = self.ctx.get_pipeline(shader)?;
        let result_size = (count_a * std::mem::size_of::<GpuMatchResult>()) as u64;
        let result_buf = self.ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("match results"),
            size: result_size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });

        let mut entries = vec![
            wgpu::BindGroupEntry {
                binding: 0,
                resource: params.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 1,
                resource: buf_a.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 2,
                resource: buf_b.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 3,
                resource: result_buf.as_entire_binding(),
            },
        ];
        for (i, buf) in extra.iter().enumerate() {
            entries.push(wgpu::BindGroupEntry {
                binding: 4 + i as u32,
                resource: buf.as_entire_binding(),
            });
        }
        let bind = self
            .ctx
            .device
            .create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(shader),
                layout: &pipeline.get_bind_group_layout(0),
                entries: &entries,
            });

        let staging = self.ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("match readback"),
            size: result_size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("matching"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(shader),
                timestamp_writes: None,
            });
            pass.set_pipeline(&pipeline);
            pass.set_bind_group(0, &bind, &[]);
            pass.dispatch_workgroups((count_a as u32 + 63) / 64, 1, 1);
        }
        encoder.copy_buffer_to_buffer(&result_buf, 0, &staging, 0, result_size);
        self.ctx.queue.submit(std::iter::once(encoder.finish()));

        let (tx, rx) = mpsc::channel();
        staging.slice(..).map_async(wgpu::MapMode::Read, move |r| {
            let _ = tx.send(r);
        });
        self.ctx.device.poll(wgpu::Maintain::Wait);
        match rx.recv() {
            Ok(Ok(())) => {}
            _ => return Err(SiftError::DeviceLost("match readback")),
        }
        let bytes = staging.slice(..).get_mapped_range().to_vec();
        staging.unmap();
        Ok(bytemuck::pod_collect_to_vec(&bytes))
    }
}

fn check_dims(a: usize, b: usize) -> Result<()> {
    if a != DESCRIPTOR_SIZE || b != DESCRIPTOR_SIZE {
        return Err(SiftError::BadConfig(format!(
            "descriptors must have {DESCRIPTOR_SIZE} columns, got {a} and {b}"
        )));
    }
    Ok(())
}

fn as_slice<T>(a: &Array2<T>) -> Result<&[T]> {
    a.as_slice().ok_or_else(|| {
        SiftError::BadConfig("descriptor array must be contiguous row-major".into())
    })
}

/// Host side of the ratio test shared by all three variants.
fn accept(results: &[GpuMatchResult], ratio: f32) -> Vec<Match> {
    let ratio_sq = ratio * ratio;
    results
        .iter()
        .enumerate()
        .filter(|(_, r)| {
            r.best_idx >= 0 && r.best_dist_sq < ratio_sq * r.second_dist_sq
        })
        .map(|(i, r)| Match {
            query_idx: i,
            train_idx: r.best_idx as usize,
            distance: r.best_dist_sq.sqrt(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(best_idx: i32, best: f32, second: f32) -> GpuMatchResult {
        GpuMatchResult {
            best_idx,
            best_dist_sq: best,
            second_dist_sq: second,
            _pad: 0.0,
        }
    }

    #[test]
    fn ratio_test_accepts_distinct_best() {
        let matches = accept(&[result(3, 0.1, 1.0)], 0.75);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].train_idx, 3);
        assert!((matches[0].distance - 0.1f32.sqrt()).abs() < 1e-6);
    }

    #[test]
    fn ratio_test_rejects_ambiguous_and_empty() {
        // Identical best and second-best distances fail the strict ratio.
        assert!(accept(&[result(0, 1.0, 1.0)], 0.75).is_empty());
        // No candidate considered.
        assert!(accept(&[result(-1, f32::MAX, f32::MAX)], 0.75).is_empty());
    }

    #[test]
    fn ratio_test_boundary() {
        // best == ratio^2 * second must be rejected (strict inequality).
        let r = 0.75f32;
        assert!(accept(&[result(0, r * r, 1.0)], r).is_empty());
        assert_eq!(accept(&[result(0, r * r - 1e-4, 1.0)], r).len(), 1);
    }
}
