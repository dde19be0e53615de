//! Detector driver: image upload, the extrema/orientation/descriptor
//! dispatches and result readback.
//!
//! A detect call is strictly one-way: input texture -> packed grayscale ->
//! Gaussian pyramid -> DoG pyramid -> keypoint append buffer + descriptor
//! array -> host staging. Nothing is read back until the whole pipeline has
//! been submitted. The keypoint count never crosses the bus between stages;
//! a one-thread shader turns it into the indirect dispatch record instead.

use std::sync::mpsc;

use bytemuck::{Pod, Zeroable};
use image::imageops::FilterType;
use image::RgbaImage;
use ndarray::Array2;

use crate::context::GpuContext;
use crate::error::{Result, SiftError};
use crate::pyramid::PyramidCache;
use crate::staging::StagingRing;
use crate::{
    delta_sigma, Descriptors, KeyPoint, PixelFormat, SiftOptions, SiftResult, DESCRIPTOR_SIZE,
};

const KEYPOINT_STRIDE: u64 = 32;
const KEYPOINT_HEADER: u64 = 16;

/// Mirror of the shader-side keypoint record (8 f32 words).
#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
struct GpuKeypoint {
    x: f32,
    y: f32,
    octave: f32,
    scale: f32,
    sigma: f32,
    orientation: f32,
    _pad0: f32,
    _pad1: f32,
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct ExtremaParams {
    width: u32,
    height: u32,
    octave: u32,
    scale: u32,
    contrast_threshold: f32,
    edge_threshold: f32,
    sigma_base: f32,
    _pad: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct OctaveParams {
    width: u32,
    height: u32,
    octave: u32,
    _pad: u32,
}

/// Host mirror of prepare_dispatch.wgsl, kept for tests and documentation.
pub(crate) fn indirect_record(count: u32) -> [u32; 6] {
    [
        count.min(65535).max(1),
        ((count + 65534) / 65535).max(1),
        1,
        ((count + 63) / 64).max(1),
        1,
        1,
    ]
}

struct LoadedImage {
    texture: wgpu::Texture,
    width: u32,
    height: u32,
    /// Multiplied into returned x/y/sigma to undo host-side pre-downsampling.
    scale_restore: f32,
}

/// GPU SIFT detector. One instance per image stream; detect calls on the
/// same instance must not run concurrently.
pub struct SiftGpu {
    ctx: GpuContext,
    options: SiftOptions,
    keypoint_buffer: wgpu::Buffer,
    descriptor_buffer: wgpu::Buffer,
    indirect_buffer: wgpu::Buffer,
    pyramid: Option<PyramidCache>,
    input: Option<LoadedImage>,
}

impl SiftGpu {
    /// Validates the options, compiles every detection shader (fatal on
    /// failure) and allocates the keypoint/descriptor/indirect buffers.
    pub fn new(mut ctx: GpuContext, options: SiftOptions) -> Result<Self> {
        options.validate()?;

        // Shader problems must surface at init, not mid-frame.
        for name in [
            "grayscale",
            "blur_horizontal",
            "blur_vertical",
            "downsample",
            "dog",
            "extrema",
            "prepare_dispatch",
            "orientation",
        ] {
            ctx.get_pipeline(name)?;
        }
        ctx.get_pipeline(if options.quantize_descriptors {
            "descriptor_quantized"
        } else {
            "descriptor"
        })?;

        // The blur sigmas are fully determined by the options; warm the
        // kernel cache so no detect call pays for kernel generation.
        let mut sigmas = vec![options.sigma_base];
        for s in 1..options.scales_per_octave + 3 {
            sigmas.push(delta_sigma(options.sigma_base, s, options.scales_per_octave));
        }
        for sigma in sigmas {
            let radius = crate::context::kernel_radius(sigma);
            ctx.get_kernel_buffer(sigma, radius);
        }

        let capacity = options.max_keypoints as u64;
        ctx.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let keypoint_buffer = ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("keypoints"),
            size: KEYPOINT_HEADER + capacity * KEYPOINT_STRIDE,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let descriptor_bytes = if options.quantize_descriptors {
            capacity * DESCRIPTOR_SIZE as u64
        } else {
            capacity * DESCRIPTOR_SIZE as u64 * 4
        };
        let descriptor_buffer = ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("descriptors"),
            size: descriptor_bytes,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let indirect_buffer = ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("indirect dispatch"),
            size: 24,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::INDIRECT
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        if let Some(err) = pollster::block_on(ctx.device.pop_error_scope()) {
            return Err(SiftError::Capacity {
                stage: "detector buffers",
                message: err.to_string(),
            });
        }

        Ok(SiftGpu {
            ctx,
            options,
            keypoint_buffer,
            descriptor_buffer,
            indirect_buffer,
            pyramid: None,
            input: None,
        })
    }

    pub fn options(&self) -> &SiftOptions {
        &self.options
    }

    /// Converts, optionally pre-downsamples and uploads an image. The
    /// pyramid cache is rebuilt only when the uploaded dimensions change.
    pub fn load_image(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
        stride_bytes: usize,
        format: PixelFormat,
    ) -> Result<()> {
        if width.min(height) < 8 {
            return Err(SiftError::BadConfig(format!(
                "image too small: {width}x{height}, min side is 8"
            )));
        }
        let bpp = format.bytes_per_pixel();
        let min_stride = width as usize * bpp;
        if stride_bytes < min_stride {
            return Err(SiftError::BadConfig(format!(
                "stride {stride_bytes} < row byte length {min_stride}"
            )));
        }
        let needed = stride_bytes * (height as usize - 1) + min_stride;
        if pixels.len() < needed {
            return Err(SiftError::BadConfig(format!(
                "pixel buffer holds {} bytes, {needed} needed",
                pixels.len()
            )));
        }

        let mut rgba = vec![0u8; width as usize * height as usize * 4];
        for y in 0..height as usize {
            let row = &pixels[y * stride_bytes..y * stride_bytes + min_stride];
            let dst = &mut rgba[y * width as usize * 4..(y + 1) * width as usize * 4];
            match format {
                PixelFormat::Rgba8 => dst.copy_from_slice(row),
                PixelFormat::Rgb8 => {
                    for x in 0..width as usize {
                        dst[x * 4..x * 4 + 3].copy_from_slice(&row[x * 3..x * 3 + 3]);
                        dst[x * 4 + 3] = 255;
                    }
                }
                PixelFormat::Gray8 => {
                    for x in 0..width as usize {
                        let v = row[x];
                        dst[x * 4] = v;
                        dst[x * 4 + 1] = v;
                        dst[x * 4 + 2] = v;
                        dst[x * 4 + 3] = 255;
                    }
                }
            }
        }

        let longest = width.max(height);
        let (rgba, up_w, up_h, scale_restore) = if self.options.max_image_dimension > 0
            && longest > self.options.max_image_dimension
        {
            let scale = self.options.max_image_dimension as f32 / longest as f32;
            let new_w = ((width as f32 * scale).round() as u32).max(8);
            let new_h = ((height as f32 * scale).round() as u32).max(8);
            let img = RgbaImage::from_raw(width, height, rgba)
                .expect("buffer sized for dimensions");
            let resized = image::imageops::resize(&img, new_w, new_h, FilterType::Triangle);
            let restore = width as f32 / new_w as f32;
            log::debug!(
                "pre-downsampled {width}x{height} -> {new_w}x{new_h}, restore factor {restore}"
            );
            (resized.into_raw(), new_w, new_h, restore)
        } else {
            (rgba, width, height, 1.0)
        };

        let rebind = match &self.pyramid {
            Some(p) => p.width != up_w || p.height != up_h,
            None => true,
        };
        if rebind {
            // Invalidate before reallocating so a failed pyramid rebuild
            // never leaves a stale cache behind.
            self.pyramid = None;
            self.input = None;
            let texture = self.ctx.device.create_texture(&wgpu::TextureDescriptor {
                label: Some("input image"),
                size: wgpu::Extent3d {
                    width: up_w,
                    height: up_h,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: wgpu::TextureFormat::Rgba8Unorm,
                usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                view_formats: &[],
            });
            self.input = Some(LoadedImage {
                texture,
                width: up_w,
                height: up_h,
                scale_restore,
            });
            self.pyramid = Some(PyramidCache::new(&self.ctx, up_w, up_h, &self.options)?);
        } else if let Some(img) = &mut self.input {
            img.scale_restore = scale_restore;
        }

        let input = self.input.as_ref().expect("input bound above");
        self.ctx.queue.write_texture(
            wgpu::ImageCopyTexture {
                texture: &input.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &rgba,
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(up_w * 4),
                rows_per_image: Some(up_h),
            },
            wgpu::Extent3d {
                width: up_w,
                height: up_h,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }

    /// Detects keypoints without computing descriptors.
    pub fn detect_keypoints(&mut self) -> Result<Vec<KeyPoint>> {
        self.run_pipeline(false)?;
        let (keypoints, truncated) = self.read_keypoints()?;
        if truncated {
            log::warn!(
                "keypoint buffer overflowed, truncated to {}",
                self.options.max_keypoints
            );
        }
        Ok(keypoints)
    }

    /// Detects keypoints and extracts their descriptors.
    pub fn detect_and_compute(&mut self) -> Result<SiftResult> {
        self.run_pipeline(true)?;
        let (keypoints, truncated) = self.read_keypoints()?;
        if truncated {
            log::warn!(
                "keypoint buffer overflowed, truncated to {}",
                self.options.max_keypoints
            );
        }
        let descriptors = self.read_descriptors(keypoints.len())?;
        Ok(SiftResult {
            keypoints,
            descriptors,
            truncated,
        })
    }

    /// Computes descriptors for caller-supplied keypoints against the
    /// pyramid of the last loaded image. Orientations are taken from the
    /// keypoints as given; calling this twice with the same pyramid and
    /// list yields identical descriptors.
    pub fn compute_descriptors(&mut self, keypoints: &[KeyPoint]) -> Result<SiftResult> {
        self.build_pyramid()?;
        if keypoints.len() > self.options.max_keypoints {
            return Err(SiftError::BadConfig(format!(
                "{} keypoints exceed the configured capacity {}",
                keypoints.len(),
                self.options.max_keypoints
            )));
        }
        let scale_restore = self.input.as_ref().map_or(1.0, |i| i.scale_restore);

        let mut header = [0u8; 16];
        header[..4].copy_from_slice(&(keypoints.len() as u32).to_le_bytes());
        self.ctx.queue.write_buffer(&self.keypoint_buffer, 0, &header);
        let records: Vec<GpuKeypoint> = keypoints
            .iter()
            .map(|kp| GpuKeypoint {
                x: kp.x / scale_restore,
                y: kp.y / scale_restore,
                octave: kp.octave as f32,
                scale: kp.scale as f32,
                sigma: kp.sigma / scale_restore,
                orientation: kp.orientation,
                _pad0: 0.0,
                _pad1: 0.0,
            })
            .collect();
        self.ctx.queue.write_buffer(
            &self.keypoint_buffer,
            KEYPOINT_HEADER,
            bytemuck::cast_slice(&records),
        );

        let mut encoder = self
            .ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("compute descriptors"),
            });
        self.record_prepare_dispatch(&mut encoder)?;
        self.record_descriptor_passes(&mut encoder)?;
        self.ctx.queue.submit(std::iter::once(encoder.finish()));

        let descriptors = self.read_descriptors(keypoints.len())?;
        Ok(SiftResult {
            keypoints: keypoints.to_vec(),
            descriptors,
            truncated: false,
        })
    }

    /// Allocates a staging ring sized for this detector's keypoint and
    /// descriptor buffers.
    pub fn create_staging_ring(&self, depth: usize) -> Result<StagingRing> {
        StagingRing::new(
            &self.ctx.device,
            depth,
            self.keypoint_buffer.size(),
            self.descriptor_buffer.size(),
        )
    }

    /// Streaming variant: runs the full pipeline and copies count, keypoint
    /// records and descriptors into the ring's current slot, requesting the
    /// async map without blocking. Returns the slot index; consume it later
    /// with [`SiftGpu::collect_frame`]. The ring's keypoint buffers must
    /// hold `16 + max_keypoints * 32` bytes and the descriptor buffers the
    /// full descriptor array.
    pub fn detect_frame(&mut self, ring: &mut StagingRing) -> Result<usize> {
        self.run_pipeline(true)?;
        let (slot, kp_staging, desc_staging) = ring.acquire()?;
        let mut encoder = self
            .ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("frame readback"),
            });
        encoder.copy_buffer_to_buffer(
            &self.keypoint_buffer,
            0,
            kp_staging,
            0,
            self.keypoint_buffer.size().min(kp_staging.size()),
        );
        encoder.copy_buffer_to_buffer(
            &self.descriptor_buffer,
            0,
            desc_staging,
            0,
            self.descriptor_buffer.size().min(desc_staging.size()),
        );
        self.ctx.queue.submit(std::iter::once(encoder.finish()));
        ring.submit(slot);
        Ok(slot)
    }

    /// Awaits and decodes a slot previously filled by
    /// [`SiftGpu::detect_frame`].
    pub fn collect_frame(&mut self, ring: &mut StagingRing, slot: usize) -> Result<SiftResult> {
        let (kp_bytes, desc_bytes) = ring.wait(slot, &self.ctx.device)?;
        let raw_count = u32::from_le_bytes(kp_bytes[..4].try_into().expect("header present"));
        let capacity = self.options.max_keypoints as u32;
        let truncated = raw_count > capacity;
        let count = raw_count.min(capacity) as usize;
        if truncated {
            log::warn!("keypoint buffer overflowed, truncated to {capacity}");
        }
        let scale_restore = self.input.as_ref().map_or(1.0, |i| i.scale_restore);
        let records: Vec<GpuKeypoint> = bytemuck::pod_collect_to_vec(
            &kp_bytes[KEYPOINT_HEADER as usize..KEYPOINT_HEADER as usize + count * 32],
        );
        let keypoints = records
            .iter()
            .map(|r| decode_keypoint(r, scale_restore))
            .collect();
        let descriptors = decode_descriptors(
            &desc_bytes,
            count,
            self.options.quantize_descriptors,
        );
        Ok(SiftResult {
            keypoints,
            descriptors,
            truncated,
        })
    }

    /// Rebuilds the scale space for the currently loaded image.
    fn build_pyramid(&mut self) -> Result<()> {
        let input_view = match (&self.input, &self.pyramid) {
            (Some(img), Some(_)) => img.texture.create_view(&Default::default()),
            _ => {
                return Err(SiftError::BadConfig(
                    "no image loaded; call load_image first".into(),
                ))
            }
        };
        // The pyramid is moved out for the build so the context can hand out
        // pipelines and kernel buffers mutably at the same time.
        let pyramid = self.pyramid.take().expect("checked above");
        let result = pyramid.build(&mut self.ctx, &input_view, &self.options);
        self.pyramid = Some(pyramid);
        result
    }

    /// Records and submits the full detection pipeline.
    fn run_pipeline(&mut self, with_descriptors: bool) -> Result<()> {
        self.build_pyramid()?;

        // Reset the append-buffer header.
        self.ctx
            .queue
            .write_buffer(&self.keypoint_buffer, 0, &[0u8; 16]);

        let mut encoder = self
            .ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("detection"),
            });
        self.record_extrema_passes(&mut encoder)?;
        self.record_prepare_dispatch(&mut encoder)?;
        self.record_orientation_passes(&mut encoder)?;
        if with_descriptors {
            self.record_descriptor_passes(&mut encoder)?;
        }
        self.ctx.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    fn record_extrema_passes(&mut self, encoder: &mut wgpu::CommandEncoder) -> Result<()> {
        let pipeline = self.ctx.get_pipeline("extrema")?;
        let pyramid = self.pyramid.as_ref().expect("pyramid built");
        for o in 0..self.options.num_octaves {
            let (w, h) = pyramid.octave_sizes[o];
            for s in 1..=self.options.scales_per_octave {
                let params = self.ctx.uniform(&ExtremaParams {
                    width: w,
                    height: h,
                    octave: o as u32,
                    scale: s as u32,
                    contrast_threshold: self.options.contrast_threshold
                        / self.options.scales_per_octave as f32,
                    edge_threshold: self.options.edge_threshold,
                    sigma_base: self.options.sigma_base,
                    _pad: 0,
                });
                let bind = self
                    .ctx
                    .device
                    .create_bind_group(&wgpu::BindGroupDescriptor {
                        label: Some("extrema"),
                        layout: &pipeline.get_bind_group_layout(0),
                        entries: &[
                            wgpu::BindGroupEntry {
                                binding: 0,
                                resource: params.as_entire_binding(),
                            },
                            wgpu::BindGroupEntry {
                                binding: 1,
                                resource: wgpu::BindingResource::TextureView(
                                    &pyramid.dog[o][s - 1].create_view(&Default::default()),
                                ),
                            },
                            wgpu::BindGroupEntry {
                                binding: 2,
                                resource: wgpu::BindingResource::TextureView(
                                    &pyramid.dog[o][s].create_view(&Default::default()),
                                ),
                            },
                            wgpu::BindGroupEntry {
                                binding: 3,
                                resource: wgpu::BindingResource::TextureView(
                                    &pyramid.dog[o][s + 1].create_view(&Default::default()),
                                ),
                            },
                            wgpu::BindGroupEntry {
                                binding: 4,
                                resource: self.keypoint_buffer.as_entire_binding(),
                            },
                        ],
                    });
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("extrema"),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&pipeline);
                pass.set_bind_group(0, &bind, &[]);
                pass.dispatch_workgroups((w + 15) / 16, (h + 15) / 16, 1);
            }
        }
        Ok(())
    }

    fn record_prepare_dispatch(&mut self, encoder: &mut wgpu::CommandEncoder) -> Result<()> {
        let pipeline = self.ctx.get_pipeline("prepare_dispatch")?;
        let bind = self
            .ctx
            .device
            .create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("prepare dispatch"),
                layout: &pipeline.get_bind_group_layout(0),
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                            buffer: &self.keypoint_buffer,
                            offset: 0,
                            size: wgpu::BufferSize::new(KEYPOINT_HEADER),
                        }),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: self.indirect_buffer.as_entire_binding(),
                    },
                ],
            });
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("prepare dispatch"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&pipeline);
        pass.set_bind_group(0, &bind, &[]);
        pass.dispatch_workgroups(1, 1, 1);
        Ok(())
    }

    fn record_orientation_passes(&mut self, encoder: &mut wgpu::CommandEncoder) -> Result<()> {
        let pipeline = self.ctx.get_pipeline("orientation")?;
        let pyramid = self.pyramid.as_ref().expect("pyramid built");
        for o in 0..self.options.num_octaves {
            let (w, h) = pyramid.octave_sizes[o];
            let params = self.ctx.uniform(&OctaveParams {
                width: w,
                height: h,
                octave: o as u32,
                _pad: 0,
            });
            let bind = self
                .ctx
                .device
                .create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("orientation"),
                    layout: &pipeline.get_bind_group_layout(0),
                    entries: &[
                        wgpu::BindGroupEntry {
                            binding: 0,
                            resource: params.as_entire_binding(),
                        },
                        wgpu::BindGroupEntry {
                            binding: 1,
                            resource: self.keypoint_buffer.as_entire_binding(),
                        },
                        wgpu::BindGroupEntry {
                            binding: 2,
                            resource: wgpu::BindingResource::TextureView(
                                &pyramid.gaussian[o][1].create_view(&Default::default()),
                            ),
                        },
                        wgpu::BindGroupEntry {
                            binding: 3,
                            resource: wgpu::BindingResource::TextureView(
                                &pyramid.gaussian[o][2].create_view(&Default::default()),
                            ),
                        },
                        wgpu::BindGroupEntry {
                            binding: 4,
                            resource: wgpu::BindingResource::TextureView(
                                &pyramid.gaussian[o][3].create_view(&Default::default()),
                            ),
                        },
                    ],
                });
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("orientation"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&pipeline);
            pass.set_bind_group(0, &bind, &[]);
            pass.dispatch_workgroups_indirect(&self.indirect_buffer, 0);
        }
        Ok(())
    }

    fn record_descriptor_passes(&mut self, encoder: &mut wgpu::CommandEncoder) -> Result<()> {
        let name = if self.options.quantize_descriptors {
            "descriptor_quantized"
        } else {
            "descriptor"
        };
        let pipeline = self.ctx.get_pipeline(name)?;
        let pyramid = self.pyramid.as_ref().expect("pyramid built");
        for o in 0..self.options.num_octaves {
            let (w, h) = pyramid.octave_sizes[o];
            let params = self.ctx.uniform(&OctaveParams {
                width: w,
                height: h,
                octave: o as u32,
                _pad: 0,
            });
            let bind = self
                .ctx
                .device
                .create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("descriptor"),
                    layout: &pipeline.get_bind_group_layout(0),
                    entries: &[
                        wgpu::BindGroupEntry {
                            binding: 0,
                            resource: params.as_entire_binding(),
                        },
                        wgpu::BindGroupEntry {
                            binding: 1,
                            resource: self.keypoint_buffer.as_entire_binding(),
                        },
                        wgpu::BindGroupEntry {
                            binding: 2,
                            resource: self.descriptor_buffer.as_entire_binding(),
                        },
                        wgpu::BindGroupEntry {
                            binding: 3,
                            resource: wgpu::BindingResource::TextureView(
                                &pyramid.gaussian[o][1].create_view(&Default::default()),
                            ),
                        },
                        wgpu::BindGroupEntry {
                            binding: 4,
                            resource: wgpu::BindingResource::TextureView(
                                &pyramid.gaussian[o][2].create_view(&Default::default()),
                            ),
                        },
                        wgpu::BindGroupEntry {
                            binding: 5,
                            resource: wgpu::BindingResource::TextureView(
                                &pyramid.gaussian[o][3].create_view(&Default::default()),
                            ),
                        },
                    ],
                });
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("descriptor"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&pipeline);
            pass.set_bind_group(0, &bind, &[]);
            pass.dispatch_workgroups_indirect(&self.indirect_buffer, 12);
        }
        Ok(())
    }

    /// Blocking copy of a GPU buffer range to host memory.
    fn read_buffer(&self, src: &wgpu::Buffer, offset: u64, size: u64) -> Result<Vec<u8>> {
        let staging = self.ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("readback"),
            });
        encoder.copy_buffer_to_buffer(src, offset, &staging, 0, size);
        self.ctx.queue.submit(std::iter::once(encoder.finish()));

        let (tx, rx) = mpsc::channel();
        staging.slice(..).map_async(wgpu::MapMode::Read, move |r| {
            let _ = tx.send(r);
        });
        self.ctx.device.poll(wgpu::Maintain::Wait);
        match rx.recv() {
            Ok(Ok(())) => {}
            _ => return Err(SiftError::DeviceLost("buffer readback")),
        }
        let bytes = staging.slice(..).get_mapped_range().to_vec();
        staging.unmap();
        Ok(bytes)
    }

    fn read_keypoints(&self) -> Result<(Vec<KeyPoint>, bool)> {
        let header = self.read_buffer(&self.keypoint_buffer, 0, 4)?;
        let raw_count = u32::from_le_bytes(header[..4].try_into().expect("4 bytes read"));
        let capacity = self.options.max_keypoints as u32;
        let truncated = raw_count > capacity;
        let count = raw_count.min(capacity) as usize;
        if count == 0 {
            return Ok((Vec::new(), truncated));
        }
        let bytes = self.read_buffer(
            &self.keypoint_buffer,
            KEYPOINT_HEADER,
            count as u64 * KEYPOINT_STRIDE,
        )?;
        let scale_restore = self.input.as_ref().map_or(1.0, |i| i.scale_restore);
        let records: Vec<GpuKeypoint> = bytemuck::pod_collect_to_vec(&bytes);
        Ok((
            records
                .iter()
                .map(|r| decode_keypoint(r, scale_restore))
                .collect(),
            truncated,
        ))
    }

    fn read_descriptors(&self, count: usize) -> Result<Descriptors> {
        if count == 0 {
            return Ok(if self.options.quantize_descriptors {
                Descriptors::Quantized(Array2::zeros((0, DESCRIPTOR_SIZE)))
            } else {
                Descriptors::Float(Array2::zeros((0, DESCRIPTOR_SIZE)))
            });
        }
        let bytes_per_desc = if self.options.quantize_descriptors {
            DESCRIPTOR_SIZE
        } else {
            DESCRIPTOR_SIZE * 4
        };
        let bytes = self.read_buffer(
            &self.descriptor_buffer,
            0,
            (count * bytes_per_desc) as u64,
        )?;
        Ok(decode_descriptors(
            &bytes,
            count,
            self.options.quantize_descriptors,
        ))
    }

    /// Reads one Gaussian level back as packed rgba32f texels, row-major.
    /// Verification hook, synchronous and slow.
    #[doc(hidden)]
    pub fn read_gaussian_level(&self, octave: usize, scale: usize) -> Result<Vec<f32>> {
        let pyramid = self
            .pyramid
            .as_ref()
            .ok_or_else(|| SiftError::BadConfig("no pyramid built".into()))?;
        let (w, h) = pyramid.octave_sizes[octave];
        self.read_texture(&pyramid.gaussian[octave][scale], w, h)
    }

    /// Reads one DoG level back as packed rgba32f texels, row-major.
    #[doc(hidden)]
    pub fn read_dog_level(&self, octave: usize, scale: usize) -> Result<Vec<f32>> {
        let pyramid = self
            .pyramid
            .as_ref()
            .ok_or_else(|| SiftError::BadConfig("no pyramid built".into()))?;
        let (w, h) = pyramid.octave_sizes[octave];
        self.read_texture(&pyramid.dog[octave][scale], w, h)
    }

    fn read_texture(&self, texture: &wgpu::Texture, w: u32, h: u32) -> Result<Vec<f32>> {
        let bytes_per_row = w * 16;
        let aligned = bytes_per_row.div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT)
            * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let staging = self.ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("texture readback"),
            size: (aligned * h) as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("texture readback"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: &staging,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(aligned),
                    rows_per_image: Some(h),
                },
            },
            wgpu::Extent3d {
                width: w,
                height: h,
                depth_or_array_layers: 1,
            },
        );
        self.ctx.queue.submit(std::iter::once(encoder.finish()));

        let (tx, rx) = mpsc::channel();
        staging.slice(..).map_async(wgpu::MapMode::Read, move |r| {
            let _ = tx.send(r);
        });
        self.ctx.device.poll(wgpu::Maintain::Wait);
        match rx.recv() {
            Ok(Ok(())) => {}
            _ => return Err(SiftError::DeviceLost("texture readback")),
        }
        let mapped = staging.slice(..).get_mapped_range();
        let mut out = Vec::with_capacity((w * h * 4) as usize);
        for y in 0..h as usize {
            let row = &mapped[y * aligned as usize..y * aligned as usize + bytes_per_row as usize];
            out.extend_from_slice(bytemuck::cast_slice::<u8, f32>(row));
        }
        drop(mapped);
        staging.unmap();
        Ok(out)
    }
}

fn decode_keypoint(r: &GpuKeypoint, scale_restore: f32) -> KeyPoint {
    KeyPoint {
        x: r.x * scale_restore,
        y: r.y * scale_restore,
        octave: r.octave as usize,
        scale: r.scale as usize,
        sigma: r.sigma * scale_restore,
        orientation: r.orientation,
    }
}

fn decode_descriptors(bytes: &[u8], count: usize, quantized: bool) -> Descriptors {
    if quantized {
        let data = bytes[..count * DESCRIPTOR_SIZE].to_vec();
        Descriptors::Quantized(
            Array2::from_shape_vec((count, DESCRIPTOR_SIZE), data).expect("shape matches"),
        )
    } else {
        let floats: Vec<f32> =
            bytemuck::pod_collect_to_vec(&bytes[..count * DESCRIPTOR_SIZE * 4]);
        Descriptors::Float(
            Array2::from_shape_vec((count, DESCRIPTOR_SIZE), floats).expect("shape matches"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indirect_record_folds_and_floors() {
        assert_eq!(indirect_record(0), [1, 1, 1, 1, 1, 1]);
        assert_eq!(indirect_record(1), [1, 1, 1, 1, 1, 1]);
        assert_eq!(indirect_record(64), [64, 1, 1, 1, 1, 1]);
        assert_eq!(indirect_record(65), [65, 1, 1, 2, 1, 1]);
        assert_eq!(indirect_record(65535), [65535, 1, 1, 1024, 1, 1]);
        assert_eq!(indirect_record(65536), [65535, 2, 1, 1024, 1, 1]);
        assert_eq!(indirect_record(100_000), [65535, 2, 1, 1563, 1, 1]);
    }

    #[test]
    fn keypoint_record_layout() {
        // Must match the 8-word shader-side struct.
        assert_eq!(std::mem::size_of::<GpuKeypoint>(), KEYPOINT_STRIDE as usize);
    }

    #[test]
    fn descriptor_decode_roundtrip() {
        let mut bytes = Vec::new();
        for v in 0..256u32 {
            bytes.extend_from_slice(&(v as f32 / 256.0).to_le_bytes());
        }
        let d = decode_descriptors(&bytes, 2, false);
        match d {
            Descriptors::Float(a) => {
                assert_eq!(a.shape(), &[2, 128]);
                assert!((a[[1, 127]] - 255.0 / 256.0).abs() < 1e-6);
            }
            _ => panic!("expected float descriptors"),
        }

        let qbytes: Vec<u8> = (0..=255).collect();
        let d = decode_descriptors(&qbytes, 2, true);
        match d {
            Descriptors::Quantized(a) => {
                assert_eq!(a.shape(), &[2, 128]);
                assert_eq!(a[[0, 0]], 0);
                assert_eq!(a[[1, 127]], 255);
            }
            _ => panic!("expected quantized descriptors"),
        }
    }
}
