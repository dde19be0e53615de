//! Gaussian and difference-of-Gaussians scale-space construction.
//!
//! All pyramid textures are `rgba32float` packed grayscale: one texel holds
//! a 2x2 block of logical luminance pixels, quartering the texel count per
//! level. The cache owns every texture and is rebuilt only when the input
//! dimensions change.

use bytemuck::{Pod, Zeroable};

use crate::context::{kernel_radius, GpuContext};
use crate::error::{Result, SiftError};
use crate::{delta_sigma, SiftOptions};

const WORKGROUP_DIM: u32 = 16;
/// Shared-memory halo of the blur shaders, in packed texels. A logical
/// kernel radius of up to 2x this fits the tile.
const MAX_RADIUS_PACKED: u32 = 16;

fn dispatch_dim(size: u32) -> u32 {
    (size + WORKGROUP_DIM - 1) / WORKGROUP_DIM
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct BlurParams {
    width: u32,
    height: u32,
    radius: u32,
    _pad: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct DownsampleParams {
    src_width: u32,
    src_height: u32,
    dst_width: u32,
    dst_height: u32,
}

/// Per-resolution texture set: base + temp at packed input size, then per
/// octave `S + 3` Gaussian and `S + 2` DoG textures.
pub(crate) struct PyramidCache {
    pub width: u32,
    pub height: u32,
    pub packed_width: u32,
    pub packed_height: u32,
    pub base: wgpu::Texture,
    pub temp: wgpu::Texture,
    pub gaussian: Vec<Vec<wgpu::Texture>>,
    pub dog: Vec<Vec<wgpu::Texture>>,
    /// Packed dimensions of each octave.
    pub octave_sizes: Vec<(u32, u32)>,
}

impl PyramidCache {
    /// Allocates every texture of the pyramid. An out-of-memory device error
    /// during allocation is fatal and reported as [`SiftError::Capacity`].
    pub fn new(
        ctx: &GpuContext,
        width: u32,
        height: u32,
        options: &SiftOptions,
    ) -> Result<Self> {
        let packed_width = (width + 1) / 2;
        let packed_height = (height + 1) / 2;
        let format = wgpu::TextureFormat::Rgba32Float;

        ctx.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);

        let base = ctx.create_storage_texture(packed_width, packed_height, format);
        let temp = ctx.create_storage_texture(packed_width, packed_height, format);

        let scales = options.scales_per_octave;
        let mut gaussian = Vec::with_capacity(options.num_octaves);
        let mut dog = Vec::with_capacity(options.num_octaves);
        let mut octave_sizes = Vec::with_capacity(options.num_octaves);
        let (mut w, mut h) = (packed_width, packed_height);
        for _ in 0..options.num_octaves {
            octave_sizes.push((w.max(1), h.max(1)));
            gaussian.push(
                (0..scales + 3)
                    .map(|_| ctx.create_storage_texture(w, h, format))
                    .collect(),
            );
            dog.push(
                (0..scales + 2)
                    .map(|_| ctx.create_storage_texture(w, h, format))
                    .collect(),
            );
            w = (w / 2).max(1);
            h = (h / 2).max(1);
        }

        if let Some(err) = pollster::block_on(ctx.device.pop_error_scope()) {
            return Err(SiftError::Capacity {
                stage: "pyramid allocation",
                message: err.to_string(),
            });
        }

        Ok(PyramidCache {
            width,
            height,
            packed_width,
            packed_height,
            base,
            temp,
            gaussian,
            dog,
            octave_sizes,
        })
    }

    /// Records and submits the whole scale-space build: grayscale pack, the
    /// per-octave blur chain, octave downsampling and the DoG subtractions.
    pub fn build(
        &self,
        ctx: &mut GpuContext,
        input: &wgpu::TextureView,
        options: &SiftOptions,
    ) -> Result<()> {
        let grayscale = ctx.get_pipeline("grayscale")?;
        let blur_h = ctx.get_pipeline("blur_horizontal")?;
        let blur_v = ctx.get_pipeline("blur_vertical")?;
        let downsample = ctx.get_pipeline("downsample")?;
        let dog = ctx.get_pipeline("dog")?;

        let mut encoder = ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("pyramid build"),
            });

        // Grayscale pack into the base texture.
        {
            let bind = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("grayscale"),
                layout: &grayscale.get_bind_group_layout(0),
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::TextureView(input),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::TextureView(
                            &self.base.create_view(&Default::default()),
                        ),
                    },
                ],
            });
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("grayscale"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&grayscale);
            pass.set_bind_group(0, &bind, &[]);
            pass.dispatch_workgroups(
                dispatch_dim(self.packed_width),
                dispatch_dim(self.packed_height),
                1,
            );
        }

        let scales = options.scales_per_octave;
        let temp_view = self.temp.create_view(&Default::default());
        for o in 0..options.num_octaves {
            let (w, h) = self.octave_sizes[o];
            let octave = &self.gaussian[o];

            if o == 0 {
                self.record_blur(
                    ctx,
                    &mut encoder,
                    &blur_h,
                    &blur_v,
                    &self.base.create_view(&Default::default()),
                    &octave[0].create_view(&Default::default()),
                    &temp_view,
                    w,
                    h,
                    options.sigma_base,
                );
            } else {
                let (sw, sh) = self.octave_sizes[o - 1];
                let params = ctx.uniform(&DownsampleParams {
                    src_width: sw,
                    src_height: sh,
                    dst_width: w,
                    dst_height: h,
                });
                let bind = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("downsample"),
                    layout: &downsample.get_bind_group_layout(0),
                    entries: &[
                        wgpu::BindGroupEntry {
                            binding: 0,
                            resource: params.as_entire_binding(),
                        },
                        wgpu::BindGroupEntry {
                            binding: 1,
                            resource: wgpu::BindingResource::TextureView(
                                &self.gaussian[o - 1][scales].create_view(&Default::default()),
                            ),
                        },
                        wgpu::BindGroupEntry {
                            binding: 2,
                            resource: wgpu::BindingResource::TextureView(
                                &octave[0].create_view(&Default::default()),
                            ),
                        },
                    ],
                });
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("downsample"),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&downsample);
                pass.set_bind_group(0, &bind, &[]);
                pass.dispatch_workgroups(dispatch_dim(w), dispatch_dim(h), 1);
            }

            for s in 1..scales + 3 {
                let sigma = delta_sigma(options.sigma_base, s, scales);
                self.record_blur(
                    ctx,
                    &mut encoder,
                    &blur_h,
                    &blur_v,
                    &octave[s - 1].create_view(&Default::default()),
                    &octave[s].create_view(&Default::default()),
                    &temp_view,
                    w,
                    h,
                    sigma,
                );
            }

            for s in 0..scales + 2 {
                let bind = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("dog"),
                    layout: &dog.get_bind_group_layout(0),
                    entries: &[
                        wgpu::BindGroupEntry {
                            binding: 0,
                            resource: wgpu::BindingResource::TextureView(
                                &octave[s].create_view(&Default::default()),
                            ),
                        },
                        wgpu::BindGroupEntry {
                            binding: 1,
                            resource: wgpu::BindingResource::TextureView(
                                &octave[s + 1].create_view(&Default::default()),
                            ),
                        },
                        wgpu::BindGroupEntry {
                            binding: 2,
                            resource: wgpu::BindingResource::TextureView(
                                &self.dog[o][s].create_view(&Default::default()),
                            ),
                        },
                    ],
                });
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("dog"),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&dog);
                pass.set_bind_group(0, &bind, &[]);
                pass.dispatch_workgroups(dispatch_dim(w), dispatch_dim(h), 1);
            }
        }

        ctx.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn record_blur(
        &self,
        ctx: &mut GpuContext,
        encoder: &mut wgpu::CommandEncoder,
        blur_h: &wgpu::ComputePipeline,
        blur_v: &wgpu::ComputePipeline,
        input: &wgpu::TextureView,
        output: &wgpu::TextureView,
        temp: &wgpu::TextureView,
        width: u32,
        height: u32,
        sigma: f32,
    ) {
        let radius = kernel_radius(sigma).min(2 * MAX_RADIUS_PACKED);
        debug_assert!(
            kernel_radius(sigma) <= 2 * MAX_RADIUS_PACKED,
            "blur radius {} exceeds the shared-memory halo",
            kernel_radius(sigma)
        );
        let kernel = ctx.get_kernel_buffer(sigma, radius);
        let params = ctx.uniform(&BlurParams {
            width,
            height,
            radius,
            _pad: 0,
        });

        for (pipeline, src, dst) in [(blur_h, input, temp), (blur_v, temp, output)] {
            let bind = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("blur"),
                layout: &pipeline.get_bind_group_layout(0),
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: params.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::TextureView(src),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: wgpu::BindingResource::TextureView(dst),
                    },
                    wgpu::BindGroupEntry {
                        binding: 3,
                        resource: kernel.as_entire_binding(),
                    },
                ],
            });
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("blur"),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bind, &[]);
            pass.dispatch_workgroups(dispatch_dim(width), dispatch_dim(height), 1);
        }
    }
}
