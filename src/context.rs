//! GPU context: device acquisition plus the caches shared by every pipeline
//! stage (compiled compute pipelines, Gaussian kernel buffers).

use std::collections::HashMap;
use std::sync::Arc;

use wgpu::util::DeviceExt;

use crate::error::{Result, SiftError};

/// Embedded WGSL sources, looked up by stage name.
const SHADER_SOURCES: &[(&str, &str)] = &[
    ("grayscale", include_str!("shaders/grayscale.wgsl")),
    ("blur_horizontal", include_str!("shaders/blur_horizontal.wgsl")),
    ("blur_vertical", include_str!("shaders/blur_vertical.wgsl")),
    ("downsample", include_str!("shaders/downsample.wgsl")),
    ("dog", include_str!("shaders/dog.wgsl")),
    ("extrema", include_str!("shaders/extrema.wgsl")),
    ("prepare_dispatch", include_str!("shaders/prepare_dispatch.wgsl")),
    ("orientation", include_str!("shaders/orientation.wgsl")),
    ("descriptor", include_str!("shaders/descriptor.wgsl")),
    (
        "descriptor_quantized",
        include_str!("shaders/descriptor_quantized.wgsl"),
    ),
    ("matcher", include_str!("shaders/matcher.wgsl")),
    ("matcher_quantized", include_str!("shaders/matcher_quantized.wgsl")),
    ("matcher_guided", include_str!("shaders/matcher_guided.wgsl")),
];

/// Binding shapes of each shader's @group(0), in binding-index order.
///
/// Layouts are spelled out explicitly instead of derived from the shaders:
/// auto-derived layouts mark `texture_2d<f32>` bindings as filterable, which
/// rejects `rgba32float` pyramid textures on devices without the
/// float32-filterable feature. All pipeline textures are read with
/// `textureLoad`, so non-filterable is always correct here.
#[derive(Copy, Clone)]
enum Binding {
    Uniform,
    StorageRead,
    StorageReadWrite,
    Texture,
    StorageTexture,
}

fn shader_bindings(name: &str) -> &'static [Binding] {
    use Binding::*;
    match name {
        "grayscale" => &[Texture, StorageTexture],
        "blur_horizontal" | "blur_vertical" => &[Uniform, Texture, StorageTexture, StorageRead],
        "downsample" => &[Uniform, Texture, StorageTexture],
        "dog" => &[Texture, Texture, StorageTexture],
        "extrema" => &[Uniform, Texture, Texture, Texture, StorageReadWrite],
        "prepare_dispatch" => &[StorageRead, StorageReadWrite],
        "orientation" => &[Uniform, StorageReadWrite, Texture, Texture, Texture],
        "descriptor" | "descriptor_quantized" => {
            &[Uniform, StorageRead, StorageReadWrite, Texture, Texture, Texture]
        }
        "matcher" | "matcher_quantized" => {
            &[Uniform, StorageRead, StorageRead, StorageReadWrite]
        }
        "matcher_guided" => &[
            Uniform,
            StorageRead,
            StorageRead,
            StorageReadWrite,
            StorageRead,
            StorageRead,
        ],
        _ => &[],
    }
}

fn layout_entry(index: u32, binding: Binding) -> wgpu::BindGroupLayoutEntry {
    let ty = match binding {
        Binding::Uniform => wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        Binding::StorageRead => wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only: true },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        Binding::StorageReadWrite => wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only: false },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        Binding::Texture => wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable: false },
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        },
        Binding::StorageTexture => wgpu::BindingType::StorageTexture {
            access: wgpu::StorageTextureAccess::WriteOnly,
            format: wgpu::TextureFormat::Rgba32Float,
            view_dimension: wgpu::TextureViewDimension::D2,
        },
    };
    wgpu::BindGroupLayoutEntry {
        binding: index,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty,
        count: None,
    }
}

/// Cache key for Gaussian kernel buffers.
///
/// Sigma is quantized to four decimal places so that kernels computed from
/// float expressions that differ only in rounding share a buffer. A struct
/// key with derived `Eq`/`Hash` replaces stringified floats.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub(crate) struct KernelKey {
    sigma_q4: u32,
    radius: u32,
}

impl KernelKey {
    pub(crate) fn new(sigma: f32, radius: u32) -> Self {
        KernelKey {
            sigma_q4: (sigma * 10_000.0).round() as u32,
            radius,
        }
    }
}

/// Kernel radius in logical pixels for a given sigma.
pub(crate) fn kernel_radius(sigma: f32) -> u32 {
    (sigma * 3.0).ceil() as u32
}

/// 1-D Gaussian sampled at integer offsets `-radius..=radius`, normalized to
/// sum 1. Shared by the GPU kernel buffers and the CPU reference so the two
/// pyramids agree.
pub(crate) fn gaussian_kernel(sigma: f32, radius: u32) -> Vec<f32> {
    let r = radius as i32;
    let mut kernel = Vec::with_capacity(2 * radius as usize + 1);
    let denom = 2.0 * sigma * sigma;
    for i in -r..=r {
        kernel.push((-(i * i) as f32 / denom).exp());
    }
    let sum: f32 = kernel.iter().sum();
    for v in &mut kernel {
        *v /= sum;
    }
    kernel
}

/// Device handle plus the pipeline and kernel-buffer caches.
///
/// One context backs one driver (detector or matcher); concurrent use from
/// multiple threads is not supported, create one context per stream instead.
pub struct GpuContext {
    pub(crate) device: wgpu::Device,
    pub(crate) queue: wgpu::Queue,
    pipelines: HashMap<&'static str, Arc<wgpu::ComputePipeline>>,
    kernels: HashMap<KernelKey, Arc<wgpu::Buffer>>,
}

impl GpuContext {
    /// Acquires an adapter and device. No adapter, or a device request
    /// failure, is reported as [`SiftError::Unavailable`]; nothing retries.
    pub fn request_device(power_preference: wgpu::PowerPreference) -> Result<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| SiftError::Unavailable("no compatible adapter".into()))?;

        let info = adapter.get_info();
        log::debug!("using adapter: {} ({:?})", info.name, info.backend);

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("sift-gpu device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
            },
            None,
        ))
        .map_err(|e| SiftError::Unavailable(e.to_string()))?;

        Ok(GpuContext {
            device,
            queue,
            pipelines: HashMap::new(),
            kernels: HashMap::new(),
        })
    }

    /// Underlying device handle, e.g. for allocating a [`crate::TexturePool`]
    /// or [`crate::StagingRing`] outside a detector.
    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Compiles (once) and returns the compute pipeline for a shader stage.
    /// Validation failures surface as [`SiftError::ShaderLoad`].
    pub(crate) fn get_pipeline(&mut self, name: &'static str) -> Result<Arc<wgpu::ComputePipeline>> {
        if let Some(p) = self.pipelines.get(name) {
            return Ok(p.clone());
        }
        let source = SHADER_SOURCES
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, s)| *s)
            .ok_or(SiftError::ShaderLoad {
                shader: name,
                message: "unknown shader".into(),
            })?;

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(name),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });
        let entries: Vec<wgpu::BindGroupLayoutEntry> = shader_bindings(name)
            .iter()
            .enumerate()
            .map(|(i, b)| layout_entry(i as u32, *b))
            .collect();
        let bind_layout = self
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(name),
                entries: &entries,
            });
        let layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(name),
                bind_group_layouts: &[&bind_layout],
                push_constant_ranges: &[],
            });
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(name),
                layout: Some(&layout),
                module: &module,
                entry_point: "main",
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            });
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(SiftError::ShaderLoad {
                shader: name,
                message: err.to_string(),
            });
        }

        let pipeline = Arc::new(pipeline);
        self.pipelines.insert(name, pipeline.clone());
        Ok(pipeline)
    }

    /// Returns the storage buffer holding the normalized 1-D Gaussian for
    /// `(sigma, radius)`, creating and caching it on first use.
    pub(crate) fn get_kernel_buffer(&mut self, sigma: f32, radius: u32) -> Arc<wgpu::Buffer> {
        let key = KernelKey::new(sigma, radius);
        if let Some(buf) = self.kernels.get(&key) {
            return buf.clone();
        }
        let kernel = gaussian_kernel(sigma, radius);
        let buf = Arc::new(self.device.create_buffer_init(
            &wgpu::util::BufferInitDescriptor {
                label: Some("gaussian kernel"),
                contents: bytemuck::cast_slice(&kernel),
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            },
        ));
        self.kernels.insert(key, buf.clone());
        buf
    }

    /// Uploads a small `#[repr(C)]` struct as a uniform buffer.
    pub(crate) fn uniform<T: bytemuck::Pod>(&self, value: &T) -> wgpu::Buffer {
        self.device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("params"),
                contents: bytemuck::bytes_of(value),
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            })
    }

    /// Allocates a storage texture usable as both shader input and output.
    pub(crate) fn create_storage_texture(
        &self,
        width: u32,
        height: u32,
        format: wgpu::TextureFormat,
    ) -> wgpu::Texture {
        self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("sift storage texture"),
            size: wgpu::Extent3d {
                width: width.max(1),
                height: height.max(1),
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::STORAGE_BINDING
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_DST
                | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_is_normalized_and_symmetric() {
        for sigma in [0.8f32, 1.6, 2.2627418, 5.0] {
            let r = kernel_radius(sigma);
            let k = gaussian_kernel(sigma, r);
            assert_eq!(k.len(), 2 * r as usize + 1);
            let sum: f32 = k.iter().sum();
            assert!((sum - 1.0).abs() < 1e-6, "sum = {sum}");
            for i in 0..r as usize {
                assert!((k[i] - k[k.len() - 1 - i]).abs() < 1e-7);
            }
            // Center tap dominates.
            assert!(k[r as usize] >= *k.first().unwrap());
        }
    }

    #[test]
    fn kernel_key_quantizes_to_four_decimals() {
        assert_eq!(KernelKey::new(1.60001, 5), KernelKey::new(1.60004, 5));
        assert_ne!(KernelKey::new(1.6001, 5), KernelKey::new(1.6002, 5));
        assert_ne!(KernelKey::new(1.6, 5), KernelKey::new(1.6, 6));
    }

    #[test]
    fn kernel_radius_covers_three_sigma() {
        assert_eq!(kernel_radius(1.6), 5);
        assert_eq!(kernel_radius(0.9), 3);
        assert_eq!(kernel_radius(3.2), 10);
    }
}
