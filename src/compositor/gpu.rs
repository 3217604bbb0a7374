use std::cell::Cell;
use std::marker::PhantomData;
use std::thread::{self, ThreadId};
use std::time::Instant;

use bytemuck::{Pod, Zeroable};

use super::{check_mask, check_planes, Compositor, CompositorSettings};
use crate::codec::{EncoderSurface, SurfaceFrame};
use crate::error::CompositorError;
use crate::frame::{PackedPlanes, SegmentationMask};

const TARGET_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct CompositeParams {
    background: [f32; 4],
    show_matte: u32,
    _pad: [u32; 3],
}

/// Headless wgpu compositor
///
/// Y, U and V are uploaded as R8Unorm textures, the mask at its native size as
/// R32Float (R8Unorm when the adapter cannot filter float textures) and
/// upscaled by the linear sampler. The rendered RGBA frame is read back and
/// presented to the encoder surface.
///
/// The compositor is bound to the thread that initialized it; rendering from
/// any other thread fails with [`CompositorError::ContextNotCurrent`].
pub struct WgpuCompositor {
    settings: CompositorSettings,
    resources: Option<GpuResources>,
    owner: Option<ThreadId>,
    frames_rendered: u64,
    // Single-owner: the type is Send but not Sync
    _not_sync: PhantomData<Cell<()>>,
}

struct MaskTexture {
    texture: wgpu::Texture,
    width: u32,
    height: u32,
}

struct GpuResources {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipeline: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    sampler: wgpu::Sampler,
    params: wgpu::Buffer,
    y: wgpu::Texture,
    u: wgpu::Texture,
    v: wgpu::Texture,
    mask: Option<MaskTexture>,
    mask_format: wgpu::TextureFormat,
    bind_group: Option<wgpu::BindGroup>,
    target: wgpu::Texture,
    staging: wgpu::Buffer,
    padded_bytes_per_row: u32,
    width: u32,
    height: u32,
    surface: EncoderSurface,
}

impl WgpuCompositor {
    pub fn new(settings: CompositorSettings) -> Self {
        Self {
            settings,
            resources: None,
            owner: None,
            frames_rendered: 0,
            _not_sync: PhantomData,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.resources.is_some()
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered
    }

    /// Fail unless called from the owning thread
    fn ensure_current(&self) -> Result<(), CompositorError> {
        match self.owner {
            Some(owner) if owner == thread::current().id() => Ok(()),
            Some(_) => Err(CompositorError::ContextNotCurrent),
            None => Err(CompositorError::NotInitialized),
        }
    }
}

fn plane_texture(device: &wgpu::Device, label: &str, width: u32, height: u32, format: wgpu::TextureFormat) -> wgpu::Texture {
    device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size: wgpu::Extent3d {
            width: width.max(1),
            height: height.max(1),
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format,
        usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        view_formats: &[],
    })
}

fn upload(queue: &wgpu::Queue, texture: &wgpu::Texture, data: &[u8], width: u32, height: u32, bytes_per_texel: u32) {
    queue.write_texture(
        wgpu::TexelCopyTextureInfo {
            texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        data,
        wgpu::TexelCopyBufferLayout {
            offset: 0,
            bytes_per_row: Some(width * bytes_per_texel),
            rows_per_image: Some(height),
        },
        wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
    );
}

fn gpu_error(operation: &'static str, error: wgpu::Error) -> CompositorError {
    CompositorError::Gpu {
        operation,
        message: error.to_string(),
    }
}

impl GpuResources {
    fn create(width: u32, height: u32, surface: EncoderSurface) -> Result<Self, CompositorError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or(CompositorError::AdapterUnavailable)?;

        let info = adapter.get_info();
        tracing::info!("Using GPU: {} ({:?})", info.name, info.backend);

        let float_filterable = adapter.features().contains(wgpu::Features::FLOAT32_FILTERABLE);
        let required_features = if float_filterable {
            wgpu::Features::FLOAT32_FILTERABLE
        } else {
            wgpu::Features::empty()
        };

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("Compositor Device"),
                required_features,
                required_limits: adapter.limits(),
                memory_hints: wgpu::MemoryHints::Performance,
            },
            None,
        ))
        .map_err(|e| CompositorError::DeviceCreation(e.to_string()))?;

        let mask_format = if float_filterable {
            wgpu::TextureFormat::R32Float
        } else {
            tracing::info!("Adapter cannot filter R32Float, using an 8-bit mask texture");
            wgpu::TextureFormat::R8Unorm
        };

        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Composite Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shader.wgsl").into()),
        });

        let texture_entry = |binding: u32| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float { filterable: true },
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            },
            count: None,
        };

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Composite Bind Group Layout"),
            entries: &[
                texture_entry(0),
                texture_entry(1),
                texture_entry(2),
                // Mask, filterable so the sampler upscales it
                texture_entry(3),
                wgpu::BindGroupLayoutEntry {
                    binding: 4,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 5,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Composite Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Composite Pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: Some("vs_main"),
                buffers: &[],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format: TARGET_FORMAT,
                    blend: Some(wgpu::BlendState::REPLACE),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                ..Default::default()
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Composite Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        let params = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Composite Params"),
            size: std::mem::size_of::<CompositeParams>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let (cw, ch) = (width / 2, height / 2);
        let y = plane_texture(&device, "Y Plane", width, height, wgpu::TextureFormat::R8Unorm);
        let u = plane_texture(&device, "U Plane", cw, ch, wgpu::TextureFormat::R8Unorm);
        let v = plane_texture(&device, "V Plane", cw, ch, wgpu::TextureFormat::R8Unorm);

        let target = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Composite Target"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: TARGET_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });

        let unpadded = width * 4;
        let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let padded_bytes_per_row = unpadded.div_ceil(align) * align;
        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Composite Readback"),
            size: (padded_bytes_per_row * height) as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        if let Some(error) = pollster::block_on(device.pop_error_scope()) {
            return Err(gpu_error("initialize", error));
        }

        Ok(Self {
            device,
            queue,
            pipeline,
            bind_group_layout,
            sampler,
            params,
            y,
            u,
            v,
            mask: None,
            mask_format,
            bind_group: None,
            target,
            staging,
            padded_bytes_per_row,
            width,
            height,
            surface,
        })
    }

    /// (Re)create the mask texture and bind group when the mask size changes
    fn ensure_mask_texture(&mut self, width: u32, height: u32) {
        let current = self.mask.as_ref().map(|m| (m.width, m.height));
        if current == Some((width, height)) && self.bind_group.is_some() {
            return;
        }
        if let Some(old) = self.mask.take() {
            old.texture.destroy();
        }

        let texture = plane_texture(&self.device, "Mask", width, height, self.mask_format);
        let views = [&self.y, &self.u, &self.v, &texture].map(|t| t.create_view(&wgpu::TextureViewDescriptor::default()));

        self.bind_group = Some(self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Composite Bind Group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&views[0]),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&views[1]),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(&views[2]),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::TextureView(&views[3]),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: wgpu::BindingResource::Sampler(&self.sampler),
                },
                wgpu::BindGroupEntry {
                    binding: 5,
                    resource: self.params.as_entire_binding(),
                },
            ],
        }));
        self.mask = Some(MaskTexture { texture, width, height });
        tracing::debug!("Mask texture {}x{} ({:?})", width, height, self.mask_format);
    }

    fn upload_frame(&mut self, planes: &PackedPlanes, mask: &SegmentationMask, params: CompositeParams) {
        let (cw, ch) = planes.chroma_size();
        upload(&self.queue, &self.y, &planes.y, self.width, self.height, 1);
        if cw > 0 && ch > 0 {
            upload(&self.queue, &self.u, &planes.u, cw, ch, 1);
            upload(&self.queue, &self.v, &planes.v, cw, ch, 1);
        } else {
            upload(&self.queue, &self.u, &[128], 1, 1, 1);
            upload(&self.queue, &self.v, &[128], 1, 1, 1);
        }

        self.ensure_mask_texture(mask.width, mask.height);
        if let Some(texture) = self.mask.as_ref().map(|m| &m.texture) {
            if self.mask_format == wgpu::TextureFormat::R32Float {
                upload(&self.queue, texture, bytemuck::cast_slice(&mask.values), mask.width, mask.height, 4);
            } else {
                let quantized: Vec<u8> = mask
                    .values
                    .iter()
                    .map(|v| (v.clamp(0.0, 1.0) * 255.0).round() as u8)
                    .collect();
                upload(&self.queue, texture, &quantized, mask.width, mask.height, 1);
            }
        }

        self.queue.write_buffer(&self.params, 0, bytemuck::bytes_of(&params));
    }

    fn draw(&self) -> Result<(), CompositorError> {
        let bind_group = self.bind_group.as_ref().ok_or(CompositorError::NotInitialized)?;
        let view = self.target.create_view(&wgpu::TextureViewDescriptor::default());

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Composite Encoder"),
        });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Composite Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, bind_group, &[]);
            pass.draw(0..3, 0..1);
        }

        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &self.target,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &self.staging,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(self.padded_bytes_per_row),
                    rows_per_image: Some(self.height),
                },
            },
            wgpu::Extent3d {
                width: self.width,
                height: self.height,
                depth_or_array_layers: 1,
            },
        );

        self.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    /// Map the staging buffer and strip the row padding
    fn read_back(&self) -> Result<Vec<u8>, CompositorError> {
        let slice = self.staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);

        match rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(CompositorError::Gpu {
                    operation: "readback",
                    message: e.to_string(),
                })
            }
            Err(_) => {
                return Err(CompositorError::Gpu {
                    operation: "readback",
                    message: "map callback dropped".to_string(),
                })
            }
        }

        let row_bytes = (self.width * 4) as usize;
        let mut rgba = Vec::with_capacity(row_bytes * self.height as usize);
        {
            let data = slice.get_mapped_range();
            for row in data.chunks(self.padded_bytes_per_row as usize).take(self.height as usize) {
                rgba.extend_from_slice(&row[..row_bytes]);
            }
        }
        self.staging.unmap();
        Ok(rgba)
    }

    fn destroy(self) {
        if let Some(mask) = self.mask {
            mask.texture.destroy();
        }
        for texture in [&self.y, &self.u, &self.v, &self.target] {
            texture.destroy();
        }
        self.staging.destroy();
        self.params.destroy();
    }
}

impl Compositor for WgpuCompositor {
    fn initialize(&mut self, width: u32, height: u32, surface: EncoderSurface) -> Result<(), CompositorError> {
        if width == 0 || height == 0 {
            return Err(CompositorError::PlaneSize {
                plane: "Y",
                expected: 1,
                actual: 0,
            });
        }
        self.release();
        self.resources = Some(GpuResources::create(width, height, surface)?);
        self.owner = Some(thread::current().id());
        self.frames_rendered = 0;
        tracing::info!("GPU compositor initialized for {}x{}", width, height);
        Ok(())
    }

    fn render_frame(
        &mut self,
        planes: &PackedPlanes,
        mask: &SegmentationMask,
        timestamp_us: i64,
    ) -> Result<(), CompositorError> {
        let _span = tracing::debug_span!("composite_gpu").entered();
        let start = Instant::now();

        self.ensure_current()?;
        let background = self.settings.background.0;
        let params = CompositeParams {
            background: [background[0], background[1], background[2], 1.0],
            show_matte: self.settings.show_matte as u32,
            _pad: [0; 3],
        };
        let resources = self.resources.as_mut().ok_or(CompositorError::NotInitialized)?;
        check_planes(planes, resources.width, resources.height)?;
        check_mask(mask)?;

        resources.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        resources.device.push_error_scope(wgpu::ErrorFilter::Validation);

        resources.upload_frame(planes, mask, params);
        let drawn = resources.draw();

        let validation = pollster::block_on(resources.device.pop_error_scope());
        let oom = pollster::block_on(resources.device.pop_error_scope());
        if let Some(error) = validation.or(oom) {
            return Err(gpu_error("render", error));
        }
        drawn?;

        let rgba = resources.read_back()?;
        resources.surface.present(SurfaceFrame {
            width: resources.width,
            height: resources.height,
            rgba,
            timestamp_us,
        })?;

        self.frames_rendered += 1;
        tracing::trace!("GPU composite took {:.2}ms", start.elapsed().as_secs_f64() * 1000.0);
        Ok(())
    }

    fn release(&mut self) {
        if let Some(resources) = self.resources.take() {
            resources.destroy();
            tracing::debug!("GPU compositor released after {} frames", self.frames_rendered);
        }
        self.owner = None;
    }

    fn name(&self) -> &'static str {
        "wgpu"
    }
}

impl Drop for WgpuCompositor {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackgroundColor;

    fn planes(width: u32, height: u32, luma: u8) -> PackedPlanes {
        let chroma = ((width / 2) * (height / 2)) as usize;
        PackedPlanes {
            width,
            height,
            y: vec![luma; (width * height) as usize],
            u: vec![128; chroma],
            v: vec![128; chroma],
        }
    }

    /// Initialized compositor, or `None` when the machine has no usable adapter
    fn gpu(settings: CompositorSettings, width: u32, height: u32) -> Option<(WgpuCompositor, crate::codec::SurfaceReceiver)> {
        let (surface, receiver) = EncoderSurface::channel(4);
        let mut compositor = WgpuCompositor::new(settings);
        match compositor.initialize(width, height, surface) {
            Ok(()) => Some((compositor, receiver)),
            Err(CompositorError::AdapterUnavailable) | Err(CompositorError::DeviceCreation(_)) => {
                eprintln!("skipping: no GPU adapter");
                None
            }
            Err(e) => panic!("initialize failed: {e}"),
        }
    }

    #[test]
    fn test_render_before_initialize() {
        let mut compositor = WgpuCompositor::new(CompositorSettings::default());
        let result = compositor.render_frame(&planes(2, 2, 0), &SegmentationMask::zeros(1, 1), 0);
        assert!(matches!(result, Err(CompositorError::NotInitialized)));
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut compositor = WgpuCompositor::new(CompositorSettings::default());
        compositor.release();
        compositor.release();
        assert!(!compositor.is_initialized());
    }

    #[test]
    fn test_gpu_mask_selects_foreground_or_background() {
        let settings = CompositorSettings {
            background: BackgroundColor([0.0, 0.0, 1.0]),
            show_matte: false,
        };
        let Some((mut compositor, receiver)) = gpu(settings, 64, 32) else {
            return;
        };

        compositor
            .render_frame(&planes(64, 32, 235), &SegmentationMask::new(1, 1, vec![1.0]), 42)
            .unwrap();
        let frame = receiver.try_next().unwrap();
        assert_eq!(frame.timestamp_us, 42);
        assert_eq!(frame.rgba.len(), 64 * 32 * 4);
        assert!(frame.rgba.chunks(4).all(|p| p[0] >= 250 && p[1] >= 250 && p[2] >= 250));

        compositor
            .render_frame(&planes(64, 32, 235), &SegmentationMask::zeros(4, 4), 43)
            .unwrap();
        let frame = receiver.try_next().unwrap();
        assert!(frame.rgba.chunks(4).all(|p| p[0] <= 2 && p[1] <= 2 && p[2] >= 253));

        compositor.release();
        assert!(!compositor.is_initialized());
    }

    #[test]
    fn test_gpu_rejects_foreign_thread() {
        let Some((compositor, _receiver)) = gpu(CompositorSettings::default(), 8, 8) else {
            return;
        };
        let result = std::thread::spawn(move || {
            let mut compositor = compositor;
            compositor.render_frame(&planes(8, 8, 0), &SegmentationMask::zeros(1, 1), 0)
        })
        .join()
        .unwrap();
        assert!(matches!(result, Err(CompositorError::ContextNotCurrent)));
    }
}
