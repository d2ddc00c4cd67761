// wgpu backend - Presentation through wgpu onto a winit window
//
// Capability profiles map onto adapter requests, from a high-performance
// adapter with its full limits down to the forced fallback (software)
// adapter. Textures keep a CPU staging copy; unlocking uploads the locked
// rectangle with `Queue::write_texture`.
//
// wgpu validation errors are caught with error scopes so a bad program blob
// or an out-of-range draw surfaces as a `GpuError` instead of a panic.

use super::{
    DeviceProfile, DeviceStatus, GpuBackend, GpuDevice, GpuError, GpuFactory, Lockable, Mapped,
    PresentParams, Rect, TextureFormat,
};
use crate::geometry::{Vertex, Viewport};
use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use winit::window::Window;

/// Vertex attributes: pre-transformed position (x, y, z, rhw) and texcoord (u, v)
const VERTEX_ATTRIBUTES: [wgpu::VertexAttribute; 2] = wgpu::vertex_attr_array![
    0 => Float32x4,
    1 => Float32x2,
];

/// wgpu entry point bound to one window
#[derive(Debug, Clone)]
pub struct WgpuBackend {
    window: Arc<Window>,
}

impl WgpuBackend {
    /// Create a backend presenting into `window`
    pub fn new(window: Arc<Window>) -> Self {
        Self { window }
    }
}

impl GpuBackend for WgpuBackend {
    type Factory = WgpuFactory;

    fn create_factory(&mut self) -> Result<WgpuFactory, GpuError> {
        Ok(WgpuFactory {
            instance: wgpu::Instance::default(),
            window: self.window.clone(),
        })
    }
}

/// wgpu instance used to create devices
pub struct WgpuFactory {
    instance: wgpu::Instance,
    window: Arc<Window>,
}

impl WgpuFactory {
    fn adapter_options(profile: DeviceProfile) -> (wgpu::PowerPreference, bool) {
        match profile {
            DeviceProfile::HardwarePure | DeviceProfile::Hardware => {
                (wgpu::PowerPreference::HighPerformance, false)
            }
            DeviceProfile::Mixed => (wgpu::PowerPreference::LowPower, false),
            DeviceProfile::Software => (wgpu::PowerPreference::None, true),
        }
    }

    fn required_limits(profile: DeviceProfile, adapter: &wgpu::Adapter) -> wgpu::Limits {
        match profile {
            DeviceProfile::HardwarePure => adapter.limits(),
            DeviceProfile::Hardware | DeviceProfile::Mixed => {
                wgpu::Limits::downlevel_defaults().using_resolution(adapter.limits())
            }
            DeviceProfile::Software => {
                wgpu::Limits::downlevel_webgl2_defaults().using_resolution(adapter.limits())
            }
        }
    }
}

impl GpuFactory for WgpuFactory {
    type Device = WgpuDevice;

    fn create_device(
        &mut self,
        profile: DeviceProfile,
        params: &PresentParams,
    ) -> Result<WgpuDevice, GpuError> {
        let creation_error = |reason: String| GpuError::DeviceCreation { profile, reason };

        let surface = self
            .instance
            .create_surface(self.window.clone())
            .map_err(|e| creation_error(e.to_string()))?;

        let (power_preference, force_fallback_adapter) = Self::adapter_options(profile);
        let adapter = pollster::block_on(self.instance.request_adapter(
            &wgpu::RequestAdapterOptions {
                power_preference,
                compatible_surface: Some(&surface),
                force_fallback_adapter,
            },
        ))
        .map_err(|e| creation_error(e.to_string()))?;

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("indexed-presenter"),
            required_features: wgpu::Features::empty(),
            required_limits: Self::required_limits(profile, &adapter),
            memory_hints: wgpu::MemoryHints::Performance,
            ..Default::default()
        }))
        .map_err(|e| creation_error(e.to_string()))?;

        let caps = surface.get_capabilities(&adapter);
        let format = caps
            .formats
            .iter()
            .copied()
            .find(|f| !f.is_srgb())
            .or_else(|| caps.formats.first().copied())
            .ok_or_else(|| creation_error("surface not supported by adapter".to_string()))?;
        let alpha_mode = caps
            .alpha_modes
            .first()
            .copied()
            .unwrap_or(wgpu::CompositeAlphaMode::Auto);

        let lost = Arc::new(AtomicBool::new(false));
        {
            let lost = lost.clone();
            device.set_device_lost_callback(move |reason, message| {
                warn!(?reason, %message, "wgpu device lost");
                lost.store(true, Ordering::SeqCst);
            });
        }

        let (width, height) = surface_size(&self.window, params);
        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format,
            width,
            height,
            present_mode: present_mode(params),
            desired_maximum_frame_latency: 2,
            alpha_mode,
            view_formats: vec![],
        };

        let queue = Arc::new(queue);
        let mut wgpu_device = WgpuDevice::new(
            device,
            queue,
            surface,
            config,
            *params,
            self.window.clone(),
            lost,
        );
        wgpu_device
            .configure_surface()
            .map_err(|e| creation_error(e.to_string()))?;

        debug!(
            ?profile,
            adapter = %adapter.get_info().name,
            ?format,
            "wgpu device created"
        );
        Ok(wgpu_device)
    }

    fn release(self) -> Result<(), GpuError> {
        Ok(())
    }
}

fn surface_size(window: &Window, params: &PresentParams) -> (u32, u32) {
    if params.windowed || params.back_buffer_width == 0 || params.back_buffer_height == 0 {
        let size = window.inner_size();
        (size.width.max(1), size.height.max(1))
    } else {
        (params.back_buffer_width, params.back_buffer_height)
    }
}

fn present_mode(params: &PresentParams) -> wgpu::PresentMode {
    if params.vsync {
        wgpu::PresentMode::AutoVsync
    } else {
        wgpu::PresentMode::AutoNoVsync
    }
}

fn texture_format(format: TextureFormat) -> wgpu::TextureFormat {
    match format {
        TextureFormat::L8 => wgpu::TextureFormat::R8Unorm,
        TextureFormat::X8R8G8B8 => wgpu::TextureFormat::Bgra8Unorm,
    }
}

/// wgpu device, surface and the pipeline state bound to them
pub struct WgpuDevice {
    device: wgpu::Device,
    queue: Arc<wgpu::Queue>,
    surface: wgpu::Surface<'static>,
    config: wgpu::SurfaceConfiguration,
    params: PresentParams,
    window: Arc<Window>,
    lost: Arc<AtomicBool>,
    surface_stale: bool,

    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    target_buffer: wgpu::Buffer,

    vertex_format: bool,
    stream: Option<Arc<wgpu::Buffer>>,
    textures: [Option<Arc<wgpu::TextureView>>; 2],
    pipeline: Option<Arc<wgpu::RenderPipeline>>,
    viewport: Option<Viewport>,
    bind_group: Option<wgpu::BindGroup>,
    pending_frame: Option<wgpu::SurfaceTexture>,
}

impl WgpuDevice {
    fn new(
        device: wgpu::Device,
        queue: Arc<wgpu::Queue>,
        surface: wgpu::Surface<'static>,
        config: wgpu::SurfaceConfiguration,
        params: PresentParams,
        window: Arc<Window>,
        lost: Arc<AtomicBool>,
    ) -> Self {
        let texture_entry = |binding: u32| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float { filterable: false },
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            },
            count: None,
        };

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("presenter-bind-layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                texture_entry(1),
                texture_entry(2),
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("presenter-pipeline-layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let target_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("presenter-target"),
            size: std::mem::size_of::<[f32; 4]>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        Self {
            device,
            queue,
            surface,
            config,
            params,
            window,
            lost,
            surface_stale: false,
            bind_group_layout,
            pipeline_layout,
            target_buffer,
            vertex_format: false,
            stream: None,
            textures: [None, None],
            pipeline: None,
            viewport: None,
            bind_group: None,
            pending_frame: None,
        }
    }

    /// Run `f` inside validation and out-of-memory error scopes
    fn scoped<T>(&self, f: impl FnOnce(&wgpu::Device) -> T) -> Result<T, String> {
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f(&self.device);
        let validation = pollster::block_on(self.device.pop_error_scope());
        let out_of_memory = pollster::block_on(self.device.pop_error_scope());

        match validation.or(out_of_memory) {
            Some(err) => Err(err.to_string()),
            None => Ok(value),
        }
    }

    fn configure_surface(&mut self) -> Result<(), GpuError> {
        let (surface, config) = (&self.surface, &self.config);
        self.scoped(|device| surface.configure(device, config))
            .map_err(GpuError::Reset)?;
        self.surface_stale = false;
        Ok(())
    }

    fn bind_group(&mut self) -> Result<&wgpu::BindGroup, GpuError> {
        if self.bind_group.is_none() {
            let [Some(index_view), Some(palette_view)] = &self.textures else {
                return Err(GpuError::Draw("textures not bound".to_string()));
            };
            let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("presenter-bind-group"),
                layout: &self.bind_group_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: self.target_buffer.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::TextureView(index_view),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: wgpu::BindingResource::TextureView(palette_view),
                    },
                ],
            });
            self.bind_group = Some(bind_group);
        }

        self.bind_group
            .as_ref()
            .ok_or_else(|| GpuError::Draw("bind group unavailable".to_string()))
    }

    /// Viewport clipped to the current render target
    fn clipped_viewport(&self) -> Option<Viewport> {
        let vp = self.viewport?;
        let right = vp.right().min(self.config.width);
        let bottom = vp.bottom().min(self.config.height);
        if vp.x >= right || vp.y >= bottom {
            return None;
        }
        Some(Viewport::new(vp.x, vp.y, right - vp.x, bottom - vp.y))
    }
}

impl GpuDevice for WgpuDevice {
    type VertexBuffer = WgpuVertexBuffer;
    type Texture = WgpuTexture;
    type PixelProgram = WgpuProgram;

    fn create_vertex_buffer(&mut self, size: usize) -> Result<WgpuVertexBuffer, GpuError> {
        let buffer = self
            .scoped(|device| {
                device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("presenter-quad"),
                    size: size as u64,
                    usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                })
            })
            .map_err(|reason| GpuError::ResourceCreation {
                resource: "vertex buffer",
                reason,
            })?;

        Ok(WgpuVertexBuffer {
            buffer: Arc::new(buffer),
            queue: self.queue.clone(),
            staging: vec![0; size],
            locked: false,
        })
    }

    fn create_texture(
        &mut self,
        width: u32,
        height: u32,
        format: TextureFormat,
    ) -> Result<WgpuTexture, GpuError> {
        let resource = match format {
            TextureFormat::L8 => "source texture",
            TextureFormat::X8R8G8B8 => "palette texture",
        };
        let texture = self
            .scoped(|device| {
                device.create_texture(&wgpu::TextureDescriptor {
                    label: Some(resource),
                    size: wgpu::Extent3d {
                        width,
                        height,
                        depth_or_array_layers: 1,
                    },
                    mip_level_count: 1,
                    sample_count: 1,
                    dimension: wgpu::TextureDimension::D2,
                    format: texture_format(format),
                    usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                    view_formats: &[],
                })
            })
            .map_err(|reason| GpuError::ResourceCreation { resource, reason })?;

        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let pitch = width as usize * format.bytes_per_texel();

        Ok(WgpuTexture {
            texture,
            view: Arc::new(view),
            queue: self.queue.clone(),
            width,
            height,
            format,
            pitch,
            staging: vec![0; pitch * height as usize],
            locked: None,
        })
    }

    fn create_pixel_program(&mut self, blob: &[u8]) -> Result<WgpuProgram, GpuError> {
        let program_error = |reason: String| GpuError::ResourceCreation {
            resource: "pixel program",
            reason,
        };
        let source = std::str::from_utf8(blob).map_err(|e| program_error(e.to_string()))?;

        let (layout, format) = (&self.pipeline_layout, self.config.format);
        let pipeline = self
            .scoped(|device| {
                let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: Some("presenter-palette-program"),
                    source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(source)),
                });

                device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                    label: Some("presenter-pipeline"),
                    layout: Some(layout),
                    vertex: wgpu::VertexState {
                        module: &module,
                        entry_point: Some("vs_main"),
                        buffers: &[wgpu::VertexBufferLayout {
                            array_stride: Vertex::STRIDE as wgpu::BufferAddress,
                            step_mode: wgpu::VertexStepMode::Vertex,
                            attributes: &VERTEX_ATTRIBUTES,
                        }],
                        compilation_options: wgpu::PipelineCompilationOptions::default(),
                    },
                    primitive: wgpu::PrimitiveState {
                        topology: wgpu::PrimitiveTopology::TriangleStrip,
                        ..Default::default()
                    },
                    depth_stencil: None,
                    multisample: wgpu::MultisampleState::default(),
                    fragment: Some(wgpu::FragmentState {
                        module: &module,
                        entry_point: Some("fs_main"),
                        targets: &[Some(wgpu::ColorTargetState {
                            format,
                            blend: None,
                            write_mask: wgpu::ColorWrites::ALL,
                        })],
                        compilation_options: wgpu::PipelineCompilationOptions::default(),
                    }),
                    multiview: None,
                    cache: None,
                })
            })
            .map_err(program_error)?;

        Ok(WgpuProgram {
            pipeline: Arc::new(pipeline),
        })
    }

    fn set_vertex_format(&mut self) -> Result<(), GpuError> {
        self.vertex_format = true;
        Ok(())
    }

    fn set_stream_source(
        &mut self,
        buffer: &WgpuVertexBuffer,
        stride: usize,
    ) -> Result<(), GpuError> {
        if stride != Vertex::STRIDE {
            return Err(GpuError::Binding("stream source"));
        }
        self.stream = Some(buffer.buffer.clone());
        Ok(())
    }

    fn set_texture(&mut self, stage: u32, texture: &WgpuTexture) -> Result<(), GpuError> {
        let slot = self
            .textures
            .get_mut(stage as usize)
            .ok_or(GpuError::Binding("texture stage"))?;
        *slot = Some(texture.view.clone());
        self.bind_group = None;
        Ok(())
    }

    fn set_pixel_program(&mut self, program: &WgpuProgram) -> Result<(), GpuError> {
        self.pipeline = Some(program.pipeline.clone());
        Ok(())
    }

    fn set_viewport(&mut self, viewport: Viewport) -> Result<(), GpuError> {
        if viewport.width == 0 || viewport.height == 0 {
            return Err(GpuError::Binding("viewport"));
        }
        self.viewport = Some(viewport);
        Ok(())
    }

    fn pixel_center_bias(&self) -> f32 {
        // wgpu samples at pixel centers already
        0.0
    }

    fn test_cooperative_level(&mut self) -> DeviceStatus {
        if self.lost.load(Ordering::SeqCst) {
            return DeviceStatus::Removed;
        }

        let size = self.window.inner_size();
        if size.width == 0 || size.height == 0 {
            return DeviceStatus::Lost;
        }

        let resized = self.params.windowed
            && (size.width != self.config.width || size.height != self.config.height);
        if self.surface_stale || resized {
            return DeviceStatus::NotReset;
        }

        DeviceStatus::Ok
    }

    fn reset(&mut self, params: &PresentParams) -> Result<(), GpuError> {
        self.pending_frame = None;
        self.params = *params;

        let (width, height) = surface_size(&self.window, params);
        self.config.width = width;
        self.config.height = height;
        self.config.present_mode = present_mode(params);
        self.configure_surface()?;

        // Bindings do not survive a reset
        self.vertex_format = false;
        self.stream = None;
        self.textures = [None, None];
        self.pipeline = None;
        self.viewport = None;
        self.bind_group = None;
        Ok(())
    }

    fn draw_triangle_strip(&mut self, primitive_count: u32) -> Result<(), GpuError> {
        let (Some(pipeline), Some(stream)) = (self.pipeline.clone(), self.stream.clone()) else {
            return Err(GpuError::Draw("pipeline state incomplete".to_string()));
        };
        if !self.vertex_format {
            return Err(GpuError::Draw("vertex format not set".to_string()));
        }
        let viewport = self
            .clipped_viewport()
            .ok_or_else(|| GpuError::Draw("viewport outside render target".to_string()))?;

        let frame = match self.surface.get_current_texture() {
            Ok(frame) => frame,
            Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                self.surface_stale = true;
                return Err(GpuError::Draw("surface needs reconfiguration".to_string()));
            }
            Err(wgpu::SurfaceError::OutOfMemory) => {
                self.lost.store(true, Ordering::SeqCst);
                return Err(GpuError::DeviceLost);
            }
            Err(err) => return Err(GpuError::Draw(err.to_string())),
        };
        let target = frame
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());

        let target_rect = [0.0, 0.0, self.config.width as f32, self.config.height as f32];
        self.queue
            .write_buffer(&self.target_buffer, 0, bytemuck::cast_slice(&target_rect));

        self.bind_group()?;
        let (bind_group, queue) = (self.bind_group.as_ref(), self.queue.clone());
        self.scoped(|device| {
            let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("presenter-encoder"),
            });
            {
                let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                    label: Some("presenter-pass"),
                    color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                        view: &target,
                        depth_slice: None,
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
                pass.set_scissor_rect(viewport.x, viewport.y, viewport.width, viewport.height);
                pass.set_pipeline(&pipeline);
                pass.set_bind_group(0, bind_group, &[]);
                pass.set_vertex_buffer(0, stream.slice(..));
                pass.draw(0..primitive_count + 2, 0..1);
            }
            queue.submit(Some(encoder.finish()));
        })
        .map_err(GpuError::Draw)?;

        self.pending_frame = Some(frame);
        Ok(())
    }

    fn present(&mut self) -> Result<(), GpuError> {
        let frame = self
            .pending_frame
            .take()
            .ok_or_else(|| GpuError::Present("no frame drawn".to_string()))?;
        self.window.pre_present_notify();
        frame.present();
        Ok(())
    }

    fn release(mut self) -> Result<(), GpuError> {
        self.pending_frame = None;
        self.stream = None;
        self.textures = [None, None];
        self.pipeline = None;
        self.bind_group = None;

        // Every resource holds a queue reference; the device holds one more
        let outstanding = Arc::strong_count(&self.queue).saturating_sub(1);
        if outstanding > 0 {
            return Err(GpuError::OutstandingReferences(outstanding as u32));
        }
        Ok(())
    }
}

/// Vertex buffer with a CPU staging copy
pub struct WgpuVertexBuffer {
    buffer: Arc<wgpu::Buffer>,
    queue: Arc<wgpu::Queue>,
    staging: Vec<u8>,
    locked: bool,
}

impl Lockable for WgpuVertexBuffer {
    fn lock(&mut self, _rect: Option<Rect>) -> Result<(), GpuError> {
        if self.locked {
            return Err(GpuError::AlreadyLocked);
        }
        self.locked = true;
        Ok(())
    }

    fn mapped(&mut self) -> Option<Mapped<'_>> {
        if !self.locked {
            return None;
        }
        let pitch = self.staging.len();
        Some(Mapped {
            bits: &mut self.staging,
            pitch,
        })
    }

    fn unlock(&mut self) {
        if std::mem::take(&mut self.locked) {
            self.queue.write_buffer(&self.buffer, 0, &self.staging);
        }
    }
}

/// Texture with a CPU staging copy
pub struct WgpuTexture {
    texture: wgpu::Texture,
    view: Arc<wgpu::TextureView>,
    queue: Arc<wgpu::Queue>,
    width: u32,
    height: u32,
    format: TextureFormat,
    pitch: usize,
    staging: Vec<u8>,
    locked: Option<Rect>,
}

impl WgpuTexture {
    fn offset(&self, rect: &Rect) -> usize {
        rect.y as usize * self.pitch + rect.x as usize * self.format.bytes_per_texel()
    }
}

impl Lockable for WgpuTexture {
    fn lock(&mut self, rect: Option<Rect>) -> Result<(), GpuError> {
        if self.locked.is_some() {
            return Err(GpuError::AlreadyLocked);
        }
        let rect = rect.unwrap_or(Rect::from_size(self.width, self.height));
        if rect.width == 0
            || rect.height == 0
            || rect.x + rect.width > self.width
            || rect.y + rect.height > self.height
        {
            return Err(GpuError::LockOutOfBounds);
        }
        self.locked = Some(rect);
        Ok(())
    }

    fn mapped(&mut self) -> Option<Mapped<'_>> {
        let rect = self.locked?;
        let offset = self.offset(&rect);
        Some(Mapped {
            bits: &mut self.staging[offset..],
            pitch: self.pitch,
        })
    }

    fn unlock(&mut self) {
        let Some(rect) = self.locked.take() else {
            return;
        };
        let offset = self.offset(&rect);

        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &self.texture,
                mip_level: 0,
                origin: wgpu::Origin3d {
                    x: rect.x,
                    y: rect.y,
                    z: 0,
                },
                aspect: wgpu::TextureAspect::All,
            },
            &self.staging[offset..],
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(self.pitch as u32),
                rows_per_image: Some(rect.height),
            },
            wgpu::Extent3d {
                width: rect.width,
                height: rect.height,
                depth_or_array_layers: 1,
            },
        );
    }
}

/// Compiled palette program and its render pipeline
pub struct WgpuProgram {
    pipeline: Arc<wgpu::RenderPipeline>,
}
