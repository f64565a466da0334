//! wgpu renderer that composites the overlay layer on top of the video layer.

use std::rc::Rc;

use anyhow::anyhow;
use wgpu::*;
use winit::{dpi::PhysicalSize, event_loop::EventLoopWindowTarget, window::WindowBuilder};

use crate::resolution::Resolution;

const BACKGROUND: Color = Color::BLACK;

/// Handle to the GPU used by all windows.
pub struct Gpu {
    instance: Instance,
    adapter: Adapter,
    device: Device,
    queue: Queue,
}

impl Gpu {
    /// Opens a suitable default GPU.
    pub async fn open() -> anyhow::Result<Self> {
        // The OpenGL backend panics spuriously, so don't enable it.
        let backends = Backends::PRIMARY;
        let instance = Instance::new(InstanceDescriptor {
            backends,
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&Default::default())
            .await
            .ok_or_else(|| anyhow!("no graphics adapter found"))?;
        let info = adapter.get_info();
        log::info!("using graphics adapter {} ({:?})", info.name, info.backend);

        let (device, queue) = adapter
            .request_device(
                &DeviceDescriptor {
                    label: None,
                    features: Features::empty(),
                    limits: Limits::downlevel_defaults().using_resolution(adapter.limits()),
                },
                None,
            )
            .await?;

        Ok(Self {
            instance,
            adapter,
            device,
            queue,
        })
    }
}

pub struct Window {
    pub(crate) win: winit::window::Window,
}

impl Window {
    pub fn open<T>(
        event_loop: &EventLoopWindowTarget<T>,
        title: &str,
        resolution: Resolution,
    ) -> anyhow::Result<Self> {
        let win = WindowBuilder::new()
            .with_resizable(true)
            .with_inner_size(PhysicalSize::new(resolution.width(), resolution.height()))
            .with_title(title)
            .build(event_loop)?;
        Ok(Self { win })
    }

    pub fn inner_resolution(&self) -> Resolution {
        let size = self.win.inner_size();
        Resolution::new(size.width, size.height)
    }
}

/// A texture holding one layer's image, plus the bind group sampling it.
struct Layer {
    texture: Texture,
    size: Extent3d,
    label: &'static str,
    bind_group: BindGroup,
}

impl Layer {
    const FORMAT: TextureFormat = TextureFormat::Rgba8UnormSrgb;

    fn new(gpu: &Gpu, layout: &BindGroupLayout, sampler: &Sampler, label: &'static str) -> Self {
        // Starts out as a single transparent pixel, so an empty layer draws nothing.
        let size = Extent3d::default();
        let texture = Self::create_texture(gpu, label, size);
        gpu.queue.write_texture(
            texture.as_image_copy(),
            &[0; 4],
            ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(4),
                rows_per_image: None,
            },
            size,
        );
        let bind_group = Self::create_bind_group(gpu, layout, sampler, &texture, label);
        Self {
            texture,
            size,
            label,
            bind_group,
        }
    }

    fn create_texture(gpu: &Gpu, label: &str, size: Extent3d) -> Texture {
        gpu.device.create_texture(&TextureDescriptor {
            label: Some(label),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: TextureDimension::D2,
            format: Self::FORMAT,
            usage: TextureUsages::TEXTURE_BINDING | TextureUsages::COPY_DST,
            view_formats: &[],
        })
    }

    fn create_bind_group(
        gpu: &Gpu,
        layout: &BindGroupLayout,
        sampler: &Sampler,
        texture: &Texture,
        label: &str,
    ) -> BindGroup {
        gpu.device.create_bind_group(&BindGroupDescriptor {
            label: Some(label),
            layout,
            entries: &[
                BindGroupEntry {
                    binding: 0,
                    resource: BindingResource::TextureView(
                        &texture.create_view(&Default::default()),
                    ),
                },
                BindGroupEntry {
                    binding: 1,
                    resource: BindingResource::Sampler(sampler),
                },
            ],
        })
    }

    fn update(
        &mut self,
        gpu: &Gpu,
        layout: &BindGroupLayout,
        sampler: &Sampler,
        res: Resolution,
        data: &[u8],
    ) {
        debug_assert_eq!(res.num_pixels() as usize * 4, data.len());
        let size = Extent3d {
            width: res.width(),
            height: res.height(),
            depth_or_array_layers: 1,
        };

        if self.size != size {
            log::trace!(
                "reallocating texture '{}' ({}x{} -> {})",
                self.label,
                self.size.width,
                self.size.height,
                res,
            );
            self.texture = Self::create_texture(gpu, self.label, size);
            self.bind_group =
                Self::create_bind_group(gpu, layout, sampler, &self.texture, self.label);
            self.size = size;
        }

        gpu.queue.write_texture(
            self.texture.as_image_copy(),
            data,
            ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(size.width * 4),
                rows_per_image: None,
            },
            size,
        );
    }
}

/// Which image of a window a texture update is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    Video,
    Overlay,
}

pub struct Renderer {
    gpu: Rc<Gpu>,
    surface: Surface,
    surface_format: TextureFormat,
    pipeline: RenderPipeline,
    layout: BindGroupLayout,
    sampler: Sampler,
    video: Layer,
    overlay: Layer,

    /// Surface must be destroyed before `Window`.
    window: Window,
}

impl Renderer {
    pub fn new(window: Window, gpu: Rc<Gpu>) -> anyhow::Result<Self> {
        // Safety: the surface is dropped before the window, see field order.
        let surface = unsafe { gpu.instance.create_surface(&window.win)? };
        let surface_format = *surface
            .get_capabilities(&gpu.adapter)
            .formats
            .first()
            .ok_or_else(|| anyhow!("adapter cannot render to window surface"))?;

        let shader = gpu.device.create_shader_module(ShaderModuleDescriptor {
            label: Some("layer shader"),
            source: ShaderSource::Wgsl(include_str!("shader.wgsl").into()),
        });

        let layout = gpu
            .device
            .create_bind_group_layout(&BindGroupLayoutDescriptor {
                label: Some("layer"),
                entries: &[
                    BindGroupLayoutEntry {
                        binding: 0,
                        visibility: ShaderStages::FRAGMENT,
                        ty: BindingType::Texture {
                            sample_type: TextureSampleType::Float { filterable: true },
                            view_dimension: TextureViewDimension::D2,
                            multisampled: false,
                        },
                        count: None,
                    },
                    BindGroupLayoutEntry {
                        binding: 1,
                        visibility: ShaderStages::FRAGMENT,
                        ty: BindingType::Sampler(SamplerBindingType::Filtering),
                        count: None,
                    },
                ],
            });

        // Both layers are drawn with alpha blending; the video layer is opaque anyway.
        let pipeline = gpu.device.create_render_pipeline(&RenderPipelineDescriptor {
            label: Some("layer"),
            layout: Some(
                &gpu.device
                    .create_pipeline_layout(&PipelineLayoutDescriptor {
                        label: None,
                        bind_group_layouts: &[&layout],
                        push_constant_ranges: &[],
                    }),
            ),
            vertex: VertexState {
                module: &shader,
                entry_point: "vert",
                buffers: &[],
            },
            fragment: Some(FragmentState {
                module: &shader,
                entry_point: "frag",
                targets: &[Some(ColorTargetState {
                    format: surface_format,
                    write_mask: ColorWrites::ALL,
                    blend: Some(BlendState::ALPHA_BLENDING),
                })],
            }),
            primitive: PrimitiveState::default(),
            depth_stencil: None,
            multisample: Default::default(),
            multiview: None,
        });

        let sampler = gpu.device.create_sampler(&SamplerDescriptor {
            mag_filter: FilterMode::Linear,
            min_filter: FilterMode::Linear,
            ..Default::default()
        });
        let video = Layer::new(&gpu, &layout, &sampler, "video");
        let overlay = Layer::new(&gpu, &layout, &sampler, "overlay");

        let mut this = Self {
            gpu,
            surface,
            surface_format,
            pipeline,
            layout,
            sampler,
            video,
            overlay,
            window,
        };
        this.configure_surface();
        Ok(this)
    }

    pub fn window(&self) -> &Window {
        &self.window
    }

    pub fn update_layer(&mut self, kind: LayerKind, res: Resolution, data: &[u8]) {
        if res.is_empty() {
            return;
        }
        let layer = match kind {
            LayerKind::Video => &mut self.video,
            LayerKind::Overlay => &mut self.overlay,
        };
        layer.update(&self.gpu, &self.layout, &self.sampler, res, data);
    }

    /// Reconfigures the swapchain after the window was resized.
    pub fn resized(&mut self) {
        self.configure_surface();
    }

    pub fn redraw(&mut self) {
        let frame = match self.surface.get_current_texture() {
            Ok(frame) => frame,
            Err(err @ (SurfaceError::Outdated | SurfaceError::Lost)) => {
                log::debug!("surface error: {err}");
                self.configure_surface();
                match self.surface.get_current_texture() {
                    Ok(frame) => frame,
                    Err(e) => {
                        log::error!("failed to acquire frame after reconfiguring surface: {e}");
                        return;
                    }
                }
            }
            Err(e) => {
                log::error!("failed to acquire frame: {e}");
                return;
            }
        };
        let view = frame.texture.create_view(&TextureViewDescriptor::default());
        let mut encoder = self
            .gpu
            .device
            .create_command_encoder(&CommandEncoderDescriptor { label: None });
        {
            let mut rpass = encoder.begin_render_pass(&RenderPassDescriptor {
                label: None,
                color_attachments: &[Some(RenderPassColorAttachment {
                    view: &view,
                    resolve_target: None,
                    ops: Operations {
                        load: LoadOp::Clear(BACKGROUND),
                        store: true,
                    },
                })],
                depth_stencil_attachment: None,
            });

            rpass.set_pipeline(&self.pipeline);
            for layer in [&self.video, &self.overlay] {
                rpass.set_bind_group(0, &layer.bind_group, &[]);
                rpass.draw(0..3, 0..1);
            }
        }

        self.gpu.queue.submit([encoder.finish()]);
        frame.present();
    }

    fn configure_surface(&mut self) {
        let res = self.window.inner_resolution();
        if res.is_empty() {
            // Minimized.
            return;
        }
        log::debug!(
            "configuring target surface at {} (format: {:?})",
            res,
            self.surface_format,
        );
        let config = SurfaceConfiguration {
            usage: TextureUsages::RENDER_ATTACHMENT,
            format: self.surface_format,
            width: res.width(),
            height: res.height(),
            present_mode: PresentMode::Fifo,
            alpha_mode: CompositeAlphaMode::Auto,
            view_formats: Vec::new(),
        };
        self.surface.configure(&self.gpu.device, &config);
    }
}
