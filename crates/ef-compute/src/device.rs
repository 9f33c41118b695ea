//! Device backend: wgpu compute
//!
//! Storage buffers hold f32 sample data; each kernel launch binds its
//! buffers plus a 32-byte uniform params block and is recorded into one of
//! two staged logical queues (General, Conv). `flush` submits a queue's
//! staged command buffers in enqueue order; `finish` additionally waits.
//! Host reads go through a MAP_READ staging buffer, `map_async` + poll.

use std::collections::HashMap;
use std::sync::Arc;

use ef_core::{EfError, EfResult, Sample};
use parking_lot::Mutex;
use wgpu::util::DeviceExt;

use crate::backend::{Kernel, KernelId, QueueKind};
use crate::shaders;

/// Reference to a device storage buffer.
#[derive(Clone)]
pub struct DeviceBufferRef {
    buffer: Arc<wgpu::Buffer>,
    len: usize,
}

impl DeviceBufferRef {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Default)]
struct StagedQueues {
    general: Vec<wgpu::CommandBuffer>,
    conv: Vec<wgpu::CommandBuffer>,
}

impl StagedQueues {
    fn lane(&mut self, queue: QueueKind) -> &mut Vec<wgpu::CommandBuffer> {
        match queue {
            QueueKind::General => &mut self.general,
            QueueKind::Conv => &mut self.conv,
        }
    }
}

/// GPU implementation of the compute surface.
pub struct DeviceBackend {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    pipelines: HashMap<KernelId, Arc<Pipeline>>,
    staged: Mutex<StagedQueues>,
}

struct Pipeline {
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
    storage_bindings: usize,
}

impl DeviceBackend {
    /// Create the backend (async adapter/device request).
    pub async fn new() -> Option<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await?;

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("EchoForge Compute"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await
            .ok()?;

        let device = Arc::new(device);
        let queue = Arc::new(queue);

        let mut pipelines = HashMap::new();
        let fill = Arc::new(Self::build_pipeline(&device, "fill", shaders::FILL_SRC, 1));
        let complex = Arc::new(Self::build_pipeline(&device, "complex", shaders::COMPLEX_SRC, 3));
        let crossfade = Arc::new(Self::build_pipeline(
            &device,
            "crossfade",
            shaders::CROSSFADE_SRC,
            3,
        ));
        let tdconv = Arc::new(Self::build_pipeline(&device, "tdconv", shaders::TDCONV_SRC, 3));

        pipelines.insert(KernelId::Fill, fill);
        pipelines.insert(KernelId::ComplexMul, complex.clone());
        pipelines.insert(KernelId::ComplexMulAccum, complex);
        pipelines.insert(KernelId::Crossfade, crossfade);
        pipelines.insert(KernelId::TimeDomainConv, tdconv);

        Some(Self {
            device,
            queue,
            pipelines,
            staged: Mutex::new(StagedQueues::default()),
        })
    }

    /// Blocking constructor for synchronous callers.
    pub fn new_blocking() -> Option<Self> {
        pollster::block_on(Self::new())
    }

    fn build_pipeline(
        device: &wgpu::Device,
        name: &str,
        source: &str,
        storage_bindings: usize,
    ) -> Pipeline {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(name),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });

        let mut entries: Vec<wgpu::BindGroupLayoutEntry> = (0..storage_bindings as u32)
            .map(|binding| wgpu::BindGroupLayoutEntry {
                binding,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage { read_only: false },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            })
            .collect();
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: storage_bindings as u32,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        });

        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(name),
            entries: &entries,
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(name),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(name),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: Some("main"),
            compilation_options: Default::default(),
            cache: None,
        });

        Pipeline {
            pipeline,
            layout,
            storage_bindings,
        }
    }

    pub(crate) fn alloc(&self, len: usize) -> EfResult<DeviceBufferRef> {
        let size = (len * std::mem::size_of::<Sample>()) as u64;
        let limit = self.device.limits().max_buffer_size;
        if size > limit {
            return Err(EfError::OutOfMemory(format!(
                "buffer of {size} bytes exceeds device limit {limit}"
            )));
        }
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: None,
            size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Ok(DeviceBufferRef {
            buffer: Arc::new(buffer),
            len,
        })
    }

    pub(crate) fn upload(
        &self,
        queue: QueueKind,
        src: &[Sample],
        dst: &DeviceBufferRef,
        offset: usize,
        blocking: bool,
    ) -> EfResult<()> {
        if offset + src.len() > dst.len {
            return Err(EfError::InvalidArg(format!(
                "upload range {offset}+{} out of buffer length {}",
                src.len(),
                dst.len
            )));
        }
        // Preserve queue order: anything already staged runs first.
        self.flush(queue)?;
        self.queue.write_buffer(
            &dst.buffer,
            (offset * std::mem::size_of::<Sample>()) as u64,
            bytemuck::cast_slice(src),
        );
        if blocking {
            self.queue.submit(std::iter::empty());
            self.device.poll(wgpu::Maintain::Wait);
        }
        Ok(())
    }

    pub(crate) fn download(
        &self,
        queue: QueueKind,
        src: &DeviceBufferRef,
        offset: usize,
        dst: &mut [Sample],
    ) -> EfResult<()> {
        if offset + dst.len() > src.len {
            return Err(EfError::InvalidArg(format!(
                "download range {offset}+{} out of buffer length {}",
                dst.len(),
                src.len
            )));
        }
        self.flush(queue)?;

        let size = (dst.len() * std::mem::size_of::<Sample>()) as u64;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback"),
            size,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("readback") });
        encoder.copy_buffer_to_buffer(
            &src.buffer,
            (offset * std::mem::size_of::<Sample>()) as u64,
            &staging,
            0,
            size,
        );
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|_| EfError::ComputeFailure("readback channel closed".into()))?
            .map_err(|e| EfError::ComputeFailure(format!("buffer map failed: {e:?}")))?;

        {
            let view = slice.get_mapped_range();
            dst.copy_from_slice(bytemuck::cast_slice(&view[..]));
        }
        staging.unmap();
        Ok(())
    }

    pub(crate) fn copy(
        &self,
        queue: QueueKind,
        src: &DeviceBufferRef,
        src_offset: usize,
        dst: &DeviceBufferRef,
        dst_offset: usize,
        len: usize,
    ) -> EfResult<()> {
        if src_offset + len > src.len || dst_offset + len > dst.len {
            return Err(EfError::InvalidArg("copy range out of bounds".into()));
        }
        let elem = std::mem::size_of::<Sample>();
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("copy") });
        encoder.copy_buffer_to_buffer(
            &src.buffer,
            (src_offset * elem) as u64,
            &dst.buffer,
            (dst_offset * elem) as u64,
            (len * elem) as u64,
        );
        self.staged.lock().lane(queue).push(encoder.finish());
        Ok(())
    }

    /// Record a kernel launch onto a logical queue.
    pub(crate) fn enqueue(&self, queue: QueueKind, kernel: &Kernel, global: usize) -> EfResult<()> {
        let pipeline = self
            .pipelines
            .get(&kernel.id())
            .ok_or_else(|| EfError::NotSupported(format!("kernel {:?}", kernel.id())))?
            .clone();

        let params = self.build_params(kernel)?;
        let params_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("kernel params"),
                contents: bytemuck::bytes_of(&params),
                usage: wgpu::BufferUsages::UNIFORM,
            });

        let mut entries = Vec::with_capacity(pipeline.storage_bindings + 1);
        for binding in 0..pipeline.storage_bindings {
            let (handle, _access) = kernel.buffer(binding)?;
            let buf = match handle {
                crate::BufferHandle::Device(d) => d.buffer.clone(),
                crate::BufferHandle::Host(_) => {
                    return Err(EfError::InvalidArg(
                        "host buffer passed to device kernel".into(),
                    ));
                }
            };
            entries.push((binding as u32, buf));
        }

        let bind_entries: Vec<wgpu::BindGroupEntry> = entries
            .iter()
            .map(|(binding, buf)| wgpu::BindGroupEntry {
                binding: *binding,
                resource: buf.as_entire_binding(),
            })
            .chain(std::iter::once(wgpu::BindGroupEntry {
                binding: pipeline.storage_bindings as u32,
                resource: params_buffer.as_entire_binding(),
            }))
            .collect();

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("kernel"),
            layout: &pipeline.layout,
            entries: &bind_entries,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("kernel") });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("kernel"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&pipeline.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(global.div_ceil(64) as u32, 1, 1);
        }
        self.staged.lock().lane(queue).push(encoder.finish());
        Ok(())
    }

    /// Uniform params block: eight u32 words, per-kernel convention.
    fn build_params(&self, kernel: &Kernel) -> EfResult<[u32; 8]> {
        let mut words = [0u32; 8];
        match kernel.id() {
            KernelId::Fill => {
                words[0] = kernel.scalar_u32(0)?;
                words[1] = kernel.scalar_u32(1)?;
                words[2] = kernel.scalar_f32(2)?.to_bits();
            }
            KernelId::ComplexMul => {
                words[0] = kernel.scalar_u32(0)?;
                words[1] = 0;
            }
            KernelId::ComplexMulAccum => {
                words[0] = kernel.scalar_u32(0)?;
                words[1] = 1;
            }
            KernelId::Crossfade => {
                words[0] = kernel.scalar_u32(0)?;
                words[1] = kernel.scalar_u32(1)?;
                words[2] = kernel.scalar_u32(2)?;
            }
            KernelId::TimeDomainConv => {
                words[0] = kernel.scalar_u32(0)?;
                words[1] = kernel.scalar_u32(1)?;
                words[2] = kernel.scalar_u32(2)?;
                words[3] = kernel.scalar_u32(3)?;
                words[4] = kernel.scalar_u32(4)?;
            }
        }
        Ok(words)
    }

    /// Submit a logical queue's staged work in enqueue order.
    pub(crate) fn flush(&self, queue: QueueKind) -> EfResult<()> {
        let staged: Vec<wgpu::CommandBuffer> =
            std::mem::take(self.staged.lock().lane(queue));
        if !staged.is_empty() {
            self.queue.submit(staged);
        }
        Ok(())
    }

    /// Submit and wait for completion.
    pub(crate) fn finish(&self, queue: QueueKind) -> EfResult<()> {
        self.flush(queue)?;
        self.device.poll(wgpu::Maintain::Wait);
        Ok(())
    }
}
