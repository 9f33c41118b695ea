//! ef-compute: Compute backend abstraction for EchoForge
//!
//! A uniform surface over host memory and GPU device buffers:
//! - `HostBackend` - arena-owned host buffers, synchronous kernels
//! - `DeviceBackend` - wgpu compute pipelines, WGSL kernels, staged queues
//!
//! Algorithm code never branches on the backend kind; it talks to
//! `ComputeBackend` and opaque `BufferHandle`s. Two logical queues per
//! context (General for IR upload/setup, Conv for per-block work); enqueue
//! order on one queue is dependency order, cross-queue sync is
//! `finish_queue`.

mod backend;
mod device;
mod host;
mod sample_buffer;
mod shaders;

pub use backend::{
    BufferHandle, ComputeBackend, EngineContext, Kernel, KernelId, MemoryAccess, QueueKind,
    ScalarArg,
};
pub use device::{DeviceBackend, DeviceBufferRef};
pub use host::{HostBackend, HostBufferRef};
pub use sample_buffer::{SampleBuffer, SampleBufferMut, SampleBufferRef};
