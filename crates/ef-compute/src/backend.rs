//! Backend surface: buffers, queues, kernels, context
//!
//! `ComputeBackend` is a tagged dispatch over the host and device
//! implementations. Buffer sizes and offsets are in f32 elements - the
//! engine is float32 throughout.

use std::sync::Arc;

use ef_core::{CpuCapabilities, EfError, EfResult, Sample};

use crate::device::{DeviceBackend, DeviceBufferRef};
use crate::host::{HostBackend, HostBufferRef};

// ============ Queues ============

/// Logical queue roles per context.
///
/// IR uploads and one-time setup go to `General`; per-block convolution work
/// goes to `Conv`. Enqueue order on a single queue defines dependency order;
/// cross-queue synchronization is `finish_queue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    General,
    Conv,
}

// ============ Buffers ============

/// Opaque buffer handle; host arena index or device buffer reference.
#[derive(Clone)]
pub enum BufferHandle {
    Host(HostBufferRef),
    Device(DeviceBufferRef),
}

impl BufferHandle {
    /// Length in f32 elements.
    pub fn len(&self) -> usize {
        match self {
            BufferHandle::Host(h) => h.len(),
            BufferHandle::Device(d) => d.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_device(&self) -> bool {
        matches!(self, BufferHandle::Device(_))
    }
}

impl std::fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BufferHandle::Host(h) => write!(f, "BufferHandle::Host(id={}, len={})", h.id(), h.len()),
            BufferHandle::Device(d) => write!(f, "BufferHandle::Device(len={})", d.len()),
        }
    }
}

// ============ Kernels ============

/// Kernel identifiers available on both backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelId {
    /// Time-domain FIR: one thread per output sample
    TimeDomainConv,
    /// Interleaved complex multiply
    ComplexMul,
    /// Interleaved complex multiply-accumulate
    ComplexMulAccum,
    /// Linear cross-fade between two signals
    Crossfade,
    /// Fill a buffer range with a constant
    Fill,
}

/// Declared access of a kernel buffer argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryAccess {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

/// Scalar kernel argument.
#[derive(Debug, Clone, Copy)]
pub enum ScalarArg {
    U32(u32),
    F32(f32),
}

/// A kernel invocation under construction: buffer and scalar arguments are
/// bound by index, then the call is enqueued with a 1-D global size.
pub struct Kernel {
    id: KernelId,
    buffers: Vec<Option<(BufferHandle, MemoryAccess)>>,
    scalars: Vec<Option<ScalarArg>>,
}

impl Kernel {
    pub(crate) fn new(id: KernelId) -> Self {
        Self {
            id,
            buffers: Vec::new(),
            scalars: Vec::new(),
        }
    }

    pub fn id(&self) -> KernelId {
        self.id
    }

    /// Bind a buffer argument at `index`.
    pub fn set_arg_buffer(
        &mut self,
        index: usize,
        buf: &BufferHandle,
        access: MemoryAccess,
    ) -> &mut Self {
        if self.buffers.len() <= index {
            self.buffers.resize_with(index + 1, || None);
        }
        self.buffers[index] = Some((buf.clone(), access));
        self
    }

    /// Bind a scalar argument at `index`.
    pub fn set_arg_scalar(&mut self, index: usize, value: ScalarArg) -> &mut Self {
        if self.scalars.len() <= index {
            self.scalars.resize_with(index + 1, || None);
        }
        self.scalars[index] = Some(value);
        self
    }

    pub(crate) fn buffer(&self, index: usize) -> EfResult<&(BufferHandle, MemoryAccess)> {
        self.buffers
            .get(index)
            .and_then(|b| b.as_ref())
            .ok_or_else(|| EfError::InvalidArg(format!("kernel {:?}: buffer arg {index} unbound", self.id)))
    }

    pub(crate) fn scalar_u32(&self, index: usize) -> EfResult<u32> {
        match self.scalars.get(index).and_then(|s| *s) {
            Some(ScalarArg::U32(v)) => Ok(v),
            Some(ScalarArg::F32(_)) => Err(EfError::InvalidArg(format!(
                "kernel {:?}: scalar arg {index} has wrong type",
                self.id
            ))),
            None => Err(EfError::InvalidArg(format!(
                "kernel {:?}: scalar arg {index} unbound",
                self.id
            ))),
        }
    }

    pub(crate) fn scalar_f32(&self, index: usize) -> EfResult<f32> {
        match self.scalars.get(index).and_then(|s| *s) {
            Some(ScalarArg::F32(v)) => Ok(v),
            Some(ScalarArg::U32(_)) => Err(EfError::InvalidArg(format!(
                "kernel {:?}: scalar arg {index} has wrong type",
                self.id
            ))),
            None => Err(EfError::InvalidArg(format!(
                "kernel {:?}: scalar arg {index} unbound",
                self.id
            ))),
        }
    }
}

// ============ Backend ============

/// Uniform abstraction over the host and device implementations.
pub enum ComputeBackend {
    Host(HostBackend),
    Device(DeviceBackend),
}

impl ComputeBackend {
    /// CPU-only backend.
    pub fn host() -> Self {
        ComputeBackend::Host(HostBackend::new())
    }

    /// GPU backend; `None` when no adapter is available.
    pub fn device() -> Option<Self> {
        DeviceBackend::new_blocking().map(ComputeBackend::Device)
    }

    pub fn is_device(&self) -> bool {
        matches!(self, ComputeBackend::Device(_))
    }

    /// Allocate a zeroed buffer of `len` f32 elements.
    pub fn alloc_buffer(&self, len: usize) -> EfResult<BufferHandle> {
        if len == 0 {
            return Err(EfError::InvalidArg("zero-length buffer".into()));
        }
        match self {
            ComputeBackend::Host(h) => h.alloc(len).map(BufferHandle::Host),
            ComputeBackend::Device(d) => d.alloc(len).map(BufferHandle::Device),
        }
    }

    /// Release a buffer. Device buffers are also released on drop; the host
    /// arena frees its slot eagerly here.
    pub fn free_buffer(&self, buf: &BufferHandle) {
        match (self, buf) {
            (ComputeBackend::Host(h), BufferHandle::Host(r)) => h.free(r),
            (ComputeBackend::Device(_), BufferHandle::Device(_)) => {}
            _ => {}
        }
    }

    /// Copy host data into a buffer at `offset` elements.
    ///
    /// `blocking` forces completion before return on the device path; host
    /// copies are always synchronous.
    pub fn upload(
        &self,
        queue: QueueKind,
        src: &[Sample],
        dst: &BufferHandle,
        offset: usize,
        blocking: bool,
    ) -> EfResult<()> {
        match (self, dst) {
            (ComputeBackend::Host(h), BufferHandle::Host(r)) => h.write(r, offset, src),
            (ComputeBackend::Device(d), BufferHandle::Device(r)) => {
                d.upload(queue, src, r, offset, blocking)
            }
            _ => Err(EfError::InvalidArg("buffer does not belong to backend".into())),
        }
    }

    /// Copy a buffer range back into host memory. Completes before return.
    pub fn download(
        &self,
        queue: QueueKind,
        src: &BufferHandle,
        offset: usize,
        dst: &mut [Sample],
    ) -> EfResult<()> {
        match (self, src) {
            (ComputeBackend::Host(h), BufferHandle::Host(r)) => h.read(r, offset, dst),
            (ComputeBackend::Device(d), BufferHandle::Device(r)) => {
                d.download(queue, r, offset, dst)
            }
            _ => Err(EfError::InvalidArg("buffer does not belong to backend".into())),
        }
    }

    /// Buffer-to-buffer copy, in elements.
    pub fn copy_buffer(
        &self,
        queue: QueueKind,
        src: &BufferHandle,
        src_offset: usize,
        dst: &BufferHandle,
        dst_offset: usize,
        len: usize,
    ) -> EfResult<()> {
        match (self, src, dst) {
            (ComputeBackend::Host(h), BufferHandle::Host(s), BufferHandle::Host(d)) => {
                h.copy(s, src_offset, d, dst_offset, len)
            }
            (ComputeBackend::Device(dev), BufferHandle::Device(s), BufferHandle::Device(d)) => {
                dev.copy(queue, s, src_offset, d, dst_offset, len)
            }
            _ => Err(EfError::InvalidArg("buffer does not belong to backend".into())),
        }
    }

    /// Fill `len` elements starting at `offset` with `value`.
    pub fn fill_buffer(
        &self,
        queue: QueueKind,
        dst: &BufferHandle,
        offset: usize,
        len: usize,
        value: Sample,
    ) -> EfResult<()> {
        match (self, dst) {
            (ComputeBackend::Host(h), BufferHandle::Host(r)) => h.fill(r, offset, len, value),
            (ComputeBackend::Device(d), BufferHandle::Device(_)) => {
                let mut kernel = Kernel::new(KernelId::Fill);
                kernel
                    .set_arg_buffer(0, dst, MemoryAccess::WriteOnly)
                    .set_arg_scalar(0, ScalarArg::U32(offset as u32))
                    .set_arg_scalar(1, ScalarArg::U32(len as u32))
                    .set_arg_scalar(2, ScalarArg::F32(value));
                d.enqueue(queue, &kernel, len)
            }
            _ => Err(EfError::InvalidArg("buffer does not belong to backend".into())),
        }
    }

    /// Create a kernel invocation for `id`.
    pub fn kernel(&self, id: KernelId) -> Kernel {
        Kernel::new(id)
    }

    /// Launch a kernel with a 1-D global size. On the host this runs
    /// synchronously; on the device it is staged onto `queue`.
    pub fn enqueue(&self, queue: QueueKind, kernel: &Kernel, global: usize) -> EfResult<()> {
        match self {
            ComputeBackend::Host(h) => h.dispatch(kernel, global),
            ComputeBackend::Device(d) => d.enqueue(queue, kernel, global),
        }
    }

    /// Block until all work staged on `queue` has completed.
    pub fn finish_queue(&self, queue: QueueKind) -> EfResult<()> {
        match self {
            ComputeBackend::Host(_) => Ok(()),
            ComputeBackend::Device(d) => d.finish(queue),
        }
    }

    /// Submit staged work on `queue` without waiting.
    pub fn flush_queue(&self, queue: QueueKind) -> EfResult<()> {
        match self {
            ComputeBackend::Host(_) => Ok(()),
            ComputeBackend::Device(d) => d.flush(queue),
        }
    }
}

// ============ Context ============

/// Value-holder carrying the backend and capability flags.
///
/// Components take an `Arc<EngineContext>`; the context holds no
/// back-references and outlives them by construction.
pub struct EngineContext {
    backend: ComputeBackend,
    caps: CpuCapabilities,
}

impl EngineContext {
    pub fn new(backend: ComputeBackend) -> Arc<Self> {
        Arc::new(Self {
            backend,
            caps: CpuCapabilities::detect(),
        })
    }

    /// Host-only context, the common CPU configuration.
    pub fn host() -> Arc<Self> {
        Self::new(ComputeBackend::host())
    }

    /// Context with explicit capability flags (tests force the scalar paths).
    pub fn with_caps(backend: ComputeBackend, caps: CpuCapabilities) -> Arc<Self> {
        Arc::new(Self { backend, caps })
    }

    pub fn backend(&self) -> &ComputeBackend {
        &self.backend
    }

    pub fn caps(&self) -> CpuCapabilities {
        self.caps
    }

    pub fn is_device(&self) -> bool {
        self.backend.is_device()
    }
}
