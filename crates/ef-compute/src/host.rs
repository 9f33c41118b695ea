//! Host backend: arena-owned buffers and synchronous kernels
//!
//! Buffers live in a slot arena guarded by one mutex; a `HostBufferRef` is
//! an index plus length, so handle clones and slot rotation never copy
//! sample data. Kernel dispatch interprets the same argument conventions the
//! device shaders use, running on the CPU immediately (queues are a no-op
//! here - host work completes in enqueue order by construction).

use ef_core::{EfError, EfResult, Sample};
use parking_lot::Mutex;

use crate::backend::{Kernel, KernelId};
use crate::BufferHandle;

/// Reference into the host arena.
#[derive(Clone)]
pub struct HostBufferRef {
    id: usize,
    len: usize,
}

impl HostBufferRef {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Default)]
struct Arena {
    buffers: Vec<Option<Vec<Sample>>>,
    free: Vec<usize>,
}

/// CPU implementation of the compute surface.
pub struct HostBackend {
    arena: Mutex<Arena>,
}

impl HostBackend {
    pub fn new() -> Self {
        Self {
            arena: Mutex::new(Arena::default()),
        }
    }

    pub(crate) fn alloc(&self, len: usize) -> EfResult<HostBufferRef> {
        let mut arena = self.arena.lock();
        let data = vec![0.0; len];
        let id = match arena.free.pop() {
            Some(id) => {
                arena.buffers[id] = Some(data);
                id
            }
            None => {
                arena.buffers.push(Some(data));
                arena.buffers.len() - 1
            }
        };
        Ok(HostBufferRef { id, len })
    }

    pub(crate) fn free(&self, buf: &HostBufferRef) {
        let mut arena = self.arena.lock();
        if let Some(slot) = arena.buffers.get_mut(buf.id) {
            if slot.take().is_some() {
                arena.free.push(buf.id);
            }
        }
    }

    fn check_range(buf: &HostBufferRef, offset: usize, len: usize) -> EfResult<()> {
        if offset + len > buf.len {
            return Err(EfError::InvalidArg(format!(
                "range {offset}+{len} out of buffer length {}",
                buf.len
            )));
        }
        Ok(())
    }

    pub(crate) fn write(&self, buf: &HostBufferRef, offset: usize, src: &[Sample]) -> EfResult<()> {
        Self::check_range(buf, offset, src.len())?;
        let mut arena = self.arena.lock();
        let data = arena.buffers[buf.id]
            .as_mut()
            .ok_or_else(|| EfError::InvalidArg("buffer already freed".into()))?;
        data[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }

    pub(crate) fn read(&self, buf: &HostBufferRef, offset: usize, dst: &mut [Sample]) -> EfResult<()> {
        Self::check_range(buf, offset, dst.len())?;
        let arena = self.arena.lock();
        let data = arena.buffers[buf.id]
            .as_ref()
            .ok_or_else(|| EfError::InvalidArg("buffer already freed".into()))?;
        dst.copy_from_slice(&data[offset..offset + dst.len()]);
        Ok(())
    }

    pub(crate) fn copy(
        &self,
        src: &HostBufferRef,
        src_offset: usize,
        dst: &HostBufferRef,
        dst_offset: usize,
        len: usize,
    ) -> EfResult<()> {
        Self::check_range(src, src_offset, len)?;
        Self::check_range(dst, dst_offset, len)?;
        let mut arena = self.arena.lock();
        if src.id == dst.id {
            let data = arena.buffers[src.id]
                .as_mut()
                .ok_or_else(|| EfError::InvalidArg("buffer already freed".into()))?;
            data.copy_within(src_offset..src_offset + len, dst_offset);
            return Ok(());
        }
        // Disjoint slots: split the arena to borrow both.
        let (lo, hi) = (src.id.min(dst.id), src.id.max(dst.id));
        let (head, tail) = arena.buffers.split_at_mut(hi);
        let (a, b) = (&mut head[lo], &mut tail[0]);
        let (src_data, dst_data) = if src.id < dst.id { (a, b) } else { (b, a) };
        let src_data = src_data
            .as_ref()
            .ok_or_else(|| EfError::InvalidArg("buffer already freed".into()))?;
        let dst_data = dst_data
            .as_mut()
            .ok_or_else(|| EfError::InvalidArg("buffer already freed".into()))?;
        dst_data[dst_offset..dst_offset + len].copy_from_slice(&src_data[src_offset..src_offset + len]);
        Ok(())
    }

    pub(crate) fn fill(
        &self,
        buf: &HostBufferRef,
        offset: usize,
        len: usize,
        value: Sample,
    ) -> EfResult<()> {
        Self::check_range(buf, offset, len)?;
        let mut arena = self.arena.lock();
        let data = arena.buffers[buf.id]
            .as_mut()
            .ok_or_else(|| EfError::InvalidArg("buffer already freed".into()))?;
        data[offset..offset + len].fill(value);
        Ok(())
    }

    fn snapshot(&self, buf: &HostBufferRef) -> EfResult<Vec<Sample>> {
        let arena = self.arena.lock();
        arena.buffers[buf.id]
            .as_ref()
            .cloned()
            .ok_or_else(|| EfError::InvalidArg("buffer already freed".into()))
    }

    fn host_ref<'a>(buf: &'a BufferHandle) -> EfResult<&'a HostBufferRef> {
        match buf {
            BufferHandle::Host(r) => Ok(r),
            BufferHandle::Device(_) => {
                Err(EfError::InvalidArg("device buffer passed to host backend".into()))
            }
        }
    }

    /// Synchronous kernel dispatch.
    ///
    /// Input operands are copied out of the arena before the write lock on
    /// the destination, matching the device's read-only bindings.
    pub(crate) fn dispatch(&self, kernel: &Kernel, global: usize) -> EfResult<()> {
        match kernel.id() {
            KernelId::Fill => {
                let (dst, _) = kernel.buffer(0)?;
                let offset = kernel.scalar_u32(0)? as usize;
                let len = kernel.scalar_u32(1)? as usize;
                let value = kernel.scalar_f32(2)?;
                self.fill(Self::host_ref(dst)?, offset, len.min(global), value)
            }
            KernelId::ComplexMul | KernelId::ComplexMulAccum => {
                let a = self.snapshot(Self::host_ref(&kernel.buffer(0)?.0)?)?;
                let b = self.snapshot(Self::host_ref(&kernel.buffer(1)?.0)?)?;
                let (dst, _) = kernel.buffer(2)?;
                let dst = Self::host_ref(dst)?;
                let pairs = (kernel.scalar_u32(0)? as usize).min(global);
                let mut out = self.snapshot(dst)?;
                if kernel.id() == KernelId::ComplexMul {
                    ef_dsp::complex_mul(&a[..2 * pairs], &b[..2 * pairs], &mut out[..2 * pairs]);
                } else {
                    ef_dsp::complex_mul_accum(&a[..2 * pairs], &b[..2 * pairs], &mut out[..2 * pairs]);
                }
                self.write(dst, 0, &out)
            }
            KernelId::Crossfade => {
                let old = self.snapshot(Self::host_ref(&kernel.buffer(0)?.0)?)?;
                let new = self.snapshot(Self::host_ref(&kernel.buffer(1)?.0)?)?;
                let (dst, _) = kernel.buffer(2)?;
                let dst = Self::host_ref(dst)?;
                let count = (kernel.scalar_u32(0)? as usize).min(global);
                let fade_len = kernel.scalar_u32(1)? as usize;
                let fade_offset = kernel.scalar_u32(2)? as usize;
                if fade_len == 0 {
                    return Err(EfError::InvalidArg("crossfade length zero".into()));
                }
                let mut out = vec![0.0; count];
                crossfade_host(&old, &new, &mut out, fade_len, fade_offset);
                self.write(dst, 0, &out)
            }
            KernelId::TimeDomainConv => {
                let ir = self.snapshot(Self::host_ref(&kernel.buffer(0)?.0)?)?;
                let history = self.snapshot(Self::host_ref(&kernel.buffer(1)?.0)?)?;
                let (dst, _) = kernel.buffer(2)?;
                let dst = Self::host_ref(dst)?;
                let first_nz = kernel.scalar_u32(0)? as usize;
                let last_nz = kernel.scalar_u32(1)? as usize;
                let hist_len = kernel.scalar_u32(2)? as usize;
                let pos = kernel.scalar_u32(3)? as usize;
                let n_out = (kernel.scalar_u32(4)? as usize).min(global);
                let mut out = vec![0.0; n_out];
                time_domain_host(&ir, &history, &mut out, first_nz, last_nz, hist_len, pos);
                self.write(dst, 0, &out)
            }
        }
    }
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// `out[i] = w * new + (1 - w) * old`, `w = (fade_offset + i + 1) / fade_len`.
pub fn crossfade_host(
    old: &[Sample],
    new: &[Sample],
    out: &mut [Sample],
    fade_len: usize,
    fade_offset: usize,
) {
    let n = out.len().min(old.len()).min(new.len());
    let inv = 1.0 / fade_len as Sample;
    for i in 0..n {
        let w = ((fade_offset + i + 1) as Sample * inv).min(1.0);
        out[i] = w * new[i] + (1.0 - w) * old[i];
    }
}

/// Time-domain FIR over a circular history, skipping known-zero taps:
/// `y[j] = sum(k in first_nz..last_nz) hist[(pos + j - k) mod N] * ir[k]`.
pub fn time_domain_host(
    ir: &[Sample],
    history: &[Sample],
    out: &mut [Sample],
    first_nz: usize,
    last_nz: usize,
    hist_len: usize,
    pos: usize,
) {
    debug_assert!(hist_len.is_power_of_two());
    let mask = hist_len - 1;
    let last = last_nz.min(ir.len());
    for (j, y) in out.iter_mut().enumerate() {
        let mut sum = 0.0;
        for (k, &h) in ir.iter().enumerate().take(last).skip(first_nz) {
            let idx = (pos + j).wrapping_sub(k) & mask;
            sum += history[idx] * h;
        }
        *y = sum;
    }
}
