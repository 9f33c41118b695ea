//! Sample-buffer façade
//!
//! One view over the two places audio lives: channel-striped host arrays and
//! device buffer handles. Owned containers track whether the engine owns the
//! storage (device handles may be lent by the host, which must not mutate
//! them while a pending upload references them).

use ef_core::{EfError, EfResult, Sample};

use crate::backend::{BufferHandle, ComputeBackend, QueueKind};

/// Owned channel-striped audio storage.
pub enum SampleBuffer {
    Host {
        channels: Vec<Vec<Sample>>,
    },
    Device {
        buffers: Vec<BufferHandle>,
        /// False when the handles were lent by the caller.
        owned: bool,
    },
}

impl SampleBuffer {
    /// Zeroed host buffer of `channels x len`.
    pub fn host(channels: usize, len: usize) -> Self {
        SampleBuffer::Host {
            channels: vec![vec![0.0; len]; channels],
        }
    }

    /// Zeroed device buffer of `channels x len` allocated on `backend`.
    pub fn device(backend: &ComputeBackend, channels: usize, len: usize) -> EfResult<Self> {
        let buffers = (0..channels)
            .map(|_| backend.alloc_buffer(len))
            .collect::<EfResult<Vec<_>>>()?;
        Ok(SampleBuffer::Device {
            buffers,
            owned: true,
        })
    }

    /// Wrap caller-owned device handles without taking ownership.
    pub fn borrowed_device(buffers: Vec<BufferHandle>) -> Self {
        SampleBuffer::Device {
            buffers,
            owned: false,
        }
    }

    pub fn channel_count(&self) -> usize {
        match self {
            SampleBuffer::Host { channels } => channels.len(),
            SampleBuffer::Device { buffers, .. } => buffers.len(),
        }
    }

    pub fn is_device(&self) -> bool {
        matches!(self, SampleBuffer::Device { .. })
    }

    pub fn is_owned(&self) -> bool {
        match self {
            SampleBuffer::Host { .. } => true,
            SampleBuffer::Device { owned, .. } => *owned,
        }
    }

    /// Immutable view for `process` input.
    pub fn as_ref(&self) -> SampleBufferRef<'_> {
        match self {
            SampleBuffer::Host { channels } => SampleBufferRef::HostOwned(channels),
            SampleBuffer::Device { buffers, .. } => SampleBufferRef::Device(buffers),
        }
    }

    /// Copy one channel out to host memory regardless of residency.
    pub fn read_channel(
        &self,
        backend: &ComputeBackend,
        channel: usize,
        dst: &mut [Sample],
    ) -> EfResult<()> {
        match self {
            SampleBuffer::Host { channels } => {
                let src = channels
                    .get(channel)
                    .ok_or_else(|| EfError::InvalidArg(format!("channel {channel} out of range")))?;
                let n = dst.len().min(src.len());
                dst[..n].copy_from_slice(&src[..n]);
                Ok(())
            }
            SampleBuffer::Device { buffers, .. } => {
                let buf = buffers
                    .get(channel)
                    .ok_or_else(|| EfError::InvalidArg(format!("channel {channel} out of range")))?;
                backend.download(QueueKind::Conv, buf, 0, dst)
            }
        }
    }
}

/// Borrowed input view accepted by the per-block entry points.
pub enum SampleBufferRef<'a> {
    Host(&'a [&'a [Sample]]),
    HostOwned(&'a [Vec<Sample>]),
    Device(&'a [BufferHandle]),
}

impl<'a> SampleBufferRef<'a> {
    pub fn channel_count(&self) -> usize {
        match self {
            SampleBufferRef::Host(chs) => chs.len(),
            SampleBufferRef::HostOwned(chs) => chs.len(),
            SampleBufferRef::Device(bufs) => bufs.len(),
        }
    }

    pub fn is_device(&self) -> bool {
        matches!(self, SampleBufferRef::Device(_))
    }

    /// Host slice for `channel`; error on device residency.
    pub fn host_channel(&self, channel: usize) -> EfResult<&[Sample]> {
        match self {
            SampleBufferRef::Host(chs) => chs
                .get(channel)
                .copied()
                .ok_or_else(|| EfError::InvalidArg(format!("channel {channel} out of range"))),
            SampleBufferRef::HostOwned(chs) => chs
                .get(channel)
                .map(|c| c.as_slice())
                .ok_or_else(|| EfError::InvalidArg(format!("channel {channel} out of range"))),
            SampleBufferRef::Device(_) => {
                Err(EfError::InvalidArg("device buffer has no host view".into()))
            }
        }
    }

    /// Device handle for `channel`; error on host residency.
    pub fn device_channel(&self, channel: usize) -> EfResult<&BufferHandle> {
        match self {
            SampleBufferRef::Device(bufs) => bufs
                .get(channel)
                .ok_or_else(|| EfError::InvalidArg(format!("channel {channel} out of range"))),
            _ => Err(EfError::InvalidArg("host buffer has no device handle".into())),
        }
    }
}

/// Borrowed output view accepted by the per-block entry points.
pub enum SampleBufferMut<'a> {
    Host(&'a mut [&'a mut [Sample]]),
    Device(&'a [BufferHandle]),
}

impl<'a> SampleBufferMut<'a> {
    pub fn channel_count(&self) -> usize {
        match self {
            SampleBufferMut::Host(chs) => chs.len(),
            SampleBufferMut::Device(bufs) => bufs.len(),
        }
    }

    pub fn is_device(&self) -> bool {
        matches!(self, SampleBufferMut::Device(_))
    }

    pub fn host_channel_mut(&mut self, channel: usize) -> EfResult<&mut [Sample]> {
        match self {
            SampleBufferMut::Host(chs) => chs
                .get_mut(channel)
                .map(|c| &mut **c)
                .ok_or_else(|| EfError::InvalidArg(format!("channel {channel} out of range"))),
            SampleBufferMut::Device(_) => {
                Err(EfError::InvalidArg("device buffer has no host view".into()))
            }
        }
    }

    pub fn device_channel(&self, channel: usize) -> EfResult<&BufferHandle> {
        match self {
            SampleBufferMut::Device(bufs) => bufs
                .get(channel)
                .ok_or_else(|| EfError::InvalidArg(format!("channel {channel} out of range"))),
            _ => Err(EfError::InvalidArg("host buffer has no device handle".into())),
        }
    }
}
