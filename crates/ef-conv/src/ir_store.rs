//! IR store
//!
//! Triple-buffered filter storage per (version, channel): the raw staging
//! copy plus the method-specific transformed form. The worker writes only
//! the `update` version; the audio thread reads `current` and `previous`.
//! One mutex guards the rotating index triple and is held only during the
//! rotation, never during compute; per-slot RwLocks realize the
//! reader-writer discipline on the filter data itself.

use ef_core::{EfError, EfResult, Sample};
use ef_compute::{BufferHandle, ComputeBackend, QueueKind};
use ef_dsp::FftEngine;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};

use crate::config::{ConvLayout, ConvolutionMethod, N_VERSIONS};

// ============ Slot indices ============

/// Rotating permutation of `[0, 1, 2]`: which version is live, which is kept
/// for the cross-fade, and which the next update lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotIndices {
    pub current: usize,
    pub previous: usize,
    pub update: usize,
}

impl SlotIndices {
    pub fn initial() -> Self {
        Self {
            current: 1,
            previous: 0,
            update: 2,
        }
    }

    /// Commit an update: `previous <- current <- update <- old previous`.
    pub fn rotate(&mut self) {
        let freed = self.previous;
        self.previous = self.current;
        self.current = self.update;
        self.update = freed;
    }
}

// ============ Transformed forms ============

/// Planar partition spectra: `partitions x bins` for re and im.
#[derive(Clone)]
pub struct PartitionedSpectrum {
    pub re: Vec<Sample>,
    pub im: Vec<Sample>,
    pub partitions: usize,
    pub bins: usize,
}

impl PartitionedSpectrum {
    pub fn zeroed(partitions: usize, bins: usize) -> Self {
        Self {
            re: vec![0.0; partitions * bins],
            im: vec![0.0; partitions * bins],
            partitions,
            bins,
        }
    }

    #[inline]
    pub fn part_re(&self, p: usize) -> &[Sample] {
        &self.re[p * self.bins..(p + 1) * self.bins]
    }

    #[inline]
    pub fn part_im(&self, p: usize) -> &[Sample] {
        &self.im[p * self.bins..(p + 1) * self.bins]
    }

    fn part_mut(&mut self, p: usize) -> (&mut [Sample], &mut [Sample]) {
        let range = p * self.bins..(p + 1) * self.bins;
        (&mut self.re[range.clone()], &mut self.im[range])
    }
}

/// Method-specific transformed IR.
#[derive(Clone)]
pub enum TransformedIr {
    /// Time-domain: the padded raw samples live in `staging`; only the
    /// nonzero tap bounds are derived
    Raw { first_nz: usize, last_nz: usize },
    /// Overlap-add: interleaved RI half-spectrum, `2 * bins` floats
    Spectrum { bins_ri: Vec<Sample> },
    /// Uniform/head-tail and non-uniform: planar partition spectra
    Partitioned(PartitionedSpectrum),
}

/// One (version, channel) slot.
pub struct IrSlot {
    /// Raw time-domain IR, padded to `L_max`
    pub staging: Vec<Sample>,
    /// Submitted length (`<= L_max`)
    pub len: usize,
    pub transformed: TransformedIr,
    /// Device copy of the raw IR (time-domain method on a device context)
    pub device_ir: Option<BufferHandle>,
}

impl IrSlot {
    fn zeroed(layout: &ConvLayout) -> Self {
        let transformed = match layout.method {
            ConvolutionMethod::TimeDomain => TransformedIr::Raw {
                first_nz: 0,
                last_nz: 0,
            },
            ConvolutionMethod::OverlapAdd => TransformedIr::Spectrum {
                bins_ri: vec![0.0; 2 * layout.bins],
            },
            ConvolutionMethod::UniformPartitioned
            | ConvolutionMethod::UniformHeadTail
            | ConvolutionMethod::NonUniformPartitioned => TransformedIr::Partitioned(
                PartitionedSpectrum::zeroed(layout.partitions, layout.bins),
            ),
        };
        Self {
            staging: vec![0.0; layout.ir_length],
            len: 0,
            transformed,
            device_ir: None,
        }
    }
}

// ============ Store ============

/// Triple-buffered per-channel filter storage.
pub struct IrStore {
    layout: ConvLayout,
    /// `[version][channel]`
    slots: Vec<Vec<RwLock<IrSlot>>>,
    indices: Mutex<SlotIndices>,
}

impl IrStore {
    pub fn new(layout: ConvLayout) -> Self {
        let slots = (0..N_VERSIONS)
            .map(|_| {
                (0..layout.channels)
                    .map(|_| RwLock::new(IrSlot::zeroed(&layout)))
                    .collect()
            })
            .collect();
        Self {
            layout,
            slots,
            indices: Mutex::new(SlotIndices::initial()),
        }
    }

    pub fn layout(&self) -> &ConvLayout {
        &self.layout
    }

    pub fn indices(&self) -> SlotIndices {
        *self.indices.lock()
    }

    /// Rotate the index triple; returns the post-rotation indices.
    pub fn rotate(&self) -> SlotIndices {
        let mut indices = self.indices.lock();
        indices.rotate();
        *indices
    }

    fn check_slot(&self, version: usize, channel: usize) -> EfResult<()> {
        if version >= N_VERSIONS || channel >= self.layout.channels {
            return Err(EfError::InvalidArg(format!(
                "slot ({version}, {channel}) out of range ({N_VERSIONS}, {})",
                self.layout.channels
            )));
        }
        Ok(())
    }

    /// Read access for processing.
    pub fn read(&self, version: usize, channel: usize) -> RwLockReadGuard<'_, IrSlot> {
        self.slots[version][channel].read()
    }

    /// Copy raw IR samples into a slot's staging buffer, zero-padding to
    /// `L_max`.
    pub fn write_staging(&self, version: usize, channel: usize, ir: &[Sample]) -> EfResult<()> {
        self.check_slot(version, channel)?;
        if ir.len() > self.layout.ir_length {
            return Err(EfError::InvalidArg(format!(
                "IR length {} exceeds configured maximum {}",
                ir.len(),
                self.layout.ir_length
            )));
        }
        let mut slot = self.slots[version][channel].write();
        slot.staging[..ir.len()].copy_from_slice(ir);
        slot.staging[ir.len()..].fill(0.0);
        slot.len = ir.len();
        Ok(())
    }

    /// Transform a slot's staging buffer into the method's processing form.
    ///
    /// A failed transform leaves the slot's previous transformed data in
    /// place and propagates the error (the update is dropped upstream).
    pub fn transform(
        &self,
        backend: &ComputeBackend,
        version: usize,
        channel: usize,
        fft: &mut FftEngine,
    ) -> EfResult<()> {
        self.check_slot(version, channel)?;
        let layout = self.layout;
        let mut slot = self.slots[version][channel].write();

        match layout.method {
            ConvolutionMethod::TimeDomain => {
                let first_nz = slot
                    .staging
                    .iter()
                    .position(|&x| x != 0.0)
                    .unwrap_or(0);
                let last_nz = slot
                    .staging
                    .iter()
                    .rposition(|&x| x != 0.0)
                    .map_or(0, |i| i + 1);
                slot.transformed = TransformedIr::Raw { first_nz, last_nz };

                if backend.is_device() {
                    let ir = match &slot.device_ir {
                        Some(buf) => buf.clone(),
                        None => {
                            let buf = backend.alloc_buffer(layout.ir_length)?;
                            slot.device_ir = Some(buf.clone());
                            buf
                        }
                    };
                    backend.upload(QueueKind::General, &slot.staging, &ir, 0, false)?;
                }
                Ok(())
            }
            ConvolutionMethod::OverlapAdd => {
                let mut padded = vec![0.0; layout.fft_len];
                padded[..layout.ir_length].copy_from_slice(&slot.staging);
                let mut spectrum = vec![num_complex::Complex::new(0.0, 0.0); layout.bins];
                fft.forward_r2c(layout.log2_fft, &mut padded, &mut spectrum)?;

                let mut bins_ri = vec![0.0; 2 * layout.bins];
                for (i, c) in spectrum.iter().enumerate() {
                    bins_ri[2 * i] = c.re;
                    bins_ri[2 * i + 1] = c.im;
                }
                slot.transformed = TransformedIr::Spectrum { bins_ri };
                Ok(())
            }
            ConvolutionMethod::UniformPartitioned
            | ConvolutionMethod::UniformHeadTail
            | ConvolutionMethod::NonUniformPartitioned => {
                let part_len = layout.nu_super;
                let mut spectra = PartitionedSpectrum::zeroed(layout.partitions, layout.bins);
                let mut padded = vec![0.0; layout.fft_len];

                for p in 0..layout.partitions {
                    let start = p * part_len;
                    let end = (start + part_len).min(layout.ir_length);
                    padded.fill(0.0);
                    if start < end {
                        padded[..end - start].copy_from_slice(&slot.staging[start..end]);
                    }
                    let (re, im) = spectra.part_mut(p);
                    fft.forward_r2c_planar(layout.log2_fft, &mut padded, re, im)?;
                }
                slot.transformed = TransformedIr::Partitioned(spectra);
                Ok(())
            }
        }
    }

    /// Duplicate a complete slot snapshot from one version to another, so
    /// a partial channel update still commits a complete per-channel set.
    pub fn copy_slot(
        &self,
        backend: &ComputeBackend,
        from_version: usize,
        to_version: usize,
        channel: usize,
    ) -> EfResult<()> {
        self.check_slot(from_version, channel)?;
        self.check_slot(to_version, channel)?;
        if from_version == to_version {
            return Ok(());
        }
        let src = self.slots[from_version][channel].read();
        let mut dst = self.slots[to_version][channel].write();
        dst.staging.copy_from_slice(&src.staging);
        dst.len = src.len;
        dst.transformed = src.transformed.clone();

        if let Some(src_ir) = &src.device_ir {
            let dst_ir = match &dst.device_ir {
                Some(buf) => buf.clone(),
                None => {
                    let buf = backend.alloc_buffer(self.layout.ir_length)?;
                    dst.device_ir = Some(buf.clone());
                    buf
                }
            };
            backend.copy_buffer(
                QueueKind::General,
                src_ir,
                0,
                &dst_ir,
                0,
                self.layout.ir_length,
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConvolutionConfig;

    fn store(method: ConvolutionMethod, l: usize, b: usize, c: usize) -> IrStore {
        let layout = ConvLayout::new(&ConvolutionConfig::new(method, l, b, c));
        IrStore::new(layout)
    }

    #[test]
    fn test_indices_rotation_is_permutation() {
        let mut idx = SlotIndices::initial();
        for _ in 0..7 {
            idx.rotate();
            let mut seen = [false; N_VERSIONS];
            seen[idx.current] = true;
            seen[idx.previous] = true;
            seen[idx.update] = true;
            assert!(seen.iter().all(|&s| s));
        }
    }

    #[test]
    fn test_rotation_moves_update_to_current() {
        let mut idx = SlotIndices::initial();
        let update = idx.update;
        let current = idx.current;
        idx.rotate();
        assert_eq!(idx.current, update);
        assert_eq!(idx.previous, current);
    }

    #[test]
    fn test_staging_padded_and_bounded() {
        let store = store(ConvolutionMethod::TimeDomain, 16, 4, 1);
        store.write_staging(0, 0, &[0.0, 2.0, 3.0]).unwrap();
        {
            let slot = store.read(0, 0);
            assert_eq!(slot.len, 3);
            assert_eq!(slot.staging[1], 2.0);
            assert_eq!(slot.staging[3], 0.0);
        }
        assert!(store.write_staging(0, 0, &[0.0; 17]).is_err());
        assert!(store.write_staging(3, 0, &[0.0]).is_err());
    }

    #[test]
    fn test_td_transform_bounds() {
        let backend = ComputeBackend::host();
        let store = store(ConvolutionMethod::TimeDomain, 16, 4, 1);
        let mut fft = FftEngine::new();

        store.write_staging(0, 0, &[0.0, 0.0, 5.0, 0.0, 1.0]).unwrap();
        store.transform(&backend, 0, 0, &mut fft).unwrap();

        let slot = store.read(0, 0);
        match slot.transformed {
            TransformedIr::Raw { first_nz, last_nz } => {
                assert_eq!(first_nz, 2);
                assert_eq!(last_nz, 5);
            }
            _ => panic!("expected raw transform"),
        }
    }

    #[test]
    fn test_partitioned_transform_shape() {
        let backend = ComputeBackend::host();
        let store = store(ConvolutionMethod::UniformPartitioned, 100, 16, 1);
        let mut fft = FftEngine::new();

        store.write_staging(0, 0, &[1.0; 100]).unwrap();
        store.transform(&backend, 0, 0, &mut fft).unwrap();

        let slot = store.read(0, 0);
        match &slot.transformed {
            TransformedIr::Partitioned(spec) => {
                assert_eq!(spec.partitions, 7); // ceil(100 / 16)
                assert_eq!(spec.bins, 17);
                // Partition 0 of an all-ones IR has DC = 16
                assert!((spec.part_re(0)[0] - 16.0).abs() < 1e-4);
            }
            _ => panic!("expected partitioned transform"),
        }
    }

    #[test]
    fn test_copy_slot_snapshot() {
        let backend = ComputeBackend::host();
        let store = store(ConvolutionMethod::OverlapAdd, 8, 4, 2);
        let mut fft = FftEngine::new();

        store.write_staging(1, 0, &[1.0, -1.0]).unwrap();
        store.transform(&backend, 1, 0, &mut fft).unwrap();
        store.copy_slot(&backend, 1, 2, 0).unwrap();

        let src = store.read(1, 0);
        let dst = store.read(2, 0);
        assert_eq!(dst.len, 2);
        assert_eq!(dst.staging, src.staging);
    }
}
