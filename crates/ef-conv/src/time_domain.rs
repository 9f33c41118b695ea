//! Time-domain convolution
//!
//! Direct FIR over a circular per-channel sample history, with the inner
//! loop bounded to the nonzero tap range. The history ring is shared across
//! filter versions; only the taps differ per slot, so the cross-fade's two
//! passes read the same history.
//!
//! On a device context the same recurrence runs as a compute kernel, one
//! thread per output sample, against a device-resident history ring.

use ef_core::{EfError, EfResult, Sample, next_pow2};
use ef_compute::{
    BufferHandle, ComputeBackend, KernelId, MemoryAccess, QueueKind, ScalarArg,
};

use crate::config::ConvLayout;
use crate::ir_store::{IrSlot, TransformedIr};
use crate::pass::ProcessPass;

/// Time-domain filter state: shared history rings, one per channel.
pub struct TdState {
    hist: Vec<Vec<Sample>>,
    pos: Vec<usize>,
    hist_len: usize,
    /// Device-resident history rings (device context only)
    device_hist: Vec<Option<BufferHandle>>,
}

impl TdState {
    pub fn new(layout: &ConvLayout) -> Self {
        let hist_len = next_pow2(layout.td_hist_len);
        Self {
            hist: vec![vec![0.0; hist_len]; layout.channels],
            pos: vec![0; layout.channels],
            hist_len,
            device_hist: (0..layout.channels).map(|_| None).collect(),
        }
    }

    /// One CPU pass over a block for `channel`.
    pub fn process_block(
        &mut self,
        layout: &ConvLayout,
        slot: &IrSlot,
        channel: usize,
        input: &[Sample],
        output: &mut [Sample],
        pass: ProcessPass,
    ) -> EfResult<()> {
        let (first_nz, last_nz) = match slot.transformed {
            TransformedIr::Raw { first_nz, last_nz } => (first_nz, last_nz),
            _ => return Err(EfError::WrongState("slot not transformed for time domain".into())),
        };

        let mask = self.hist_len - 1;
        let pos = self.pos[channel];
        let hist = &mut self.hist[channel];

        if !pass.reuse_input {
            for (j, &x) in input.iter().take(layout.block).enumerate() {
                hist[(pos + j) & mask] = x;
            }
        }

        let taps = &slot.staging[..last_nz.min(slot.staging.len())];
        for (j, y) in output.iter_mut().take(layout.block).enumerate() {
            let mut sum = 0.0;
            for (k, &h) in taps.iter().enumerate().skip(first_nz) {
                sum += hist[(pos + j).wrapping_sub(k) & mask] * h;
            }
            *y = sum;
        }

        if pass.advance_time {
            self.pos[channel] = (pos + layout.block) & mask;
        }
        Ok(())
    }

    /// One device pass over a block for `channel`; input and output are
    /// device buffers and the launch is staged on the Conv queue.
    pub fn process_block_device(
        &mut self,
        backend: &ComputeBackend,
        layout: &ConvLayout,
        slot: &IrSlot,
        channel: usize,
        input: &BufferHandle,
        output: &BufferHandle,
        pass: ProcessPass,
    ) -> EfResult<()> {
        let (first_nz, last_nz) = match slot.transformed {
            TransformedIr::Raw { first_nz, last_nz } => (first_nz, last_nz),
            _ => return Err(EfError::WrongState("slot not transformed for time domain".into())),
        };
        let ir = slot
            .device_ir
            .as_ref()
            .ok_or_else(|| EfError::WrongState("IR not uploaded to device".into()))?;

        let hist = match &self.device_hist[channel] {
            Some(buf) => buf.clone(),
            None => {
                let buf = backend.alloc_buffer(self.hist_len)?;
                self.device_hist[channel] = Some(buf.clone());
                buf
            }
        };

        let mask = self.hist_len - 1;
        let pos = self.pos[channel];

        if !pass.reuse_input {
            // Write the block into the ring, split at the wrap point.
            let head = (self.hist_len - pos).min(layout.block);
            backend.copy_buffer(QueueKind::Conv, input, 0, &hist, pos, head)?;
            if head < layout.block {
                backend.copy_buffer(QueueKind::Conv, input, head, &hist, 0, layout.block - head)?;
            }
        }

        let mut kernel = backend.kernel(KernelId::TimeDomainConv);
        kernel
            .set_arg_buffer(0, ir, MemoryAccess::ReadOnly)
            .set_arg_buffer(1, &hist, MemoryAccess::ReadOnly)
            .set_arg_buffer(2, output, MemoryAccess::WriteOnly)
            .set_arg_scalar(0, ScalarArg::U32(first_nz as u32))
            .set_arg_scalar(1, ScalarArg::U32(last_nz as u32))
            .set_arg_scalar(2, ScalarArg::U32(self.hist_len as u32))
            .set_arg_scalar(3, ScalarArg::U32(pos as u32))
            .set_arg_scalar(4, ScalarArg::U32(layout.block as u32));
        backend.enqueue(QueueKind::Conv, &kernel, layout.block)?;

        if pass.advance_time {
            self.pos[channel] = (pos + layout.block) & mask;
        }
        Ok(())
    }

    /// Zero one channel's history.
    pub fn flush(&mut self, backend: &ComputeBackend, channel: usize) -> EfResult<()> {
        self.hist[channel].fill(0.0);
        if let Some(buf) = &self.device_hist[channel] {
            backend.fill_buffer(QueueKind::Conv, buf, 0, self.hist_len, 0.0)?;
        }
        Ok(())
    }
}

/// One-shot direct convolution without IR management: emits
/// `y[i] = sum_k ir[k] * input[i - k]` for `i < input.len()`.
///
/// Host memory only; the managed engine covers the device path.
pub fn process_direct(ir: &[Sample], input: &[Sample], output: &mut [Sample]) -> EfResult<()> {
    if ir.is_empty() {
        return Err(EfError::InvalidArg("empty impulse response".into()));
    }
    let n = input.len().min(output.len());
    for (i, y) in output.iter_mut().take(n).enumerate() {
        let mut sum = 0.0;
        for (k, &h) in ir.iter().take(i + 1).enumerate() {
            sum += input[i - k] * h;
        }
        *y = sum;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConvolutionConfig, ConvolutionMethod};
    use crate::ir_store::IrStore;
    use ef_dsp::FftEngine;

    fn setup(l: usize, b: usize, c: usize) -> (ConvLayout, IrStore, TdState, ComputeBackend) {
        let layout = ConvLayout::new(&ConvolutionConfig::new(
            ConvolutionMethod::TimeDomain,
            l,
            b,
            c,
        ));
        let store = IrStore::new(layout);
        let state = TdState::new(&layout);
        (layout, store, state, ComputeBackend::host())
    }

    #[test]
    fn test_impulse_passthrough() {
        let (layout, store, mut state, backend) = setup(16, 4, 1);
        let mut fft = FftEngine::new();
        let mut ir = vec![0.0; 16];
        ir[0] = 1.0;
        store.write_staging(0, 0, &ir).unwrap();
        store.transform(&backend, 0, 0, &mut fft).unwrap();

        let mut out = vec![0.0; 4];
        let slot = store.read(0, 0);
        state
            .process_block(&layout, &slot, 0, &[1.0, 2.0, 3.0, 4.0], &mut out, ProcessPass::regular())
            .unwrap();
        assert_eq!(out, vec![1.0, 2.0, 3.0, 4.0]);

        state
            .process_block(&layout, &slot, 0, &[5.0, 6.0, 7.0, 8.0], &mut out, ProcessPass::regular())
            .unwrap();
        assert_eq!(out, vec![5.0, 6.0, 7.0, 8.0]);
    }

    #[test]
    fn test_delay_crosses_blocks() {
        let (layout, store, mut state, backend) = setup(8, 4, 1);
        let mut fft = FftEngine::new();
        let mut ir = vec![0.0; 8];
        ir[2] = 1.0; // delay by 2
        store.write_staging(0, 0, &ir).unwrap();
        store.transform(&backend, 0, 0, &mut fft).unwrap();

        let slot = store.read(0, 0);
        let mut out = vec![0.0; 4];
        state
            .process_block(&layout, &slot, 0, &[1.0, 2.0, 3.0, 4.0], &mut out, ProcessPass::regular())
            .unwrap();
        assert_eq!(out, vec![0.0, 0.0, 1.0, 2.0]);
        state
            .process_block(&layout, &slot, 0, &[5.0, 6.0, 7.0, 8.0], &mut out, ProcessPass::regular())
            .unwrap();
        assert_eq!(out, vec![3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_flush_clears_history() {
        let (layout, store, mut state, backend) = setup(8, 4, 1);
        let mut fft = FftEngine::new();
        let mut ir = vec![0.0; 8];
        ir[3] = 1.0;
        store.write_staging(0, 0, &ir).unwrap();
        store.transform(&backend, 0, 0, &mut fft).unwrap();

        let slot = store.read(0, 0);
        let mut out = vec![0.0; 4];
        state
            .process_block(&layout, &slot, 0, &[1.0, 1.0, 1.0, 1.0], &mut out, ProcessPass::regular())
            .unwrap();
        state.flush(&backend, 0).unwrap();
        state
            .process_block(&layout, &slot, 0, &[0.0; 4], &mut out, ProcessPass::regular())
            .unwrap();
        assert_eq!(out, vec![0.0; 4]);
    }

    #[test]
    fn test_process_direct_matches_reference() {
        let ir = vec![0.5, -0.25, 0.125];
        let input = vec![1.0, 0.0, 2.0, -1.0, 0.5];
        let mut out = vec![0.0; 5];
        process_direct(&ir, &input, &mut out).unwrap();

        for (i, &y) in out.iter().enumerate() {
            let mut want = 0.0;
            for (k, &h) in ir.iter().enumerate() {
                if i >= k {
                    want += h * input[i - k];
                }
            }
            assert!((y - want).abs() < 1e-6);
        }
    }

    #[test]
    fn test_reuse_input_skips_history_write() {
        let (layout, store, mut state, backend) = setup(8, 4, 1);
        let mut fft = FftEngine::new();
        let mut ir = vec![0.0; 8];
        ir[0] = 1.0;
        store.write_staging(0, 0, &ir).unwrap();
        store.transform(&backend, 0, 0, &mut fft).unwrap();
        let slot = store.read(0, 0);

        let mut out = vec![0.0; 4];
        // First pass stores the block without advancing time
        state
            .process_block(
                &layout,
                &slot,
                0,
                &[9.0, 8.0, 7.0, 6.0],
                &mut out,
                ProcessPass::crossfade_old(),
            )
            .unwrap();
        assert_eq!(out, vec![9.0, 8.0, 7.0, 6.0]);

        // Second pass must see the same stored input, ignoring its argument
        state
            .process_block(&layout, &slot, 0, &[0.0; 4], &mut out, ProcessPass::crossfade_new())
            .unwrap();
        assert_eq!(out, vec![9.0, 8.0, 7.0, 6.0]);
    }
}
