//! Overlap-add convolution
//!
//! Single-partition FFT convolution: zero-pad the block, forward real FFT,
//! point-wise multiply with the pre-transformed IR spectrum, inverse, scale,
//! then fold through the accumulated overlap buffer. The overlap spans the
//! full FFT length and carries every previous block's tail:
//!
//! `ovl[i] = r[i] + (ovl[i + B] if i + B < n else 0)`, output = `ovl[..B]`.
//!
//! The overlap is per (version, channel): the cross-fade's old pass reads
//! its own slot's accumulation without advancing it.

use ef_core::{EfError, EfResult, Sample};
use ef_dsp::{FftEngine, complex_mul};
use num_complex::Complex;

use crate::config::{ConvLayout, N_VERSIONS};
use crate::ir_store::{IrSlot, TransformedIr};
use crate::pass::ProcessPass;

/// Overlap-add filter state.
pub struct OlaState {
    /// `[version][channel]`, each `fft_len` long
    overlap: Vec<Vec<Vec<Sample>>>,
    /// Stored block input per channel for the cross-fade's second pass
    saved_input: Vec<Vec<Sample>>,
    // Scratch
    time_buf: Vec<Sample>,
    spectrum: Vec<Complex<Sample>>,
    spec_ri: Vec<Sample>,
    prod_ri: Vec<Sample>,
}

impl OlaState {
    pub fn new(layout: &ConvLayout) -> Self {
        Self {
            overlap: vec![vec![vec![0.0; layout.fft_len]; layout.channels]; N_VERSIONS],
            saved_input: vec![vec![0.0; layout.block]; layout.channels],
            time_buf: vec![0.0; layout.fft_len],
            spectrum: vec![Complex::new(0.0, 0.0); layout.bins],
            spec_ri: vec![0.0; 2 * layout.bins],
            prod_ri: vec![0.0; 2 * layout.bins],
        }
    }

    /// One pass over a block for `channel` against `version`'s filter.
    pub fn process_block(
        &mut self,
        layout: &ConvLayout,
        slot: &IrSlot,
        version: usize,
        channel: usize,
        input: &[Sample],
        output: &mut [Sample],
        pass: ProcessPass,
        fft: &mut FftEngine,
    ) -> EfResult<()> {
        let filter_ri = match &slot.transformed {
            TransformedIr::Spectrum { bins_ri } => bins_ri,
            _ => return Err(EfError::WrongState("slot not transformed for overlap-add".into())),
        };

        if !pass.reuse_input {
            let n = input.len().min(layout.block);
            self.saved_input[channel][..n].copy_from_slice(&input[..n]);
            self.saved_input[channel][n..].fill(0.0);
        }

        // Zero-padded block -> half spectrum
        self.time_buf.fill(0.0);
        self.time_buf[..layout.block].copy_from_slice(&self.saved_input[channel]);
        fft.forward_r2c(layout.log2_fft, &mut self.time_buf, &mut self.spectrum)?;

        for (i, c) in self.spectrum.iter().enumerate() {
            self.spec_ri[2 * i] = c.re;
            self.spec_ri[2 * i + 1] = c.im;
        }
        complex_mul(&self.spec_ri, filter_ri, &mut self.prod_ri);

        for (i, c) in self.spectrum.iter_mut().enumerate() {
            *c = Complex::new(self.prod_ri[2 * i], self.prod_ri[2 * i + 1]);
        }
        fft.inverse_c2r(layout.log2_fft, &mut self.spectrum, &mut self.time_buf)?;

        let scale = 1.0 / layout.fft_len as Sample;
        let n = layout.fft_len;
        let block = layout.block;
        let ovl = &mut self.overlap[version][channel];

        if pass.advance_time {
            for id in 0..n {
                let carry = if id + block < n { ovl[id + block] } else { 0.0 };
                ovl[id] = self.time_buf[id] * scale + carry;
            }
            output[..block].copy_from_slice(&ovl[..block]);
        } else {
            for i in 0..block {
                output[i] = self.time_buf[i] * scale + ovl[i + block];
            }
        }
        Ok(())
    }

    /// Zero one channel's overlap in `version` (post-flip reset of a fresh
    /// filter slot).
    pub fn reset_slot(&mut self, version: usize, channel: usize) {
        self.overlap[version][channel].fill(0.0);
    }

    /// Carry an unchanged channel's accumulation across a flip: the fresh
    /// `current` slot inherits a copy, the old slot keeps its own for the
    /// cross-fade's frozen pass.
    pub fn copy_slots(&mut self, from: usize, to: usize, channel: usize) {
        if from == to {
            return;
        }
        let (lo, hi) = (from.min(to), from.max(to));
        let (head, tail) = self.overlap.split_at_mut(hi);
        let (a, b) = (&mut head[lo][channel], &mut tail[0][channel]);
        let (src, dst) = if from < to { (a, b) } else { (b, a) };
        dst.copy_from_slice(src);
    }

    /// Zero one channel's stored input (shared across versions).
    pub fn clear_input(&mut self, channel: usize) {
        self.saved_input[channel].fill(0.0);
    }

    /// Zero one channel's state across every version.
    pub fn flush(&mut self, channel: usize) {
        for version in &mut self.overlap {
            version[channel].fill(0.0);
        }
        self.saved_input[channel].fill(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConvolutionConfig, ConvolutionMethod};
    use crate::ir_store::IrStore;
    use ef_compute::ComputeBackend;

    fn setup(l: usize, b: usize) -> (ConvLayout, IrStore, OlaState, FftEngine) {
        let layout = ConvLayout::new(&ConvolutionConfig::new(
            ConvolutionMethod::OverlapAdd,
            l,
            b,
            1,
        ));
        let store = IrStore::new(layout);
        let state = OlaState::new(&layout);
        (layout, store, state, FftEngine::new())
    }

    fn load(store: &IrStore, ir: &[Sample]) {
        let backend = ComputeBackend::host();
        let mut fft = FftEngine::new();
        store.write_staging(0, 0, ir).unwrap();
        store.transform(&backend, 0, 0, &mut fft).unwrap();
    }

    #[test]
    fn test_delay_by_block() {
        // S2 shape: h delays by 4 with B = 4
        let (layout, store, mut state, mut fft) = setup(8, 4);
        load(&store, &[0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0]);
        let slot = store.read(0, 0);

        let mut out = vec![0.0; 4];
        state
            .process_block(&layout, &slot, 0, 0, &[1.0, 2.0, 3.0, 4.0], &mut out, ProcessPass::regular(), &mut fft)
            .unwrap();
        for &y in &out {
            assert!(y.abs() < 1e-4, "block 1 must be silent, got {y}");
        }

        state
            .process_block(&layout, &slot, 0, 0, &[5.0, 6.0, 7.0, 8.0], &mut out, ProcessPass::regular(), &mut fft)
            .unwrap();
        for (y, want) in out.iter().zip([1.0, 2.0, 3.0, 4.0]) {
            assert!((y - want).abs() < 1e-3, "{y} != {want}");
        }
    }

    #[test]
    fn test_matches_direct_convolution() {
        let (layout, store, mut state, mut fft) = setup(8, 4);
        let ir = [0.9, -0.4, 0.2, 0.1, 0.05, 0.0, -0.3, 0.15];
        load(&store, &ir);
        let slot = store.read(0, 0);

        let input: Vec<Sample> = (0..16).map(|i| ((i * 7 % 5) as Sample) - 2.0).collect();
        let mut got = Vec::new();
        let mut out = vec![0.0; 4];
        for blk in input.chunks(4) {
            state
                .process_block(&layout, &slot, 0, 0, blk, &mut out, ProcessPass::regular(), &mut fft)
                .unwrap();
            got.extend_from_slice(&out);
        }

        for (i, &y) in got.iter().enumerate() {
            let mut want = 0.0;
            for (k, &h) in ir.iter().enumerate() {
                if i >= k {
                    want += h * input[i - k];
                }
            }
            assert!((y - want).abs() < 1e-3, "sample {i}: {y} != {want}");
        }
    }

    #[test]
    fn test_frozen_pass_leaves_overlap() {
        let (layout, store, mut state, mut fft) = setup(8, 4);
        let mut ir = vec![0.0; 8];
        ir[0] = 1.0;
        load(&store, &ir);
        let slot = store.read(0, 0);

        let mut out_a = vec![0.0; 4];
        let mut out_b = vec![0.0; 4];
        state
            .process_block(&layout, &slot, 0, 0, &[1.0, 2.0, 3.0, 4.0], &mut out_a, ProcessPass::crossfade_old(), &mut fft)
            .unwrap();
        // Same input via reuse; advancing now must produce the same block
        state
            .process_block(&layout, &slot, 0, 0, &[0.0; 4], &mut out_b, ProcessPass::crossfade_new(), &mut fft)
            .unwrap();
        for (a, b) in out_a.iter().zip(out_b.iter()) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn test_flush_silences_tail() {
        let (layout, store, mut state, mut fft) = setup(8, 4);
        load(&store, &[0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0]);
        let slot = store.read(0, 0);

        let mut out = vec![0.0; 4];
        state
            .process_block(&layout, &slot, 0, 0, &[1.0; 4], &mut out, ProcessPass::regular(), &mut fft)
            .unwrap();
        state.flush(0);
        state
            .process_block(&layout, &slot, 0, 0, &[0.0; 4], &mut out, ProcessPass::regular(), &mut fft)
            .unwrap();
        for &y in &out {
            assert!(y.abs() < 1e-4, "flushed channel must be silent, got {y}");
        }
    }
}
