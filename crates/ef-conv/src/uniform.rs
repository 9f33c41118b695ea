//! Uniform partitioned convolution, with head-tail driving
//!
//! The IR is split into `P` partitions of the padded block length, each
//! pre-transformed to a planar half-spectrum. Per block: transform the new
//! input into the frequency-domain delay line, multiply-accumulate all
//! partitions against the ring, inverse-transform, overlap-add.
//!
//! The head-tail mode splits the same work into two passes: the head pass
//! (partition 0 plus the previously accumulated tail spectrum) produces the
//! audible block; the tail pass accumulates partitions 1.. for the *next*
//! block, so a caller can interleave it with other work or defer it to
//! `process_finalize`.
//!
//! The input ring is shared across filter versions; overlaps and tail
//! accumulators are per (version, channel).

use ef_core::{EfError, EfResult, Sample};
use ef_dsp::{FftEngine, planar_complex_mul_accum};

use crate::config::{ConvLayout, ConvolutionMethod, N_VERSIONS};
use crate::ir_store::{IrSlot, TransformedIr};
use crate::pass::{PassStage, ProcessPass};

/// Uniform-partitioned filter state.
pub struct UpState {
    /// Frequency-domain delay line per channel: `partitions * bins`
    ring_re: Vec<Vec<Sample>>,
    ring_im: Vec<Vec<Sample>>,
    /// Blocks processed per channel; ring slot = `round % partitions`
    round: Vec<usize>,
    /// `[version][channel]`, each `block_padded` long
    overlap: Vec<Vec<Vec<Sample>>>,
    /// Tail spectrum accumulators `[version][channel]` (head-tail mode)
    tail_re: Vec<Vec<Vec<Sample>>>,
    tail_im: Vec<Vec<Vec<Sample>>>,
    head_tail: bool,
    // Scratch
    acc_re: Vec<Sample>,
    acc_im: Vec<Sample>,
    time_buf: Vec<Sample>,
}

impl UpState {
    pub fn new(layout: &ConvLayout) -> Self {
        let head_tail = layout.method == ConvolutionMethod::UniformHeadTail;
        let tail = if head_tail {
            vec![vec![vec![0.0; layout.bins]; layout.channels]; N_VERSIONS]
        } else {
            Vec::new()
        };
        Self {
            ring_re: vec![vec![0.0; layout.partitions * layout.bins]; layout.channels],
            ring_im: vec![vec![0.0; layout.partitions * layout.bins]; layout.channels],
            round: vec![0; layout.channels],
            overlap: vec![vec![vec![0.0; layout.block_padded]; layout.channels]; N_VERSIONS],
            tail_re: tail.clone(),
            tail_im: tail,
            head_tail,
            acc_re: vec![0.0; layout.bins],
            acc_im: vec![0.0; layout.bins],
            time_buf: vec![0.0; layout.fft_len],
        }
    }

    fn spectra<'a>(slot: &'a IrSlot) -> EfResult<&'a crate::ir_store::PartitionedSpectrum> {
        match &slot.transformed {
            TransformedIr::Partitioned(spec) => Ok(spec),
            _ => Err(EfError::WrongState("slot not transformed for partitioned convolution".into())),
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
        let spectra = Self::spectra(slot)?;
        let bins = layout.bins;
        let parts = layout.partitions;

        if pass.stage == PassStage::TailOnly {
            // Accumulate partitions 1.. for the next block (ring slot is
            // post-advance here).
            let cur = self.round[channel] % parts;
            self.tail_re[version][channel].fill(0.0);
            self.tail_im[version][channel].fill(0.0);
            for p in 1..parts {
                let d = (cur + parts - p) % parts;
                planar_complex_mul_accum(
                    &self.ring_re[channel][d * bins..(d + 1) * bins],
                    &self.ring_im[channel][d * bins..(d + 1) * bins],
                    spectra.part_re(p),
                    spectra.part_im(p),
                    &mut self.tail_re[version][channel],
                    &mut self.tail_im[version][channel],
                );
            }
            return Ok(());
        }

        let cur = self.round[channel] % parts;

        if !pass.reuse_input {
            // Zero-padded block into the ring slot
            self.time_buf.fill(0.0);
            let n = input.len().min(layout.block);
            self.time_buf[..n].copy_from_slice(&input[..n]);
            let range = cur * bins..(cur + 1) * bins;
            let (ring_re, ring_im) = (&mut self.ring_re[channel], &mut self.ring_im[channel]);
            fft.forward_r2c_planar(
                layout.log2_fft,
                &mut self.time_buf,
                &mut ring_re[range.clone()],
                &mut ring_im[range],
            )?;
        }

        match pass.stage {
            PassStage::HeadOnly => {
                self.acc_re.copy_from_slice(&self.tail_re[version][channel]);
                self.acc_im.copy_from_slice(&self.tail_im[version][channel]);
                planar_complex_mul_accum(
                    &self.ring_re[channel][cur * bins..(cur + 1) * bins],
                    &self.ring_im[channel][cur * bins..(cur + 1) * bins],
                    spectra.part_re(0),
                    spectra.part_im(0),
                    &mut self.acc_re,
                    &mut self.acc_im,
                );
            }
            PassStage::Full => {
                self.acc_re.fill(0.0);
                self.acc_im.fill(0.0);
                for p in 0..parts {
                    let d = (cur + parts - p) % parts;
                    planar_complex_mul_accum(
                        &self.ring_re[channel][d * bins..(d + 1) * bins],
                        &self.ring_im[channel][d * bins..(d + 1) * bins],
                        spectra.part_re(p),
                        spectra.part_im(p),
                        &mut self.acc_re,
                        &mut self.acc_im,
                    );
                }
            }
            PassStage::TailOnly => unreachable!("handled above"),
        }

        fft.inverse_c2r_planar(layout.log2_fft, &self.acc_re, &self.acc_im, &mut self.time_buf)?;

        let scale = 1.0 / layout.fft_len as Sample;
        let bp = layout.block_padded;
        let ovl = &mut self.overlap[version][channel];
        for i in 0..layout.block {
            output[i] = self.time_buf[i] * scale + ovl[i];
        }

        if pass.advance_time {
            for i in 0..bp {
                ovl[i] = self.time_buf[i + bp] * scale;
            }
            self.round[channel] += 1;
        }
        Ok(())
    }

    /// Zero one channel's per-slot accumulation in `version` (fresh filter).
    pub fn reset_slot(&mut self, version: usize, channel: usize) {
        self.overlap[version][channel].fill(0.0);
        if self.head_tail {
            self.tail_re[version][channel].fill(0.0);
            self.tail_im[version][channel].fill(0.0);
        }
    }

    /// Carry an unchanged channel's accumulation across a flip: the fresh
    /// `current` slot inherits a copy, the old slot keeps its own for the
    /// cross-fade's frozen pass.
    pub fn copy_slots(&mut self, from: usize, to: usize, channel: usize) {
        if from == to {
            return;
        }
        let copy3 = |store: &mut Vec<Vec<Vec<Sample>>>| {
            let (lo, hi) = (from.min(to), from.max(to));
            let (head, tail) = store.split_at_mut(hi);
            let (a, b) = (&mut head[lo][channel], &mut tail[0][channel]);
            let (src, dst) = if from < to { (a, b) } else { (b, a) };
            dst.copy_from_slice(src);
        };
        copy3(&mut self.overlap);
        if self.head_tail {
            copy3(&mut self.tail_re);
            copy3(&mut self.tail_im);
        }
    }

    /// Zero one channel's shared frequency-domain delay line.
    pub fn clear_ring(&mut self, channel: usize) {
        self.ring_re[channel].fill(0.0);
        self.ring_im[channel].fill(0.0);
    }

    /// Zero one channel's state across every version plus the shared ring.
    pub fn flush(&mut self, channel: usize) {
        self.ring_re[channel].fill(0.0);
        self.ring_im[channel].fill(0.0);
        for version in 0..N_VERSIONS {
            self.overlap[version][channel].fill(0.0);
            if self.head_tail {
                self.tail_re[version][channel].fill(0.0);
                self.tail_im[version][channel].fill(0.0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConvolutionConfig, ConvolutionMethod};
    use crate::ir_store::IrStore;
    use ef_compute::ComputeBackend;

    fn setup(
        method: ConvolutionMethod,
        l: usize,
        b: usize,
        c: usize,
    ) -> (ConvLayout, IrStore, UpState, FftEngine) {
        let layout = ConvLayout::new(&ConvolutionConfig::new(method, l, b, c));
        let store = IrStore::new(layout);
        let state = UpState::new(&layout);
        (layout, store, state, FftEngine::new())
    }

    fn load(store: &IrStore, channel: usize, ir: &[Sample]) {
        let backend = ComputeBackend::host();
        let mut fft = FftEngine::new();
        store.write_staging(0, channel, ir).unwrap();
        store.transform(&backend, 0, channel, &mut fft).unwrap();
    }

    fn reference(ir: &[Sample], input: &[Sample]) -> Vec<Sample> {
        let mut out = vec![0.0; input.len()];
        for (i, y) in out.iter_mut().enumerate() {
            for (k, &h) in ir.iter().enumerate() {
                if i >= k {
                    *y += h * input[i - k];
                }
            }
        }
        out
    }

    #[test]
    fn test_multi_partition_matches_reference() {
        let (layout, store, mut state, mut fft) =
            setup(ConvolutionMethod::UniformPartitioned, 64, 8, 1);
        let ir: Vec<Sample> = (0..64).map(|i| ((i as Sample) * 0.37).sin() * 0.5).collect();
        load(&store, 0, &ir);
        let slot = store.read(0, 0);

        let input: Vec<Sample> = (0..96).map(|i| ((i as Sample) * 0.61).cos()).collect();
        let mut got = Vec::new();
        let mut out = vec![0.0; 8];
        for blk in input.chunks(8) {
            state
                .process_block(&layout, &slot, 0, 0, blk, &mut out, ProcessPass::regular(), &mut fft)
                .unwrap();
            got.extend_from_slice(&out);
        }

        let want = reference(&ir, &input);
        for (i, (g, w)) in got.iter().zip(want.iter()).enumerate() {
            assert!((g - w).abs() < 1e-3, "sample {i}: {g} != {w}");
        }
    }

    #[test]
    fn test_channel_independence() {
        // S3 shape: identity on channel 0, one-sample delay on channel 1
        let (layout, store, mut state, mut fft) =
            setup(ConvolutionMethod::UniformPartitioned, 64, 8, 2);
        let mut h0 = vec![0.0; 64];
        h0[0] = 1.0;
        let mut h1 = vec![0.0; 64];
        h1[1] = 1.0;
        load(&store, 0, &h0);
        load(&store, 1, &h1);

        let input: Vec<Sample> = (0..16).map(|i| (i % 8 + 1) as Sample).collect();
        let mut out0 = Vec::new();
        let mut out1 = Vec::new();
        let mut out = vec![0.0; 8];
        for blk in input.chunks(8) {
            let slot0 = store.read(0, 0);
            state
                .process_block(&layout, &slot0, 0, 0, blk, &mut out, ProcessPass::regular(), &mut fft)
                .unwrap();
            out0.extend_from_slice(&out);
            drop(slot0);

            let slot1 = store.read(0, 1);
            state
                .process_block(&layout, &slot1, 0, 1, blk, &mut out, ProcessPass::regular(), &mut fft)
                .unwrap();
            out1.extend_from_slice(&out);
        }

        for (i, (&g, &x)) in out0.iter().zip(input.iter()).enumerate() {
            assert!((g - x).abs() < 1e-3, "ch0 sample {i}");
        }
        assert!(out1[0].abs() < 1e-3);
        for i in 1..16 {
            assert!((out1[i] - input[i - 1]).abs() < 1e-3, "ch1 sample {i}");
        }
    }

    #[test]
    fn test_head_tail_matches_full() {
        let l = 48;
        let b = 8;
        let ir: Vec<Sample> = (0..l).map(|i| ((i as Sample) * 0.23).cos() * 0.4).collect();
        let input: Vec<Sample> = (0..80).map(|i| ((i as Sample) * 0.17).sin()).collect();

        // Full passes
        let (layout, store, mut full_state, mut fft) =
            setup(ConvolutionMethod::UniformPartitioned, l, b, 1);
        load(&store, 0, &ir);
        let mut want = Vec::new();
        let mut out = vec![0.0; b];
        {
            let slot = store.read(0, 0);
            for blk in input.chunks(b) {
                full_state
                    .process_block(&layout, &slot, 0, 0, blk, &mut out, ProcessPass::regular(), &mut fft)
                    .unwrap();
                want.extend_from_slice(&out);
            }
        }

        // Head + tail passes
        let (layout_ht, store_ht, mut ht_state, mut fft_ht) =
            setup(ConvolutionMethod::UniformHeadTail, l, b, 1);
        load(&store_ht, 0, &ir);
        let mut got = Vec::new();
        {
            let slot = store_ht.read(0, 0);
            for blk in input.chunks(b) {
                ht_state
                    .process_block(
                        &layout_ht,
                        &slot,
                        0,
                        0,
                        blk,
                        &mut out,
                        ProcessPass::regular().with_stage(PassStage::HeadOnly),
                        &mut fft_ht,
                    )
                    .unwrap();
                got.extend_from_slice(&out);
                ht_state
                    .process_block(
                        &layout_ht,
                        &slot,
                        0,
                        0,
                        &[],
                        &mut [],
                        ProcessPass {
                            reuse_input: true,
                            advance_time: false,
                            stage: PassStage::TailOnly,
                        },
                        &mut fft_ht,
                    )
                    .unwrap();
            }
        }

        for (i, (g, w)) in got.iter().zip(want.iter()).enumerate() {
            assert!((g - w).abs() < 1e-3, "sample {i}: {g} != {w}");
        }
    }

    #[test]
    fn test_flush_clears_ring_and_overlap() {
        let (layout, store, mut state, mut fft) =
            setup(ConvolutionMethod::UniformPartitioned, 32, 8, 1);
        let mut ir = vec![0.0; 32];
        ir[9] = 1.0;
        load(&store, 0, &ir);
        let slot = store.read(0, 0);

        let mut out = vec![0.0; 8];
        state
            .process_block(&layout, &slot, 0, 0, &[1.0; 8], &mut out, ProcessPass::regular(), &mut fft)
            .unwrap();
        state.flush(0);
        for _ in 0..4 {
            state
                .process_block(&layout, &slot, 0, 0, &[0.0; 8], &mut out, ProcessPass::regular(), &mut fft)
                .unwrap();
            for &y in &out {
                assert!(y.abs() < 1e-5, "flushed channel leaked {y}");
            }
        }
    }
}
