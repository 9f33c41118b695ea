//! Non-uniform partitioned convolution
//!
//! The IR is split into super-partitions of `S = M * B'` samples
//! (FFT length `2S`). The head super-partition is convolved every block
//! against the partially filled input window of the current M-block round,
//! emitting the block at offset `sub * B'` of the inverse transform. Tail
//! super-partitions are multiply-accumulated on a staggered schedule, a
//! slice per sub-block, into a per-slot tail accumulator; the completed
//! spectrum is snapshotted at the end of each round and consumed as the
//! accumulator base throughout the next round. The first tail partition
//! needs the just-completed input round, so it is scheduled on the final
//! sub-block.
//!
//! Round bookkeeping: `sub = round % M` is the sub-block index,
//! `round / M` selects the ring slot (the original's `currentDataPartition`
//! and `2ndBufCurrentSubBuf` counters).

use ef_core::{EfError, EfResult, Sample};
use ef_dsp::{FftEngine, planar_complex_mul_accum};

use crate::config::{ConvLayout, N_VERSIONS};
use crate::ir_store::{IrSlot, PartitionedSpectrum, TransformedIr};
use crate::pass::ProcessPass;

/// Non-uniform partitioned filter state.
pub struct NuState {
    /// Super-partition input spectra per channel: `partitions * bins`
    ring_re: Vec<Vec<Sample>>,
    ring_im: Vec<Vec<Sample>>,
    /// Blocks processed per channel
    round: Vec<usize>,
    /// Accumulated input of the current round per channel, `S` samples
    sub_input: Vec<Vec<Sample>>,
    /// `[version][channel]`, each `S` long
    overlap: Vec<Vec<Vec<Sample>>>,
    /// Tail spectrum being accumulated this round, `[version][channel]`
    tail_acc_re: Vec<Vec<Vec<Sample>>>,
    tail_acc_im: Vec<Vec<Vec<Sample>>>,
    /// Completed tail spectrum consumed this round, `[version][channel]`
    tail_saved_re: Vec<Vec<Vec<Sample>>>,
    tail_saved_im: Vec<Vec<Vec<Sample>>>,
    // Scratch
    acc_re: Vec<Sample>,
    acc_im: Vec<Sample>,
    time_buf: Vec<Sample>,
}

/// Tail partitions handled at sub-block `sub`: partitions `2..P` spread over
/// the first `M - 1` sub-blocks, partition 1 on the last (its input round
/// completes only there).
fn tail_slice(parts: usize, m: usize, sub: usize) -> std::ops::Range<usize> {
    if parts <= 1 {
        return 1..1;
    }
    if m == 1 {
        return 1..parts;
    }
    if sub == m - 1 {
        return 1..2;
    }
    let hi = parts - 2;
    let start = 2 + hi * sub / (m - 1);
    let end = 2 + hi * (sub + 1) / (m - 1);
    start..end
}

impl NuState {
    pub fn new(layout: &ConvLayout) -> Self {
        let per_slot_spec = vec![vec![vec![0.0; layout.bins]; layout.channels]; N_VERSIONS];
        Self {
            ring_re: vec![vec![0.0; layout.partitions * layout.bins]; layout.channels],
            ring_im: vec![vec![0.0; layout.partitions * layout.bins]; layout.channels],
            round: vec![0; layout.channels],
            sub_input: vec![vec![0.0; layout.nu_super]; layout.channels],
            overlap: vec![vec![vec![0.0; layout.nu_super]; layout.channels]; N_VERSIONS],
            tail_acc_re: per_slot_spec.clone(),
            tail_acc_im: per_slot_spec.clone(),
            tail_saved_re: per_slot_spec.clone(),
            tail_saved_im: per_slot_spec,
            acc_re: vec![0.0; layout.bins],
            acc_im: vec![0.0; layout.bins],
            time_buf: vec![0.0; layout.fft_len],
        }
    }

    fn spectra<'a>(slot: &'a IrSlot) -> EfResult<&'a PartitionedSpectrum> {
        match &slot.transformed {
            TransformedIr::Partitioned(spec) => Ok(spec),
            _ => Err(EfError::WrongState("slot not transformed for non-uniform convolution".into())),
        }
    }

    /// Current sub-block index of `channel` (cross-fades start at 0).
    pub fn sub_block(&self, layout: &ConvLayout, channel: usize) -> usize {
        self.round[channel] % layout.nu_multiple
    }

    /// Block counter of `channel` (for deferred tail bookkeeping).
    pub fn round_of(&self, channel: usize) -> usize {
        self.round[channel]
    }

    /// Zero one channel's shared input ring and round accumulation window.
    pub fn clear_ring(&mut self, channel: usize) {
        self.ring_re[channel].fill(0.0);
        self.ring_im[channel].fill(0.0);
        self.sub_input[channel].fill(0.0);
    }

    /// One pass over a block for `channel` against `version`'s filter.
    ///
    /// When `run_tail` is false the staggered tail accumulation is left to
    /// an explicit `tail_step` call (`process_finalize` deferral).
    pub fn process_block(
        &mut self,
        layout: &ConvLayout,
        slot: &IrSlot,
        version: usize,
        channel: usize,
        input: &[Sample],
        output: &mut [Sample],
        pass: ProcessPass,
        run_tail: bool,
        fft: &mut FftEngine,
    ) -> EfResult<()> {
        let spectra = Self::spectra(slot)?;
        let bins = layout.bins;
        let parts = layout.partitions;
        let s = layout.nu_super;
        let bp = layout.block_padded;
        let m = layout.nu_multiple;

        let round = self.round[channel];
        let sub = round % m;
        let cur = (round / m) % parts;

        if !pass.reuse_input {
            if sub == 0 {
                self.sub_input[channel].fill(0.0);
            }
            let off = sub * bp;
            let n = input.len().min(layout.block);
            self.sub_input[channel][off..off + n].copy_from_slice(&input[..n]);

            // Transform the partially filled round window into the ring slot
            self.time_buf[..s].copy_from_slice(&self.sub_input[channel]);
            self.time_buf[s..].fill(0.0);
            let range = cur * bins..(cur + 1) * bins;
            let (ring_re, ring_im) = (&mut self.ring_re[channel], &mut self.ring_im[channel]);
            fft.forward_r2c_planar(
                layout.log2_fft,
                &mut self.time_buf,
                &mut ring_re[range.clone()],
                &mut ring_im[range],
            )?;
        }

        // Head partition over the completed-tail base
        self.acc_re.copy_from_slice(&self.tail_saved_re[version][channel]);
        self.acc_im.copy_from_slice(&self.tail_saved_im[version][channel]);
        planar_complex_mul_accum(
            &self.ring_re[channel][cur * bins..(cur + 1) * bins],
            &self.ring_im[channel][cur * bins..(cur + 1) * bins],
            spectra.part_re(0),
            spectra.part_im(0),
            &mut self.acc_re,
            &mut self.acc_im,
        );

        fft.inverse_c2r_planar(layout.log2_fft, &self.acc_re, &self.acc_im, &mut self.time_buf)?;

        let scale = 1.0 / layout.fft_len as Sample;
        let off = sub * bp;
        {
            let ovl = &self.overlap[version][channel];
            for i in 0..layout.block {
                output[i] = self.time_buf[off + i] * scale + ovl[off + i];
            }
        }

        if run_tail {
            self.tail_step(layout, slot, version, channel, round)?;
        }

        if pass.advance_time {
            if sub == m - 1 {
                let ovl = &mut self.overlap[version][channel];
                for i in 0..s {
                    ovl[i] = self.time_buf[s + i] * scale;
                }
            }
            self.round[channel] += 1;
        }
        Ok(())
    }

    /// The staggered tail slice for the given block (`round` is the counter
    /// value at the time the block was processed).
    pub fn tail_step(
        &mut self,
        layout: &ConvLayout,
        slot: &IrSlot,
        version: usize,
        channel: usize,
        round: usize,
    ) -> EfResult<()> {
        let spectra = Self::spectra(slot)?;
        let bins = layout.bins;
        let parts = layout.partitions;
        let m = layout.nu_multiple;

        let sub = round % m;
        let cur_next = (round / m + 1) % parts;

        if sub == 0 {
            self.tail_acc_re[version][channel].fill(0.0);
            self.tail_acc_im[version][channel].fill(0.0);
        }

        for p in tail_slice(parts, m, sub) {
            let d = (cur_next + parts - p) % parts;
            planar_complex_mul_accum(
                &self.ring_re[channel][d * bins..(d + 1) * bins],
                &self.ring_im[channel][d * bins..(d + 1) * bins],
                spectra.part_re(p),
                spectra.part_im(p),
                &mut self.tail_acc_re[version][channel],
                &mut self.tail_acc_im[version][channel],
            );
        }

        if sub == m - 1 {
            let acc = &self.tail_acc_re[version][channel];
            self.tail_saved_re[version][channel].copy_from_slice(acc);
            let acc = &self.tail_acc_im[version][channel];
            self.tail_saved_im[version][channel].copy_from_slice(acc);
        }
        Ok(())
    }

    /// Zero one channel's per-slot accumulation in `version` (fresh filter).
    pub fn reset_slot(&mut self, version: usize, channel: usize) {
        self.overlap[version][channel].fill(0.0);
        self.tail_acc_re[version][channel].fill(0.0);
        self.tail_acc_im[version][channel].fill(0.0);
        self.tail_saved_re[version][channel].fill(0.0);
        self.tail_saved_im[version][channel].fill(0.0);
    }

    /// Carry an unchanged channel's accumulation across a flip: the fresh
    /// `current` slot inherits a copy, the old slot keeps its own for the
    /// cross-fade's frozen passes.
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
        copy3(&mut self.tail_acc_re);
        copy3(&mut self.tail_acc_im);
        copy3(&mut self.tail_saved_re);
        copy3(&mut self.tail_saved_im);
    }

    /// Zero one channel's state across every version plus the shared ring.
    pub fn flush(&mut self, channel: usize) {
        self.ring_re[channel].fill(0.0);
        self.ring_im[channel].fill(0.0);
        self.sub_input[channel].fill(0.0);
        for version in 0..N_VERSIONS {
            self.reset_slot(version, channel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConvolutionConfig, ConvolutionMethod};
    use crate::ir_store::IrStore;
    use ef_compute::ComputeBackend;

    fn setup(l: usize, b: usize, c: usize) -> (ConvLayout, IrStore, NuState, FftEngine) {
        let layout = ConvLayout::new(&ConvolutionConfig::new(
            ConvolutionMethod::NonUniformPartitioned,
            l,
            b,
            c,
        ));
        let store = IrStore::new(layout);
        let state = NuState::new(&layout);
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
    fn test_tail_slice_covers_all_partitions() {
        for (parts, m) in [(16, 2), (6, 4), (2, 4), (1, 2), (8, 1), (5, 3)] {
            let mut seen = vec![false; parts];
            for sub in 0..m {
                for p in tail_slice(parts, m, sub) {
                    assert!(!seen[p], "partition {p} scheduled twice (P={parts}, M={m})");
                    seen[p] = true;
                }
            }
            for (p, &s) in seen.iter().enumerate().skip(1) {
                assert!(s, "partition {p} never scheduled (P={parts}, M={m})");
            }
        }
    }

    #[test]
    fn test_first_tail_partition_on_last_sub_block() {
        // Partition 1 needs the completed round, so it must land on M-1
        for (parts, m) in [(16, 2), (6, 4), (8, 8)] {
            for sub in 0..m - 1 {
                assert!(!tail_slice(parts, m, sub).contains(&1));
            }
            assert!(tail_slice(parts, m, m - 1).contains(&1));
        }
    }

    #[test]
    fn test_matches_reference_convolution() {
        // L=128, B=4 gives M=2, S=8, 16 super-partitions
        let (layout, store, mut state, mut fft) = setup(128, 4, 1);
        assert_eq!(layout.nu_multiple, 2);

        let ir: Vec<Sample> = (0..128)
            .map(|i| ((i as Sample) * 0.19).sin() * (1.0 - i as Sample / 160.0))
            .collect();
        load(&store, 0, &ir);
        let slot = store.read(0, 0);

        let input: Vec<Sample> = (0..240).map(|i| ((i as Sample) * 0.41).cos()).collect();
        let mut got = Vec::new();
        let mut out = vec![0.0; 4];
        for blk in input.chunks(4) {
            state
                .process_block(&layout, &slot, 0, 0, blk, &mut out, ProcessPass::regular(), true, &mut fft)
                .unwrap();
            got.extend_from_slice(&out);
        }

        let want = reference(&ir, &input);
        for (i, (g, w)) in got.iter().zip(want.iter()).enumerate() {
            assert!((g - w).abs() < 2e-3, "sample {i}: {g} != {w}");
        }
    }

    #[test]
    fn test_impulse_identity() {
        let (layout, store, mut state, mut fft) = setup(128, 4, 1);
        let mut ir = vec![0.0; 128];
        ir[0] = 1.0;
        load(&store, 0, &ir);
        let slot = store.read(0, 0);

        let input: Vec<Sample> = (1..=32).map(|i| i as Sample).collect();
        let mut got = Vec::new();
        let mut out = vec![0.0; 4];
        for blk in input.chunks(4) {
            state
                .process_block(&layout, &slot, 0, 0, blk, &mut out, ProcessPass::regular(), true, &mut fft)
                .unwrap();
            got.extend_from_slice(&out);
        }
        for (g, w) in got.iter().zip(input.iter()) {
            assert!((g - w).abs() < 1e-3, "{g} != {w}");
        }
    }

    #[test]
    fn test_deferred_tail_matches_inline() {
        let (layout, store, mut inline_state, mut fft) = setup(128, 4, 1);
        let mut deferred_state = NuState::new(&layout);
        let ir: Vec<Sample> = (0..100).map(|i| ((i as Sample) * 0.31).cos() * 0.3).collect();
        load(&store, 0, &ir);
        let slot = store.read(0, 0);

        let input: Vec<Sample> = (0..96).map(|i| ((i as Sample) * 0.23).sin()).collect();
        let mut out_a = vec![0.0; 4];
        let mut out_b = vec![0.0; 4];
        for blk in input.chunks(4) {
            inline_state
                .process_block(&layout, &slot, 0, 0, blk, &mut out_a, ProcessPass::regular(), true, &mut fft)
                .unwrap();

            let round = deferred_state.round[0];
            deferred_state
                .process_block(&layout, &slot, 0, 0, blk, &mut out_b, ProcessPass::regular(), false, &mut fft)
                .unwrap();
            deferred_state.tail_step(&layout, &slot, 0, 0, round).unwrap();

            for (a, b) in out_a.iter().zip(out_b.iter()) {
                assert!((a - b).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_flush_silences() {
        let (layout, store, mut state, mut fft) = setup(128, 4, 1);
        let ir: Vec<Sample> = (0..128).map(|i| if i == 40 { 1.0 } else { 0.0 }).collect();
        load(&store, 0, &ir);
        let slot = store.read(0, 0);

        let mut out = vec![0.0; 4];
        for _ in 0..6 {
            state
                .process_block(&layout, &slot, 0, 0, &[1.0; 4], &mut out, ProcessPass::regular(), true, &mut fft)
                .unwrap();
        }
        state.flush(0);
        for _ in 0..40 {
            state
                .process_block(&layout, &slot, 0, 0, &[0.0; 4], &mut out, ProcessPass::regular(), true, &mut fft)
                .unwrap();
            for &y in &out {
                assert!(y.abs() < 1e-4, "flushed channel leaked {y}");
            }
        }
    }
}
