//! Configuration and geometry
//!
//! `ConvolutionConfig` is what the host hands to `init`; `ConvLayout` is the
//! derived geometry (padded block, FFT lengths, partition counts, fade
//! length) every algorithm and the IR store share.

use ef_core::{EfError, EfResult, next_pow2};
use serde::{Deserialize, Serialize};

/// Filter slot versions per channel: current, previous (cross-fade), update.
pub const N_VERSIONS: usize = 3;

/// Convolution algorithm selection at `init`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConvolutionMethod {
    /// Direct FIR; for short responses (up to a few hundred taps)
    TimeDomain,
    /// Single-partition FFT convolution
    OverlapAdd,
    /// Uniform partitioned FFT convolution
    UniformPartitioned,
    /// Non-uniform partitioned: super-partition tail on an M-block cadence
    NonUniformPartitioned,
    /// Uniform partitioned driven as separate head and tail passes
    UniformHeadTail,
}

/// Host-facing engine configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConvolutionConfig {
    pub method: ConvolutionMethod,
    /// Maximum IR length in samples (`L_max`)
    pub ir_length: usize,
    /// Host-facing block length (`B`)
    pub block_size: usize,
    /// Fixed channel count (`C_max`)
    pub channels: usize,
    /// Defer tail work to `process_finalize` (head-tail and non-uniform)
    pub use_process_finalize: bool,
}

impl ConvolutionConfig {
    pub fn new(
        method: ConvolutionMethod,
        ir_length: usize,
        block_size: usize,
        channels: usize,
    ) -> Self {
        Self {
            method,
            ir_length,
            block_size,
            channels,
            use_process_finalize: false,
        }
    }

    pub fn with_process_finalize(mut self) -> Self {
        self.use_process_finalize = true;
        self
    }

    pub fn validate(&self, device: bool) -> EfResult<()> {
        if self.ir_length == 0 || self.block_size == 0 || self.channels == 0 {
            return Err(EfError::InvalidArg(
                "ir_length, block_size, and channels must be positive".into(),
            ));
        }
        if device && !self.block_size.is_power_of_two() {
            return Err(EfError::InvalidArg(format!(
                "block size {} must be a power of two on a device context",
                self.block_size
            )));
        }
        Ok(())
    }
}

/// Per-channel flags accepted by `process`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelFlags {
    /// Feed silence instead of the input block
    pub stop_input: bool,
    /// Zero this channel's state before processing the block
    pub flush: bool,
}

/// Options for `update_response_td`.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateOptions {
    /// Do not return until the submitted IRs are ready to commit
    pub block_until_ready: bool,
}

/// Super-partition multiple for the non-uniform method.
///
/// Searches powers of two below `response_len / (8 * block_len)` for the `M`
/// minimizing `2*M*ln(2*B*M) + 2*L/(B*M)`, falling back to the coarse
/// `L / (32 * B)` guess when the search range is empty.
pub fn best_nu_multiple(response_len: usize, block_len: usize) -> usize {
    let mut multiple = (response_len / (block_len * 32)).max(1);

    let b = block_len as f64;
    let r = response_len as f64;
    let max_m = response_len / (8 * block_len);
    let mut t_min = f64::MAX;
    let mut m = 1usize;
    while m < max_m {
        let t = 2.0 * m as f64 * (2.0 * b * m as f64).ln() + 2.0 * r / (b * m as f64);
        if t < t_min {
            t_min = t;
            multiple = m;
        }
        m *= 2;
    }

    multiple
}

/// Geometry derived from a validated config; shared by the IR store and all
/// algorithm states.
#[derive(Debug, Clone, Copy)]
pub struct ConvLayout {
    pub method: ConvolutionMethod,
    pub channels: usize,
    /// Host-facing block length `B`
    pub block: usize,
    /// Internal block length `B' = next_pow2(B)`
    pub block_padded: usize,
    /// Maximum IR length `L_max`
    pub ir_length: usize,
    /// Time-domain history ring length
    pub td_hist_len: usize,
    /// FFT length of the method's transform
    pub fft_len: usize,
    pub log2_fft: u32,
    /// Half-spectrum bin count `fft_len / 2 + 1`
    pub bins: usize,
    /// Partition count (uniform partitions, or super-partitions for NU)
    pub partitions: usize,
    /// Super-partition multiple `M` (1 unless non-uniform)
    pub nu_multiple: usize,
    /// Super-partition length `S = M * B'`
    pub nu_super: usize,
    /// Cross-fade window in output samples
    pub fade_len: usize,
    pub use_process_finalize: bool,
}

impl ConvLayout {
    pub fn new(config: &ConvolutionConfig) -> Self {
        let block = config.block_size;
        let block_padded = next_pow2(block);
        let ir_length = config.ir_length;

        let (fft_len, partitions, nu_multiple, nu_super, fade_len) = match config.method {
            ConvolutionMethod::TimeDomain => (0, 1, 1, block_padded, block),
            ConvolutionMethod::OverlapAdd => {
                let n = next_pow2(ir_length.max(block));
                (2 * n, 1, 1, n, block)
            }
            ConvolutionMethod::UniformPartitioned | ConvolutionMethod::UniformHeadTail => {
                let partitions = ir_length.div_ceil(block_padded);
                (2 * block_padded, partitions, 1, block_padded, block)
            }
            ConvolutionMethod::NonUniformPartitioned => {
                let m = best_nu_multiple(ir_length, block_padded);
                let s = m * block_padded;
                let partitions = ir_length.div_ceil(s);
                (2 * s, partitions, m, s, m * block)
            }
        };

        Self {
            method: config.method,
            channels: config.channels,
            block,
            block_padded,
            ir_length,
            td_hist_len: next_pow2(ir_length + block),
            fft_len,
            log2_fft: if fft_len > 0 { fft_len.trailing_zeros() } else { 0 },
            bins: if fft_len > 0 { fft_len / 2 + 1 } else { 0 },
            partitions,
            nu_multiple,
            nu_super,
            fade_len,
            use_process_finalize: config.use_process_finalize,
        }
    }

    /// Engine latency in samples reported to the host.
    pub fn latency(&self) -> usize {
        match self.method {
            ConvolutionMethod::TimeDomain => 0,
            _ => self.block,
        }
    }
}
