//! FFT engine
//!
//! Power-of-two transforms over `rustfft` (complex) and `realfft`
//! (real <-> half-spectrum), with planner caches per size, batching over
//! channels, planar layouts, and a Hartley pair derived from the real FFT.
//!
//! Conventions:
//! - forward transforms are unscaled
//! - inverse transforms are unscaled; `ifft(fft(x)) == n * x`, callers apply
//!   the `1/n` at the inverse step of their pipeline
//! - in-place complex transforms are allowed
//!
//! One instance per engine per queue role; the update worker constructs its
//! own engine rather than sharing the audio thread's.

use std::collections::HashMap;
use std::sync::Arc;

use ef_core::{EfError, EfResult, Sample};
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

/// Smallest supported transform: 2^1
pub const MIN_LOG2_FFT: u32 = 1;
/// Largest supported transform: 2^20
pub const MAX_LOG2_FFT: u32 = 20;

/// Cached planner front-end for every transform shape the engine needs.
pub struct FftEngine {
    complex_planner: FftPlanner<Sample>,
    real_planner: RealFftPlanner<Sample>,
    forward_c2c: HashMap<usize, Arc<dyn Fft<Sample>>>,
    inverse_c2c: HashMap<usize, Arc<dyn Fft<Sample>>>,
    forward_r2c: HashMap<usize, Arc<dyn RealToComplex<Sample>>>,
    inverse_c2r: HashMap<usize, Arc<dyn ComplexToReal<Sample>>>,
    /// Complex scratch shared by every path, grown on demand
    scratch: Vec<Complex<Sample>>,
    /// Real scratch for the Hartley and planar paths
    real_scratch: Vec<Complex<Sample>>,
}

impl FftEngine {
    pub fn new() -> Self {
        Self {
            complex_planner: FftPlanner::new(),
            real_planner: RealFftPlanner::new(),
            forward_c2c: HashMap::new(),
            inverse_c2c: HashMap::new(),
            forward_r2c: HashMap::new(),
            inverse_c2r: HashMap::new(),
            scratch: Vec::new(),
            real_scratch: Vec::new(),
        }
    }

    fn check_log2(log2n: u32) -> EfResult<usize> {
        if !(MIN_LOG2_FFT..=MAX_LOG2_FFT).contains(&log2n) {
            return Err(EfError::InvalidArg(format!(
                "FFT log2 size {log2n} outside [{MIN_LOG2_FFT}, {MAX_LOG2_FFT}]"
            )));
        }
        Ok(1usize << log2n)
    }

    fn plan_forward(&mut self, n: usize) -> Arc<dyn Fft<Sample>> {
        self.forward_c2c
            .entry(n)
            .or_insert_with(|| {
                log::debug!("planning {n}-point forward FFT");
                self.complex_planner.plan_fft_forward(n)
            })
            .clone()
    }

    fn plan_inverse(&mut self, n: usize) -> Arc<dyn Fft<Sample>> {
        self.inverse_c2c
            .entry(n)
            .or_insert_with(|| self.complex_planner.plan_fft_inverse(n))
            .clone()
    }

    fn plan_r2c(&mut self, n: usize) -> Arc<dyn RealToComplex<Sample>> {
        self.forward_r2c
            .entry(n)
            .or_insert_with(|| self.real_planner.plan_fft_forward(n))
            .clone()
    }

    fn plan_c2r(&mut self, n: usize) -> Arc<dyn ComplexToReal<Sample>> {
        self.inverse_c2r
            .entry(n)
            .or_insert_with(|| self.real_planner.plan_fft_inverse(n))
            .clone()
    }

    fn grow_scratch(scratch: &mut Vec<Complex<Sample>>, len: usize) {
        if scratch.len() < len {
            scratch.resize(len, Complex::new(0.0, 0.0));
        }
    }

    // ============ Complex <-> Complex ============

    /// In-place forward complex FFT of one channel.
    pub fn forward_c2c(&mut self, log2n: u32, data: &mut [Complex<Sample>]) -> EfResult<()> {
        let n = Self::check_log2(log2n)?;
        if data.len() != n {
            return Err(EfError::InvalidArg(format!(
                "c2c buffer length {} != {}",
                data.len(),
                n
            )));
        }
        let fft = self.plan_forward(n);
        Self::grow_scratch(&mut self.scratch, fft.get_inplace_scratch_len());
        fft.process_with_scratch(data, &mut self.scratch[..fft.get_inplace_scratch_len()]);
        Ok(())
    }

    /// In-place inverse complex FFT of one channel (unscaled).
    pub fn inverse_c2c(&mut self, log2n: u32, data: &mut [Complex<Sample>]) -> EfResult<()> {
        let n = Self::check_log2(log2n)?;
        if data.len() != n {
            return Err(EfError::InvalidArg(format!(
                "c2c buffer length {} != {}",
                data.len(),
                n
            )));
        }
        let fft = self.plan_inverse(n);
        Self::grow_scratch(&mut self.scratch, fft.get_inplace_scratch_len());
        fft.process_with_scratch(data, &mut self.scratch[..fft.get_inplace_scratch_len()]);
        Ok(())
    }

    /// Batched in-place complex FFT over channels.
    pub fn forward_c2c_batch(
        &mut self,
        log2n: u32,
        channels: &mut [&mut [Complex<Sample>]],
    ) -> EfResult<()> {
        for data in channels.iter_mut() {
            self.forward_c2c(log2n, data)?;
        }
        Ok(())
    }

    /// Batched in-place inverse complex FFT over channels.
    pub fn inverse_c2c_batch(
        &mut self,
        log2n: u32,
        channels: &mut [&mut [Complex<Sample>]],
    ) -> EfResult<()> {
        for data in channels.iter_mut() {
            self.inverse_c2c(log2n, data)?;
        }
        Ok(())
    }

    // ============ Real <-> Half-spectrum ============

    /// Forward real FFT: `n` reals in, `n/2 + 1` bins out.
    ///
    /// The input buffer is clobbered (realfft uses it as working storage).
    pub fn forward_r2c(
        &mut self,
        log2n: u32,
        input: &mut [Sample],
        spectrum: &mut [Complex<Sample>],
    ) -> EfResult<()> {
        let n = Self::check_log2(log2n)?;
        if input.len() != n || spectrum.len() != n / 2 + 1 {
            return Err(EfError::InvalidArg(format!(
                "r2c shapes {}/{} != {}/{}",
                input.len(),
                spectrum.len(),
                n,
                n / 2 + 1
            )));
        }
        let fft = self.plan_r2c(n);
        Self::grow_scratch(&mut self.scratch, fft.get_scratch_len());
        fft.process_with_scratch(input, spectrum, &mut self.scratch[..fft.get_scratch_len()])
            .map_err(|e| EfError::ComputeFailure(format!("r2c: {e}")))
    }

    /// Inverse real FFT: `n/2 + 1` bins in, `n` reals out (unscaled).
    ///
    /// The spectrum buffer is clobbered.
    pub fn inverse_c2r(
        &mut self,
        log2n: u32,
        spectrum: &mut [Complex<Sample>],
        output: &mut [Sample],
    ) -> EfResult<()> {
        let n = Self::check_log2(log2n)?;
        if output.len() != n || spectrum.len() != n / 2 + 1 {
            return Err(EfError::InvalidArg(format!(
                "c2r shapes {}/{} != {}/{}",
                spectrum.len(),
                output.len(),
                n / 2 + 1,
                n
            )));
        }
        let fft = self.plan_c2r(n);
        Self::grow_scratch(&mut self.scratch, fft.get_scratch_len());
        fft.process_with_scratch(spectrum, output, &mut self.scratch[..fft.get_scratch_len()])
            .map_err(|e| EfError::ComputeFailure(format!("c2r: {e}")))
    }

    // ============ Planar real <-> complex ============

    /// Forward FFT of real input into planar (separate re/im) spectrum halves.
    ///
    /// `re`/`im` each receive `n/2 + 1` values; the partitioned convolution
    /// paths consume this layout directly with the planar MAC.
    pub fn forward_r2c_planar(
        &mut self,
        log2n: u32,
        input: &mut [Sample],
        re: &mut [Sample],
        im: &mut [Sample],
    ) -> EfResult<()> {
        let n = Self::check_log2(log2n)?;
        let bins = n / 2 + 1;
        if re.len() != bins || im.len() != bins {
            return Err(EfError::InvalidArg(format!(
                "planar spectrum length {}/{} != {bins}",
                re.len(),
                im.len()
            )));
        }
        Self::grow_scratch(&mut self.real_scratch, bins);
        // Split borrow: the interleaved staging lives in real_scratch.
        let mut staging = std::mem::take(&mut self.real_scratch);
        let result = self.forward_r2c(log2n, input, &mut staging[..bins]);
        if result.is_ok() {
            for (i, c) in staging[..bins].iter().enumerate() {
                re[i] = c.re;
                im[i] = c.im;
            }
        }
        self.real_scratch = staging;
        result
    }

    /// Inverse FFT from planar spectrum halves into real output (unscaled).
    pub fn inverse_c2r_planar(
        &mut self,
        log2n: u32,
        re: &[Sample],
        im: &[Sample],
        output: &mut [Sample],
    ) -> EfResult<()> {
        let n = Self::check_log2(log2n)?;
        let bins = n / 2 + 1;
        if re.len() != bins || im.len() != bins {
            return Err(EfError::InvalidArg(format!(
                "planar spectrum length {}/{} != {bins}",
                re.len(),
                im.len()
            )));
        }
        Self::grow_scratch(&mut self.real_scratch, bins);
        let mut staging = std::mem::take(&mut self.real_scratch);
        for i in 0..bins {
            staging[i] = Complex::new(re[i], im[i]);
        }
        // Nyquist and DC bins of a real signal carry no imaginary part.
        staging[0].im = 0.0;
        staging[bins - 1].im = 0.0;
        let result = self.inverse_c2r(log2n, &mut staging[..bins], output);
        self.real_scratch = staging;
        result
    }

    // ============ Hartley ============

    /// Discrete Hartley transform, `H[k] = Re(X[k]) - Im(X[k])`.
    ///
    /// Self-inverse up to the factor `n`: applying it twice returns `n * x`,
    /// matching the complex round-trip convention.
    pub fn hartley(&mut self, log2n: u32, data: &mut [Sample]) -> EfResult<()> {
        let n = Self::check_log2(log2n)?;
        if data.len() != n {
            return Err(EfError::InvalidArg(format!(
                "hartley length {} != {n}",
                data.len()
            )));
        }
        Self::grow_scratch(&mut self.real_scratch, n);
        let mut staging = std::mem::take(&mut self.real_scratch);
        for (s, &x) in staging.iter_mut().zip(data.iter()) {
            *s = Complex::new(x, 0.0);
        }
        let result = self.forward_c2c(log2n, &mut staging[..n]);
        if result.is_ok() {
            for (x, c) in data.iter_mut().zip(staging.iter()) {
                *x = c.re - c.im;
            }
        }
        self.real_scratch = staging;
        result
    }

    /// Inverse Hartley transform (unscaled; identical kernel to the forward).
    pub fn hartley_inverse(&mut self, log2n: u32, data: &mut [Sample]) -> EfResult<()> {
        self.hartley(log2n, data)
    }
}

impl Default for FftEngine {
    fn default() -> Self {
        Self::new()
    }
}
