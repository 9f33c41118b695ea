//! Channel mixer
//!
//! Sums the convolution core's per-channel outputs into one buffer with
//! per-channel gains. Consumes outputs only; it never reaches into the
//! engine's state.

use ef_core::{EfError, EfResult, Sample};

/// Gain-summing mixer over a fixed channel count.
pub struct Mixer {
    gains: Vec<Sample>,
}

impl Mixer {
    pub fn new(channels: usize) -> Self {
        Self {
            gains: vec![1.0; channels],
        }
    }

    pub fn channels(&self) -> usize {
        self.gains.len()
    }

    pub fn set_gain(&mut self, channel: usize, gain: Sample) -> EfResult<()> {
        let slot = self
            .gains
            .get_mut(channel)
            .ok_or_else(|| EfError::InvalidArg(format!("channel {channel} out of range")))?;
        *slot = gain;
        Ok(())
    }

    /// `output = sum_ch gain[ch] * inputs[ch]`.
    pub fn mix(&self, inputs: &[&[Sample]], output: &mut [Sample]) -> EfResult<()> {
        if inputs.len() != self.gains.len() {
            return Err(EfError::InvalidArg(format!(
                "expected {} input channels, got {}",
                self.gains.len(),
                inputs.len()
            )));
        }
        output.fill(0.0);
        for (input, &gain) in inputs.iter().zip(self.gains.iter()) {
            for (out, &x) in output.iter_mut().zip(input.iter()) {
                *out += gain * x;
            }
        }
        Ok(())
    }

    /// Accumulating variant: adds onto whatever `output` already holds.
    pub fn mix_into(&self, inputs: &[&[Sample]], output: &mut [Sample]) -> EfResult<()> {
        if inputs.len() != self.gains.len() {
            return Err(EfError::InvalidArg(format!(
                "expected {} input channels, got {}",
                self.gains.len(),
                inputs.len()
            )));
        }
        for (input, &gain) in inputs.iter().zip(self.gains.iter()) {
            for (out, &x) in output.iter_mut().zip(input.iter()) {
                *out += gain * x;
            }
        }
        Ok(())
    }
}
