//! Sample format conversion
//!
//! Float32 is the engine's native format; hosts exchanging 16-bit PCM go
//! through these converters. Conversion applies an optional gain and
//! saturates rather than wrapping.

use crate::{EfError, EfResult, Sample};

const I16_SCALE: Sample = 32767.0;

/// `out[i] = clamp(in[i] * gain)` into 16-bit PCM.
pub fn float_to_i16(input: &[Sample], output: &mut [i16], gain: Sample) -> EfResult<()> {
    if output.len() < input.len() {
        return Err(EfError::InvalidArg(format!(
            "output length {} shorter than input {}",
            output.len(),
            input.len()
        )));
    }
    for (out, &x) in output.iter_mut().zip(input.iter()) {
        let scaled = x * gain * I16_SCALE;
        *out = scaled.clamp(-32768.0, 32767.0) as i16;
    }
    Ok(())
}

/// 16-bit PCM into float, `out[i] = in[i] / 32767 * gain`.
pub fn i16_to_float(input: &[i16], output: &mut [Sample], gain: Sample) -> EfResult<()> {
    if output.len() < input.len() {
        return Err(EfError::InvalidArg(format!(
            "output length {} shorter than input {}",
            output.len(),
            input.len()
        )));
    }
    let scale = gain / I16_SCALE;
    for (out, &x) in output.iter_mut().zip(input.iter()) {
        *out = x as Sample * scale;
    }
    Ok(())
}

/// Interleave channel-striped buffers into one frame-ordered buffer.
pub fn interleave(channels: &[&[Sample]], output: &mut [Sample]) -> EfResult<()> {
    let ch_count = channels.len();
    if ch_count == 0 {
        return Err(EfError::InvalidArg("no channels to interleave".into()));
    }
    let frames = channels[0].len();
    if channels.iter().any(|c| c.len() != frames) {
        return Err(EfError::InvalidArg("channel lengths differ".into()));
    }
    if output.len() < frames * ch_count {
        return Err(EfError::InvalidArg("interleave output too short".into()));
    }
    for (c, channel) in channels.iter().enumerate() {
        for (f, &x) in channel.iter().enumerate() {
            output[f * ch_count + c] = x;
        }
    }
    Ok(())
}

/// Split a frame-ordered buffer into channel-striped buffers.
pub fn deinterleave(input: &[Sample], channels: &mut [&mut [Sample]]) -> EfResult<()> {
    let ch_count = channels.len();
    if ch_count == 0 {
        return Err(EfError::InvalidArg("no channels to deinterleave".into()));
    }
    let frames = input.len() / ch_count;
    for (c, channel) in channels.iter_mut().enumerate() {
        if channel.len() < frames {
            return Err(EfError::InvalidArg("deinterleave output too short".into()));
        }
        for f in 0..frames {
            channel[f] = input[f * ch_count + c];
        }
    }
    Ok(())
}
