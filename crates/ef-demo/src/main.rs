//! room-demo: virtual-room convolution from the command line
//!
//! Generates a shoebox room response, streams a dry test signal through the
//! convolution engine block by block, and writes the stereo result as a
//! 16-bit WAV. Halfway through the stream the source position jumps and
//! the new response is hot-swapped to make the cross-fade audible.

use anyhow::{Context, Result};
use clap::Parser;
use ef_compute::{EngineContext, SampleBufferMut, SampleBufferRef};
use ef_conv::{Convolution, ConvolutionConfig, ConvolutionMethod, UpdateOptions};
use ef_core::convert::float_to_i16;
use ef_room::{Room, RoomGenerator, Vec3};
use log::info;
use rand::prelude::*;

#[derive(Parser)]
#[command(name = "room-demo", about = "Render a dry signal through a virtual room")]
struct Args {
    /// Output WAV path
    #[arg(short, long, default_value = "room-demo.wav")]
    out: String,

    /// Room dimensions in meters, comma separated
    #[arg(long, default_value = "7.0,3.0,5.0", value_parser = parse_vec3)]
    room: Vec3,

    /// Wall absorption coefficient (0..1)
    #[arg(long, default_value_t = 0.25)]
    absorption: f32,

    /// Sample rate in Hz
    #[arg(long, default_value_t = 48000)]
    sample_rate: u32,

    /// Response length in samples
    #[arg(long, default_value_t = 16384)]
    ir_length: usize,

    /// Processing block size
    #[arg(long, default_value_t = 256)]
    block: usize,

    /// Rendered length in seconds
    #[arg(long, default_value_t = 4.0)]
    seconds: f32,
}

fn parse_vec3(s: &str) -> Result<Vec3, String> {
    let parts: Vec<f32> = s
        .split(',')
        .map(|p| p.trim().parse::<f32>().map_err(|e| e.to_string()))
        .collect::<Result<_, _>>()?;
    if parts.len() != 3 {
        return Err("expected three comma-separated numbers".into());
    }
    Ok(Vec3::new(parts[0], parts[1], parts[2]))
}

/// Dry test signal: a sparse click train with a touch of noise.
fn dry_signal(samples: usize, sample_rate: u32) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(7);
    let mut signal = vec![0.0f32; samples];
    let click_period = sample_rate as usize / 2;
    for click in signal.iter_mut().step_by(click_period) {
        *click = 0.9;
    }
    for s in signal.iter_mut() {
        *s += (rng.random::<f32>() * 2.0 - 1.0) * 0.002;
    }
    signal
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let room = Room::new(args.room, [args.absorption; 6]);
    let generator = RoomGenerator::new(args.sample_rate as f32).with_max_order(6);
    let listener = Vec3::new(args.room.x * 0.5, 1.6, args.room.z * 0.4);
    let half_head = Vec3::new(0.09, 0.0, 0.0);

    let near = Vec3::new(args.room.x * 0.3, 1.2, args.room.z * 0.7);
    let far = Vec3::new(args.room.x * 0.8, 1.2, args.room.z * 0.85);

    let (near_l, near_r) = generator
        .generate_stereo(&room, near, listener, half_head, args.ir_length)
        .context("generating near response")?;
    let (far_l, far_r) = generator
        .generate_stereo(&room, far, listener, half_head, args.ir_length)
        .context("generating far response")?;

    let mut conv = Convolution::new(EngineContext::host());
    conv.init(ConvolutionConfig::new(
        ConvolutionMethod::UniformPartitioned,
        args.ir_length,
        args.block,
        2,
    ))?;
    conv.update_response_td(
        &[Some(&near_l), Some(&near_r)],
        UpdateOptions {
            block_until_ready: true,
        },
    )?;

    let total = (args.seconds * args.sample_rate as f32) as usize;
    let dry = dry_signal(total, args.sample_rate);
    info!(
        "rendering {} samples at {} Hz, block {}",
        total, args.sample_rate, args.block
    );

    let spec = hound::WavSpec {
        channels: 2,
        sample_rate: args.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(&args.out, spec)
        .with_context(|| format!("creating {}", args.out))?;

    let mut moved = false;
    let mut block_in = vec![0.0f32; args.block];
    let mut pcm = vec![vec![0i16; args.block]; 2];

    for (n, chunk) in dry.chunks(args.block).enumerate() {
        if !moved && n * args.block >= total / 2 {
            // Jump the source; the engine cross-fades to the new room
            conv.update_response_td(
                &[Some(&far_l), Some(&far_r)],
                UpdateOptions {
                    block_until_ready: true,
                },
            )?;
            info!("source moved at block {n}");
            moved = true;
        }

        block_in[..chunk.len()].copy_from_slice(chunk);
        block_in[chunk.len()..].fill(0.0);

        let mut out = vec![vec![0.0f32; args.block]; 2];
        {
            let inputs: Vec<&[f32]> = vec![&block_in, &block_in];
            let mut out_refs: Vec<&mut [f32]> =
                out.iter_mut().map(|o| o.as_mut_slice()).collect();
            conv.process(
                &SampleBufferRef::Host(&inputs),
                &mut SampleBufferMut::Host(&mut out_refs),
                &[],
            )?;
        }

        for (out_ch, pcm_ch) in out.iter().zip(pcm.iter_mut()) {
            float_to_i16(out_ch, pcm_ch, 0.5)?;
        }
        for frame in 0..args.block {
            writer.write_sample(pcm[0][frame])?;
            writer.write_sample(pcm[1][frame])?;
        }
    }

    writer.finalize().context("finalizing WAV")?;
    conv.terminate()?;
    info!("wrote {}", args.out);
    Ok(())
}
