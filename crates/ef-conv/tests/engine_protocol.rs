//! Engine lifecycle and update-protocol tests
//!
//! Exercises the coordinator rather than the convolution math: state
//! machine errors, commit visibility, deferred finalize, and the direct
//! path.

use std::time::Duration;

use ef_compute::{EngineContext, SampleBufferMut, SampleBufferRef};
use ef_conv::{
    ChannelFlags, Convolution, ConvolutionConfig, ConvolutionMethod, UpdateOptions, process_direct,
};

const BLOCKING: UpdateOptions = UpdateOptions {
    block_until_ready: true,
};

fn run_block(conv: &mut Convolution, inputs: &[&[f32]], flags: &[ChannelFlags]) -> Vec<Vec<f32>> {
    let block = inputs[0].len();
    let mut outputs = vec![vec![0.0f32; block]; inputs.len()];
    {
        let mut out_refs: Vec<&mut [f32]> = outputs.iter_mut().map(|o| o.as_mut_slice()).collect();
        let input = SampleBufferRef::Host(inputs);
        let mut output = SampleBufferMut::Host(&mut out_refs);
        conv.process(&input, &mut output, flags).unwrap();
    }
    outputs
}

#[test]
fn lifecycle_errors() {
    let mut conv = Convolution::new(EngineContext::host());
    assert!(!conv.is_initialized());

    // Before init everything is WrongState
    let input_data = [[0.0f32; 4]];
    let inputs: Vec<&[f32]> = input_data.iter().map(|c| c.as_slice()).collect();
    let mut out_data = [[0.0f32; 4]];
    let mut outs: Vec<&mut [f32]> = out_data.iter_mut().map(|c| c.as_mut_slice()).collect();
    assert!(
        conv.process(
            &SampleBufferRef::Host(&inputs),
            &mut SampleBufferMut::Host(&mut outs),
            &[]
        )
        .is_err()
    );
    assert!(conv.terminate().is_err());
    assert!(conv.process_finalize().is_err());

    // Init, double init, terminate, re-init
    let cfg = ConvolutionConfig::new(ConvolutionMethod::TimeDomain, 8, 4, 1);
    conv.init(cfg).unwrap();
    assert!(matches!(
        conv.init(cfg),
        Err(ef_core::EfError::AlreadyInitialized)
    ));
    conv.terminate().unwrap();
    conv.init(cfg).unwrap();
    conv.terminate().unwrap();
}

#[test]
fn invalid_arguments_rejected() {
    let mut conv = Convolution::new(EngineContext::host());
    let bad = ConvolutionConfig::new(ConvolutionMethod::OverlapAdd, 0, 4, 1);
    assert!(conv.init(bad).is_err());

    conv.init(ConvolutionConfig::new(ConvolutionMethod::OverlapAdd, 16, 4, 2))
        .unwrap();

    // Too-long IR, wrong channel count, empty IR
    let long = vec![0.0f32; 17];
    assert!(conv.update_response_td(&[Some(&long), None], BLOCKING).is_err());
    assert!(conv.update_response_td(&[None], BLOCKING).is_err());
    assert!(conv.update_response_td(&[Some(&[]), None], BLOCKING).is_err());

    // Slot range checks
    assert!(conv.flush(3, 0).is_err());
    assert!(conv.flush(0, 2).is_err());
    assert!(conv.copy_responses(0, 3, &[0]).is_err());
}

#[test]
fn non_blocking_update_becomes_visible() {
    let mut conv = Convolution::new(EngineContext::host());
    conv.init(ConvolutionConfig::new(ConvolutionMethod::TimeDomain, 8, 4, 1))
        .unwrap();

    let mut identity = vec![0.0f32; 8];
    identity[0] = 1.0;
    conv.update_response_td(&[Some(&identity)], BLOCKING).unwrap();
    run_block(&mut conv, &[&[1.0; 4]], &[]);

    // Non-blocking: the commit lands on some subsequent block
    let mut gain2 = vec![0.0f32; 8];
    gain2[0] = 2.0;
    conv.update_response_td(
        &[Some(&gain2)],
        UpdateOptions {
            block_until_ready: false,
        },
    )
    .unwrap();

    let mut committed = false;
    for _ in 0..200 {
        let out = run_block(&mut conv, &[&[1.0; 4]], &[]);
        if (out[0][3] - 2.0).abs() < 1e-4 {
            committed = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(committed, "non-blocking update never became visible");
}

#[test]
fn repeated_updates_converge_to_latest() {
    let mut conv = Convolution::new(EngineContext::host());
    conv.init(ConvolutionConfig::new(ConvolutionMethod::OverlapAdd, 16, 4, 1))
        .unwrap();

    for gain in [0.25f32, 0.5, 0.75, 1.5] {
        let mut h = vec![0.0f32; 16];
        h[0] = gain;
        conv.update_response_td(&[Some(&h)], BLOCKING).unwrap();
        // Fade block plus one settled block
        run_block(&mut conv, &[&[1.0; 4]], &[]);
        let out = run_block(&mut conv, &[&[1.0; 4]], &[]);
        for &y in &out[0] {
            assert!((y - gain).abs() < 1e-3, "gain {gain} not applied, got {y}");
        }
    }
}

#[test]
fn head_tail_finalize_matches_inline() {
    let l = 48;
    let b = 8;
    let ir: Vec<f32> = (0..l).map(|i| ((i as f32) * 0.27).sin() * 0.5).collect();
    let input: Vec<f32> = (0..b * 10).map(|i| ((i as f32) * 0.19).cos()).collect();

    let mut inline = Convolution::new(EngineContext::host());
    inline
        .init(ConvolutionConfig::new(ConvolutionMethod::UniformHeadTail, l, b, 1))
        .unwrap();
    inline.update_response_td(&[Some(&ir)], BLOCKING).unwrap();

    let mut deferred = Convolution::new(EngineContext::host());
    deferred
        .init(ConvolutionConfig::new(ConvolutionMethod::UniformHeadTail, l, b, 1).with_process_finalize())
        .unwrap();
    deferred.update_response_td(&[Some(&ir)], BLOCKING).unwrap();

    for blk in input.chunks(b) {
        let a = run_block(&mut inline, &[blk], &[]);
        let c = run_block(&mut deferred, &[blk], &[]);
        deferred.process_finalize().unwrap();
        for (x, y) in a[0].iter().zip(c[0].iter()) {
            assert!((x - y).abs() < 1e-5, "{x} != {y}");
        }
    }
}

#[test]
fn non_uniform_finalize_matches_inline() {
    let l = 128;
    let b = 4;
    let ir: Vec<f32> = (0..l).map(|i| ((i as f32) * 0.33).cos() * 0.4).collect();
    let input: Vec<f32> = (0..b * 40).map(|i| ((i as f32) * 0.29).sin()).collect();

    let mut inline = Convolution::new(EngineContext::host());
    inline
        .init(ConvolutionConfig::new(
            ConvolutionMethod::NonUniformPartitioned,
            l,
            b,
            1,
        ))
        .unwrap();
    inline.update_response_td(&[Some(&ir)], BLOCKING).unwrap();

    let mut deferred = Convolution::new(EngineContext::host());
    deferred
        .init(
            ConvolutionConfig::new(ConvolutionMethod::NonUniformPartitioned, l, b, 1)
                .with_process_finalize(),
        )
        .unwrap();
    deferred.update_response_td(&[Some(&ir)], BLOCKING).unwrap();

    for blk in input.chunks(b) {
        let a = run_block(&mut inline, &[blk], &[]);
        let c = run_block(&mut deferred, &[blk], &[]);
        deferred.process_finalize().unwrap();
        for (x, y) in a[0].iter().zip(c[0].iter()) {
            assert!((x - y).abs() < 1e-5, "{x} != {y}");
        }
    }
}

#[test]
fn next_free_channel_tracks_commits() {
    let mut conv = Convolution::new(EngineContext::host());
    conv.init(ConvolutionConfig::new(ConvolutionMethod::TimeDomain, 8, 4, 3))
        .unwrap();
    assert_eq!(conv.next_free_channel(), Some(0));

    let mut h = vec![0.0f32; 8];
    h[0] = 1.0;
    conv.update_response_td(&[Some(&h), None, Some(&h)], BLOCKING)
        .unwrap();
    run_block(&mut conv, &[&[0.0; 4], &[0.0; 4], &[0.0; 4]], &[]);

    assert_eq!(conv.next_free_channel(), Some(1));
}

#[test]
fn process_direct_one_shot() {
    let ir = [1.0f32, 0.5];
    let input = [1.0f32, 0.0, 2.0, 0.0];
    let mut out = [0.0f32; 4];
    process_direct(&ir, &input, &mut out).unwrap();
    assert_eq!(out, [1.0, 0.5, 2.0, 1.0]);

    assert!(process_direct(&[], &input, &mut out).is_err());
}

#[test]
fn time_domain_device_matches_host() {
    use ef_compute::{ComputeBackend, QueueKind};

    // Needs a GPU adapter; environments without one skip the body.
    let Some(backend) = ComputeBackend::device() else {
        eprintln!("no compute device available, skipping");
        return;
    };
    let context = ef_compute::EngineContext::new(backend);
    let l = 32;
    let b = 8;
    let ir: Vec<f32> = (0..l).map(|i| ((i as f32) * 0.41).sin() * 0.5).collect();
    let input: Vec<f32> = (0..b * 8).map(|i| ((i as f32) * 0.17).cos()).collect();

    // Host reference
    let mut host = Convolution::new(EngineContext::host());
    host.init(ConvolutionConfig::new(ConvolutionMethod::TimeDomain, l, b, 1))
        .unwrap();
    host.update_response_td(&[Some(&ir)], BLOCKING).unwrap();
    let mut want = Vec::new();
    for blk in input.chunks(b) {
        want.extend_from_slice(&run_block(&mut host, &[blk], &[])[0]);
    }

    // Device path over device buffers
    let mut conv = Convolution::new(context.clone());
    conv.init(ConvolutionConfig::new(ConvolutionMethod::TimeDomain, l, b, 1))
        .unwrap();
    conv.update_response_td(&[Some(&ir)], BLOCKING).unwrap();

    let in_buf = context.backend().alloc_buffer(b).unwrap();
    let out_buf = context.backend().alloc_buffer(b).unwrap();
    let mut got = Vec::new();
    for blk in input.chunks(b) {
        context
            .backend()
            .upload(QueueKind::Conv, blk, &in_buf, 0, true)
            .unwrap();
        let inputs = [in_buf.clone()];
        let outputs = [out_buf.clone()];
        conv.process(
            &SampleBufferRef::Device(&inputs),
            &mut SampleBufferMut::Device(&outputs),
            &[],
        )
        .unwrap();
        let mut block_out = vec![0.0f32; b];
        context
            .backend()
            .download(QueueKind::Conv, &out_buf, 0, &mut block_out)
            .unwrap();
        got.extend_from_slice(&block_out);
    }

    for (i, (g, w)) in got.iter().zip(want.iter()).enumerate() {
        assert!((g - w).abs() < 1e-4, "device sample {i}: {g} != {w}");
    }
}

#[test]
fn latency_reporting() {
    let mut conv = Convolution::new(EngineContext::host());
    assert!(conv.latency().is_err());
    conv.init(ConvolutionConfig::new(ConvolutionMethod::UniformPartitioned, 64, 16, 1))
        .unwrap();
    assert_eq!(conv.latency().unwrap(), 16);
    conv.terminate().unwrap();

    conv.init(ConvolutionConfig::new(ConvolutionMethod::TimeDomain, 64, 16, 1))
        .unwrap();
    assert_eq!(conv.latency().unwrap(), 0);
}
