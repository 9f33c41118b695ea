//! Convolution engine: coordinator and public API
//!
//! One audio thread calls `process`; one background worker transforms
//! submitted IRs. The commit protocol:
//!
//! 1. `update_response_td` copies the IRs and enqueues a transform job.
//! 2. The worker fills the `update` slot version and signals
//!    `update_finished_processing`.
//! 3. The next `process` call observes the signal (ReadyToFlip) and closes
//!    the `proc_ready_for_new_responses` gate; the call after that rotates
//!    the slot indices and runs the cross-fade: two passes per block - the
//!    old slot with time frozen, the new slot reusing the stored input -
//!    mixed with a linear fade of `w[i] = (i + 1) / F`.
//! 4. When the fade window is spent the gate reopens and the worker may
//!    accept the next commit.
//!
//! `F` is one block, except the non-uniform method where the fade spans one
//! full M-block round and the flip waits for a round boundary.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use ef_compute::{
    BufferHandle, EngineContext, KernelId, MemoryAccess, QueueKind, SampleBufferMut,
    SampleBufferRef, ScalarArg,
};
use ef_core::{EfError, EfResult, Sample};
use ef_dsp::FftEngine;
use log::{debug, info, warn};

use crate::config::{
    ChannelFlags, ConvLayout, ConvolutionConfig, ConvolutionMethod, N_VERSIONS, UpdateOptions,
};
use crate::event::Event;
use crate::ir_store::IrStore;
use crate::non_uniform::NuState;
use crate::overlap_add::OlaState;
use crate::pass::{CrossfadePhase, PassStage, ProcessPass};
use crate::time_domain::TdState;
use crate::uniform::UpState;
use crate::worker::{EVENT_POLL, Events, SharedUpdate, UpdateJob, UpdateWorker};

// ============ Algorithm dispatch ============

enum AlgoState {
    Td(TdState),
    Ola(OlaState),
    Up(UpState),
    Nu(NuState),
}

impl AlgoState {
    fn new(layout: &ConvLayout) -> Self {
        match layout.method {
            ConvolutionMethod::TimeDomain => AlgoState::Td(TdState::new(layout)),
            ConvolutionMethod::OverlapAdd => AlgoState::Ola(OlaState::new(layout)),
            ConvolutionMethod::UniformPartitioned | ConvolutionMethod::UniformHeadTail => {
                AlgoState::Up(UpState::new(layout))
            }
            ConvolutionMethod::NonUniformPartitioned => AlgoState::Nu(NuState::new(layout)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn pass(
        &mut self,
        layout: &ConvLayout,
        slot: &crate::ir_store::IrSlot,
        version: usize,
        channel: usize,
        input: &[Sample],
        output: &mut [Sample],
        pass: ProcessPass,
        nu_run_tail: bool,
        fft: &mut FftEngine,
    ) -> EfResult<()> {
        match self {
            AlgoState::Td(td) => td.process_block(layout, slot, channel, input, output, pass),
            AlgoState::Ola(ola) => {
                ola.process_block(layout, slot, version, channel, input, output, pass, fft)
            }
            AlgoState::Up(up) => {
                up.process_block(layout, slot, version, channel, input, output, pass, fft)
            }
            AlgoState::Nu(nu) => nu.process_block(
                layout, slot, version, channel, input, output, pass, nu_run_tail, fft,
            ),
        }
    }

    fn reset_slot(&mut self, version: usize, channel: usize) {
        match self {
            AlgoState::Td(_) => {}
            AlgoState::Ola(ola) => ola.reset_slot(version, channel),
            AlgoState::Up(up) => up.reset_slot(version, channel),
            AlgoState::Nu(nu) => nu.reset_slot(version, channel),
        }
    }

    fn copy_slots(&mut self, from: usize, to: usize, channel: usize) {
        match self {
            AlgoState::Td(_) => {}
            AlgoState::Ola(ola) => ola.copy_slots(from, to, channel),
            AlgoState::Up(up) => up.copy_slots(from, to, channel),
            AlgoState::Nu(nu) => nu.copy_slots(from, to, channel),
        }
    }

    fn flush_channel(&mut self, backend: &ef_compute::ComputeBackend, channel: usize) -> EfResult<()> {
        match self {
            AlgoState::Td(td) => td.flush(backend, channel),
            AlgoState::Ola(ola) => {
                ola.flush(channel);
                Ok(())
            }
            AlgoState::Up(up) => {
                up.flush(channel);
                Ok(())
            }
            AlgoState::Nu(nu) => {
                nu.flush(channel);
                Ok(())
            }
        }
    }
}

// ============ Engine internals ============

struct Engine {
    layout: ConvLayout,
    store: Arc<IrStore>,
    state: AlgoState,
    fft: FftEngine,
    events: Arc<Events>,
    shared: Arc<SharedUpdate>,
    worker: UpdateWorker,
    stop: Arc<AtomicBool>,
    fade: CrossfadePhase,
    /// Blocks processed since init
    blocks: usize,
    /// Deferred head-tail passes: slot versions still owing a tail pass
    pending_ht: Vec<usize>,
    /// Deferred non-uniform tail steps: (version, round at block time)
    pending_nu: Vec<(usize, usize)>,
    // Scratch
    scratch_old: Vec<Vec<Sample>>,
    scratch_new: Vec<Vec<Sample>>,
    staging_in: Vec<Vec<Sample>>,
    staging_out: Vec<Vec<Sample>>,
    silence: Vec<Sample>,
    /// Device scratch for the time-domain kernel cross-fade
    device_scratch: Option<(Vec<BufferHandle>, Vec<BufferHandle>)>,
}

/// Real-time multi-channel FIR convolution engine.
///
/// Created over an `EngineContext` (backend + queues); `init` selects the
/// algorithm and geometry, `process` runs block-rate convolution, and
/// `update_response_td` hot-swaps IRs with a click-free cross-fade.
pub struct Convolution {
    context: Arc<EngineContext>,
    inner: Option<Engine>,
}

impl Convolution {
    pub fn new(context: Arc<EngineContext>) -> Self {
        Self {
            context,
            inner: None,
        }
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.context
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.is_some()
    }

    /// Initialize the engine. Idempotent only after `terminate`.
    pub fn init(&mut self, config: ConvolutionConfig) -> EfResult<()> {
        if self.inner.is_some() {
            return Err(EfError::AlreadyInitialized);
        }
        config.validate(self.context.is_device())?;
        let layout = ConvLayout::new(&config);

        if self.context.is_device() && config.method != ConvolutionMethod::TimeDomain {
            info!(
                "method {:?} has no device kernels; computing on host with device-buffer I/O",
                config.method
            );
        }

        let backend = self.context.backend();
        let device_scratch = if self.context.is_device()
            && config.method == ConvolutionMethod::TimeDomain
        {
            let mut old = Vec::with_capacity(layout.channels);
            let mut new = Vec::with_capacity(layout.channels);
            for _ in 0..layout.channels {
                old.push(backend.alloc_buffer(layout.block)?);
                new.push(backend.alloc_buffer(layout.block)?);
            }
            Some((old, new))
        } else {
            None
        };

        let store = Arc::new(IrStore::new(layout));
        let events = Arc::new(Events::new());
        let shared = Arc::new(SharedUpdate::new(layout.channels));
        let stop = Arc::new(AtomicBool::new(false));
        let worker = UpdateWorker::spawn(
            self.context.clone(),
            store.clone(),
            events.clone(),
            shared.clone(),
            stop.clone(),
        );

        self.inner = Some(Engine {
            state: AlgoState::new(&layout),
            fft: FftEngine::new(),
            fade: CrossfadePhase::Idle,
            blocks: 0,
            pending_ht: Vec::new(),
            pending_nu: Vec::new(),
            scratch_old: vec![vec![0.0; layout.block]; layout.channels],
            scratch_new: vec![vec![0.0; layout.block]; layout.channels],
            staging_in: vec![vec![0.0; layout.block]; layout.channels],
            staging_out: vec![vec![0.0; layout.block]; layout.channels],
            silence: vec![0.0; layout.block],
            device_scratch,
            layout,
            store,
            events,
            shared,
            worker,
            stop,
        });
        info!(
            "convolution engine initialized: {:?}, ir {} samples, block {}, {} channels",
            config.method, config.ir_length, config.block_size, config.channels
        );
        Ok(())
    }

    /// Drain the worker and release all engine state.
    pub fn terminate(&mut self) -> EfResult<()> {
        let mut engine = self
            .inner
            .take()
            .ok_or_else(|| EfError::WrongState("terminate before init".into()))?;
        engine.stop.store(true, Ordering::Release);
        // Unblock any waiter before joining.
        engine.events.proc_ready.set();
        engine.events.update_finished.set();
        engine.events.xfade_started.set();
        engine.worker.shutdown();
        info!("convolution engine terminated");
        Ok(())
    }

    fn engine(&mut self) -> EfResult<&mut Engine> {
        self.inner
            .as_mut()
            .ok_or_else(|| EfError::WrongState("engine not initialized".into()))
    }

    /// Process one block per channel. Returns the samples produced per
    /// channel (always the configured block size).
    ///
    /// A compute failure here is fatal: the engine tears itself down and
    /// the error is returned.
    pub fn process(
        &mut self,
        input: &SampleBufferRef<'_>,
        output: &mut SampleBufferMut<'_>,
        flags: &[ChannelFlags],
    ) -> EfResult<usize> {
        let context = self.context.clone();
        let result = {
            let engine = self
                .inner
                .as_mut()
                .ok_or_else(|| EfError::WrongState("engine not initialized".into()))?;
            engine.process(&context, input, output, flags)
        };
        match result {
            Ok(n) => Ok(n),
            Err(e) if e.is_fatal() => {
                warn!("fatal compute failure during process; terminating engine: {e}");
                let _ = self.terminate();
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Submit new time-domain IRs. `irs[channel]` is `None` for channels
    /// keeping their current response. The samples are copied before this
    /// returns; with `block_until_ready` the call waits until the commit is
    /// ready to flip.
    pub fn update_response_td(
        &mut self,
        irs: &[Option<&[Sample]>],
        options: UpdateOptions,
    ) -> EfResult<()> {
        let engine = self.engine()?;
        if irs.len() != engine.layout.channels {
            return Err(EfError::InvalidArg(format!(
                "expected {} channels of IR data, got {}",
                engine.layout.channels,
                irs.len()
            )));
        }

        let mut channels = Vec::new();
        for (channel, ir) in irs.iter().enumerate() {
            if let Some(ir) = ir {
                if ir.is_empty() {
                    return Err(EfError::InvalidArg(format!("channel {channel}: empty IR")));
                }
                if ir.len() > engine.layout.ir_length {
                    return Err(EfError::InvalidArg(format!(
                        "channel {channel}: IR length {} exceeds maximum {}",
                        ir.len(),
                        engine.layout.ir_length
                    )));
                }
                channels.push((channel, ir.to_vec()));
            }
        }
        if channels.is_empty() {
            return Ok(());
        }

        let done = Arc::new(Event::new());
        engine.shared.queued.fetch_add(1, Ordering::AcqRel);
        if engine
            .worker
            .sender()
            .send(UpdateJob::Transform {
                channels,
                done: done.clone(),
            })
            .is_err()
        {
            engine.shared.queued.fetch_sub(1, Ordering::AcqRel);
            return Err(EfError::WrongState("update worker is not running".into()));
        }
        debug!("IR update queued (blocking: {})", options.block_until_ready);

        if options.block_until_ready {
            loop {
                if done.wait_consume_timeout(EVENT_POLL) {
                    break;
                }
                if engine.stop.load(Ordering::Acquire) {
                    return Err(EfError::WrongState("engine terminated during update".into()));
                }
            }
        }
        Ok(())
    }

    /// Complete deferred tail work (head-tail and non-uniform methods with
    /// `use_process_finalize`). A no-op for the other methods.
    pub fn process_finalize(&mut self) -> EfResult<()> {
        let engine = self.engine()?;
        engine.run_finalize()
    }

    /// Duplicate a transformed response across slot versions for the given
    /// channels.
    pub fn copy_responses(
        &mut self,
        from_version: usize,
        to_version: usize,
        channels: &[usize],
    ) -> EfResult<()> {
        let context = self.context.clone();
        let engine = self.engine()?;
        if from_version >= N_VERSIONS || to_version >= N_VERSIONS {
            return Err(EfError::InvalidArg("slot version out of range".into()));
        }
        for &channel in channels {
            engine
                .store
                .copy_slot(context.backend(), from_version, to_version, channel)?;
        }
        Ok(())
    }

    /// Zero one slot's overlap tail plus the channel's shared input history.
    pub fn flush(&mut self, version: usize, channel: usize) -> EfResult<()> {
        let context = self.context.clone();
        let engine = self.engine()?;
        if version >= N_VERSIONS || channel >= engine.layout.channels {
            return Err(EfError::InvalidArg("slot out of range".into()));
        }
        engine.state.reset_slot(version, channel);
        // The input history is shared across versions and goes with the
        // slot's overlap.
        match &mut engine.state {
            AlgoState::Td(td) => td.flush(context.backend(), channel)?,
            AlgoState::Ola(ola) => ola.clear_input(channel),
            AlgoState::Up(up) => up.clear_ring(channel),
            AlgoState::Nu(nu) => nu.clear_ring(channel),
        }
        Ok(())
    }

    /// First channel with no committed response, if any.
    pub fn next_free_channel(&self) -> Option<usize> {
        let engine = self.inner.as_ref()?;
        let indices = engine.store.indices();
        (0..engine.layout.channels).find(|&ch| engine.store.read(indices.current, ch).len == 0)
    }

    /// Engine latency in samples.
    pub fn latency(&self) -> EfResult<usize> {
        self.inner
            .as_ref()
            .map(|e| e.layout.latency())
            .ok_or_else(|| EfError::WrongState("engine not initialized".into()))
    }
}

impl Drop for Convolution {
    fn drop(&mut self) {
        if self.inner.is_some() {
            let _ = self.terminate();
        }
    }
}

/// One-shot direct convolution without IR management (host memory).
pub use crate::time_domain::process_direct;

// ============ Engine implementation ============

impl Engine {
    fn process(
        &mut self,
        context: &EngineContext,
        input: &SampleBufferRef<'_>,
        output: &mut SampleBufferMut<'_>,
        flags: &[ChannelFlags],
    ) -> EfResult<usize> {
        let channels = self.layout.channels;
        if input.channel_count() < channels || output.channel_count() < channels {
            return Err(EfError::InvalidArg(format!(
                "need {} input/output channels, got {}/{}",
                channels,
                input.channel_count(),
                output.channel_count()
            )));
        }
        if !flags.is_empty() && flags.len() < channels {
            return Err(EfError::InvalidArg("flags must cover every channel".into()));
        }
        if !output.is_device() {
            for channel in 0..channels {
                if output.host_channel_mut(channel)?.len() < self.layout.block {
                    return Err(EfError::InvalidArg(format!(
                        "output channel {channel} shorter than block size {}",
                        self.layout.block
                    )));
                }
            }
        }
        let backend = context.backend();

        let device_io = input.is_device() || output.is_device();
        if device_io && !context.is_device() {
            return Err(EfError::InvalidArg(
                "device buffers require a device context".into(),
            ));
        }
        let td_device = matches!(self.state, AlgoState::Td(_))
            && input.is_device()
            && output.is_device();

        // Deferred tail work the host never finalized.
        self.run_finalize()?;

        // Per-channel flush flags
        for channel in 0..channels {
            if flags.get(channel).is_some_and(|f| f.flush) {
                self.state.flush_channel(backend, channel)?;
            }
        }

        // Commit detection: ReadyToFlip closes the gate; the flip itself
        // waits for the next block (and, for NU, a round boundary).
        if self.fade == CrossfadePhase::Idle
            && self.shared.queued.load(Ordering::Acquire) == 0
            && self.events.update_finished.try_consume()
        {
            self.fade = CrossfadePhase::Pending;
            self.events.proc_ready.reset();
            debug!("IR commit pending");
        }

        if self.fade == CrossfadePhase::Pending && self.at_flip_boundary() {
            let mask = self.shared.take_updated();
            if mask.iter().any(|&m| m) {
                let indices = self.store.rotate();
                for channel in 0..channels {
                    if mask[channel] {
                        self.state.reset_slot(indices.current, channel);
                    } else {
                        self.state.copy_slots(indices.previous, indices.current, channel);
                    }
                }
                if self.blocks == 0 {
                    // Nothing audible yet: the commit takes effect at once.
                    self.fade = CrossfadePhase::Idle;
                    debug!("IR commit applied before first block, no cross-fade");
                } else {
                    self.fade = CrossfadePhase::Active { sample: 0 };
                    self.events.xfade_started.set();
                    debug!("IR commit: cross-fading over {} samples", self.layout.fade_len);
                }
            } else {
                // Stale finish signal from a superseded job
                self.fade = CrossfadePhase::Idle;
            }
        }

        // Stage device inputs for host compute.
        if input.is_device() && !td_device {
            for channel in 0..channels {
                let buf = input.device_channel(channel)?;
                backend.download(QueueKind::Conv, buf, 0, &mut self.staging_in[channel])?;
            }
        }

        if td_device {
            self.process_td_device(backend, input, output, flags)?;
        } else {
            self.process_host(backend, input, output, flags)?;
        }

        if let CrossfadePhase::Active { sample } = self.fade {
            let sample = sample + self.layout.block;
            if sample >= self.layout.fade_len {
                self.fade = CrossfadePhase::Idle;
                self.events.xfade_started.reset();
                debug!("cross-fade complete");
            } else {
                self.fade = CrossfadePhase::Active { sample };
            }
        }

        if self.fade == CrossfadePhase::Idle {
            self.events.proc_ready.set();
        }

        if context.is_device() {
            backend.finish_queue(QueueKind::Conv)?;
        }
        self.blocks += 1;
        Ok(self.layout.block)
    }

    /// NU flips wait for a sub-block round boundary; everything else flips
    /// immediately.
    fn at_flip_boundary(&self) -> bool {
        match &self.state {
            AlgoState::Nu(nu) => nu.sub_block(&self.layout, 0) == 0,
            _ => true,
        }
    }

    fn process_host(
        &mut self,
        backend: &ef_compute::ComputeBackend,
        input: &SampleBufferRef<'_>,
        output: &mut SampleBufferMut<'_>,
        flags: &[ChannelFlags],
    ) -> EfResult<usize> {
        let Engine {
            layout,
            store,
            state,
            fft,
            fade,
            pending_ht,
            pending_nu,
            scratch_old,
            scratch_new,
            staging_in,
            staging_out,
            silence,
            ..
        } = self;
        let channels = layout.channels;
        let indices = store.indices();
        let head_tail = layout.method == ConvolutionMethod::UniformHeadTail;
        let non_uniform = layout.method == ConvolutionMethod::NonUniformPartitioned;
        let inline_tail = non_uniform && !layout.use_process_finalize;

        let nu_round = match state {
            AlgoState::Nu(nu) => nu.round_of(0),
            _ => 0,
        };

        for channel in 0..channels {
            let stop = flags.get(channel).is_some_and(|f| f.stop_input);
            let in_slice: &[Sample] = if stop {
                silence
            } else if input.is_device() {
                &staging_in[channel]
            } else {
                input.host_channel(channel)?
            };

            let head_stage = if head_tail { PassStage::HeadOnly } else { PassStage::Full };

            match *fade {
                CrossfadePhase::Active { sample } => {
                    {
                        let slot = store.read(indices.previous, channel);
                        state.pass(
                            layout,
                            &slot,
                            indices.previous,
                            channel,
                            in_slice,
                            &mut scratch_old[channel],
                            ProcessPass::crossfade_old().with_stage(head_stage),
                            inline_tail,
                            fft,
                        )?;
                    }
                    {
                        let slot = store.read(indices.current, channel);
                        state.pass(
                            layout,
                            &slot,
                            indices.current,
                            channel,
                            in_slice,
                            &mut scratch_new[channel],
                            ProcessPass::crossfade_new().with_stage(head_stage),
                            inline_tail,
                            fft,
                        )?;
                    }

                    let fade_inv = 1.0 / layout.fade_len as Sample;
                    let mix = |out: &mut [Sample]| {
                        for i in 0..layout.block {
                            let w = (((sample + i + 1) as Sample) * fade_inv).min(1.0);
                            out[i] =
                                w * scratch_new[channel][i] + (1.0 - w) * scratch_old[channel][i];
                        }
                    };
                    if output.is_device() {
                        mix(&mut staging_out[channel]);
                    } else {
                        mix(output.host_channel_mut(channel)?);
                    }
                }
                _ => {
                    let slot = store.read(indices.current, channel);
                    let dst: &mut [Sample] = if output.is_device() {
                        &mut staging_out[channel]
                    } else {
                        output.host_channel_mut(channel)?
                    };
                    state.pass(
                        layout,
                        &slot,
                        indices.current,
                        channel,
                        in_slice,
                        dst,
                        ProcessPass::regular().with_stage(head_stage),
                        inline_tail,
                        fft,
                    )?;
                }
            }
        }

        // Tail bookkeeping for this block
        if head_tail {
            pending_ht.push(indices.current);
        }
        if non_uniform && layout.use_process_finalize {
            if matches!(*fade, CrossfadePhase::Active { .. }) {
                pending_nu.push((indices.previous, nu_round));
            }
            pending_nu.push((indices.current, nu_round));
        }
        if !layout.use_process_finalize {
            Self::drain_finalize(layout, store, state, fft, pending_ht, pending_nu)?;
        }

        // Ship staged outputs to device buffers.
        if output.is_device() {
            for channel in 0..channels {
                let buf = output.device_channel(channel)?;
                backend.upload(QueueKind::Conv, &staging_out[channel], buf, 0, false)?;
            }
        }
        Ok(layout.block)
    }

    fn process_td_device(
        &mut self,
        backend: &ef_compute::ComputeBackend,
        input: &SampleBufferRef<'_>,
        output: &mut SampleBufferMut<'_>,
        flags: &[ChannelFlags],
    ) -> EfResult<usize> {
        let Engine {
            layout,
            store,
            state,
            fade,
            silence,
            device_scratch,
            ..
        } = self;
        let td = match state {
            AlgoState::Td(td) => td,
            _ => unreachable!("td_device path requires the time-domain state"),
        };
        let channels = layout.channels;
        let indices = store.indices();
        let (scratch_old, scratch_new) = device_scratch
            .as_ref()
            .ok_or_else(|| EfError::WrongState("device scratch not allocated".into()))?;

        // A stopped channel feeds silence through a staged upload.
        let mut silence_buf: Option<BufferHandle> = None;

        for channel in 0..channels {
            let stop = flags.get(channel).is_some_and(|f| f.stop_input);
            let in_buf: BufferHandle = if stop {
                match &silence_buf {
                    Some(buf) => buf.clone(),
                    None => {
                        let buf = backend.alloc_buffer(layout.block)?;
                        backend.upload(QueueKind::Conv, silence, &buf, 0, false)?;
                        silence_buf = Some(buf.clone());
                        buf
                    }
                }
            } else {
                input.device_channel(channel)?.clone()
            };
            let out_buf = output.device_channel(channel)?;

            match *fade {
                CrossfadePhase::Active { sample } => {
                    {
                        let slot = store.read(indices.previous, channel);
                        td.process_block_device(
                            backend,
                            layout,
                            &slot,
                            channel,
                            &in_buf,
                            &scratch_old[channel],
                            ProcessPass::crossfade_old(),
                        )?;
                    }
                    {
                        let slot = store.read(indices.current, channel);
                        td.process_block_device(
                            backend,
                            layout,
                            &slot,
                            channel,
                            &in_buf,
                            &scratch_new[channel],
                            ProcessPass::crossfade_new(),
                        )?;
                    }
                    let mut kernel = backend.kernel(KernelId::Crossfade);
                    kernel
                        .set_arg_buffer(0, &scratch_old[channel], MemoryAccess::ReadOnly)
                        .set_arg_buffer(1, &scratch_new[channel], MemoryAccess::ReadOnly)
                        .set_arg_buffer(2, out_buf, MemoryAccess::WriteOnly)
                        .set_arg_scalar(0, ScalarArg::U32(layout.block as u32))
                        .set_arg_scalar(1, ScalarArg::U32(layout.fade_len as u32))
                        .set_arg_scalar(2, ScalarArg::U32(sample as u32));
                    backend.enqueue(QueueKind::Conv, &kernel, layout.block)?;
                }
                _ => {
                    let slot = store.read(indices.current, channel);
                    td.process_block_device(
                        backend,
                        layout,
                        &slot,
                        channel,
                        &in_buf,
                        out_buf,
                        ProcessPass::regular(),
                    )?;
                }
            }
        }
        Ok(layout.block)
    }

    fn run_finalize(&mut self) -> EfResult<()> {
        let Engine {
            layout,
            store,
            state,
            fft,
            pending_ht,
            pending_nu,
            ..
        } = self;
        Self::drain_finalize(layout, store, state, fft, pending_ht, pending_nu)
    }

    fn drain_finalize(
        layout: &ConvLayout,
        store: &IrStore,
        state: &mut AlgoState,
        fft: &mut FftEngine,
        pending_ht: &mut Vec<usize>,
        pending_nu: &mut Vec<(usize, usize)>,
    ) -> EfResult<()> {
        for version in std::mem::take(pending_ht) {
            for channel in 0..layout.channels {
                let slot = store.read(version, channel);
                state.pass(
                    layout,
                    &slot,
                    version,
                    channel,
                    &[],
                    &mut [],
                    ProcessPass {
                        reuse_input: true,
                        advance_time: false,
                        stage: PassStage::TailOnly,
                    },
                    false,
                    fft,
                )?;
            }
        }
        for (version, round) in std::mem::take(pending_nu) {
            if let AlgoState::Nu(nu) = state {
                for channel in 0..layout.channels {
                    let slot = store.read(version, channel);
                    nu.tail_step(layout, &slot, version, channel, round)?;
                }
            }
        }
        Ok(())
    }
}
