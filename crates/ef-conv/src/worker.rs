//! Update worker
//!
//! A background thread that turns submitted IRs into committed filter slots
//! without touching the audio thread's cadence. The audio thread enqueues
//! transform jobs; the worker drains them, transforms into the `update`
//! version with its own FFT engine, completes the per-channel snapshot by
//! copying untouched channels from `current`, then signals
//! `update_finished_processing`. Shutdown is a poison pill on the queue.
//!
//! Gating: the worker consumes `proc_ready_for_new_responses` before
//! touching the store. While a job is queued or in flight the audio thread
//! will not rotate the slot indices (the commit requires the job's finish
//! signal), so the `update` index read here stays valid for the whole job.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use ef_compute::{EngineContext, QueueKind};
use ef_core::Sample;
use ef_dsp::FftEngine;
use log::{debug, warn};
use parking_lot::Mutex;

use crate::event::Event;
use crate::ir_store::IrStore;

/// Audio-thread wait bound; also the worker's stop-poll granularity.
pub const EVENT_POLL: Duration = Duration::from_millis(50);

/// The coordinator's three events (one setter / one waiter each).
pub struct Events {
    /// Audio -> worker: the last block completed with no cross-fade pending
    pub proc_ready: Event,
    /// Worker -> audio: at least one channel's new IR is fully transformed
    pub update_finished: Event,
    /// Audio -> observers: a cross-fade is in progress
    pub xfade_started: Event,
}

impl Events {
    pub fn new() -> Self {
        let events = Self {
            proc_ready: Event::new(),
            update_finished: Event::new(),
            xfade_started: Event::new(),
        };
        // Allow the first update before any block has been processed.
        events.proc_ready.set();
        events
    }
}

impl Default for Events {
    fn default() -> Self {
        Self::new()
    }
}

/// State shared between the audio thread and the worker.
pub struct SharedUpdate {
    /// Jobs submitted and not yet transformed
    pub queued: AtomicUsize,
    /// Channels carrying a new IR in the pending commit
    pub updated: Mutex<Vec<bool>>,
}

impl SharedUpdate {
    pub fn new(channels: usize) -> Self {
        Self {
            queued: AtomicUsize::new(0),
            updated: Mutex::new(vec![false; channels]),
        }
    }

    /// Take and clear the updated-channel mask (at the flip).
    pub fn take_updated(&self) -> Vec<bool> {
        let mut mask = self.updated.lock();
        let taken = mask.clone();
        mask.iter_mut().for_each(|m| *m = false);
        taken
    }
}

/// A transform job: per-channel raw IRs, and a latch for blocking callers.
pub enum UpdateJob {
    Transform {
        /// `(channel, samples)` pairs
        channels: Vec<(usize, Vec<Sample>)>,
        done: Arc<Event>,
    },
    Shutdown,
}

/// Handle to the background update thread.
pub struct UpdateWorker {
    sender: Sender<UpdateJob>,
    handle: Option<JoinHandle<()>>,
}

impl UpdateWorker {
    pub fn spawn(
        context: Arc<EngineContext>,
        store: Arc<IrStore>,
        events: Arc<Events>,
        shared: Arc<SharedUpdate>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        let (sender, receiver) = unbounded();
        let handle = std::thread::Builder::new()
            .name("ef-conv-update".into())
            .spawn(move || run(context, store, events, shared, stop, receiver))
            .expect("spawn update worker");
        Self {
            sender,
            handle: Some(handle),
        }
    }

    pub fn sender(&self) -> Sender<UpdateJob> {
        self.sender.clone()
    }

    /// Poison the queue and join.
    pub fn shutdown(&mut self) {
        let _ = self.sender.send(UpdateJob::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(
    context: Arc<EngineContext>,
    store: Arc<IrStore>,
    events: Arc<Events>,
    shared: Arc<SharedUpdate>,
    stop: Arc<AtomicBool>,
    receiver: Receiver<UpdateJob>,
) {
    // The worker owns its FFT engine; it never shares the audio thread's.
    let mut fft = FftEngine::new();
    debug!("update worker started");

    while let Ok(job) = receiver.recv() {
        let (channels, done) = match job {
            UpdateJob::Shutdown => break,
            UpdateJob::Transform { channels, done } => (channels, done),
        };

        // Wait until the audio thread is past any cross-fade. This is a
        // level gate: it stays open between blocks and closes while a
        // commit is in flight.
        loop {
            if stop.load(Ordering::Acquire) {
                done.set();
                return;
            }
            if events.proc_ready.wait_set_timeout(EVENT_POLL) {
                break;
            }
        }

        let indices = store.indices();
        let backend = context.backend();
        let mut mask = vec![false; store.layout().channels];
        let mut failed = false;

        for (channel, ir) in &channels {
            let result = store
                .write_staging(indices.update, *channel, ir)
                .and_then(|_| store.transform(backend, indices.update, *channel, &mut fft));
            match result {
                Ok(()) => mask[*channel] = true,
                Err(e) => {
                    warn!("IR update dropped for channel {channel}: {e}");
                    failed = true;
                    break;
                }
            }
        }

        if !failed {
            // Complete the snapshot: untouched channels mirror `current`.
            for channel in 0..store.layout().channels {
                if !mask[channel] {
                    if let Err(e) =
                        store.copy_slot(backend, indices.current, indices.update, channel)
                    {
                        warn!("IR update dropped: snapshot copy failed for channel {channel}: {e}");
                        failed = true;
                        break;
                    }
                }
            }
        }

        if !failed {
            // Device uploads must land before the commit becomes visible.
            if let Err(e) = backend.finish_queue(QueueKind::General) {
                warn!("IR update dropped: upload sync failed: {e}");
                failed = true;
            }
        }

        if !failed {
            {
                let mut updated = shared.updated.lock();
                for (channel, new) in updated.iter_mut().zip(mask.iter()) {
                    *channel |= new;
                }
            }
            shared.queued.fetch_sub(1, Ordering::AcqRel);
            events.update_finished.set();
            debug!("IR update transformed into slot {}", indices.update);
        } else {
            // Dropped update: the slot never flips, later jobs rebuild it.
            shared.queued.fetch_sub(1, Ordering::AcqRel);
        }

        done.set();
    }

    debug!("update worker stopped");
}
