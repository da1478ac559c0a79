use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use anyhow::Context;
use tracing::{debug, info, warn};

use crate::engine::{CaptureEngine, CaptureStopSignal, PermissionGrant};
use crate::events::{EventSender, SessionEvent};

const IDLE: u8 = 0;
const STARTING: u8 = 1;
const RUNNING: u8 = 2;
const FAILED: u8 = 3;
const CANCELLED: u8 = 4;

/// Result of shutting capture down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStop {
    /// The running engine was stopped
    Stopped,
    /// Start was still in flight; the worker stopped the engine once it returned
    StoppedByWorker,
    /// Nothing was running
    NotRunning,
}

/// Single-shot wrapper around a [`CaptureEngine`].
///
/// The blocking engine start runs on a dedicated named thread. Its outcome
/// and the session's cancellation meet in one atomic phase word, so exactly
/// one side stops an engine that finished starting after the session began
/// tearing down. [`shutdown`](Self::shutdown) waits for that side either way.
pub struct CaptureLifecycle {
    engine: Arc<dyn CaptureEngine>,
    phase: Arc<AtomicU8>,
    worker: Mutex<Option<JoinHandle<anyhow::Result<()>>>>,
}

impl CaptureLifecycle {
    pub fn new(engine: Arc<dyn CaptureEngine>) -> Self {
        Self {
            engine,
            phase: Arc::new(AtomicU8::new(IDLE)),
            worker: Mutex::new(None),
        }
    }

    pub fn engine(&self) -> &Arc<dyn CaptureEngine> {
        &self.engine
    }

    /// Start capture once. Later calls return `false` and do nothing.
    pub fn start_once(&self, grant: PermissionGrant, events: EventSender) -> bool {
        if self
            .phase
            .compare_exchange(IDLE, STARTING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Capture already started, ignoring start request");
            return false;
        }

        let engine = Arc::clone(&self.engine);
        let phase = Arc::clone(&self.phase);
        let worker_events = events.clone();
        let spawned = std::thread::Builder::new()
            .name("capture-start".into())
            .spawn(move || run_start(engine, phase, grant, worker_events))
            .context("Failed to spawn capture thread");

        match spawned {
            Ok(handle) => {
                *self.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
            }
            Err(e) => {
                self.phase.store(FAILED, Ordering::SeqCst);
                events.emit(SessionEvent::CaptureFailed(e));
            }
        }
        true
    }

    /// Stop whatever capture is running and return once it is really down,
    /// including a start that was still in flight. The blocking engine calls
    /// run on the blocking pool. Only the first call reaches the engine.
    pub async fn shutdown(&self) -> anyhow::Result<CaptureStop> {
        let engine = Arc::clone(&self.engine);
        let phase = Arc::clone(&self.phase);
        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        tokio::task::spawn_blocking(move || stop_blocking(&*engine, &phase, worker))
            .await
            .context("Capture stop task failed")?
    }
}

fn stop_blocking(
    engine: &dyn CaptureEngine,
    phase: &AtomicU8,
    worker: Option<JoinHandle<anyhow::Result<()>>>,
) -> anyhow::Result<CaptureStop> {
    match phase.swap(CANCELLED, Ordering::SeqCst) {
        RUNNING => {
            engine.stop().context("Failed to stop capture engine")?;
            Ok(CaptureStop::Stopped)
        }
        STARTING => {
            info!("Capture still starting, waiting for worker to stop it");
            let Some(worker) = worker else {
                return Ok(CaptureStop::NotRunning);
            };
            match worker.join() {
                Ok(result) => {
                    result.context("Failed to stop capture after cancellation")?;
                    Ok(CaptureStop::StoppedByWorker)
                }
                Err(_) => anyhow::bail!("Capture worker panicked"),
            }
        }
        _ => Ok(CaptureStop::NotRunning),
    }
}

/// Body of the capture worker. Returns the result of stopping the engine
/// when the session was cancelled mid-start, otherwise `Ok`.
fn run_start(
    engine: Arc<dyn CaptureEngine>,
    phase: Arc<AtomicU8>,
    grant: PermissionGrant,
    events: EventSender,
) -> anyhow::Result<()> {
    info!(grant = grant.token(), "Starting capture");
    let result = engine.start(&grant, CaptureStopSignal::new(events.clone()));

    let next = if result.is_ok() { RUNNING } else { FAILED };
    if phase
        .compare_exchange(STARTING, next, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        // Session was cancelled while the engine was starting.
        if result.is_ok() {
            info!("Session cancelled during capture start, stopping capture");
            return engine.stop();
        }
        return Ok(());
    }

    match result {
        Ok(source) => {
            info!(
                width = source.width,
                height = source.height,
                framerate = source.framerate,
                "Capture running"
            );
            events.emit(SessionEvent::CaptureReady(source));
        }
        Err(e) => {
            warn!("Capture start failed: {e:#}");
            events.emit(SessionEvent::CaptureFailed(e));
        }
    }
    Ok(())
}
