use std::fmt;
use std::sync::Arc;

use tracing::{info, warn};

use crate::capture::{CaptureLifecycle, CaptureStop};
use crate::engine::{AttachedTrack, PeerEngine, Presence, SignalSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStep {
    StopCapture,
    DisposeTrack,
    ClosePeer,
    CloseSignaling,
    ReleasePermission,
    WithdrawPresence,
}

impl fmt::Display for TeardownStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::StopCapture => "stop capture",
            Self::DisposeTrack => "dispose track",
            Self::ClosePeer => "close peer connection",
            Self::CloseSignaling => "close signaling",
            Self::ReleasePermission => "release capture permission",
            Self::WithdrawPresence => "withdraw presence",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Done,
    /// The resource was never acquired
    Skipped,
    Failed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub steps: Vec<(TeardownStep, StepOutcome)>,
}

impl TeardownReport {
    fn record(&mut self, step: TeardownStep, outcome: StepOutcome) {
        match &outcome {
            StepOutcome::Failed(e) => warn!(%step, error = %e, "Teardown step failed"),
            StepOutcome::Skipped => info!(%step, "Teardown step skipped"),
            StepOutcome::Done => info!(%step, "Teardown step done"),
        }
        self.steps.push((step, outcome));
    }

    #[cfg(test)]
    pub fn outcome(&self, step: TeardownStep) -> Option<&StepOutcome> {
        self.steps.iter().find(|(s, _)| *s == step).map(|(_, o)| o)
    }

    pub fn failures(&self) -> usize {
        self.steps
            .iter()
            .filter(|(_, o)| matches!(o, StepOutcome::Failed(_)))
            .count()
    }
}

fn outcome_of(result: anyhow::Result<()>) -> StepOutcome {
    match result {
        Ok(()) => StepOutcome::Done,
        Err(e) => StepOutcome::Failed(format!("{e:#}")),
    }
}

/// Everything a session holds that must be released, in release order.
///
/// `run` takes `self`, so a sequencer can run at most once.
pub struct TeardownSequencer {
    pub capture: CaptureLifecycle,
    pub track: Option<Box<dyn AttachedTrack>>,
    pub peer: Option<Arc<dyn PeerEngine>>,
    pub signaling: Option<Arc<dyn SignalSink>>,
    pub presence: Option<Arc<dyn Presence>>,
}

impl TeardownSequencer {
    pub async fn run(self) -> TeardownReport {
        let Self {
            capture,
            track,
            peer,
            signaling,
            presence,
        } = self;
        let mut report = TeardownReport::default();

        // Waits for a start still in flight, so nothing below runs while
        // capture could still come up.
        let outcome = match capture.shutdown().await {
            Ok(CaptureStop::Stopped | CaptureStop::StoppedByWorker) => StepOutcome::Done,
            Ok(CaptureStop::NotRunning) => StepOutcome::Skipped,
            Err(e) => StepOutcome::Failed(format!("{e:#}")),
        };
        report.record(TeardownStep::StopCapture, outcome);

        let outcome = match track {
            Some(mut track) => outcome_of(track.dispose().await),
            None => StepOutcome::Skipped,
        };
        report.record(TeardownStep::DisposeTrack, outcome);

        let outcome = match peer {
            Some(peer) => outcome_of(peer.close().await),
            None => StepOutcome::Skipped,
        };
        report.record(TeardownStep::ClosePeer, outcome);

        let outcome = match signaling {
            Some(sink) => outcome_of(sink.close().await),
            None => StepOutcome::Skipped,
        };
        report.record(TeardownStep::CloseSignaling, outcome);

        let engine = Arc::clone(capture.engine());
        let outcome = match tokio::task::spawn_blocking(move || engine.release_permission()).await
        {
            Ok(result) => outcome_of(result),
            Err(e) => StepOutcome::Failed(format!("Permission release task failed: {e}")),
        };
        report.record(TeardownStep::ReleasePermission, outcome);

        let outcome = match presence {
            Some(presence) => outcome_of(presence.withdraw()),
            None => StepOutcome::Skipped,
        };
        report.record(TeardownStep::WithdrawPresence, outcome);

        report
    }
}
