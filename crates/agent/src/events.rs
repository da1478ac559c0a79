use sharecast_protocol::{IceCandidateRecord, SignalingEnvelope};
use tokio::sync::mpsc;
use tracing::debug;

use crate::engine::FrameSource;
use crate::session::StopReason;

/// Everything that can happen to a session. Collaborator callbacks only ever
/// enqueue one of these; the session actor is the sole consumer.
#[derive(Debug)]
pub enum SessionEvent {
    CaptureReady(FrameSource),
    CaptureFailed(anyhow::Error),
    /// The engine ended the capture (revoked, EOS, pipeline error)
    CaptureStopped(String),
    SignalingOpened,
    SignalingClosed,
    Signal(SignalingEnvelope),
    LocalCandidate(IceCandidateRecord),
    Stop(StopReason),
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CaptureReady(_) => "capture_ready",
            Self::CaptureFailed(_) => "capture_failed",
            Self::CaptureStopped(_) => "capture_stopped",
            Self::SignalingOpened => "signaling_opened",
            Self::SignalingClosed => "signaling_closed",
            Self::Signal(_) => "signal",
            Self::LocalCandidate(_) => "local_candidate",
            Self::Stop(_) => "stop",
        }
    }
}

/// Cloneable handle onto a session's event queue.
///
/// Sending never blocks and never fails loudly: once the session task has
/// finished, late events are dropped.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventSender {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Returns `false` if the session is gone.
    pub fn emit(&self, event: SessionEvent) -> bool {
        match self.tx.send(event) {
            Ok(()) => true,
            Err(mpsc::error::SendError(event)) => {
                debug!(event = event.name(), "Session closed, dropping event");
                false
            }
        }
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
