//! Session state model.
//!
//! All gating flags, the lifecycle state and the stop guard live in one
//! [`SessionSnapshot`] that only changes through [`Session::apply`]. Every
//! precondition check reads that one value, so single-flight, offer-once and
//! stop-once are never decided from a mix of old and new fields.

use std::fmt;

use uuid::Uuid;

/// Lifecycle states in graph order. Derived `Ord` is the progression order;
/// a session never moves to a smaller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionState {
    Idle,
    Starting,
    Negotiating,
    Active,
    Stopping,
    Stopped,
}

/// Readiness bits gating offer creation. Each is latched false→true once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NegotiationFlags {
    pub capture_started: bool,
    pub signaling_connected: bool,
    pub share_requested: bool,
    pub offer_sent: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StopReason {
    /// Host asked the agent to stop
    Explicit,
    /// Signaling server sent `stopShare`
    RemoteStopShare,
    /// Capture engine reported the capture ended or was revoked
    CaptureRevoked,
    /// Capture or peer-connection setup failed
    SetupFailure,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Explicit => "explicit stop",
            Self::RemoteStopShare => "remote stopShare",
            Self::CaptureRevoked => "capture revoked",
            Self::SetupFailure => "setup failure",
        };
        f.write_str(s)
    }
}

/// Inputs to the transition function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Begin,
    CaptureStarted,
    SignalingConnected,
    SignalingLost,
    ShareRequested,
    OfferSent,
    AnswerApplied,
    Stop(StopReason),
    TeardownComplete,
}

/// One consistent view of a session, published after every change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub id: Uuid,
    pub state: SessionState,
    pub flags: NegotiationFlags,
    /// Latched when the signaling connection drops or never opens
    pub signaling_lost: bool,
    pub stopping: bool,
    pub stop_reason: Option<StopReason>,
    pub version: u64,
}

impl SessionSnapshot {
    /// All three readiness sources are up, no offer has gone out and the
    /// session is not being torn down.
    pub fn offer_ready(&self) -> bool {
        let f = &self.flags;
        f.capture_started
            && f.signaling_connected
            && f.share_requested
            && !f.offer_sent
            && !self.signaling_lost
            && !self.stopping
    }
}

#[derive(Debug)]
pub struct Session {
    device_id: String,
    current: SessionSnapshot,
}

impl Session {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            current: SessionSnapshot {
                id: Uuid::new_v4(),
                state: SessionState::Idle,
                flags: NegotiationFlags::default(),
                signaling_lost: false,
                stopping: false,
                stop_reason: None,
                version: 0,
            },
        }
    }

    pub fn id(&self) -> Uuid {
        self.current.id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.current
    }

    pub fn state(&self) -> SessionState {
        self.current.state
    }

    pub fn is_stopping(&self) -> bool {
        self.current.stopping
    }

    pub fn offer_ready(&self) -> bool {
        self.current.offer_ready()
    }

    /// Apply one transition. Returns `true` if the snapshot changed.
    ///
    /// Once `stopping` is set only `TeardownComplete` is accepted. Latched
    /// flags and the stop guard ignore repeats, and the state never moves
    /// backwards.
    pub fn apply(&mut self, transition: Transition) -> bool {
        let mut next = self.current;
        if next.stopping && transition != Transition::TeardownComplete {
            return false;
        }

        match transition {
            Transition::Begin => {
                if next.state != SessionState::Idle {
                    return false;
                }
                next.state = SessionState::Starting;
            }
            Transition::CaptureStarted => next.flags.capture_started = true,
            Transition::SignalingConnected => next.flags.signaling_connected = true,
            Transition::SignalingLost => next.signaling_lost = true,
            Transition::ShareRequested => next.flags.share_requested = true,
            Transition::OfferSent => {
                if !next.offer_ready() {
                    return false;
                }
                next.flags.offer_sent = true;
                next.state = next.state.max(SessionState::Negotiating);
            }
            Transition::AnswerApplied => {
                if next.state != SessionState::Negotiating {
                    return false;
                }
                next.state = SessionState::Active;
            }
            Transition::Stop(reason) => {
                next.stopping = true;
                next.stop_reason = Some(reason);
                next.state = SessionState::Stopping;
            }
            Transition::TeardownComplete => {
                if next.state != SessionState::Stopping {
                    return false;
                }
                next.state = SessionState::Stopped;
            }
        }

        if next == self.current {
            return false;
        }
        debug_assert!(next.state >= self.current.state);
        next.version += 1;
        self.current = next;
        true
    }
}
