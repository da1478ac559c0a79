//! Contracts between the session orchestrator and the engines it drives.
//!
//! The orchestrator only talks to capture, peer connection, signaling and
//! presence through these traits. `pipeline`, `peer`, `signaling` and
//! `presence` hold the production implementations.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use sharecast_protocol::{IceCandidateRecord, IceServerInfo, SessionDescription, SignalingEnvelope};
use tokio::sync::mpsc;

use crate::events::{EventSender, SessionEvent};

/// Opaque token proving the host granted screen capture. For the X11
/// pipeline it names the display to capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionGrant {
    token: String,
}

impl PermissionGrant {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

/// One encoded access unit (Annex B H.264).
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub data: Bytes,
    pub duration: Duration,
}

/// Output of a started capture.
#[derive(Debug)]
pub struct FrameSource {
    pub frames: mpsc::Receiver<EncodedFrame>,
    /// Set by the peer side on PLI/FIR; the capture engine clears it after
    /// forcing an IDR.
    pub keyframe_request: Arc<AtomicBool>,
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
}

/// Callback handed to [`CaptureEngine::start`]. Firing it routes the engine's
/// stop (revoked, ended, failed) into the session's teardown path.
#[derive(Clone)]
pub struct CaptureStopSignal {
    events: EventSender,
}

impl CaptureStopSignal {
    pub fn new(events: EventSender) -> Self {
        Self { events }
    }

    pub fn fire(&self, cause: impl Into<String>) {
        self.events.emit(SessionEvent::CaptureStopped(cause.into()));
    }
}

impl fmt::Debug for CaptureStopSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureStopSignal").finish_non_exhaustive()
    }
}

pub trait CaptureEngine: Send + Sync + 'static {
    /// Start capturing. Blocks until frames are flowing or start failed.
    fn start(&self, grant: &PermissionGrant, on_stop: CaptureStopSignal)
    -> anyhow::Result<FrameSource>;

    /// Stop the active capture. Must tolerate being called with nothing running.
    fn stop(&self) -> anyhow::Result<()>;

    /// Give the permission grant back to the host.
    fn release_permission(&self) -> anyhow::Result<()>;
}

#[async_trait]
pub trait PeerFactory: Send + Sync + 'static {
    /// Create a peer connection whose locally gathered ICE candidates are
    /// delivered as [`SessionEvent::LocalCandidate`].
    async fn create(
        &self,
        ice_servers: &[IceServerInfo],
        events: EventSender,
    ) -> anyhow::Result<Arc<dyn PeerEngine>>;
}

#[async_trait]
pub trait PeerEngine: Send + Sync {
    async fn create_offer(&self) -> anyhow::Result<SessionDescription>;
    async fn set_local_description(&self, sdp: SessionDescription) -> anyhow::Result<()>;
    async fn set_remote_description(&self, sdp: SessionDescription) -> anyhow::Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidateRecord) -> anyhow::Result<()>;
    async fn add_track(&self, source: FrameSource) -> anyhow::Result<Box<dyn AttachedTrack>>;
    async fn close(&self) -> anyhow::Result<()>;
}

/// A frame source attached to a peer connection as a video track.
#[async_trait]
pub trait AttachedTrack: Send + Sync {
    async fn dispose(&mut self) -> anyhow::Result<()>;
}

pub trait SignalingConnector: Send + Sync + 'static {
    /// Open the signaling channel in the background. Connect-state changes and
    /// inbound envelopes arrive on `events`.
    fn connect(&self, device_id: &str, events: EventSender) -> Arc<dyn SignalSink>;
}

/// Outbound half of a signaling channel. Sending is best effort.
#[async_trait]
pub trait SignalSink: Send + Sync {
    fn send(&self, envelope: SignalingEnvelope);

    /// Close with a normal close frame and wait for the connection to wind
    /// down.
    async fn close(&self) -> anyhow::Result<()>;
}

pub trait Presence: Send + Sync + 'static {
    fn activate(&self, device_id: &str) -> anyhow::Result<()>;
    fn withdraw(&self) -> anyhow::Result<()>;
}

/// The engines a session runs against.
#[derive(Clone)]
pub struct Collaborators {
    pub capture: Arc<dyn CaptureEngine>,
    pub peers: Arc<dyn PeerFactory>,
    pub signaling: Arc<dyn SignalingConnector>,
    pub presence: Arc<dyn Presence>,
}
