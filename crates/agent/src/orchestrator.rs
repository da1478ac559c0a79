//! Session orchestration.
//!
//! [`SessionManager::start`] admits at most one session per process and runs
//! it as a single actor task. Every collaborator callback lands on that
//! task's queue as a [`SessionEvent`], so the session model is only ever
//! touched from one place. Once the session is stopping the actor stops
//! reading events, runs the teardown sequence exactly once and exits.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use sharecast_protocol::{IceServerInfo, SdpType, SignalingEnvelope};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::capture::CaptureLifecycle;
use crate::device::DeviceIdentity;
use crate::engine::{Collaborators, PermissionGrant, SignalSink};
use crate::events::{EventSender, SessionEvent};
use crate::negotiation::NegotiationController;
use crate::session::{Session, SessionSnapshot, SessionState, StopReason, Transition};
use crate::teardown::{TeardownReport, TeardownSequencer};

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("a share session is already active")]
    AlreadyActive,
}

/// Per-process parameters shared by every session.
pub struct SessionSettings {
    pub ice_servers: Vec<IceServerInfo>,
    pub identity: DeviceIdentity,
}

/// Outcome of a finished session.
#[derive(Debug)]
pub struct SessionReport {
    pub device_id: String,
    pub snapshot: SessionSnapshot,
    pub teardown: TeardownReport,
}

/// Releases the single-session slot when the session task ends, however
/// it ends.
struct ActiveSlot(Arc<AtomicBool>);

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct SessionManager {
    collaborators: Collaborators,
    settings: Arc<SessionSettings>,
    active: Arc<AtomicBool>,
}

impl SessionManager {
    pub fn new(collaborators: Collaborators, settings: SessionSettings) -> Self {
        Self {
            collaborators,
            settings: Arc::new(settings),
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    #[cfg(test)]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Start a new session. Rejected while another session exists,
    /// including one that is still tearing down.
    pub fn start(&self, grant: PermissionGrant) -> Result<SessionHandle, StartError> {
        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("Start rejected, a session is already active");
            return Err(StartError::AlreadyActive);
        }
        let slot = ActiveSlot(Arc::clone(&self.active));

        let device_id = self.settings.identity.next_id();
        let session = Session::new(device_id.clone());
        let (events, rx) = EventSender::channel();
        let (snapshots, snapshot_rx) = watch::channel(session.snapshot());
        let span = info_span!("session", id = %session.id(), device_id = %device_id);

        let orchestrator = SessionOrchestrator {
            session,
            capture: CaptureLifecycle::new(Arc::clone(&self.collaborators.capture)),
            collaborators: self.collaborators.clone(),
            ice_servers: self.settings.ice_servers.clone(),
            grant,
            events: events.clone(),
            snapshots,
            negotiation: None,
            signaling: None,
            presence_active: false,
        };
        let task = tokio::spawn(
            async move {
                let _slot = slot;
                orchestrator.run(rx).await
            }
            .instrument(span),
        );

        Ok(SessionHandle {
            device_id,
            events,
            snapshots: snapshot_rx,
            task,
        })
    }
}

/// Cloneable way to ask a session to stop.
#[derive(Debug, Clone)]
pub struct StopHandle {
    events: EventSender,
}

impl StopHandle {
    /// Request an explicit stop. Safe to call any number of times, from
    /// anywhere, before or after the session ended.
    pub fn stop(&self) {
        self.events.emit(SessionEvent::Stop(StopReason::Explicit));
    }
}

pub struct SessionHandle {
    device_id: String,
    events: EventSender,
    snapshots: watch::Receiver<SessionSnapshot>,
    task: JoinHandle<SessionReport>,
}

impl SessionHandle {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    #[cfg(test)]
    pub fn stop(&self) {
        self.stop_handle().stop();
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            events: self.events.clone(),
        }
    }

    #[cfg(test)]
    pub fn snapshot(&self) -> SessionSnapshot {
        *self.snapshots.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    /// Wait for the session to finish teardown.
    pub async fn wait(self) -> anyhow::Result<SessionReport> {
        self.task.await.context("Session task failed")
    }
}

struct SessionOrchestrator {
    session: Session,
    capture: CaptureLifecycle,
    collaborators: Collaborators,
    ice_servers: Vec<IceServerInfo>,
    grant: PermissionGrant,
    events: EventSender,
    snapshots: watch::Sender<SessionSnapshot>,
    negotiation: Option<NegotiationController>,
    signaling: Option<Arc<dyn SignalSink>>,
    presence_active: bool,
}

impl SessionOrchestrator {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SessionEvent>) -> SessionReport {
        self.begin().await;

        while !self.session.is_stopping() {
            // The orchestrator holds a sender itself, so the queue never closes.
            let Some(event) = rx.recv().await else {
                break;
            };
            debug!(event = event.name(), "Session event");
            self.handle(event).await;
        }
        drop(rx);

        self.finish().await
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.session.snapshot());
    }

    fn transition(&mut self, transition: Transition) -> bool {
        let changed = self.session.apply(transition);
        if changed {
            self.publish();
        }
        changed
    }

    fn stop(&mut self, reason: StopReason) {
        if self.transition(Transition::Stop(reason)) {
            info!(%reason, "Stopping session");
        } else {
            debug!(%reason, "Session already stopping");
        }
    }

    async fn begin(&mut self) {
        self.transition(Transition::Begin);
        let device_id = self.session.device_id().to_string();
        info!("Session starting");

        match self.collaborators.presence.activate(&device_id) {
            Ok(()) => self.presence_active = true,
            Err(e) => warn!("Failed to activate presence: {e:#}"),
        }

        let peer = self
            .collaborators
            .peers
            .create(&self.ice_servers, self.events.clone())
            .await;
        match peer {
            Ok(peer) => self.negotiation = Some(NegotiationController::new(&device_id, peer)),
            Err(e) => {
                error!("Peer connection setup failed: {e:#}");
                self.stop(StopReason::SetupFailure);
                return;
            }
        }

        self.signaling = Some(
            self.collaborators
                .signaling
                .connect(&device_id, self.events.clone()),
        );
        self.capture
            .start_once(self.grant.clone(), self.events.clone());
    }

    async fn handle(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::CaptureReady(source) => {
                let Some(negotiation) = self.negotiation.as_mut() else {
                    return;
                };
                match negotiation.attach(source).await {
                    Ok(()) => {
                        self.transition(Transition::CaptureStarted);
                        self.maybe_offer().await;
                    }
                    Err(e) => {
                        error!("{e:#}");
                        self.stop(StopReason::SetupFailure);
                    }
                }
            }
            SessionEvent::CaptureFailed(e) => {
                error!("Capture failed to start: {e:#}");
                self.stop(StopReason::SetupFailure);
            }
            SessionEvent::CaptureStopped(cause) => {
                info!(cause = %cause, "Capture ended");
                self.stop(StopReason::CaptureRevoked);
            }
            SessionEvent::SignalingOpened => {
                self.transition(Transition::SignalingConnected);
                self.maybe_offer().await;
            }
            SessionEvent::SignalingClosed => {
                if self.transition(Transition::SignalingLost) {
                    warn!("Signaling connection lost, negotiation cannot continue");
                }
            }
            SessionEvent::Signal(envelope) => self.on_signal(envelope).await,
            SessionEvent::LocalCandidate(candidate) => {
                if let (Some(negotiation), Some(sink)) = (&self.negotiation, &self.signaling) {
                    sink.send(negotiation.local_candidate(candidate));
                }
            }
            SessionEvent::Stop(reason) => self.stop(reason),
        }
    }

    async fn on_signal(&mut self, envelope: SignalingEnvelope) {
        match envelope {
            SignalingEnvelope::RequestShare => {
                if self.transition(Transition::ShareRequested) {
                    info!("Viewer requested share");
                } else {
                    debug!("Repeated requestShare");
                }
                self.maybe_offer().await;
            }
            SignalingEnvelope::Answer { sdp, .. } => {
                if sdp.kind != SdpType::Answer {
                    warn!(kind = ?sdp.kind, "Ignoring answer envelope with non-answer SDP");
                    return;
                }
                if self.session.state() != SessionState::Negotiating {
                    warn!(state = ?self.session.state(), "Ignoring unexpected answer");
                    return;
                }
                let Some(negotiation) = &self.negotiation else {
                    return;
                };
                match negotiation.apply_answer(sdp).await {
                    Ok(true) => {
                        if self.transition(Transition::AnswerApplied) {
                            info!("Session active");
                        }
                    }
                    Ok(false) => {}
                    Err(e) => warn!("Failed to apply answer: {e:#}"),
                }
            }
            SignalingEnvelope::Candidate { candidate, .. } => {
                let Some(negotiation) = &self.negotiation else {
                    return;
                };
                if let Err(e) = negotiation.apply_candidate(candidate).await {
                    warn!("{e:#}");
                }
            }
            SignalingEnvelope::Offer { .. } => {
                warn!("Ignoring offer from signaling server, this device is the offerer");
            }
            SignalingEnvelope::StopShare => {
                info!("Viewer stopped the share");
                self.stop(StopReason::RemoteStopShare);
            }
        }
    }

    async fn maybe_offer(&mut self) {
        let Some(negotiation) = &self.negotiation else {
            return;
        };
        let result = negotiation.maybe_create_offer(&mut self.session).await;
        match result {
            Ok(Some(offer)) => {
                if let Some(sink) = &self.signaling {
                    sink.send(offer);
                }
                self.publish();
                info!("Offer sent");
            }
            Ok(None) => {}
            Err(e) => {
                self.publish();
                error!("Offer creation failed: {e:#}");
                self.stop(StopReason::SetupFailure);
            }
        }
    }

    async fn finish(self) -> SessionReport {
        let Self {
            mut session,
            capture,
            collaborators,
            negotiation,
            signaling,
            presence_active,
            snapshots,
            ..
        } = self;

        let (track, peer) = match negotiation {
            Some(mut negotiation) => negotiation.release(),
            None => (None, None),
        };
        let teardown = TeardownSequencer {
            capture,
            track,
            peer,
            signaling,
            presence: presence_active.then(|| Arc::clone(&collaborators.presence)),
        }
        .run()
        .await;

        session.apply(Transition::TeardownComplete);
        let snapshot = session.snapshot();
        snapshots.send_replace(snapshot);
        info!(
            reason = ?snapshot.stop_reason,
            failures = teardown.failures(),
            "Session stopped"
        );

        SessionReport {
            device_id: session.device_id().to_string(),
            snapshot,
            teardown,
        }
    }
}
