//! In-process fakes for every collaborator. All of them record into one
//! shared [`CallLog`] so tests can assert on call counts and ordering.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sharecast_protocol::{IceCandidateRecord, IceServerInfo, SessionDescription, SignalingEnvelope};
use tokio::sync::{mpsc, watch};

use crate::device::DeviceIdentity;
use crate::engine::{
    AttachedTrack, CaptureEngine, CaptureStopSignal, Collaborators, FrameSource, PeerEngine,
    PeerFactory, PermissionGrant, Presence, SignalSink, SignalingConnector,
};
use crate::events::{EventSender, SessionEvent};
use crate::orchestrator::{SessionManager, SessionSettings};
use crate::session::SessionSnapshot;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn record(&self, call: &str) {
        self.0.lock().unwrap().push(call.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|c| *c == call).count()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }

    pub async fn wait_count(&self, call: &str, n: usize) {
        tokio::time::timeout(WAIT, async {
            while self.count(call) < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {n} x {call}"));
    }
}

/// Wait until a published snapshot satisfies `pred`.
pub async fn wait_for(
    rx: &mut watch::Receiver<SessionSnapshot>,
    pred: impl FnMut(&SessionSnapshot) -> bool,
) {
    tokio::time::timeout(WAIT, rx.wait_for(pred))
        .await
        .expect("timed out waiting for session state")
        .expect("session ended before reaching the expected state");
}

pub fn frame_source() -> FrameSource {
    let (_tx, frames) = mpsc::channel(1);
    FrameSource {
        frames,
        keyframe_request: Arc::new(AtomicBool::new(false)),
        width: 480,
        height: 960,
        framerate: 15,
    }
}

/// Blocks a capture start until released.
#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    cond: Condvar,
}

impl Gate {
    pub fn release(&self) {
        *self.open.lock().unwrap() = true;
        self.cond.notify_all();
    }

    fn wait(&self) {
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.cond.wait(open).unwrap();
        }
    }
}

pub struct FakeCapture {
    log: CallLog,
    fail_start: AtomicBool,
    fail_stop: AtomicBool,
    gate: Mutex<Option<Arc<Gate>>>,
    on_stop: Mutex<Option<CaptureStopSignal>>,
    start_thread: Mutex<Option<String>>,
}

impl FakeCapture {
    pub fn new(log: CallLog) -> Arc<Self> {
        Arc::new(Self {
            log,
            fail_start: AtomicBool::new(false),
            fail_stop: AtomicBool::new(false),
            gate: Mutex::new(None),
            on_stop: Mutex::new(None),
            start_thread: Mutex::new(None),
        })
    }

    pub fn fail_start(&self) {
        self.fail_start.store(true, Ordering::SeqCst);
    }

    pub fn fail_stop(&self) {
        self.fail_stop.store(true, Ordering::SeqCst);
    }

    /// Make the next start block until the returned gate is released.
    pub fn hold_start(&self) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        *self.gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    /// Name of the thread `start` ran on.
    pub fn start_thread(&self) -> Option<String> {
        self.start_thread.lock().unwrap().clone()
    }

    /// Simulate the host revoking the capture.
    pub fn revoke(&self) {
        let signal = self.on_stop.lock().unwrap().clone();
        if let Some(signal) = signal {
            signal.fire("revoked");
        }
    }
}

impl CaptureEngine for FakeCapture {
    fn start(
        &self,
        _grant: &PermissionGrant,
        on_stop: CaptureStopSignal,
    ) -> anyhow::Result<FrameSource> {
        self.log.record("capture.start");
        *self.start_thread.lock().unwrap() = std::thread::current().name().map(String::from);
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.wait();
        }
        if self.fail_start.load(Ordering::SeqCst) {
            anyhow::bail!("capture permission denied");
        }
        *self.on_stop.lock().unwrap() = Some(on_stop);
        Ok(frame_source())
    }

    fn stop(&self) -> anyhow::Result<()> {
        self.log.record("capture.stop");
        if self.fail_stop.load(Ordering::SeqCst) {
            anyhow::bail!("capture engine wedged");
        }
        Ok(())
    }

    fn release_permission(&self) -> anyhow::Result<()> {
        self.log.record("capture.release_permission");
        Ok(())
    }
}

pub struct FakeTrack {
    log: CallLog,
}

#[async_trait]
impl AttachedTrack for FakeTrack {
    async fn dispose(&mut self) -> anyhow::Result<()> {
        self.log.record("track.dispose");
        Ok(())
    }
}

pub struct FakePeer {
    log: CallLog,
    fail_offer: AtomicBool,
    fail_answer: AtomicBool,
    fail_close: AtomicBool,
    candidates: Mutex<Vec<IceCandidateRecord>>,
}

impl FakePeer {
    pub fn new(log: CallLog) -> Arc<Self> {
        Arc::new(Self {
            log,
            fail_offer: AtomicBool::new(false),
            fail_answer: AtomicBool::new(false),
            fail_close: AtomicBool::new(false),
            candidates: Mutex::new(Vec::new()),
        })
    }

    pub fn fail_offer(&self) {
        self.fail_offer.store(true, Ordering::SeqCst);
    }

    pub fn fail_answer(&self) {
        self.fail_answer.store(true, Ordering::SeqCst);
    }

    pub fn fail_close(&self) {
        self.fail_close.store(true, Ordering::SeqCst);
    }

    pub fn candidates(&self) -> Vec<IceCandidateRecord> {
        self.candidates.lock().unwrap().clone()
    }

    pub fn track(&self) -> Box<dyn AttachedTrack> {
        Box::new(FakeTrack {
            log: self.log.clone(),
        })
    }
}

#[async_trait]
impl PeerEngine for FakePeer {
    async fn create_offer(&self) -> anyhow::Result<SessionDescription> {
        self.log.record("peer.create_offer");
        if self.fail_offer.load(Ordering::SeqCst) {
            anyhow::bail!("no codecs negotiated");
        }
        Ok(SessionDescription::offer("v=0 fake offer"))
    }

    async fn set_local_description(&self, _sdp: SessionDescription) -> anyhow::Result<()> {
        self.log.record("peer.set_local_description");
        Ok(())
    }

    async fn set_remote_description(&self, _sdp: SessionDescription) -> anyhow::Result<()> {
        self.log.record("peer.set_remote_description");
        if self.fail_answer.load(Ordering::SeqCst) {
            anyhow::bail!("malformed answer");
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateRecord) -> anyhow::Result<()> {
        self.log.record("peer.add_ice_candidate");
        self.candidates.lock().unwrap().push(candidate);
        Ok(())
    }

    async fn add_track(&self, _source: FrameSource) -> anyhow::Result<Box<dyn AttachedTrack>> {
        self.log.record("peer.add_track");
        Ok(self.track())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.log.record("peer.close");
        if self.fail_close.load(Ordering::SeqCst) {
            anyhow::bail!("DTLS transport already closed");
        }
        Ok(())
    }
}

pub struct FakePeerFactory {
    log: CallLog,
    peer: Arc<FakePeer>,
    fail_create: AtomicBool,
    events: Mutex<Option<EventSender>>,
}

impl FakePeerFactory {
    pub fn new(log: CallLog, peer: Arc<FakePeer>) -> Arc<Self> {
        Arc::new(Self {
            log,
            peer,
            fail_create: AtomicBool::new(false),
            events: Mutex::new(None),
        })
    }

    pub fn fail_create(&self) {
        self.fail_create.store(true, Ordering::SeqCst);
    }

    /// Act as the engine discovering a local candidate.
    pub fn emit_local_candidate(&self, candidate: IceCandidateRecord) {
        if let Some(events) = self.events.lock().unwrap().as_ref() {
            events.emit(SessionEvent::LocalCandidate(candidate));
        }
    }
}

#[async_trait]
impl PeerFactory for FakePeerFactory {
    async fn create(
        &self,
        _ice_servers: &[IceServerInfo],
        events: EventSender,
    ) -> anyhow::Result<Arc<dyn PeerEngine>> {
        self.log.record("peer.create");
        if self.fail_create.load(Ordering::SeqCst) {
            anyhow::bail!("no network interfaces");
        }
        *self.events.lock().unwrap() = Some(events);
        Ok(Arc::clone(&self.peer) as Arc<dyn PeerEngine>)
    }
}

pub struct FakeSink {
    log: CallLog,
    sent: Mutex<Vec<SignalingEnvelope>>,
}

impl FakeSink {
    pub fn new(log: CallLog) -> Arc<Self> {
        Arc::new(Self {
            log,
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn sent(&self) -> Vec<SignalingEnvelope> {
        self.sent.lock().unwrap().clone()
    }

    pub fn offers(&self) -> Vec<SignalingEnvelope> {
        self.sent()
            .into_iter()
            .filter(|e| matches!(e, SignalingEnvelope::Offer { .. }))
            .collect()
    }
}

#[async_trait]
impl SignalSink for FakeSink {
    fn send(&self, envelope: SignalingEnvelope) {
        self.log.record(&format!("signaling.send.{}", envelope.kind()));
        self.sent.lock().unwrap().push(envelope);
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.log.record("signaling.close");
        Ok(())
    }
}

/// Signaling connector driven by the test: nothing opens or arrives until
/// the test says so.
pub struct FakeSignaling {
    log: CallLog,
    sink: Arc<FakeSink>,
    connection: Mutex<Option<(String, EventSender)>>,
}

impl FakeSignaling {
    pub fn new(log: CallLog, sink: Arc<FakeSink>) -> Arc<Self> {
        Arc::new(Self {
            log,
            sink,
            connection: Mutex::new(None),
        })
    }

    pub fn connected_as(&self) -> Option<String> {
        self.connection
            .lock()
            .unwrap()
            .as_ref()
            .map(|(id, _)| id.clone())
    }

    /// The session's event queue, once the session has connected.
    pub async fn events(&self) -> EventSender {
        tokio::time::timeout(WAIT, async {
            loop {
                if let Some((_, events)) = self.connection.lock().unwrap().as_ref() {
                    return events.clone();
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("session never connected signaling")
    }

    pub async fn open(&self) {
        self.events().await.emit(SessionEvent::SignalingOpened);
    }

    pub async fn deliver(&self, envelope: SignalingEnvelope) {
        self.events().await.emit(SessionEvent::Signal(envelope));
    }

    pub async fn drop_connection(&self) {
        self.events().await.emit(SessionEvent::SignalingClosed);
    }
}

impl SignalingConnector for FakeSignaling {
    fn connect(&self, device_id: &str, events: EventSender) -> Arc<dyn SignalSink> {
        self.log.record("signaling.connect");
        *self.connection.lock().unwrap() = Some((device_id.to_string(), events));
        Arc::clone(&self.sink) as Arc<dyn SignalSink>
    }
}

pub struct FakePresence {
    log: CallLog,
    fail_withdraw: AtomicBool,
}

impl FakePresence {
    pub fn new(log: CallLog) -> Arc<Self> {
        Arc::new(Self {
            log,
            fail_withdraw: AtomicBool::new(false),
        })
    }

    pub fn fail_withdraw(&self) {
        self.fail_withdraw.store(true, Ordering::SeqCst);
    }
}

impl Presence for FakePresence {
    fn activate(&self, _device_id: &str) -> anyhow::Result<()> {
        self.log.record("presence.activate");
        Ok(())
    }

    fn withdraw(&self) -> anyhow::Result<()> {
        self.log.record("presence.withdraw");
        if self.fail_withdraw.load(Ordering::SeqCst) {
            anyhow::bail!("status file is read-only");
        }
        Ok(())
    }
}

/// One full set of fakes sharing a log.
pub struct Fakes {
    pub log: CallLog,
    pub capture: Arc<FakeCapture>,
    pub peer: Arc<FakePeer>,
    pub peers: Arc<FakePeerFactory>,
    pub sink: Arc<FakeSink>,
    pub signaling: Arc<FakeSignaling>,
    pub presence: Arc<FakePresence>,
}

impl Fakes {
    pub fn new() -> Self {
        let log = CallLog::default();
        let peer = FakePeer::new(log.clone());
        let sink = FakeSink::new(log.clone());
        Self {
            capture: FakeCapture::new(log.clone()),
            peers: FakePeerFactory::new(log.clone(), Arc::clone(&peer)),
            peer,
            signaling: FakeSignaling::new(log.clone(), Arc::clone(&sink)),
            sink,
            presence: FakePresence::new(log.clone()),
            log,
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            capture: self.capture.clone(),
            peers: self.peers.clone(),
            signaling: self.signaling.clone(),
            presence: self.presence.clone(),
        }
    }

    pub fn manager(&self) -> SessionManager {
        SessionManager::new(
            self.collaborators(),
            SessionSettings {
                ice_servers: Vec::new(),
                identity: DeviceIdentity::new("Acme", "Tab", None),
            },
        )
    }
}
