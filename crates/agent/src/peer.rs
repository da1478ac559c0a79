use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use async_trait::async_trait;
use sharecast_protocol::{IceCandidateRecord, IceServerInfo, SdpType, SessionDescription};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_H264, MediaEngine};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCPFeedback;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::engine::{AttachedTrack, FrameSource, PeerEngine, PeerFactory};
use crate::events::{EventSender, SessionEvent};

/// Constrained Baseline, which every browser decoder accepts and which the
/// capture pipeline forces on its encoder output.
const H264_FMTP: &str = "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f";

const FALLBACK_STUN: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

fn h264_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_H264.to_string(),
        clock_rate: 90000,
        channels: 0,
        sdp_fmtp_line: H264_FMTP.to_string(),
        rtcp_feedback: vec![
            RTCPFeedback {
                typ: "goog-remb".into(),
                parameter: "".into(),
            },
            RTCPFeedback {
                typ: "ccm".into(),
                parameter: "fir".into(),
            },
            RTCPFeedback {
                typ: "nack".into(),
                parameter: "".into(),
            },
            RTCPFeedback {
                typ: "nack".into(),
                parameter: "pli".into(),
            },
        ],
    }
}

fn rtc_ice_servers(ice_servers: &[IceServerInfo]) -> Vec<RTCIceServer> {
    if ice_servers.is_empty() {
        return vec![RTCIceServer {
            urls: FALLBACK_STUN.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }];
    }
    ice_servers
        .iter()
        .map(|s| RTCIceServer {
            urls: s.urls.clone(),
            username: s.username.clone().unwrap_or_default(),
            credential: s.credential.clone().unwrap_or_default(),
        })
        .collect()
}

fn to_rtc(sdp: SessionDescription) -> anyhow::Result<RTCSessionDescription> {
    match sdp.kind {
        SdpType::Offer => RTCSessionDescription::offer(sdp.sdp).context("Failed to parse SDP offer"),
        SdpType::Answer => {
            RTCSessionDescription::answer(sdp.sdp).context("Failed to parse SDP answer")
        }
    }
}

/// Peer connection sending one H.264 video track.
pub struct WebRtcPeer {
    peer_connection: Arc<RTCPeerConnection>,
}

impl WebRtcPeer {
    pub async fn new(ice_servers: &[IceServerInfo]) -> anyhow::Result<Self> {
        let mut media_engine = MediaEngine::default();

        // H.264 only. Default codecs would let the viewer pick VP8, which the
        // pipeline never produces.
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: h264_capability(),
                payload_type: 125,
                ..Default::default()
            },
            RTPCodecType::Video,
        )?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: rtc_ice_servers(ice_servers),
            ..Default::default()
        };

        let peer_connection = Arc::new(
            api.new_peer_connection(config)
                .await
                .context("Failed to create peer connection")?,
        );

        peer_connection.on_peer_connection_state_change(Box::new(move |state| {
            match state {
                RTCPeerConnectionState::Failed => warn!("Peer connection failed"),
                RTCPeerConnectionState::Disconnected => warn!("Peer connection disconnected"),
                _ => info!(?state, "Peer connection state changed"),
            }
            Box::pin(async {})
        }));

        info!("WebRTC peer connection created");
        Ok(Self { peer_connection })
    }

    /// Relay every locally gathered candidate to the session.
    pub fn relay_candidates(&self, events: EventSender) {
        self.peer_connection
            .on_ice_candidate(Box::new(move |candidate| {
                if let Some(c) = candidate {
                    match c.to_json() {
                        Ok(json) => {
                            events.emit(SessionEvent::LocalCandidate(IceCandidateRecord {
                                candidate: json.candidate,
                                sdp_mid: json.sdp_mid.unwrap_or_default(),
                                sdp_mline_index: json.sdp_mline_index.unwrap_or(0),
                            }));
                        }
                        Err(e) => warn!("Failed to serialize ICE candidate: {e}"),
                    }
                }
                Box::pin(async {})
            }));
    }
}

#[async_trait]
impl PeerEngine for WebRtcPeer {
    async fn create_offer(&self) -> anyhow::Result<SessionDescription> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .context("Failed to create offer")?;
        for line in offer.sdp.lines() {
            if line.starts_with("m=") || line.starts_with("a=rtpmap:") || line.starts_with("a=fmtp:")
            {
                debug!(sdp_line = line, "Offer SDP");
            }
        }
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn set_local_description(&self, sdp: SessionDescription) -> anyhow::Result<()> {
        self.peer_connection
            .set_local_description(to_rtc(sdp)?)
            .await
            .context("Failed to set local description")
    }

    async fn set_remote_description(&self, sdp: SessionDescription) -> anyhow::Result<()> {
        self.peer_connection
            .set_remote_description(to_rtc(sdp)?)
            .await
            .context("Failed to set remote description")?;
        info!("Remote description applied");
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateRecord) -> anyhow::Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: Some(candidate.sdp_mid),
            sdp_mline_index: Some(candidate.sdp_mline_index),
            ..Default::default()
        };
        self.peer_connection
            .add_ice_candidate(init)
            .await
            .context("Failed to add ICE candidate")?;
        debug!("Remote ICE candidate added");
        Ok(())
    }

    async fn add_track(&self, source: FrameSource) -> anyhow::Result<Box<dyn AttachedTrack>> {
        let FrameSource {
            mut frames,
            keyframe_request,
            ..
        } = source;

        // Track fmtp must match the registered codec or the track may bind to
        // packetization-mode=0.
        let track = Arc::new(TrackLocalStaticSample::new(
            h264_capability(),
            "video".to_string(),
            "sharecast".to_string(),
        ));
        let sender = self
            .peer_connection
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .context("Failed to add video track")?;

        let rtcp = start_rtcp_reader(Arc::clone(&sender), keyframe_request);

        let pump = tokio::spawn(async move {
            let mut failures = 0u64;
            while let Some(frame) = frames.recv().await {
                let sample = webrtc::media::Sample {
                    data: frame.data,
                    duration: frame.duration,
                    ..Default::default()
                };
                if let Err(e) = track.write_sample(&sample).await {
                    failures += 1;
                    if failures == 1 {
                        warn!("Failed to write video sample: {e}");
                    }
                }
            }
            debug!(failures, "Frame source ended");
        });

        Ok(Box::new(WebRtcTrack {
            peer_connection: Arc::clone(&self.peer_connection),
            sender: Some(sender),
            tasks: vec![pump, rtcp],
        }))
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.peer_connection
            .close()
            .await
            .context("Failed to close peer connection")?;
        info!("Peer connection closed");
        Ok(())
    }
}

/// Read RTCP from the video sender and turn PLI/FIR into a keyframe request
/// for the capture engine.
fn start_rtcp_reader(sender: Arc<RTCRtpSender>, keyframe_request: Arc<AtomicBool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok((packets, _)) = sender.read_rtcp().await {
            for pkt in &packets {
                let pkt_any = pkt.as_any();
                if pkt_any.is::<rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication>()
                    || pkt_any.is::<rtcp::payload_feedbacks::full_intra_request::FullIntraRequest>()
                {
                    debug!("Received PLI/FIR keyframe request");
                    keyframe_request.store(true, Ordering::Relaxed);
                }
            }
        }
    })
}

struct WebRtcTrack {
    peer_connection: Arc<RTCPeerConnection>,
    sender: Option<Arc<RTCRtpSender>>,
    tasks: Vec<JoinHandle<()>>,
}

#[async_trait]
impl AttachedTrack for WebRtcTrack {
    async fn dispose(&mut self) -> anyhow::Result<()> {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(sender) = self.sender.take() {
            self.peer_connection
                .remove_track(&sender)
                .await
                .context("Failed to remove video track")?;
        }
        Ok(())
    }
}

/// Builds [`WebRtcPeer`]s with candidate relay wired up.
pub struct WebRtcPeerFactory;

#[async_trait]
impl PeerFactory for WebRtcPeerFactory {
    async fn create(
        &self,
        ice_servers: &[IceServerInfo],
        events: EventSender,
    ) -> anyhow::Result<Arc<dyn PeerEngine>> {
        let peer = WebRtcPeer::new(ice_servers)
            .await
            .context("Failed to create WebRTC peer")?;
        peer.relay_candidates(events);
        Ok(Arc::new(peer))
    }
}
