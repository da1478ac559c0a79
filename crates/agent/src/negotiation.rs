use std::sync::Arc;

use anyhow::Context;
use sharecast_protocol::{IceCandidateRecord, SessionDescription, SignalingEnvelope};
use tracing::{debug, info};

use crate::engine::{AttachedTrack, FrameSource, PeerEngine};
use crate::session::{Session, Transition};

/// Owns the peer connection for one session and produces the envelopes the
/// offer/answer exchange needs.
pub struct NegotiationController {
    device_id: String,
    peer: Option<Arc<dyn PeerEngine>>,
    track: Option<Box<dyn AttachedTrack>>,
}

impl NegotiationController {
    pub fn new(device_id: impl Into<String>, peer: Arc<dyn PeerEngine>) -> Self {
        Self {
            device_id: device_id.into(),
            peer: Some(peer),
            track: None,
        }
    }

    fn peer(&self) -> anyhow::Result<&Arc<dyn PeerEngine>> {
        self.peer.as_ref().context("Peer connection already closed")
    }

    /// Attach the capture output as the outgoing video track. Only one track
    /// is ever attached.
    pub async fn attach(&mut self, source: FrameSource) -> anyhow::Result<()> {
        if self.track.is_some() {
            debug!("Video track already attached");
            return Ok(());
        }
        let track = self
            .peer()?
            .add_track(source)
            .await
            .context("Failed to attach video track")?;
        self.track = Some(track);
        info!("Video track attached");
        Ok(())
    }

    /// Create the offer if the session is ready for one.
    ///
    /// `offerSent` is latched before the engine is asked for an offer, so a
    /// failed or slow offer still never produces a second one.
    pub async fn maybe_create_offer(
        &self,
        session: &mut Session,
    ) -> anyhow::Result<Option<SignalingEnvelope>> {
        if !session.offer_ready() {
            return Ok(None);
        }
        let peer = self.peer()?;
        if !session.apply(Transition::OfferSent) {
            return Ok(None);
        }

        let offer = peer.create_offer().await.context("Failed to create offer")?;
        peer.set_local_description(offer.clone())
            .await
            .context("Failed to set local description")?;
        info!(device_id = %self.device_id, "Offer created");

        Ok(Some(SignalingEnvelope::Offer {
            device_id: self.device_id.clone(),
            sdp: offer,
        }))
    }

    /// Apply the viewer's answer. Returns `false` once the peer is gone.
    pub async fn apply_answer(&self, sdp: SessionDescription) -> anyhow::Result<bool> {
        let Some(peer) = &self.peer else {
            debug!("Ignoring answer, peer connection closed");
            return Ok(false);
        };
        peer.set_remote_description(sdp)
            .await
            .context("Failed to set remote description")?;
        Ok(true)
    }

    /// Hand a remote candidate straight to the engine, whether or not the
    /// remote description has been applied yet.
    pub async fn apply_candidate(&self, candidate: IceCandidateRecord) -> anyhow::Result<()> {
        let Some(peer) = &self.peer else {
            debug!("Ignoring candidate, peer connection closed");
            return Ok(());
        };
        peer.add_ice_candidate(candidate)
            .await
            .context("Failed to add ICE candidate")
    }

    /// Wrap a locally gathered candidate for the signaling server.
    pub fn local_candidate(&self, candidate: IceCandidateRecord) -> SignalingEnvelope {
        SignalingEnvelope::Candidate {
            device_id: Some(self.device_id.clone()),
            candidate,
        }
    }

    /// Give up the track and peer for teardown. Later calls are no-ops.
    pub fn release(&mut self) -> (Option<Box<dyn AttachedTrack>>, Option<Arc<dyn PeerEngine>>) {
        (self.track.take(), self.peer.take())
    }
}
