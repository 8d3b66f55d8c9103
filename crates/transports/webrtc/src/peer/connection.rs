//! WebRTC peer connection lifecycle
//!
//! [`PeerLink`] ties one `RTCPeerConnection` to its signaling connection and
//! session reporter. Local ICE candidates go through an
//! [`IceCandidateQueue`] until the remote description is set. Connection
//! state changes drive [`PeerConnectionState`]; `Failed` and `Closed` are
//! terminal and tear the session down through the [`SessionReporter`].

use super::candidates::IceCandidateQueue;
use crate::session::SessionReporter;
use crate::signaling::{munge_answer_sdp, SignalingEvent, SignalingSender};
use crate::{Error, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTCRtpHeaderExtensionCapability, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCPFeedback;

/// RTP payload type negotiated for VP8
pub const VP8_PAYLOAD_TYPE: u8 = 96;

/// Video RTP header extensions offered by both ends
pub const HEADER_EXTENSIONS: [&str; 8] = [
    "urn:ietf:params:rtp-hdrext:toffset",
    "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time",
    "urn:3gpp:video-orientation",
    "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01",
    "http://www.webrtc.org/experiments/rtp-hdrext/playout-delay",
    "http://www.webrtc.org/experiments/rtp-hdrext/video-content-type",
    "http://www.webrtc.org/experiments/rtp-hdrext/video-timing",
    "http://www.webrtc.org/experiments/rtp-hdrext/color-space",
];

/// VP8 capability shared by the media engine and the local video track
pub fn vp8_capability() -> RTCRtpCodecCapability {
    let feedback = |typ: &str, parameter: &str| RTCPFeedback {
        typ: typ.to_owned(),
        parameter: parameter.to_owned(),
    };
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_VP8.to_owned(),
        clock_rate: crate::media::VIDEO_CLOCK_RATE,
        channels: 0,
        sdp_fmtp_line: String::new(),
        rtcp_feedback: vec![
            feedback("goog-remb", ""),
            feedback("ccm", "fir"),
            feedback("nack", ""),
            feedback("nack", "pli"),
        ],
    }
}

/// Media engine with VP8 only and the video header extensions
///
/// `direction` restricts the header extensions: send-only on the sender,
/// receive-only on the receiver.
pub fn media_engine(direction: RTCRtpTransceiverDirection) -> Result<MediaEngine> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_codec(
            RTCRtpCodecParameters {
                capability: vp8_capability(),
                payload_type: VP8_PAYLOAD_TYPE,
                ..Default::default()
            },
            RTPCodecType::Video,
        )
        .map_err(|e| Error::WebRtcError(format!("Failed to register VP8: {}", e)))?;

    for uri in HEADER_EXTENSIONS {
        media_engine
            .register_header_extension(
                RTCRtpHeaderExtensionCapability {
                    uri: uri.to_owned(),
                },
                RTPCodecType::Video,
                Some(direction),
            )
            .map_err(|e| {
                Error::WebRtcError(format!("Failed to register header extension {}: {}", uri, e))
            })?;
    }
    Ok(media_engine)
}

/// Create a peer connection with the bridge's media engine and ICE servers
pub async fn new_peer_connection(
    ice_servers: &[String],
    direction: RTCRtpTransceiverDirection,
) -> Result<Arc<RTCPeerConnection>> {
    let mut media_engine = media_engine(direction)?;

    let interceptor_registry = register_default_interceptors(Registry::new(), &mut media_engine)
        .map_err(|e| Error::WebRtcError(format!("Failed to register interceptors: {}", e)))?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(interceptor_registry)
        .build();

    let ice_servers = if ice_servers.is_empty() {
        vec![]
    } else {
        vec![RTCIceServer {
            urls: ice_servers.to_vec(),
            ..Default::default()
        }]
    };
    let rtc_config = RTCConfiguration {
        ice_servers,
        ..Default::default()
    };

    let pc = api
        .new_peer_connection(rtc_config)
        .await
        .map_err(|e| Error::WebRtcError(format!("Failed to create peer connection: {}", e)))?;
    Ok(Arc::new(pc))
}

/// Bridge-level view of the peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    HaveLocalOffer,
    HaveRemoteOffer,
    Connected,
    /// Connectivity lost; ICE may still recover
    Disconnected,
    Failed,
    Closed,
}

impl PeerConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PeerConnectionState::Failed | PeerConnectionState::Closed)
    }

    /// State after the connection reported `event`, if it changes
    ///
    /// Terminal states absorb every event. `New`, `Connecting` and
    /// `Unspecified` carry no information for the bridge.
    pub fn on_connection_state(self, event: RTCPeerConnectionState) -> Option<Self> {
        if self.is_terminal() {
            return None;
        }
        let next = match event {
            RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
            RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
            _ => return None,
        };
        (next != self).then_some(next)
    }

    /// State after a local or remote offer was applied, if it changes
    pub fn on_offer(self, next: PeerConnectionState) -> Option<Self> {
        match self {
            PeerConnectionState::New => Some(next),
            _ => None,
        }
    }
}

/// One negotiated peer connection and its signaling
pub struct PeerLink {
    pc: Arc<RTCPeerConnection>,
    candidates: Arc<IceCandidateQueue<RTCIceCandidateInit>>,
    state: Arc<watch::Sender<PeerConnectionState>>,
    signaling: SignalingSender,
    reporter: SessionReporter,
}

impl PeerLink {
    /// Wire ICE and state callbacks on `pc`
    ///
    /// The peer connection is closed once the session's done signal closes.
    pub fn new(
        pc: Arc<RTCPeerConnection>,
        signaling: SignalingSender,
        reporter: SessionReporter,
    ) -> Arc<Self> {
        let candidates = Arc::new(IceCandidateQueue::new());
        let (state_tx, _) = watch::channel(PeerConnectionState::New);
        let state = Arc::new(state_tx);

        let ice_queue = Arc::clone(&candidates);
        let ice_signaling = signaling.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let ice_queue = Arc::clone(&ice_queue);
            let ice_signaling = ice_signaling.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!("ICE gathering complete");
                    return;
                };
                let init = match candidate.to_json() {
                    Ok(init) => init,
                    Err(e) => {
                        warn!("Failed to serialize local ICE candidate: {}", e);
                        return;
                    }
                };
                let sent = ice_queue.offer(init, |init| send_candidate(&ice_signaling, init));
                if !sent {
                    debug!("Queued local ICE candidate until remote description is set");
                }
            })
        }));

        let state_cb = Arc::clone(&state);
        let reporter_cb = reporter.clone();
        pc.on_peer_connection_state_change(Box::new(move |event: RTCPeerConnectionState| {
            let state = Arc::clone(&state_cb);
            let reporter = reporter_cb.clone();
            Box::pin(async move {
                info!(
                    session_id = reporter.session_id(),
                    "Peer connection state changed: {}", event
                );
                let mut next = None;
                state.send_if_modified(|current| match current.on_connection_state(event) {
                    Some(changed) => {
                        *current = changed;
                        next = Some(changed);
                        true
                    }
                    None => false,
                });
                match next {
                    Some(PeerConnectionState::Connected) => reporter.connected(),
                    Some(PeerConnectionState::Disconnected) => {
                        warn!(session_id = reporter.session_id(), "Peer connection disconnected")
                    }
                    Some(PeerConnectionState::Failed) => reporter.fail("peer connection failed"),
                    Some(PeerConnectionState::Closed) => reporter.close(),
                    _ => {}
                }
            })
        }));

        let teardown_pc = Arc::clone(&pc);
        let done = reporter.done().clone();
        tokio::spawn(async move {
            done.closed().await;
            if let Err(e) = teardown_pc.close().await {
                warn!("Failed to close peer connection: {}", e);
            }
            debug!("Peer connection closed");
        });

        Arc::new(Self {
            pc,
            candidates,
            state,
            signaling,
            reporter,
        })
    }

    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }

    pub fn reporter(&self) -> &SessionReporter {
        &self.reporter
    }

    pub fn state(&self) -> PeerConnectionState {
        *self.state.borrow()
    }

    fn enter(&self, next: PeerConnectionState) {
        self.state
            .send_if_modified(|current| match current.on_offer(next) {
                Some(changed) => {
                    *current = changed;
                    true
                }
                None => false,
            });
    }

    fn flush_candidates(&self) {
        let flushed = self
            .candidates
            .flush(|init| send_candidate(&self.signaling, init));
        if flushed > 0 {
            debug!(count = flushed, "Flushed queued ICE candidates");
        }
    }

    /// Create the offer, apply it locally and send it
    pub async fn create_offer(&self) -> Result<()> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create offer: {}", e)))?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;
        self.enter(PeerConnectionState::HaveLocalOffer);

        self.signaling.send_description(offer)?;
        info!(session_id = self.reporter.session_id(), "Sent offer");
        Ok(())
    }

    /// Apply the remote offer and answer it
    ///
    /// The answer is sent munged for trickle ICE; the unmodified answer is
    /// applied locally.
    pub async fn accept_offer(&self, offer: RTCSessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))?;
        self.flush_candidates();
        self.enter(PeerConnectionState::HaveRemoteOffer);

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create answer: {}", e)))?;

        let munged = RTCSessionDescription::answer(munge_answer_sdp(&answer.sdp))
            .map_err(|e| Error::SdpError(format!("Failed to rebuild answer: {}", e)))?;
        self.signaling.send_description(munged)?;
        info!(session_id = self.reporter.session_id(), "Sent answer");

        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))
    }

    /// Apply the remote answer to our offer
    pub async fn apply_answer(&self, answer: RTCSessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))?;
        self.flush_candidates();
        info!(session_id = self.reporter.session_id(), "Applied answer");
        Ok(())
    }

    pub async fn add_remote_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
        debug!(candidate = %candidate.candidate, "Adding remote ICE candidate");
        self.pc
            .add_ice_candidate(candidate)
            .await
            .map_err(|e| Error::IceCandidateError(format!("Failed to add ICE candidate: {}", e)))
    }
}

fn send_candidate(signaling: &SignalingSender, init: RTCIceCandidateInit) {
    if let Err(e) = signaling.send_candidate(init) {
        debug!("Dropping local ICE candidate: {}", e);
    }
}

/// Feed signaling events into `link` until the session ends
///
/// An SDP failure fails the session; a bad remote candidate is logged and
/// skipped. The session is reported closed when signaling goes away.
pub async fn drive_signaling(link: Arc<PeerLink>, mut events: mpsc::UnboundedReceiver<SignalingEvent>) {
    let done = link.reporter().done().clone();
    loop {
        let event = tokio::select! {
            _ = done.closed() => break,
            event = events.recv() => event,
        };
        match event {
            Some(SignalingEvent::Description(desc)) => {
                let result = match desc.sdp_type {
                    RTCSdpType::Offer => link.accept_offer(desc).await,
                    RTCSdpType::Answer => link.apply_answer(desc).await,
                    other => {
                        warn!("Ignoring {} session description", other);
                        Ok(())
                    }
                };
                if let Err(e) = result {
                    link.reporter().fail(e.to_string());
                    break;
                }
            }
            Some(SignalingEvent::Candidate(candidate)) => {
                if let Err(e) = link.add_remote_candidate(candidate).await {
                    warn!("{}", e);
                }
            }
            Some(SignalingEvent::Configure(setup)) => {
                debug!(stream_id = %setup.stream_id, "Ignoring configure after setup");
            }
            Some(SignalingEvent::Closed) | None => break,
        }
    }
    debug!(state = ?link.state(), "Signaling driver stopped");
    link.reporter().close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{DoneSignal, SessionEvent};
    use crate::signaling::protocol::OutboundMessage;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    const STEP: Duration = Duration::from_secs(5);
    const QUEUED_CANDIDATE: &str = "candidate:1 1 udp 2130706431 10.0.0.1 5000 typ host";

    fn link_for(
        pc: Arc<RTCPeerConnection>,
    ) -> (
        Arc<PeerLink>,
        mpsc::UnboundedReceiver<OutboundMessage>,
        mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        let (signaling, outbox) = SignalingSender::detached();
        let (reporter, outcomes) = SessionReporter::new("test", DoneSignal::new());
        (PeerLink::new(pc, signaling, reporter), outbox, outcomes)
    }

    fn queued_candidate() -> RTCIceCandidateInit {
        RTCIceCandidateInit {
            candidate: QUEUED_CANDIDATE.to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    async fn next_outbound(outbox: &mut mpsc::UnboundedReceiver<OutboundMessage>) -> OutboundMessage {
        timeout(STEP, outbox.recv())
            .await
            .expect("timed out waiting for outbound signaling")
            .expect("outbox closed")
    }

    fn expect_description(msg: OutboundMessage, sdp_type: RTCSdpType) -> RTCSessionDescription {
        match msg {
            OutboundMessage::Description(desc) if desc.sdp_type == sdp_type => desc,
            other => panic!("expected {} description, got {:?}", sdp_type, other),
        }
    }

    fn expect_queued_candidate(msg: OutboundMessage) {
        match msg {
            OutboundMessage::Candidate(c) => assert_eq!(c.candidate, QUEUED_CANDIDATE),
            other => panic!("expected queued candidate, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bad_remote_description_fails_session() {
        let pc = new_peer_connection(&[], RTCRtpTransceiverDirection::Recvonly)
            .await
            .unwrap();
        let (link, _outbox, mut outcomes) = link_for(pc);
        let done = link.reporter().done().clone();

        let (events_tx, events) = mpsc::unbounded_channel();
        let offer: RTCSessionDescription =
            serde_json::from_value(json!({"type": "offer", "sdp": "v=0\r\n"})).unwrap();
        events_tx.send(SignalingEvent::Description(offer)).unwrap();

        timeout(STEP, drive_signaling(Arc::clone(&link), events))
            .await
            .expect("driver did not stop after the failure");

        match outcomes.recv().await {
            Some(SessionEvent::Failed(reason)) => {
                assert!(reason.contains("Failed to set remote description"), "{}", reason)
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert!(done.is_closed());
        // The closing report after the driver stops is swallowed
        assert!(outcomes.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_offer_answer_flushes_queued_candidates() {
        let offerer_pc = new_peer_connection(&[], RTCRtpTransceiverDirection::Sendonly)
            .await
            .unwrap();
        offerer_pc.create_data_channel("data", None).await.unwrap();
        let answerer_pc = new_peer_connection(&[], RTCRtpTransceiverDirection::Recvonly)
            .await
            .unwrap();
        let (offerer, mut offerer_out, _offerer_outcomes) = link_for(offerer_pc);
        let (answerer, mut answerer_out, _answerer_outcomes) = link_for(answerer_pc);

        for link in [&offerer, &answerer] {
            let sent = link
                .candidates
                .offer(queued_candidate(), |_| panic!("sent before remote description"));
            assert!(!sent);
        }

        offerer.create_offer().await.unwrap();
        assert_eq!(offerer.state(), PeerConnectionState::HaveLocalOffer);
        assert!(!offerer.candidates.is_remote_set());
        let offer = expect_description(next_outbound(&mut offerer_out).await, RTCSdpType::Offer);

        answerer.accept_offer(offer).await.unwrap();
        assert_eq!(answerer.state(), PeerConnectionState::HaveRemoteOffer);
        assert!(answerer.candidates.is_remote_set());
        // Queued candidates go out ahead of the answer
        expect_queued_candidate(next_outbound(&mut answerer_out).await);
        let answer = expect_description(next_outbound(&mut answerer_out).await, RTCSdpType::Answer);
        assert!(answer.sdp.contains("a=ice-options:trickle"));

        offerer.apply_answer(answer).await.unwrap();
        assert!(offerer.candidates.is_remote_set());
        assert_eq!(offerer.candidates.pending_len(), 0);
        expect_queued_candidate(next_outbound(&mut offerer_out).await);

        offerer.reporter().close();
        answerer.reporter().close();
    }

    #[tokio::test]
    async fn test_closed_connection_ends_session() {
        let pc = new_peer_connection(&[], RTCRtpTransceiverDirection::Recvonly)
            .await
            .unwrap();
        let (link, _outbox, mut outcomes) = link_for(Arc::clone(&pc));

        pc.close().await.unwrap();

        assert_eq!(
            timeout(STEP, outcomes.recv()).await.unwrap(),
            Some(SessionEvent::Closed)
        );
        assert_eq!(link.state(), PeerConnectionState::Closed);
        assert!(link.reporter().done().is_closed());
    }

    #[tokio::test]
    async fn test_session_end_closes_peer_connection() {
        let pc = new_peer_connection(&[], RTCRtpTransceiverDirection::Sendonly)
            .await
            .unwrap();
        let (link, _outbox, mut outcomes) = link_for(Arc::clone(&pc));

        link.reporter().fail("supervisor gave up");
        assert_eq!(
            outcomes.recv().await,
            Some(SessionEvent::Failed("supervisor gave up".to_string()))
        );

        timeout(STEP, async {
            while pc.connection_state() != RTCPeerConnectionState::Closed {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("peer connection was not closed");
    }

    #[test]
    fn test_connected_then_failed() {
        let s = PeerConnectionState::New;
        let s = s
            .on_connection_state(RTCPeerConnectionState::Connected)
            .unwrap();
        assert_eq!(s, PeerConnectionState::Connected);
        let s = s.on_connection_state(RTCPeerConnectionState::Failed).unwrap();
        assert!(s.is_terminal());
    }

    #[test]
    fn test_terminal_states_absorb() {
        for terminal in [PeerConnectionState::Failed, PeerConnectionState::Closed] {
            for event in [
                RTCPeerConnectionState::Connected,
                RTCPeerConnectionState::Disconnected,
                RTCPeerConnectionState::Failed,
                RTCPeerConnectionState::Closed,
            ] {
                assert_eq!(terminal.on_connection_state(event), None);
            }
            assert_eq!(terminal.on_offer(PeerConnectionState::HaveLocalOffer), None);
        }
    }

    #[test]
    fn test_uninformative_events_ignored() {
        let s = PeerConnectionState::HaveLocalOffer;
        assert_eq!(s.on_connection_state(RTCPeerConnectionState::New), None);
        assert_eq!(s.on_connection_state(RTCPeerConnectionState::Connecting), None);
        assert_eq!(s.on_connection_state(RTCPeerConnectionState::Unspecified), None);
    }

    #[test]
    fn test_disconnected_can_recover() {
        let s = PeerConnectionState::Connected
            .on_connection_state(RTCPeerConnectionState::Disconnected)
            .unwrap();
        assert!(!s.is_terminal());
        assert_eq!(
            s.on_connection_state(RTCPeerConnectionState::Connected),
            Some(PeerConnectionState::Connected)
        );
    }

    #[test]
    fn test_offer_only_from_new() {
        assert_eq!(
            PeerConnectionState::New.on_offer(PeerConnectionState::HaveRemoteOffer),
            Some(PeerConnectionState::HaveRemoteOffer)
        );
        assert_eq!(
            PeerConnectionState::Connected.on_offer(PeerConnectionState::HaveLocalOffer),
            None
        );
    }

    #[test]
    fn test_media_engine_builds() {
        assert!(media_engine(RTCRtpTransceiverDirection::Sendonly).is_ok());
        assert!(media_engine(RTCRtpTransceiverDirection::Recvonly).is_ok());
    }

    #[test]
    fn test_vp8_capability() {
        let cap = vp8_capability();
        assert_eq!(cap.mime_type, MIME_TYPE_VP8);
        assert_eq!(cap.clock_rate, 90_000);
        assert!(cap.rtcp_feedback.iter().any(|f| f.typ == "nack" && f.parameter == "pli"));
    }
}
