//! webrtc-rs backed peer connections.
//!
//! Each local track becomes a `TrackLocalStaticSample`; whatever produces the
//! encoded frames writes them through [`WebRtcPeer::sample_track`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use duet_protocol::{CandidateInit, MediaKind};
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::config::IceServer;
use crate::error::{CandidateError, PeerError};
use crate::media::{
    ConnectionStatus, EncodingParameters, LocalMedia, PeerConnection, PeerConnectionFactory,
    PeerEvent, SdpKind, SessionDescription, TransportStats,
};

fn backend(err: impl std::fmt::Display) -> PeerError {
    PeerError::Backend(err.to_string())
}

fn status_from(state: RTCPeerConnectionState) -> ConnectionStatus {
    match state {
        RTCPeerConnectionState::Connecting => ConnectionStatus::Connecting,
        RTCPeerConnectionState::Connected => ConnectionStatus::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionStatus::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionStatus::Failed,
        RTCPeerConnectionState::Closed => ConnectionStatus::Closed,
        _ => ConnectionStatus::New,
    }
}

pub struct WebRtcPeerFactory {
    api: API,
    ice_servers: Vec<IceServer>,
}

impl WebRtcPeerFactory {
    pub fn new(ice_servers: Vec<IceServer>) -> Result<Self, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(backend)?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(backend)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api, ice_servers })
    }

    fn configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcPeerFactory {
    async fn create(
        &self,
        media: Arc<dyn LocalMedia>,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.configuration())
                .await
                .map_err(backend)?,
        );

        let mut tracks = HashMap::new();
        for track in media.tracks() {
            let mime_type = match track.kind {
                MediaKind::Audio => MIME_TYPE_OPUS,
                MediaKind::Video => MIME_TYPE_VP8,
            };
            let local = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: mime_type.to_owned(),
                    ..Default::default()
                },
                track.id.clone(),
                "duet".to_owned(),
            ));
            pc.add_track(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(backend)?;
            tracks.insert(track.kind, local);
        }

        let candidate_tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = candidate_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(PeerEvent::LocalCandidate(CandidateInit {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(err) => {
                        tracing::warn!(target = "duet::webrtc", error = %err, "candidate encode failed");
                    }
                }
            })
        }));

        let status_tx = events;
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = status_tx.clone();
            Box::pin(async move {
                tracing::debug!(target = "duet::webrtc", state = %state, "peer connection state");
                let _ = tx.send(PeerEvent::Status(status_from(state)));
            })
        }));

        Ok(Arc::new(WebRtcPeer {
            pc,
            tracks,
            encoding: Mutex::new(None),
        }))
    }
}

pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    tracks: HashMap<MediaKind, Arc<TrackLocalStaticSample>>,
    encoding: Mutex<Option<EncodingParameters>>,
}

impl WebRtcPeer {
    pub fn sample_track(&self, kind: MediaKind) -> Option<Arc<TrackLocalStaticSample>> {
        self.tracks.get(&kind).cloned()
    }

    /// Most recent target from the bitrate controller. The encoder feeding
    /// `sample_track` reads this to pace its output.
    pub fn encoding_target(&self) -> Option<EncodingParameters> {
        *self.encoding.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self.pc.create_offer(None).await.map_err(backend)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self.pc.create_answer(None).await.map_err(backend)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), PeerError> {
        let description = to_rtc(description)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(backend)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        let description = to_rtc(description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(backend)
    }

    async fn add_candidate(&self, candidate: CandidateInit) -> Result<(), CandidateError> {
        if self.pc.connection_state() == RTCPeerConnectionState::Closed {
            return Err(CandidateError::PathClosed);
        }
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|err| CandidateError::Rejected(err.to_string()))
    }

    async fn sample_stats(&self) -> Result<TransportStats, PeerError> {
        let report = self.pc.get_stats().await;
        let mut stats = TransportStats::default();
        let mut local_candidate = None;
        for entry in report.reports.values() {
            match entry {
                StatsReportType::CandidatePair(pair) if pair.nominated => {
                    if pair.current_round_trip_time > 0.0 {
                        stats.round_trip_time =
                            Some(Duration::from_secs_f64(pair.current_round_trip_time));
                    }
                    local_candidate = Some(pair.local_candidate_id.clone());
                }
                StatsReportType::OutboundRTP(outbound) if outbound.kind == "video" => {
                    stats.packets_sent += outbound.packets_sent;
                }
                StatsReportType::RemoteInboundRTP(remote) if remote.kind == "video" => {
                    stats.packets_lost += remote.packets_lost.max(0) as u64;
                }
                _ => {}
            }
        }
        if let Some(id) = local_candidate {
            if let Some(StatsReportType::LocalCandidate(candidate)) = report.reports.get(&id) {
                stats.relayed = candidate.candidate_type == RTCIceCandidateType::Relay;
            }
        }
        Ok(stats)
    }

    async fn apply_encoding(&self, parameters: EncodingParameters) -> Result<(), PeerError> {
        tracing::debug!(
            target = "duet::webrtc",
            max_bitrate_bps = parameters.max_bitrate_bps,
            max_framerate = ?parameters.max_framerate,
            "encoding target updated"
        );
        *self.encoding.lock().unwrap_or_else(PoisonError::into_inner) = Some(parameters);
        Ok(())
    }

    async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            tracing::debug!(target = "duet::webrtc", error = %err, "peer close failed");
        }
    }
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp).map_err(backend),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp).map_err(backend),
    }
}
