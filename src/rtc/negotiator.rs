//! Offer/answer exchange with the server over `POST /offer`.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::ice::candidate::CandidatePairState;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::stats::StatsReportType;

use super::latency::{RttEntry, RttSource};
use super::{TransportEvents, TransportSignal};
use crate::api::ServerApi;
use crate::config::WebRtcConfig;
use crate::error::NegotiationError;
use crate::protocol::OfferRequest;
use crate::session::{SessionId, TrackKind};

/// The established transport, as far as the coordinator needs to see it.
#[async_trait]
pub trait TransportHandle: Send + Sync {
    /// RTT figures currently exposed by the stats report.
    async fn rtt_entries(&self) -> anyhow::Result<Vec<RttEntry>>;
    async fn close(&self);
}

pub struct Negotiated {
    pub session: SessionId,
    pub transport: Arc<dyn TransportHandle>,
}

impl std::fmt::Debug for Negotiated {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Negotiated")
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Negotiator: Send + Sync {
    /// Sets up a receive-only transport and exchanges descriptions with the
    /// server. No transport outlives a failed call.
    async fn negotiate(
        &self,
        use_relay: bool,
        events: TransportEvents,
    ) -> Result<Negotiated, NegotiationError>;
}

pub struct RtcNegotiator {
    api: ServerApi,
    webrtc: WebRtcConfig,
}

impl RtcNegotiator {
    pub fn new(api: ServerApi, webrtc: WebRtcConfig) -> Self {
        Self { api, webrtc }
    }

    /// STUN servers in priority order followed by the TURN relay, or
    /// nothing at all for host-only negotiation.
    pub fn ice_servers(&self, use_relay: bool) -> Vec<RTCIceServer> {
        if !use_relay {
            return Vec::new();
        }
        let mut servers: Vec<RTCIceServer> = self
            .webrtc
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();
        let turn = &self.webrtc.turn_server;
        if !turn.url.is_empty() {
            servers.push(RTCIceServer {
                urls: vec![turn.url.clone()],
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            });
        }
        servers
    }

    async fn build_peer(&self, use_relay: bool) -> Result<Arc<RTCPeerConnection>, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: self.ice_servers(use_relay),
            ..Default::default()
        };
        Ok(Arc::new(api.new_peer_connection(rtc_config).await?))
    }

    async fn exchange(&self, pc: &RTCPeerConnection) -> Result<SessionId, NegotiationError> {
        for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
            pc.add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await?;
        }

        let offer = pc
            .create_offer(None)
            .await
            .map_err(|e| NegotiationError::Description(e.to_string()))?;
        pc.set_local_description(offer.clone())
            .await
            .map_err(|e| NegotiationError::Description(e.to_string()))?;

        // Candidates keep trickling in after this; gathering is not awaited.
        let local = pc.local_description().await.unwrap_or(offer);
        let answer = self
            .api
            .post_offer(&OfferRequest {
                sdp: local.sdp,
                sdp_type: "offer".to_string(),
            })
            .await?;

        if answer.sdp_type != "answer" {
            return Err(NegotiationError::Malformed(format!(
                "expected an answer, got '{}'",
                answer.sdp_type
            )));
        }
        let remote = RTCSessionDescription::answer(answer.sdp)
            .map_err(|e| NegotiationError::Malformed(e.to_string()))?;
        pc.set_remote_description(remote)
            .await
            .map_err(|e| NegotiationError::Description(e.to_string()))?;

        Ok(answer.sessionid)
    }
}

#[async_trait]
impl Negotiator for RtcNegotiator {
    async fn negotiate(
        &self,
        use_relay: bool,
        events: TransportEvents,
    ) -> Result<Negotiated, NegotiationError> {
        let pc = self.build_peer(use_relay).await?;
        install_callbacks(&pc, events);

        match self.exchange(&pc).await {
            Ok(session) => {
                info!("Negotiated session {} (relay: {})", session, use_relay);
                Ok(Negotiated {
                    session,
                    transport: Arc::new(RtcTransport { pc }),
                })
            }
            Err(e) => {
                if let Err(close_err) = pc.close().await {
                    warn!("Failed to close peer connection after failed negotiation: {}", close_err);
                }
                Err(e)
            }
        }
    }
}

fn install_callbacks(pc: &RTCPeerConnection, events: TransportEvents) {
    let peer_events = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let events = peer_events.clone();
        info!("Peer connection state: {}", state);
        Box::pin(async move {
            events.emit(TransportSignal::Peer(state.into())).await;
        })
    }));

    let ice_events = events.clone();
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        let events = ice_events.clone();
        info!("ICE connection state: {}", state);
        Box::pin(async move {
            events.emit(TransportSignal::Ice(state.into())).await;
        })
    }));

    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let events = events.clone();
        Box::pin(async move {
            let kind = match track.kind() {
                RTPCodecType::Audio => TrackKind::Audio,
                RTPCodecType::Video => TrackKind::Video,
                _ => return,
            };
            info!(
                "Remote {:?} track attached: {}",
                kind,
                track.codec().capability.mime_type
            );
            events.emit(TransportSignal::TrackAttached(kind)).await;

            // Rendering is out of scope; keep the receive buffers drained.
            tokio::spawn(async move {
                while track.read_rtp().await.is_ok() {}
                debug!("Remote {:?} track ended", kind);
            });
        })
    }));
}

struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl TransportHandle for RtcTransport {
    async fn rtt_entries(&self) -> anyhow::Result<Vec<RttEntry>> {
        let report = self.pc.get_stats().await;
        Ok(report.reports.values().filter_map(rtt_entry).collect())
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!("Failed to close peer connection: {}", e);
        }
    }
}

/// Maps one stats entry to an RTT figure, if it carries one.
fn rtt_entry(report: &StatsReportType) -> Option<RttEntry> {
    match report {
        StatsReportType::CandidatePair(pair) => {
            if !matches!(pair.state, CandidatePairState::Succeeded | CandidatePairState::InProgress) {
                return None;
            }
            let rtt = if pair.current_round_trip_time > 0.0 {
                pair.current_round_trip_time
            } else {
                pair.total_round_trip_time
            };
            Some(RttEntry::new(RttSource::CandidatePair, rtt))
        }
        StatsReportType::RemoteInboundRTP(stats) => stats
            .round_trip_time
            .map(|rtt| RttEntry::new(RttSource::InboundStream, rtt)),
        StatsReportType::RemoteOutboundRTP(stats) => stats
            .round_trip_time
            .map(|rtt| RttEntry::new(RttSource::InboundStream, rtt)),
        _ => None,
    }
}
