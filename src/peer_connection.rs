use crate::connection::{
    Channel, Connection, ConnectionEvent, ConnectionFactory, ConnectionState, SignalingState,
};
use crate::data_channel::DataChannel;
use crate::error::Error;
use crate::signal::{Role, SdpKind, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Formatter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;

/// [Connection] implementation backed by a webrtc [RTCPeerConnection].
///
/// Local descriptions are published with all ICE candidates gathered, since candidates are
/// never trickled over the signaling relay.
pub struct RtcConnection {
    pc: Arc<RTCPeerConnection>,
    role: Role,
    options: Options,
    events: Mutex<Option<UnboundedReceiver<ConnectionEvent>>>,
}

impl RtcConnection {
    /// Creates a new peer connection and wires its callbacks into a [ConnectionEvent] stream,
    /// available through [Connection::take_events].
    pub async fn start(role: Role, options: Options) -> Result<Self, Error> {
        // Create a MediaEngine object to configure the supported codec
        let mut media_engine = MediaEngine::default();

        // Register default codecs
        media_engine.register_default_codecs()?;

        // Interceptor registry must be created per peer connection. It provides NACKs,
        // RTCP reports and other features of the RTP/RTCP pipeline.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let peer_connection = Arc::new(api.new_peer_connection(options.rtc_config.clone()).await?);
        let (events_tx, events) = unbounded_channel();

        {
            let events = events_tx.clone();
            peer_connection.on_peer_connection_state_change(Box::new(move |s| {
                let state = ConnectionState::from(s);
                log::debug!("peer connection state changed to {:?}", state);
                let _ = events.send(ConnectionEvent::StateChanged(state));
                Box::pin(async move {})
            }));
        }
        {
            peer_connection.on_signaling_state_change(Box::new(move |s| {
                log::trace!("signaling state changed to {}", s);
                Box::pin(async move {})
            }));
        }
        {
            let events = events_tx.clone();
            peer_connection.on_negotiation_needed(Box::new(move || {
                let _ = events.send(ConnectionEvent::NegotiationNeeded);
                Box::pin(async move {})
            }));
        }
        {
            let events = events_tx;
            peer_connection.on_data_channel(Box::new(move |dc| {
                log::debug!("remote peer opened data channel '{}'", dc.label());
                let channel: Arc<dyn Channel> = Arc::new(DataChannel::new(dc));
                let _ = events.send(ConnectionEvent::DataChannel(channel));
                Box::pin(async move {})
            }));
        }

        Ok(RtcConnection {
            pc: peer_connection,
            role,
            options,
            events: Mutex::new(Some(events)),
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Rolls the pending local offer back. Fails with [Error::RollbackUnsupported] when the
    /// underlying peer connection refuses the transition, in which case the connection has to
    /// be replaced to accept a remote offer.
    async fn rollback_local_offer(&self) -> Result<(), Error> {
        if let Some(pending) = self.pc.pending_local_description().await {
            log::debug!("{} peer rolls back its pending local offer", self.role);
            // rollback descriptions can only be produced through deserialization
            let rollback: RTCSessionDescription = serde_json::from_value(serde_json::json!({
                "type": "rollback",
                "sdp": pending.sdp,
            }))?;
            if let Err(e) = self.pc.set_local_description(rollback).await {
                log::debug!("{} peer can't roll back its offer: {}", self.role, e);
                return Err(Error::RollbackUnsupported);
            }
        }
        Ok(())
    }

    async fn gather_candidates(&self, desc: RTCSessionDescription) -> Result<(), Error> {
        let mut gather_complete = self.pc.gathering_complete_promise().await;
        self.pc.set_local_description(desc).await?;
        if tokio::time::timeout(self.options.gather_timeout, gather_complete.recv())
            .await
            .is_err()
        {
            log::warn!(
                "ICE gathering did not complete within {:?}, publishing partial candidates",
                self.options.gather_timeout
            );
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for RtcConnection {
    async fn create_offer(&self) -> Result<SessionDescription, Error> {
        let offer = self.pc.create_offer(None).await?;
        offer.try_into()
    }

    async fn create_answer(&self) -> Result<SessionDescription, Error> {
        let answer = self.pc.create_answer(None).await?;
        answer.try_into()
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), Error> {
        self.gather_candidates(desc.try_into()?).await
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), Error> {
        if desc.is_offer() && self.pc.signaling_state() == RTCSignalingState::HaveLocalOffer {
            self.rollback_local_offer().await?;
        }
        self.pc.set_remote_description(desc.try_into()?).await?;
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let desc = self.pc.local_description().await?;
        desc.try_into().ok()
    }

    fn signaling_state(&self) -> SignalingState {
        SignalingState::from(self.pc.signaling_state())
    }

    fn connection_state(&self) -> ConnectionState {
        ConnectionState::from(self.pc.connection_state())
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn Channel>, Error> {
        let init = self.options.labels.get(label).cloned().flatten();
        let dc = self.pc.create_data_channel(label, init).await?;
        Ok(Arc::new(DataChannel::new(dc)))
    }

    fn take_events(&self) -> Option<UnboundedReceiver<ConnectionEvent>> {
        self.events.lock().take()
    }

    async fn close(&self) -> Result<(), Error> {
        self.pc.close().await?;
        Ok(())
    }
}

impl AsRef<RTCPeerConnection> for RtcConnection {
    fn as_ref(&self) -> &RTCPeerConnection {
        &self.pc
    }
}

impl std::fmt::Debug for RtcConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtcConnection")
            .field("role", &self.role)
            .field("signaling_state", &self.pc.signaling_state())
            .field("connection_state", &self.pc.connection_state())
            .finish()
    }
}

/// Creates [RtcConnection]s sharing the same [Options].
#[derive(Clone, Default)]
pub struct RtcConnectionFactory {
    options: Options,
}

impl RtcConnectionFactory {
    pub fn new(options: Options) -> Self {
        RtcConnectionFactory { options }
    }
}

#[async_trait]
impl ConnectionFactory for RtcConnectionFactory {
    async fn connect(&self, role: Role) -> Result<Arc<dyn Connection>, Error> {
        let conn = RtcConnection::start(role, self.options.clone()).await?;
        Ok(Arc::new(conn))
    }
}

#[derive(Clone)]
pub struct Options {
    /// Optional per-label configuration of data channels created by this side.
    pub labels: HashMap<Arc<str>, Option<RTCDataChannelInit>>,
    pub rtc_config: RTCConfiguration,
    /// Upper bound of the wait for ICE gathering before a local description is published.
    pub gather_timeout: Duration,
}

impl Options {
    pub fn with_data_channels(labels: &[&str]) -> Self {
        let rtc_config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: vec!["stun:stun.l.google.com:19302".to_owned()],
                ..Default::default()
            }],
            ..Default::default()
        };
        Options {
            labels: labels
                .iter()
                .map(|&label| (Arc::from(label), None))
                .collect(),
            rtc_config,
            gather_timeout: Duration::from_secs(5),
        }
    }

    /// Options without any ICE servers, usable for peers on the same host.
    pub fn local() -> Self {
        Options {
            rtc_config: RTCConfiguration::default(),
            ..Options::default()
        }
    }
}

impl Default for Options {
    fn default() -> Self {
        Options::with_data_channels(&[])
    }
}

impl TryFrom<RTCSessionDescription> for SessionDescription {
    type Error = Error;

    fn try_from(value: RTCSessionDescription) -> Result<Self, Self::Error> {
        let kind = match value.sdp_type {
            RTCSdpType::Offer => SdpKind::Offer,
            RTCSdpType::Answer => SdpKind::Answer,
            other => {
                return Err(Error::Rejected(format!(
                    "unsupported session description type: {}",
                    other
                )))
            }
        };
        Ok(SessionDescription {
            kind,
            body: value.sdp,
        })
    }
}

impl TryFrom<SessionDescription> for RTCSessionDescription {
    type Error = Error;

    fn try_from(value: SessionDescription) -> Result<Self, Self::Error> {
        let desc = match value.kind {
            SdpKind::Offer => RTCSessionDescription::offer(value.body)?,
            SdpKind::Answer => RTCSessionDescription::answer(value.body)?,
        };
        Ok(desc)
    }
}

impl From<RTCSignalingState> for SignalingState {
    fn from(value: RTCSignalingState) -> Self {
        match value {
            RTCSignalingState::Unspecified | RTCSignalingState::Stable => SignalingState::Stable,
            RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveRemotePranswer => {
                SignalingState::HaveLocalOffer
            }
            RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveLocalPranswer => {
                SignalingState::HaveRemoteOffer
            }
            RTCSignalingState::Closed => SignalingState::Closed,
        }
    }
}

impl From<RTCPeerConnectionState> for ConnectionState {
    fn from(value: RTCPeerConnectionState) -> Self {
        match value {
            RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => {
                ConnectionState::New
            }
            RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
            RTCPeerConnectionState::Connected => ConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => ConnectionState::Failed,
            RTCPeerConnectionState::Closed => ConnectionState::Closed,
        }
    }
}
