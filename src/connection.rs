//! Connection capability consumed by the negotiation core.
//!
//! The negotiation logic never performs ICE, DTLS or SCTP work itself. It drives an
//! implementation of [Connection] (see [crate::peer_connection::RtcConnection] for the webrtc
//! backed one) and reacts to the [ConnectionEvent]s it emits.

use crate::error::Error;
use crate::signal::{Role, SessionDescription};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

/// Offer/answer state of a connection, as reported by the connection itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Events emitted by a [Connection]. There is exactly one consumer of this stream per
/// connection instance, see [Connection::take_events].
pub enum ConnectionEvent {
    /// New local state (track, data channel) must be advertised to the remote peer.
    NegotiationNeeded,
    StateChanged(ConnectionState),
    /// Remote peer opened a data channel.
    DataChannel(Arc<dyn Channel>),
}

impl std::fmt::Debug for ConnectionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionEvent::NegotiationNeeded => f.write_str("NegotiationNeeded"),
            ConnectionEvent::StateChanged(s) => f.debug_tuple("StateChanged").field(s).finish(),
            ConnectionEvent::DataChannel(dc) => {
                f.debug_tuple("DataChannel").field(&dc.label()).finish()
            }
        }
    }
}

#[async_trait]
pub trait Connection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, Error>;

    async fn create_answer(&self) -> Result<SessionDescription, Error>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), Error>;

    /// Applies a remote description. When a remote offer arrives while a local offer is pending,
    /// implementations must roll the local offer back before applying the remote one.
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), Error>;

    /// Current local description. May differ from the one passed to
    /// [Connection::set_local_description], e.g. once ICE candidates were gathered into it.
    async fn local_description(&self) -> Option<SessionDescription>;

    fn signaling_state(&self) -> SignalingState;

    fn connection_state(&self) -> ConnectionState;

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn Channel>, Error>;

    /// Takes the event stream of this connection. Only the first call returns `Some`.
    fn take_events(&self) -> Option<UnboundedReceiver<ConnectionEvent>>;

    async fn close(&self) -> Result<(), Error>;
}

/// Data channel handle owned by a session. Replaced wholesale whenever the session restarts.
#[async_trait]
pub trait Channel: Send + Sync {
    fn label(&self) -> &str;

    fn is_open(&self) -> bool;

    /// True once the channel is closing or closed, either side having closed it.
    fn is_closed(&self) -> bool;

    async fn send(&self, data: Bytes) -> Result<(), Error>;

    async fn close(&self) -> Result<(), Error>;
}

/// Creates fresh connections, both on session start and after a dead connection was detected.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self, role: Role) -> Result<Arc<dyn Connection>, Error>;
}
