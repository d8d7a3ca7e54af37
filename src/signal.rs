use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// Fixed part played by a peer in a negotiation pair. Exactly one peer of a pair is
/// [Role::Polite]; roles are assigned by configuration and never negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Yields to the remote offer on collision, rolling back its own pending offer.
    Polite,
    /// Ignores remote offers on collision.
    Impolite,
}

impl Role {
    pub fn counterpart(&self) -> Role {
        match self {
            Role::Polite => Role::Impolite,
            Role::Impolite => Role::Polite,
        }
    }

    pub fn is_polite(&self) -> bool {
        *self == Role::Polite
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Polite => f.write_str("polite"),
            Role::Impolite => f.write_str("impolite"),
        }
    }
}

/// Identity of a peer as seen by the signaling relay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct PeerId(Arc<str>);

impl PeerId {
    pub fn new(id: &str) -> Self {
        PeerId(Arc::from(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        PeerId::new(value)
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        PeerId(Arc::from(value))
    }
}

impl From<PeerId> for String {
    fn from(value: PeerId) -> Self {
        value.0.to_string()
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session description exchanged between peers. The body is opaque to the negotiation logic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    #[serde(rename = "sdp")]
    pub body: String,
}

impl SessionDescription {
    pub fn offer<S: Into<String>>(body: S) -> Self {
        SessionDescription {
            kind: SdpKind::Offer,
            body: body.into(),
        }
    }

    pub fn answer<S: Into<String>>(body: S) -> Self {
        SessionDescription {
            kind: SdpKind::Answer,
            body: body.into(),
        }
    }

    pub fn is_offer(&self) -> bool {
        self.kind == SdpKind::Offer
    }
}

/// Unit of exchange over the signaling relay. Immutable once sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingMessage {
    pub sender: PeerId,
    pub description: SessionDescription,
}

impl SignalingMessage {
    pub fn new(sender: PeerId, description: SessionDescription) -> Self {
        SignalingMessage {
            sender,
            description,
        }
    }

    pub fn kind(&self) -> SdpKind {
        self.description.kind
    }

    /// Encodes the message the way the relay fans it out to subscribers:
    /// `{"user": "<peer>", "sdp": "{\"type\":\"offer\",\"sdp\":\"...\"}"}`.
    /// The inner description is a JSON document embedded as a string.
    pub fn to_wire(&self) -> Result<String, Error> {
        let sdp = serde_json::to_string(&self.description)?;
        let wire = WireMessage {
            user: self.sender.clone(),
            sdp: WireSdp::Encoded(sdp),
        };
        Ok(serde_json::to_string(&wire)?)
    }

    /// Decodes a message in either the double-encoded shape produced by [Self::to_wire] or the
    /// plain nested shape peers post to the relay.
    pub fn from_wire(data: &str) -> Result<Self, Error> {
        let wire: WireMessage = serde_json::from_str(data)?;
        let description = match wire.sdp {
            WireSdp::Encoded(inner) => serde_json::from_str(&inner)?,
            WireSdp::Plain(description) => description,
        };
        Ok(SignalingMessage {
            sender: wire.user,
            description,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    user: PeerId,
    sdp: WireSdp,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum WireSdp {
    Encoded(String),
    Plain(SessionDescription),
}
