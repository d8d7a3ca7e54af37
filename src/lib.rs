//! `perfect-negotiation` keeps a WebRTC connection between two peers alive over an unreliable
//! signaling relay, using the [perfect negotiation](https://w3c.github.io/webrtc-pc/#perfect-negotiation-example)
//! pattern:
//! - Both peers may start (or restart) negotiation at any time. Colliding offers are resolved by
//!   a fixed [Role]: the impolite peer ignores them, the polite one yields.
//! - The signaling relay reflects every message to its sender and keeps the last offer of the
//!   impolite peer for a polite peer which joins late.
//! - Connections which die silently are detected by a liveness probe and replaced with fresh
//!   ones, within a bounded restart budget.
//!
//! Negotiation logic works against the [Connection] capability, so it can be driven by the
//! [webrtc](https://webrtc.rs) backed [RtcConnection] as well as by any other implementation.
//!
//! # Examples
//!
//! ```rust,no_run
//! use perfect_negotiation::{
//!     Config, Error, Options, Relay, RelayChannel, Role, RtcConnectionFactory, Session,
//!     SessionOptions,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     // both peers share the same in-process relay channel
//!     let relay = Arc::new(Relay::new());
//!     relay.register("tab-1".into(), Role::Impolite);
//!     relay.register("tab-2".into(), Role::Polite);
//!
//!     let factory = Arc::new(RtcConnectionFactory::new(Options::local()));
//!     let mut sessions = Vec::new();
//!     for config in [
//!         Config::new(Role::Impolite, "tab-1", "testchannel"),
//!         Config::new(Role::Polite, "tab-2", "testchannel"),
//!     ] {
//!         let signaling = Arc::new(RelayChannel::new(relay.clone(), &config.relay_address));
//!         let session =
//!             Session::start(config, SessionOptions::default(), factory.clone(), signaling)
//!                 .await?;
//!         sessions.push(session);
//!     }
//!
//!     for session in sessions.iter() {
//!         session.connected().await?;
//!     }
//!     // data channel opened by the impolite peer shows up on the polite side
//!     let dc = sessions[1].data_channels().next().await.unwrap();
//!     assert_eq!(dc.label(), "chat");
//!
//!     for session in sessions.iter() {
//!         session.close().await?;
//!     }
//!     Ok(())
//! }
//! ```

pub mod bootstrap;
pub mod connection;
pub mod data_channel;
pub mod error;
pub mod liveness;
pub mod negotiation;
pub mod offer_cache;
pub mod peer_connection;
pub mod relay;
pub mod session;
pub mod signal;
#[cfg(test)]
mod testing;

pub use connection::{Channel, Connection, ConnectionEvent, ConnectionFactory};
pub use data_channel::DataChannel;
pub use error::Error;
pub use liveness::{LivenessMonitor, RestartPolicy};
pub use negotiation::{NegotiationOutcome, Negotiator};
pub use offer_cache::OfferCache;
pub use peer_connection::{Options, RtcConnection, RtcConnectionFactory};
pub use relay::{Relay, RelayChannel, SignalingChannel};
pub use session::{Config, Session, SessionOptions, SessionStatus};
pub use signal::{PeerId, Role, SdpKind, SessionDescription, SignalingMessage};
