//! Perfect negotiation controller.
//!
//! Both peers may decide to (re)negotiate at any time, including at the same moment. When the
//! offers of both sides collide ("glare"), the outcome is decided by a fixed [Role]:
//! - the [Role::Impolite] peer ignores the colliding remote offer and waits for its own offer
//!   to be answered,
//! - the [Role::Polite] peer rolls its own pending offer back and answers the remote one.
//!
//! See <https://w3c.github.io/webrtc-pc/#perfect-negotiation-example>.

use crate::connection::{Connection, SignalingState};
use crate::error::Error;
use crate::relay::SignalingChannel;
use crate::signal::{PeerId, Role, SessionDescription, SignalingMessage};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Local offer lifecycle. Orthogonal to the [SignalingState] reported by the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferState {
    Idle,
    /// Offer was requested and is not yet published. A polite peer accepting a remote offer
    /// in this state supersedes it: the offer is never published.
    CreatingOffer,
    /// Terminal, every further negotiation event is drained without effect.
    Closed,
}

/// Snapshot of the negotiation state of a single peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiationState {
    pub role: Role,
    pub offer: OfferState,
    pub signaling: SignalingState,
}

impl NegotiationState {
    pub fn making_offer(&self) -> bool {
        self.offer == OfferState::CreatingOffer
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// Message published by this peer and reflected back by the relay.
    SelfReflection,
    /// Remote offer collided with a local one and this peer is impolite.
    Glare,
    /// Negotiator has been closed.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationOutcome {
    /// Local offer has been applied and published.
    OfferSent,
    /// Negotiation was requested while an offer/answer exchange was still in progress.
    Suppressed,
    /// Remote offer has been applied and answered.
    Answered,
    /// Remote answer has been applied.
    AnswerApplied,
    Discarded(DiscardReason),
}

/// Counters of negotiation decisions, mostly useful for tests and diagnostics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NegotiationStats {
    pub offers_sent: u64,
    pub answers_sent: u64,
    pub answers_applied: u64,
    pub suppressed: u64,
    pub reflected: u64,
    pub glare_ignored: u64,
    pub failures: u64,
}

impl NegotiationStats {
    /// Number of inbound messages deliberately dropped.
    pub fn discarded(&self) -> u64 {
        self.reflected + self.glare_ignored
    }
}

/// Drives the offer/answer lifecycle of a single [Connection].
///
/// [Negotiator::on_negotiation_needed] and [Negotiator::on_remote_message] are mutually
/// exclusive: the connection is only ever mutated by one of them at a time. Publishing to the
/// signaling channel happens outside of that critical section.
pub struct Negotiator {
    role: Role,
    peer_id: PeerId,
    conn: Arc<dyn Connection>,
    signaling: Arc<dyn SignalingChannel>,
    offer: Mutex<OfferState>,
    /// Cancels the publish of the offer in flight. Only replaced under the `offer` lock.
    in_flight: parking_lot::Mutex<Option<Arc<CancellationToken>>>,
    stats: parking_lot::Mutex<NegotiationStats>,
}

impl Negotiator {
    pub fn new(
        role: Role,
        peer_id: PeerId,
        conn: Arc<dyn Connection>,
        signaling: Arc<dyn SignalingChannel>,
    ) -> Self {
        Negotiator {
            role,
            peer_id,
            conn,
            signaling,
            offer: Mutex::new(OfferState::Idle),
            in_flight: parking_lot::Mutex::new(None),
            stats: parking_lot::Mutex::new(NegotiationStats::default()),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.conn
    }

    pub async fn state(&self) -> NegotiationState {
        let offer = *self.offer.lock().await;
        NegotiationState {
            role: self.role,
            offer,
            signaling: self.conn.signaling_state(),
        }
    }

    pub fn stats(&self) -> NegotiationStats {
        *self.stats.lock()
    }

    pub async fn is_closed(&self) -> bool {
        *self.offer.lock().await == OfferState::Closed
    }

    /// Creates a local offer, applies it and publishes it to the remote peer.
    ///
    /// The request is suppressed when the connection is in the middle of another exchange:
    /// a remote offer being answered supersedes it and the connection is expected to request
    /// negotiation again once stable. The same applies to a remote offer accepted while this
    /// offer is still being published.
    pub async fn on_negotiation_needed(&self) -> Result<NegotiationOutcome, Error> {
        let superseded = Arc::new(CancellationToken::new());
        let offer = {
            let mut state = self.offer.lock().await;
            if *state == OfferState::Closed {
                return Ok(NegotiationOutcome::Discarded(DiscardReason::Closed));
            }
            let signaling = self.conn.signaling_state();
            if signaling != SignalingState::Stable {
                log::debug!(
                    "{} peer '{}' suppresses negotiation in {:?} state",
                    self.role,
                    self.peer_id,
                    signaling
                );
                self.stats.lock().suppressed += 1;
                return Ok(NegotiationOutcome::Suppressed);
            }
            *state = OfferState::CreatingOffer;
            *self.in_flight.lock() = Some(superseded.clone());
            match self.apply_local_offer().await {
                Ok(offer) => offer,
                Err(e) => {
                    *state = OfferState::Idle;
                    self.in_flight.lock().take();
                    return Err(self.failed(e));
                }
            }
        };

        let msg = SignalingMessage::new(self.peer_id.clone(), offer);
        let published = tokio::select! {
            biased;
            _ = superseded.cancelled() => None,
            result = self.signaling.publish(msg) => Some(result),
        };
        {
            let mut state = self.offer.lock().await;
            let mut in_flight = self.in_flight.lock();
            // a superseded offer has already been cleared, a newer one may be in flight now
            if in_flight
                .as_ref()
                .map_or(false, |token| Arc::ptr_eq(token, &superseded))
            {
                in_flight.take();
                if *state == OfferState::CreatingOffer {
                    *state = OfferState::Idle;
                }
            }
        }
        let Some(published) = published else {
            log::debug!(
                "{} peer '{}' dropped its offer superseded by a remote one",
                self.role,
                self.peer_id
            );
            self.stats.lock().suppressed += 1;
            return Ok(NegotiationOutcome::Suppressed);
        };
        published?;
        log::debug!("{} peer '{}' published an offer", self.role, self.peer_id);
        self.stats.lock().offers_sent += 1;
        Ok(NegotiationOutcome::OfferSent)
    }

    async fn apply_local_offer(&self) -> Result<SessionDescription, Error> {
        let offer = self.conn.create_offer().await?;
        self.conn.set_local_description(offer.clone()).await?;
        Ok(self.conn.local_description().await.unwrap_or(offer))
    }

    /// Handles a message received from the signaling channel.
    ///
    /// Messages reflected from this peer are dropped. Remote offers colliding with a local
    /// offer are dropped by the impolite peer and applied by the polite one. Applied offers
    /// are answered.
    pub async fn on_remote_message(
        &self,
        msg: SignalingMessage,
    ) -> Result<NegotiationOutcome, Error> {
        if msg.sender == self.peer_id {
            log::trace!("'{}' dropped its own reflected message", self.peer_id);
            self.stats.lock().reflected += 1;
            return Ok(NegotiationOutcome::Discarded(DiscardReason::SelfReflection));
        }

        let answer = {
            let mut state = self.offer.lock().await;
            if *state == OfferState::Closed {
                return Ok(NegotiationOutcome::Discarded(DiscardReason::Closed));
            }
            let is_offer = msg.description.is_offer();
            let making_offer = *state == OfferState::CreatingOffer;
            let offer_collision =
                is_offer && (making_offer || self.conn.signaling_state() != SignalingState::Stable);
            if offer_collision {
                if self.role == Role::Impolite {
                    log::info!(
                        "impolite peer '{}' ignores colliding offer from '{}'",
                        self.peer_id,
                        msg.sender
                    );
                    self.stats.lock().glare_ignored += 1;
                    return Ok(NegotiationOutcome::Discarded(DiscardReason::Glare));
                }
                log::info!(
                    "polite peer '{}' yields to colliding offer from '{}'",
                    self.peer_id,
                    msg.sender
                );
            }

            if let Err(e) = self.conn.set_remote_description(msg.description).await {
                return Err(self.failed(e));
            }
            if is_offer && making_offer {
                // own offer got rolled back, it must not reach the remote peer anymore
                if let Some(superseded) = self.in_flight.lock().take() {
                    superseded.cancel();
                }
                *state = OfferState::Idle;
            }
            if !is_offer {
                self.stats.lock().answers_applied += 1;
                return Ok(NegotiationOutcome::AnswerApplied);
            }
            match self.apply_local_answer().await {
                Ok(answer) => answer,
                Err(e) => return Err(self.failed(e)),
            }
        };

        let msg = SignalingMessage::new(self.peer_id.clone(), answer);
        self.signaling.publish(msg).await?;
        self.stats.lock().answers_sent += 1;
        Ok(NegotiationOutcome::Answered)
    }

    async fn apply_local_answer(&self) -> Result<SessionDescription, Error> {
        let answer = self.conn.create_answer().await?;
        self.conn.set_local_description(answer.clone()).await?;
        Ok(self.conn.local_description().await.unwrap_or(answer))
    }

    /// Moves the negotiator into its terminal state and closes the underlying connection.
    /// Further negotiation events are ignored.
    pub async fn close(&self) -> Result<(), Error> {
        {
            let mut state = self.offer.lock().await;
            if *state == OfferState::Closed {
                return Ok(());
            }
            *state = OfferState::Closed;
            if let Some(in_flight) = self.in_flight.lock().take() {
                in_flight.cancel();
            }
        }
        self.conn.close().await
    }

    fn failed(&self, e: Error) -> Error {
        log::warn!(
            "{} peer '{}' negotiation step failed: {}",
            self.role,
            self.peer_id,
            e
        );
        self.stats.lock().failures += 1;
        e
    }
}

impl std::fmt::Debug for Negotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Negotiator")
            .field("role", &self.role)
            .field("peer_id", &self.peer_id)
            .field("signaling_state", &self.conn.signaling_state())
            .finish()
    }
}
