use crate::signal::{PeerId, SdpKind, SignalingMessage};
use arc_swap::ArcSwapOption;
use std::sync::Arc;

/// Single-slot store of the most recent offer sent by the impolite peer.
///
/// It lets a polite peer which subscribed to the relay after that offer was published still
/// receive it: the first offer the polite peer sends triggers a replay of the cached message.
/// Writes overwrite (last write wins) and reads clear the slot, both atomically.
#[derive(Debug, Default)]
pub struct OfferCache {
    slot: ArcSwapOption<SignalingMessage>,
}

impl OfferCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Caches `msg` if it's an offer, replacing any previously cached one.
    /// Returns false if message was not an offer and therefore was not recorded.
    pub fn record(&self, msg: SignalingMessage) -> bool {
        if msg.kind() != SdpKind::Offer {
            return false;
        }
        log::trace!("caching offer from '{}' for late joiners", msg.sender);
        self.slot.store(Some(Arc::new(msg)));
        true
    }

    /// Atomically takes the cached offer out of the slot.
    pub fn take(&self) -> Option<SignalingMessage> {
        let msg = self.slot.swap(None)?;
        Some(Arc::try_unwrap(msg).unwrap_or_else(|msg| (*msg).clone()))
    }

    /// Called when the polite peer publishes a message of a given kind. Returns the offer which
    /// should be replayed to the channel, if any. Each cached offer is replayed at most once.
    pub fn on_polite_offer(&self, sender: &PeerId, kind: SdpKind) -> Option<SignalingMessage> {
        if kind != SdpKind::Offer {
            return None;
        }
        let replay = self.take()?;
        log::debug!(
            "replaying offer from '{}' to late joining peer '{}'",
            replay.sender,
            sender
        );
        Some(replay)
    }

    /// Drops the cached offer once the polite peer answered it.
    pub fn acknowledge(&self) {
        if self.slot.swap(None).is_some() {
            log::trace!("cached offer acknowledged");
        }
    }

    pub fn peek(&self) -> Option<SignalingMessage> {
        self.slot.load_full().map(|msg| (*msg).clone())
    }

    pub fn is_empty(&self) -> bool {
        self.slot.load().is_none()
    }

    pub fn clear(&self) {
        self.slot.store(None);
    }
}
