//! In-process signaling relay: a pub/sub hub fanning JSON messages out to every subscriber of
//! a channel, the sender included.

use crate::error::Error;
use crate::offer_cache::OfferCache;
use crate::signal::{PeerId, Role, SdpKind, SignalingMessage};
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

const DEFAULT_CAPACITY: usize = 256;

/// Signaling channel as seen by a single peer.
///
/// Delivery is at-least-once, with no ordering guarantee across senders. Every published
/// message is reflected back to the publisher's own subscription.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn publish(&self, msg: SignalingMessage) -> Result<(), Error>;

    /// Subscribes to all messages published after this call. The stream ends when the
    /// relay shuts down.
    fn subscribe(&self) -> Result<BoxStream<'static, SignalingMessage>, Error>;
}

#[derive(Clone)]
struct Topic {
    sender: broadcast::Sender<Arc<str>>,
    cache: Arc<OfferCache>,
}

impl Topic {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Topic {
            sender,
            cache: Arc::new(OfferCache::new()),
        }
    }
}

/// Relay hub. Each named channel has its own subscribers and its own [OfferCache].
///
/// Peers are registered with their [Role], so that the relay knows whose offers should be
/// kept for late joiners.
pub struct Relay {
    topics: RwLock<HashMap<String, Topic>>,
    roles: RwLock<HashMap<PeerId, Role>>,
    capacity: usize,
    closed: AtomicBool,
}

impl Relay {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates a relay, which buffers up to `capacity` messages per channel for slow subscribers.
    pub fn with_capacity(capacity: usize) -> Self {
        Relay {
            topics: RwLock::new(HashMap::new()),
            roles: RwLock::new(HashMap::new()),
            capacity,
            closed: AtomicBool::new(false),
        }
    }

    pub fn register(&self, peer: PeerId, role: Role) {
        log::debug!("relay registered '{}' as {} peer", peer, role);
        self.roles.write().insert(peer, role);
    }

    pub fn role_of(&self, peer: &PeerId) -> Option<Role> {
        self.roles.read().get(peer).copied()
    }

    /// Returns the late-joiner offer cache of a given channel.
    pub fn cache(&self, channel: &str) -> Arc<OfferCache> {
        self.topic(channel).cache
    }

    /// Accepts a raw JSON body, the way an HTTP endpoint would receive it from a peer, and
    /// publishes the decoded message to the channel.
    pub fn post(&self, channel: &str, body: &str) -> Result<(), Error> {
        let msg = SignalingMessage::from_wire(body)?;
        self.publish(channel, msg)
    }

    /// Publishes a message to every subscriber of the channel.
    ///
    /// Offers of the impolite peer are kept for late joiners. The first offer of the polite peer
    /// replays the kept offer (if any) before being fanned out itself. An answer of the polite
    /// peer acknowledges the kept offer, which is then dropped.
    pub fn publish(&self, channel: &str, msg: SignalingMessage) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::RelayUnavailable("relay is closed".into()));
        }
        let topic = self.topic(channel);
        match self.role_of(&msg.sender) {
            Some(Role::Impolite) => {
                topic.cache.record(msg.clone());
            }
            Some(Role::Polite) if msg.kind() == SdpKind::Answer => {
                topic.cache.acknowledge();
            }
            Some(Role::Polite) => {
                if let Some(replay) = topic.cache.on_polite_offer(&msg.sender, msg.kind()) {
                    Self::fan_out(channel, &topic, &replay)?;
                }
            }
            None => {}
        }
        Self::fan_out(channel, &topic, &msg)
    }

    /// Subscribes to the encoded frames of a channel, as they would be pushed to a remote client.
    pub fn subscribe_raw(&self, channel: &str) -> Result<broadcast::Receiver<Arc<str>>, Error> {
        if self.is_closed() {
            return Err(Error::RelayUnavailable("relay is closed".into()));
        }
        Ok(self.topic(channel).sender.subscribe())
    }

    /// Subscribes to the decoded messages of a channel. Frames which cannot be decoded are
    /// skipped.
    pub fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, SignalingMessage>, Error> {
        let receiver = self.subscribe_raw(channel)?;
        let channel: Arc<str> = Arc::from(channel);
        let stream = stream::unfold(receiver, move |mut receiver| {
            let channel = channel.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok(frame) => match SignalingMessage::from_wire(&frame) {
                            Ok(msg) => return Some((msg, receiver)),
                            Err(e) => {
                                log::warn!("skipping malformed frame on '{}': {}", channel, e)
                            }
                        },
                        Err(RecvError::Lagged(n)) => {
                            log::warn!("subscriber of '{}' lagged behind by {} messages", channel, n)
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(stream.boxed())
    }

    /// Shuts the relay down. All subscriptions end and further publishes fail.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.topics.write().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn topic(&self, channel: &str) -> Topic {
        if let Some(topic) = self.topics.read().get(channel) {
            return topic.clone();
        }
        let mut topics = self.topics.write();
        topics
            .entry(channel.to_string())
            .or_insert_with(|| Topic::new(self.capacity))
            .clone()
    }

    fn fan_out(channel: &str, topic: &Topic, msg: &SignalingMessage) -> Result<(), Error> {
        let frame: Arc<str> = Arc::from(msg.to_wire()?);
        // nobody listening is not a failure, the message is simply lost
        if topic.sender.send(frame).is_err() {
            log::trace!("no subscribers on '{}', message from '{}' dropped", channel, msg.sender);
        }
        Ok(())
    }
}

impl Default for Relay {
    fn default() -> Self {
        Relay::new()
    }
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("channels", &self.topics.read().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// [SignalingChannel] bound to a single channel of a [Relay].
#[derive(Debug, Clone)]
pub struct RelayChannel {
    relay: Arc<Relay>,
    channel: Arc<str>,
}

impl RelayChannel {
    pub fn new(relay: Arc<Relay>, channel: &str) -> Self {
        RelayChannel {
            relay,
            channel: Arc::from(channel),
        }
    }

    pub fn name(&self) -> &str {
        &self.channel
    }
}

#[async_trait]
impl SignalingChannel for RelayChannel {
    async fn publish(&self, msg: SignalingMessage) -> Result<(), Error> {
        self.relay.publish(&self.channel, msg)
    }

    fn subscribe(&self) -> Result<BoxStream<'static, SignalingMessage>, Error> {
        self.relay.subscribe(&self.channel)
    }
}

#[cfg(test)]
mod test {
    use crate::error::Error;
    use crate::relay::{Relay, RelayChannel, SignalingChannel};
    use crate::signal::{PeerId, Role, SessionDescription, SignalingMessage};
    use futures_util::StreamExt;
    use std::sync::Arc;
    use std::time::Duration;

    fn relay() -> Arc<Relay> {
        let relay = Arc::new(Relay::new());
        relay.register("impolite".into(), Role::Impolite);
        relay.register("polite".into(), Role::Polite);
        relay
    }

    fn msg(sender: &str, desc: SessionDescription) -> SignalingMessage {
        SignalingMessage::new(sender.into(), desc)
    }

    #[tokio::test]
    async fn publisher_receives_its_own_messages() -> Result<(), Error> {
        let channel = RelayChannel::new(relay(), "testchannel");
        let mut sub = channel.subscribe()?;
        let m = msg("impolite", SessionDescription::offer("O1"));
        channel.publish(m.clone()).await?;
        assert_eq!(sub.next().await, Some(m));
        Ok(())
    }

    #[tokio::test]
    async fn late_joiner_gets_latest_impolite_offer_once() -> Result<(), Error> {
        let relay = relay();
        relay.publish("testchannel", msg("impolite", SessionDescription::offer("A")))?;
        relay.publish("testchannel", msg("impolite", SessionDescription::offer("B")))?;

        let mut sub = relay.subscribe("testchannel")?;
        let p1 = msg("polite", SessionDescription::offer("P1"));
        relay.publish("testchannel", p1.clone())?;
        let p2 = msg("polite", SessionDescription::offer("P2"));
        relay.publish("testchannel", p2.clone())?;

        assert_eq!(
            sub.next().await,
            Some(msg("impolite", SessionDescription::offer("B")))
        );
        assert_eq!(sub.next().await, Some(p1));
        assert_eq!(sub.next().await, Some(p2));
        assert!(relay.cache("testchannel").is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn polite_answer_acknowledges_cached_offer() -> Result<(), Error> {
        let relay = relay();
        relay.publish("testchannel", msg("impolite", SessionDescription::offer("A")))?;
        relay.publish("testchannel", msg("polite", SessionDescription::answer("R")))?;
        assert!(relay.cache("testchannel").is_empty());

        let mut sub = relay.subscribe("testchannel")?;
        let p = msg("polite", SessionDescription::offer("P"));
        relay.publish("testchannel", p.clone())?;
        assert_eq!(sub.next().await, Some(p));
        Ok(())
    }

    #[tokio::test]
    async fn caches_are_scoped_per_channel() -> Result<(), Error> {
        let relay = relay();
        relay.publish("a", msg("impolite", SessionDescription::offer("A")))?;
        assert!(relay.cache("b").is_empty());
        assert!(!relay.cache("a").is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn post_fans_out_double_encoded_frames() -> Result<(), Error> {
        let relay = relay();
        let mut raw = relay.subscribe_raw("testchannel")?;
        relay.post(
            "testchannel",
            r#"{"user":"polite","sdp":{"type":"answer","sdp":"v=0"}}"#,
        )?;
        let frame = raw.recv().await.expect("frame");
        let value: serde_json::Value = serde_json::from_str(&frame)?;
        assert_eq!(value["user"], "polite");
        assert!(value["sdp"].is_string());
        let decoded = SignalingMessage::from_wire(&frame)?;
        assert_eq!(decoded.sender, PeerId::new("polite"));

        assert!(matches!(
            relay.post("testchannel", "{}"),
            Err(Error::Codec(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn closed_relay_ends_subscriptions() -> Result<(), Error> {
        let relay = relay();
        let mut sub = relay.subscribe("testchannel")?;
        relay.close();
        let next = tokio::time::timeout(Duration::from_secs(1), sub.next())
            .await
            .expect("stream should end");
        assert_eq!(next, None);
        assert!(matches!(
            relay.publish("testchannel", msg("polite", SessionDescription::answer("R"))),
            Err(Error::RelayUnavailable(_))
        ));
        assert!(relay.subscribe("testchannel").is_err());
        Ok(())
    }
}
