//! In-memory doubles of the connection capability used by unit tests.

use crate::connection::{
    Channel, Connection, ConnectionEvent, ConnectionFactory, ConnectionState, SignalingState,
};
use crate::error::Error;
use crate::relay::SignalingChannel;
use crate::signal::{Role, SdpKind, SessionDescription, SignalingMessage};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Semaphore;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Debug)]
struct ScriptedState {
    signaling: SignalingState,
    connection: ConnectionState,
    local: Option<SessionDescription>,
    offers: usize,
    mutations: usize,
    fail_create_answer: bool,
    reject_rollback: bool,
    fail_create_data_channel: bool,
}

/// Connection which follows the offer/answer state transitions without any transport.
pub struct ScriptedConnection {
    pub id: usize,
    state: Mutex<ScriptedState>,
    events_tx: UnboundedSender<ConnectionEvent>,
    events: Mutex<Option<UnboundedReceiver<ConnectionEvent>>>,
    pub channels: Mutex<Vec<Arc<ScriptedChannel>>>,
}

impl ScriptedConnection {
    pub fn new(id: usize) -> Arc<Self> {
        let (events_tx, events) = unbounded_channel();
        Arc::new(ScriptedConnection {
            id,
            state: Mutex::new(ScriptedState {
                signaling: SignalingState::Stable,
                connection: ConnectionState::New,
                local: None,
                offers: 0,
                mutations: 0,
                fail_create_answer: false,
                reject_rollback: false,
                fail_create_data_channel: false,
            }),
            events_tx,
            events: Mutex::new(Some(events)),
            channels: Mutex::new(Vec::new()),
        })
    }

    /// Number of set-local/set-remote description calls so far.
    pub fn mutations(&self) -> usize {
        self.state.lock().mutations
    }

    pub fn force_signaling_state(&self, s: SignalingState) {
        self.state.lock().signaling = s;
    }

    pub fn fail_create_answer(&self, fail: bool) {
        self.state.lock().fail_create_answer = fail;
    }

    /// Makes remote offers fail while a local offer is pending, like webrtc does.
    pub fn reject_rollback(&self, reject: bool) {
        self.state.lock().reject_rollback = reject;
    }

    pub fn fail_create_data_channel(&self, fail: bool) {
        self.state.lock().fail_create_data_channel = fail;
    }

    pub fn emit(&self, event: ConnectionEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn set_connection_state(&self, s: ConnectionState) {
        self.state.lock().connection = s;
        self.emit(ConnectionEvent::StateChanged(s));
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().signaling == SignalingState::Closed
    }

    pub fn channel(&self, i: usize) -> Option<Arc<ScriptedChannel>> {
        self.channels.lock().get(i).cloned()
    }
}

#[async_trait]
impl Connection for ScriptedConnection {
    async fn create_offer(&self) -> Result<SessionDescription, Error> {
        let mut state = self.state.lock();
        state.offers += 1;
        Ok(SessionDescription::offer(format!(
            "offer-{}-{}",
            self.id, state.offers
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, Error> {
        let state = self.state.lock();
        if state.fail_create_answer {
            return Err(Error::Rejected("create answer failed".into()));
        }
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(Error::Rejected("no remote offer".into()));
        }
        Ok(SessionDescription::answer(format!("answer-{}", self.id)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), Error> {
        let mut state = self.state.lock();
        state.mutations += 1;
        state.signaling = match (desc.kind, state.signaling) {
            (SdpKind::Offer, SignalingState::Stable) => SignalingState::HaveLocalOffer,
            (SdpKind::Answer, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
            (kind, s) => {
                return Err(Error::Rejected(format!("set local {:?} in {:?}", kind, s)));
            }
        };
        state.local = Some(desc);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), Error> {
        let mut state = self.state.lock();
        if state.reject_rollback
            && desc.kind == SdpKind::Offer
            && state.signaling == SignalingState::HaveLocalOffer
        {
            return Err(Error::RollbackUnsupported);
        }
        state.mutations += 1;
        state.signaling = match (desc.kind, state.signaling) {
            // pending local offer is rolled back implicitly
            (SdpKind::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                SignalingState::HaveRemoteOffer
            }
            (SdpKind::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
            (kind, s) => {
                return Err(Error::Rejected(format!("set remote {:?} in {:?}", kind, s)));
            }
        };
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    fn connection_state(&self) -> ConnectionState {
        self.state.lock().connection
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn Channel>, Error> {
        if self.state.lock().fail_create_data_channel {
            return Err(Error::Rejected("data channel creation failed".into()));
        }
        let channel = Arc::new(ScriptedChannel::new(label));
        self.channels.lock().push(channel.clone());
        // first channel requires negotiation, like in a real peer connection
        self.emit(ConnectionEvent::NegotiationNeeded);
        Ok(channel)
    }

    fn take_events(&self) -> Option<UnboundedReceiver<ConnectionEvent>> {
        self.events.lock().take()
    }

    async fn close(&self) -> Result<(), Error> {
        let mut state = self.state.lock();
        state.signaling = SignalingState::Closed;
        state.connection = ConnectionState::Closed;
        Ok(())
    }
}

pub struct ScriptedChannel {
    label: String,
    open: AtomicBool,
    broken: AtomicBool,
    pub sent: AtomicUsize,
    pub closed: AtomicBool,
}

impl ScriptedChannel {
    pub fn new(label: &str) -> Self {
        ScriptedChannel {
            label: label.to_string(),
            open: AtomicBool::new(true),
            broken: AtomicBool::new(false),
            sent: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Simulates a remote peer vanishing without closing: the channel still reports being open,
    /// but every send fails.
    pub fn break_silently(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    /// Simulates a remote peer closing the channel, e.g. on a page reload.
    pub fn close_remotely(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Channel for ScriptedChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn send(&self, _data: Bytes) -> Result<(), Error> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(Error::channel_closed());
        }
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory handing out [ScriptedConnection]s and remembering all of them.
#[derive(Default)]
pub struct ScriptedFactory {
    pub created: Mutex<Vec<Arc<ScriptedConnection>>>,
    reject_rollback: AtomicBool,
    fail_data_channels: AtomicBool,
}

impl ScriptedFactory {
    /// Connections created from now on refuse to roll back a pending local offer.
    pub fn reject_rollback(&self, reject: bool) {
        self.reject_rollback.store(reject, Ordering::SeqCst);
    }

    /// Connections created from now on fail to open data channels.
    pub fn fail_data_channels(&self, fail: bool) {
        self.fail_data_channels.store(fail, Ordering::SeqCst);
    }

    pub fn count(&self) -> usize {
        self.created.lock().len()
    }

    pub fn last(&self) -> Option<Arc<ScriptedConnection>> {
        self.created.lock().last().cloned()
    }
}

#[async_trait]
impl ConnectionFactory for ScriptedFactory {
    async fn connect(&self, _role: Role) -> Result<Arc<dyn Connection>, Error> {
        let mut created = self.created.lock();
        let conn = ScriptedConnection::new(created.len());
        conn.reject_rollback(self.reject_rollback.load(Ordering::SeqCst));
        conn.fail_create_data_channel(self.fail_data_channels.load(Ordering::SeqCst));
        created.push(conn.clone());
        Ok(conn)
    }
}

/// Signaling channel recording published messages. Publishing can be held back with
/// [RecordingChannel::hold] until permits are released.
#[derive(Default)]
pub struct RecordingChannel {
    pub published: Mutex<Vec<SignalingMessage>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

impl RecordingChannel {
    pub fn hold(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock() = Some(gate.clone());
        gate
    }

    pub fn published(&self) -> Vec<SignalingMessage> {
        self.published.lock().clone()
    }
}

#[async_trait]
impl SignalingChannel for RecordingChannel {
    async fn publish(&self, msg: SignalingMessage) -> Result<(), Error> {
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            let _permit = gate
                .acquire()
                .await
                .map_err(|_| Error::RelayUnavailable("gate closed".into()))?;
        }
        self.published.lock().push(msg);
        Ok(())
    }

    fn subscribe(&self) -> Result<BoxStream<'static, SignalingMessage>, Error> {
        Err(Error::RelayUnavailable("recording channel has no subscribers".into()))
    }
}
