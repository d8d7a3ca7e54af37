use crate::connection::{Channel, Connection, ConnectionEvent, ConnectionFactory, ConnectionState};
use crate::error::Error;
use crate::liveness::{LivenessMonitor, Probe, RestartDecision, RestartPolicy};
use crate::negotiation::{NegotiationOutcome, Negotiator};
use crate::relay::SignalingChannel;
use crate::signal::{PeerId, Role, SignalingMessage};
use arc_swap::ArcSwap;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Bootstrap parameters of a single peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub role: Role,
    pub peer_id: PeerId,
    /// Address of the relay channel this peer publishes to and subscribes on.
    pub relay_address: String,
}

impl Config {
    pub fn new<P: Into<PeerId>>(role: Role, peer_id: P, relay_address: &str) -> Self {
        Config {
            role,
            peer_id: peer_id.into(),
            relay_address: relay_address.to_string(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(json)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    /// Label of the data channel created by this side on every (re)start.
    pub channel_label: String,
    /// How often the active data channel is probed for liveness.
    pub probe_interval: Duration,
    pub restart: RestartPolicy,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            channel_label: "chat".to_string(),
            probe_interval: Duration::from_secs(2),
            restart: RestartPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Connecting,
    Connected,
    /// Restart budget got exhausted, session needs an external restart.
    Failed,
    Closed,
}

/// Connection currently driven by the session. Replaced wholesale on restart.
struct Link {
    generation: u64,
    negotiator: Arc<Negotiator>,
    channel: Arc<dyn Channel>,
}

struct SessionInner {
    config: Config,
    options: SessionOptions,
    factory: Arc<dyn ConnectionFactory>,
    signaling: Arc<dyn SignalingChannel>,
    link: ArcSwap<Link>,
    monitor: LivenessMonitor,
    restart_lock: Mutex<()>,
    status: watch::Sender<SessionStatus>,
    incoming: UnboundedSender<Arc<dyn Channel>>,
    cancel: CancellationToken,
}

/// Negotiation session of a single peer.
///
/// It keeps a connection to the remote peer alive: inbound signaling messages and local
/// negotiation requests are fed to a [Negotiator], while a [LivenessMonitor] replaces the
/// connection once it's found dead.
pub struct Session {
    inner: Arc<SessionInner>,
    data_channels: SessionDataChannels,
}

impl Session {
    /// Subscribes to the signaling channel, creates the first connection and starts the
    /// negotiation by opening a data channel.
    pub async fn start(
        config: Config,
        options: SessionOptions,
        factory: Arc<dyn ConnectionFactory>,
        signaling: Arc<dyn SignalingChannel>,
    ) -> Result<Self, Error> {
        let inbox = signaling.subscribe()?;
        let cancel = CancellationToken::new();
        let (link, events) = open_link(
            &config,
            &options.channel_label,
            factory.as_ref(),
            &signaling,
            0,
        )
        .await?;
        let negotiator = link.negotiator.clone();
        let (incoming_tx, incoming_rx) = unbounded_channel();
        let (status, _) = watch::channel(SessionStatus::Connecting);
        let monitor = LivenessMonitor::new(options.probe_interval, options.restart);

        log::info!(
            "starting {} peer '{}' on '{}'",
            config.role,
            config.peer_id,
            config.relay_address
        );
        let inner = Arc::new(SessionInner {
            config,
            options,
            factory,
            signaling,
            link: ArcSwap::new(link),
            monitor,
            restart_lock: Mutex::new(()),
            status,
            incoming: incoming_tx,
            cancel: cancel.clone(),
        });

        tokio::spawn(SessionInner::pump_events(inner.clone(), 0, negotiator, events));
        tokio::spawn(SessionInner::pump_signals(inner.clone(), inbox));
        tokio::spawn(SessionInner::watch_liveness(inner.clone()));

        Ok(Session {
            inner,
            data_channels: SessionDataChannels {
                receiver: Mutex::new(incoming_rx),
                cancel,
            },
        })
    }

    pub fn role(&self) -> Role {
        self.inner.config.role
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn negotiator(&self) -> Arc<Negotiator> {
        self.inner.link.load().negotiator.clone()
    }

    pub fn connection(&self) -> Arc<dyn Connection> {
        self.inner.link.load().negotiator.connection().clone()
    }

    /// Data channel opened by this side on the current connection.
    pub fn channel(&self) -> Arc<dyn Channel> {
        self.inner.link.load().channel.clone()
    }

    /// Number of times the connection has been replaced.
    pub fn generation(&self) -> u64 {
        self.inner.link.load().generation
    }

    pub fn monitor(&self) -> &LivenessMonitor {
        &self.inner.monitor
    }

    pub fn status(&self) -> SessionStatus {
        *self.inner.status.borrow()
    }

    /// Data channels opened by the remote peer.
    pub fn data_channels(&self) -> &SessionDataChannels {
        &self.data_channels
    }

    /// Waits until the connection is established.
    pub async fn connected(&self) -> Result<(), Error> {
        let mut status = self.inner.status.subscribe();
        loop {
            let current = *status.borrow_and_update();
            match current {
                SessionStatus::Connected => return Ok(()),
                SessionStatus::Failed => return Err(Error::ConnectionDead),
                SessionStatus::Closed => return Err(Error::channel_closed()),
                SessionStatus::Connecting => {}
            }
            if status.changed().await.is_err() {
                return Err(Error::channel_closed());
            }
        }
    }

    /// Replaces the current connection with a fresh one, regardless of the restart policy.
    pub async fn restart(&self) -> Result<(), Error> {
        SessionInner::restart(&self.inner, None, None).await
    }

    /// Closes the session: stops all background tasks and closes the connection.
    pub async fn close(&self) -> Result<(), Error> {
        self.inner.cancel.cancel();
        self.inner.status.send_replace(SessionStatus::Closed);
        let _guard = self.inner.restart_lock.lock().await;
        let link = self.inner.link.load_full();
        let _ = link.channel.close().await;
        link.negotiator.close().await
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.inner.config)
            .field("generation", &self.generation())
            .field("status", &self.status())
            .finish()
    }
}

impl SessionInner {
    /// Feeds signaling messages to whichever negotiator is current at the time of delivery.
    async fn pump_signals(inner: Arc<Self>, mut inbox: BoxStream<'static, SignalingMessage>) {
        loop {
            let msg = tokio::select! {
                _ = inner.cancel.cancelled() => break,
                msg = inbox.next() => match msg {
                    Some(msg) => msg,
                    None => {
                        log::warn!("signaling channel of '{}' has ended", inner.config.peer_id);
                        break;
                    }
                },
            };
            let link = inner.link.load_full();
            match link.negotiator.on_remote_message(msg.clone()).await {
                Err(Error::RollbackUnsupported) => {
                    log::info!(
                        "'{}' cannot roll back its pending offer, replacing the connection",
                        inner.config.peer_id
                    );
                    if let Err(e) = Self::restart(&inner, Some(link.generation), Some(msg)).await
                    {
                        log::warn!(
                            "'{}' failed to accept remote offer on a fresh connection: {}",
                            inner.config.peer_id,
                            e
                        );
                    }
                }
                result => inner.log_outcome(result),
            }
        }
    }

    fn log_outcome(&self, result: Result<NegotiationOutcome, Error>) {
        match result {
            Ok(NegotiationOutcome::Discarded(reason)) => {
                log::trace!("'{}' discarded message: {:?}", self.config.peer_id, reason)
            }
            Ok(outcome) => log::debug!("'{}': {:?}", self.config.peer_id, outcome),
            Err(e) => log::warn!(
                "'{}' failed to handle remote message: {}",
                self.config.peer_id,
                e
            ),
        }
    }

    /// Handles events of a single connection. Events of replaced connections reach their own,
    /// already closed negotiator and have no effect.
    async fn pump_events(
        inner: Arc<Self>,
        generation: u64,
        negotiator: Arc<Negotiator>,
        mut events: UnboundedReceiver<ConnectionEvent>,
    ) {
        loop {
            let event = tokio::select! {
                _ = inner.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            match event {
                ConnectionEvent::NegotiationNeeded => {
                    if let Err(e) = negotiator.on_negotiation_needed().await {
                        log::warn!("'{}' failed to send offer: {}", inner.config.peer_id, e);
                    }
                }
                ConnectionEvent::StateChanged(state) => {
                    if inner.link.load().generation != generation {
                        continue;
                    }
                    log::debug!("'{}' connection is {:?}", inner.config.peer_id, state);
                    match state {
                        ConnectionState::Connected => {
                            inner.monitor.on_connected();
                            inner.set_status(SessionStatus::Connected);
                        }
                        ConnectionState::Failed => {
                            inner.set_status(SessionStatus::Connecting);
                            Self::on_dead(&inner, generation);
                        }
                        ConnectionState::Disconnected => {
                            inner.set_status(SessionStatus::Connecting);
                        }
                        ConnectionState::New
                        | ConnectionState::Connecting
                        | ConnectionState::Closed => {}
                    }
                }
                ConnectionEvent::DataChannel(channel) => {
                    let _ = inner.incoming.send(channel);
                }
            }
        }
    }

    async fn watch_liveness(inner: Arc<Self>) {
        let mut ticker = tokio::time::interval(inner.monitor.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = inner.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let link = inner.link.load_full();
            match inner.monitor.probe(link.channel.as_ref()).await {
                Probe::Dead | Probe::Closed => Self::on_dead(&inner, link.generation),
                Probe::Alive | Probe::Skipped => {}
            }
        }
    }

    /// Schedules a restart of the connection of a given generation, unless it was already
    /// replaced or a restart is pending.
    fn on_dead(inner: &Arc<Self>, generation: u64) {
        if inner.link.load().generation != generation || inner.cancel.is_cancelled() {
            return;
        }
        match inner.monitor.begin_restart() {
            RestartDecision::Proceed(delay) => {
                log::warn!(
                    "connection of '{}' is dead, restarting in {:?}",
                    inner.config.peer_id,
                    delay
                );
                let inner = inner.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = inner.cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    let result = Self::restart(&inner, Some(generation), None).await;
                    inner.monitor.restart_finished();
                    if let Err(e) = result {
                        log::warn!("restart of '{}' failed: {}", inner.config.peer_id, e);
                        Self::on_dead(&inner, generation);
                    }
                });
            }
            RestartDecision::AlreadyPending => {}
            RestartDecision::Exhausted => inner.set_status(SessionStatus::Failed),
        }
    }

    /// Replaces the connection with a fresh one. With `expected` set, nothing is replaced
    /// unless that generation is still current. A `pending` remote offer is applied to the
    /// connection which ends up current.
    async fn restart(
        inner: &Arc<Self>,
        expected: Option<u64>,
        pending: Option<SignalingMessage>,
    ) -> Result<(), Error> {
        let _guard = inner.restart_lock.lock().await;
        if inner.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let old = inner.link.load_full();
        if expected.map_or(false, |generation| generation != old.generation) {
            if let Some(msg) = pending {
                inner.log_outcome(old.negotiator.on_remote_message(msg).await);
            }
            return Ok(());
        }

        let generation = old.generation + 1;
        let (link, events) = open_link(
            &inner.config,
            &inner.options.channel_label,
            inner.factory.as_ref(),
            &inner.signaling,
            generation,
        )
        .await?;
        let negotiator = link.negotiator.clone();
        inner.link.store(link);
        let _ = old.channel.close().await;
        if let Err(e) = old.negotiator.close().await {
            log::debug!("closing replaced connection failed: {}", e);
        }
        inner.set_status(SessionStatus::Connecting);
        if let Some(msg) = pending {
            inner.log_outcome(negotiator.on_remote_message(msg).await);
        }
        tokio::spawn(Self::pump_events(inner.clone(), generation, negotiator, events));
        log::info!(
            "'{}' restarted its connection (generation {})",
            inner.config.peer_id,
            generation
        );
        Ok(())
    }

    fn set_status(&self, status: SessionStatus) {
        self.status.send_if_modified(|current| {
            if *current == SessionStatus::Closed || *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

/// Creates a connection together with its negotiator and the local data channel. Opening the
/// channel requests negotiation on the fresh connection. The connection is closed again if
/// any step after connecting fails.
async fn open_link(
    config: &Config,
    label: &str,
    factory: &dyn ConnectionFactory,
    signaling: &Arc<dyn SignalingChannel>,
    generation: u64,
) -> Result<(Arc<Link>, UnboundedReceiver<ConnectionEvent>), Error> {
    let conn = factory.connect(config.role).await?;
    let events = match conn.take_events() {
        Some(events) => events,
        None => {
            let _ = conn.close().await;
            return Err(Error::InvalidState(
                "connection events were already taken".to_string(),
            ));
        }
    };
    let channel = match conn.create_data_channel(label).await {
        Ok(channel) => channel,
        Err(e) => {
            if let Err(e) = conn.close().await {
                log::debug!("closing unused connection failed: {}", e);
            }
            return Err(e);
        }
    };
    let negotiator = Arc::new(Negotiator::new(
        config.role,
        config.peer_id.clone(),
        conn,
        signaling.clone(),
    ));
    let link = Link {
        generation,
        negotiator,
        channel,
    };
    Ok((Arc::new(link), events))
}

/// Stream of data channels opened by the remote peer.
pub struct SessionDataChannels {
    receiver: Mutex<UnboundedReceiver<Arc<dyn Channel>>>,
    cancel: CancellationToken,
}

impl SessionDataChannels {
    /// Returns the next data channel opened by the remote peer, or `None` once the session
    /// has been closed.
    pub async fn next(&self) -> Option<Arc<dyn Channel>> {
        let mut receiver = self.receiver.lock().await;
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            channel = receiver.recv() => channel,
        }
    }
}

impl std::fmt::Debug for SessionDataChannels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionDataChannels").finish()
    }
}
