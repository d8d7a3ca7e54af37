use crate::connection::Channel;
use crate::error::Error;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::{Mutex, Notify};
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

/// Webrtc data channel handle. Incoming payloads are buffered until read with
/// [DataChannel::recv].
pub struct DataChannel {
    dc: Arc<RTCDataChannel>,
    status: Arc<ArcSwap<DataChannelState>>,
    /// Buffer reader part, used for asynchronously iterating over incoming messages.
    /// `Ok(None)` marks graceful close.
    receiver: Mutex<UnboundedReceiver<Result<Option<Bytes>, Error>>>,
}

impl DataChannel {
    pub fn new(dc: Arc<RTCDataChannel>) -> Self {
        let (sender, receiver) = unbounded_channel();
        let initial = match dc.ready_state() {
            RTCDataChannelState::Open => DataChannelState::open(),
            RTCDataChannelState::Closing | RTCDataChannelState::Closed => {
                DataChannelState::closed_gracefully()
            }
            _ => DataChannelState::waiting(),
        };
        let status = Arc::new(ArcSwap::new(initial));
        Self::register_handlers(&dc, &status, sender);
        DataChannel {
            dc,
            status,
            receiver: Mutex::new(receiver),
        }
    }

    fn register_handlers(
        dc: &RTCDataChannel,
        status: &Arc<ArcSwap<DataChannelState>>,
        sender: UnboundedSender<Result<Option<Bytes>, Error>>,
    ) {
        let s = Arc::downgrade(status);
        dc.on_open(Box::new(move || {
            let s = s.clone();
            Box::pin(async move {
                if let Some(status) = s.upgrade() {
                    let old = status.rcu(|old| match &**old {
                        DataChannelState::Waiting { .. } => DataChannelState::open(),
                        _ => old.clone(),
                    });
                    if let DataChannelState::Waiting { ready } = &*old {
                        ready.notify_waiters();
                    }
                }
            })
        }));
        let s = Arc::downgrade(status);
        let tx = sender.clone();
        dc.on_close(Box::new(move || {
            let s = s.clone();
            let tx = tx.clone();
            Box::pin(async move {
                if let Some(status) = s.upgrade() {
                    let old = status.swap(DataChannelState::closed_gracefully());
                    match &*old {
                        DataChannelState::Waiting { ready } => ready.notify_waiters(),
                        DataChannelState::Open => {
                            let _ = tx.send(Ok(None));
                        }
                        DataChannelState::Closed { .. } => {}
                    }
                }
            })
        }));
        let s = Arc::downgrade(status);
        let tx = sender.clone();
        dc.on_error(Box::new(move |e| {
            let s = s.clone();
            let tx = tx.clone();
            Box::pin(async move {
                if let Some(status) = s.upgrade() {
                    let error: Error = e.into();
                    log::warn!("data channel failed: {}", error);
                    let old = status.swap(DataChannelState::failed(error.clone()));
                    match &*old {
                        DataChannelState::Waiting { ready } => ready.notify_waiters(),
                        DataChannelState::Open => {
                            let _ = tx.send(Err(error));
                        }
                        DataChannelState::Closed { .. } => {}
                    }
                }
            })
        }));
        let tx = sender;
        dc.on_message(Box::new(move |msg| {
            // empty payloads are liveness checks of the remote side
            if !msg.data.is_empty() {
                let _ = tx.send(Ok(Some(msg.data)));
            }
            Box::pin(async move {})
        }));
    }

    pub fn id(&self) -> u16 {
        self.dc.id()
    }

    /// Wait's until the data channel is ready to operate (it becomes open).
    ///
    /// # Returns
    ///
    /// If channel has been opened successfully, this method returns `Ok(true)`.
    /// If channel has been closed gracefully it returns `Ok(false)`.
    /// If channel has been closed due to failure it returns `Err`.
    pub async fn ready(&self) -> Result<bool, Error> {
        loop {
            let status = self.status.load_full();
            match &*status {
                DataChannelState::Open => return Ok(true),
                DataChannelState::Closed { reason: None } => return Ok(false),
                DataChannelState::Closed { reason: Some(e) } => return Err(e.clone()),
                DataChannelState::Waiting { ready } => {
                    let notified = ready.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    // state could have moved on between load and enable
                    if Arc::ptr_eq(&status, &self.status.load_full()) {
                        notified.await;
                    }
                }
            }
        }
    }

    /// Receives the next payload sent by the remote side. Returns `None` once the channel is
    /// closed gracefully. Empty payloads are never returned.
    pub async fn recv(&self) -> Option<Result<Bytes, Error>> {
        let mut receiver = self.receiver.lock().await;
        match receiver.recv().await? {
            Ok(Some(data)) => Some(Ok(data)),
            Ok(None) => {
                receiver.close();
                None
            }
            Err(e) => Some(Err(e)),
        }
    }
}

#[async_trait]
impl Channel for DataChannel {
    fn label(&self) -> &str {
        self.dc.label()
    }

    fn is_open(&self) -> bool {
        self.status.load().is_open() && self.dc.ready_state() == RTCDataChannelState::Open
    }

    fn is_closed(&self) -> bool {
        self.status.load().is_closed()
            || matches!(
                self.dc.ready_state(),
                RTCDataChannelState::Closing | RTCDataChannelState::Closed
            )
    }

    async fn send(&self, data: Bytes) -> Result<(), Error> {
        if !self.status.load().is_open() {
            return Err(Error::channel_closed());
        }
        self.dc.send(&data).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        let old = self.status.swap(DataChannelState::closed_gracefully());
        if let DataChannelState::Waiting { ready } = &*old {
            ready.notify_waiters();
        }
        self.dc.close().await?;
        Ok(())
    }
}

impl std::fmt::Debug for DataChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataChannel")
            .field("label", &self.dc.label())
            .field("state", &self.status)
            .finish()
    }
}

impl AsRef<RTCDataChannel> for DataChannel {
    fn as_ref(&self) -> &RTCDataChannel {
        &self.dc
    }
}

#[derive(Debug)]
enum DataChannelState {
    /// Underlying data channel is waiting to become open.
    Waiting {
        /// Notifier used when the underlying data channel changes it's state from ready to open.
        ready: Notify,
    },
    Open,
    Closed {
        /// Optional error reason, why the channel has been closed.
        reason: Option<Error>,
    },
}

impl DataChannelState {
    fn waiting() -> Arc<Self> {
        Arc::new(DataChannelState::Waiting {
            ready: Notify::new(),
        })
    }

    fn open() -> Arc<Self> {
        Arc::new(DataChannelState::Open)
    }

    fn closed_gracefully() -> Arc<Self> {
        Arc::new(DataChannelState::Closed { reason: None })
    }

    fn failed(reason: Error) -> Arc<Self> {
        Arc::new(DataChannelState::Closed {
            reason: Some(reason),
        })
    }

    fn is_open(&self) -> bool {
        matches!(self, DataChannelState::Open)
    }

    fn is_closed(&self) -> bool {
        matches!(self, DataChannelState::Closed { .. })
    }
}
