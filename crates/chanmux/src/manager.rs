//! Per-remote-host channel manager and routing loops

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chanmux_net::RemoteTransport;
use chanmux_proto::{Direction, Message, MessageType};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::channel::{Channel, ChannelId};
use crate::listener::RegistryInner;
use crate::registry::{ChannelEntry, ChannelRegistry};
use crate::{Error, Result};

/// Capacity of the shared fan-in queue feeding the multiplex loop.
const FANIN_CAPACITY: usize = 20;

/// How long `remote_channels` waits for the peer's reply.
const CHAN_LIST_TIMEOUT: Duration = Duration::from_secs(10);

/// Bounded retry policy for `Data` messages whose channel does not exist
/// yet: the dispatch task re-checks with exponential backoff, then drops.
const MAX_DELIVERY_ATTEMPTS: u32 = 5;
const DELIVERY_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Manages the logical channels shared with one remote host.
///
/// A manager owns the transport to its host and the bijective name-channel
/// registry, and runs two routing loops: the demultiplex loop takes inbound
/// messages off the transport and routes them to their named channel (or
/// answers control messages itself), and the multiplex loop collects
/// outbound messages from every registered channel through one shared
/// fan-in queue, stamps them with their channel's name, and hands them to
/// the transport.
///
/// Cloning is cheap and returns a handle to the same manager.
#[derive(Clone)]
pub struct RemoteManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for RemoteManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteManager")
            .field("host_key", &self.inner.host_key)
            .finish_non_exhaustive()
    }
}

struct ManagerInner {
    host_key: String,
    transport: Arc<RemoteTransport>,
    mux: Mutex<MuxState>,
    service_tx: mpsc::Sender<Message>,
    service_rx: Mutex<mpsc::Receiver<Message>>,
    shutdown_demux_tx: mpsc::Sender<()>,
    shutdown_mux_tx: mpsc::Sender<()>,
    closed: AtomicBool,
    conn_registry: Weak<RegistryInner>,
}

struct MuxState {
    channels: ChannelRegistry,
    fanin_tx: mpsc::Sender<(ChannelId, Message)>,
}

impl RemoteManager {
    /// Create the manager and launch its routing loops. The caller has
    /// already started the transport and holds the connection-registry lock.
    pub(crate) fn start(
        host_key: String,
        transport: Arc<RemoteTransport>,
        inbound_rx: mpsc::Receiver<Message>,
        conn_registry: Weak<RegistryInner>,
    ) -> Self {
        let (fanin_tx, fanin_rx) = mpsc::channel(FANIN_CAPACITY);
        // single slot: at most one chan-list exchange is in flight
        let (service_tx, service_rx) = mpsc::channel(1);
        let (shutdown_demux_tx, shutdown_demux_rx) = mpsc::channel(1);
        let (shutdown_mux_tx, shutdown_mux_rx) = mpsc::channel(1);

        let inner = Arc::new(ManagerInner {
            host_key,
            transport,
            mux: Mutex::new(MuxState {
                channels: ChannelRegistry::new(),
                fanin_tx,
            }),
            service_tx,
            service_rx: Mutex::new(service_rx),
            shutdown_demux_tx,
            shutdown_mux_tx,
            closed: AtomicBool::new(false),
            conn_registry,
        });

        tokio::spawn(demux_loop(inner.clone(), inbound_rx, shutdown_demux_rx));
        tokio::spawn(mux_loop(inner.clone(), fanin_rx, shutdown_mux_rx));

        Self { inner }
    }

    /// The host-only key this manager is registered under.
    pub fn host_key(&self) -> &str {
        &self.inner.host_key
    }

    pub(crate) fn transport(&self) -> Arc<RemoteTransport> {
        self.inner.transport.clone()
    }

    /// Create and register a new channel with the given delivery capacity.
    pub async fn new_channel(&self, name: &str, capacity: usize) -> Result<Channel> {
        let mut mux = self.inner.mux.lock().await;
        if mux.channels.contains(name) {
            return Err(Error::ChannelAlreadyExists {
                name: name.to_string(),
            });
        }

        let id = ChannelId::new();
        let (queue_tx, mut queue_rx) = mpsc::channel(capacity.max(1));
        let (delivery_tx, delivery_rx) = mpsc::channel(capacity.max(1));

        // the forwarding task is this channel's seat in the multiplex wait:
        // everything it reads lands on the shared fan-in queue tagged with
        // the channel's identity
        let fanin_tx = mux.fanin_tx.clone();
        let forward = tokio::spawn(async move {
            while let Some(msg) = queue_rx.recv().await {
                if fanin_tx.send((id, msg)).await.is_err() {
                    break;
                }
            }
        });

        let handle = Channel::new(id, name.to_string(), queue_tx.clone(), delivery_rx);
        mux.channels.add(
            name.to_string(),
            ChannelEntry {
                id,
                queue_tx,
                delivery_tx,
                handle: handle.clone(),
                forward,
            },
        );
        debug!(host = %self.inner.host_key, channel = %name, "channel created");
        Ok(handle)
    }

    /// Close the channel with the given name and remove it from the
    /// registry.
    pub async fn close_channel(&self, name: &str) -> Result<()> {
        let mut mux = self.inner.mux.lock().await;
        let entry = mux.channels.remove(name).ok_or_else(|| Error::NoSuchChannel {
            name: name.to_string(),
        })?;
        // wait the forwarding task out so sends observe the closed queue
        // before this call returns
        entry.forward.abort();
        let _ = entry.forward.await;
        debug!(host = %self.inner.host_key, channel = %name, "channel closed");
        Ok(())
    }

    /// Another handle to the channel with the given name.
    pub async fn get_channel(&self, name: &str) -> Result<Channel> {
        let mux = self.inner.mux.lock().await;
        mux.channels
            .channel(name)
            .map(|entry| entry.handle.clone())
            .ok_or_else(|| Error::NoSuchChannel {
                name: name.to_string(),
            })
    }

    /// Ask the remote host for its current channel-name list.
    ///
    /// Sends a `ChanListRequest` and waits on the service channel for the
    /// `ChanList` reply, up to a fixed timeout.
    pub async fn remote_channels(&self) -> Result<Vec<String>> {
        self.inner
            .transport
            .send_outbound(Message::chan_list_request())
            .await?;

        let mut service_rx = self.inner.service_rx.lock().await;
        let reply = timeout(CHAN_LIST_TIMEOUT, service_rx.recv())
            .await
            .map_err(|_| Error::Timeout {
                duration: CHAN_LIST_TIMEOUT,
            })?
            .ok_or(Error::ChannelClosed)?;

        let names: Vec<String> = serde_json::from_str(&reply.content)?;
        Ok(names)
    }

    /// Close the manager: every channel, both routing loops, the transport,
    /// and the connection-registry entries. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        // tell the peer we are going away; best effort, the write loop may
        // already be gone
        let _ = self.inner.transport.send_outbound(Message::close()).await;

        {
            let mut mux = self.inner.mux.lock().await;
            mux.channels.close_all();
        }

        let _ = self.inner.shutdown_demux_tx.try_send(());
        let _ = self.inner.shutdown_mux_tx.try_send(());
        self.inner.transport.close();

        if let Some(registry) = self.inner.conn_registry.upgrade() {
            registry.remove(&self.inner.host_key).await;
        }
        debug!(host = %self.inner.host_key, "manager closed");
    }
}

/// Transport-to-channels side: take messages off the inbound queue and
/// route each to its named channel or answer it in place. A message that
/// can be delivered immediately is delivered inline, which keeps
/// per-channel ordering; one that would block the loop (its channel is
/// full, missing, or the reply needs the outbound queue) is handed to its
/// own short-lived dispatch task so it cannot stall the messages behind it.
async fn demux_loop(
    inner: Arc<ManagerInner>,
    mut inbound_rx: mpsc::Receiver<Message>,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    debug!(host = %inner.host_key, "demultiplex loop started");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            msg = inbound_rx.recv() => match msg {
                Some(mut msg) => {
                    msg.direction = Direction::Down;
                    if let Some(msg) = dispatch_fast(&inner, msg).await {
                        let inner = inner.clone();
                        tokio::spawn(async move { dispatch_slow(inner, msg).await });
                    }
                }
                None => break,
            },
        }
    }

    debug!(host = %inner.host_key, "demultiplex loop stopped");
}

/// Non-blocking dispatch. Returns the message back when it needs the slow
/// path.
async fn dispatch_fast(inner: &Arc<ManagerInner>, msg: Message) -> Option<Message> {
    match msg.msg_type {
        MessageType::Data => {
            let mux = inner.mux.lock().await;
            let entry = match mux.channels.channel(&msg.channel_name) {
                Some(entry) => entry,
                None => return Some(msg),
            };
            match entry.queue_tx.try_send(msg) {
                Ok(()) => None,
                Err(TrySendError::Full(msg)) | Err(TrySendError::Closed(msg)) => Some(msg),
            }
        }
        MessageType::ChanList => {
            // single-slot service channel; a reply nobody asked for is dropped
            if inner.service_tx.try_send(msg).is_err() {
                debug!(host = %inner.host_key, "unsolicited chan list reply dropped");
            }
            None
        }
        MessageType::ChanListRequest => Some(msg),
        MessageType::Close => {
            debug!(host = %inner.host_key, "peer announced close");
            None
        }
        // undefined types never make it past the codec
        MessageType::Undefined => None,
    }
}

async fn dispatch_slow(inner: Arc<ManagerInner>, msg: Message) {
    match msg.msg_type {
        MessageType::Data => deliver_data(inner, msg).await,
        MessageType::ChanListRequest => send_chan_list(inner).await,
        _ => {}
    }
}

/// Route a `Data` message to its named channel. The channel may not exist
/// yet (the peer can send ahead of channel creation), so absence is retried
/// with backoff before the message is given up on.
async fn deliver_data(inner: Arc<ManagerInner>, msg: Message) {
    let name = msg.channel_name.clone();
    let mut delay = DELIVERY_RETRY_DELAY;

    for attempt in 1..=MAX_DELIVERY_ATTEMPTS {
        let queue_tx = {
            let mux = inner.mux.lock().await;
            mux.channels.channel(&name).map(|entry| entry.queue_tx.clone())
        };

        if let Some(tx) = queue_tx {
            if tx.send(msg).await.is_err() {
                warn!(host = %inner.host_key, channel = %name, "channel closed during delivery");
            }
            return;
        }

        if attempt < MAX_DELIVERY_ATTEMPTS {
            sleep(delay).await;
            delay *= 2;
        }
    }

    warn!(host = %inner.host_key, channel = %name, "dropping message for unknown channel");
}

async fn send_chan_list(inner: Arc<ManagerInner>) {
    let names = {
        let mux = inner.mux.lock().await;
        mux.channels.names()
    };

    let payload = match serde_json::to_string(&names) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(host = %inner.host_key, error = %e, "failed to encode channel list");
            return;
        }
    };

    if let Err(e) = inner
        .transport
        .send_outbound(Message::chan_list(payload))
        .await
    {
        warn!(host = %inner.host_key, error = %e, "failed to send channel list");
    }
}

/// Channels-to-transport side: wait on the shared fan-in queue. `Up`
/// messages are stamped with their channel's registered name and enqueued
/// outbound; `Down` messages came off the wire through the channel queue and
/// are handed to the channel's delivery side for the application to read.
async fn mux_loop(
    inner: Arc<ManagerInner>,
    mut fanin_rx: mpsc::Receiver<(ChannelId, Message)>,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    debug!(host = %inner.host_key, "multiplex loop started");

    loop {
        let (id, mut msg) = tokio::select! {
            _ = shutdown_rx.recv() => break,
            item = fanin_rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        match msg.direction {
            Direction::Down => {
                let delivery = {
                    let mux = inner.mux.lock().await;
                    mux.channels.delivery_for(&id)
                };
                if let Some(tx) = delivery {
                    // a slow consumer blocks here; shutdown must still win
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        _ = tx.send(msg) => {}
                    }
                }
            }
            Direction::Up => {
                let name = {
                    let mux = inner.mux.lock().await;
                    mux.channels.name_of(&id).map(str::to_string)
                };
                match name {
                    Some(name) => {
                        msg.channel_name = name;
                        tokio::select! {
                            _ = shutdown_rx.recv() => break,
                            sent = inner.transport.send_outbound(msg) => {
                                if let Err(e) = sent {
                                    debug!(host = %inner.host_key, error = %e, "outbound enqueue failed");
                                }
                            }
                        }
                    }
                    None => {
                        debug!(host = %inner.host_key, "message from unregistered channel dropped")
                    }
                }
            }
        }
    }

    debug!(host = %inner.host_key, "multiplex loop stopped");
}
