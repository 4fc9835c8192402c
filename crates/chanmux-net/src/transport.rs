//! Remote transport and its read/write loops

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use chanmux_proto::{Direction, Message, MessageCodec, ProtocolError};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::sleep;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

use crate::TransportError;

/// Capacity of the inbound and outbound message queues.
pub const QUEUE_CAPACITY: usize = 20;

/// Maximum number of outbound dial attempts before giving up.
pub const MAX_DIAL_ATTEMPTS: u32 = 5;

/// Delay between failed dial attempts.
const DIAL_RETRY_DELAY: Duration = Duration::from_secs(1);

/// An inbound connection half, framed with the line codec.
pub type InboundConn = FramedRead<TcpStream, MessageCodec>;

type OutboundConn = FramedWrite<TcpStream, MessageCodec>;

const STATE_UNATTACHED: u8 = 0;
const STATE_ACTIVE: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// The physical link to one remote host: at most one inbound and one
/// outbound TCP socket, plus the bounded queues the routing loops exchange
/// messages through.
///
/// A transport may exist unattached, created by the listener for an inbound
/// connection whose manager does not exist yet. The inbound socket and the
/// first decoded messages are buffered until a manager calls [`start`].
///
/// [`start`]: RemoteTransport::start
pub struct RemoteTransport {
    host_key: String,
    state: AtomicU8,
    attach_tx: mpsc::Sender<InboundConn>,
    attach_rx: Mutex<Option<mpsc::Receiver<InboundConn>>>,
    inbound_tx: mpsc::Sender<Message>,
    inbound_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    outbound_tx: mpsc::Sender<Message>,
    outbound_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    shutdown_read_tx: mpsc::Sender<()>,
    shutdown_read_rx: Mutex<Option<mpsc::Receiver<()>>>,
    shutdown_write_tx: mpsc::Sender<()>,
    shutdown_write_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl RemoteTransport {
    /// Create an unattached transport for the given host key.
    pub fn new(host_key: impl Into<String>) -> Self {
        let (attach_tx, attach_rx) = mpsc::channel(1);
        let (inbound_tx, inbound_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (shutdown_read_tx, shutdown_read_rx) = mpsc::channel(1);
        let (shutdown_write_tx, shutdown_write_rx) = mpsc::channel(1);

        Self {
            host_key: host_key.into(),
            state: AtomicU8::new(STATE_UNATTACHED),
            attach_tx,
            attach_rx: Mutex::new(Some(attach_rx)),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            shutdown_read_tx,
            shutdown_read_rx: Mutex::new(Some(shutdown_read_rx)),
            shutdown_write_tx,
            shutdown_write_rx: Mutex::new(Some(shutdown_write_rx)),
        }
    }

    /// The host-only key this transport is registered under.
    pub fn host_key(&self) -> &str {
        &self.host_key
    }

    /// Whether the read and write loops are running.
    pub fn is_active(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_ACTIVE
    }

    /// Whether the transport has been closed. Terminal.
    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_CLOSED
    }

    /// Hand a freshly accepted inbound socket to the read loop. May be
    /// called before [`start`]; the socket is buffered until the loops run.
    ///
    /// [`start`]: RemoteTransport::start
    pub async fn attach_inbound(&self, conn: InboundConn) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.attach_tx
            .send(conn)
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Push a message onto the inbound queue, tagged `Down`. Used by the
    /// listener for the identifying first message of an inbound connection.
    pub async fn push_inbound(&self, mut msg: Message) -> Result<(), TransportError> {
        msg.direction = Direction::Down;
        self.inbound_tx
            .send(msg)
            .await
            .map_err(|_| TransportError::QueueClosed)
    }

    /// Enqueue a message for outbound delivery.
    pub async fn send_outbound(&self, msg: Message) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.outbound_tx
            .send(msg)
            .await
            .map_err(|_| TransportError::QueueClosed)
    }

    /// Take the inbound queue receiver. The attaching manager's demultiplex
    /// loop owns it from then on.
    pub async fn take_inbound(&self) -> Option<mpsc::Receiver<Message>> {
        self.inbound_rx.lock().await.take()
    }

    /// Launch the read and write loops, dialing `dial_addr` for the outbound
    /// side. Called once, when a manager attaches; a no-op if already active.
    pub async fn start(&self, dial_addr: impl Into<String>) -> Result<(), TransportError> {
        match self.state.compare_exchange(
            STATE_UNATTACHED,
            STATE_ACTIVE,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {}
            Err(STATE_ACTIVE) => return Ok(()),
            Err(_) => return Err(TransportError::Closed),
        }

        let attach_rx = self.attach_rx.lock().await.take();
        let outbound_rx = self.outbound_rx.lock().await.take();
        let read_shutdown = self.shutdown_read_rx.lock().await.take();
        let write_shutdown = self.shutdown_write_rx.lock().await.take();
        let (Some(attach_rx), Some(outbound_rx), Some(read_shutdown), Some(write_shutdown)) =
            (attach_rx, outbound_rx, read_shutdown, write_shutdown)
        else {
            return Err(TransportError::Closed);
        };

        let dial_addr = dial_addr.into();
        debug!(host = %self.host_key, addr = %dial_addr, "transport starting");

        tokio::spawn(read_loop(
            self.host_key.clone(),
            attach_rx,
            self.inbound_tx.clone(),
            read_shutdown,
        ));
        tokio::spawn(write_loop(
            dial_addr,
            outbound_rx,
            self.outbound_tx.clone(),
            write_shutdown,
        ));
        Ok(())
    }

    /// Close the transport. Terminal: both loops stop and any messages still
    /// queued are dropped.
    pub fn close(&self) {
        if self.state.swap(STATE_CLOSED, Ordering::SeqCst) == STATE_CLOSED {
            return;
        }
        let _ = self.shutdown_read_tx.try_send(());
        let _ = self.shutdown_write_tx.try_send(());
        debug!(host = %self.host_key, "transport closed");
    }
}

enum ReadEvent {
    Shutdown,
    Attached(Option<InboundConn>),
    Decoded(Option<Result<Message, ProtocolError>>),
}

/// Inbound side: decode messages off the attached socket one line at a time,
/// tag them `Down`, and push them onto the inbound queue. A decode or socket
/// error ends the current connection episode only; the loop then waits for
/// the next attached socket.
async fn read_loop(
    host_key: String,
    mut attach_rx: mpsc::Receiver<InboundConn>,
    inbound_tx: mpsc::Sender<Message>,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    debug!(host = %host_key, "read loop started");

    'outer: loop {
        let mut conn = tokio::select! {
            _ = shutdown_rx.recv() => break,
            attached = attach_rx.recv() => match attached {
                Some(conn) => conn,
                None => break,
            },
        };
        debug!(host = %host_key, "inbound socket attached");

        loop {
            let event = tokio::select! {
                _ = shutdown_rx.recv() => ReadEvent::Shutdown,
                attached = attach_rx.recv() => ReadEvent::Attached(attached),
                decoded = conn.next() => ReadEvent::Decoded(decoded),
            };

            match event {
                ReadEvent::Shutdown | ReadEvent::Attached(None) => break 'outer,
                ReadEvent::Attached(Some(replacement)) => {
                    // at most one live inbound socket: the newer one wins
                    debug!(host = %host_key, "inbound socket replaced");
                    conn = replacement;
                }
                ReadEvent::Decoded(Some(Ok(mut msg))) => {
                    msg.direction = Direction::Down;
                    // a full inbound queue blocks here; shutdown must still
                    // get through
                    tokio::select! {
                        _ = shutdown_rx.recv() => break 'outer,
                        sent = inbound_tx.send(msg) => {
                            if sent.is_err() {
                                break 'outer;
                            }
                        }
                    }
                }
                ReadEvent::Decoded(Some(Err(e))) => {
                    debug!(host = %host_key, error = %e, "read episode ended");
                    break;
                }
                ReadEvent::Decoded(None) => {
                    debug!(host = %host_key, "inbound socket reached end of stream");
                    break;
                }
            }
        }
    }

    debug!(host = %host_key, "read loop stopped");
}

/// Outbound side: dial the remote host, then drain the outbound queue onto
/// the socket. A failed write triggers exactly one reconnect attempt and the
/// failed message is re-enqueued from a detached task, so delivery is
/// at-least-once and may reorder relative to messages queued behind it.
async fn write_loop(
    dial_addr: String,
    mut outbound_rx: mpsc::Receiver<Message>,
    outbound_tx: mpsc::Sender<Message>,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    let mut conn = tokio::select! {
        _ = shutdown_rx.recv() => return,
        connected = connect_with_retry(&dial_addr) => match connected {
            Some(conn) => conn,
            None => {
                warn!(addr = %dial_addr, "dial attempts exhausted, outbound delivery disabled");
                return;
            }
        }
    };
    debug!(addr = %dial_addr, "write loop started");

    loop {
        let msg = tokio::select! {
            _ = shutdown_rx.recv() => break,
            msg = outbound_rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        if let Err(e) = conn.send(msg.clone()).await {
            warn!(addr = %dial_addr, error = %e, "write failed, reconnecting");
            match dial(&dial_addr).await {
                Ok(replacement) => conn = replacement,
                Err(e) => warn!(addr = %dial_addr, error = %e, "reconnect failed"),
            }
            // back onto the queue from a detached task: a blocking send here
            // would wedge the loop when the queue is full
            let tx = outbound_tx.clone();
            tokio::spawn(async move {
                let _ = tx.send(msg).await;
            });
        }
    }

    debug!(addr = %dial_addr, "write loop stopped");
}

async fn connect_with_retry(addr: &str) -> Option<OutboundConn> {
    for attempt in 1..=MAX_DIAL_ATTEMPTS {
        match dial(addr).await {
            Ok(conn) => {
                debug!(%addr, attempt, "outbound socket connected");
                return Some(conn);
            }
            Err(e) => warn!(%addr, attempt, error = %e, "dial failed"),
        }
        if attempt < MAX_DIAL_ATTEMPTS {
            sleep(DIAL_RETRY_DELAY).await;
        }
    }
    None
}

async fn dial(addr: &str) -> Result<OutboundConn, TransportError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|source| TransportError::Dial {
            addr: addr.to_string(),
            source,
        })?;
    Ok(FramedWrite::new(stream, MessageCodec::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chanmux_proto::MessageType;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_new_transport_is_unattached() {
        let transport = RemoteTransport::new("127.0.0.1");
        assert_eq!(transport.host_key(), "127.0.0.1");
        assert!(!transport.is_active());
        assert!(!transport.is_closed());
    }

    #[tokio::test]
    async fn test_write_loop_delivers_outbound() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let transport = RemoteTransport::new("127.0.0.1");
        transport.start(addr.to_string()).await.unwrap();
        assert!(transport.is_active());

        let mut msg = Message::text("outbound");
        msg.channel_name = "x".to_string();
        transport.send_outbound(msg).await.unwrap();

        let (socket, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        let mut lines = BufReader::new(socket).lines();
        let line = timeout(WAIT, lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(line, "{\"channelName\":\"x\",\"type\":1,\"content\":\"outbound\"}");

        transport.close();
    }

    #[tokio::test]
    async fn test_read_loop_tags_inbound_down() {
        // the write loop needs somewhere to dial, even though this test only
        // exercises the inbound side
        let sink_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let sink_addr = sink_listener.local_addr().unwrap();

        let inbound_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let inbound_addr = inbound_listener.local_addr().unwrap();

        let transport = RemoteTransport::new("127.0.0.1");
        let mut inbound = transport.take_inbound().await.unwrap();
        transport.start(sink_addr.to_string()).await.unwrap();

        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let mut peer = TcpStream::connect(inbound_addr).await.unwrap();
            peer.write_all(b"{\"channelName\":\"x\",\"type\":1,\"content\":\"hello\"}\n")
                .await
                .unwrap();
            peer.flush().await.unwrap();
        });

        let (socket, _) = timeout(WAIT, inbound_listener.accept())
            .await
            .unwrap()
            .unwrap();
        transport
            .attach_inbound(FramedRead::new(socket, MessageCodec::new()))
            .await
            .unwrap();

        let msg = timeout(WAIT, inbound.recv()).await.unwrap().unwrap();
        assert_eq!(msg.content, "hello");
        assert_eq!(msg.msg_type, MessageType::Data);
        assert_eq!(msg.direction, Direction::Down);

        transport.close();
    }

    #[tokio::test]
    async fn test_push_inbound_tags_down() {
        let transport = RemoteTransport::new("127.0.0.1");
        let mut inbound = transport.take_inbound().await.unwrap();

        transport.push_inbound(Message::text("first")).await.unwrap();
        let msg = inbound.recv().await.unwrap();
        assert_eq!(msg.direction, Direction::Down);
    }

    #[tokio::test]
    async fn test_close_is_terminal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let transport = RemoteTransport::new("127.0.0.1");
        transport.start(addr.to_string()).await.unwrap();
        transport.close();

        assert!(transport.is_closed());
        assert!(transport.send_outbound(Message::text("late")).await.is_err());
        assert!(transport.start(addr.to_string()).await.is_err());
    }
}
