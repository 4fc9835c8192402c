//! Connection registry and inbound listener

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use chanmux_net::{RemoteTransport, TransportError};
use chanmux_proto::MessageCodec;
use futures::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};

use crate::manager::RemoteManager;
use crate::{Error, Result};

/// Process-wide table mapping each remote host to its transport and manager,
/// plus the listening socket inbound peers connect to.
///
/// One registry per process is the intended shape, but nothing global is
/// kept: the registry is an explicit object, constructed with [`new`] and
/// handed to whatever needs it. Cloning is cheap and returns a handle to the
/// same registry.
///
/// [`new`]: ConnectionRegistry::new
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

pub(crate) struct RegistryInner {
    tables: Mutex<Tables>,
}

#[derive(Default)]
struct Tables {
    started: bool,
    local_addr: Option<SocketAddr>,
    transports: HashMap<String, Arc<RemoteTransport>>,
    managers: HashMap<String, RemoteManager>,
    accept_task: Option<JoinHandle<()>>,
}

impl ConnectionRegistry {
    /// Create a registry that is not yet listening.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                tables: Mutex::new(Tables::default()),
            }),
        }
    }

    /// Bind the listening socket and launch the accept loop. Port 0 binds an
    /// ephemeral port; see [`local_addr`].
    ///
    /// [`local_addr`]: ConnectionRegistry::local_addr
    pub async fn start(&self, port: u16) -> Result<()> {
        let mut tables = self.inner.tables.lock().await;
        if tables.started {
            return Err(Error::AlreadyStarted);
        }

        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let local_addr = listener.local_addr()?;

        tables.started = true;
        tables.local_addr = Some(local_addr);
        tables.accept_task = Some(tokio::spawn(accept_loop(
            listener,
            Arc::downgrade(&self.inner),
        )));

        info!(%local_addr, "listener started");
        Ok(())
    }

    /// The address the listener is bound to, once started.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.tables.lock().await.local_addr
    }

    /// Get or create the manager for a remote host.
    ///
    /// Hosts are matched by address only: two calls naming different ports
    /// of the same host return the same manager. The port-qualified address
    /// of the first call is what the transport dials for its outbound side.
    pub async fn manager(&self, remote_host: &str) -> Result<RemoteManager> {
        let mut tables = self.inner.tables.lock().await;
        if !tables.started {
            return Err(Error::NotStarted);
        }

        let host_key = host_only(remote_host);
        if let Some(manager) = tables.managers.get(host_key) {
            return Ok(manager.clone());
        }

        // reuse a transport left behind by an early inbound connection
        let transport = tables
            .transports
            .entry(host_key.to_string())
            .or_insert_with(|| Arc::new(RemoteTransport::new(host_key)))
            .clone();

        let inbound_rx = transport
            .take_inbound()
            .await
            .ok_or(Error::Transport(TransportError::Closed))?;
        transport.start(remote_host).await?;

        let manager = RemoteManager::start(
            host_key.to_string(),
            transport,
            inbound_rx,
            Arc::downgrade(&self.inner),
        );
        tables.managers.insert(host_key.to_string(), manager.clone());
        debug!(host = %host_key, "manager created");
        Ok(manager)
    }

    /// Stop listening and close every manager and transport.
    pub async fn shutdown(&self) {
        let (accept_task, managers, transports) = {
            let mut tables = self.inner.tables.lock().await;
            tables.started = false;
            tables.local_addr = None;
            (
                tables.accept_task.take(),
                std::mem::take(&mut tables.managers),
                std::mem::take(&mut tables.transports),
            )
        };

        if let Some(task) = accept_task {
            task.abort();
        }
        for (_, manager) in managers {
            manager.close().await;
        }
        for (_, transport) in transports {
            transport.close();
        }
        info!("registry shut down");
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryInner {
    /// Drop both table entries for a host. Called by a closing manager.
    pub(crate) async fn remove(&self, host_key: &str) {
        let mut tables = self.tables.lock().await;
        tables.transports.remove(host_key);
        tables.managers.remove(host_key);
    }
}

/// Host-only portion of a possibly port-qualified address.
fn host_only(remote_host: &str) -> &str {
    remote_host
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(remote_host)
}

async fn accept_loop(listener: TcpListener, inner: Weak<RegistryInner>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let inner = match inner.upgrade() {
                    Some(inner) => inner,
                    None => break,
                };
                tokio::spawn(handle_inbound(inner, stream, peer));
            }
            Err(e) => warn!(error = %e, "accept failed"),
        }
    }
}

/// One inbound connection attempt: decode a single message to learn the
/// peer's identity from its source address, attach the socket to the matched
/// or newly created transport, and keep that first message.
async fn handle_inbound(inner: Arc<RegistryInner>, stream: TcpStream, peer: SocketAddr) {
    let mut framed = FramedRead::new(stream, MessageCodec::new());

    let first = match framed.next().await {
        Some(Ok(msg)) => msg,
        Some(Err(e)) => {
            debug!(%peer, error = %e, "rejecting inbound connection");
            return;
        }
        None => {
            debug!(%peer, "inbound connection closed before any message");
            return;
        }
    };

    let host_key = peer.ip().to_string();
    let transport = {
        let mut tables = inner.tables.lock().await;
        match tables.managers.get(&host_key) {
            Some(manager) => manager.transport(),
            None => tables
                .transports
                .entry(host_key.clone())
                .or_insert_with(|| Arc::new(RemoteTransport::new(host_key.clone())))
                .clone(),
        }
    };

    if let Err(e) = transport.attach_inbound(framed).await {
        debug!(host = %host_key, error = %e, "could not attach inbound socket");
        return;
    }
    // the identifying message is a real message; push it so it is not lost
    if let Err(e) = transport.push_inbound(first).await {
        debug!(host = %host_key, error = %e, "could not enqueue first message");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_only_strips_port() {
        assert_eq!(host_only("127.0.0.1:9000"), "127.0.0.1");
        assert_eq!(host_only("example.com:80"), "example.com");
        assert_eq!(host_only("example.com"), "example.com");
    }
}
