//! UDP transport.
//!
//! Each datagram carries one encoded [`Message`]. Sending never waits: a datagram that can't be
//! handed to the socket right away is dropped, like any other datagram lost on the network.

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::{
    net::{lookup_host, UdpSocket},
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{debug, error, warn};

use crate::{
    io::Transport,
    message::{CodecError, Message},
};

const RECV_BUFFER_SIZE: usize = 65_535;

const MIN_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// A message received from a peer.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub message: Message,
    pub from: SocketAddr,
}

/// Async UDP socket wrapper implementing [`Transport`].
///
/// Clones share the same socket.
#[derive(Debug, Clone)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    broadcast: Option<SocketAddr>,
}

impl UdpTransport {
    /// Binds a UDP socket to `addr`.
    ///
    /// Broadcasts are sent to `broadcast`. Without a broadcast address, broadcasts are dropped.
    ///
    /// # Errors
    /// Fails if the socket can't be bound or configured.
    pub async fn bind(
        addr: SocketAddr,
        broadcast: Option<SocketAddr>,
    ) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr).await?;
        if broadcast.is_some() {
            socket.set_broadcast(true)?;
        }
        Ok(Self {
            socket: Arc::new(socket),
            broadcast,
        })
    }

    /// Returns the local address this socket is bound to.
    ///
    /// # Errors
    /// Fails if the local address cannot be retrieved.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    /// Receives the next datagram and decodes it.
    ///
    /// # Errors
    /// Fails on socket errors and on datagrams that aren't valid messages.
    pub async fn recv(&self) -> Result<Inbound, TransportError> {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        self.recv_into(&mut buf).await
    }

    async fn recv_into(&self, buf: &mut [u8]) -> Result<Inbound, TransportError> {
        let (len, from) = self.socket.recv_from(buf).await?;
        let message = Message::from_bytes(&buf[..len])?;
        Ok(Inbound { message, from })
    }

    /// Forwards every received message into `events` until the receiving half is closed.
    ///
    /// Undecodable datagrams are dropped. After a socket error the receiver pauses before the
    /// next attempt, doubling the pause on every consecutive error.
    pub fn spawn_receiver<E>(&self, events: mpsc::UnboundedSender<E>) -> JoinHandle<()>
    where
        E: From<Inbound> + Send + 'static,
    {
        let transport = self.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; RECV_BUFFER_SIZE];
            let mut backoff = Backoff::default();
            loop {
                match transport.recv_into(&mut buf).await {
                    Ok(inbound) => {
                        backoff.reset();
                        debug!("received {} from {}", inbound.message, inbound.from);
                        if events.send(inbound.into()).is_err() {
                            debug!("event queue closed, stopping receiver");
                            break;
                        }
                    }
                    Err(TransportError::Codec(err)) => {
                        backoff.reset();
                        warn!("dropping datagram: {}", err);
                    }
                    Err(err) => {
                        let pause = backoff.next();
                        warn!("receive failed: {}, retrying in {:?}", err, pause);
                        tokio::time::sleep(pause).await;
                    }
                }
            }
        })
    }

    fn send_to(&self, message: &Message, to: SocketAddr) {
        let bytes = match message.to_bytes() {
            Ok(bytes) => bytes,
            Err(err) => {
                error!("failed to encode {}: {}", message, err);
                return;
            }
        };
        match self.socket.try_send_to(&bytes, to) {
            Ok(_) => debug!("sent {} to {}", message, to),
            Err(err) => warn!("dropping {} to {}: {}", message, to, err),
        }
    }
}

impl Transport<SocketAddr> for UdpTransport {
    fn send(&mut self, message: Message, to: &SocketAddr) {
        self.send_to(&message, *to);
    }

    fn broadcast(&mut self, message: Message) {
        match self.broadcast {
            Some(to) => self.send_to(&message, to),
            None => warn!("no broadcast address configured, dropping {}", message),
        }
    }
}

/// Pause between receive attempts after consecutive socket errors.
#[derive(Debug, Default)]
struct Backoff(Option<Duration>);

impl Backoff {
    fn next(&mut self) -> Duration {
        let pause = match self.0 {
            Some(last) => (last * 2).min(MAX_BACKOFF),
            None => MIN_BACKOFF,
        };
        self.0 = Some(pause);
        pause
    }

    fn reset(&mut self) {
        self.0 = None;
    }
}

/// Resolves the first address of `candidates` that can be resolved.
///
/// Returns `None` if none of them resolves.
pub async fn resolve_first<S: AsRef<str>>(candidates: &[S]) -> Option<SocketAddr> {
    for candidate in candidates {
        match lookup_host(candidate.as_ref()).await {
            Ok(mut addrs) => {
                if let Some(addr) = addrs.next() {
                    return Some(addr);
                }
            }
            Err(err) => debug!("could not resolve {}: {}", candidate.as_ref(), err),
        }
    }
    None
}
