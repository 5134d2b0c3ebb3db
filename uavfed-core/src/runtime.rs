//! The event queue that drives a role on the tokio runtime.
//!
//! A role is single threaded: received datagrams and fired timers are only pushed into an
//! unbounded queue, which the role's event loop drains one event at a time.

use std::net::SocketAddr;

use derive_more::From;
use tokio::sync::mpsc;

use crate::{
    io::{Fired, Scheduler, TimerToken, Transport},
    message::Message,
    net::{Inbound, TransportError, UdpTransport},
    timer::{AbortOnDrop, TokioScheduler},
};

/// An event of a role's queue.
#[derive(Debug, From)]
pub enum Event<T> {
    Inbound(Inbound),
    Timer(Fired<T>),
}

/// The tokio backed [`IO`] of a role.
///
/// [`IO`]: crate::io::IO
pub struct TokioIo<T> {
    transport: UdpTransport,
    scheduler: TokioScheduler<T, Event<T>>,
    _receiver: AbortOnDrop,
}

impl<T> TokioIo<T>
where
    T: Send + 'static,
{
    /// Starts receiving on `transport`. Returns the I/O handle and the role's event queue.
    pub fn new(transport: UdpTransport) -> (Self, mpsc::UnboundedReceiver<Event<T>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let receiver = transport.spawn_receiver(tx.clone());
        let io = Self {
            transport,
            scheduler: TokioScheduler::new(tx),
            _receiver: AbortOnDrop(receiver),
        };
        (io, rx)
    }

    /// Returns the local address of the underlying socket.
    ///
    /// # Errors
    /// Fails if the local address cannot be retrieved.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.transport.local_addr()
    }
}

impl<T> Transport<SocketAddr> for TokioIo<T> {
    fn send(&mut self, message: Message, to: &SocketAddr) {
        self.transport.send(message, to);
    }

    fn broadcast(&mut self, message: Message) {
        self.transport.broadcast(message);
    }
}

impl<T> Scheduler<T> for TokioIo<T>
where
    T: Send + 'static,
{
    fn schedule(&mut self, after: std::time::Duration, timer: T) -> TimerToken {
        self.scheduler.schedule(after, timer)
    }
}
