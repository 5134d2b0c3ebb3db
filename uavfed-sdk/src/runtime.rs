//! Runs a [`WorkerSession`] on the tokio runtime.

use std::net::SocketAddr;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uavfed_core::{
    model::SimulatedModel,
    net::{resolve_first, Inbound, TransportError, UdpTransport},
    runtime::{Event, TokioIo},
};

use crate::{
    settings::ClientSettings,
    traits::Notify,
    worker::{SensorSampler, WorkerParams, WorkerSession, WorkerTimer},
};

/// The worker together with its socket, its timers and its event queue.
pub struct WorkerService<N> {
    session: WorkerSession<SimulatedModel, SocketAddr, N>,
    io: TokioIo<WorkerTimer>,
    events: mpsc::UnboundedReceiver<Event<WorkerTimer>>,
}

impl<N> WorkerService<N>
where
    N: Notify,
{
    /// Binds the worker's socket and resolves the coordinator's address.
    ///
    /// An unresolvable coordinator is not an error: the worker is created with sending disabled.
    ///
    /// # Errors
    /// Fails if the socket can't be bound.
    pub async fn init(
        client: &ClientSettings,
        params: WorkerParams,
        model: SimulatedModel,
        sensor: SensorSampler,
        notifier: N,
    ) -> Result<Self, TransportError> {
        let transport = UdpTransport::bind(client.bind_address, None).await?;
        info!(
            "client {} listening on {}",
            client.id,
            transport.local_addr()?
        );
        let destination = resolve_first(&client.destination_addresses).await;
        if destination.is_none() {
            warn!(
                "none of {:?} could be resolved",
                client.destination_addresses
            );
        }
        let (io, events) = TokioIo::new(transport);
        let session = WorkerSession::new(params, model, destination, sensor, notifier);
        Ok(Self {
            session,
            io,
            events,
        })
    }

    /// Returns the address the worker is listening on.
    ///
    /// # Errors
    /// Fails if the local address cannot be retrieved.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.io.local_addr()
    }

    /// Starts sampling and processes events until the service is dropped.
    pub async fn run(&mut self) {
        self.session.start(&mut self.io);
        while let Some(event) = self.events.recv().await {
            self.handle(event);
        }
        debug!("event queue closed");
    }

    fn handle(&mut self, event: Event<WorkerTimer>) {
        match event {
            Event::Inbound(Inbound { message, from }) => {
                self.session.on_message(message, from, &mut self.io)
            }
            Event::Timer(fired) => self.session.on_timer(fired, &mut self.io),
        }
    }

    pub fn session(&self) -> &WorkerSession<SimulatedModel, SocketAddr, N> {
        &self.session
    }
}
