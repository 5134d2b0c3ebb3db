//! Runs the [`RoundCoordinator`] on the tokio runtime.

use std::net::SocketAddr;

use tokio::sync::mpsc;
use tracing::{debug, info};
use uavfed_core::{
    model::SimulatedModel,
    net::{Inbound, TransportError, UdpTransport},
    runtime::{Event, TokioIo},
};

use crate::{
    coordinator::{CoordinatorTimer, RoundCoordinator, RoundParams},
    events::EventSubscriber,
    settings::ApiSettings,
};

/// The coordinator together with its socket, its timers and its event queue.
pub struct CoordinatorService {
    coordinator: RoundCoordinator<SimulatedModel, SocketAddr>,
    io: TokioIo<CoordinatorTimer>,
    events: mpsc::UnboundedReceiver<Event<CoordinatorTimer>>,
}

impl CoordinatorService {
    /// Binds the coordinator's socket.
    ///
    /// # Errors
    /// Fails if the socket can't be bound.
    pub async fn init(
        api: &ApiSettings,
        params: RoundParams,
        model: SimulatedModel,
    ) -> Result<(Self, EventSubscriber), TransportError> {
        let transport = UdpTransport::bind(api.bind_address, api.broadcast_address).await?;
        info!("coordinator listening on {}", transport.local_addr()?);
        let (io, events) = TokioIo::new(transport);
        let (coordinator, subscriber) = RoundCoordinator::new(params, model);
        let service = Self {
            coordinator,
            io,
            events,
        };
        Ok((service, subscriber))
    }

    /// Returns the address the coordinator is listening on.
    ///
    /// # Errors
    /// Fails if the local address cannot be retrieved.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.io.local_addr()
    }

    /// Starts the first round and processes events until the service is dropped.
    pub async fn run(&mut self) {
        self.coordinator.start(&mut self.io);
        while let Some(event) = self.events.recv().await {
            self.handle(event);
        }
        debug!("event queue closed");
    }

    fn handle(&mut self, event: Event<CoordinatorTimer>) {
        match event {
            Event::Inbound(Inbound { message, from }) => {
                self.coordinator.on_message(message, from, &mut self.io)
            }
            Event::Timer(fired) => self.coordinator.on_timer(fired, &mut self.io),
        }
    }

    pub fn coordinator(&self) -> &RoundCoordinator<SimulatedModel, SocketAddr> {
        &self.coordinator
    }
}
