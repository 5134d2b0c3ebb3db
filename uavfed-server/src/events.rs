//! Phase changes and global models published by the [`RoundCoordinator`].
//!
//! Every event is tagged with the round it belongs to. Listeners only ever see the latest event
//! of a kind: a slow listener misses intermediate phases but never blocks the coordinator.
//!
//! [`RoundCoordinator`]: crate::coordinator::RoundCoordinator

use std::sync::Arc;

use tokio::sync::watch;
use uavfed_core::{RoundId, Weights};

use crate::coordinator::PhaseName;

/// An event tagged with its round.
#[derive(Debug, Clone, PartialEq)]
pub struct Event<E> {
    pub round_id: RoundId,
    pub event: E,
}

/// The global model as seen by listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelUpdate {
    /// No round has been aggregated yet.
    Invalidate,
    New(Arc<AggregatedModel>),
}

/// A global model together with its placeholder metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedModel {
    pub weights: Weights,
    pub accuracy: f64,
    pub loss: f64,
    /// The number of clients whose updates went into the model.
    pub participants: usize,
}

/// The coordinator side of the events.
#[derive(Debug)]
pub struct EventPublisher {
    round_id: RoundId,
    phases: EventBroadcaster<PhaseName>,
    models: EventBroadcaster<ModelUpdate>,
}

/// Hands out listeners. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventSubscriber {
    phases: EventListener<PhaseName>,
    models: EventListener<ModelUpdate>,
}

impl EventPublisher {
    /// Creates a publisher whose listeners initially see `phase` and no model.
    pub fn init(round_id: RoundId, phase: PhaseName) -> (Self, EventSubscriber) {
        let (phases, phase_listener) = EventBroadcaster::channel(Event {
            round_id,
            event: phase,
        });
        let (models, model_listener) = EventBroadcaster::channel(Event {
            round_id,
            event: ModelUpdate::Invalidate,
        });
        let publisher = Self {
            round_id,
            phases,
            models,
        };
        let subscriber = EventSubscriber {
            phases: phase_listener,
            models: model_listener,
        };
        (publisher, subscriber)
    }

    /// Tags the following events with round `id`.
    pub fn set_round_id(&mut self, id: RoundId) {
        self.round_id = id;
    }

    pub fn broadcast_phase(&mut self, phase: PhaseName) {
        self.phases.broadcast(self.round_id, phase);
    }

    pub fn broadcast_model(&mut self, update: ModelUpdate) {
        self.models.broadcast(self.round_id, update);
    }
}

impl EventSubscriber {
    pub fn phase_listener(&self) -> EventListener<PhaseName> {
        self.phases.clone()
    }

    pub fn model_listener(&self) -> EventListener<ModelUpdate> {
        self.models.clone()
    }
}

/// Receives the events of one kind.
#[derive(Debug, Clone)]
pub struct EventListener<E>(watch::Receiver<Event<E>>);

impl<E> EventListener<E>
where
    E: Clone,
{
    /// Returns the latest event, seen or not.
    pub fn get_latest(&self) -> Event<E> {
        self.0.borrow().clone()
    }

    /// Waits for an event that hasn't been seen yet. Returns `None` once the publisher is gone.
    pub async fn next(&mut self) -> Option<Event<E>> {
        self.0.changed().await.ok()?;
        Some(self.0.borrow().clone())
    }
}

#[derive(Debug)]
struct EventBroadcaster<E>(watch::Sender<Event<E>>);

impl<E> EventBroadcaster<E> {
    fn channel(initial: Event<E>) -> (Self, EventListener<E>) {
        let (tx, rx) = watch::channel(initial);
        (Self(tx), EventListener(rx))
    }

    fn broadcast(&self, round_id: RoundId, event: E) {
        // fails only without listeners
        let _ = self.0.send(Event { round_id, event });
    }
}
