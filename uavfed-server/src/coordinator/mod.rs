//! The round coordinator.
//!
//! # Overview
//!
//! The [`RoundCoordinator`] owns the global model and drives the training rounds. It is a
//! sans-IO state machine: the runtime feeds it received messages via
//! [`RoundCoordinator::on_message()`] and fired timers via [`RoundCoordinator::on_timer()`], and
//! it answers through the [`IO`] it is handed.
//!
//! # Phases
//!
//! **Idle**
//!
//! No round is in progress. The round start timer is armed.
//!
//! **Collecting**
//!
//! A round started: the global model was sent to every registered client (or broadcast if no
//! client is known yet) and the aggregation timer is armed. Model updates of the current round
//! are collected, keeping the latest update per client. Once every expected client has submitted,
//! the aggregation timer is moved forward to a short grace delay.
//!
//! **QuorumWait**
//!
//! The aggregation timer fired but the updates could not be aggregated yet, either because too
//! few clients submitted, the submitted models have the wrong dimension, or they carry no
//! samples. The aggregation is retried after half the aggregation interval while updates keep
//! being collected.
//!
//! **Aggregated**
//!
//! The updates were averaged, weighted by their sample counts, into the new global model, which
//! is sent to the clients. The round counter is incremented and the next round is scheduled.
//!
//! # Events
//!
//! Phase changes and new global models are published through an [`EventPublisher`]. The matching
//! [`EventSubscriber`] is returned by [`RoundCoordinator::new()`].
//!
//! [`IO`]: uavfed_core::io::IO

use std::{
    collections::{btree_map::Entry, BTreeMap},
    fmt::Debug,
    sync::Arc,
    time::Duration,
};

use derive_more::Display;
use displaydoc::Display as DisplayDoc;
use thiserror::Error;
use tracing::{debug, error, error_span, info, warn};
use uavfed_core::{
    aggregation::{federated_average, AggregationError},
    io::{take_if_armed, Fired, TimerToken, IO},
    message::{ClientId, GlobalModel, Message, ModelUpdate, RoundId, StartRound},
    model::{Model, ModelError, Weights},
};

use crate::events::{AggregatedModel, EventPublisher, EventSubscriber, ModelUpdate as ModelEvent};


/// Name of the current phase
#[derive(Debug, Display, Clone, Copy, Eq, PartialEq)]
pub enum PhaseName {
    #[display(fmt = "Idle")]
    Idle,
    #[display(fmt = "Collecting")]
    Collecting,
    #[display(fmt = "QuorumWait")]
    QuorumWait,
    #[display(fmt = "Aggregated")]
    Aggregated,
}

/// The timers of the coordinator.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CoordinatorTimer {
    StartRound,
    Aggregate,
}

/// Timing and quorum parameters of the rounds.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundParams {
    /// Delay before the first round starts.
    pub start_time: Duration,
    /// Time between the start of a round and the first aggregation attempt.
    pub aggregation_interval: Duration,
    /// Time between a successful aggregation and the start of the next round.
    pub round_interval: Duration,
    /// Delay of the aggregation once every expected client has submitted.
    pub early_aggregation_delay: Duration,
    /// Minimal number of distinct clients whose updates are needed to aggregate.
    pub min_updates: usize,
    /// Number of clients after which the aggregation is moved forward.
    pub total_clients: usize,
}

/// Error returned when a model update is not accepted.
#[derive(Debug, DisplayDoc, Error, PartialEq, Eq)]
pub enum UpdateError {
    /// update of client {client_id} for round {received} rejected, current round is {current}
    StaleOrFutureUpdate {
        client_id: ClientId,
        received: RoundId,
        current: RoundId,
    },
    /// update of client {client_id} rejected, no round is in progress
    NoRoundInProgress { client_id: ClientId },
}

/// Error returned when an aggregation attempt does not produce a new global model.
#[derive(Debug, Error, PartialEq)]
pub enum RoundError {
    #[error("quorum missed: {received} of {required} updates")]
    QuorumMiss { received: usize, required: usize },
    #[error("dropped {} updates whose models don't have {expected} weights", .clients.len())]
    DimensionMismatch {
        clients: Vec<ClientId>,
        expected: usize,
    },
    #[error("the stored updates carry no samples")]
    ZeroSamples,
    #[error("no round is in progress")]
    NoRoundInProgress,
    #[error(transparent)]
    Aggregation(#[from] AggregationError),
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// Counters of the coordinator.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Messages of any kind.
    pub packets_received: u64,
    pub updates_accepted: u64,
    pub updates_rejected: u64,
    pub sensor_reports: u64,
    pub rounds_completed: u64,
}

/// State of the current round.
#[derive(Debug, Default)]
struct RoundState {
    id: RoundId,
    in_progress: bool,
    /// The latest update of each client.
    updates: BTreeMap<ClientId, ModelUpdate>,
    /// Whether the aggregation was already moved forward in this round.
    early_aggregation: bool,
}

/// Drives the federated averaging rounds.
pub struct RoundCoordinator<M, A> {
    params: RoundParams,
    model: M,
    /// Last known address of every client that ever sent an update.
    clients: BTreeMap<ClientId, A>,
    round: RoundState,
    phase: PhaseName,
    events: EventPublisher,
    round_timer: Option<TimerToken>,
    aggregation_timer: Option<TimerToken>,
    stats: Stats,
}

impl<M, A> RoundCoordinator<M, A>
where
    M: Model,
    A: Clone + Eq + Debug,
{
    /// Creates a coordinator that starts with `model` as global model.
    pub fn new(params: RoundParams, model: M) -> (Self, EventSubscriber) {
        let (events, subscriber) = EventPublisher::init(0, PhaseName::Idle);
        let coordinator = Self {
            params,
            model,
            clients: BTreeMap::new(),
            round: RoundState::default(),
            phase: PhaseName::Idle,
            events,
            round_timer: None,
            aggregation_timer: None,
            stats: Stats::default(),
        };
        (coordinator, subscriber)
    }

    /// Arms the timer of the first round.
    pub fn start(&mut self, io: &mut dyn IO<A, CoordinatorTimer>) {
        info!(
            "first round starts in {:?}, model has {} weights",
            self.params.start_time,
            self.model.dim()
        );
        self.round_timer = Some(io.schedule(
            self.params.start_time,
            CoordinatorTimer::StartRound,
        ));
    }

    /// Handles a message received from `from`.
    pub fn on_message(&mut self, message: Message, from: A, io: &mut dyn IO<A, CoordinatorTimer>) {
        self.stats.packets_received += 1;
        match message {
            Message::ModelUpdate(update) => {
                if let Err(err) = self.on_update_received(update, from, io) {
                    warn!("{}", err);
                }
            }
            Message::SensorReport(report) => {
                self.stats.sensor_reports += 1;
                debug!(
                    "sensor report from client {} at {:?}: {} samples collected",
                    report.client_id, from, report.samples_collected
                );
            }
            other => warn!("unexpected message {} from {:?}", other, from),
        }
    }

    /// Handles a fired timer. Timers that were cancelled or replaced in the meantime are ignored.
    pub fn on_timer(
        &mut self,
        fired: Fired<CoordinatorTimer>,
        io: &mut dyn IO<A, CoordinatorTimer>,
    ) {
        match fired.timer {
            CoordinatorTimer::StartRound => {
                if take_if_armed(&mut self.round_timer, &fired).is_some() {
                    self.start_round(io);
                } else {
                    debug!("ignoring stale round start timer {}", fired.id);
                }
            }
            CoordinatorTimer::Aggregate => {
                if take_if_armed(&mut self.aggregation_timer, &fired).is_some() {
                    // errors are logged and retried by `aggregate`
                    let _ = self.aggregate(io);
                } else {
                    debug!("ignoring stale aggregation timer {}", fired.id);
                }
            }
        }
    }

    /// Starts a new round.
    ///
    /// Discards the updates of the previous round, sends the global model to every registered
    /// client and arms the aggregation timer.
    pub fn start_round(&mut self, io: &mut dyn IO<A, CoordinatorTimer>) {
        let _span = error_span!("round", round_id = self.round.id).entered();

        self.round_timer = None;
        self.round.in_progress = true;
        self.round.early_aggregation = false;
        self.round.updates.clear();
        self.events.set_round_id(self.round.id);
        self.set_phase(PhaseName::Collecting);

        let message = Message::from(StartRound {
            round: self.round.id,
            weights: self.model.weights().clone(),
        });
        self.send_to_clients(message, io);
        info!("round started, {} clients registered", self.clients.len());

        self.aggregation_timer = Some(io.schedule(
            self.params.aggregation_interval,
            CoordinatorTimer::Aggregate,
        ));
    }

    /// Stores a model update received from `from`.
    ///
    /// An unseen client id is registered at `from`, even if the update itself is rejected. The
    /// address of a known client is never replaced.
    ///
    /// # Errors
    /// Fails if no round is in progress or if the update belongs to another round.
    pub fn on_update_received(
        &mut self,
        update: ModelUpdate,
        from: A,
        io: &mut dyn IO<A, CoordinatorTimer>,
    ) -> Result<(), UpdateError> {
        let client_id = update.client_id;
        self.register(client_id, from);

        if !self.round.in_progress {
            self.stats.updates_rejected += 1;
            return Err(UpdateError::NoRoundInProgress { client_id });
        }
        if update.round != self.round.id {
            self.stats.updates_rejected += 1;
            return Err(UpdateError::StaleOrFutureUpdate {
                client_id,
                received: update.round,
                current: self.round.id,
            });
        }

        debug!(
            "update of client {} for round {}: {} samples",
            client_id, update.round, update.sample_count
        );
        if self.round.updates.insert(client_id, update).is_some() {
            debug!("replaced the previous update of client {}", client_id);
        }
        self.stats.updates_accepted += 1;

        if self.round.updates.len() >= self.params.total_clients && !self.round.early_aggregation {
            info!(
                "all {} expected clients submitted, aggregating in {:?}",
                self.params.total_clients, self.params.early_aggregation_delay
            );
            self.round.early_aggregation = true;
            // replacing the token cancels the pending aggregation timer
            self.aggregation_timer = Some(io.schedule(
                self.params.early_aggregation_delay,
                CoordinatorTimer::Aggregate,
            ));
        }
        Ok(())
    }

    /// Aggregates the stored updates into a new global model.
    ///
    /// On success the new model is sent to the clients, the round counter is incremented and
    /// the next round is scheduled.
    ///
    /// # Errors
    /// Fails if the updates can't be aggregated yet. The global model is left untouched and the
    /// aggregation is retried after half the aggregation interval.
    pub fn aggregate(&mut self, io: &mut dyn IO<A, CoordinatorTimer>) -> Result<(), RoundError> {
        let _span = error_span!("round", round_id = self.round.id).entered();

        if !self.round.in_progress {
            warn!("aggregation requested while no round is in progress");
            return Err(RoundError::NoRoundInProgress);
        }

        match self.try_aggregate() {
            Ok(aggregated) => {
                self.complete_round(aggregated, io);
                Ok(())
            }
            Err(err) => {
                match &err {
                    RoundError::QuorumMiss { .. } => info!("{}, retrying", err),
                    RoundError::DimensionMismatch { clients, .. } => {
                        error!("{} {:?}, retrying", err, clients)
                    }
                    _ => error!("aggregation failed: {}, retrying", err),
                }
                self.schedule_retry(io);
                Err(err)
            }
        }
    }

    fn try_aggregate(&mut self) -> Result<AggregatedModel, RoundError> {
        let received = self.round.updates.len();
        if received < self.params.min_updates {
            return Err(RoundError::QuorumMiss {
                received,
                required: self.params.min_updates,
            });
        }

        let dim = self.model.dim();
        let mismatched = self
            .round
            .updates
            .iter()
            .filter(|(_, update)| update.weights.len() != dim)
            .map(|(client_id, _)| *client_id)
            .collect::<Vec<_>>();
        if !mismatched.is_empty() {
            for client_id in mismatched.iter() {
                self.round.updates.remove(client_id);
            }
            return Err(RoundError::DimensionMismatch {
                clients: mismatched,
                expected: dim,
            });
        }

        let (models, weights): (Vec<&Weights>, Vec<u64>) = self
            .round
            .updates
            .values()
            .map(|update| (&update.weights, update.sample_count))
            .unzip();
        let total_samples = weights.iter().sum::<u64>();
        if total_samples == 0 {
            return Err(RoundError::ZeroSamples);
        }

        let global = federated_average(&models, &weights, dim)?;
        self.model.set_weights(global)?;

        let accuracy = self.model.evaluate(total_samples);
        Ok(AggregatedModel {
            weights: self.model.weights().clone(),
            accuracy,
            loss: 1.0 - accuracy,
            participants: received,
        })
    }

    fn complete_round(
        &mut self,
        aggregated: AggregatedModel,
        io: &mut dyn IO<A, CoordinatorTimer>,
    ) {
        info!(
            "aggregated {} updates, accuracy {:.4}, loss {:.4}",
            aggregated.participants, aggregated.accuracy, aggregated.loss
        );
        let message = Message::from(GlobalModel {
            round: self.round.id,
            weights: aggregated.weights.clone(),
            global_accuracy: aggregated.accuracy,
            global_loss: aggregated.loss,
        });
        self.send_to_clients(message, io);

        self.stats.rounds_completed += 1;
        self.set_phase(PhaseName::Aggregated);
        self.events.broadcast_model(ModelEvent::New(Arc::new(aggregated)));

        self.aggregation_timer = None;
        self.round.in_progress = false;
        self.round.id += 1;
        self.events.set_round_id(self.round.id);
        self.set_phase(PhaseName::Idle);

        self.round_timer = Some(io.schedule(
            self.params.round_interval,
            CoordinatorTimer::StartRound,
        ));
    }

    fn schedule_retry(&mut self, io: &mut dyn IO<A, CoordinatorTimer>) {
        self.round.early_aggregation = false;
        self.set_phase(PhaseName::QuorumWait);
        self.aggregation_timer = Some(io.schedule(
            self.params.aggregation_interval / 2,
            CoordinatorTimer::Aggregate,
        ));
    }

    fn register(&mut self, client_id: ClientId, from: A) {
        if let Entry::Vacant(entry) = self.clients.entry(client_id) {
            info!("registered client {} at {:?}", client_id, from);
            entry.insert(from);
        }
    }

    fn send_to_clients(&mut self, message: Message, io: &mut dyn IO<A, CoordinatorTimer>) {
        if self.clients.is_empty() {
            debug!("no registered clients, broadcasting {}", message);
            io.broadcast(message);
            return;
        }
        for addr in self.clients.values() {
            io.send(message.clone(), addr);
        }
    }

    fn set_phase(&mut self, phase: PhaseName) {
        if self.phase != phase {
            debug!("phase {} -> {}", self.phase, phase);
            self.phase = phase;
        }
        self.events.broadcast_phase(phase);
    }

    /// Logs the counters and the registered clients.
    pub fn log_summary(&self) {
        info!(
            "coordinator summary: {} packets received, {} updates accepted, {} updates rejected, \
             {} sensor reports, {} rounds completed",
            self.stats.packets_received,
            self.stats.updates_accepted,
            self.stats.updates_rejected,
            self.stats.sensor_reports,
            self.stats.rounds_completed
        );
        for (client_id, addr) in self.clients.iter() {
            info!("registered client {} at {:?}", client_id, addr);
        }
    }

    pub fn round_id(&self) -> RoundId {
        self.round.id
    }

    pub fn is_round_in_progress(&self) -> bool {
        self.round.in_progress
    }

    pub fn phase(&self) -> PhaseName {
        self.phase
    }

    pub fn global_weights(&self) -> &Weights {
        self.model.weights()
    }

    /// The update currently stored for `client_id`.
    pub fn stored_update(&self, client_id: ClientId) -> Option<&ModelUpdate> {
        self.round.updates.get(&client_id)
    }

    /// Number of distinct clients with a stored update in the current round.
    pub fn stored_updates(&self) -> usize {
        self.round.updates.len()
    }

    /// Last known address of every client.
    pub fn clients(&self) -> &BTreeMap<ClientId, A> {
        &self.clients
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }
}
