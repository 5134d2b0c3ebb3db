//! The worker session of a UAV.
//!
//! # Overview
//!
//! A [`WorkerSession`] keeps a local replica of the global model, buffers the samples collected by
//! the UAV's sensors and trains on them whenever the coordinator asks for it. Like the
//! coordinator, it is a sans-IO state machine fed with received messages and fired timers.
//!
//! # Phases
//!
//! **Idle**
//!
//! The worker collects sensor samples and waits for the coordinator. A training is dispatched
//! when a round starts or when the buffer first reaches the configured collection size.
//!
//! **Training**
//!
//! The local model is trained on the buffered samples.
//!
//! **Submitted**
//!
//! The trained model was sent to the coordinator. The worker waits for the next global model.
//! If enough samples are buffered, the global model triggers the next local training after the
//! training interval.
//!
//! A global model may arrive in any phase. It replaces the local weights and moves the worker
//! to the round following the one that produced it.

mod sensor;

use std::{fmt::Debug, time::Duration};

use derive_more::Display;
use tracing::{debug, error_span, info, warn};
use uavfed_core::{
    io::{take_if_armed, Fired, TimerToken, IO},
    message::{ClientId, GlobalModel, Message, ModelUpdate, RoundId, SensorReport, StartRound},
    model::{Model, ModelError},
};

pub use self::sensor::SensorSampler;
use crate::traits::Notify;

/// Name of the current phase
#[derive(Debug, Display, Clone, Copy, Eq, PartialEq)]
pub enum WorkerPhase {
    #[display(fmt = "Idle")]
    Idle,
    #[display(fmt = "Training")]
    Training,
    #[display(fmt = "Submitted")]
    Submitted,
}

/// The timers of a worker.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum WorkerTimer {
    Sensor,
    Training,
}

/// Parameters of a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerParams {
    pub client_id: ClientId,
    /// Delay before the first sensor reading.
    pub start_time: Duration,
    /// Time between two sensor readings.
    pub sensor_interval: Duration,
    /// Delay of the local training after a global model. Also reported as training duration.
    pub training_interval: Duration,
    /// Delay of the local training after a round start or a full buffer.
    pub dispatch_delay: Duration,
    /// Number of buffered samples needed to train on the worker's own initiative.
    pub data_collection_size: usize,
    /// Whether every sensor reading is reported to the coordinator.
    pub report_sensor_data: bool,
}

/// Counters of a worker.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Model updates and sensor reports.
    pub packets_sent: u64,
    pub packets_received: u64,
    pub trainings: u64,
    pub global_models: u64,
}

/// The protocol state of a single worker.
pub struct WorkerSession<M, A, N> {
    params: WorkerParams,
    model: M,
    /// The coordinator. Sending is disabled without it.
    destination: Option<A>,
    notifier: N,
    sensor: SensorSampler,
    round: RoundId,
    phase: WorkerPhase,
    training_in_progress: bool,
    samples: Vec<Vec<f64>>,
    sensor_timer: Option<TimerToken>,
    training_timer: Option<TimerToken>,
    stats: Stats,
}

impl<M, A, N> WorkerSession<M, A, N>
where
    M: Model,
    A: Clone + Debug,
    N: Notify,
{
    pub fn new(
        params: WorkerParams,
        model: M,
        destination: Option<A>,
        sensor: SensorSampler,
        notifier: N,
    ) -> Self {
        Self {
            params,
            model,
            destination,
            notifier,
            sensor,
            round: 0,
            phase: WorkerPhase::Idle,
            training_in_progress: false,
            samples: Vec::new(),
            sensor_timer: None,
            training_timer: None,
            stats: Stats::default(),
        }
    }

    /// Arms the first sensor reading, unless the worker has no destination.
    pub fn start(&mut self, io: &mut dyn IO<A, WorkerTimer>) {
        match &self.destination {
            Some(destination) => {
                info!(
                    "client {} sends to {:?}, first sensor reading in {:?}",
                    self.params.client_id, destination, self.params.start_time
                );
                self.sensor_timer = Some(io.schedule(self.params.start_time, WorkerTimer::Sensor));
            }
            None => warn!(
                "client {} has no resolvable destination, it won't send anything",
                self.params.client_id
            ),
        }
    }

    /// Handles a message received from `from`.
    pub fn on_message(&mut self, message: Message, from: A, io: &mut dyn IO<A, WorkerTimer>) {
        self.stats.packets_received += 1;
        let res = match message {
            Message::StartRound(start) => self.on_start_round(start, io),
            Message::GlobalModel(global) => self.on_global_model(global, io),
            other => {
                warn!("unexpected message {} from {:?}", other, from);
                Ok(())
            }
        };
        if let Err(err) = res {
            warn!("ignoring message from {:?}: {}", from, err);
        }
    }

    /// Handles a fired timer. Timers that were cancelled or replaced in the meantime are ignored.
    pub fn on_timer(&mut self, fired: Fired<WorkerTimer>, io: &mut dyn IO<A, WorkerTimer>) {
        match fired.timer {
            WorkerTimer::Sensor => {
                if take_if_armed(&mut self.sensor_timer, &fired).is_some() {
                    self.collect_sensor_data(io);
                    self.sensor_timer =
                        Some(io.schedule(self.params.sensor_interval, WorkerTimer::Sensor));
                } else {
                    debug!("ignoring stale sensor timer {}", fired.id);
                }
            }
            WorkerTimer::Training => {
                if take_if_armed(&mut self.training_timer, &fired).is_some() {
                    self.perform_local_training(io);
                } else {
                    debug!("ignoring stale training timer {}", fired.id);
                }
            }
        }
    }

    /// Adopts the global weights of a starting round and dispatches a local training.
    ///
    /// # Errors
    /// Fails without any state change if the weights don't fit the local model.
    pub fn on_start_round(
        &mut self,
        start: StartRound,
        io: &mut dyn IO<A, WorkerTimer>,
    ) -> Result<(), ModelError> {
        self.model.set_weights(start.weights)?;
        self.round = start.round;
        self.phase = WorkerPhase::Idle;
        info!("round {} started", self.round);
        self.notifier.notify_new_round(self.round);

        if !self.training_in_progress {
            self.schedule_training(self.params.dispatch_delay, io);
        }
        Ok(())
    }

    /// Adopts a new global model and moves on to the next round.
    ///
    /// A global model of the last representable round is ignored.
    ///
    /// # Errors
    /// Fails without any state change if the weights don't fit the local model.
    pub fn on_global_model(
        &mut self,
        global: GlobalModel,
        io: &mut dyn IO<A, WorkerTimer>,
    ) -> Result<(), ModelError> {
        let next_round = match global.round.checked_add(1) {
            Some(next_round) => next_round,
            None => {
                warn!("ignoring global model of round {}: no next round", global.round);
                return Ok(());
            }
        };
        self.model.set_weights(global.weights)?;
        self.stats.global_models += 1;
        info!(
            "global model of round {}: accuracy {:.4}, loss {:.4}",
            global.round, global.global_accuracy, global.global_loss
        );
        self.notifier
            .notify_global_model(global.round, global.global_accuracy, global.global_loss);
        self.round = next_round;
        self.phase = WorkerPhase::Idle;

        if self.samples.len() >= self.params.data_collection_size && !self.training_in_progress {
            self.schedule_training(self.params.training_interval, io);
        }
        Ok(())
    }

    /// Trains the local model on the buffered samples and submits it.
    pub fn perform_local_training(&mut self, io: &mut dyn IO<A, WorkerTimer>) {
        if self.training_in_progress {
            debug!("training already in progress");
            return;
        }
        let _span = error_span!("training", round = self.round).entered();

        self.training_in_progress = true;
        self.phase = WorkerPhase::Training;
        let sample_count = self.samples.len() as u64;
        self.notifier.notify_training(sample_count);

        let outcome = self.model.train(sample_count);
        self.stats.trainings += 1;
        info!(
            "trained on {} samples, loss {:.4}",
            outcome.sample_count, outcome.loss
        );

        self.send_model_update(io);
        self.training_in_progress = false;
    }

    /// Sends the local model to the coordinator.
    pub fn send_model_update(&mut self, io: &mut dyn IO<A, WorkerTimer>) {
        let destination = match &self.destination {
            Some(destination) => destination,
            None => {
                warn!("sending is disabled, dropping the model update");
                self.phase = WorkerPhase::Idle;
                return;
            }
        };
        let update = ModelUpdate {
            client_id: self.params.client_id,
            round: self.round,
            weights: self.model.weights().clone(),
            sample_count: self.samples.len() as u64,
            training_duration: self.params.training_interval,
        };
        io.send(update.into(), destination);
        self.stats.packets_sent += 1;
        self.phase = WorkerPhase::Submitted;
        debug!("model update for round {} sent", self.round);
        self.notifier.notify_update_sent(self.round);
    }

    /// Buffers one sensor reading.
    ///
    /// A training is dispatched when the buffer reaches the collection size. Later readings
    /// don't dispatch another one, the next training follows the next global model.
    pub fn collect_sensor_data(&mut self, io: &mut dyn IO<A, WorkerTimer>) {
        let sample = self.sensor.sample();
        self.samples.push(sample);
        let collected = self.samples.len();
        debug!("collected sample #{}", collected);

        if self.params.report_sensor_data {
            if let Some(destination) = &self.destination {
                let report = SensorReport {
                    client_id: self.params.client_id,
                    samples_collected: collected as u64,
                };
                io.send(report.into(), destination);
                self.stats.packets_sent += 1;
            }
        }

        if collected == self.params.data_collection_size && !self.training_in_progress {
            info!("{} samples collected, scheduling local training", collected);
            self.schedule_training(self.params.dispatch_delay, io);
        }
    }

    fn schedule_training(&mut self, after: Duration, io: &mut dyn IO<A, WorkerTimer>) {
        // replacing the token cancels a pending training
        self.training_timer = Some(io.schedule(after, WorkerTimer::Training));
    }

    /// Logs the counters.
    pub fn log_summary(&self) {
        info!(
            "client {} summary: {} packets sent, {} packets received, {} trainings, \
             {} global models, {} samples buffered",
            self.params.client_id,
            self.stats.packets_sent,
            self.stats.packets_received,
            self.stats.trainings,
            self.stats.global_models,
            self.samples.len()
        );
    }

    pub fn client_id(&self) -> ClientId {
        self.params.client_id
    }

    pub fn round(&self) -> RoundId {
        self.round
    }

    pub fn phase(&self) -> WorkerPhase {
        self.phase
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn buffered_samples(&self) -> usize {
        self.samples.len()
    }

    pub fn is_sending_enabled(&self) -> bool {
        self.destination.is_some()
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }
}
