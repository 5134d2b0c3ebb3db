//! Runs a coordinator and several workers on a virtual clock.
//!
//! Messages and timers go through a single event queue ordered by virtual time, so every run is
//! deterministic. Scripted clients let a test submit hand-made updates next to the simulated
//! workers.

use std::{
    cell::RefCell,
    cmp::{Ordering, Reverse},
    collections::{BinaryHeap, HashMap, HashSet},
    rc::Rc,
    sync::{
        atomic::{AtomicBool, Ordering as AtomicOrdering},
        Arc,
    },
    time::Duration,
};

use tracing_subscriber::*;
use uavfed_core::{
    io::{Fired, Scheduler, TimerId, TimerToken, Transport},
    message::{ClientId, Message, ModelUpdate, RoundId},
    model::{Evaluator, Model, ModelShape, SimulatedModel, Weights},
};
use uavfed_sdk::{
    worker::{SensorSampler, WorkerParams, WorkerSession, WorkerTimer},
    PassiveNotifier,
};
use uavfed_server::{
    coordinator::{CoordinatorTimer, PhaseName, RoundCoordinator, RoundParams},
    events::{EventSubscriber, ModelUpdate as ModelEvent},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Node {
    Coordinator,
    Worker(usize),
    /// A client whose messages are injected by the test.
    Scripted(ClientId),
}

enum Action {
    Deliver {
        to: Node,
        from: Node,
        message: Message,
    },
    CoordinatorTimer(Fired<CoordinatorTimer>, Arc<AtomicBool>),
    WorkerTimer(usize, Fired<WorkerTimer>, Arc<AtomicBool>),
}

struct Scheduled {
    at: Duration,
    seq: u64,
    action: Action,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        (self.at, self.seq) == (other.at, other.seq)
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.at, self.seq).cmp(&(other.at, other.seq))
    }
}

struct CancelTimer(Arc<AtomicBool>);

impl Drop for CancelTimer {
    fn drop(&mut self) {
        self.0.store(true, AtomicOrdering::SeqCst);
    }
}

/// The virtual network and clock shared by all nodes.
struct Queue {
    now: Duration,
    seq: u64,
    next_timer: TimerId,
    latency: Duration,
    workers: usize,
    /// Nodes whose outgoing messages are lost.
    muted: HashSet<Node>,
    heap: BinaryHeap<Reverse<Scheduled>>,
}

impl Queue {
    fn push(&mut self, after: Duration, action: Action) {
        let scheduled = Scheduled {
            at: self.now + after,
            seq: self.seq,
            action,
        };
        self.seq += 1;
        self.heap.push(Reverse(scheduled));
    }

    fn deliver(&mut self, from: Node, to: Node, message: Message) {
        if !self.muted.contains(&from) {
            let latency = self.latency;
            self.push(latency, Action::Deliver { to, from, message });
        }
    }

    fn timer(&mut self) -> (TimerId, Arc<AtomicBool>) {
        let id = self.next_timer;
        self.next_timer += 1;
        (id, Arc::new(AtomicBool::new(false)))
    }
}

/// The I/O of a single node.
struct NodeIo {
    node: Node,
    queue: Rc<RefCell<Queue>>,
}

impl Transport<Node> for NodeIo {
    fn send(&mut self, message: Message, to: &Node) {
        self.queue.borrow_mut().deliver(self.node, *to, message);
    }

    fn broadcast(&mut self, message: Message) {
        let mut queue = self.queue.borrow_mut();
        for index in 0..queue.workers {
            queue.deliver(self.node, Node::Worker(index), message.clone());
        }
    }
}

impl Scheduler<CoordinatorTimer> for NodeIo {
    fn schedule(&mut self, after: Duration, timer: CoordinatorTimer) -> TimerToken {
        let mut queue = self.queue.borrow_mut();
        let (id, cancelled) = queue.timer();
        queue.push(
            after,
            Action::CoordinatorTimer(Fired { id, timer }, cancelled.clone()),
        );
        TimerToken::new(id, CancelTimer(cancelled))
    }
}

impl Scheduler<WorkerTimer> for NodeIo {
    fn schedule(&mut self, after: Duration, timer: WorkerTimer) -> TimerToken {
        let index = match self.node {
            Node::Worker(index) => index,
            other => panic!("{:?} has no worker timers", other),
        };
        let mut queue = self.queue.borrow_mut();
        let (id, cancelled) = queue.timer();
        queue.push(
            after,
            Action::WorkerTimer(index, Fired { id, timer }, cancelled.clone()),
        );
        TimerToken::new(id, CancelTimer(cancelled))
    }
}

type Worker = WorkerSession<SimulatedModel, Node, PassiveNotifier>;

struct Simulation {
    queue: Rc<RefCell<Queue>>,
    coordinator: RoundCoordinator<SimulatedModel, Node>,
    coordinator_io: NodeIo,
    events: EventSubscriber,
    workers: Vec<(Worker, NodeIo)>,
    /// Messages received by scripted clients.
    inboxes: HashMap<Node, Vec<Message>>,
}

const SHAPE: ModelShape = ModelShape {
    input_size: 2,
    output_size: 1,
};

fn enable_logging() {
    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(true)
        .try_init();
}

fn round_params() -> RoundParams {
    RoundParams {
        start_time: Duration::from_secs(1),
        aggregation_interval: Duration::from_secs(10),
        round_interval: Duration::from_secs(5),
        early_aggregation_delay: Duration::from_millis(100),
        min_updates: 2,
        total_clients: 3,
    }
}

fn worker_params(client_id: ClientId) -> WorkerParams {
    WorkerParams {
        client_id,
        start_time: Duration::from_millis(500),
        sensor_interval: Duration::from_secs(1),
        training_interval: Duration::from_secs(2),
        dispatch_delay: Duration::from_millis(10),
        data_collection_size: 3,
        report_sensor_data: true,
    }
}

fn model(seed: u64) -> SimulatedModel {
    SimulatedModel::with_weights(SHAPE, Weights::zeros(2), Some(seed), Evaluator::fixed(0.9))
        .unwrap()
}

fn update(client_id: ClientId, round: RoundId, weights: Vec<f64>, sample_count: u64) -> Message {
    ModelUpdate {
        client_id,
        round,
        weights: weights.into(),
        sample_count,
        training_duration: Duration::from_secs(2),
    }
    .into()
}

impl Simulation {
    /// Creates a coordinator and one worker per destination. A worker without destination can't
    /// send anything.
    fn new(params: RoundParams, destinations: &[Option<Node>]) -> Self {
        enable_logging();
        let queue = Rc::new(RefCell::new(Queue {
            now: Duration::default(),
            seq: 0,
            next_timer: 0,
            latency: Duration::from_millis(1),
            workers: destinations.len(),
            muted: HashSet::new(),
            heap: BinaryHeap::new(),
        }));
        let (coordinator, events) = RoundCoordinator::new(params, model(0));
        let coordinator_io = NodeIo {
            node: Node::Coordinator,
            queue: queue.clone(),
        };
        let workers = destinations
            .iter()
            .enumerate()
            .map(|(index, destination)| {
                let seed = index as u64 + 1;
                let session = WorkerSession::new(
                    worker_params(index as ClientId + 1),
                    model(seed),
                    *destination,
                    SensorSampler::new(SHAPE.input_size, Some(seed)),
                    PassiveNotifier,
                );
                let io = NodeIo {
                    node: Node::Worker(index),
                    queue: queue.clone(),
                };
                (session, io)
            })
            .collect();
        Self {
            queue,
            coordinator,
            coordinator_io,
            events,
            workers,
            inboxes: HashMap::new(),
        }
    }

    fn start(&mut self) {
        self.coordinator.start(&mut self.coordinator_io);
        for (worker, io) in self.workers.iter_mut() {
            worker.start(io);
        }
    }

    fn now(&self) -> Duration {
        self.queue.borrow().now
    }

    fn mute(&mut self, node: Node) {
        self.queue.borrow_mut().muted.insert(node);
    }

    /// Delivers `message` from `from` to the coordinator at `at`.
    fn inject(&mut self, at: Duration, from: Node, message: Message) {
        let mut queue = self.queue.borrow_mut();
        let after = at - queue.now;
        queue.push(
            after,
            Action::Deliver {
                to: Node::Coordinator,
                from,
                message,
            },
        );
    }

    /// Processes the next event if it is due at or before `until`.
    fn step(&mut self, until: Duration) -> bool {
        let scheduled = {
            let mut queue = self.queue.borrow_mut();
            match queue.heap.peek() {
                Some(Reverse(next)) if next.at <= until => {}
                _ => return false,
            }
            match queue.heap.pop() {
                Some(Reverse(scheduled)) => {
                    queue.now = scheduled.at;
                    scheduled
                }
                None => return false,
            }
        };
        self.dispatch(scheduled.action);
        true
    }

    fn dispatch(&mut self, action: Action) {
        match action {
            Action::Deliver { to, from, message } => match to {
                Node::Coordinator => {
                    self.coordinator
                        .on_message(message, from, &mut self.coordinator_io)
                }
                Node::Worker(index) => {
                    let (worker, io) = &mut self.workers[index];
                    worker.on_message(message, from, io);
                }
                scripted => self.inboxes.entry(scripted).or_default().push(message),
            },
            Action::CoordinatorTimer(fired, cancelled) => {
                if !cancelled.load(AtomicOrdering::SeqCst) {
                    self.coordinator.on_timer(fired, &mut self.coordinator_io);
                }
            }
            Action::WorkerTimer(index, fired, cancelled) => {
                if !cancelled.load(AtomicOrdering::SeqCst) {
                    let (worker, io) = &mut self.workers[index];
                    worker.on_timer(fired, io);
                }
            }
        }
    }

    /// Runs until the virtual clock reaches `until`.
    fn run_until(&mut self, until: Duration) {
        while self.step(until) {}
        self.queue.borrow_mut().now = until;
    }

    /// Runs until `rounds` rounds were completed, then lets the global model reach the workers.
    fn run_rounds(&mut self, rounds: u64, deadline: Duration) {
        while self.coordinator.stats().rounds_completed < rounds {
            assert!(self.step(deadline), "deadline reached at {:?}", self.now());
        }
        let settle = self.now() + Duration::from_millis(10);
        self.run_until(settle);
    }

    fn worker(&self, index: usize) -> &Worker {
        &self.workers[index].0
    }

    fn inbox(&self, node: Node) -> &[Message] {
        self.inboxes.get(&node).map(Vec::as_slice).unwrap_or(&[])
    }
}

fn secs(secs: f64) -> Duration {
    Duration::from_secs_f64(secs)
}

#[test]
fn test_rounds_with_simulated_workers() {
    let destinations = [Some(Node::Coordinator); 3];
    let mut sim = Simulation::new(round_params(), &destinations);
    sim.start();
    sim.run_rounds(5, secs(120.0));

    let stats = sim.coordinator.stats();
    assert_eq!(stats.rounds_completed, 5);
    assert!(stats.updates_accepted >= 10);
    assert!(stats.sensor_reports > 0);
    assert_eq!(sim.coordinator.clients().len(), 3);
    assert_eq!(sim.coordinator.round_id(), 5);
    assert_eq!(sim.coordinator.phase(), PhaseName::Idle);

    let global = sim.coordinator.global_weights().clone();
    assert_ne!(global, Weights::zeros(2));
    for index in 0..3 {
        let worker = sim.worker(index);
        assert_eq!(worker.round(), 5);
        assert_eq!(worker.model().weights(), &global);
        assert_eq!(worker.stats().global_models, 5);
        assert!(worker.buffered_samples() >= 3);
    }

    let latest = sim.events.model_listener().get_latest();
    assert_eq!(latest.round_id, 4);
    match latest.event {
        ModelEvent::New(model) => {
            assert_eq!(model.weights, global);
            assert_eq!(model.participants, 3);
        }
        ModelEvent::Invalidate => panic!("no model published"),
    }
}

#[test]
fn test_weighted_average_and_stale_update() {
    let a = Node::Scripted(1);
    let b = Node::Scripted(2);
    let c = Node::Scripted(3);
    let mut sim = Simulation::new(round_params(), &[]);
    sim.start();
    sim.run_until(secs(1.0));
    assert!(sim.coordinator.is_round_in_progress());
    assert_eq!(sim.coordinator.global_weights(), &Weights::zeros(2));

    sim.inject(secs(2.0), a, update(1, 0, vec![1.0, 1.0], 10));
    sim.inject(secs(3.0), b, update(2, 0, vec![3.0, 3.0], 30));
    sim.run_until(secs(11.5));

    assert_eq!(
        sim.coordinator.global_weights(),
        &Weights::from(vec![2.5, 2.5])
    );
    assert_eq!(sim.coordinator.round_id(), 1);
    for node in [a, b].iter() {
        match sim.inbox(*node) {
            [Message::GlobalModel(global)] => {
                assert_eq!(global.round, 0);
                assert_eq!(global.weights, Weights::from(vec![2.5, 2.5]));
            }
            other => panic!("unexpected messages {:?}", other),
        }
    }

    // the late update of round 0 is stale once round 1 started
    sim.run_until(secs(16.5));
    assert!(sim.coordinator.is_round_in_progress());
    sim.inject(secs(17.0), c, update(3, 0, vec![9.0, 9.0], 90));
    sim.run_until(secs(17.5));

    assert_eq!(sim.coordinator.stored_updates(), 0);
    assert_eq!(sim.coordinator.stats().updates_rejected, 1);
    assert_eq!(
        sim.coordinator.global_weights(),
        &Weights::from(vec![2.5, 2.5])
    );
    assert!(sim.inbox(c).is_empty());
}

#[test]
fn test_quorum_miss_defers_aggregation() {
    let a = Node::Scripted(1);
    let b = Node::Scripted(2);
    let mut sim = Simulation::new(round_params(), &[]);
    sim.start();

    sim.inject(secs(2.0), a, update(1, 0, vec![1.0, 1.0], 10));
    sim.run_until(secs(11.5));

    // the aggregation timer fired at 11s with a single update
    assert_eq!(sim.coordinator.phase(), PhaseName::QuorumWait);
    assert_eq!(sim.coordinator.global_weights(), &Weights::zeros(2));
    assert_eq!(sim.coordinator.round_id(), 0);
    assert!(sim.coordinator.is_round_in_progress());
    assert!(sim.inbox(a).is_empty());

    sim.inject(secs(13.0), b, update(2, 0, vec![3.0, 3.0], 30));
    sim.run_until(secs(15.9));
    assert_eq!(sim.coordinator.global_weights(), &Weights::zeros(2));
    assert_eq!(sim.coordinator.stored_updates(), 2);

    // retried after half the aggregation interval
    sim.run_until(secs(16.1));
    assert_eq!(
        sim.coordinator.global_weights(),
        &Weights::from(vec![2.5, 2.5])
    );
    assert_eq!(sim.coordinator.round_id(), 1);
    assert_eq!(sim.inbox(a).len(), 1);
    assert_eq!(sim.inbox(b).len(), 1);
}

#[test]
fn test_lost_worker_does_not_block_rounds() {
    let destinations = [Some(Node::Coordinator); 3];
    let mut sim = Simulation::new(round_params(), &destinations);
    sim.mute(Node::Worker(2));
    sim.start();
    sim.run_rounds(3, secs(120.0));

    assert_eq!(sim.coordinator.clients().len(), 2);
    assert!(sim.coordinator.clients().values().all(|node| *node != Node::Worker(2)));
    let global = sim.coordinator.global_weights().clone();
    assert_eq!(sim.worker(0).model().weights(), &global);
    assert_eq!(sim.worker(1).model().weights(), &global);

    // only the broadcast of the first round reached the lost worker
    let lost = sim.worker(2);
    assert_eq!(lost.stats().packets_received, 1);
    assert_eq!(lost.stats().global_models, 0);
    assert_eq!(lost.round(), 0);
}

#[test]
fn test_worker_without_destination_only_receives() {
    let params = RoundParams {
        min_updates: 1,
        total_clients: 2,
        ..round_params()
    };
    let mut sim = Simulation::new(params, &[Some(Node::Coordinator), None]);
    sim.start();
    sim.run_rounds(2, secs(120.0));

    let silent = sim.worker(1);
    assert!(!silent.is_sending_enabled());
    assert_eq!(silent.stats().packets_sent, 0);
    assert_eq!(silent.buffered_samples(), 0);
    // trained on the broadcast round start, but its update went nowhere
    assert_eq!(silent.stats().trainings, 1);

    assert_eq!(sim.coordinator.clients().len(), 1);
    assert_eq!(
        sim.worker(0).model().weights(),
        sim.coordinator.global_weights()
    );
}
