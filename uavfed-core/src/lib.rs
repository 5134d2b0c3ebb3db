#![cfg_attr(docsrs, feature(doc_cfg))]
//! Shared building blocks of the uavfed federated averaging system.
//!
//! A single coordinator (the base station) and many workers (the UAVs) train one global
//! model over a lossy datagram network. This crate contains everything both roles share:
//!
//! - the wire [`message`]s and their [`bincode`] encoding,
//! - the model abstraction in [`model`], with a simulated model and pluggable
//!   evaluation strategies,
//! - the sample-count-weighted [`aggregation`] of model weights,
//! - the sans-IO seams in [`io`]: a [`Transport`] for datagrams and a [`Scheduler`]
//!   for cancellable timers,
//! - a tokio based implementation of those seams in [`net`], [`timer`] and [`runtime`],
//! - the [`settings`] both roles share.
//!
//! The protocol roles themselves live in the `uavfed-server` (coordinator) and
//! `uavfed-sdk` (worker) crates. They never perform I/O directly, so they can be driven
//! by the tokio runtime as well as by a deterministic test harness.
//!
//! [`Transport`]: crate::io::Transport
//! [`Scheduler`]: crate::io::Scheduler

pub mod aggregation;
pub mod io;
pub mod message;
pub mod model;
pub mod net;
pub mod runtime;
pub mod settings;
pub mod timer;

#[cfg(any(test, feature = "testutils"))]
#[cfg_attr(docsrs, doc(cfg(feature = "testutils")))]
pub mod testutils;

pub use self::{
    aggregation::{federated_average, AggregationError},
    message::{ClientId, GlobalModel, Message, ModelUpdate, RoundId, SensorReport, StartRound},
    model::{Model, ModelError, Weights},
};
