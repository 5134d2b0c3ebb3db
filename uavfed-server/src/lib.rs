#![cfg_attr(docsrs, feature(doc_cfg))]
//! The uavfed coordinator.
//!
//! The coordinator runs on the base station. It owns the global model and drives the federated
//! averaging rounds: it announces each round to the workers, collects their model updates,
//! averages them weighted by sample count and sends the new global model back.
//!
//! - [`coordinator`] contains the round state machine. It is independent of any runtime.
//! - [`events`] publishes phase changes and new global models to interested parties.
//! - [`runtime`] runs the state machine on tokio with a UDP socket.
//! - [`settings`] loads the configuration of the `coordinator` binary.

pub mod coordinator;
pub mod events;
pub mod runtime;
pub mod settings;
