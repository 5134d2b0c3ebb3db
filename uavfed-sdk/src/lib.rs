#![cfg_attr(docsrs, feature(doc_cfg))]
//! The uavfed worker.
//!
//! A worker runs on a UAV. It samples its sensors periodically, trains its local replica of the
//! model on the buffered samples and submits the result to the coordinator, which answers with the
//! next global model.
//!
//! - [`worker`] contains the worker state machine. It is independent of any runtime.
//! - [`traits`] lets applications observe the worker.
//! - [`runtime`] runs the state machine on tokio with a UDP socket.
//! - [`settings`] loads the configuration of the `worker` binary.

pub mod runtime;
pub mod settings;
pub mod traits;
pub mod worker;

pub use self::traits::{Notify, PassiveNotifier};
