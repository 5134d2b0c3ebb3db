//! The messages exchanged between the coordinator and the workers.
//!
//! # The start round message
//! [`StartRound`] is broadcast by the coordinator when a round begins. It carries the round
//! number and the current global weights.
//!
//! # The model update message
//! [`ModelUpdate`] is sent by a worker after local training. It is weighted by the number of
//! samples the worker trained on. Within a round the coordinator keeps only the latest update of
//! each client.
//!
//! # The global model message
//! [`GlobalModel`] is broadcast by the coordinator after a successful aggregation, together with
//! the placeholder accuracy and loss of the new global model.
//!
//! # The sensor report message
//! [`SensorReport`] is a monitoring datagram a worker sends on every sensor tick. It has no
//! effect on the protocol.
//!
//! Each datagram holds exactly one [`Message`], encoded with [`bincode`].

use std::{fmt, time::Duration};

use derive_more::From;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::Weights;

/// Identity of a worker.
pub type ClientId = u32;

/// Number of a training round.
pub type RoundId = u64;

/// Upper bound of a single encoded message.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Announces the start of a round.
pub struct StartRound {
    pub round: RoundId,
    pub weights: Weights,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A locally trained model of a single worker.
pub struct ModelUpdate {
    /// The worker that trained the model.
    pub client_id: ClientId,
    /// The round the model was trained for.
    pub round: RoundId,
    /// The locally trained weights.
    pub weights: Weights,
    /// The number of samples the model was trained on. Used as the aggregation weight.
    pub sample_count: u64,
    /// How long the local training took.
    pub training_duration: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// The result of an aggregation.
pub struct GlobalModel {
    /// The round that produced this model.
    pub round: RoundId,
    pub weights: Weights,
    pub global_accuracy: f64,
    pub global_loss: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// A monitoring datagram.
pub struct SensorReport {
    pub client_id: ClientId,
    /// The number of samples the worker has buffered so far.
    pub samples_collected: u64,
}

#[derive(Debug, Clone, PartialEq, From, Serialize, Deserialize)]
/// Every message of the protocol.
pub enum Message {
    StartRound(StartRound),
    ModelUpdate(ModelUpdate),
    GlobalModel(GlobalModel),
    SensorReport(SensorReport),
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::StartRound(msg) => write!(f, "StartRound(round={})", msg.round),
            Message::ModelUpdate(msg) => write!(
                f,
                "ModelUpdate(client={}, round={})",
                msg.client_id, msg.round
            ),
            Message::GlobalModel(msg) => write!(f, "GlobalModel(round={})", msg.round),
            Message::SensorReport(msg) => write!(f, "SensorReport(client={})", msg.client_id),
        }
    }
}

#[derive(Debug, Error)]
/// Errors of the wire encoding.
pub enum CodecError {
    #[error("failed to encode message: {0}")]
    Encode(#[source] bincode::Error),
    #[error("failed to decode message: {0}")]
    Decode(#[source] bincode::Error),
    #[error("encoded message is {0} bytes which exceeds the datagram size")]
    TooLarge(usize),
}

impl Message {
    /// Serializes the message into a datagram payload.
    ///
    /// # Errors
    /// Fails if the message cannot be serialized or does not fit into a single datagram.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let bytes = bincode::serialize(self).map_err(CodecError::Encode)?;
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(CodecError::TooLarge(bytes.len()));
        }
        Ok(bytes)
    }

    /// Parses a message from a datagram payload.
    ///
    /// # Errors
    /// Fails if the payload is not a valid encoded message.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        bincode::deserialize(bytes).map_err(CodecError::Decode)
    }
}
