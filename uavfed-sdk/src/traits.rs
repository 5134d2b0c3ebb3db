use uavfed_core::message::RoundId;

/// A trait used by the [`WorkerSession`] to emit notifications upon
/// certain events.
///
/// [`WorkerSession`]: crate::worker::WorkerSession
pub trait Notify {
    /// Emit a notification when the coordinator starts a new round
    fn notify_new_round(&mut self, _round: RoundId) {}
    /// Emit a notification when local training starts
    fn notify_training(&mut self, _sample_count: u64) {}
    /// Emit a notification when a model update has been sent to the
    /// coordinator
    fn notify_update_sent(&mut self, _round: RoundId) {}
    /// Emit a notification when the coordinator published a new
    /// global model
    fn notify_global_model(&mut self, _round: RoundId, _accuracy: f64, _loss: f64) {}
}

/// A notifier that ignores every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassiveNotifier;

impl Notify for PassiveNotifier {}
