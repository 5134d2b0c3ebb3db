//! The I/O seams of the protocol roles.
//!
//! The coordinator and the workers are plain state machines: they react to incoming messages and
//! fired timers, and they emit messages and arm timers through the traits of this module. They
//! never wait on anything themselves.

use std::{any::Any, fmt, time::Duration};

use crate::message::Message;

/// Delivers messages to peers. Delivery is best effort: messages can be lost, duplicated or
/// reordered.
pub trait Transport<A> {
    /// Sends `message` to a single peer.
    fn send(&mut self, message: Message, to: &A);

    /// Sends `message` to every peer reachable through the wildcard destination.
    fn broadcast(&mut self, message: Message);
}

/// Arms timers on behalf of a role.
pub trait Scheduler<T> {
    /// Arms a timer that fires `timer` after `after` has elapsed.
    ///
    /// The timer is cancelled when the returned token is dropped.
    fn schedule(&mut self, after: Duration, timer: T) -> TimerToken;
}

/// Everything a role needs to interact with the outside world.
pub trait IO<A, T>: Transport<A> + Scheduler<T> {}

impl<A, T, I> IO<A, T> for I where I: Transport<A> + Scheduler<T> {}

/// Identifies an armed timer. Unique per scheduler.
pub type TimerId = u64;

/// A fired timer as it is handed back to its role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fired<T> {
    pub id: TimerId,
    pub timer: T,
}

/// Dropping `TimerToken` cancels the associated timer.
pub struct TimerToken {
    id: TimerId,
    _on_cancel: Box<dyn Any + Send>,
}

impl TimerToken {
    /// Creates a token. `on_cancel` is dropped together with the token.
    pub fn new(id: TimerId, on_cancel: impl Any + Send) -> Self {
        Self {
            id,
            _on_cancel: Box::new(on_cancel),
        }
    }

    pub fn id(&self) -> TimerId {
        self.id
    }

    /// Checks whether `fired` was armed through this token.
    pub fn armed<T>(&self, fired: &Fired<T>) -> bool {
        self.id == fired.id
    }
}

impl fmt::Debug for TimerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerToken").field("id", &self.id).finish()
    }
}

/// Takes the token out of `slot` if it armed `fired`.
///
/// A role keeps at most one token per logical timer. A fired timer that doesn't match the token in
/// its slot was cancelled or replaced after it had already been queued, and must be ignored.
pub fn take_if_armed<T>(slot: &mut Option<TimerToken>, fired: &Fired<T>) -> Option<TimerToken> {
    if slot.as_ref().map_or(false, |token| token.armed(fired)) {
        slot.take()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    use super::*;

    struct SetOnDrop(Arc<AtomicBool>);

    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_dropping_the_token_cancels() {
        let cancelled = Arc::new(AtomicBool::new(false));
        let token = TimerToken::new(1, SetOnDrop(cancelled.clone()));
        assert!(!cancelled.load(Ordering::SeqCst));
        drop(token);
        assert!(cancelled.load(Ordering::SeqCst));
    }

    #[test]
    fn test_take_if_armed() {
        let mut slot = Some(TimerToken::new(2, ()));

        assert!(take_if_armed(&mut slot, &Fired { id: 1, timer: () }).is_none());
        assert!(slot.is_some());

        let token = take_if_armed(&mut slot, &Fired { id: 2, timer: () }).unwrap();
        assert_eq!(token.id(), 2);
        assert!(slot.is_none());

        assert!(take_if_armed(&mut None, &Fired { id: 2, timer: () }).is_none());
    }
}
