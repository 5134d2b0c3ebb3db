//! Timers on top of the tokio runtime.

use std::{marker::PhantomData, time::Duration};

use tokio::{sync::mpsc, task::JoinHandle, time::sleep};
use tracing::trace;

use crate::io::{Fired, Scheduler, TimerId, TimerToken};

/// Aborts the sleeping task when dropped.
pub(crate) struct AbortOnDrop(pub(crate) JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// A [`Scheduler`] that spawns a sleeping task per timer. When the timer fires, a [`Fired`] event
/// is pushed into the event queue of the owning role.
#[derive(Debug)]
pub struct TokioScheduler<T, E> {
    events: mpsc::UnboundedSender<E>,
    next_id: TimerId,
    _timer: PhantomData<fn(T)>,
}

impl<T, E> TokioScheduler<T, E> {
    pub fn new(events: mpsc::UnboundedSender<E>) -> Self {
        Self {
            events,
            next_id: 0,
            _timer: PhantomData,
        }
    }
}

impl<T, E> Scheduler<T> for TokioScheduler<T, E>
where
    T: Send + 'static,
    E: From<Fired<T>> + Send + 'static,
{
    fn schedule(&mut self, after: Duration, timer: T) -> TimerToken {
        let id = self.next_id;
        self.next_id += 1;

        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            sleep(after).await;
            trace!("timer {} fired", id);
            // the role may already be gone
            let _ = events.send(Fired { id, timer }.into());
        });
        TimerToken::new(id, AbortOnDrop(handle))
    }
}
