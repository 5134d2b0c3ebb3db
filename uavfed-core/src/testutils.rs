//! Test doubles for the I/O seams.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use crate::{
    io::{Fired, Scheduler, TimerId, TimerToken, Transport},
    message::Message,
};

/// A timer armed through a [`Mailbox`].
#[derive(Debug)]
pub struct ArmedTimer<T> {
    pub id: TimerId,
    pub after: Duration,
    pub timer: T,
    cancelled: Arc<AtomicBool>,
}

impl<T: Clone> ArmedTimer<T> {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// The event the timer produces when it fires.
    pub fn fired(&self) -> Fired<T> {
        Fired {
            id: self.id,
            timer: self.timer.clone(),
        }
    }
}

struct CancelTimer(Arc<AtomicBool>);

impl Drop for CancelTimer {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Records everything a role sends and every timer it arms.
#[derive(Debug)]
pub struct Mailbox<A, T> {
    sent: Vec<(A, Message)>,
    broadcasts: Vec<Message>,
    timers: Vec<ArmedTimer<T>>,
    next_id: TimerId,
}

impl<A, T> Default for Mailbox<A, T> {
    fn default() -> Self {
        Self {
            sent: Vec::new(),
            broadcasts: Vec::new(),
            timers: Vec::new(),
            next_id: 0,
        }
    }
}

impl<A, T> Transport<A> for Mailbox<A, T>
where
    A: Clone,
{
    fn send(&mut self, message: Message, to: &A) {
        self.sent.push((to.clone(), message));
    }

    fn broadcast(&mut self, message: Message) {
        self.broadcasts.push(message);
    }
}

impl<A, T> Scheduler<T> for Mailbox<A, T> {
    fn schedule(&mut self, after: Duration, timer: T) -> TimerToken {
        let id = self.next_id;
        self.next_id += 1;
        let cancelled = Arc::new(AtomicBool::new(false));
        self.timers.push(ArmedTimer {
            id,
            after,
            timer,
            cancelled: cancelled.clone(),
        });
        TimerToken::new(id, CancelTimer(cancelled))
    }
}

impl<A, T> Mailbox<A, T>
where
    T: Clone + PartialEq,
{
    pub fn is_empty(&self) -> bool {
        self.sent.is_empty() && self.broadcasts.is_empty()
    }

    /// Takes the unicast messages, asserting how many there are.
    pub fn drain_sent(&mut self, expected: usize) -> Vec<(A, Message)> {
        assert_eq!(self.sent.len(), expected);
        self.sent.drain(..).collect()
    }

    /// Takes the broadcast messages, asserting how many there are.
    pub fn drain_broadcasts(&mut self, expected: usize) -> Vec<Message> {
        assert_eq!(self.broadcasts.len(), expected);
        self.broadcasts.drain(..).collect()
    }

    /// The timers that are armed and not cancelled.
    pub fn pending(&self) -> Vec<&ArmedTimer<T>> {
        self.timers.iter().filter(|t| !t.is_cancelled()).collect()
    }

    /// The most recently armed timer of the given kind that is still pending.
    pub fn pending_timer(&self, timer: &T) -> Option<&ArmedTimer<T>> {
        self.timers
            .iter()
            .rev()
            .find(|t| &t.timer == timer && !t.is_cancelled())
    }

    /// The most recently armed timer of the given kind, cancelled or not.
    pub fn last_timer(&self, timer: &T) -> Option<&ArmedTimer<T>> {
        self.timers.iter().rev().find(|t| &t.timer == timer)
    }
}
