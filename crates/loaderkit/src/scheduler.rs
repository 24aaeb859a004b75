//! Owner-thread message queue.
//!
//! The scheduler is the only point where work done elsewhere re-enters the
//! owner thread:
//!
//! - background jobs post [`Message::TaskFinished`] through a [`MainSender`]
//! - content observers post [`Message::ContentChanged`]
//! - throttle timers become [`Message::TimerFired`] once their deadline passes
//!
//! Nothing here touches loader state. The manager drains ready messages with
//! [`Scheduler::take_ready`] and routes them to loaders by [`LoaderKey`].

use std::{
  collections::{BTreeMap, VecDeque},
  sync::{Arc, atomic::AtomicBool},
};

use tokio::{sync::mpsc, time::Instant};
use tracing::trace;

use crate::{
  error::LoadError,
  executor::{Executor, Job},
  loader::{LoaderKey, TaskId},
};

/// A message for the owner thread.
pub(crate) enum Message<D> {
  /// A background task returned, successfully or not.
  TaskFinished {
    loader: LoaderKey,
    task: TaskId,
    outcome: Result<D, LoadError>,
  },
  /// An external source signalled a content change.
  ContentChanged {
    loader: LoaderKey,
    pending: Arc<AtomicBool>,
  },
  /// A throttled task reached its scheduled start time.
  TimerFired { loader: LoaderKey, task: TaskId },
}

/// Cloneable sender used by background jobs and observers.
pub(crate) struct MainSender<D> {
  tx: mpsc::UnboundedSender<Message<D>>,
}

impl<D> Clone for MainSender<D> {
  fn clone(&self) -> Self {
    Self { tx: self.tx.clone() }
  }
}

impl<D> MainSender<D> {
  /// Post a message. Returns false if the owner has gone away.
  pub(crate) fn post(&self, msg: Message<D>) -> bool {
    self.tx.send(msg).is_ok()
  }
}

/// Handle to a scheduled timer, used to remove it before it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimerId {
  deadline: Instant,
  seq: u64,
}

impl TimerId {
  pub fn deadline(&self) -> Instant {
    self.deadline
  }
}

/// Owner-thread inbox plus an ordered list of pending timers.
pub struct Scheduler<D> {
  tx: mpsc::UnboundedSender<Message<D>>,
  rx: mpsc::UnboundedReceiver<Message<D>>,
  inbox: VecDeque<Message<D>>,
  timers: BTreeMap<TimerId, (LoaderKey, TaskId)>,
  next_seq: u64,
  in_flight: usize,
  executor: Arc<dyn Executor>,
}

impl<D: Send + 'static> Scheduler<D> {
  pub fn new(executor: Arc<dyn Executor>) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    Self {
      tx,
      rx,
      inbox: VecDeque::new(),
      timers: BTreeMap::new(),
      next_seq: 0,
      in_flight: 0,
      executor,
    }
  }

  pub fn executor(&self) -> &Arc<dyn Executor> {
    &self.executor
  }

  pub(crate) fn sender(&self) -> MainSender<D> {
    MainSender { tx: self.tx.clone() }
  }

  /// Hand a job to the executor and count it as in flight until its
  /// `TaskFinished` message is taken.
  pub(crate) fn spawn(&mut self, job: Job) {
    self.in_flight += 1;
    self.executor.execute(job);
  }

  /// Schedule a `TimerFired` message for `task` at `deadline`.
  pub(crate) fn post_at(&mut self, deadline: Instant, loader: LoaderKey, task: TaskId) -> TimerId {
    let id = TimerId {
      deadline,
      seq: self.next_seq,
    };
    self.next_seq += 1;
    self.timers.insert(id, (loader, task));
    trace!(?loader, ?task, "Timer scheduled");
    id
  }

  /// Remove a timer that has not fired yet.
  pub(crate) fn remove_timer(&mut self, id: TimerId) -> bool {
    self.timers.remove(&id).is_some()
  }

  /// Deadline of the earliest pending timer.
  pub fn next_deadline(&self) -> Option<Instant> {
    self.timers.keys().next().map(TimerId::deadline)
  }

  pub fn pending_timers(&self) -> usize {
    self.timers.len()
  }

  /// Background jobs submitted whose outcome has not been taken yet.
  pub fn in_flight(&self) -> usize {
    self.in_flight
  }

  /// True when nothing is queued, scheduled or running.
  pub fn is_idle(&mut self) -> bool {
    self.drain_channel();
    self.inbox.is_empty() && self.timers.is_empty() && self.in_flight == 0
  }

  fn drain_channel(&mut self) {
    while let Ok(msg) = self.rx.try_recv() {
      self.inbox.push_back(msg);
    }
  }

  fn timer_due(&self, now: Instant) -> bool {
    self.next_deadline().is_some_and(|deadline| deadline <= now)
  }

  /// True if [`take_ready`](Self::take_ready) would return something.
  pub fn has_ready(&mut self) -> bool {
    self.drain_channel();
    !self.inbox.is_empty() || self.timer_due(Instant::now())
  }

  /// Take every message that is ready now, in arrival order, followed by
  /// due timers in deadline order.
  pub(crate) fn take_ready(&mut self) -> VecDeque<Message<D>> {
    self.drain_channel();

    let now = Instant::now();
    while self.timer_due(now) {
      if let Some((_, (loader, task))) = self.timers.pop_first() {
        self.inbox.push_back(Message::TimerFired { loader, task });
      }
    }

    let ready = std::mem::take(&mut self.inbox);
    let finished = ready
      .iter()
      .filter(|msg| matches!(msg, Message::TaskFinished { .. }))
      .count();
    self.in_flight = self.in_flight.saturating_sub(finished);
    ready
  }

  /// Wait until at least one message or timer is ready.
  ///
  /// Cancel-safe: anything received before the future is dropped stays in
  /// the inbox.
  pub async fn wait_ready(&mut self) {
    loop {
      if self.has_ready() {
        return;
      }

      match self.next_deadline() {
        Some(deadline) => {
          tokio::select! {
            msg = self.rx.recv() => {
              if let Some(msg) = msg {
                self.inbox.push_back(msg);
              }
            }
            _ = tokio::time::sleep_until(deadline) => {}
          }
        }
        None => {
          // The scheduler holds a sender itself, so recv only ends with a message.
          if let Some(msg) = self.rx.recv().await {
            self.inbox.push_back(msg);
          }
        }
      }
    }
  }
}
