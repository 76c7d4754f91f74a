use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use keel_primitives::DelayedMessage;

/// The outcome of [`DelayedMessageLog::append`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The message was the next expected one and was appended.
    Appended,
    /// The message index is already known. It was dropped.
    Duplicate,
    /// The message does not follow the last known one. It was dropped.
    Gap {
        /// The index the log expected next.
        expected: u64,
    },
}

/// An ordered, contiguous log of delayed messages shared between the inbox reader (the only
/// writer) and the sequencer.
///
/// INVARIANT: message indexes are `first..first + len`, without gaps.
#[derive(Debug, Clone, Default)]
pub struct DelayedMessageLog {
    inner: Arc<Mutex<LogInner>>,
}

#[derive(Debug, Default)]
struct LogInner {
    /// The index of the first message in `messages`.
    first: u64,
    messages: VecDeque<DelayedMessage>,
}

impl LogInner {
    fn next_index(&self) -> u64 {
        self.first + self.messages.len() as u64
    }
}

impl DelayedMessageLog {
    /// Creates an empty log expecting `start` as the next index.
    pub fn new(start: u64) -> Self {
        Self { inner: Arc::new(Mutex::new(LogInner { first: start, messages: VecDeque::new() })) }
    }

    fn lock(&self) -> MutexGuard<'_, LogInner> {
        // Every critical section leaves the log consistent, so a poisoned lock is still usable.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop every message and expect `start` as the next index.
    pub fn rebase(&self, start: u64) {
        let mut inner = self.lock();
        inner.first = start;
        inner.messages.clear();
    }

    /// The index of the next message the log accepts.
    pub fn next_index(&self) -> u64 {
        self.lock().next_index()
    }

    /// The number of messages held.
    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    /// Returns `true` if no message is held.
    pub fn is_empty(&self) -> bool {
        self.lock().messages.is_empty()
    }

    /// Append a message, keeping the log contiguous.
    pub fn append(&self, msg: DelayedMessage) -> AppendOutcome {
        let mut inner = self.lock();
        let expected = inner.next_index();

        if msg.index < expected {
            return AppendOutcome::Duplicate;
        }
        if msg.index > expected {
            return AppendOutcome::Gap { expected };
        }

        inner.messages.push_back(msg);
        AppendOutcome::Appended
    }

    /// Returns at most `max` messages starting from index `from`, in order.
    pub fn range(&self, from: u64, max: usize) -> Vec<DelayedMessage> {
        let inner = self.lock();
        let skip = from.saturating_sub(inner.first) as usize;
        inner.messages.iter().skip(skip).take(max).cloned().collect()
    }

    /// Drop the messages with an index lower than `index`, once they are sequenced.
    pub fn prune(&self, index: u64) {
        let mut inner = self.lock();
        while inner.first < index && inner.messages.pop_front().is_some() {
            inner.first += 1;
        }
    }
}
