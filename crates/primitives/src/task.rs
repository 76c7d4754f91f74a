use std::{
    collections::HashMap,
    fmt,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use futures::FutureExt;
use tokio::task::{JoinError, JoinHandle};
use tracing::warn;

/// A set of named long-running tasks, each represented by a [`tokio::task::JoinHandle`].
///
/// Awaiting the set resolves as soon as any task exits. Since workers are expected to run
/// until cancellation, receiving a value outside of a shutdown means that a task failed, so
/// that the caller can handle it.
#[derive(Debug)]
pub struct CriticalTasks<E> {
    tasks: HashMap<String, JoinHandle<Result<(), E>>>,
}

impl<E> Default for CriticalTasks<E> {
    fn default() -> Self {
        Self { tasks: HashMap::new() }
    }
}

impl<E: Send + 'static> CriticalTasks<E> {
    /// Creates a new instance of `Self`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn the task and add it to the set of long-running tasks.
    pub fn add_task<F>(&mut self, task: F, name: &str)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        self.tasks.insert(name.to_owned(), handle);
    }

    /// Returns `true` if no task is tracked.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for every remaining task to exit, aborting those still running after `timeout`.
    pub async fn join_all(&mut self, timeout: Duration) {
        for (name, handle) in self.tasks.drain() {
            let abort = handle.abort_handle();
            if tokio::time::timeout(timeout, handle).await.is_err() {
                warn!(task = %name, "Task did not stop in time, aborting");
                abort.abort();
            }
        }
    }
}

/// How a critical task exited.
#[derive(Debug)]
pub enum TaskOutcome<E> {
    /// The task returned successfully.
    Completed,
    /// The task returned an error.
    Failed(E),
    /// The task panicked or was aborted.
    Crashed(JoinError),
}

/// The result of awaiting a task in the [`CriticalTasks`] set.
#[derive(Debug)]
pub struct TaskResult<E> {
    /// The name of the task.
    name: String,
    /// How the task exited.
    outcome: TaskOutcome<E>,
}

impl<E> TaskResult<E> {
    /// Creates a new instance of `TaskResult`.
    pub const fn new(name: String, outcome: TaskOutcome<E>) -> Self {
        Self { name, outcome }
    }

    /// Returns the name of the task.
    #[allow(clippy::missing_const_for_fn)]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Consumes the result and returns the outcome.
    pub fn into_outcome(self) -> TaskOutcome<E> {
        self.outcome
    }
}

impl<E: fmt::Display> TaskResult<E> {
    /// Returns a human-readable reason for the exit, or an empty string if the task completed.
    pub fn error_message(&self) -> String {
        match &self.outcome {
            TaskOutcome::Completed => String::new(),
            TaskOutcome::Failed(err) => err.to_string(),
            TaskOutcome::Crashed(err) => crash_message(err),
        }
    }
}

fn crash_message(err: &JoinError) -> String {
    if err.is_cancelled() {
        return "Task was aborted".to_owned()
    }

    // Display includes the panic message for string payloads.
    err.to_string()
}

impl<E> Future for CriticalTasks<E> {
    type Output = Option<TaskResult<E>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if this.tasks.is_empty() {
            return Poll::Ready(None);
        }

        let mut finished = None;
        for (name, task) in &mut this.tasks {
            if let Poll::Ready(res) = task.poll_unpin(cx) {
                let outcome = match res {
                    Ok(Ok(())) => TaskOutcome::Completed,
                    Ok(Err(e)) => TaskOutcome::Failed(e),
                    Err(e) => TaskOutcome::Crashed(e),
                };
                finished = Some((name.clone(), outcome));
                break;
            }
        }

        match finished {
            Some((name, outcome)) => {
                // A finished handle must not be polled again.
                this.tasks.remove(&name);
                Poll::Ready(Some(TaskResult::new(name, outcome)))
            }
            None => Poll::Pending,
        }
    }
}
