//! Ownership of fire-and-forget background tasks.
//!
//! Log streams and socket forwards outlive the call that starts them. The
//! [`TaskSupervisor`] keeps their join handles and collects the error each
//! one ends with, so failures are logged and observable instead of lost.
//! Only the most recent backlog of failures is retained; once
//! [`FAILURE_BACKLOG`] records are waiting unread, later ones are logged and
//! dropped.

use std::future::Future;
use std::sync::{Mutex, PoisonError};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::ProviderError;

/// Unread failure records kept before new ones are dropped.
pub const FAILURE_BACKLOG: usize = 32;

/// A background task that stopped with an error.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TaskFailure {
    /// Name given to the task when it was spawned.
    pub task: String,
    /// Error the task returned.
    pub error: ProviderError,
}

/// Tracks spawned background tasks and their failures.
#[derive(Debug)]
pub struct TaskSupervisor {
    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
    failures_tx: Sender<TaskFailure>,
    failures_rx: tokio::sync::Mutex<Receiver<TaskFailure>>,
}

impl Default for TaskSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskSupervisor {
    /// Creates an empty supervisor.
    #[must_use]
    pub fn new() -> Self {
        let (failures_tx, failures_rx) = mpsc::channel(FAILURE_BACKLOG);
        Self {
            tasks: Mutex::new(Vec::new()),
            failures_tx,
            failures_rx: tokio::sync::Mutex::new(failures_rx),
        }
    }

    /// Spawns `task` on the current runtime under `name`.
    ///
    /// An error returned by the task is logged and queued for
    /// [`TaskSupervisor::next_failure`] while the backlog has room; it never
    /// propagates to the caller.
    pub fn spawn<F>(&self, name: impl Into<String>, task: F)
    where
        F: Future<Output = Result<(), ProviderError>> + Send + 'static,
    {
        let task_name = name.into();
        let failures = self.failures_tx.clone();
        let label = task_name.clone();
        let handle = tokio::spawn(async move {
            match task.await {
                Ok(()) => debug!(task = %label, "background task finished"),
                Err(err) => {
                    error!(task = %label, error = %err, "background task failed");
                    let failure = TaskFailure {
                        task: label,
                        error: err,
                    };
                    match failures.try_send(failure) {
                        Ok(()) => {}
                        Err(TrySendError::Full(dropped)) => {
                            warn!(task = %dropped.task, "failure backlog full; record dropped");
                        }
                        Err(TrySendError::Closed(_)) => {
                            debug!("supervisor dropped before failure was recorded");
                        }
                    }
                }
            }
        });

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|(_, existing)| !existing.is_finished());
        tasks.push((task_name, handle));
    }

    /// Names of tasks that have not finished yet.
    #[must_use]
    pub fn running(&self) -> Vec<String> {
        let tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Waits for the next task failure.
    ///
    /// Returns `None` only if the supervisor is being torn down.
    pub async fn next_failure(&self) -> Option<TaskFailure> {
        self.failures_rx.lock().await.recv().await
    }

    /// Returns every failure recorded so far without waiting.
    pub async fn drain_failures(&self) -> Vec<TaskFailure> {
        let mut receiver = self.failures_rx.lock().await;
        let mut drained = Vec::new();
        while let Ok(failure) = receiver.try_recv() {
            drained.push(failure);
        }
        drained
    }

    /// Aborts every tracked task.
    pub fn abort_all(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        for (name, handle) in tasks.drain(..) {
            debug!(task = %name, "aborting background task");
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn failures_are_reported_with_task_name() {
        let supervisor = TaskSupervisor::new();
        supervisor.spawn("logs:t1", async {
            Err(ProviderError::Transport {
                message: String::from("boom"),
            })
        });

        let failure = supervisor.next_failure().await.expect("failure recorded");
        assert_eq!(failure.task, "logs:t1");
        assert!(failure.error.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn successful_tasks_record_nothing() {
        let supervisor = TaskSupervisor::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        supervisor.spawn("quiet", async move {
            tx.send(()).map_err(|()| ProviderError::Sink {
                message: String::from("receiver gone"),
            })
        });
        rx.await.expect("task ran");
        tokio::task::yield_now().await;

        assert!(supervisor.drain_failures().await.is_empty());
    }

    #[tokio::test]
    async fn unread_failures_are_capped_at_backlog() {
        let supervisor = TaskSupervisor::new();
        for index in 0..FAILURE_BACKLOG + 5 {
            supervisor.spawn(format!("forward:t{index}"), async {
                Err(ProviderError::Transport {
                    message: String::from("gone"),
                })
            });
        }
        while !supervisor.running().is_empty() {
            tokio::task::yield_now().await;
        }

        let failures = supervisor.drain_failures().await;

        assert_eq!(failures.len(), FAILURE_BACKLOG);
        assert!(supervisor.drain_failures().await.is_empty());
    }

    #[tokio::test]
    async fn abort_all_stops_running_tasks() {
        let supervisor = TaskSupervisor::new();
        supervisor.spawn("forever", std::future::pending());
        assert_eq!(supervisor.running(), vec![String::from("forever")]);

        supervisor.abort_all();

        assert!(supervisor.running().is_empty());
    }
}
