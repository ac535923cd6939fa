use std::collections::VecDeque;
use std::panic;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Terminal task records kept for introspection.
const HISTORY_CAP: usize = 64;

pub type TaskFn = Box<dyn Fn() -> Result<(), String> + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("task queue is shut down")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub id: Uuid,
    pub label: String,
    pub status: TaskStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct QueueStatus {
    pub queued: usize,
    pub processing: bool,
    pub tasks: Vec<TaskSnapshot>,
}

struct PendingTask {
    id: Uuid,
    label: String,
    job: TaskFn,
    attempts: u32,
    max_attempts: u32,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
}

impl PendingTask {
    fn snapshot(&self, status: TaskStatus, error: Option<String>) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id,
            label: self.label.clone(),
            status,
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: match status {
                TaskStatus::Completed | TaskStatus::Failed => Some(Utc::now()),
                _ => None,
            },
            error,
        }
    }
}

struct QueueState {
    pending: VecDeque<PendingTask>,
    current: Option<TaskSnapshot>,
    history: VecDeque<TaskSnapshot>,
    closed: bool,
}

struct QueueInner {
    state: Mutex<QueueState>,
    /// Re-entrancy gate: set before any task is popped, so the worker
    /// loop never runs two iterations concurrently.
    processing: AtomicBool,
}

/// Single-worker, at-most-one-concurrent in-process task runner. FIFO
/// admission; a failed task goes back to the tail until its attempts are
/// exhausted. The worker thread exits when the queue drains and is
/// re-armed by the next enqueue, without polling.
///
/// There is no per-task timeout: a hung task blocks the worker
/// indefinitely. Known property, kept deliberately.
pub struct TaskQueue {
    inner: Arc<QueueInner>,
    max_attempts: u32,
}

impl TaskQueue {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    pending: VecDeque::new(),
                    current: None,
                    history: VecDeque::new(),
                    closed: false,
                }),
                processing: AtomicBool::new(false),
            }),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Append a task and return its id immediately; execution happens on
    /// the worker thread.
    pub fn enqueue(&self, label: &str, job: TaskFn) -> Result<Uuid, QueueError> {
        let id = Uuid::new_v4();
        {
            let mut state = self.inner.state.lock().expect("queue lock poisoned");
            if state.closed {
                return Err(QueueError::Closed);
            }
            state.pending.push_back(PendingTask {
                id,
                label: label.to_string(),
                job,
                attempts: 0,
                max_attempts: self.max_attempts,
                created_at: Utc::now(),
                started_at: None,
            });
        }
        info!("enqueued task {} ({})", id, label);
        arm_worker(&self.inner);
        Ok(id)
    }

    /// Consistent point-in-time snapshot: pending count, whether a task
    /// is in flight, and the visible task records (in-flight, then
    /// pending, then recent terminal ones).
    pub fn status(&self) -> QueueStatus {
        let state = self.inner.state.lock().expect("queue lock poisoned");
        let mut tasks = Vec::with_capacity(state.pending.len() + state.history.len() + 1);
        if let Some(current) = &state.current {
            tasks.push(current.clone());
        }
        for task in &state.pending {
            tasks.push(task.snapshot(TaskStatus::Queued, None));
        }
        for record in state.history.iter().rev() {
            tasks.push(record.clone());
        }
        QueueStatus {
            queued: state.pending.len(),
            processing: state.current.is_some(),
            tasks,
        }
    }

    /// Drop all pending tasks; the in-flight task (if any) keeps running.
    pub fn clear(&self) -> usize {
        let mut state = self.inner.state.lock().expect("queue lock poisoned");
        let cleared = state.pending.len();
        state.pending.clear();
        cleared
    }

    /// Stop accepting work and drop pending tasks. The in-flight task is
    /// allowed to finish. Returns the number of pending tasks dropped.
    pub fn shutdown(&self) -> usize {
        let mut state = self.inner.state.lock().expect("queue lock poisoned");
        state.closed = true;
        let cleared = state.pending.len();
        state.pending.clear();
        cleared
    }
}

fn arm_worker(inner: &Arc<QueueInner>) {
    if inner
        .processing
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
    {
        let inner = Arc::clone(inner);
        thread::spawn(move || worker_loop(inner));
    }
}

fn worker_loop(inner: Arc<QueueInner>) {
    loop {
        // Pop and mark in-flight under one lock, so a status snapshot
        // never sees the task in neither place.
        let task = {
            let mut state = inner.state.lock().expect("queue lock poisoned");
            match state.pending.pop_front() {
                Some(mut task) => {
                    task.attempts += 1;
                    task.started_at = Some(Utc::now());
                    state.current = Some(task.snapshot(TaskStatus::Processing, None));
                    Some(task)
                }
                None => None,
            }
        };

        let Some(task) = task else {
            inner.processing.store(false, Ordering::SeqCst);
            // An enqueue may have slipped in after the empty pop; take the
            // gate back rather than losing the wakeup.
            let has_work = {
                let state = inner.state.lock().expect("queue lock poisoned");
                !state.pending.is_empty()
            };
            if has_work
                && inner
                    .processing
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            {
                continue;
            }
            break;
        };

        // A panicking job must not unwind the worker with the gate still
        // held; count it as a failed attempt.
        let result = panic::catch_unwind(panic::AssertUnwindSafe(|| (task.job)()))
            .unwrap_or_else(|payload| Err(panic_message(payload)));
        let mut state = inner.state.lock().expect("queue lock poisoned");
        state.current = None;
        match result {
            Ok(()) => {
                info!("task {} ({}) completed", task.id, task.label);
                push_history(&mut state, task.snapshot(TaskStatus::Completed, None));
            }
            Err(message) if task.attempts < task.max_attempts => {
                warn!(
                    "task {} ({}) failed attempt {}/{}, re-queueing: {}",
                    task.id, task.label, task.attempts, task.max_attempts, message
                );
                // Back to the tail: later arrivals get a turn first.
                state.pending.push_back(task);
            }
            Err(message) => {
                error!(
                    "task {} ({}) failed permanently after {} attempts: {}",
                    task.id, task.label, task.attempts, message
                );
                let snapshot = task.snapshot(TaskStatus::Failed, Some(message));
                push_history(&mut state, snapshot);
            }
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("task panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("task panicked: {message}")
    } else {
        "task panicked".to_string()
    }
}

fn push_history(state: &mut QueueState, snapshot: TaskSnapshot) {
    state.history.push_back(snapshot);
    while state.history.len() > HISTORY_CAP {
        state.history.pop_front();
    }
}
