// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Conversation lock manager.
//!
//! Serializes all work for a given conversation while capping how many
//! distinct conversations run at once. Each conversation id owns a FIFO
//! queue of handlers drained by a single executor task; the executor holds
//! one permit of a global semaphore for as long as its queue has work, so
//! at most `max_concurrent` conversations make progress at any instant.
//!
//! Handlers get a [`CancelToken`] for cooperative cancellation; the manager
//! never pre-empts. A handler that fails still counts as completed for
//! queue purposes, and its error is returned to the `acquire` caller.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{oneshot, watch, Notify, Semaphore};
use tracing::debug;

use crate::error::LockError;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Cooperative cancellation signal handed to every handler.
///
/// Fires when the manager begins shutdown; long-running handlers should
/// check it at their own suspension boundaries.
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until cancellation is requested.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// A token that never fires; useful for tests and direct invocations.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // Keep the sender alive forever so the channel never closes.
        std::mem::forget(tx);
        Self { rx }
    }
}

/// Point-in-time view of the lock manager.
#[derive(Debug, Clone)]
pub struct LockStats {
    /// Conversations currently executing a handler.
    pub active: usize,
    /// Handlers waiting across all conversations.
    pub queued_total: usize,
    /// Waiting handlers per conversation (non-empty queues only).
    pub queued_by_conversation: HashMap<String, usize>,
    /// Ids of conversations currently executing.
    pub active_conversation_ids: Vec<String>,
    /// Configured concurrency cap.
    pub max_concurrent: usize,
}

struct QueueState {
    jobs: VecDeque<Job>,
    executor_running: bool,
    executing: bool,
}

impl QueueState {
    fn new() -> Self {
        Self {
            jobs: VecDeque::new(),
            executor_running: false,
            executing: false,
        }
    }
}

struct Inner {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    queues: Mutex<HashMap<String, QueueState>>,
    idle: Notify,
    cancel_tx: watch::Sender<bool>,
    shutting_down: AtomicBool,
}

/// Process-wide registry serializing work per conversation id.
pub struct ConversationLockManager {
    inner: Arc<Inner>,
}

impl ConversationLockManager {
    /// Create a manager allowing up to `max_concurrent` conversations to
    /// execute simultaneously.
    pub fn new(max_concurrent: usize) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
                max_concurrent: max_concurrent.max(1),
                queues: Mutex::new(HashMap::new()),
                idle: Notify::new(),
                cancel_tx,
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    /// Enqueue `handler` under `id` and wait for it to run.
    ///
    /// Handlers for the same id complete in submission order; handlers for
    /// distinct ids run concurrently up to the global cap. The handler's
    /// output (including its error, if it returns `Result`) is passed back
    /// to the caller unchanged.
    pub async fn acquire<T, F, Fut>(&self, id: &str, handler: F) -> Result<T, LockError>
    where
        F: FnOnce(CancelToken) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(LockError::ShuttingDown);
        }

        let (tx, rx) = oneshot::channel();
        let token = CancelToken {
            rx: self.inner.cancel_tx.subscribe(),
        };
        let fut = handler(token);
        let job: Job = Box::pin(async move {
            let _ = tx.send(fut.await);
        });

        let spawn_executor = {
            let mut queues = self.inner.queues.lock().unwrap();
            let state = queues
                .entry(id.to_string())
                .or_insert_with(QueueState::new);
            state.jobs.push_back(job);
            if state.executor_running {
                false
            } else {
                state.executor_running = true;
                true
            }
        };

        if spawn_executor {
            let inner = Arc::clone(&self.inner);
            let id = id.to_string();
            tokio::spawn(async move {
                Inner::run_queue(inner, id).await;
            });
        }

        rx.await.map_err(|_| LockError::HandlerDropped)
    }

    /// Snapshot of queue depths and active conversations.
    pub fn stats(&self) -> LockStats {
        let queues = self.inner.queues.lock().unwrap();
        let mut queued_by_conversation = HashMap::new();
        let mut active_conversation_ids = Vec::new();
        let mut queued_total = 0;

        for (id, state) in queues.iter() {
            if !state.jobs.is_empty() {
                queued_total += state.jobs.len();
                queued_by_conversation.insert(id.clone(), state.jobs.len());
            }
            if state.executing {
                active_conversation_ids.push(id.clone());
            }
        }
        active_conversation_ids.sort();

        LockStats {
            active: active_conversation_ids.len(),
            queued_total,
            queued_by_conversation,
            active_conversation_ids,
            max_concurrent: self.inner.max_concurrent,
        }
    }

    /// Stop admitting new work, signal cancellation, and wait for every
    /// in-flight and queued handler to finish.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let _ = self.inner.cancel_tx.send(true);
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.queues.lock().unwrap().is_empty() {
                break;
            }
            notified.await;
        }
        debug!("lock manager drained");
    }
}

impl Inner {
    async fn run_queue(inner: Arc<Inner>, id: String) {
        // One permit per conversation with pending work; held until the
        // queue drains so same-id handlers never re-contend.
        let permit = match inner.semaphore.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => return,
        };

        loop {
            let job = {
                let mut queues = inner.queues.lock().unwrap();
                match queues.get_mut(&id) {
                    Some(state) => match state.jobs.pop_front() {
                        Some(job) => {
                            state.executing = true;
                            Some(job)
                        }
                        None => {
                            queues.remove(&id);
                            None
                        }
                    },
                    None => None,
                }
            };

            match job {
                Some(job) => {
                    job.await;
                    let mut queues = inner.queues.lock().unwrap();
                    if let Some(state) = queues.get_mut(&id) {
                        state.executing = false;
                    }
                }
                None => break,
            }
        }

        drop(permit);
        inner.idle.notify_waiters();
    }
}
