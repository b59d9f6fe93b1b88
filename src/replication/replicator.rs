//! Async Replicator
//!
//! Bounded task queue drained by a fixed pool of workers. Retryable
//! failures are retried with exponential backoff; anything else, or a
//! task that runs out of attempts, is dropped and counted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::ReplicationTask;
use crate::cluster::RemotingClient;
use crate::config::ReplicationConfig;
use crate::error::{Error, Result};
use crate::fingerprint::{Fingerprint, FingerprintIndex};
use crate::storage::LocalStore;

/// Replicator counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplicatorStats {
    /// Tasks accepted into the queue
    pub enqueued: u64,
    /// Tasks finished successfully
    pub completed: u64,
    /// Retry attempts made
    pub retried: u64,
    /// Tasks given up on
    pub dropped: u64,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    completed: AtomicU64,
    retried: AtomicU64,
    dropped: AtomicU64,
}

/// State shared by the workers
struct Shared {
    config: ReplicationConfig,
    store: Arc<LocalStore>,
    remoting: Arc<RemotingClient>,
    /// Used for follow-up tasks produced by workers
    sender: mpsc::Sender<ReplicationTask>,
    counters: Counters,
}

/// Background replication engine
pub struct AsyncReplicator {
    shared: Arc<Shared>,
    /// Foreground handle to the queue, taken on close
    sender: RwLock<Option<mpsc::Sender<ReplicationTask>>>,
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl AsyncReplicator {
    /// Start the worker pool (and the periodic query ticker, if enabled).
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: ReplicationConfig, store: Arc<LocalStore>, remoting: Arc<RemotingClient>) -> Self {
        let workers = config.workers.max(1);
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let (shutdown_tx, _) = watch::channel(false);

        let query_interval = config.query_interval();
        let shared = Arc::new(Shared {
            config,
            store,
            remoting,
            sender: sender.clone(),
            counters: Counters::default(),
        });

        let mut handles = Vec::with_capacity(workers + 1);
        for id in 0..workers {
            handles.push(tokio::spawn(worker_task(
                id,
                Arc::clone(&shared),
                Arc::clone(&receiver),
                shutdown_tx.subscribe(),
            )));
        }
        if let Some(interval) = query_interval {
            handles.push(tokio::spawn(ticker_task(
                Arc::clone(&shared),
                interval,
                shutdown_tx.subscribe(),
            )));
        }

        info!("Replicator started with {} workers", workers);

        Self {
            shared,
            sender: RwLock::new(Some(sender)),
            shutdown: shutdown_tx,
            handles: Mutex::new(handles),
        }
    }

    /// Queue an announcement of `batch`. Empty batches are skipped.
    pub async fn do_report(&self, batch: FingerprintIndex) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.enqueue(ReplicationTask::Report(batch)).await
    }

    /// Queue a download of `fp`
    pub async fn do_download(&self, fp: Fingerprint) -> Result<()> {
        self.enqueue(ReplicationTask::Download(fp)).await
    }

    /// Queue a full inventory query
    pub async fn do_query(&self) -> Result<()> {
        self.enqueue(ReplicationTask::QueryAll).await
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> ReplicatorStats {
        let c = &self.shared.counters;
        ReplicatorStats {
            enqueued: c.enqueued.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
        }
    }

    /// Check if the replicator has been closed
    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Stop accepting tasks and wait for every worker to exit.
    ///
    /// Queued tasks that have not started are discarded.
    pub async fn close(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        self.sender.write().take();

        let handles = std::mem::take(&mut *self.handles.lock());
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                warn!("Replication task ended abnormally: {}", e);
            }
        }

        let stats = self.stats();
        info!(
            "Replicator closed ({} completed, {} retried, {} dropped)",
            stats.completed, stats.retried, stats.dropped
        );
    }

    /// Wait for queue space, then queue `task`
    async fn enqueue(&self, task: ReplicationTask) -> Result<()> {
        let sender = self.sender.read().clone().ok_or(Error::ShuttingDown)?;
        sender.send(task).await.map_err(|_| Error::ShuttingDown)?;
        self.shared.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl Shared {
    /// Queue follow-up work without waiting. A full queue drops the task.
    fn follow_up(&self, task: ReplicationTask) -> bool {
        match self.sender.try_send(task) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(task)) => {
                warn!("Replication queue full, dropping follow-up {}", task);
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Give up on a task
    fn abandon(&self, task: &ReplicationTask) {
        if let ReplicationTask::Download(fp) = task {
            self.store.release_download(&fp.name);
        }
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Execute a task once
    async fn execute(&self, task: &ReplicationTask) -> Result<()> {
        match task {
            ReplicationTask::Report(batch) => self.remoting.report(batch).await,
            ReplicationTask::Download(fp) => self.download(fp).await,
            ReplicationTask::QueryAll => self.query_all().await,
        }
    }

    async fn download(&self, fp: &Fingerprint) -> Result<()> {
        if self.store.has(&fp.name) {
            debug!("{} already held locally, skipping download", fp.name);
            return Ok(());
        }

        let data = self.remoting.pull(fp).await?;
        let holders: Vec<String> = fp.hosts.iter().cloned().collect();
        let saved = self.store.save_file(&fp.name, &data, &holders)?;
        info!("Replicated {} ({} bytes)", saved.name, saved.size);

        self.follow_up(ReplicationTask::Report(saved.into_index()));
        Ok(())
    }

    async fn query_all(&self) -> Result<()> {
        let inventory = self.remoting.query_all().await?;
        let outcome = self.store.merge(inventory)?;
        self.store.persist()?;

        for e in &outcome.rejected {
            warn!("Inventory entry rejected: {}", e);
        }
        if !outcome.to_report.is_empty() {
            self.follow_up(ReplicationTask::Report(outcome.to_report));
        }
        for fp in outcome.to_download {
            let name = fp.name.clone();
            if !self.follow_up(ReplicationTask::Download(fp)) {
                self.store.release_download(&name);
            }
        }
        Ok(())
    }

    /// Run a task to completion, retrying retryable failures
    async fn run(&self, task: ReplicationTask, shutdown: &mut watch::Receiver<bool>) {
        let max_attempts = self.config.max_retries.max(1);
        let mut attempt = 1;

        loop {
            let result = tokio::select! {
                result = self.execute(&task) => result,
                _ = shutdown.changed() => {
                    debug!("Abandoning {} on shutdown", task);
                    self.abandon(&task);
                    return;
                }
            };

            match result {
                Ok(()) => {
                    self.counters.completed.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = self.config.backoff(attempt);
                    debug!("{} failed (attempt {}): {}, retrying in {:?}", task, attempt, e, delay);
                    self.counters.retried.fetch_add(1, Ordering::Relaxed);
                    attempt += 1;

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => {
                            debug!("Abandoning {} on shutdown", task);
                            self.abandon(&task);
                            return;
                        }
                    }
                }
                Err(e) => {
                    warn!("Dropping {} after {} attempts: {}", task, attempt, e);
                    self.abandon(&task);
                    return;
                }
            }
        }
    }
}

/// Worker loop: take tasks until shutdown
async fn worker_task(
    id: usize,
    shared: Arc<Shared>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<ReplicationTask>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!("Replication worker {} started", id);

    loop {
        if *shutdown.borrow() {
            break;
        }

        let task = tokio::select! {
            task = async { receiver.lock().await.recv().await } => task,
            _ = shutdown.changed() => break,
        };
        let Some(task) = task else { break };

        debug!("Worker {} running {}", id, task);
        shared.run(task, &mut shutdown).await;
    }

    debug!("Replication worker {} stopped", id);
}

/// Periodically queue an inventory query while this node is master
async fn ticker_task(shared: Arc<Shared>, interval: std::time::Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if shared.remoting.is_master() {
                    debug!("Periodic inventory query");
                    shared.follow_up(ReplicationTask::QueryAll);
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}
