//! Queue consumption loop for ingestion workers, plus process lifecycle helpers.
//!
//! A worker process runs `concurrency` slots. Each slot polls the work queue,
//! executes one job at a time under its own lease identity, and acknowledges
//! the message only after the job outcome has been recorded. Health is
//! reported on a fixed interval. A keep-alive loop heartbeats the queue and
//! returns deliveries held by dead peers. SIGINT/SIGTERM or a programmatic
//! notify stops polling and lets in-flight jobs drain.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use feedsync_queue::{parse_batch, QueueConsumer, QueueMessage};

use crate::error::SyncError;
use crate::worker::{IngestionWorker, JobOutcome};

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub name: String,
    pub concurrency: u32,
    /// Pause after an empty poll or a queue error.
    pub idle_wait: Duration,
    pub health_interval: Duration,
    /// Heartbeat period; must stay well under the queue's consumer TTL.
    pub heartbeat_interval: Duration,
    /// How long in-flight jobs may take to finish after shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            name: "sync-worker".to_string(),
            concurrency: 4,
            idle_wait: Duration::from_secs(1),
            health_interval: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(15),
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

/// Whether a failed job's message should be redelivered.
///
/// Data, credential and load failures are recorded on the job and retried by
/// the scheduler's sweep, so their messages are consumed. Store and queue
/// failures may have left no record at all.
fn should_redeliver(e: &SyncError) -> bool {
    matches!(e, SyncError::Store(_) | SyncError::Queue(_))
}

// ── WorkerRunner ─────────────────────────────────────────────────────

pub struct WorkerRunner;

impl WorkerRunner {
    /// Consume jobs until `shutdown` is notified, then drain the slots.
    pub async fn run(
        worker: Arc<IngestionWorker>,
        queue: Arc<dyn QueueConsumer>,
        config: RunnerConfig,
        shutdown: Arc<Notify>,
    ) {
        info!(worker = %config.name, concurrency = config.concurrency, "starting worker");

        let (stop_tx, stop_rx) = watch::channel(false);

        let health_handle = tokio::spawn(Self::health_loop(
            queue.clone(),
            config.name.clone(),
            config.health_interval,
            stop_rx.clone(),
        ));

        let keepalive_handle = tokio::spawn(Self::keepalive_loop(
            queue.clone(),
            config.name.clone(),
            config.heartbeat_interval,
            stop_rx.clone(),
        ));

        let slots: Vec<JoinHandle<()>> = (0..config.concurrency.max(1))
            .map(|slot| {
                let slot_worker = worker.for_slot(format!("{}-{slot}", worker.worker_id()));
                tokio::spawn(Self::slot_loop(
                    slot_worker,
                    queue.clone(),
                    config.idle_wait,
                    stop_rx.clone(),
                ))
            })
            .collect();

        shutdown.notified().await;
        info!(worker = %config.name, "shutdown signal received");
        let _ = stop_tx.send(true);
        health_handle.abort();
        keepalive_handle.abort();

        info!(worker = %config.name, timeout = ?config.shutdown_timeout, "draining in-flight jobs");
        match tokio::time::timeout(config.shutdown_timeout, join_all(slots)).await {
            Ok(_) => info!(worker = %config.name, "worker stopped gracefully"),
            Err(_) => {
                warn!(worker = %config.name, "in-flight jobs did not finish, forcing shutdown")
            }
        }
    }

    async fn slot_loop(
        worker: IngestionWorker,
        queue: Arc<dyn QueueConsumer>,
        idle_wait: Duration,
        mut stop: watch::Receiver<bool>,
    ) {
        debug!(slot = %worker.worker_id(), "slot started");
        while !*stop.borrow() {
            let messages = match queue.poll_batch(1).await {
                Ok(m) => m,
                Err(e) if e.is_transient() => {
                    warn!(slot = %worker.worker_id(), error = %e, "queue unreachable, backing off");
                    Vec::new()
                }
                Err(e) => {
                    error!(slot = %worker.worker_id(), error = %e, "queue poll failed");
                    Vec::new()
                }
            };

            if messages.is_empty() {
                tokio::select! {
                    _ = stop.changed() => {}
                    _ = tokio::time::sleep(idle_wait) => {}
                }
                continue;
            }

            Self::handle_batch(&worker, queue.as_ref(), &messages).await;
        }
        debug!(slot = %worker.worker_id(), "slot stopped");
    }

    async fn handle_batch(
        worker: &IngestionWorker,
        queue: &dyn QueueConsumer,
        messages: &[QueueMessage],
    ) {
        let (records, bad) = parse_batch(messages);

        // Unparseable bodies go back until the queue dead-letters them.
        for (msg, _) in bad {
            if let Err(e) = queue.nack(&msg.receipt_handle).await {
                warn!(message_id = %msg.id, error = %e, "nack failed");
            }
        }

        for (msg, record) in records {
            let redeliver = match worker.execute(&record).await {
                Ok(JobOutcome::Completed(_)) | Ok(JobOutcome::Skipped) => false,
                Err(e) => {
                    if should_redeliver(&e) {
                        error!(
                            job_id = %record.job_id,
                            attempt = msg.deliveries,
                            error = %e,
                            "job aborted, returning to queue"
                        );
                        true
                    } else {
                        false
                    }
                }
            };

            let acked = if redeliver {
                queue.nack(&msg.receipt_handle).await
            } else {
                queue.ack(&msg.receipt_handle).await
            };
            if let Err(e) = acked {
                warn!(
                    job_id = %record.job_id,
                    message_id = %msg.id,
                    error = %e,
                    "could not settle queue message"
                );
            }
        }
    }

    async fn health_loop(
        queue: Arc<dyn QueueConsumer>,
        name: String,
        interval: Duration,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match queue.health_check().await {
                        Ok(health) if health.reachable => {
                            info!(worker = %name, %health, "worker healthy")
                        }

                        Ok(health) => warn!(worker = %name, %health, "queue unreachable"),
                        Err(e) => warn!(worker = %name, error = %e, "queue health check failed"),
                    }
                }
                _ = stop.changed() => break,
            }
        }
    }
}

// ── Keep-alive ───────────────────────────────────────────────────

impl WorkerRunner {
    async fn keepalive_loop(
        queue: Arc<dyn QueueConsumer>,
        name: String,
        interval: Duration,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => Self::keep_alive(queue.as_ref(), &name).await,
                _ = stop.changed() => break,
            }
        }
    }

    async fn keep_alive(queue: &dyn QueueConsumer, name: &str) {
        if let Err(e) = queue.heartbeat().await {
            warn!(worker = %name, error = %e, "queue heartbeat failed");
            return;
        }
        match queue.reclaim_abandoned().await {
            Ok(0) => {}
            Ok(n) => info!(worker = %name, reclaimed = n, "requeued deliveries from a dead worker"),
            Err(e) => warn!(worker = %name, error = %e, "reclaim of abandoned deliveries failed"),
        }
    }
}

// ── Shutdown ─────────────────────────────────────────────────────────

/// Notify `shutdown` once SIGINT or SIGTERM arrives.
pub fn spawn_signal_handler(name: &str, shutdown: Arc<Notify>) -> JoinHandle<()> {
    let name = name.to_string();
    tokio::spawn(async move {
        os_signal().await;
        info!(process = %name, "shutdown signal received");
        shutdown.notify_one();
    })
}

/// Wait for SIGINT or SIGTERM (Unix) or Ctrl+C elsewhere.
pub async fn os_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => {}
                    _ = sigterm.recv() => {}
                }
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "could not register unix signals, falling back to ctrl_c");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!(error = %e, "failed to listen for ctrl_c");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl_c");
        }
    }
}
