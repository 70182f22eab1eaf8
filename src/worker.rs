//! Claim loop. Polls the queue, runs each claimed job through the
//! pipeline, and writes the terminal row. One job's failure never takes
//! the loop down.

use std::time::{Duration, Instant};

use rand::Rng;
use serde_json::json;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::metrics;
use crate::models::{EventLevel, Job};
use crate::pipeline::Pipeline;
use crate::queue::JobQueue;

pub struct Worker {
    queue: JobQueue,
    pipeline: Pipeline,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(queue: JobQueue, pipeline: Pipeline) -> Self {
        Self {
            queue,
            pipeline,
            poll_interval: poll_interval_from_env(),
        }
    }

    #[cfg(test)]
    fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Poll until the shutdown flag flips. A claimed job always runs to
    /// its terminal state; shutdown only stops new claims.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(target: "talos.worker", "worker loop started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.queue.claim().await {
                Ok(Some(job)) => self.process(job).await,
                Ok(None) => {
                    // Jitter keeps a fleet of workers from polling in
                    // lockstep against the same head row.
                    if wait_or_shutdown(&mut shutdown, jitter(self.poll_interval)).await {
                        break;
                    }
                }
                Err(err) => {
                    warn!(target: "talos.worker", "claim failed: {}", err);
                    if wait_or_shutdown(&mut shutdown, self.poll_interval).await {
                        break;
                    }
                }
            }
        }
        info!(target: "talos.worker", "worker loop stopped");
    }

    async fn process(&self, job: Job) {
        metrics::job_claimed();
        info!(target: "talos.worker", job = %job.id, "job claimed");
        let started = Instant::now();

        match self.pipeline.run(&job).await {
            Ok(result) => {
                self.queue
                    .update_progress(job.id, 100, "listing published")
                    .await;
                if let Err(err) = self.queue.complete(job.id, &result).await {
                    error!(
                        target: "talos.worker",
                        job = %job.id, "completion write failed: {}", err
                    );
                }
                metrics::job_completed(started.elapsed().as_millis());
            }
            Err(err) => {
                error!(
                    target: "talos.worker",
                    job = %job.id, stage = err.stage(), "job failed: {}", err
                );
                self.queue
                    .log_event(
                        job.id,
                        EventLevel::Error,
                        &err.to_string(),
                        Some(json!({"stage": err.stage(), "kind": format!("{:?}", err.kind())})),
                    )
                    .await;
                if let Err(write_err) = self
                    .queue
                    .fail(job.id, err.detail(), Some(err.stage()))
                    .await
                {
                    error!(
                        target: "talos.worker",
                        job = %job.id, "failure write failed: {}", write_err
                    );
                }
                metrics::job_failed(err.stage());
            }
        }
    }
}

/// True when the shutdown flag flipped (or its sender is gone) before the
/// delay elapsed.
async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

fn jitter(base: Duration) -> Duration {
    let spread = (base.as_millis() as u64 / 4).max(1);
    base + Duration::from_millis(rand::rng().random_range(0..spread))
}

fn poll_interval_from_env() -> Duration {
    let secs = std::env::var("WORKER_POLL_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(5);
    Duration::from_secs(secs)
}
