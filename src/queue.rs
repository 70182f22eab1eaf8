//! Job queue over the PostgREST surface: exclusive claims, advisory
//! progress, terminal writes and best-effort event logging.

use chrono::Utc;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::{EventLevel, Job, JobFailure, ListingResult, PlatformAccount};
use crate::supabase::{SupabaseClient, SupabaseError};

const JOBS_TABLE: &str = "listing_jobs";
const EVENTS_TABLE: &str = "listing_job_events";
const ACCOUNTS_TABLE: &str = "platform_accounts";

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue request failed: {0}")]
    Supabase(#[from] SupabaseError),
    #[error("row malformed: {0}")]
    Malformed(String),
}

#[derive(Clone)]
pub struct JobQueue {
    supabase: SupabaseClient,
}

impl JobQueue {
    pub fn new(supabase: SupabaseClient) -> Self {
        Self { supabase }
    }

    /// Claim the oldest queued job, or None when there is nothing to do.
    ///
    /// Two steps: read the head of the queue, then flip it to `running`
    /// with the status repeated in the filter. When another worker got
    /// there first the filtered update matches zero rows, which is
    /// deliberately indistinguishable from an empty queue; the caller just
    /// polls again.
    pub async fn claim(&self) -> Result<Option<Job>, QueueError> {
        let rows = self
            .supabase
            .select(
                JOBS_TABLE,
                "status=eq.queued&select=*&order=created_at.asc&limit=1",
            )
            .await?;
        let Some(candidate) = rows.into_iter().next() else {
            return Ok(None);
        };
        let id = candidate["id"]
            .as_str()
            .ok_or_else(|| QueueError::Malformed("job row without id".to_string()))?
            .to_string();

        let filter = format!("id=eq.{}&status=eq.queued", id);
        let patch = json!({"status": "running", "updated_at": Utc::now()});
        let mut updated = self.supabase.update(JOBS_TABLE, &filter, &patch).await?;

        let Some(row) = updated.pop() else {
            debug!(target: "talos.queue", job = %id, "claim lost to another worker");
            return Ok(None);
        };
        let job: Job =
            serde_json::from_value(row).map_err(|err| QueueError::Malformed(err.to_string()))?;
        Ok(Some(job))
    }

    /// Advisory progress write. Failures are logged and swallowed; a job
    /// never dies because its progress bar did.
    pub async fn update_progress(&self, job_id: Uuid, percent: u8, message: &str) {
        let patch = json!({
            "progress": {"percent": percent, "message": message},
            "updated_at": Utc::now(),
        });
        if let Err(err) = self
            .supabase
            .update(JOBS_TABLE, &format!("id=eq.{}", job_id), &patch)
            .await
        {
            warn!(target: "talos.queue", job = %job_id, "progress update failed: {}", err);
        }
    }

    pub async fn complete(&self, job_id: Uuid, result: &ListingResult) -> Result<(), QueueError> {
        let patch = json!({
            "status": "completed",
            "result": result,
            "updated_at": Utc::now(),
        });
        self.supabase
            .update(JOBS_TABLE, &format!("id=eq.{}", job_id), &patch)
            .await?;
        Ok(())
    }

    pub async fn fail(
        &self,
        job_id: Uuid,
        message: &str,
        stage: Option<&str>,
    ) -> Result<(), QueueError> {
        let failure = JobFailure {
            message: message.to_string(),
            stage: stage.map(str::to_string),
        };
        let patch = json!({
            "status": "failed",
            "error": failure,
            "updated_at": Utc::now(),
        });
        self.supabase
            .update(JOBS_TABLE, &format!("id=eq.{}", job_id), &patch)
            .await?;
        Ok(())
    }

    pub async fn fetch_account(&self, id: Uuid) -> Result<Option<PlatformAccount>, QueueError> {
        let mut rows = self
            .supabase
            .select(ACCOUNTS_TABLE, &format!("id=eq.{}&select=*&limit=1", id))
            .await?;
        let Some(row) = rows.pop() else {
            return Ok(None);
        };
        let account: PlatformAccount =
            serde_json::from_value(row).map_err(|err| QueueError::Malformed(err.to_string()))?;
        Ok(Some(account))
    }

    /// Record a job event. Never propagates; a logging failure must not
    /// take the pipeline down with it.
    pub async fn log_event(
        &self,
        job_id: Uuid,
        level: EventLevel,
        message: &str,
        metadata: Option<Value>,
    ) {
        if let Err(err) = self.insert_event(job_id, level, message, metadata).await {
            warn!(target: "talos.queue", job = %job_id, "event insert failed: {}", err);
        }
    }

    /// The events table schema drifts between deployments (`level` vs
    /// `type`, `metadata` sometimes missing). Walk row shapes from richest
    /// to barest, advancing only on unknown-column rejections; any other
    /// error is real and comes straight back.
    async fn insert_event(
        &self,
        job_id: Uuid,
        level: EventLevel,
        message: &str,
        metadata: Option<Value>,
    ) -> Result<(), SupabaseError> {
        let meta = metadata.unwrap_or(Value::Null);
        let shapes = [
            json!({"job_id": job_id, "level": level.as_str(), "message": message, "metadata": meta}),
            json!({"job_id": job_id, "type": level.as_str(), "message": message, "metadata": meta}),
            json!({"job_id": job_id, "message": message}),
        ];

        let mut last = None;
        for (attempt, shape) in shapes.iter().enumerate() {
            match self.supabase.insert(EVENTS_TABLE, shape).await {
                Ok(()) => {
                    if attempt > 0 {
                        debug!(
                            target: "talos.queue",
                            attempt,
                            "event insert fell back to a thinner row shape"
                        );
                    }
                    return Ok(());
                }
                Err(err) if err.is_unknown_column() => {
                    last = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last.unwrap_or_else(|| {
            SupabaseError::Request("no event row shape accepted".to_string())
        }))
    }
}
