//! Per-job listing pipeline. Restores the account session, resolves the
//! photo set, then drives the marketplace processor through upload, form
//! fill, submit and verification, reporting progress and events along
//! the way. Per-job resources are released on every exit path.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use crate::bootstrap;
use crate::browser::{BrowserError, BrowserHost, BrowserSession};
use crate::models::{EventLevel, Job, ListingPayload, ListingResult};
use crate::photos::{PhotoIngestion, ScratchDir};
use crate::processor::{MarketplaceProcessor, ProcessorError, resolve_processor};
use crate::queue::JobQueue;

pub struct Pipeline {
    queue: JobQueue,
    host: Arc<dyn BrowserHost>,
    photos: PhotoIngestion,
}

impl Pipeline {
    pub fn new(queue: JobQueue, host: Arc<dyn BrowserHost>, photos: PhotoIngestion) -> Self {
        Self {
            queue,
            host,
            photos,
        }
    }

    /// Run one claimed job to a terminal result. The browser context and
    /// scratch directory opened here are closed before this returns, no
    /// matter which stage failed.
    pub async fn run(&self, job: &Job) -> Result<ListingResult, ListingError> {
        let payload: ListingPayload = serde_json::from_value(job.payload.clone())
            .map_err(|err| {
                ListingError::validation("claim", format!("payload does not parse: {err}"))
            })?;
        self.queue.update_progress(job.id, 5, "claimed").await;

        let account = self
            .queue
            .fetch_account(payload.platform_account_id)
            .await
            .map_err(|err| ListingError::internal("session", err.to_string()))?
            .ok_or_else(|| {
                ListingError::validation(
                    "session",
                    format!("platform account {} not found", payload.platform_account_id),
                )
            })?;
        if account.marketplace != payload.marketplace {
            return Err(ListingError::validation(
                "session",
                format!(
                    "account {} belongs to {}, job wants {}",
                    account.id,
                    account.marketplace.as_str(),
                    payload.marketplace.as_str()
                ),
            ));
        }

        let processor = resolve_processor(payload.marketplace);
        self.queue.update_progress(job.id, 10, "restoring session").await;
        let session = timed("session", async {
            bootstrap::create_session(self.host.as_ref(), &account, processor.create_url()).await
        })
        .await?;
        self.queue
            .log_event(job.id, EventLevel::Info, "session restored", None)
            .await;
        self.queue.update_progress(job.id, 20, "session ready").await;

        let scratch = match ScratchDir::create(job.id).await {
            Ok(scratch) => scratch,
            Err(err) => {
                release(session.as_ref(), None, job).await;
                return Err(ListingError::internal("photos", err.to_string()));
            }
        };

        let outcome = self
            .drive(job, &payload, processor, session.as_ref(), &scratch)
            .await;
        release(session.as_ref(), Some(&scratch), job).await;
        outcome
    }

    async fn drive(
        &self,
        job: &Job,
        payload: &ListingPayload,
        processor: &dyn MarketplaceProcessor,
        session: &dyn BrowserSession,
        scratch: &ScratchDir,
    ) -> Result<ListingResult, ListingError> {
        self.queue.update_progress(job.id, 30, "resolving photos").await;
        let resolved = timed("photos", async {
            Ok(self.photos.resolve_all(&payload.photos, scratch).await)
        })
        .await?;
        if resolved.is_empty() {
            return Err(ListingError::network(
                "photos",
                format!("none of {} photo references resolved", payload.photos.len()),
            ));
        }
        self.queue
            .log_event(
                job.id,
                EventLevel::Info,
                "photos resolved",
                Some(json!({"requested": payload.photos.len(), "resolved": resolved.len()})),
            )
            .await;

        self.queue.update_progress(job.id, 40, "uploading images").await;
        timed("upload_images", async {
            processor
                .upload_images(session, &resolved)
                .await
                .map_err(|err| ListingError::from_processor("upload_images", err))
        })
        .await?;
        self.queue
            .log_event(
                job.id,
                EventLevel::Info,
                "images uploaded",
                Some(json!({"count": resolved.len()})),
            )
            .await;
        self.queue.update_progress(job.id, 50, "images uploaded").await;

        timed("fill_form", async {
            processor
                .fill_form(session, payload)
                .await
                .map_err(|err| ListingError::from_processor("fill_form", err))
        })
        .await?;
        self.queue
            .log_event(job.id, EventLevel::Info, "form filled", None)
            .await;
        self.queue.update_progress(job.id, 60, "form filled").await;

        self.queue.update_progress(job.id, 75, "submitting").await;
        let submitted = timed("submit", async {
            processor
                .submit(session)
                .await
                .map_err(|err| ListingError::from_processor("submit", err))
        })
        .await?;
        if !submitted.navigated {
            self.queue
                .log_event(
                    job.id,
                    EventLevel::Warn,
                    "no navigation after submit, reading outcome in place",
                    None,
                )
                .await;
        }
        self.queue.update_progress(job.id, 90, "verifying listing").await;

        let record = timed("extract_url", async {
            processor
                .extract_listing(session)
                .await
                .map_err(|err| ListingError::from_processor("extract_url", err))
        })
        .await?;
        info!(
            target: "talos.worker",
            job = %job.id,
            listing = record.listing_id.as_deref().unwrap_or("-"),
            url = %record.listing_url,
            "listing published"
        );

        Ok(ListingResult {
            success: true,
            listing_id: record.listing_id,
            listing_url: Some(record.listing_url),
        })
    }
}

async fn release(session: &dyn BrowserSession, scratch: Option<&ScratchDir>, job: &Job) {
    if let Err(err) = session.close().await {
        warn!(target: "talos.worker", job = %job.id, "session close failed: {}", err);
    }
    if let Some(scratch) = scratch {
        scratch.cleanup().await;
    }
}

async fn timed<T, Fut>(stage: &'static str, fut: Fut) -> Result<T, ListingError>
where
    Fut: Future<Output = Result<T, ListingError>>,
{
    let started = Instant::now();
    let out = fut.await;
    crate::metrics::stage_elapsed(stage, started.elapsed().as_millis());
    out
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct ListingError {
    stage: &'static str,
    message: String,
    kind: ListingErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingErrorKind {
    /// The job could never have worked as submitted.
    Validation,
    /// A required page element was absent or unusable.
    ElementNotFound,
    /// A fetch or store call failed.
    Network,
    /// A navigation the flow depends on never finished.
    NavigationTimeout,
    /// The browser itself misbehaved.
    Browser,
    Internal,
}

impl ListingError {
    pub fn validation(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: ListingErrorKind::Validation,
        }
    }

    pub fn element_not_found(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: ListingErrorKind::ElementNotFound,
        }
    }

    pub fn network(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: ListingErrorKind::Network,
        }
    }

    pub fn browser(stage: &'static str, err: BrowserError) -> Self {
        let kind = match &err {
            BrowserError::ElementNotFound(_) => ListingErrorKind::ElementNotFound,
            BrowserError::NavigationTimeout(_) => ListingErrorKind::NavigationTimeout,
            _ => ListingErrorKind::Browser,
        };
        Self {
            stage,
            message: err.to_string(),
            kind,
        }
    }

    pub fn internal(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: ListingErrorKind::Internal,
        }
    }

    fn from_processor(stage: &'static str, err: ProcessorError) -> Self {
        match err {
            ProcessorError::MissingElement(what) => Self::element_not_found(stage, what),
            ProcessorError::ImageUpload { .. } => Self {
                stage,
                message: err.to_string(),
                kind: ListingErrorKind::Browser,
            },
            ProcessorError::Rejected(message) => Self::internal(stage, message),
            ProcessorError::Browser(inner) => Self::browser(stage, inner),
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> ListingErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}
