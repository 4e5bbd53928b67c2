//! The asynchronous chat pipeline.
//!
//! Submission path: validate → encrypt → persist as a pending job →
//! audit → enqueue. Worker path: claim the job, decrypt, then in order:
//! crisis short-circuit, cache lookup, spend-cap check, provider
//! routing. Successful outcomes are encrypted back into the job row;
//! failed attempts re-enter the queue with exponential backoff until
//! the retry budget is spent, at which point the job is dead-lettered.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kindred_crypto::PayloadCipher;
use kindred_llm::{ChatMessage, MessageRole, ProviderRouter, RoutedResponse};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::audit::{AuditAction, AuditEvent, AuditLogger, ClientMeta};
use crate::cache::{CachedResponse, ResponseCache};
use crate::error::{Error, Result};
use crate::jobs::{DeadLetterEntry, DeadLetterFilter, Job, JobStatus, JobStore, MAX_RETRIES};

/// Hard cap on messages per submission.
const MAX_MESSAGES: usize = 64;
/// Hard cap on total content length per submission.
const MAX_CONTENT_CHARS: usize = 16_000;

/// User-facing error text stored on dead-lettered jobs. The real error
/// stays on the dead-letter entry for operators.
const EXHAUSTED_MESSAGE: &str = "We couldn't process this message. Our team has been notified.";

/// Static reply when a user's trailing-24h spend cap is reached.
const COST_CAP_DETAIL: &str = "daily spend cap reached";

/// Pipeline tunables.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Retries before a job is dead-lettered
    pub max_retries: u32,
    /// Per-user trailing-24h spend cap in USD
    pub daily_cost_cap_usd: f64,
    /// Worker task count
    pub workers: usize,
    /// Bounded queue depth
    pub queue_depth: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            daily_cost_cap_usd: 5.0,
            workers: 2,
            queue_depth: 256,
        }
    }
}

/// Encrypted-at-rest job outcome.
#[derive(Debug, Serialize, Deserialize)]
struct StoredOutcome {
    response: String,
    provider: String,
    model: String,
}

/// What a submitter sees when polling a job.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatusView {
    pub id: Uuid,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub retry_count: u32,
    /// Present only once the job has completed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Handles to the worker tasks, for graceful shutdown.
pub struct WorkerPool {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Stop accepting new work and wait for in-flight jobs plus the
    /// queued backlog to drain.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task panicked during shutdown");
            }
        }
        info!("Worker pool stopped");
    }
}

/// The pipeline itself. Cheap to share behind an `Arc`.
pub struct ChatPipeline {
    store: JobStore,
    cache: Arc<ResponseCache>,
    router: Arc<ProviderRouter>,
    audit: AuditLogger,
    cipher: Arc<PayloadCipher>,
    config: PipelineConfig,
    tx: mpsc::Sender<Uuid>,
}

impl ChatPipeline {
    /// Build the pipeline and spawn its worker pool.
    #[must_use]
    pub fn start(
        store: JobStore,
        cache: Arc<ResponseCache>,
        router: Arc<ProviderRouter>,
        audit: AuditLogger,
        cipher: Arc<PayloadCipher>,
        config: PipelineConfig,
    ) -> (Arc<Self>, WorkerPool) {
        let (tx, rx) = mpsc::channel::<Uuid>(config.queue_depth);
        let workers = config.workers.max(1);

        let pipeline = Arc::new(Self {
            store,
            cache,
            router,
            audit,
            cipher,
            config,
            tx,
        });

        let rx = Arc::new(Mutex::new(rx));
        let shutdown = CancellationToken::new();
        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let pipeline = Arc::clone(&pipeline);
            let rx = Arc::clone(&rx);
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                pipeline.worker_loop(worker_id, rx, shutdown).await;
            }));
        }
        info!(workers, "Chat pipeline started");

        (pipeline, WorkerPool { shutdown, handles })
    }

    async fn worker_loop(
        &self,
        worker_id: usize,
        rx: Arc<Mutex<mpsc::Receiver<Uuid>>>,
        shutdown: CancellationToken,
    ) {
        loop {
            if shutdown.is_cancelled() {
                // Drain whatever is already queued, then stop
                let drained = { rx.lock().await.try_recv().ok() };
                match drained {
                    Some(job_id) => self.process_job(job_id).await,
                    None => break,
                }
                continue;
            }

            let next = {
                let mut rx = rx.lock().await;
                tokio::select! {
                    maybe = rx.recv() => Some(maybe),
                    () = shutdown.cancelled() => None,
                }
            };
            match next {
                Some(Some(job_id)) => self.process_job(job_id).await,
                // Channel closed, no more work ever
                Some(None) => break,
                // Shutdown signal, loop back into the drain path
                None => {}
            }
        }
        debug!(worker_id, "Worker stopped");
    }

    // ── Submission ──────────────────────────────────────────────

    /// Validate, encrypt and enqueue a conversation. Returns the
    /// pending job immediately; results arrive via [`Self::status`].
    pub async fn submit(
        &self,
        user_id: &str,
        conversation_id: &str,
        messages: &[ChatMessage],
        client: ClientMeta,
    ) -> Result<Job> {
        validate_submission(user_id, conversation_id, messages)?;

        let plaintext = serde_json::to_vec(messages)?;
        let payload = self.cipher.encrypt(&plaintext)?;
        let job = self
            .store
            .create_job(user_id, conversation_id, &payload)
            .await?;

        let mut event = AuditEvent::new(user_id, conversation_id, AuditAction::Request)
            .job(job.id)
            .client(client);
        if let Some(last) = last_user_message(messages) {
            event = event.message(last);
        }
        self.audit.record(event).await;

        self.tx
            .send(job.id)
            .await
            .map_err(|_| Error::Internal("job queue is closed".to_string()))?;
        debug!(job_id = %job.id, user_id = %user_id, "Job enqueued");
        Ok(job)
    }

    /// Poll a job. Owner-scoped: another user's job id reads as absent.
    /// The result is decrypted only for completed jobs.
    pub async fn status(&self, job_id: Uuid, user_id: &str) -> Result<JobStatusView> {
        let job = self
            .store
            .get_for_user(job_id, user_id)
            .await?
            .ok_or(Error::NotFound)?;

        let mut view = JobStatusView {
            id: job.id,
            status: job.status,
            created_at: job.created_at,
            updated_at: job.updated_at,
            retry_count: job.retry_count,
            response: None,
            provider: None,
            error: None,
        };
        match job.status {
            JobStatus::Completed => {
                if let Some(encrypted) = &job.result {
                    let plaintext = self.cipher.decrypt(encrypted)?;
                    let outcome: StoredOutcome = serde_json::from_slice(&plaintext)?;
                    view.response = Some(outcome.response);
                    view.provider = Some(outcome.provider);
                }
            }
            JobStatus::Failed => {
                view.error = job.error;
            }
            JobStatus::Pending | JobStatus::Processing => {}
        }
        Ok(view)
    }

    /// Re-enqueue all pending jobs after a restart.
    pub async fn recover_pending(&self) -> Result<usize> {
        let ids = self.store.pending_job_ids().await?;
        let count = ids.len();
        for id in ids {
            if self.tx.send(id).await.is_err() {
                return Err(Error::Internal("job queue is closed".to_string()));
            }
        }
        if count > 0 {
            info!(count, "Recovered pending jobs into the queue");
        }
        Ok(count)
    }

    // ── Processing ──────────────────────────────────────────────

    #[instrument(skip(self), fields(job_id = %job_id))]
    async fn process_job(&self, job_id: Uuid) {
        match self.store.mark_processing(job_id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("Job not pending, skipping");
                return;
            }
            Err(e) => {
                error!(error = %e, "Failed to claim job");
                return;
            }
        }

        let job = match self.store.get(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!("Claimed job disappeared");
                return;
            }
            Err(e) => {
                error!(error = %e, "Failed to load claimed job");
                return;
            }
        };

        if let Err(e) = self.execute(&job).await {
            self.handle_failure(&job, &e.to_string()).await;
        }
    }

    async fn execute(&self, job: &Job) -> Result<()> {
        let plaintext = self.cipher.decrypt(&job.payload)?;
        let messages: Vec<ChatMessage> = serde_json::from_slice(&plaintext)?;

        // Crisis content bypasses cache and providers entirely
        if kindred_llm::messages_contain_crisis(&messages) {
            let mut event =
                AuditEvent::new(&job.user_id, &job.conversation_id, AuditAction::SafetyBlock)
                    .job(job.id)
                    .response(kindred_llm::CRISIS_RESPONSE);
            if let Some(last) = last_user_message(&messages) {
                event = event.message(last);
            }
            self.audit.record(event).await;

            return self
                .finish(
                    job,
                    StoredOutcome {
                        response: kindred_llm::CRISIS_RESPONSE.to_string(),
                        provider: kindred_llm::CRISIS_PROVIDER.to_string(),
                        model: kindred_llm::CRISIS_PROVIDER.to_string(),
                    },
                )
                .await;
        }

        let started = std::time::Instant::now();

        if let Some(hit) = self.cache.check(&messages).await {
            self.audit
                .record(
                    AuditEvent::new(&job.user_id, &job.conversation_id, AuditAction::Response)
                        .job(job.id)
                        .provider(&hit.provider, &hit.model)
                        .cached(true)
                        .latency(started.elapsed().as_millis() as u64)
                        .response(&hit.response),
                )
                .await;
            return self
                .finish(
                    job,
                    StoredOutcome {
                        response: hit.response,
                        provider: hit.provider,
                        model: hit.model,
                    },
                )
                .await;
        }

        if self.over_cost_cap(&job.user_id).await {
            let content = kindred_llm::fallback::respond(&messages);
            self.audit
                .record(
                    AuditEvent::new(&job.user_id, &job.conversation_id, AuditAction::CostLimit)
                        .job(job.id)
                        .detail(COST_CAP_DETAIL)
                        .response(&content),
                )
                .await;
            return self
                .finish(
                    job,
                    StoredOutcome {
                        response: content,
                        provider: kindred_llm::STATIC_PROVIDER.to_string(),
                        model: kindred_llm::STATIC_PROVIDER.to_string(),
                    },
                )
                .await;
        }

        let routed = self.router.route(&messages).await;
        let latency_ms = started.elapsed().as_millis() as u64;
        let cost = kindred_llm::estimate_cost(&routed.model, routed.usage.as_ref());

        // Static fallbacks are placeholders, not answers worth caching
        if routed.provider != kindred_llm::STATIC_PROVIDER {
            self.cache
                .store(
                    &messages,
                    &CachedResponse {
                        response: routed.content.clone(),
                        provider: routed.provider.clone(),
                        model: routed.model.clone(),
                        hits: 0,
                    },
                )
                .await;
        }

        self.record_response(job, &routed, cost, latency_ms).await;
        self.finish(
            job,
            StoredOutcome {
                response: routed.content,
                provider: routed.provider,
                model: routed.model,
            },
        )
        .await
    }

    async fn record_response(&self, job: &Job, routed: &RoutedResponse, cost: f64, latency_ms: u64) {
        let mut event = AuditEvent::new(&job.user_id, &job.conversation_id, AuditAction::Response)
            .job(job.id)
            .provider(&routed.provider, &routed.model)
            .latency(latency_ms)
            .response(&routed.content);
        if let Some(usage) = &routed.usage {
            event = event.usage(usage, cost);
        }
        self.audit.record(event).await;
    }

    async fn finish(&self, job: &Job, outcome: StoredOutcome) -> Result<()> {
        let plaintext = serde_json::to_vec(&outcome)?;
        let encrypted = self.cipher.encrypt(&plaintext)?;
        self.store.complete(job.id, &encrypted).await?;
        debug!(job_id = %job.id, provider = %outcome.provider, "Job completed");
        Ok(())
    }

    /// Spend-cap check. Degrades open: a broken audit store must not
    /// block the chat path.
    async fn over_cost_cap(&self, user_id: &str) -> bool {
        let since = Utc::now() - chrono::Duration::hours(24);
        match self.audit.user_cost_since(user_id, since).await {
            Ok(cost) => cost >= self.config.daily_cost_cap_usd,
            Err(e) => {
                warn!(error = %e, "Cost lookup failed, allowing request");
                false
            }
        }
    }

    async fn handle_failure(&self, job: &Job, error: &str) {
        if job.retry_count < self.config.max_retries {
            let new_count = match self.store.reset_for_retry(job.id, error).await {
                Ok(count) => count,
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "Failed to reset job for retry");
                    return;
                }
            };
            let delay = Duration::from_secs(2u64.pow(new_count));
            warn!(
                job_id = %job.id,
                retry = new_count,
                delay_secs = delay.as_secs(),
                error = %error,
                "Job attempt failed, scheduling retry"
            );
            let tx = self.tx.clone();
            let job_id = job.id;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if tx.send(job_id).await.is_err() {
                    warn!(job_id = %job_id, "Queue closed before retry; job stays pending");
                }
            });
            return;
        }

        // Retry budget spent: snapshot to the dead-letter queue
        let terminal = Error::ExhaustedRetries(job.retry_count);
        error!(
            job_id = %job.id,
            retries = job.retry_count,
            error = %error,
            "Job exhausted retries, dead-lettering"
        );
        if let Err(e) = self.store.insert_dead_letter(job, error).await {
            error!(job_id = %job.id, error = %e, "Failed to dead-letter job");
        }
        if let Err(e) = self.store.fail(job.id, EXHAUSTED_MESSAGE).await {
            error!(job_id = %job.id, error = %e, "Failed to mark job failed");
        }
        self.audit
            .record(
                AuditEvent::new(&job.user_id, &job.conversation_id, AuditAction::Error)
                    .job(job.id)
                    .detail(&format!("{terminal}: {error}")),
            )
            .await;
    }

    // ── Dead letters ────────────────────────────────────────────

    /// List dead-letter entries for operator review.
    pub async fn list_dead_letters(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterEntry>> {
        self.store.list_dead_letters(filter).await
    }

    /// Re-submit a dead-lettered payload as a fresh job. Each entry may
    /// be retried at most once.
    pub async fn retry_dead_letter(&self, entry_id: Uuid) -> Result<Job> {
        let entry = self
            .store
            .get_dead_letter(entry_id)
            .await?
            .ok_or(Error::NotFound)?;
        if entry.retried {
            return Err(Error::AlreadyRetried);
        }

        // Payload is reused verbatim; it is already encrypted
        let job = self
            .store
            .create_job(&entry.user_id, &entry.conversation_id, &entry.payload)
            .await?;

        if !self.store.mark_dead_letter_retried(entry_id, job.id).await? {
            // Lost a race with a concurrent retry
            return Err(Error::AlreadyRetried);
        }

        self.audit
            .record(
                AuditEvent::new(&entry.user_id, &entry.conversation_id, AuditAction::Request)
                    .job(job.id)
                    .detail(&format!("dead-letter retry of job {}", entry.original_job_id)),
            )
            .await;

        self.tx
            .send(job.id)
            .await
            .map_err(|_| Error::Internal("job queue is closed".to_string()))?;
        info!(entry_id = %entry_id, job_id = %job.id, "Dead-letter entry re-submitted");
        Ok(job)
    }

    // ── Accessors for the HTTP layer ────────────────────────────

    #[must_use]
    pub fn store(&self) -> &JobStore {
        &self.store
    }

    #[must_use]
    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    #[must_use]
    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    #[must_use]
    pub fn router(&self) -> &ProviderRouter {
        &self.router
    }
}

fn validate_submission(
    user_id: &str,
    conversation_id: &str,
    messages: &[ChatMessage],
) -> Result<()> {
    if user_id.trim().is_empty() {
        return Err(Error::Validation("user_id must not be empty".to_string()));
    }
    if conversation_id.trim().is_empty() {
        return Err(Error::Validation(
            "conversation_id must not be empty".to_string(),
        ));
    }
    if messages.is_empty() {
        return Err(Error::Validation("messages must not be empty".to_string()));
    }
    if messages.len() > MAX_MESSAGES {
        return Err(Error::Validation(format!(
            "too many messages (max {MAX_MESSAGES})"
        )));
    }
    if messages.iter().any(|m| m.content.trim().is_empty()) {
        return Err(Error::Validation(
            "message content must not be empty".to_string(),
        ));
    }
    let total: usize = messages.iter().map(|m| m.content.len()).sum();
    if total > MAX_CONTENT_CHARS {
        return Err(Error::Validation(format!(
            "conversation too large (max {MAX_CONTENT_CHARS} characters)"
        )));
    }
    if messages.last().map(|m| m.role) != Some(MessageRole::User) {
        return Err(Error::Validation(
            "last message must be from the user".to_string(),
        ));
    }
    Ok(())
}

fn last_user_message(messages: &[ChatMessage]) -> Option<&str> {
    messages
        .iter()
        .rev()
        .find(|m| m.role == MessageRole::User)
        .map(|m| m.content.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_rejects_bad_submissions() {
        let ok = vec![ChatMessage::user("hello")];
        assert!(validate_submission("u", "c", &ok).is_ok());

        assert!(matches!(
            validate_submission("", "c", &ok),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            validate_submission("u", "c", &[]),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            validate_submission("u", "c", &[ChatMessage::user("  ")]),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            validate_submission("u", "c", &[ChatMessage::assistant("hi")]),
            Err(Error::Validation(_))
        ));

        let huge = vec![ChatMessage::user(&"x".repeat(MAX_CONTENT_CHARS + 1))];
        assert!(matches!(
            validate_submission("u", "c", &huge),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_last_user_message_skips_assistant() {
        let messages = vec![
            ChatMessage::user("first"),
            ChatMessage::assistant("reply"),
            ChatMessage::user("second"),
        ];
        assert_eq!(last_user_message(&messages), Some("second"));
        assert_eq!(last_user_message(&[ChatMessage::assistant("x")]), None);
    }
}
