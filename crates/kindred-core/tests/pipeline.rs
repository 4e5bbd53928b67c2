//! End-to-end pipeline tests over stub providers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kindred_core::audit::{AuditAction, AuditLogger, AuditQuery};
use kindred_core::{
    AuditEvent, ChatPipeline, ClientMeta, DeadLetterFilter, Error, JobStatus, JobStatusView,
    JobStore, PipelineConfig, ResponseCache, WorkerPool,
};
use kindred_crypto::{EncryptedData, PayloadCipher};
use kindred_llm::{
    BreakerPolicy, ChatMessage, ChatProvider, CircuitBreakerRegistry, CompletionRequest,
    CompletionResponse, ProviderRouter, TokenUsage,
};
use uuid::Uuid;

/// Scripted provider: succeeds or fails, counting calls either way.
struct StubProvider {
    name: &'static str,
    model: &'static str,
    fail: bool,
    calls: Arc<AtomicUsize>,
}

impl StubProvider {
    fn ok(name: &'static str, model: &'static str) -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Self {
                name,
                model,
                fail: false,
                calls: Arc::clone(&calls),
            },
            calls,
        )
    }

    fn failing(name: &'static str) -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Self {
                name,
                model: "m",
                fail: true,
                calls: Arc::clone(&calls),
            },
            calls,
        )
    }
}

#[async_trait::async_trait]
impl ChatProvider for StubProvider {
    fn name(&self) -> &str {
        self.name
    }

    fn default_model(&self) -> &str {
        self.model
    }

    async fn complete(&self, _request: CompletionRequest) -> kindred_llm::Result<CompletionResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(kindred_llm::Error::Network("connection refused".to_string()));
        }
        Ok(CompletionResponse {
            content: format!("answer from {}", self.name),
            usage: Some(TokenUsage {
                prompt_tokens: 100,
                completion_tokens: 100,
                total_tokens: 200,
            }),
            model: self.model.to_string(),
        })
    }
}

struct Harness {
    pipeline: Arc<ChatPipeline>,
    pool: WorkerPool,
}

async fn harness(primary: StubProvider, fallback: StubProvider) -> Harness {
    let store = JobStore::in_memory().await.unwrap();
    let audit = AuditLogger::initialize(store.pool().clone()).await.unwrap();
    let cache = Arc::new(ResponseCache::in_memory());
    let router = Arc::new(ProviderRouter::new(
        Arc::new(primary),
        Arc::new(fallback),
        Arc::new(CircuitBreakerRegistry::with_policy(BreakerPolicy::default())),
    ));
    let cipher = Arc::new(PayloadCipher::from_master_secret(b"pipeline-test-master-secret"));

    let (pipeline, pool) = ChatPipeline::start(
        store,
        cache,
        router,
        audit,
        cipher,
        PipelineConfig {
            workers: 1,
            queue_depth: 16,
            ..Default::default()
        },
    );
    Harness { pipeline, pool }
}

async fn wait_for(
    pipeline: &ChatPipeline,
    job_id: Uuid,
    user_id: &str,
    status: JobStatus,
) -> JobStatusView {
    for _ in 0..500 {
        let view = pipeline.status(job_id, user_id).await.unwrap();
        if view.status == status {
            return view;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {job_id} never reached {status:?}");
}

fn convo(text: &str) -> Vec<ChatMessage> {
    vec![ChatMessage::user(text)]
}

#[tokio::test]
async fn test_submit_process_and_poll() {
    let (primary, primary_calls) = StubProvider::ok("openai", "gpt-4o-mini");
    let (fallback, fallback_calls) = StubProvider::ok("groq", "llama-3.3-70b-versatile");
    let h = harness(primary, fallback).await;

    let job = h
        .pipeline
        .submit("user-1", "conv-1", &convo("how do weighted blankets help?"), ClientMeta::default())
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Pending);

    let view = wait_for(&h.pipeline, job.id, "user-1", JobStatus::Completed).await;
    assert_eq!(view.response.as_deref(), Some("answer from openai"));
    assert_eq!(view.provider.as_deref(), Some("openai"));
    assert_eq!(primary_calls.load(Ordering::SeqCst), 1);
    assert_eq!(fallback_calls.load(Ordering::SeqCst), 0);

    // The audit record carries the provider's token split
    let responses = h
        .pipeline
        .audit()
        .query(&AuditQuery {
            action: Some(AuditAction::Response),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(responses[0].prompt_tokens, Some(100));
    assert_eq!(responses[0].completion_tokens, Some(100));
    assert_eq!(responses[0].total_tokens, Some(200));

    // Another user cannot see the job
    assert!(matches!(
        h.pipeline.status(job.id, "user-2").await,
        Err(Error::NotFound)
    ));

    h.pool.shutdown().await;
}

#[tokio::test]
async fn test_repeat_faq_served_from_cache() {
    let (primary, primary_calls) = StubProvider::ok("openai", "gpt-4o-mini");
    let (fallback, _) = StubProvider::ok("groq", "llama-3.3-70b-versatile");
    let h = harness(primary, fallback).await;

    let first = h
        .pipeline
        .submit("user-1", "conv-1", &convo("what is autism?"), ClientMeta::default())
        .await
        .unwrap();
    wait_for(&h.pipeline, first.id, "user-1", JobStatus::Completed).await;

    // Same question, different casing and spacing
    let second = h
        .pipeline
        .submit("user-2", "conv-2", &convo("What  is  AUTISM?"), ClientMeta::default())
        .await
        .unwrap();
    let view = wait_for(&h.pipeline, second.id, "user-2", JobStatus::Completed).await;

    assert_eq!(view.response.as_deref(), Some("answer from openai"));
    assert_eq!(primary_calls.load(Ordering::SeqCst), 1);

    let responses = h
        .pipeline
        .audit()
        .query(&AuditQuery {
            action: Some(AuditAction::Response),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(responses.len(), 2);
    assert_eq!(responses.iter().filter(|r| r.cached).count(), 1);

    h.pool.shutdown().await;
}

#[tokio::test]
async fn test_crisis_bypasses_providers_and_cache() {
    let (primary, primary_calls) = StubProvider::ok("openai", "gpt-4o-mini");
    let (fallback, fallback_calls) = StubProvider::ok("groq", "llama-3.3-70b-versatile");
    let h = harness(primary, fallback).await;

    let messages = convo("I keep thinking about suicide");
    let job = h
        .pipeline
        .submit("user-1", "conv-1", &messages, ClientMeta::default())
        .await
        .unwrap();
    let view = wait_for(&h.pipeline, job.id, "user-1", JobStatus::Completed).await;

    assert_eq!(view.provider.as_deref(), Some("crisis"));
    assert!(view.response.unwrap().contains("988"));
    assert_eq!(primary_calls.load(Ordering::SeqCst), 0);
    assert_eq!(fallback_calls.load(Ordering::SeqCst), 0);

    let blocks = h
        .pipeline
        .audit()
        .query(&AuditQuery {
            action: Some(AuditAction::SafetyBlock),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(blocks.len(), 1);
    assert!(blocks[0].safety_flag);

    // Submitting again must short-circuit again, never hit a cache
    let again = h
        .pipeline
        .submit("user-1", "conv-1", &messages, ClientMeta::default())
        .await
        .unwrap();
    wait_for(&h.pipeline, again.id, "user-1", JobStatus::Completed).await;
    assert_eq!(primary_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.pipeline.cache().stats().stores, 0);

    h.pool.shutdown().await;
}

#[tokio::test]
async fn test_provider_failure_falls_back_with_attribution() {
    let (primary, _) = StubProvider::failing("openai");
    let (fallback, fallback_calls) = StubProvider::ok("groq", "llama-3.3-70b-versatile");
    let h = harness(primary, fallback).await;

    let job = h
        .pipeline
        .submit("user-1", "conv-1", &convo("tips for school mornings"), ClientMeta::default())
        .await
        .unwrap();
    let view = wait_for(&h.pipeline, job.id, "user-1", JobStatus::Completed).await;

    assert_eq!(view.provider.as_deref(), Some("groq"));
    assert_eq!(fallback_calls.load(Ordering::SeqCst), 1);

    h.pool.shutdown().await;
}

#[tokio::test]
async fn test_static_responder_not_cached() {
    let (primary, _) = StubProvider::failing("openai");
    let (fallback, _) = StubProvider::failing("groq");
    let h = harness(primary, fallback).await;

    let job = h
        .pipeline
        .submit("user-1", "conv-1", &convo("what is autism?"), ClientMeta::default())
        .await
        .unwrap();
    let view = wait_for(&h.pipeline, job.id, "user-1", JobStatus::Completed).await;

    assert_eq!(view.provider.as_deref(), Some("static"));
    assert!(view.response.unwrap().contains("Autism spectrum disorder"));
    assert_eq!(h.pipeline.cache().stats().stores, 0);

    h.pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_undecryptable_job_retries_then_dead_letters() {
    let (primary, primary_calls) = StubProvider::ok("openai", "gpt-4o-mini");
    let (fallback, _) = StubProvider::ok("groq", "llama-3.3-70b-versatile");
    let h = harness(primary, fallback).await;

    // A payload no cipher can open; every attempt fails before routing
    let garbage = EncryptedData {
        version: 1,
        nonce: [7u8; 12],
        ciphertext: vec![0xde, 0xad, 0xbe, 0xef],
    };
    let job = h
        .pipeline
        .store()
        .create_job("user-1", "conv-1", &garbage)
        .await
        .unwrap();
    h.pipeline.recover_pending().await.unwrap();

    let view = wait_for(&h.pipeline, job.id, "user-1", JobStatus::Failed).await;
    assert_eq!(view.retry_count, 3);
    // The raw error never reaches the submitter
    assert_eq!(
        view.error.as_deref(),
        Some("We couldn't process this message. Our team has been notified.")
    );
    assert_eq!(primary_calls.load(Ordering::SeqCst), 0);

    let entries = h
        .pipeline
        .list_dead_letters(&DeadLetterFilter::default())
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].original_job_id, job.id);
    assert_eq!(entries[0].retry_count, 3);
    assert!(!entries[0].retried);

    let errors = h
        .pipeline
        .audit()
        .query(&AuditQuery {
            action: Some(AuditAction::Error),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(errors.len(), 1);
    // Operators see the terminal state and the underlying cause
    let detail = errors[0].detail.as_deref().unwrap();
    assert!(detail.contains("retries exhausted after 3"));
    assert!(detail.contains("decryption failed"));

    h.pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_dead_letter_retried_at_most_once() {
    let (primary, _) = StubProvider::ok("openai", "gpt-4o-mini");
    let (fallback, _) = StubProvider::ok("groq", "llama-3.3-70b-versatile");
    let h = harness(primary, fallback).await;

    let garbage = EncryptedData {
        version: 1,
        nonce: [7u8; 12],
        ciphertext: vec![1, 2, 3, 4],
    };
    let job = h
        .pipeline
        .store()
        .create_job("user-1", "conv-1", &garbage)
        .await
        .unwrap();
    h.pipeline.recover_pending().await.unwrap();
    wait_for(&h.pipeline, job.id, "user-1", JobStatus::Failed).await;

    let entries = h
        .pipeline
        .list_dead_letters(&DeadLetterFilter::default())
        .await
        .unwrap();
    let entry_id = entries[0].id;

    let retry_job = h.pipeline.retry_dead_letter(entry_id).await.unwrap();
    assert_ne!(retry_job.id, job.id);

    // Second retry of the same entry is rejected
    assert!(matches!(
        h.pipeline.retry_dead_letter(entry_id).await,
        Err(Error::AlreadyRetried)
    ));
    assert!(matches!(
        h.pipeline.retry_dead_letter(Uuid::new_v4()).await,
        Err(Error::NotFound)
    ));

    h.pool.shutdown().await;
}

#[tokio::test]
async fn test_cost_cap_serves_static_response() {
    let (primary, primary_calls) = StubProvider::ok("openai", "gpt-4o-mini");
    let (fallback, _) = StubProvider::ok("groq", "llama-3.3-70b-versatile");
    let h = harness(primary, fallback).await;

    // Put the user over the default $5 trailing-24h cap
    h.pipeline
        .audit()
        .record(
            AuditEvent::new("user-1", "conv-0", AuditAction::Response)
                .provider("openai", "gpt-4o-mini")
                .usage(
                    &TokenUsage {
                        prompt_tokens: 500_000,
                        completion_tokens: 500_000,
                        total_tokens: 1_000_000,
                    },
                    6.0,
                ),
        )
        .await;

    let job = h
        .pipeline
        .submit("user-1", "conv-1", &convo("what is adhd?"), ClientMeta::default())
        .await
        .unwrap();
    let view = wait_for(&h.pipeline, job.id, "user-1", JobStatus::Completed).await;

    assert_eq!(view.provider.as_deref(), Some("static"));
    assert_eq!(primary_calls.load(Ordering::SeqCst), 0);

    let limited = h
        .pipeline
        .audit()
        .query(&AuditQuery {
            action: Some(AuditAction::CostLimit),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(limited.len(), 1);

    // An unrelated user is unaffected
    let other = h
        .pipeline
        .submit("user-2", "conv-2", &convo("bedtime routine ideas"), ClientMeta::default())
        .await
        .unwrap();
    let view = wait_for(&h.pipeline, other.id, "user-2", JobStatus::Completed).await;
    assert_eq!(view.provider.as_deref(), Some("openai"));

    h.pool.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_drains_queued_jobs() {
    let (primary, _) = StubProvider::ok("openai", "gpt-4o-mini");
    let (fallback, _) = StubProvider::ok("groq", "llama-3.3-70b-versatile");
    let h = harness(primary, fallback).await;

    let mut ids = Vec::new();
    for i in 0..5 {
        let job = h
            .pipeline
            .submit("user-1", "conv-1", &convo(&format!("question {i}")), ClientMeta::default())
            .await
            .unwrap();
        ids.push(job.id);
    }

    h.pool.shutdown().await;

    for id in ids {
        let view = h.pipeline.status(id, "user-1").await.unwrap();
        assert_eq!(view.status, JobStatus::Completed);
    }
}

#[tokio::test]
async fn test_pending_jobs_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("kindred.db");

    // First process: enqueue without workers ever seeing the job
    let store = JobStore::from_path(&db_path).await.unwrap();
    let cipher = PayloadCipher::from_master_secret(b"pipeline-test-master-secret");
    let payload = cipher.encrypt(&serde_json::to_vec(&convo("hello")).unwrap()).unwrap();
    let job = store.create_job("user-1", "conv-1", &payload).await.unwrap();
    drop(store);

    // Second process: recovery re-enqueues and a worker completes it
    let store = JobStore::from_path(&db_path).await.unwrap();
    let audit = AuditLogger::initialize(store.pool().clone()).await.unwrap();
    let (primary, _) = StubProvider::ok("openai", "gpt-4o-mini");
    let (fallback, _) = StubProvider::ok("groq", "llama-3.3-70b-versatile");
    let router = Arc::new(ProviderRouter::new(
        Arc::new(primary),
        Arc::new(fallback),
        Arc::new(CircuitBreakerRegistry::new()),
    ));
    let (pipeline, pool) = ChatPipeline::start(
        store,
        Arc::new(ResponseCache::in_memory()),
        router,
        audit,
        Arc::new(cipher),
        PipelineConfig {
            workers: 1,
            ..Default::default()
        },
    );

    assert_eq!(pipeline.recover_pending().await.unwrap(), 1);
    let view = wait_for(&pipeline, job.id, "user-1", JobStatus::Completed).await;
    assert_eq!(view.provider.as_deref(), Some("openai"));

    pool.shutdown().await;
}
