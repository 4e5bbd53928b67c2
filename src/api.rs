//! HTTP surface over the chat pipeline.
//!
//! Submitters get `POST /api/v1/chat/jobs` plus a polling endpoint;
//! operators get dead-letter review/retry, audit queries, usage stats
//! and a compliance export. Job results are only returned to the user
//! who submitted them.

use std::sync::Arc;

use axum::extract::{Extension, Path, Query};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use kindred_core::audit::{AuditAction, AuditEvent, AuditQuery};
use kindred_core::jobs::DeadLetterFilter;
use kindred_core::{ChatPipeline, ClientMeta, Error as CoreError, RateLimiter};
use kindred_llm::ChatMessage;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<ChatPipeline>,
    pub chat_limiter: Arc<RateLimiter>,
    pub redis_url: Option<String>,
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/detailed", get(detailed_health))
        .route("/api/v1/chat/jobs", post(submit_job))
        .route("/api/v1/chat/jobs/:id", get(job_status))
        .route("/api/v1/admin/dead-letters", get(list_dead_letters))
        .route("/api/v1/admin/dead-letters/:id/retry", post(retry_dead_letter))
        .route("/api/v1/admin/audit", get(query_audit))
        .route("/api/v1/admin/usage", get(system_usage))
        .route("/api/v1/admin/usage/:user_id", get(user_usage))
        .route("/api/v1/admin/export/:user_id", get(export_user))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(Extension(state))
}

// ── Errors ──────────────────────────────────────────────────────

struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            CoreError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            CoreError::NotFound => (StatusCode::NOT_FOUND, "not found".to_string()),
            CoreError::AlreadyRetried => (
                StatusCode::CONFLICT,
                "dead-letter entry already retried".to_string(),
            ),
            // Storage/crypto details stay server-side
            _ => {
                tracing::error!(error = %self.0, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

fn client_meta(headers: &HeaderMap) -> ClientMeta {
    let header_str = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    ClientMeta {
        ip: header_str("x-forwarded-for"),
        user_agent: header_str("user-agent"),
    }
}

// ── Chat ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    user_id: String,
    conversation_id: String,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    job_id: Uuid,
    status: &'static str,
}

async fn submit_job(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
    Json(request): Json<SubmitRequest>,
) -> Result<Response, ApiError> {
    let client = client_meta(&headers);

    let decision = state.chat_limiter.check(&request.user_id).await;
    if !decision.allowed {
        state
            .pipeline
            .audit()
            .record(
                AuditEvent::new(&request.user_id, &request.conversation_id, AuditAction::RateLimit)
                    .detail(&format!("retry after {}s", decision.retry_after_secs))
                    .client(client),
            )
            .await;
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "error": "rate limit exceeded",
                "retry_after_secs": decision.retry_after_secs,
            })),
        )
            .into_response();
        if let Ok(value) = decision.retry_after_secs.to_string().parse() {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
        return Ok(response);
    }

    let job = state
        .pipeline
        .submit(&request.user_id, &request.conversation_id, &request.messages, client)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            job_id: job.id,
            status: job.status.as_str(),
        }),
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
struct StatusParams {
    user_id: String,
}

async fn job_status(
    Extension(state): Extension<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<StatusParams>,
) -> Result<Response, ApiError> {
    let view = state.pipeline.status(id, &params.user_id).await?;
    Ok(Json(view).into_response())
}

// ── Operator endpoints ──────────────────────────────────────────

async fn list_dead_letters(
    Extension(state): Extension<AppState>,
    Query(filter): Query<DeadLetterFilter>,
) -> Result<Response, ApiError> {
    let entries = state.pipeline.list_dead_letters(&filter).await?;
    // Payloads stay encrypted; operators see metadata only
    let entries: Vec<_> = entries
        .into_iter()
        .map(|e| {
            json!({
                "id": e.id,
                "original_job_id": e.original_job_id,
                "user_id": e.user_id,
                "conversation_id": e.conversation_id,
                "error": e.error,
                "retry_count": e.retry_count,
                "failed_at": e.failed_at,
                "retried": e.retried,
                "retry_job_id": e.retry_job_id,
            })
        })
        .collect();
    Ok(Json(json!({ "dead_letters": entries })).into_response())
}

async fn retry_dead_letter(
    Extension(state): Extension<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let job = state.pipeline.retry_dead_letter(id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            job_id: job.id,
            status: job.status.as_str(),
        }),
    )
        .into_response())
}

async fn query_audit(
    Extension(state): Extension<AppState>,
    Query(filter): Query<AuditQuery>,
) -> Result<Response, ApiError> {
    let records = state.pipeline.audit().query(&filter).await?;
    Ok(Json(json!({ "records": records })).into_response())
}

#[derive(Debug, Deserialize)]
struct UsageParams {
    /// Trailing window in hours (default 24)
    hours: Option<i64>,
}

async fn user_usage(
    Extension(state): Extension<AppState>,
    Path(user_id): Path<String>,
    Query(params): Query<UsageParams>,
) -> Result<Response, ApiError> {
    let since = Utc::now() - chrono::Duration::hours(params.hours.unwrap_or(24).clamp(1, 24 * 90));
    let stats = state.pipeline.audit().user_stats(&user_id, since).await?;
    Ok(Json(json!({ "user_id": user_id, "since": since, "usage": stats })).into_response())
}

async fn system_usage(
    Extension(state): Extension<AppState>,
    Query(params): Query<UsageParams>,
) -> Result<Response, ApiError> {
    let since = Utc::now() - chrono::Duration::hours(params.hours.unwrap_or(24).clamp(1, 24 * 90));
    let stats = state.pipeline.audit().system_stats(since).await?;
    Ok(Json(json!({ "since": since, "usage": stats })).into_response())
}

async fn export_user(
    Extension(state): Extension<AppState>,
    Path(user_id): Path<String>,
) -> Result<Response, ApiError> {
    let records = state.pipeline.audit().export_user(&user_id).await?;
    Ok(Json(json!({
        "user_id": user_id,
        "exported_at": Utc::now(),
        "records": records,
    }))
    .into_response())
}

// ── Health ──────────────────────────────────────────────────────

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn detailed_health(Extension(state): Extension<AppState>) -> Json<serde_json::Value> {
    let jobs = state.pipeline.store().stats().await.ok();
    let redis = match &state.redis_url {
        Some(url) => check_redis(url).await,
        None => json!({ "status": "disabled" }),
    };

    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "checks": {
            "jobs": jobs,
            "redis": redis,
            "circuits": state.pipeline.router().breakers().snapshot(),
            "cache": state.pipeline.cache().stats(),
            "rate_limiter": state.chat_limiter.stats(),
        },
    }))
}

async fn check_redis(redis_url: &str) -> serde_json::Value {
    let start = std::time::Instant::now();
    match redis::Client::open(redis_url) {
        Ok(client) => match client.get_multiplexed_async_connection().await {
            Ok(mut conn) => match redis::cmd("PING").query_async::<String>(&mut conn).await {
                Ok(_) => json!({
                    "status": "healthy",
                    "latency_ms": start.elapsed().as_millis() as u64,
                }),
                Err(e) => json!({ "status": "unhealthy", "error": e.to_string() }),
            },
            Err(e) => json!({ "status": "unhealthy", "error": e.to_string() }),
        },
        Err(e) => json!({ "status": "unhealthy", "error": e.to_string() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use kindred_core::{
        AuditLogger, JobStore, PipelineConfig, ResponseCache, WorkerPool,
    };
    use kindred_crypto::PayloadCipher;
    use kindred_llm::{
        BreakerPolicy, ChatProvider, CircuitBreakerRegistry, CompletionRequest,
        CompletionResponse, ProviderRouter, TokenUsage,
    };
    use std::time::Duration;
    use tower::ServiceExt;

    struct EchoProvider;

    #[async_trait::async_trait]
    impl ChatProvider for EchoProvider {
        fn name(&self) -> &str {
            "openai"
        }
        fn default_model(&self) -> &str {
            "gpt-4o-mini"
        }
        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> kindred_llm::Result<CompletionResponse> {
            Ok(CompletionResponse {
                content: "hello there".to_string(),
                usage: Some(TokenUsage {
                    prompt_tokens: 5,
                    completion_tokens: 5,
                    total_tokens: 10,
                }),
                model: "gpt-4o-mini".to_string(),
            })
        }
    }

    async fn test_app(rate_limit: u32) -> (Router, WorkerPool) {
        let store = JobStore::in_memory().await.unwrap();
        let audit = AuditLogger::initialize(store.pool().clone()).await.unwrap();
        let provider_router = Arc::new(ProviderRouter::new(
            Arc::new(EchoProvider),
            Arc::new(EchoProvider),
            Arc::new(CircuitBreakerRegistry::with_policy(BreakerPolicy::default())),
        ));
        let (pipeline, pool) = ChatPipeline::start(
            store,
            Arc::new(ResponseCache::in_memory()),
            provider_router,
            audit,
            Arc::new(PayloadCipher::from_master_secret(b"api-test-master-secret")),
            PipelineConfig {
                workers: 1,
                ..Default::default()
            },
        );
        let app = router(AppState {
            pipeline,
            chat_limiter: Arc::new(RateLimiter::in_memory(
                "chat",
                rate_limit,
                Duration::from_secs(60),
            )),
            redis_url: None,
        });
        (app, pool)
    }

    fn submit_body(user_id: &str) -> Body {
        Body::from(
            json!({
                "user_id": user_id,
                "conversation_id": "conv-1",
                "messages": [{ "role": "user", "content": "hello" }],
            })
            .to_string(),
        )
    }

    #[tokio::test]
    async fn test_health_ok() {
        let (app, pool) = test_app(10).await;
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_accepted() {
        let (app, pool) = test_app(10).await;
        let response = app
            .oneshot(
                Request::post("/api/v1/chat/jobs")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(submit_body("user-1"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_validation_rejected() {
        let (app, pool) = test_app(10).await;
        let response = app
            .oneshot(
                Request::post("/api/v1/chat/jobs")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        json!({
                            "user_id": "user-1",
                            "conversation_id": "conv-1",
                            "messages": [],
                        })
                        .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_rate_limit_returns_429_with_retry_after() {
        let (app, pool) = test_app(1).await;

        let first = app
            .clone()
            .oneshot(
                Request::post("/api/v1/chat/jobs")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(submit_body("user-1"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::ACCEPTED);

        let second = app
            .oneshot(
                Request::post("/api/v1/chat/jobs")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(submit_body("user-1"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(second.headers().contains_key(header::RETRY_AFTER));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_status_requires_matching_user() {
        let (app, pool) = test_app(10).await;

        let response = app
            .clone()
            .oneshot(
                Request::post("/api/v1/chat/jobs")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(submit_body("user-1"))
                    .unwrap(),
            )
            .await
            .unwrap();
        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let job_id = body["job_id"].as_str().unwrap().to_string();

        let owner = app
            .clone()
            .oneshot(
                Request::get(format!("/api/v1/chat/jobs/{job_id}?user_id=user-1"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(owner.status(), StatusCode::OK);

        let stranger = app
            .oneshot(
                Request::get(format!("/api/v1/chat/jobs/{job_id}?user_id=user-2"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(stranger.status(), StatusCode::NOT_FOUND);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_dead_letter_retry_404() {
        let (app, pool) = test_app(10).await;
        let response = app
            .oneshot(
                Request::post(format!("/api/v1/admin/dead-letters/{}/retry", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        pool.shutdown().await;
    }
}
