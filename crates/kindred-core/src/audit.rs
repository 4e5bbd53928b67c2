//! Append-only audit and usage log.
//!
//! Every pipeline decision lands here: submissions, responses, safety
//! blocks, rate and cost limits, terminal errors. Message and response
//! snapshots pass through PII redaction before they are written, so the
//! log never stores raw identifiers. Rows are never updated or deleted
//! by the application.
//!
//! `record` deliberately swallows storage errors. The audit trail must
//! not take the chat path down with it; failures are logged locally.

use chrono::{DateTime, Utc};
use kindred_llm::TokenUsage;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::{Error, Result};

/// What happened, from the pipeline's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    /// A job was accepted for processing
    Request,
    /// An assistant response was produced (provider, cache or static)
    Response,
    /// A job failed terminally
    Error,
    /// Crisis content short-circuited the providers
    SafetyBlock,
    /// A submission was rejected by the rate limiter
    RateLimit,
    /// The spend cap replaced the provider call
    CostLimit,
}

impl AuditAction {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "REQUEST",
            Self::Response => "RESPONSE",
            Self::Error => "ERROR",
            Self::SafetyBlock => "SAFETY_BLOCK",
            Self::RateLimit => "RATE_LIMIT",
            Self::CostLimit => "COST_LIMIT",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "REQUEST" => Some(Self::Request),
            "RESPONSE" => Some(Self::Response),
            "ERROR" => Some(Self::Error),
            "SAFETY_BLOCK" => Some(Self::SafetyBlock),
            "RATE_LIMIT" => Some(Self::RateLimit),
            "COST_LIMIT" => Some(Self::CostLimit),
            _ => None,
        }
    }
}

/// Request metadata captured at the HTTP edge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientMeta {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

/// An event to be recorded. Built with the setter chain; only user,
/// conversation and action are mandatory.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub user_id: String,
    pub conversation_id: String,
    pub action: AuditAction,
    pub job_id: Option<Uuid>,
    pub message: Option<String>,
    pub response: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
    pub cost_usd: Option<f64>,
    pub latency_ms: Option<u64>,
    pub cached: bool,
    /// Safety-relevant record (crisis short-circuit)
    pub safety_flag: bool,
    pub detail: Option<String>,
    pub client: ClientMeta,
}

impl AuditEvent {
    #[must_use]
    pub fn new(user_id: &str, conversation_id: &str, action: AuditAction) -> Self {
        Self {
            user_id: user_id.to_string(),
            conversation_id: conversation_id.to_string(),
            action,
            job_id: None,
            message: None,
            response: None,
            provider: None,
            model: None,
            prompt_tokens: None,
            completion_tokens: None,
            total_tokens: None,
            cost_usd: None,
            latency_ms: None,
            cached: false,
            safety_flag: action == AuditAction::SafetyBlock,
            detail: None,
            client: ClientMeta::default(),
        }
    }

    #[must_use]
    pub fn job(mut self, id: Uuid) -> Self {
        self.job_id = Some(id);
        self
    }

    /// Snapshot of the user's last message. Redacted on write.
    #[must_use]
    pub fn message(mut self, text: &str) -> Self {
        self.message = Some(text.to_string());
        self
    }

    /// Snapshot of the assistant response. Redacted on write.
    #[must_use]
    pub fn response(mut self, text: &str) -> Self {
        self.response = Some(text.to_string());
        self
    }

    #[must_use]
    pub fn provider(mut self, provider: &str, model: &str) -> Self {
        self.provider = Some(provider.to_string());
        self.model = Some(model.to_string());
        self
    }

    /// Provider-reported token counts and the estimated spend.
    #[must_use]
    pub fn usage(mut self, usage: &TokenUsage, cost_usd: f64) -> Self {
        self.prompt_tokens = Some(usage.prompt_tokens);
        self.completion_tokens = Some(usage.completion_tokens);
        self.total_tokens = Some(usage.total_tokens);
        self.cost_usd = Some(cost_usd);
        self
    }

    #[must_use]
    pub fn latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }

    #[must_use]
    pub fn cached(mut self, cached: bool) -> Self {
        self.cached = cached;
        self
    }

    #[must_use]
    pub fn detail(mut self, detail: &str) -> Self {
        self.detail = Some(detail.to_string());
        self
    }

    #[must_use]
    pub fn client(mut self, client: ClientMeta) -> Self {
        self.client = client;
        self
    }
}

/// A stored audit row.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub user_id: String,
    pub conversation_id: String,
    pub action: AuditAction,
    pub job_id: Option<Uuid>,
    pub message: Option<String>,
    pub response: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
    pub cost_usd: Option<f64>,
    pub latency_ms: Option<u64>,
    pub cached: bool,
    pub safety_flag: bool,
    pub detail: Option<String>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
}

/// Filter for audit queries.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditQuery {
    pub user_id: Option<String>,
    pub conversation_id: Option<String>,
    pub action: Option<AuditAction>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Maximum rows returned (default 100)
    pub limit: Option<u32>,
}

/// Aggregated usage, per user or system-wide.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UsageStats {
    pub requests: i64,
    pub responses: i64,
    pub errors: i64,
    pub safety_blocks: i64,
    pub rate_limited: i64,
    pub cost_limited: i64,
    pub cache_hits: i64,
    pub total_tokens: i64,
    pub total_cost_usd: f64,
    /// Mean latency across responses that reported one
    pub avg_latency_ms: Option<f64>,
}

/// Append-only audit logger over the shared SQLite pool.
#[derive(Clone)]
pub struct AuditLogger {
    pool: SqlitePool,
}

impl AuditLogger {
    /// Wrap an existing pool and run the audit migration.
    pub async fn initialize(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS audit_log (
                id              TEXT PRIMARY KEY,
                created_at      TEXT NOT NULL,
                user_id         TEXT NOT NULL,
                conversation_id TEXT NOT NULL,
                action          TEXT NOT NULL,
                job_id          TEXT,
                message         TEXT,
                response        TEXT,
                provider        TEXT,
                model           TEXT,
                prompt_tokens   INTEGER,
                completion_tokens INTEGER,
                total_tokens    INTEGER,
                cost_usd        REAL,
                latency_ms      INTEGER,
                cached          INTEGER NOT NULL DEFAULT 0,
                safety_flag     INTEGER NOT NULL DEFAULT 0,
                detail          TEXT,
                client_ip       TEXT,
                user_agent      TEXT
            )",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_audit_user
             ON audit_log(user_id, created_at)",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_audit_conversation
             ON audit_log(conversation_id, created_at)",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// Record an event. Never fails the caller; storage errors are
    /// logged and dropped.
    pub async fn record(&self, event: AuditEvent) {
        let id = Uuid::new_v4();
        let now = Utc::now();

        // Snapshots are redacted before they touch the database
        let message = event.message.as_deref().map(kindred_privacy::redact_text);
        let response = event.response.as_deref().map(kindred_privacy::redact_text);

        let result = sqlx::query(
            "INSERT INTO audit_log (id, created_at, user_id, conversation_id, action,
                                    job_id, message, response, provider, model,
                                    prompt_tokens, completion_tokens, total_tokens,
                                    cost_usd, latency_ms, cached, safety_flag, detail,
                                    client_ip, user_agent)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(now.to_rfc3339())
        .bind(&event.user_id)
        .bind(&event.conversation_id)
        .bind(event.action.as_str())
        .bind(event.job_id.map(|id| id.to_string()))
        .bind(message)
        .bind(response)
        .bind(&event.provider)
        .bind(&event.model)
        .bind(event.prompt_tokens.map(i64::from))
        .bind(event.completion_tokens.map(i64::from))
        .bind(event.total_tokens.map(i64::from))
        .bind(event.cost_usd)
        .bind(event.latency_ms.map(|ms| ms as i64))
        .bind(i64::from(event.cached))
        .bind(i64::from(event.safety_flag))
        .bind(&event.detail)
        .bind(&event.client.ip)
        .bind(&event.client.user_agent)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                debug!(action = event.action.as_str(), user_id = %event.user_id, "Audit recorded");
            }
            Err(e) => {
                error!(
                    action = event.action.as_str(),
                    user_id = %event.user_id,
                    error = %e,
                    "Failed to write audit record"
                );
            }
        }
    }

    /// Query records, newest first.
    pub async fn query(&self, filter: &AuditQuery) -> Result<Vec<AuditRecord>> {
        let mut builder: sqlx::QueryBuilder<sqlx::Sqlite> =
            sqlx::QueryBuilder::new("SELECT * FROM audit_log WHERE 1=1");
        if let Some(user_id) = &filter.user_id {
            builder.push(" AND user_id = ").push_bind(user_id);
        }
        if let Some(conversation_id) = &filter.conversation_id {
            builder
                .push(" AND conversation_id = ")
                .push_bind(conversation_id);
        }
        if let Some(action) = filter.action {
            builder.push(" AND action = ").push_bind(action.as_str());
        }
        if let Some(since) = filter.since {
            builder.push(" AND created_at >= ").push_bind(since.to_rfc3339());
        }
        if let Some(until) = filter.until {
            builder.push(" AND created_at < ").push_bind(until.to_rfc3339());
        }
        let limit = i64::from(filter.limit.unwrap_or(100).min(1000));
        builder.push(" ORDER BY created_at DESC LIMIT ").push_bind(limit);

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_record).collect()
    }

    /// Full trail for one user, oldest first. Compliance export.
    pub async fn export_user(&self, user_id: &str) -> Result<Vec<AuditRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM audit_log WHERE user_id = ? ORDER BY created_at ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_record).collect()
    }

    /// Aggregated usage for one user since `since`.
    pub async fn user_stats(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<UsageStats> {
        self.stats_where(Some(user_id), since).await
    }

    /// Aggregated usage across all users since `since`.
    pub async fn system_stats(&self, since: DateTime<Utc>) -> Result<UsageStats> {
        self.stats_where(None, since).await
    }

    /// Provider spend attributed to a user since `since`. Cached and
    /// static responses carry no cost.
    pub async fn user_cost_since(&self, user_id: &str, since: DateTime<Utc>) -> Result<f64> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(cost_usd), 0.0) AS total
             FROM audit_log
             WHERE user_id = ? AND created_at >= ? AND cost_usd IS NOT NULL",
        )
        .bind(user_id)
        .bind(since.to_rfc3339())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("total")?)
    }

    async fn stats_where(&self, user_id: Option<&str>, since: DateTime<Utc>) -> Result<UsageStats> {
        let mut builder: sqlx::QueryBuilder<sqlx::Sqlite> = sqlx::QueryBuilder::new(
            "SELECT action,
                    COUNT(*) AS n,
                    COALESCE(SUM(total_tokens), 0) AS tokens,
                    COALESCE(SUM(cost_usd), 0.0) AS cost,
                    COALESCE(SUM(cached), 0) AS cached,
                    AVG(latency_ms) AS avg_latency
             FROM audit_log WHERE created_at >= ",
        );
        builder.push_bind(since.to_rfc3339());
        if let Some(user_id) = user_id {
            builder.push(" AND user_id = ").push_bind(user_id);
        }
        builder.push(" GROUP BY action");

        let rows = builder.build().fetch_all(&self.pool).await?;
        let mut stats = UsageStats::default();
        for row in rows {
            let action: String = row.try_get("action")?;
            let n: i64 = row.try_get("n")?;
            let tokens: i64 = row.try_get("tokens")?;
            let cost: f64 = row.try_get("cost")?;
            let cached: i64 = row.try_get("cached")?;
            let avg_latency: Option<f64> = row.try_get("avg_latency")?;
            match AuditAction::parse(&action) {
                Some(AuditAction::Request) => stats.requests = n,
                Some(AuditAction::Response) => {
                    stats.responses = n;
                    stats.cache_hits = cached;
                    stats.avg_latency_ms = avg_latency;
                }
                Some(AuditAction::Error) => stats.errors = n,
                Some(AuditAction::SafetyBlock) => stats.safety_blocks = n,
                Some(AuditAction::RateLimit) => stats.rate_limited = n,
                Some(AuditAction::CostLimit) => stats.cost_limited = n,
                None => {}
            }
            stats.total_tokens += tokens;
            stats.total_cost_usd += cost;
        }
        Ok(stats)
    }
}

fn row_to_record(row: &SqliteRow) -> Result<AuditRecord> {
    let action_str: String = row.try_get("action")?;
    let action = AuditAction::parse(&action_str)
        .ok_or_else(|| Error::Internal(format!("unknown audit action: {action_str}")))?;

    let id: String = row.try_get("id")?;
    let job_id: Option<String> = row.try_get("job_id")?;
    let created_at: String = row.try_get("created_at")?;
    let prompt_tokens: Option<i64> = row.try_get("prompt_tokens")?;
    let completion_tokens: Option<i64> = row.try_get("completion_tokens")?;
    let total_tokens: Option<i64> = row.try_get("total_tokens")?;
    let latency_ms: Option<i64> = row.try_get("latency_ms")?;
    let cached: i64 = row.try_get("cached")?;
    let safety_flag: i64 = row.try_get("safety_flag")?;

    Ok(AuditRecord {
        id: Uuid::parse_str(&id).map_err(|e| Error::Internal(format!("bad uuid: {e}")))?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| Error::Internal(format!("bad timestamp: {e}")))?,
        user_id: row.try_get("user_id")?,
        conversation_id: row.try_get("conversation_id")?,
        action,
        job_id: job_id
            .map(|id| Uuid::parse_str(&id))
            .transpose()
            .map_err(|e| Error::Internal(format!("bad uuid: {e}")))?,
        message: row.try_get("message")?,
        response: row.try_get("response")?,
        provider: row.try_get("provider")?,
        model: row.try_get("model")?,
        prompt_tokens: prompt_tokens.map(|t| t as u32),
        completion_tokens: completion_tokens.map(|t| t as u32),
        total_tokens: total_tokens.map(|t| t as u32),
        cost_usd: row.try_get("cost_usd")?,
        latency_ms: latency_ms.map(|ms| ms as u64),
        cached: cached != 0,
        safety_flag: safety_flag != 0,
        detail: row.try_get("detail")?,
        client_ip: row.try_get("client_ip")?,
        user_agent: row.try_get("user_agent")?,
    })
}
