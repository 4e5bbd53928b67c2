//! Kindred Core — the asynchronous AI chat pipeline.
//!
//! Coordinates the full submission lifecycle:
//! submission → cache check → circuit-breaker-routed provider call →
//! cache write → encrypted persistence → audit log → retry loop →
//! dead-letter on exhaustion.
//!
//! Outer surfaces (dashboards, moderation, digests) consume this crate
//! only through the pipeline's submit/status, dead-letter review/retry
//! and audit/usage query APIs.

#![forbid(unsafe_code)]

pub mod audit;
pub mod cache;
pub mod config;
pub mod error;
pub mod jobs;
pub mod pipeline;
pub mod rate_limit;

pub use audit::{AuditAction, AuditEvent, AuditLogger, AuditQuery, AuditRecord, ClientMeta, UsageStats};
pub use cache::{CachedResponse, ResponseCache};
pub use config::Settings;
pub use error::{Error, Result};
pub use jobs::{DeadLetterEntry, DeadLetterFilter, Job, JobStatus, JobStore, MAX_RETRIES};
pub use pipeline::{ChatPipeline, JobStatusView, PipelineConfig, WorkerPool};
pub use rate_limit::{RateDecision, RateLimiter};
