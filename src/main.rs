//! Kindred - AI-assisted support chat for neurodivergent families
//!
//! HTTP entry point for the chat pipeline server.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use base64::Engine;
use rand::RngCore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kindred_core::{
    AuditLogger, ChatPipeline, JobStore, PipelineConfig, RateLimiter, ResponseCache, Settings,
};
use kindred_crypto::PayloadCipher;
use kindred_llm::{
    BreakerPolicy, ChatProvider, CircuitBreakerRegistry, EndpointConfig, OpenAiCompatProvider,
    ProviderRouter,
};

mod api;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kindred=info,kindred_core=info,kindred_llm=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Kindred v{}", env!("CARGO_PKG_VERSION"));

    let settings = Settings::load().context("failed to load settings")?;

    let cipher = Arc::new(build_cipher(&settings)?);

    let store = JobStore::from_path(std::path::Path::new(&settings.database_path))
        .await
        .context("failed to open job store")?;
    let audit = AuditLogger::initialize(store.pool().clone())
        .await
        .context("failed to initialize audit log")?;

    let cache = Arc::new(match &settings.redis_url {
        Some(url) => ResponseCache::new(url).context("invalid redis URL")?,
        None => {
            warn!("No redis_url configured; response cache is in-memory only");
            ResponseCache::in_memory()
        }
    });

    let chat_limiter = Arc::new(match &settings.redis_url {
        Some(url) => RateLimiter::new(
            "chat",
            settings.chat_rate_limit,
            Duration::from_secs(settings.chat_rate_window_secs),
            url,
        )
        .context("invalid redis URL")?,
        None => RateLimiter::in_memory(
            "chat",
            settings.chat_rate_limit,
            Duration::from_secs(settings.chat_rate_window_secs),
        ),
    });

    let router = Arc::new(ProviderRouter::new(
        build_provider(EndpointConfig::openai(
            settings.openai_api_key.clone().unwrap_or_default(),
        ))?,
        build_provider(EndpointConfig::groq(
            settings.groq_api_key.clone().unwrap_or_default(),
        ))?,
        Arc::new(CircuitBreakerRegistry::with_policy(BreakerPolicy::default())),
    ));
    if settings.openai_api_key.is_none() {
        warn!("OPENAI key not configured; primary provider will fail over");
    }
    if settings.groq_api_key.is_none() {
        warn!("GROQ key not configured; fallback provider will fail over");
    }

    let (pipeline, worker_pool) = ChatPipeline::start(
        store,
        cache,
        router,
        audit,
        cipher,
        PipelineConfig {
            max_retries: settings.max_retries,
            daily_cost_cap_usd: settings.daily_cost_cap_usd,
            workers: settings.workers,
            ..Default::default()
        },
    );

    let recovered = pipeline.recover_pending().await?;
    if recovered > 0 {
        info!(recovered, "Re-enqueued jobs left pending by a previous run");
    }

    let app = api::router(api::AppState {
        pipeline: Arc::clone(&pipeline),
        chat_limiter,
        redis_url: settings.redis_url.clone(),
    });

    let listener = tokio::net::TcpListener::bind(&settings.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.bind_addr))?;
    info!(addr = %settings.bind_addr, "Kindred listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // HTTP is down; let the workers finish the queued backlog
    info!("Shutting down, draining job queue");
    worker_pool.shutdown().await;

    Ok(())
}

fn build_provider(config: EndpointConfig) -> Result<Arc<dyn ChatProvider>> {
    let provider = OpenAiCompatProvider::new(config).context("failed to build provider")?;
    Ok(Arc::new(provider))
}

/// Build the at-rest cipher. Without a configured secret the key is
/// ephemeral: jobs from previous runs become unreadable.
fn build_cipher(settings: &Settings) -> Result<PayloadCipher> {
    match &settings.master_secret {
        Some(secret) => {
            PayloadCipher::from_base64_secret(secret).context("invalid KINDRED__MASTER_SECRET")
        }
        None => {
            warn!("No master_secret configured; using an ephemeral key for this run");
            let mut secret = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut secret);
            let encoded = base64::engine::general_purpose::STANDARD.encode(secret);
            PayloadCipher::from_base64_secret(&encoded).context("ephemeral key generation failed")
        }
    }
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C"),
        Err(e) => warn!(error = %e, "Failed to listen for shutdown signal"),
    }
}
