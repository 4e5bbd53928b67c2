//! Provider-side failure taxonomy.
//!
//! Every variant here counts as a routing failure: the router treats
//! them uniformly when deciding whether to trip a breaker and fall back.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Endpoint has no API key or base URL.
    #[error("provider not configured: {0}")]
    NotConfigured(String),

    /// Non-2xx from the endpoint; `message` has already been through
    /// `sanitize_api_error`, never the raw body.
    #[error("provider {provider} returned {status}: {message}")]
    Http {
        provider: String,
        status: u16,
        message: String,
    },

    /// The per-call deadline elapsed before the provider answered.
    #[error("timeout after {0}ms")]
    Timeout(u64),

    /// 2xx with no choices or empty content.
    #[error("empty response from provider {0}")]
    EmptyResponse(String),

    /// Body did not parse as the expected completion shape.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Connection-level failure before any HTTP status was seen.
    #[error("network error: {0}")]
    Network(String),
}

pub type Result<T> = std::result::Result<T, Error>;
