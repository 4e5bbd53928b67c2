//! Kindred LLM — chat-completion providers and routing.
//!
//! This crate owns everything between the pipeline and the outside
//! world of chat-completion APIs:
//! - message and completion types shared across the workspace
//! - an OpenAI-compatible HTTP provider (both configured endpoints
//!   speak the same wire format)
//! - a circuit-breaker registry guarding unhealthy providers
//! - crisis-content detection and the fixed crisis response
//! - a static topic responder used as the terminal routing guarantee
//! - the router that chains primary → fallback → static

#![forbid(unsafe_code)]

pub mod breaker;
pub mod cost;
pub mod crisis;
pub mod error;
pub mod fallback;
pub mod message;
pub mod openai_compat;
pub mod provider;
pub mod router;

pub use breaker::{BreakerPolicy, CircuitBreakerRegistry};
pub use cost::estimate_cost;
pub use crisis::{messages_contain_crisis, CRISIS_PROVIDER, CRISIS_RESPONSE};
pub use error::{Error, Result};
pub use fallback::STATIC_PROVIDER;
pub use message::{ChatMessage, CompletionRequest, CompletionResponse, MessageRole, TokenUsage};
pub use openai_compat::{EndpointConfig, OpenAiCompatProvider};
pub use provider::ChatProvider;
pub use router::{ProviderRouter, RoutedResponse};
