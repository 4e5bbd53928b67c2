//! The provider seam the router is built on.

use crate::error::Result;
use crate::message::{CompletionRequest, CompletionResponse};

/// Trait for chat-completion providers.
///
/// The router only ever talks to this trait, so tests can swap in
/// scripted providers without touching the network.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait ChatProvider: Send + Sync {
    /// Stable provider name, used for circuit breaking, cache
    /// attribution and audit records.
    fn name(&self) -> &str;

    /// Model used when a request does not specify one.
    fn default_model(&self) -> &str;

    /// Complete a conversation.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse>;
}
