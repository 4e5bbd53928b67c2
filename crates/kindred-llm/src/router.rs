//! Provider router with circuit breaking.
//!
//! Routing order: primary provider → fallback provider → static topic
//! responder. A provider is skipped while its circuit is open; call
//! failures and timeouts feed the breaker. The static responder is the
//! terminal guarantee, so `route` is infallible and every response
//! carries an explicit provider tag.

use crate::breaker::CircuitBreakerRegistry;
use crate::fallback;
use crate::message::{ChatMessage, CompletionRequest, TokenUsage};
use crate::provider::ChatProvider;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Default per-provider call deadline.
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);
/// Default generation parameters for support conversations.
const DEFAULT_MAX_TOKENS: u32 = 1024;
const DEFAULT_TEMPERATURE: f32 = 0.7;

/// A routed completion with explicit provider attribution.
#[derive(Debug, Clone)]
pub struct RoutedResponse {
    /// Generated content
    pub content: String,
    /// Provider that actually produced the response
    /// (`"static"` for the terminal responder)
    pub provider: String,
    /// Model that produced the response
    pub model: String,
    /// Token usage, when the provider reported it
    pub usage: Option<TokenUsage>,
}

/// Routes completions across the configured providers.
pub struct ProviderRouter {
    chain: Vec<Arc<dyn ChatProvider>>,
    breakers: Arc<CircuitBreakerRegistry>,
    call_timeout: Duration,
    max_tokens: u32,
    temperature: f32,
}

impl ProviderRouter {
    /// Create a router over a primary and a fallback provider.
    #[must_use]
    pub fn new(
        primary: Arc<dyn ChatProvider>,
        fallback: Arc<dyn ChatProvider>,
        breakers: Arc<CircuitBreakerRegistry>,
    ) -> Self {
        Self {
            chain: vec![primary, fallback],
            breakers,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
        }
    }

    /// Override the per-provider call deadline.
    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// The breaker registry this router feeds.
    #[must_use]
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Route a conversation to the first healthy provider.
    ///
    /// Never fails: if every provider is open or erroring, the static
    /// topic responder produces the answer.
    #[instrument(skip(self, messages))]
    pub async fn route(&self, messages: &[ChatMessage]) -> RoutedResponse {
        for provider in &self.chain {
            let name = provider.name().to_string();

            if self.breakers.is_open(&name) {
                debug!(provider = %name, "Circuit open, skipping provider");
                continue;
            }

            let request = CompletionRequest::new(provider.default_model())
                .with_messages(messages.to_vec())
                .with_max_tokens(self.max_tokens)
                .with_temperature(self.temperature);

            match tokio::time::timeout(self.call_timeout, provider.complete(request)).await {
                Ok(Ok(response)) => {
                    self.breakers.record_success(&name);
                    debug!(provider = %name, model = %response.model, "Provider call succeeded");
                    return RoutedResponse {
                        content: response.content,
                        provider: name,
                        model: response.model,
                        usage: response.usage,
                    };
                }
                Ok(Err(e)) => {
                    self.breakers.record_failure(&name);
                    warn!(provider = %name, error = %e, "Provider call failed, trying next");
                }
                Err(_) => {
                    self.breakers.record_failure(&name);
                    warn!(
                        provider = %name,
                        timeout_ms = self.call_timeout.as_millis() as u64,
                        "Provider call timed out, trying next"
                    );
                }
            }
        }

        info!("All providers unavailable, serving static response");
        RoutedResponse {
            content: fallback::respond(messages),
            provider: fallback::STATIC_PROVIDER.to_string(),
            model: fallback::STATIC_PROVIDER.to_string(),
            usage: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerPolicy;
    use crate::error::Error;
    use crate::message::CompletionResponse;
    use crate::provider::MockChatProvider;

    fn breakers(threshold: u32) -> Arc<CircuitBreakerRegistry> {
        Arc::new(CircuitBreakerRegistry::with_policy(BreakerPolicy {
            failure_threshold: threshold,
            cool_down: Duration::from_secs(60),
        }))
    }

    fn ok_response(model: &str) -> CompletionResponse {
        CompletionResponse {
            content: "hello from the model".to_string(),
            usage: Some(TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 20,
                total_tokens: 30,
            }),
            model: model.to_string(),
        }
    }

    fn failing_provider(name: &'static str, times: usize) -> MockChatProvider {
        let mut mock = MockChatProvider::new();
        mock.expect_name().return_const(name.to_string());
        mock.expect_default_model().return_const("m".to_string());
        mock.expect_complete()
            .times(times)
            .returning(|_| Err(Error::Network("connection refused".to_string())));
        mock
    }

    #[tokio::test]
    async fn test_primary_success_is_tagged() {
        let mut primary = MockChatProvider::new();
        primary.expect_name().return_const("openai".to_string());
        primary
            .expect_default_model()
            .return_const("gpt-4o-mini".to_string());
        primary
            .expect_complete()
            .times(1)
            .returning(|_| Ok(ok_response("gpt-4o-mini")));

        let fallback = MockChatProvider::new(); // must not be called

        let router = ProviderRouter::new(Arc::new(primary), Arc::new(fallback), breakers(5));
        let routed = router.route(&[ChatMessage::user("hi")]).await;

        assert_eq!(routed.provider, "openai");
        assert_eq!(routed.model, "gpt-4o-mini");
        assert_eq!(routed.usage.unwrap().total_tokens, 30);
    }

    #[tokio::test]
    async fn test_fallback_serves_when_primary_fails() {
        let primary = failing_provider("openai", 1);

        let mut fallback = MockChatProvider::new();
        fallback.expect_name().return_const("groq".to_string());
        fallback
            .expect_default_model()
            .return_const("llama-3.3-70b-versatile".to_string());
        fallback
            .expect_complete()
            .times(1)
            .returning(|_| Ok(ok_response("llama-3.3-70b-versatile")));

        let router = ProviderRouter::new(Arc::new(primary), Arc::new(fallback), breakers(5));
        let routed = router.route(&[ChatMessage::user("hi")]).await;

        assert_eq!(routed.provider, "groq");
    }

    #[tokio::test]
    async fn test_circuit_opens_after_five_failures_and_skips_primary() {
        // Primary fails exactly 5 times, then must never be called again.
        let primary = failing_provider("openai", 5);

        let mut fallback = MockChatProvider::new();
        fallback.expect_name().return_const("groq".to_string());
        fallback
            .expect_default_model()
            .return_const("llama".to_string());
        fallback
            .expect_complete()
            .times(6)
            .returning(|_| Ok(ok_response("llama")));

        let router = ProviderRouter::new(Arc::new(primary), Arc::new(fallback), breakers(5));
        let messages = [ChatMessage::user("hi")];

        for _ in 0..5 {
            let routed = router.route(&messages).await;
            assert_eq!(routed.provider, "groq");
        }
        assert!(router.breakers().is_open("openai"));

        // Sixth call routes directly to the fallback; mock expectations
        // verify the primary saw exactly 5 attempts.
        let routed = router.route(&messages).await;
        assert_eq!(routed.provider, "groq");
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        struct SlowProvider;

        #[async_trait::async_trait]
        impl ChatProvider for SlowProvider {
            fn name(&self) -> &str {
                "openai"
            }
            fn default_model(&self) -> &str {
                "gpt-4o-mini"
            }
            async fn complete(
                &self,
                _request: CompletionRequest,
            ) -> crate::error::Result<CompletionResponse> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(ok_response("gpt-4o-mini"))
            }
        }

        let mut fallback = MockChatProvider::new();
        fallback.expect_name().return_const("groq".to_string());
        fallback
            .expect_default_model()
            .return_const("llama".to_string());
        fallback
            .expect_complete()
            .returning(|_| Ok(ok_response("llama")));

        let registry = breakers(1);
        let router = ProviderRouter::new(Arc::new(SlowProvider), Arc::new(fallback), registry)
            .with_call_timeout(Duration::from_millis(10));

        let routed = router.route(&[ChatMessage::user("hi")]).await;
        assert_eq!(routed.provider, "groq");
        assert!(router.breakers().is_open("openai"));
    }

    #[tokio::test]
    async fn test_static_responder_is_terminal() {
        let primary = failing_provider("openai", 1);
        let fallback = failing_provider("groq", 1);

        let router = ProviderRouter::new(Arc::new(primary), Arc::new(fallback), breakers(5));
        let routed = router.route(&[ChatMessage::user("What is autism?")]).await;

        assert_eq!(routed.provider, fallback::STATIC_PROVIDER);
        assert!(routed.content.contains("Autism spectrum disorder"));
        assert!(routed.usage.is_none());
    }
}
