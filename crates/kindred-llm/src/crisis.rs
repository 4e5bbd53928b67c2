//! Crisis-content detection.
//!
//! Messages mentioning self-harm or violence never reach providers or
//! the cache: the pipeline answers with a fixed resources message and
//! records a SAFETY_BLOCK audit entry instead.

use crate::message::{ChatMessage, MessageRole};

/// Keyword list matched case-insensitively against user messages.
const CRISIS_KEYWORDS: &[&str] = &[
    "suicide",
    "suicidal",
    "kill myself",
    "killing myself",
    "end my life",
    "ending my life",
    "want to die",
    "better off dead",
    "self-harm",
    "self harm",
    "hurt myself",
    "hurting myself",
    "cut myself",
    "hurt my child",
    "hurt someone",
    "kill someone",
    "hurt them",
    "violent thoughts",
];

/// Provider tag attached to crisis responses.
pub const CRISIS_PROVIDER: &str = "crisis";

/// Fixed response returned for crisis content. Intentionally static:
/// no model output is ever mixed into safety messaging.
pub const CRISIS_RESPONSE: &str = "It sounds like you or someone close to you may be going \
through a really difficult moment. You don't have to face this alone.\n\n\
If you or someone else is in immediate danger, please call 911 (or your local emergency \
number) right now.\n\n\
- 988 Suicide & Crisis Lifeline: call or text 988 (US), available 24/7\n\
- Crisis Text Line: text HOME to 741741\n\
- If you are outside the US, https://findahelpline.com lists local services\n\n\
A trained counselor can help, and reaching out is a strong first step. When you're safe \
and ready, I'm here to keep supporting you and your family.";

/// Whether a single piece of text contains crisis keywords.
#[must_use]
pub fn contains_crisis_content(text: &str) -> bool {
    let lower = text.to_lowercase();
    CRISIS_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

/// Whether any user message in the conversation contains crisis keywords.
///
/// Assistant/system text is ignored: the crisis response itself mentions
/// these terms and must not re-trigger on history.
#[must_use]
pub fn messages_contain_crisis(messages: &[ChatMessage]) -> bool {
    messages
        .iter()
        .filter(|m| m.role == MessageRole::User)
        .any(|m| contains_crisis_content(&m.content))
}
