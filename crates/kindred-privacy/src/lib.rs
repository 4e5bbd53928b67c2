//! Kindred Privacy — PII detection and redaction.
//!
//! Pattern-based detector for the PII shapes we must never persist:
//! SSN, email, phone, credit card, date of birth, IP address, and
//! street address. Every raw request/response snapshot headed for the
//! audit log passes through [`redact_text`] — this crate is the
//! mandatory choke point, not an optional filter.
//!
//! Redaction replaces each non-overlapping match (position order,
//! first match wins) with a `[TYPE]` placeholder. Placeholders contain
//! no digits or `@`, so redaction is idempotent.

#![forbid(unsafe_code)]

use kindred_llm::{ChatMessage, MessageRole};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Kinds of PII the detector recognizes, in match-priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PiiKind {
    Ssn,
    CreditCard,
    Email,
    Phone,
    DateOfBirth,
    IpAddress,
    StreetAddress,
}

impl PiiKind {
    /// Placeholder inserted in place of a match.
    #[must_use]
    pub fn placeholder(&self) -> &'static str {
        match self {
            Self::Ssn => "[SSN]",
            Self::CreditCard => "[CREDIT_CARD]",
            Self::Email => "[EMAIL]",
            Self::Phone => "[PHONE]",
            Self::DateOfBirth => "[DOB]",
            Self::IpAddress => "[IP_ADDRESS]",
            Self::StreetAddress => "[STREET_ADDRESS]",
        }
    }

    /// Whether this kind is treated as hard-block sensitive.
    #[must_use]
    pub fn is_sensitive(&self) -> bool {
        matches!(self, Self::Ssn | Self::CreditCard)
    }
}

lazy_static! {
    // Priority order matters: earlier kinds win ties at the same offset.
    static ref PATTERNS: Vec<(PiiKind, Regex)> = vec![
        (
            PiiKind::Ssn,
            Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").expect("valid regex"),
        ),
        (
            PiiKind::CreditCard,
            Regex::new(r"\b\d{4}[- ]?\d{4}[- ]?\d{4}[- ]?\d{4}\b").expect("valid regex"),
        ),
        (
            PiiKind::Email,
            Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b")
                .expect("valid regex"),
        ),
        (
            PiiKind::Phone,
            Regex::new(r"\b(?:\+?1[-. ]?)?\(?\d{3}\)?[-. ]?\d{3}[-. ]?\d{4}\b")
                .expect("valid regex"),
        ),
        (
            PiiKind::DateOfBirth,
            Regex::new(r"\b(?:0?[1-9]|1[0-2])[/-](?:0?[1-9]|[12]\d|3[01])[/-](?:19|20)\d{2}\b")
                .expect("valid regex"),
        ),
        (
            PiiKind::IpAddress,
            Regex::new(r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b").expect("valid regex"),
        ),
        (
            PiiKind::StreetAddress,
            Regex::new(
                r"(?i)\b\d{1,5}\s+(?:[A-Za-z]+\s+){0,2}(?:Street|St|Avenue|Ave|Road|Rd|Boulevard|Blvd|Lane|Ln|Drive|Dr|Court|Ct|Place|Pl|Circle|Cir|Way)\b"
            )
            .expect("valid regex"),
        ),
    ];
}

/// One PII match. Only the kind and byte span are kept — never the
/// matched text itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    /// Kind of PII found
    pub kind: PiiKind,
    /// Byte offset of the match start
    pub start: usize,
    /// Byte offset of the match end
    pub end: usize,
}

/// Result of running the detector over one piece of text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    /// Non-overlapping findings in position order
    pub findings: Vec<Finding>,
    /// Text with every finding replaced by its placeholder
    pub redacted: String,
    /// Number of replacements made
    pub count: usize,
}

/// A message after per-message redaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedactedMessage {
    /// Role of the original message
    pub role: MessageRole,
    /// Redacted content
    pub content: String,
    /// Whether anything was replaced
    pub redacted: bool,
}

/// Detect and redact PII in `text`.
#[must_use]
pub fn detect(text: &str) -> Detection {
    let mut findings: Vec<Finding> = Vec::new();
    for (kind, pattern) in PATTERNS.iter() {
        for m in pattern.find_iter(text) {
            findings.push(Finding {
                kind: *kind,
                start: m.start(),
                end: m.end(),
            });
        }
    }

    // Position order, pattern priority breaking ties at equal offsets.
    findings.sort_by_key(|f| (f.start, priority_of(f.kind)));

    // First match wins on overlap.
    let mut kept: Vec<Finding> = Vec::with_capacity(findings.len());
    let mut last_end = 0usize;
    for finding in findings {
        if kept.is_empty() || finding.start >= last_end {
            last_end = finding.end;
            kept.push(finding);
        }
    }

    let mut redacted = String::with_capacity(text.len());
    let mut cursor = 0usize;
    for finding in &kept {
        redacted.push_str(&text[cursor..finding.start]);
        redacted.push_str(finding.kind.placeholder());
        cursor = finding.end;
    }
    redacted.push_str(&text[cursor..]);

    let count = kept.len();
    Detection {
        findings: kept,
        redacted,
        count,
    }
}

fn priority_of(kind: PiiKind) -> usize {
    PATTERNS
        .iter()
        .position(|(k, _)| *k == kind)
        .unwrap_or(usize::MAX)
}

/// Redact a single piece of text, discarding findings.
#[must_use]
pub fn redact_text(text: &str) -> String {
    detect(text).redacted
}

/// Apply redaction per-message, tagging messages that were altered.
#[must_use]
pub fn redact_messages(messages: &[ChatMessage]) -> Vec<RedactedMessage> {
    messages
        .iter()
        .map(|m| {
            let detection = detect(&m.content);
            RedactedMessage {
                role: m.role,
                redacted: detection.count > 0,
                content: detection.redacted,
            }
        })
        .collect()
}

/// Stricter gate: true only for SSN or credit-card findings.
#[must_use]
pub fn contains_sensitive_pii(text: &str) -> bool {
    detect(text).findings.iter().any(|f| f.kind.is_sensitive())
}
