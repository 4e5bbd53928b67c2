//! Static topic-matched responder.
//!
//! The terminal guarantee of the routing chain: when the primary and
//! fallback providers are both unavailable, this generator produces a
//! topic-appropriate supportive response without calling any external
//! service. It always succeeds.

use crate::message::{ChatMessage, MessageRole};

/// Provider tag attached to static responses.
pub const STATIC_PROVIDER: &str = "static";

/// (keywords, response) pairs checked in order against the latest user
/// message; first match wins.
const TOPIC_RESPONSES: &[(&[&str], &str)] = &[
    (
        &["autism", "autistic", "asd"],
        "Autism spectrum disorder (ASD) is a developmental difference that affects how a \
         person communicates, learns, and experiences the world. Every autistic person is \
         different, and strengths are as much a part of the picture as challenges. A \
         developmental pediatrician or licensed psychologist can walk you through screening \
         and next steps. I'm having trouble reaching our assistant right now, but please \
         try again in a few minutes for a more personal answer.",
    ),
    (
        &["adhd", "attention deficit", "hyperactive"],
        "ADHD affects attention, impulse control, and activity levels, and it often looks \
         different in kids than adults expect. Structure, movement breaks, and clear \
         one-step instructions help many families. A pediatrician can start an evaluation. \
         I'm having trouble reaching our assistant right now — please try again shortly.",
    ),
    (
        &["iep", "504", "school", "teacher", "classroom"],
        "You have the right to request a school evaluation in writing at any time, and the \
         school must respond within set timelines. Keep copies of everything and bring a \
         support person to meetings if it helps. I'm having trouble reaching our assistant \
         right now — please try again shortly for advice specific to your situation.",
    ),
    (
        &["meltdown", "tantrum", "overwhelmed", "sensory"],
        "Meltdowns are usually a sign of overload, not misbehavior. Reducing noise and \
         light, offering a safe quiet space, and keeping your own voice low and calm can \
         help a child regulate. I'm having trouble reaching our assistant right now — \
         please try again shortly.",
    ),
    (
        &["sleep", "bedtime", "night"],
        "Sleep struggles are very common for neurodivergent kids. A consistent wind-down \
         routine, dim lights, and the same bedtime every day (including weekends) are the \
         usual starting points. I'm having trouble reaching our assistant right now — \
         please try again shortly.",
    ),
    (
        &["therapy", "therapist", "aba", "speech", "occupational"],
        "Finding the right therapy fit can take a few tries, and that's normal. Ask \
         providers how they measure progress and how they involve you. Your pediatrician \
         or insurance directory is a good starting point. I'm having trouble reaching our \
         assistant right now — please try again shortly.",
    ),
    (
        &["diagnosis", "diagnosed", "evaluation", "assessment"],
        "A formal evaluation usually involves questionnaires, observation, and \
         developmental history, and waitlists can unfortunately be long — getting on one \
         early helps. I'm having trouble reaching our assistant right now — please try \
         again shortly for more specific guidance.",
    ),
];

/// Generic response used when no topic matches.
const GENERIC_RESPONSE: &str = "Thank you for reaching out. I'm having trouble connecting to \
our assistant right now, so I can't give you a full answer — please try again in a few \
minutes. If this is urgent, your pediatrician's nurse line is a good resource, and the \
community forum here is full of parents who've been where you are.";

/// Produce a static response for the conversation. Never fails.
#[must_use]
pub fn respond(messages: &[ChatMessage]) -> String {
    let last_user = messages
        .iter()
        .rev()
        .find(|m| m.role == MessageRole::User)
        .map(|m| m.content.to_lowercase())
        .unwrap_or_default();

    for (keywords, response) in TOPIC_RESPONSES {
        if keywords.iter().any(|kw| last_user.contains(kw)) {
            return (*response).to_string();
        }
    }
    GENERIC_RESPONSE.to_string()
}
