//! Pre-flight clarification heuristics.
//!
//! Cheap pattern checks that can short-circuit a run before round 1 when
//! the question cannot be answered without more input. Gated behind
//! `EngineConfig::preflight_clarification`; when disabled the model is
//! trusted to infer scope from datasource metadata.

use std::sync::LazyLock;

use regex::Regex;

/// A clarification the caller should answer before orchestration runs.
#[derive(Debug, Clone, PartialEq)]
pub struct Clarification {
    pub question: String,
    pub reason: String,
}

static TEMPORAL_TERMS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(trend|over time|growth|change|increase|decrease|year[- ]over[- ]year|month[- ]over[- ]month)\b")
        .expect("temporal terms regex")
});

static TIME_RANGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(today|yesterday|this (week|month|quarter|year)|last (week|month|quarter|year|\d+ (days|weeks|months|years))|(19|20)\d{2}|q[1-4]|ytd|since\b)",
    )
    .expect("time range regex")
});

static COMPARISON_DANGLING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(compare|versus|vs\.?)\s*$").expect("comparison regex")
});

/// Check a question for ambiguity that would waste a full orchestration
/// run. Returns the first clarification found, or `None` when the question
/// can proceed.
#[must_use]
pub fn check(question: &str) -> Option<Clarification> {
    let trimmed = question.trim();
    if trimmed.is_empty() {
        return Some(Clarification {
            question: "What would you like to know about this data?".to_string(),
            reason: "empty question".to_string(),
        });
    }

    if COMPARISON_DANGLING.is_match(trimmed) {
        return Some(Clarification {
            question: "What should the comparison be against?".to_string(),
            reason: "dangling comparison".to_string(),
        });
    }

    if TEMPORAL_TERMS.is_match(trimmed) && !TIME_RANGE.is_match(trimmed) {
        return Some(Clarification {
            question: "Over what time period should the trend be measured?".to_string(),
            reason: "temporal question without a time range".to_string(),
        });
    }

    None
}
