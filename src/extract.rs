//! Notification → amount extraction.
//!
//! 1. coarse package filter against rule matchers (no regex work on misses)
//! 2. fragments joined with single spaces, trimmed
//! 3. the selected rule's pattern, case-insensitive; first match whose
//!    group 1 participated
//! 4. group 1 stripped to digits and parsed; `0` or overflow is "no amount"
//! 5. display text cleaned of framework tokens, whitespace collapsed, ≤100 chars
//!
//! Entitlement tagging is not done here; `is_trial_limited` is always `false`
//! on the way out and set by the pipeline.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::rules::{Rule, RuleCache, RuleSnapshot};

/// Display text cap, in chars.
pub const MAX_DISPLAY_CHARS: usize = 100;
/// Candidate text cap before any pattern runs, in chars.
pub const MAX_CANDIDATE_CHARS: usize = 4096;

/// One notification as delivered by the host. Consumed once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub source_package: String,
    pub text_fragments: Vec<String>,
    pub received_at: DateTime<Utc>,
    /// Host-level identity of the notification, when the host has one.
    #[serde(default)]
    pub dedup_key: Option<String>,
}

impl InboundEvent {
    /// Build from the OS callback shape: title, text, big text, in that order.
    /// Missing or blank parts are dropped.
    pub fn from_notification(
        package: impl Into<String>,
        title: Option<&str>,
        text: Option<&str>,
        big_text: Option<&str>,
        received_at: DateTime<Utc>,
    ) -> Self {
        let text_fragments = [title, text, big_text]
            .into_iter()
            .flatten()
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string)
            .collect();
        Self {
            source_package: package.into(),
            text_fragments,
            received_at,
            dedup_key: None,
        }
    }

    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedTransaction {
    pub source_app: String,
    pub amount: f64,
    pub raw_message: String,
    pub timestamp: DateTime<Utc>,
    pub is_trial_limited: bool,
}

/// An extracted transaction together with the rule that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub transaction: ExtractedTransaction,
    pub rule: Rule,
}

/// Reads the live rule cache on every call.
pub struct ExtractionEngine {
    cache: Arc<RuleCache>,
}

impl ExtractionEngine {
    pub fn new(cache: Arc<RuleCache>) -> Self {
        Self { cache }
    }

    pub fn extract(&self, event: &InboundEvent) -> Option<Extraction> {
        extract_with(&self.cache.snapshot(), event)
    }
}

/// Run extraction against a fixed snapshot.
pub fn extract_with(snapshot: &RuleSnapshot, event: &InboundEvent) -> Option<Extraction> {
    let selected = snapshot.select(&event.source_package)?;
    let regex = selected.regex()?;

    let text = candidate_text(&event.text_fragments);
    if text.is_empty() {
        return None;
    }

    let Some(amount) = find_amount(regex, &text) else {
        tracing::debug!(
            target: "extract",
            rule_id = selected.rule.id,
            package = %event.source_package,
            "rule matched package but no amount found"
        );
        return None;
    };

    Some(Extraction {
        transaction: ExtractedTransaction {
            source_app: event.source_package.clone(),
            amount: amount as f64,
            raw_message: sanitize_display(&text),
            timestamp: event.received_at,
            is_trial_limited: false,
        },
        rule: selected.rule.clone(),
    })
}

/// Fragments joined by single spaces and trimmed, capped at [`MAX_CANDIDATE_CHARS`].
pub fn candidate_text(fragments: &[String]) -> String {
    let joined = fragments.join(" ");
    let trimmed = joined.trim();
    if trimmed.chars().count() > MAX_CANDIDATE_CHARS {
        trimmed.chars().take(MAX_CANDIDATE_CHARS).collect()
    } else {
        trimmed.to_string()
    }
}

/// First match with a participating group 1, parsed by [`parse_amount`].
pub fn find_amount(regex: &Regex, text: &str) -> Option<u64> {
    let group = regex
        .captures_iter(text)
        .find_map(|caps| caps.get(1))?;
    parse_amount(group.as_str())
}

/// Keep digits only, so `75.000`, `75,000`, `75 000` and `75000` all read as
/// 75000. Empty, zero, or beyond `u64` is `None`.
pub fn parse_amount(raw: &str) -> Option<u64> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }
    match digits.parse::<u64>() {
        Ok(0) | Err(_) => None,
        Ok(n) => Some(n),
    }
}

static RE_FRAMEWORK_STYLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)android\.app\.Notification\$[a-zA-Z]+").unwrap());
static RE_FRAMEWORK_CLASS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"([a-zA-Z0-9]+\.[a-zA-Z0-9.]+\$[a-zA-Z0-9]+)|(androidx?\.[a-zA-Z0-9.]+)").unwrap()
});
static RE_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Human-readable display text: entities decoded, framework class names
/// removed, whitespace collapsed, truncated to [`MAX_DISPLAY_CHARS`] chars.
pub fn sanitize_display(text: &str) -> String {
    let decoded = html_escape::decode_html_entities(text);
    let out = RE_FRAMEWORK_STYLE.replace_all(&decoded, " ");
    let out = RE_FRAMEWORK_CLASS.replace_all(&out, " ");
    let out = RE_WS.replace_all(&out, " ");
    out.trim().chars().take(MAX_DISPLAY_CHARS).collect()
}
