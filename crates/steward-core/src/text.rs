//! Text handling for user-visible strings derived from job records:
//! sanitization, redaction, truncation, and time formatting.
//!
//! Any string that leaves the core for a chat surface must pass through
//! [`sanitize`] (notifications) or [`redact`] (alerts). Truncation is
//! character-based and always lands on a char boundary.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;

static USER_ROLE_MENTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<@[!&]?\d+>").expect("static regex"));
static CHANNEL_MENTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<#\d+>").expect("static regex"));
static BROADCAST_MENTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@(everyone|here)").expect("static regex"));
static DATA_URI: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"data:[\w.+/-]+;base64,[A-Za-z0-9+/=]+").expect("static regex"));
static BASE64_BLOB: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9+/]{40,}={0,2}").expect("static regex"));

/// Truncate to at most `max` characters, silently, on a char boundary.
pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_owned();
    }
    s.chars().take(max).collect()
}

/// Truncate to at most `max` characters with a trailing ellipsis counted
/// inside the limit.
pub fn truncate_with_ellipsis(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_owned();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

/// Strip control and direction-override characters that can forge or
/// reorder surrounding text.
fn strip_hostile_chars(s: &str) -> String {
    s.chars()
        .filter(|c| {
            *c != '\0'
                && !('\u{202A}'..='\u{202E}').contains(c)
                && !('\u{2066}'..='\u{2069}').contains(c)
        })
        .collect()
}

/// Neutralize platform mention patterns so a task cannot ping through the
/// notification channel.
fn mask_mentions(s: &str) -> String {
    let s = USER_ROLE_MENTION.replace_all(s, "[mention]");
    let s = CHANNEL_MENTION.replace_all(&s, "[channel]");
    BROADCAST_MENTION.replace_all(&s, "[mention]").into_owned()
}

/// Sanitize a task excerpt for an approval notification: strip hostile
/// characters, mask mentions, escape code-fence delimiters. Truncation is
/// applied by the caller *after* sanitization.
pub fn sanitize(s: &str) -> String {
    let s = strip_hostile_chars(s);
    let s = mask_mentions(&s);
    s.replace("```", "'''")
}

/// Redact a string for a DLQ alert: everything [`sanitize`] does, plus
/// base64 blobs and data URIs.
pub fn redact(s: &str) -> String {
    let s = sanitize(s);
    let s = DATA_URI.replace_all(&s, "[base64 redacted]");
    BASE64_BLOB
        .replace_all(&s, "[base64 redacted]")
        .into_owned()
}

/// Compact relative time for CLI and activity output.
pub fn format_relative(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - at).num_seconds();
    if secs < 5 {
        return "just now".to_owned();
    }
    if secs < 60 {
        return format!("{secs}s ago");
    }
    let mins = secs / 60;
    if mins < 60 {
        return format!("{mins}m ago");
    }
    let hours = mins / 60;
    if hours < 24 {
        return format!("{hours}h ago");
    }
    format!("{}d ago", hours / 24)
}
