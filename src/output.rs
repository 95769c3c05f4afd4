//! Recovery of structured JSON from free-text LLM replies.
//!
//! Hosts rarely return bare JSON. The extraction sequence tries the whole
//! reply first, then a fenced ```json block, then the first balanced
//! `{...}` substring. The raw text is kept by the caller either way.

use std::sync::OnceLock;

use regex::{Regex, RegexBuilder};
use serde_json::Value;

static FENCED_JSON: OnceLock<Regex> = OnceLock::new();

fn fenced_json_re() -> &'static Regex {
    FENCED_JSON.get_or_init(|| {
        RegexBuilder::new(r"```json\s*(.*?)```")
            .dot_matches_new_line(true)
            .case_insensitive(true)
            .build()
            .expect("valid regex")
    })
}

/// Extract a JSON object from a reply. Returns `None` when no recovery
/// stage produces an object; arrays and scalars do not count.
pub fn extract_structured(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed)
        && value.is_object()
    {
        return Some(value);
    }

    if let Some(caps) = fenced_json_re().captures(raw)
        && let Ok(value) = serde_json::from_str::<Value>(caps[1].trim())
        && value.is_object()
    {
        return Some(value);
    }

    let mut from = 0;
    while let Some(rel) = raw[from..].find('{') {
        let start = from + rel;
        if let Some(candidate) = balanced_object(&raw[start..])
            && let Ok(value) = serde_json::from_str::<Value>(candidate)
            && value.is_object()
        {
            return Some(value);
        }
        from = start + 1;
    }
    None
}

/// Balanced `{...}` prefix starting at the first byte, honoring JSON string
/// and escape rules.
fn balanced_object(raw: &str) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in raw.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&raw[..offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}
