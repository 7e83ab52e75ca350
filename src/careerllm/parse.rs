//! JSON extraction from LLM replies.
//!
//! Models wrap their JSON in prose more often than not, so every structured
//! call site parses through the same tolerant path: try the whole reply
//! first, then scan for the first balanced `{...}` fragment with brace
//! counting and parse that.

use serde::de::DeserializeOwned;

/// Locate the first balanced JSON object in `text`.
///
/// Brace counting runs over characters, so braces inside string literals
/// can defeat it; in practice model output that matters parses on the
/// whole-reply path first and this is only the fallback.
pub(crate) fn first_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    for (offset, ch) in text[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&text[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse a typed value out of a model reply.
///
/// Returns the serde error text of the whole-reply attempt when neither
/// the full text nor the first embedded object deserializes.
pub(crate) fn parse_reply<T: DeserializeOwned>(text: &str) -> Result<T, String> {
    match serde_json::from_str::<T>(text.trim()) {
        Ok(value) => Ok(value),
        Err(full_err) => {
            if let Some(fragment) = first_json_object(text) {
                if let Ok(value) = serde_json::from_str::<T>(fragment) {
                    return Ok(value);
                }
            }
            Err(full_err.to_string())
        }
    }
}
