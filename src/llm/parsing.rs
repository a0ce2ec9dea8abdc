//! Extraction of a JSON object from a provider's `content` field, which may
//! arrive bare or wrapped in a fenced code block.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{ErrorKind, PipelineError};

static FENCE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*\n?(.*?)\n?```").expect("static regex is valid")
});

/// Extract the innermost JSON object from `content`: a fenced block whose
/// tag is empty or "json" takes priority; otherwise the raw content is
/// tried as-is. Anything that does not parse to a JSON object is rejected
/// as `InvalidResponse`.
pub fn extract_json_object(content: &str) -> Result<serde_json::Value, PipelineError> {
    let candidate = FENCE_RE
        .captures(content)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
        .unwrap_or_else(|| content.trim());

    let value: serde_json::Value = serde_json::from_str(candidate).map_err(|e| {
        PipelineError::new(ErrorKind::InvalidResponse, format!("response content is not valid JSON: {e}"))
    })?;

    if !value.is_object() {
        return Err(PipelineError::new(
            ErrorKind::InvalidResponse,
            "response content did not contain a JSON object",
        ));
    }

    Ok(value)
}

/// Rough token estimate (4 characters per token) used when the provider's
/// usage block is absent.
pub fn estimate_tokens(content: &str) -> u64 {
    ((content.chars().count() as f64) / 4.0).ceil() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_bare_json_object() {
        let value = extract_json_object(r#"{"a": 1}"#).unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn extracts_fenced_json_block_with_json_tag() {
        let content = "```json\n{\"a\": 2}\n```";
        let value = extract_json_object(content).unwrap();
        assert_eq!(value["a"], 2);
    }

    #[test]
    fn extracts_fenced_block_with_no_tag() {
        let content = "```\n{\"a\": 3}\n```";
        let value = extract_json_object(content).unwrap();
        assert_eq!(value["a"], 3);
    }

    #[test]
    fn rejects_non_object_json() {
        let err = extract_json_object("[1, 2, 3]").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidResponse);
    }

    #[test]
    fn rejects_non_json_content() {
        let err = extract_json_object("not json at all").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidResponse);
    }

    #[test]
    fn estimate_tokens_is_roughly_proportional_to_length() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcdefgh"), 2);
    }
}
