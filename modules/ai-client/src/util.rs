use regex::Regex;
use std::sync::LazyLock;

static JSON_OBJECT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\{.*\}").expect("static regex"));

/// Truncate a string to at most `max_bytes` bytes at a character boundary.
pub fn truncate_to_char_boundary(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) && end > 0 {
        end -= 1;
    }
    &s[..end]
}

/// Strip markdown code blocks from a response.
pub fn strip_code_blocks(response: &str) -> &str {
    response
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

/// Parse model output as JSON, falling back to the outermost `{...}` span
/// when the model wrapped the object in prose.
pub fn parse_json_lenient(raw: &str) -> Option<serde_json::Value> {
    let stripped = strip_code_blocks(raw);
    if let Ok(value) = serde_json::from_str(stripped) {
        return Some(value);
    }
    let span = JSON_OBJECT_RE.find(stripped)?;
    serde_json::from_str(span.as_str()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_to_char_boundary() {
        let text = "Hello 世界";
        let truncated = truncate_to_char_boundary(text, 8);
        assert!(truncated.len() <= 8);
        assert!(text.starts_with(truncated));
    }

    #[test]
    fn test_truncate_within_bounds() {
        let text = "Hello";
        assert_eq!(truncate_to_char_boundary(text, 100), "Hello");
    }

    #[test]
    fn test_strip_code_blocks() {
        assert_eq!(strip_code_blocks("```json\n{}\n```"), "{}");
        assert_eq!(strip_code_blocks("```\n{}\n```"), "{}");
        assert_eq!(strip_code_blocks("{}"), "{}");
    }

    #[test]
    fn lenient_parse_recovers_object_from_prose() {
        let raw = "Sure! Here you go: {\"results\": [1]} Hope that helps.";
        let value = parse_json_lenient(raw).unwrap();
        assert_eq!(value["results"][0], 1);
    }

    #[test]
    fn lenient_parse_gives_up_without_object() {
        assert!(parse_json_lenient("no json here").is_none());
    }
}
