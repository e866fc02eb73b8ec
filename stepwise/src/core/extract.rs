//! Recover a plan response from free-form model text.
//!
//! Strategies, in order: the whole text as JSON, the first fenced code block,
//! then the first balanced `{...}` span that parses.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::core::types::PlanResponse;

static FENCED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"```(?:json|JSON)?[ \t]*\r?\n?([\s\S]*?)```").expect("fence regex should compile")
});

/// Extract a [`PlanResponse`] from raw text, or `None` if nothing usable is found.
pub fn extract_plan(text: &str) -> Option<PlanResponse> {
    extract_json(text).and_then(|value| serde_json::from_value(value).ok())
}

/// Extract the first JSON object from raw text.
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed)
        && value.is_object()
    {
        return Some(value);
    }

    if let Some(block) = FENCED_RE.captures(trimmed).and_then(|caps| caps.get(1))
        && let Ok(value) = serde_json::from_str::<Value>(block.as_str().trim())
        && value.is_object()
    {
        return Some(value);
    }

    first_object_span(trimmed)
}

/// Scan for balanced `{...}` spans (string-aware) and return the first that parses.
fn first_object_span(text: &str) -> Option<Value> {
    let bytes = text.as_bytes();
    let mut start = 0;
    while let Some(offset) = text[start..].find('{') {
        let open = start + offset;
        if let Some(close) = matching_brace(bytes, open)
            && let Ok(value) = serde_json::from_str::<Value>(&text[open..=close])
        {
            return Some(value);
        }
        start = open + 1;
    }
    None
}

fn matching_brace(bytes: &[u8], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (idx, &byte) in bytes.iter().enumerate().skip(open) {
        if in_string {
            match byte {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(idx);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Action;

    #[test]
    fn parses_plain_json() {
        let plan = extract_plan(
            r#"{"explanation":"fix","plan":[{"action":"run_command","command":"ls"}]}"#,
        )
        .expect("plan");
        assert_eq!(plan.explanation.as_deref(), Some("fix"));
        assert_eq!(plan.plan[0].action(), Some(Action::RunCommand));
    }

    #[test]
    fn parses_fenced_block() {
        let text = "Here is the fix:\n```json\n{\"plan\":[{\"action\":\"read_file\",\"path\":\"a\"}]}\n```\nDone.";
        let plan = extract_plan(text).expect("plan");
        assert_eq!(plan.plan.len(), 1);
        assert_eq!(plan.plan[0].path.as_deref(), Some("a"));
    }

    #[test]
    fn parses_bare_fence() {
        let text = "```\n{\"plan\":[]}\n```";
        let plan = extract_plan(text).expect("plan");
        assert!(plan.plan.is_empty());
    }

    #[test]
    fn scans_for_first_balanced_object() {
        let text = r#"Sure! {"explanation":"use \"}\" carefully","plan":[{"action":"create_file","path":"x","content":"{}"}]} trailing {oops"#;
        let plan = extract_plan(text).expect("plan");
        assert_eq!(plan.explanation.as_deref(), Some(r#"use "}" carefully"#));
        assert_eq!(plan.plan[0].content.as_deref(), Some("{}"));
    }

    #[test]
    fn skips_unparseable_spans() {
        let text = r#"{not json} then {"plan":[]}"#;
        assert_eq!(extract_plan(text), Some(PlanResponse::default()));
    }

    #[test]
    fn gives_up_on_garbage() {
        assert!(extract_plan("").is_none());
        assert!(extract_plan("no json here").is_none());
        assert!(extract_plan("{ unterminated").is_none());
    }
}
