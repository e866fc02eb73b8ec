//! Deterministic classification of step failures.
//!
//! A failure is non-retryable when its message matches one of a fixed set of
//! environmental patterns that regenerating the step cannot fix. Everything
//! else is retryable.

use std::sync::LazyLock;

use regex::{Regex, RegexBuilder};

use crate::core::types::ErrorClass;

/// Named patterns for environmental failures, matched case-insensitively.
const NON_RETRYABLE: &[(&str, &str)] = &[
    ("already_exists", r"\beexist\b|already exists|file exists"),
    (
        "permission_denied",
        r"\beacces\b|\beperm\b|permission denied|operation not permitted|access is denied",
    ),
    ("path_too_long", r"\benametoolong\b|name too long|path too long"),
    ("no_space", r"\benospc\b|no space left|disk full"),
    ("not_empty", r"\benotempty\b|directory not empty"),
    ("read_only", r"\berofs\b|read-only file system"),
];

static PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    NON_RETRYABLE
        .iter()
        .map(|(name, pattern)| {
            let re = RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .expect("non-retryable pattern should compile");
            (*name, re)
        })
        .collect()
});

/// Classify a failure message.
pub fn classify(message: &str) -> ErrorClass {
    if matched_pattern(message).is_some() {
        ErrorClass::NonRetryable
    } else {
        ErrorClass::Retryable
    }
}

/// Name of the first non-retryable pattern matching `message`, if any.
pub fn matched_pattern(message: &str) -> Option<&'static str> {
    PATTERNS
        .iter()
        .find(|(_, re)| re.is_match(message))
        .map(|(name, _)| *name)
}
