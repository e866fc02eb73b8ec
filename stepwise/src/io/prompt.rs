//! Repair prompt builder for self-healing requests.

use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use tracing::debug;

use crate::core::types::StepSpec;

const HEAL_TEMPLATE: &str = include_str!("prompts/heal.md");

/// Error text beyond this many bytes is cut before rendering.
const MAX_ERROR_BYTES: usize = 4_000;

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
        .expect("section marker regex should compile")
});

/// Everything a repair prompt mentions.
#[derive(Debug, Clone)]
pub struct HealPromptInputs<'a> {
    pub step: &'a StepSpec,
    pub error: &'a str,
    /// 1-based number of the retry being requested.
    pub attempt: u32,
    /// Execution log lines of steps already completed in this run.
    pub completed: &'a [String],
    pub workdir: &'a Path,
    /// Sample of known workspace file paths.
    pub files: &'a [String],
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    /// Section identifier (e.g., "contract", "files").
    key: String,
    /// Whether this section is required (cannot be dropped).
    required: bool,
    /// Full section content including header.
    content: String,
}

/// Builds repair prompts within a byte budget, dropping context sections first.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    pub fn build_heal(&self, input: &HealPromptInputs<'_>) -> Result<String> {
        let rendered = render_heal(input)?;
        let mut sections = parse_sections(&rendered);
        apply_budget_to_sections(&mut sections, self.budget_bytes);
        Ok(render_sections(&sections))
    }
}

fn render_heal(input: &HealPromptInputs<'_>) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("heal", HEAL_TEMPLATE)
        .context("load heal template")?;
    let template = env.get_template("heal").context("get heal template")?;
    let rendered = template
        .render(context! {
            step => input.step,
            error => truncate_str(input.error.trim(), MAX_ERROR_BYTES),
            attempt => input.attempt,
            completed => input.completed,
            workdir => input.workdir.display().to_string(),
            files => input.files,
        })
        .context("render heal template")?;
    Ok(rendered)
}

/// Parse sections from rendered template output using HTML comment markers.
///
/// Markers follow format: `<!-- section:KEY required|droppable -->`
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    let mut sections = Vec::new();
    let matches: Vec<_> = SECTION_RE.captures_iter(rendered).collect();

    for (i, caps) in matches.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = matches
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map(|m| m.start())
            .unwrap_or(rendered.len());

        let content = rendered[whole.end()..end].trim().to_string();
        let required = kind.as_str() == "required";
        if !content.is_empty() || required {
            sections.push(ParsedSection {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }

    sections
}

/// Apply budget to parsed sections, dropping droppable sections as needed.
///
/// Drop order: files -> completed
fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget: usize) {
    let total_len =
        |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    if total_len(sections) <= budget {
        return;
    }

    for key in ["files", "completed"] {
        if total_len(sections) <= budget {
            break;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    // Still over budget: shrink the largest section.
    let total = total_len(sections);
    if total > budget
        && let Some(largest) = sections.iter_mut().max_by_key(|s| s.content.len())
    {
        let before_len = largest.content.len();
        let keep = before_len.saturating_sub(total - budget + 12);
        largest.content = format!("{}\n[truncated]", truncate_str(&largest.content, keep));
        debug!(
            section = largest.key,
            before_len,
            after_len = largest.content.len(),
            "truncated section for budget"
        );
    }
}

/// Render sections back to a single string.
fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Cut `text` to at most `max` bytes on a char boundary.
pub fn truncate_str(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Action;

    fn failed_step() -> StepSpec {
        StepSpec {
            command: Some("npm tset".to_string()),
            summary: Some("Run the tests".to_string()),
            ..StepSpec::new(Action::RunCommand)
        }
    }

    #[test]
    fn prompt_contains_step_error_and_context_in_order() {
        let step = failed_step();
        let completed = vec!["✓ Step 1: Created package.json".to_string()];
        let files = vec!["package.json".to_string(), "src/index.js".to_string()];
        let prompt = PromptBuilder::new(10_000)
            .build_heal(&HealPromptInputs {
                step: &step,
                error: "npm ERR! missing script: tset",
                attempt: 1,
                completed: &completed,
                workdir: Path::new("/work"),
                files: &files,
            })
            .expect("prompt");

        let contract = prompt.find("### Repair Contract").expect("contract");
        let failed = prompt.find("### Failed Step (attempt 1)").expect("failed");
        let error = prompt.find("missing script: tset").expect("error");
        let done = prompt.find("Created package.json").expect("completed");
        let env = prompt.find("working directory: /work").expect("env");
        let known = prompt.find("- src/index.js").expect("files");
        assert!(contract < failed && failed < error && error < done);
        assert!(done < env && env < known);
        assert!(prompt.contains("command: npm tset"));
        assert!(prompt.contains("summary: Run the tests"));
        assert!(!prompt.contains("path:"), "absent fields are omitted");
        assert!(!prompt.contains("<!--"), "markers are stripped");
    }

    #[test]
    fn empty_context_sections_are_omitted() {
        let step = failed_step();
        let prompt = PromptBuilder::new(10_000)
            .build_heal(&HealPromptInputs {
                step: &step,
                error: "boom",
                attempt: 2,
                completed: &[],
                workdir: Path::new("/work"),
                files: &[],
            })
            .expect("prompt");
        assert!(!prompt.contains("### Completed Steps"));
        assert!(!prompt.contains("### Known Files"));
    }

    #[test]
    fn budget_drops_files_before_completed_steps() {
        let step = failed_step();
        let completed = vec!["✓ Step 1: did a thing".to_string()];
        let files: Vec<String> = (0..200).map(|i| format!("src/file_{i}.rs")).collect();
        let prompt = PromptBuilder::new(1_200)
            .build_heal(&HealPromptInputs {
                step: &step,
                error: "boom",
                attempt: 1,
                completed: &completed,
                workdir: Path::new("/work"),
                files: &files,
            })
            .expect("prompt");
        assert!(!prompt.contains("### Known Files"));
        assert!(prompt.contains("### Completed Steps"));
        assert!(prompt.contains("### Repair Contract"));
    }

    #[test]
    fn oversized_required_sections_are_truncated_to_budget() {
        let step = failed_step();
        let error = "é".repeat(3_000);
        let prompt = PromptBuilder::new(1_000)
            .build_heal(&HealPromptInputs {
                step: &step,
                error: &error,
                attempt: 1,
                completed: &[],
                workdir: Path::new("/work"),
                files: &[],
            })
            .expect("prompt");
        assert!(prompt.contains("[truncated]"));
        assert!(prompt.len() <= 1_000 + 8, "len {}", prompt.len());
    }

    #[test]
    fn truncate_str_respects_char_boundaries() {
        assert_eq!(truncate_str("héllo", 2), "h");
        assert_eq!(truncate_str("héllo", 3), "hé");
        assert_eq!(truncate_str("abc", 10), "abc");
    }
}
