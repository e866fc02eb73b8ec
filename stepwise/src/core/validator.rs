//! Required-field checks for wire steps.
//!
//! Each action has a minimal field set. A step that parses as JSON but lacks
//! those fields must never reach an operation handler.

use std::fmt;

use crate::core::types::{Action, PlanStep, StepKind, StepSpec};

/// Why a wire step cannot become a [`PlanStep`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub action: String,
    pub reason: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {} step: {}", self.action, self.reason)
    }
}

impl std::error::Error for ValidationError {}

/// True if `spec` carries every field its action requires.
pub fn validate(spec: &StepSpec) -> bool {
    to_plan_step(spec).is_ok()
}

/// Convert a wire step into its typed form, checking required fields.
pub fn to_plan_step(spec: &StepSpec) -> Result<PlanStep, ValidationError> {
    let fail = |reason: &str| ValidationError {
        action: spec.action.clone(),
        reason: reason.to_string(),
    };
    let Some(action) = spec.action() else {
        return Err(fail("unrecognized action"));
    };

    let kind = match action {
        Action::CreateFile | Action::UpdateFile => {
            let path = non_empty(&spec.path).ok_or_else(|| fail("missing path"))?;
            // Empty content is allowed, absent content is not.
            let content = spec.content.clone().ok_or_else(|| fail("missing content"))?;
            if action == Action::CreateFile {
                StepKind::CreateFile { path, content }
            } else {
                StepKind::UpdateFile { path, content }
            }
        }
        Action::PatchFile => StepKind::PatchFile {
            path: non_empty(&spec.path).ok_or_else(|| fail("missing path"))?,
            old_content: non_empty(&spec.old_content)
                .ok_or_else(|| fail("missing or empty oldContent"))?,
            new_content: non_empty(&spec.new_content)
                .ok_or_else(|| fail("missing or empty newContent"))?,
        },
        Action::DeleteFile
        | Action::ReadFile
        | Action::CreateDir
        | Action::DeleteDir
        | Action::ListDir => {
            let path = non_empty(&spec.path).ok_or_else(|| fail("missing path"))?;
            match action {
                Action::DeleteFile => StepKind::DeleteFile { path },
                Action::ReadFile => StepKind::ReadFile { path },
                Action::CreateDir => StepKind::CreateDir { path },
                Action::DeleteDir => StepKind::DeleteDir { path },
                _ => StepKind::ListDir { path },
            }
        }
        Action::RenameDir => {
            let from = non_empty(&spec.old_path)
                .or_else(|| non_empty(&spec.path))
                .ok_or_else(|| fail("missing source (path or oldPath)"))?;
            let to = non_empty(&spec.new_path).ok_or_else(|| fail("missing newPath"))?;
            StepKind::RenameDir { from, to }
        }
        Action::RunCommand => {
            let command = spec
                .command
                .as_deref()
                .map(str::trim)
                .filter(|command| !command.is_empty())
                .ok_or_else(|| fail("missing command"))?;
            StepKind::RunCommand {
                command: command.to_string(),
            }
        }
    };

    Ok(PlanStep {
        kind,
        summary: spec.summary.clone(),
    })
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .filter(|value| !value.trim().is_empty())
        .map(str::to_string)
}
