//! Plan data model shared by the executor, healer and validator.
//!
//! Two shapes exist for a step. [`StepSpec`] is the loose wire form produced by
//! the planner/fixer: every field optional, the action kept as a raw string.
//! [`PlanStep`] is the checked form, one variant per action carrying only the
//! fields that action uses. The only way from the former to the latter is
//! [`crate::core::validator::to_plan_step`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// The enumerated step actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    CreateFile,
    UpdateFile,
    PatchFile,
    DeleteFile,
    ReadFile,
    CreateDir,
    DeleteDir,
    ListDir,
    RenameDir,
    RunCommand,
}

impl Action {
    pub const ALL: [Action; 10] = [
        Action::CreateFile,
        Action::UpdateFile,
        Action::PatchFile,
        Action::DeleteFile,
        Action::ReadFile,
        Action::CreateDir,
        Action::DeleteDir,
        Action::ListDir,
        Action::RenameDir,
        Action::RunCommand,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Action::CreateFile => "create_file",
            Action::UpdateFile => "update_file",
            Action::PatchFile => "patch_file",
            Action::DeleteFile => "delete_file",
            Action::ReadFile => "read_file",
            Action::CreateDir => "create_dir",
            Action::DeleteDir => "delete_dir",
            Action::ListDir => "list_dir",
            Action::RenameDir => "rename_dir",
            Action::RunCommand => "run_command",
        }
    }

    pub fn parse(raw: &str) -> Option<Action> {
        Action::ALL
            .into_iter()
            .find(|action| action.as_str() == raw.trim())
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A step as it appears on the wire.
///
/// `action` stays a string so that an unknown action reaches the validator
/// (and fails there) instead of failing the whole plan parse. A repair may
/// omit it entirely and inherit the action of the step it fixes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSpec {
    #[serde(default)]
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, alias = "new_path", skip_serializing_if = "Option::is_none")]
    pub new_path: Option<String>,
    #[serde(default, alias = "old_path", skip_serializing_if = "Option::is_none")]
    pub old_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, alias = "old_content", skip_serializing_if = "Option::is_none")]
    pub old_content: Option<String>,
    #[serde(default, alias = "new_content", skip_serializing_if = "Option::is_none")]
    pub new_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl StepSpec {
    pub fn new(action: Action) -> Self {
        Self {
            action: action.as_str().to_string(),
            ..Self::default()
        }
    }

    pub fn action(&self) -> Option<Action> {
        Action::parse(&self.action)
    }

    /// Build a new step from `self` overlaid with every field `fix` provides.
    ///
    /// The action is always kept from `self`; a repair may change how a step
    /// does its work, never what kind of step it is.
    pub fn merged_with(&self, fix: &StepSpec) -> StepSpec {
        fn pick(fix: &Option<String>, original: &Option<String>) -> Option<String> {
            fix.clone().or_else(|| original.clone())
        }
        StepSpec {
            action: self.action.clone(),
            path: pick(&fix.path, &self.path),
            new_path: pick(&fix.new_path, &self.new_path),
            old_path: pick(&fix.old_path, &self.old_path),
            content: pick(&fix.content, &self.content),
            old_content: pick(&fix.old_content, &self.old_content),
            new_content: pick(&fix.new_content, &self.new_content),
            command: pick(&fix.command, &self.command),
            summary: pick(&fix.summary, &self.summary),
        }
    }

    /// Human-readable label: the summary if present, otherwise action + target.
    pub fn describe(&self) -> String {
        if let Some(summary) = self.summary.as_deref().map(str::trim)
            && !summary.is_empty()
        {
            return summary.to_string();
        }
        let target = self
            .command
            .as_deref()
            .or(self.path.as_deref())
            .or(self.old_path.as_deref())
            .unwrap_or("");
        if target.is_empty() {
            self.action.clone()
        } else {
            format!("{} {}", self.action, target)
        }
    }
}

/// The planner/fixer response shape: `{explanation?, plan}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(default)]
    pub plan: Vec<StepSpec>,
}

/// A validated step: one variant per action, each with only its own fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepKind {
    CreateFile { path: String, content: String },
    UpdateFile { path: String, content: String },
    PatchFile {
        path: String,
        old_content: String,
        new_content: String,
    },
    DeleteFile { path: String },
    ReadFile { path: String },
    CreateDir { path: String },
    DeleteDir { path: String },
    ListDir { path: String },
    RenameDir { from: String, to: String },
    RunCommand { command: String },
}

impl StepKind {
    pub fn action(&self) -> Action {
        match self {
            StepKind::CreateFile { .. } => Action::CreateFile,
            StepKind::UpdateFile { .. } => Action::UpdateFile,
            StepKind::PatchFile { .. } => Action::PatchFile,
            StepKind::DeleteFile { .. } => Action::DeleteFile,
            StepKind::ReadFile { .. } => Action::ReadFile,
            StepKind::CreateDir { .. } => Action::CreateDir,
            StepKind::DeleteDir { .. } => Action::DeleteDir,
            StepKind::ListDir { .. } => Action::ListDir,
            StepKind::RenameDir { .. } => Action::RenameDir,
            StepKind::RunCommand { .. } => Action::RunCommand,
        }
    }
}

/// A validated step plus its display label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanStep {
    pub kind: StepKind,
    pub summary: Option<String>,
}

/// Classification of a failure message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Retryable,
    NonRetryable,
}

/// Terminal state of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded,
    /// The operator declined to run the command. Counts as completed.
    Cancelled,
    NonRetryableFailure,
    RetryExhausted,
}

impl StepOutcome {
    pub fn counts_as_completed(self) -> bool {
        matches!(self, StepOutcome::Succeeded | StepOutcome::Cancelled)
    }

    pub fn status(self) -> StepStatus {
        match self {
            StepOutcome::Succeeded => StepStatus::Completed,
            StepOutcome::Cancelled => StepStatus::Skipped,
            StepOutcome::NonRetryableFailure | StepOutcome::RetryExhausted => StepStatus::Failed,
        }
    }
}

/// Coarse per-step status recorded in the execution log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Completed,
    Skipped,
    Failed,
}

/// Outcome of one step, appended to the execution log once terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionRecord {
    /// 1-based step index.
    pub index: usize,
    pub status: StepStatus,
    pub outcome: StepOutcome,
    /// Retries consumed (0 when the first attempt settled the step).
    pub retries: u32,
    /// Success description or failure reason.
    pub description: String,
}

impl ExecutionRecord {
    /// Render as a single log line (`✓ Step k: ...` / `✗ Step k Failed: ...`).
    pub fn log_line(&self) -> String {
        match self.status {
            StepStatus::Failed => format!("✗ Step {} Failed: {}", self.index, self.description),
            StepStatus::Completed | StepStatus::Skipped => {
                format!("✓ Step {}: {}", self.index, self.description)
            }
        }
    }
}

/// Aggregate result of executing a plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    pub completed: usize,
    pub total: usize,
    pub pending: usize,
    /// True when the operator chose to stop after a failure.
    pub stopped_early: bool,
    pub records: Vec<ExecutionRecord>,
    pub log: Vec<String>,
}

impl PlanSummary {
    pub fn failed(&self) -> usize {
        self.records
            .iter()
            .filter(|record| record.status == StepStatus::Failed)
            .count()
    }

    pub fn is_success(&self) -> bool {
        self.completed == self.total
    }
}
