//! Self-healing: ask the fixer for a corrected version of a failed step.

use std::path::PathBuf;

use anyhow::Result;
use tracing::{debug, info, instrument, warn};

use crate::core::extract::extract_plan;
use crate::core::types::{PlanResponse, StepSpec};
use crate::core::validator::to_plan_step;
use crate::io::config::AgentConfig;
use crate::io::fixer::{ChatRequest, ConversationMessage, Fixer, FixerReply, Role};
use crate::io::prompt::{HealPromptInputs, PromptBuilder};
use crate::io::workspace::sample_files;

/// Everything known about a failed attempt.
#[derive(Debug, Clone, Copy)]
pub struct HealRequest<'a> {
    pub step: &'a StepSpec,
    pub error: &'a str,
    /// 1-based retry number this repair is for.
    pub attempt: u32,
    /// Log lines of steps already completed in this run.
    pub completed: &'a [String],
    /// Earlier repair exchanges for this same step, oldest first.
    pub history: &'a [ConversationMessage],
}

/// A validated replacement step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repair {
    pub step: StepSpec,
    pub explanation: Option<String>,
}

impl Repair {
    /// The failure and this repair as a user/assistant pair, for the next
    /// request about the same step.
    pub fn exchange(&self, error: &str) -> [ConversationMessage; 2] {
        let reply = PlanResponse {
            explanation: self.explanation.clone(),
            plan: vec![self.step.clone()],
        };
        let content = serde_json::to_string(&reply).unwrap_or_else(|_| self.step.describe());
        [
            ConversationMessage {
                role: Role::User,
                content: format!("The step failed with:\n{error}"),
            },
            ConversationMessage {
                role: Role::Assistant,
                content,
            },
        ]
    }
}

pub struct SelfHealer<X> {
    fixer: X,
    prompt: PromptBuilder,
    workdir: PathBuf,
    max_known_files: usize,
}

impl<X: Fixer> SelfHealer<X> {
    pub fn new(fixer: X, workdir: impl Into<PathBuf>, config: &AgentConfig) -> Self {
        Self {
            fixer,
            prompt: PromptBuilder::new(config.fixer.max_prompt_bytes),
            workdir: workdir.into(),
            max_known_files: config.heal.max_known_files,
        }
    }

    pub fn fixer(&self) -> &X {
        &self.fixer
    }

    /// Request a corrected step.
    ///
    /// `Ok(None)` means the fixer answered but gave nothing usable: no plan, a
    /// step with a different action, or a merged step that fails validation.
    /// Transport and service errors are returned as `Err`.
    #[instrument(skip_all, fields(action = %request.step.action, attempt = request.attempt))]
    pub fn heal(&self, request: &HealRequest<'_>) -> Result<Option<Repair>> {
        let files = sample_files(&self.workdir, self.max_known_files);
        let prompt = self.prompt.build_heal(&HealPromptInputs {
            step: request.step,
            error: request.error,
            attempt: request.attempt,
            completed: request.completed,
            workdir: &self.workdir,
            files: &files,
        })?;
        debug!(
            prompt_bytes = prompt.len(),
            history = request.history.len(),
            "requesting repair"
        );

        let chat = ChatRequest::new(prompt).with_history(request.history);
        let response = match self.fixer.chat(&chat)? {
            FixerReply::Structured(response) => response,
            FixerReply::Text(text) => match extract_plan(&text) {
                Some(response) => response,
                None => {
                    warn!("fixer reply contained no plan");
                    return Ok(None);
                }
            },
        };
        Ok(repair_from(request.step, response))
    }
}

fn repair_from(failed: &StepSpec, response: PlanResponse) -> Option<Repair> {
    let PlanResponse { explanation, plan } = response;
    let Some(fix) = plan.into_iter().next() else {
        warn!("fixer returned an empty plan");
        return None;
    };
    let fix_action = fix.action.trim();
    if !fix_action.is_empty() && fix_action != failed.action.trim() {
        warn!(
            from = %failed.action,
            to = fix_action,
            "fixer changed the step action, rejecting"
        );
        return None;
    }
    let step = failed.merged_with(&fix);
    if let Err(err) = to_plan_step(&step) {
        warn!(err = %err, "repaired step is invalid");
        return None;
    }
    info!("fixer proposed a repair");
    Some(Repair {
        step,
        explanation: explanation.filter(|text| !text.trim().is_empty()),
    })
}
