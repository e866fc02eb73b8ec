//! Plan execution with classification, self-healing retries and operator
//! checkpoints.
//!
//! Each step runs through a small state machine:
//!
//! ```text
//! Pending -> InProgress -> Succeeded
//!                       -> Cancelled            (command declined)
//!                       -> NonRetryableFailure  (environment error, no heal)
//!                       -> RetryExhausted       (budget spent or heal gave nothing)
//! ```
//!
//! Failures never abort the plan on their own. After a step ends in a failure
//! state the operator decides whether the remaining steps still run.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use regex::Regex;
use tracing::{info, info_span, instrument, warn};

use crate::core::classifier::classify;
use crate::core::retry::{RetryDecision, RetryState, decide};
use crate::core::types::{
    ErrorClass, ExecutionRecord, PlanSummary, StepKind, StepOutcome, StepSpec, StepStatus,
};
use crate::core::validator::to_plan_step;
use crate::heal::{HealRequest, SelfHealer};
use crate::io::config::AgentConfig;
use crate::io::confirm::Confirmer;
use crate::io::detached::{DetachedProcessManager, LaunchResult, ProcessHandle};
use crate::io::files::FileOperations;
use crate::io::fixer::{ConversationMessage, Fixer};
use crate::io::registry::ProcessRegistry;
use crate::io::shell::{ShellRequest, ShellRunner};

/// Execution knobs resolved from config and CLI flags.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub workdir: PathBuf,
    pub max_retries: u32,
    pub auto_retry: bool,
    pub command_timeout: Duration,
    pub output_limit_bytes: usize,
    /// Commands matching any of these launch detached.
    pub detach_patterns: Vec<Regex>,
}

impl ExecutorSettings {
    pub fn from_config(config: &AgentConfig, workdir: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            workdir: workdir.into(),
            max_retries: config.max_retries,
            auto_retry: config.auto_retry,
            command_timeout: Duration::from_secs(config.command_timeout_secs),
            output_limit_bytes: config.output_limit_bytes,
            detach_patterns: config.detach_regexes()?,
        })
    }

    fn should_detach(&self, command: &str) -> bool {
        let command = command.trim();
        self.detach_patterns.iter().any(|re| re.is_match(command))
    }
}

/// Progress notifications for display.
#[derive(Debug, Clone, Copy)]
pub enum ProgressEvent<'a> {
    StepStarted {
        index: usize,
        total: usize,
        description: &'a str,
    },
    /// Text produced by a step (file contents, listings, command output).
    Output { index: usize, text: &'a str },
    AttemptFailed {
        index: usize,
        attempt: u32,
        class: ErrorClass,
        error: &'a str,
    },
    Healed {
        index: usize,
        attempt: u32,
        explanation: Option<&'a str>,
        step: &'a StepSpec,
    },
    HealFailed { index: usize, reason: &'a str },
    Detached {
        index: usize,
        handle: &'a ProcessHandle,
    },
    StepFinished { record: &'a ExecutionRecord },
}

pub trait ProgressSink {
    fn report(&self, event: ProgressEvent<'_>);
}

/// Discards progress.
pub struct SilentProgress;

impl ProgressSink for SilentProgress {
    fn report(&self, _event: ProgressEvent<'_>) {}
}

/// How a single attempt ended without an error.
enum Attempt {
    Done(String),
    Cancelled,
}

struct Detacher {
    manager: DetachedProcessManager,
    registry: ProcessRegistry,
}

pub struct PlanExecutor<F, S, X, C> {
    files: F,
    shell: S,
    healer: SelfHealer<X>,
    confirmer: C,
    settings: ExecutorSettings,
    detacher: Option<Detacher>,
    progress: Box<dyn ProgressSink>,
}

impl<F, S, X, C> PlanExecutor<F, S, X, C>
where
    F: FileOperations,
    S: ShellRunner,
    X: Fixer,
    C: Confirmer,
{
    pub fn new(
        files: F,
        shell: S,
        healer: SelfHealer<X>,
        confirmer: C,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            files,
            shell,
            healer,
            confirmer,
            settings,
            detacher: None,
            progress: Box::new(SilentProgress),
        }
    }

    /// Launch long-running commands through `manager` and track them in `registry`.
    pub fn with_detached(
        mut self,
        manager: DetachedProcessManager,
        registry: ProcessRegistry,
    ) -> Self {
        self.detacher = Some(Detacher { manager, registry });
        self
    }

    pub fn with_progress(mut self, progress: Box<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn healer(&self) -> &SelfHealer<X> {
        &self.healer
    }

    /// Run every step in order and summarize.
    ///
    /// A missing or empty plan is a no-op. This never fails: step errors are
    /// classified and recorded, and the summary always comes back.
    #[instrument(skip_all, fields(steps = plan.map_or(0, <[StepSpec]>::len)))]
    pub fn execute_plan(&self, plan: Option<&[StepSpec]>) -> PlanSummary {
        let steps = plan.unwrap_or_default();
        let total = steps.len();
        let mut summary = PlanSummary {
            total,
            ..PlanSummary::default()
        };

        for (offset, spec) in steps.iter().enumerate() {
            let index = offset + 1;
            let record = self.run_step(index, total, spec, &summary.log);
            let outcome = record.outcome;
            if outcome.counts_as_completed() {
                summary.completed += 1;
            }
            summary.log.push(record.log_line());
            self.progress
                .report(ProgressEvent::StepFinished { record: &record });
            let reason = record.description.clone();
            summary.records.push(record);

            if !outcome.counts_as_completed()
                && index < total
                && !self.keep_going(index, &reason)
            {
                info!(index, "operator stopped the plan");
                summary.stopped_early = true;
                break;
            }
        }

        summary.pending = total - summary.completed - summary.failed();
        info!(
            completed = summary.completed,
            total = summary.total,
            pending = summary.pending,
            "plan finished"
        );
        summary
    }

    fn keep_going(&self, index: usize, reason: &str) -> bool {
        match self.confirmer.continue_after_failure(index, reason) {
            Ok(answer) => answer,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "could not ask whether to continue, stopping");
                false
            }
        }
    }

    fn run_step(
        &self,
        index: usize,
        total: usize,
        spec: &StepSpec,
        log: &[String],
    ) -> ExecutionRecord {
        let span = info_span!("step", index, action = %spec.action);
        let _enter = span.enter();

        let mut current = spec.clone();
        let mut state = RetryState::default();
        let mut history: Vec<ConversationMessage> = Vec::new();
        let description = current.describe();
        self.progress.report(ProgressEvent::StepStarted {
            index,
            total,
            description: &description,
        });

        loop {
            let error = match self.attempt(index, &current) {
                Ok(Attempt::Done(message)) => {
                    state.succeeded = true;
                    return record(index, StepOutcome::Succeeded, state, message);
                }
                Ok(Attempt::Cancelled) => {
                    info!("command declined");
                    return record(
                        index,
                        StepOutcome::Cancelled,
                        state,
                        format!("Skipped {}", current.describe()),
                    );
                }
                Err(error) => error,
            };

            let class = classify(&error);
            warn!(
                attempt = state.attempt,
                ?class,
                error = %first_line(&error),
                "step attempt failed"
            );
            self.progress.report(ProgressEvent::AttemptFailed {
                index,
                attempt: state.attempt,
                class,
                error: &error,
            });

            match decide(
                class,
                state,
                self.settings.max_retries,
                self.settings.auto_retry,
            ) {
                RetryDecision::GiveUp(outcome) => {
                    return record(index, outcome, state, first_line(&error).to_string());
                }
                RetryDecision::Heal => {}
            }

            state.attempt += 1;
            let completed: Vec<String> = log
                .iter()
                .filter(|line| line.starts_with('✓'))
                .cloned()
                .collect();
            let healed = self.healer.heal(&HealRequest {
                step: &current,
                error: &error,
                attempt: state.attempt,
                completed: &completed,
                history: &history,
            });
            match healed {
                Ok(Some(repair)) => {
                    self.progress.report(ProgressEvent::Healed {
                        index,
                        attempt: state.attempt,
                        explanation: repair.explanation.as_deref(),
                        step: &repair.step,
                    });
                    info!(
                        explanation = repair.explanation.as_deref().unwrap_or(""),
                        "retrying with repaired step"
                    );
                    history.extend(repair.exchange(&error));
                    current = repair.step;
                }
                Ok(None) => {
                    self.progress.report(ProgressEvent::HealFailed {
                        index,
                        reason: "fixer returned no usable step",
                    });
                    return record(
                        index,
                        StepOutcome::RetryExhausted,
                        state,
                        first_line(&error).to_string(),
                    );
                }
                Err(err) => {
                    let reason = format!("{err:#}");
                    warn!(err = %reason, "self-heal failed");
                    self.progress.report(ProgressEvent::HealFailed {
                        index,
                        reason: &reason,
                    });
                    return record(
                        index,
                        StepOutcome::RetryExhausted,
                        state,
                        first_line(&error).to_string(),
                    );
                }
            }
        }
    }

    /// One dispatch of the current step. Any error comes back as failure text.
    fn attempt(&self, index: usize, spec: &StepSpec) -> Result<Attempt, String> {
        let step = to_plan_step(spec).map_err(|err| err.to_string())?;
        match &step.kind {
            StepKind::RunCommand { command } => self.run_command(index, command),
            _ => {
                let result = self.files.apply(&step).map_err(|err| format!("{err:#}"))?;
                if let Some(output) = result.output.as_deref() {
                    self.progress
                        .report(ProgressEvent::Output { index, text: output });
                }
                Ok(Attempt::Done(result.message))
            }
        }
    }

    fn run_command(&self, index: usize, command: &str) -> Result<Attempt, String> {
        match self.confirmer.approve_command(command) {
            Ok(true) => {}
            Ok(false) => return Ok(Attempt::Cancelled),
            Err(err) => {
                warn!(err = %format!("{err:#}"), "could not ask for permission, skipping command");
                return Ok(Attempt::Cancelled);
            }
        }

        if let Some(detacher) = &self.detacher
            && self.settings.should_detach(command)
        {
            return match detacher.manager.launch(command, &self.settings.workdir) {
                LaunchResult::Launched(handle) => {
                    self.progress.report(ProgressEvent::Detached {
                        index,
                        handle: &handle,
                    });
                    let message = format!(
                        "Started {command} in the background (pid {})",
                        handle.pid
                    );
                    detacher.registry.register(handle);
                    Ok(Attempt::Done(message))
                }
                LaunchResult::Failed { error } => Err(error),
            };
        }

        let result = self
            .shell
            .run(&ShellRequest {
                command: command.to_string(),
                workdir: self.settings.workdir.clone(),
                timeout: self.settings.command_timeout,
                output_limit_bytes: self.settings.output_limit_bytes,
            })
            .map_err(|err| format!("{err:#}"))?;
        if !result.output.trim().is_empty() {
            self.progress.report(ProgressEvent::Output {
                index,
                text: &result.output,
            });
        }
        if result.success() {
            Ok(Attempt::Done(format!("Ran {command}")))
        } else {
            Err(result.failure_message(command))
        }
    }
}

fn record(
    index: usize,
    outcome: StepOutcome,
    state: RetryState,
    description: String,
) -> ExecutionRecord {
    let status = outcome.status();
    if status == StepStatus::Failed {
        warn!(?outcome, retries = state.attempt, "step failed");
    } else {
        info!(?outcome, retries = state.attempt, "step finished");
    }
    ExecutionRecord {
        index,
        status,
        outcome,
        retries: state.attempt,
        description,
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default().trim()
}
