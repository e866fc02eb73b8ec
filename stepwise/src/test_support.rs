//! Scripted collaborators for executor and healer tests.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::core::types::{PlanResponse, StepSpec};
use crate::executor::{ProgressEvent, ProgressSink};
use crate::io::confirm::Confirmer;
use crate::io::fixer::{ChatRequest, Fixer, FixerReply};
use crate::io::shell::{ShellRequest, ShellResult, ShellRunner};

/// Scratch working directory pre-populated with `(relative path, contents)` files.
pub fn temp_workspace(files: &[(&str, &str)]) -> Result<TempDir> {
    let dir = tempfile::tempdir().context("create temp workspace")?;
    for (relative, contents) in files {
        let path = dir.path().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
    }
    Ok(dir)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Fixer that replays canned replies and records every prompt.
///
/// Replies are consumed in order; the last one repeats once the queue is empty.
#[derive(Debug, Clone, Default)]
pub struct ScriptedFixer {
    replies: Arc<Mutex<VecDeque<Result<FixerReply, String>>>>,
    requests: Arc<Mutex<Vec<ChatRequest>>>,
}

impl ScriptedFixer {
    pub fn new(replies: Vec<Result<FixerReply, String>>) -> Self {
        Self {
            replies: Arc::new(Mutex::new(replies.into())),
            requests: Arc::default(),
        }
    }

    pub fn structured(explanation: Option<&str>, plan: Vec<StepSpec>) -> Self {
        Self::new(vec![Ok(FixerReply::Structured(PlanResponse {
            explanation: explanation.map(str::to_string),
            plan,
        }))])
    }

    pub fn text(text: &str) -> Self {
        Self::new(vec![Ok(FixerReply::Text(text.to_string()))])
    }

    pub fn failing(message: &str) -> Self {
        Self::new(vec![Err(message.to_string())])
    }

    pub fn prompts(&self) -> Vec<String> {
        lock(&self.requests)
            .iter()
            .map(|request| request.prompt.clone())
            .collect()
    }

    /// Every request received, history included.
    pub fn requests(&self) -> Vec<ChatRequest> {
        lock(&self.requests).clone()
    }

    pub fn calls(&self) -> usize {
        lock(&self.requests).len()
    }
}

impl Fixer for ScriptedFixer {
    fn chat(&self, request: &ChatRequest) -> Result<FixerReply> {
        lock(&self.requests).push(request.clone());
        let mut replies = lock(&self.replies);
        let reply = if replies.len() > 1 {
            replies.pop_front()
        } else {
            replies.front().cloned()
        };
        match reply {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("no scripted fixer reply")),
        }
    }
}

/// Shell that answers from a script and records commands in order.
///
/// Unscripted commands succeed with no output.
#[derive(Debug, Clone, Default)]
pub struct ScriptedShell {
    results: Arc<Mutex<HashMap<String, Result<ShellResult, String>>>>,
    commands: Arc<Mutex<Vec<String>>>,
}

impl ScriptedShell {
    /// `command` exits with `code` and prints `output`, every time.
    pub fn fail(self, command: &str, code: i32, output: &str) -> Self {
        lock(&self.results).insert(
            command.to_string(),
            Ok(ShellResult {
                code: Some(code),
                output: output.to_string(),
                timed_out: false,
            }),
        );
        self
    }

    /// `command` succeeds and prints `output`.
    pub fn succeed(self, command: &str, output: &str) -> Self {
        lock(&self.results).insert(
            command.to_string(),
            Ok(ShellResult {
                code: Some(0),
                output: output.to_string(),
                timed_out: false,
            }),
        );
        self
    }

    /// Running `command` fails before it starts.
    pub fn error(self, command: &str, message: &str) -> Self {
        lock(&self.results).insert(command.to_string(), Err(message.to_string()));
        self
    }

    pub fn commands(&self) -> Vec<String> {
        lock(&self.commands).clone()
    }
}

impl ShellRunner for ScriptedShell {
    fn run(&self, request: &ShellRequest) -> Result<ShellResult> {
        lock(&self.commands).push(request.command.clone());
        match lock(&self.results).get(&request.command) {
            Some(Ok(result)) => Ok(result.clone()),
            Some(Err(message)) => Err(anyhow!(message.clone())),
            None => Ok(ShellResult {
                code: Some(0),
                output: String::new(),
                timed_out: false,
            }),
        }
    }
}

/// Confirmer with fixed answers that remembers what it was asked.
#[derive(Debug, Clone, Default)]
pub struct RecordingConfirmer {
    approve_commands: bool,
    continue_on_failure: bool,
    commands: Arc<Mutex<Vec<String>>>,
    failure_prompts: Arc<Mutex<Vec<usize>>>,
}

impl RecordingConfirmer {
    /// Approves commands and continues after failures.
    pub fn approving() -> Self {
        Self {
            approve_commands: true,
            continue_on_failure: true,
            ..Self::default()
        }
    }

    pub fn declining_commands() -> Self {
        Self {
            approve_commands: false,
            continue_on_failure: true,
            ..Self::default()
        }
    }

    pub fn stopping_after_failure(mut self) -> Self {
        self.continue_on_failure = false;
        self
    }

    pub fn commands(&self) -> Vec<String> {
        lock(&self.commands).clone()
    }

    /// Step indices the executor asked about after a failure.
    pub fn failure_prompts(&self) -> Vec<usize> {
        lock(&self.failure_prompts).clone()
    }
}

impl Confirmer for RecordingConfirmer {
    fn approve_command(&self, command: &str) -> Result<bool> {
        lock(&self.commands).push(command.to_string());
        Ok(self.approve_commands)
    }

    fn continue_after_failure(&self, step: usize, _reason: &str) -> Result<bool> {
        lock(&self.failure_prompts).push(step);
        Ok(self.continue_on_failure)
    }
}

/// Progress sink that flattens events into short strings.
#[derive(Debug, Clone, Default)]
pub struct RecordingProgress {
    events: Arc<Mutex<Vec<String>>>,
}

impl RecordingProgress {
    pub fn events(&self) -> Vec<String> {
        lock(&self.events).clone()
    }
}

impl ProgressSink for RecordingProgress {
    fn report(&self, event: ProgressEvent<'_>) {
        let line = match event {
            ProgressEvent::StepStarted { index, .. } => format!("start {index}"),
            ProgressEvent::Output { index, .. } => format!("output {index}"),
            ProgressEvent::AttemptFailed {
                index,
                attempt,
                class,
                ..
            } => format!("failed {index} attempt {attempt} {class:?}"),
            ProgressEvent::Healed {
                index, explanation, ..
            } => format!("healed {index}: {}", explanation.unwrap_or("")),
            ProgressEvent::HealFailed { index, .. } => format!("heal failed {index}"),
            ProgressEvent::Detached { index, handle } => {
                format!("detached {index} pid {}", handle.pid)
            }
            ProgressEvent::StepFinished { record } => format!("finished {}", record.log_line()),
        };
        lock(&self.events).push(line);
    }
}
