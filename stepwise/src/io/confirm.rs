//! Operator decisions the executor defers to: command permission and
//! whether to keep going after a failed step.

use std::io::{BufRead, Write};

use anyhow::{Context, Result};

/// Abstraction over operator confirmation.
pub trait Confirmer {
    /// May `command` run? Declining cancels the step.
    fn approve_command(&self, command: &str) -> Result<bool>;

    /// A step failed for good; continue with the remaining steps?
    fn continue_after_failure(&self, step: usize, reason: &str) -> Result<bool>;
}

impl<T: Confirmer + ?Sized> Confirmer for Box<T> {
    fn approve_command(&self, command: &str) -> Result<bool> {
        (**self).approve_command(command)
    }

    fn continue_after_failure(&self, step: usize, reason: &str) -> Result<bool> {
        (**self).continue_after_failure(step, reason)
    }
}

/// Answers every question the same way without asking.
#[derive(Debug, Clone, Copy)]
pub struct AutoConfirm {
    pub approve_commands: bool,
    pub continue_on_failure: bool,
}

impl AutoConfirm {
    /// Approve everything and never stop.
    pub fn yes() -> Self {
        Self {
            approve_commands: true,
            continue_on_failure: true,
        }
    }
}

impl Confirmer for AutoConfirm {
    fn approve_command(&self, _command: &str) -> Result<bool> {
        Ok(self.approve_commands)
    }

    fn continue_after_failure(&self, _step: usize, _reason: &str) -> Result<bool> {
        Ok(self.continue_on_failure)
    }
}

/// Asks on stderr and reads `y`/`n` from stdin. Anything but yes is no.
pub struct TerminalConfirm;

impl TerminalConfirm {
    fn ask(question: &str) -> Result<bool> {
        let mut stderr = std::io::stderr();
        write!(stderr, "{question} [y/N] ").context("write prompt")?;
        stderr.flush().context("flush prompt")?;
        let mut answer = String::new();
        std::io::stdin()
            .lock()
            .read_line(&mut answer)
            .context("read answer")?;
        Ok(is_yes(&answer))
    }
}

impl Confirmer for TerminalConfirm {
    fn approve_command(&self, command: &str) -> Result<bool> {
        Self::ask(&format!("Run command `{command}`?"))
    }

    fn continue_after_failure(&self, step: usize, reason: &str) -> Result<bool> {
        Self::ask(&format!(
            "Step {step} failed: {reason}\nContinue with remaining steps?"
        ))
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
