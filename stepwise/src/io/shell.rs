//! Blocking shell execution with a timeout and bounded output.
//!
//! This is the path for ordinary `run_command` steps. Long-running commands go
//! through [`crate::io::detached`] instead.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn stdout_truncated_notice(&self, label: &str) -> String {
        if self.stdout_truncated > 0 {
            format!(
                "\n[{label} stdout truncated {} bytes]\n",
                self.stdout_truncated
            )
        } else {
            String::new()
        }
    }

    pub fn stderr_truncated_notice(&self, label: &str) -> String {
        if self.stderr_truncated > 0 {
            format!(
                "\n[{label} stderr truncated {} bytes]\n",
                self.stderr_truncated
            )
        } else {
            String::new()
        }
    }

    /// Stdout then stderr, lossily decoded, with truncation notices.
    pub fn combined(&self) -> String {
        let mut buf = String::from_utf8_lossy(&self.stdout).into_owned();
        buf.push_str(&self.stdout_truncated_notice("command"));
        let stderr = String::from_utf8_lossy(&self.stderr);
        if !stderr.trim().is_empty() {
            if !buf.is_empty() && !buf.ends_with('\n') {
                buf.push('\n');
            }
            buf.push_str(&stderr);
        }
        buf.push_str(&self.stderr_truncated_notice("command"));
        buf
    }
}

/// A shell command to run to completion.
#[derive(Debug, Clone)]
pub struct ShellRequest {
    pub command: String,
    pub workdir: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// Result of a finished shell command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellResult {
    /// Exit code, `None` if killed by a signal or timed out.
    pub code: Option<i32>,
    pub output: String,
    pub timed_out: bool,
}

impl ShellResult {
    pub fn success(&self) -> bool {
        !self.timed_out && self.code == Some(0)
    }

    /// Failure text in the shape later classified and fed to the fixer.
    pub fn failure_message(&self, command: &str) -> String {
        let output = self.output.trim();
        let head = if self.timed_out {
            format!("command timed out: {command}")
        } else {
            match self.code {
                Some(code) => format!("command failed with exit code {code}: {command}"),
                None => format!("command terminated by signal: {command}"),
            }
        };
        if output.is_empty() {
            head
        } else {
            format!("{head}\n{output}")
        }
    }
}

/// Abstraction over blocking command execution.
pub trait ShellRunner {
    fn run(&self, request: &ShellRequest) -> Result<ShellResult>;
}

/// Runs commands through the platform shell (`sh -c` / `cmd /C`).
pub struct SystemShell;

impl ShellRunner for SystemShell {
    #[instrument(skip_all, fields(command = %request.command))]
    fn run(&self, request: &ShellRequest) -> Result<ShellResult> {
        let mut cmd = shell_command(&request.command);
        cmd.current_dir(&request.workdir);
        let output = run_command_with_timeout(cmd, request.timeout, request.output_limit_bytes)
            .with_context(|| {
                format!("run {:?} in {}", request.command, request.workdir.display())
            })?;
        Ok(ShellResult {
            code: output.status.code(),
            output: output.combined(),
            timed_out: output.timed_out,
        })
    }
}

/// Build a `Command` that runs `command` through the platform shell.
pub fn shell_command(command: &str) -> Command {
    if cfg!(windows) {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    } else {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    }
}

/// True if `program` resolves to an executable on `PATH`.
pub fn program_on_path(program: &str) -> bool {
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths).any(|dir| is_executable(&dir.join(program)))
}

fn is_executable(path: &Path) -> bool {
    if cfg!(windows) {
        path.is_file() || path.with_extension("exe").is_file()
    } else {
        path.is_file()
    }
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn request(command: &str, workdir: &Path) -> ShellRequest {
        ShellRequest {
            command: command.to_string(),
            workdir: workdir.to_path_buf(),
            timeout: Duration::from_secs(10),
            output_limit_bytes: 1_000,
        }
    }

    #[test]
    fn captures_exit_code_and_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let result = SystemShell
            .run(&request("echo hello; echo oops >&2; exit 3", temp.path()))
            .expect("run");
        assert_eq!(result.code, Some(3));
        assert!(!result.success());
        assert!(result.output.contains("hello"));
        assert!(result.output.contains("oops"));
        assert!(
            result
                .failure_message("x")
                .starts_with("command failed with exit code 3: x")
        );
    }

    #[test]
    fn runs_in_workdir() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(temp.path().join("marker.txt"), "here").expect("write");
        let result = SystemShell
            .run(&request("cat marker.txt", temp.path()))
            .expect("run");
        assert!(result.success());
        assert_eq!(result.output.trim(), "here");
    }

    #[test]
    fn times_out_long_commands() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut req = request("sleep 3", temp.path());
        req.timeout = Duration::from_millis(200);
        let result = SystemShell.run(&req).expect("run");
        assert!(result.timed_out);
        assert!(result.failure_message("sleep 3").contains("timed out"));
    }

    #[test]
    fn truncates_large_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut cmd = shell_command("head -c 5000 /dev/zero");
        cmd.current_dir(temp.path());
        let output = run_command_with_timeout(cmd, Duration::from_secs(10), 100).expect("run");
        assert_eq!(output.stdout.len(), 100);
        assert_eq!(output.stdout_truncated, 4_900);
    }

    #[test]
    fn finds_sh_on_path() {
        assert!(program_on_path("sh"));
        assert!(!program_on_path("definitely-not-a-real-program-xyz"));
    }
}
