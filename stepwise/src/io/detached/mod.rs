//! Long-running commands launched outside the agent's process tree.
//!
//! A detached command runs inside a generated wrapper script that writes its
//! pid to a pid file and tees all output into a log file. The agent never
//! holds a pipe to the process: liveness is probed through the OS and
//! completion is read from the final log line.

pub mod launcher;
pub mod script;

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::budget::sleep_within;
use crate::io::config::ProcessConfig;

use self::launcher::{TerminalLauncher, launcher_for};
use self::script::{ScriptPaths, parse_exit_code};

static LAUNCH_SEQ: AtomicU64 = AtomicU64::new(0);

/// A launched detached process and the files it writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessHandle {
    pub pid: u32,
    pub command: String,
    pub cwd: PathBuf,
    pub output_log: PathBuf,
    pub pid_file: PathBuf,
    pub script: PathBuf,
    pub started_at: DateTime<Local>,
}

impl ProcessHandle {
    /// Rebuild a handle from a pid file written by an earlier launch.
    ///
    /// The sibling `.log` and script files are inferred from the pid file's stem.
    pub fn from_pid_file(pid_file: &Path) -> Result<Self> {
        let pid = read_pid(pid_file)?
            .ok_or_else(|| anyhow!("no pid recorded in {}", pid_file.display()))?;
        let modified = fs::metadata(pid_file)
            .and_then(|meta| meta.modified())
            .map(DateTime::<Local>::from)
            .unwrap_or_else(|_| Local::now());
        Ok(Self {
            pid,
            command: String::new(),
            cwd: PathBuf::new(),
            output_log: pid_file.with_extension("log"),
            pid_file: pid_file.to_path_buf(),
            script: pid_file.with_extension(SCRIPT_EXT),
            started_at: modified,
        })
    }
}

/// Outcome of [`DetachedProcessManager::launch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchResult {
    Launched(ProcessHandle),
    Failed { error: String },
}

/// How a detached command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Completion {
    pub success: bool,
    /// `None` when the process vanished without writing its exit code.
    pub code: Option<i32>,
}

const SCRIPT_EXT: &str = if cfg!(windows) { "cmd" } else { "sh" };

/// How long a process gets to disappear after SIGKILL.
const KILL_WAIT: Duration = Duration::from_secs(2);

/// Liveness probes and signalling for detached processes.
#[derive(Debug, Clone, Copy)]
pub struct ProcessControl {
    pub poll_interval: Duration,
    pub stop_grace: Duration,
}

impl ProcessControl {
    pub fn from_config(config: &ProcessConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            stop_grace: Duration::from_millis(config.stop_grace_ms),
        }
    }

    /// Whether the process is alive. Probe failures count as not running.
    pub fn is_running(&self, handle: &ProcessHandle) -> bool {
        pid_alive(handle.pid)
    }

    /// Terminate the process and its children.
    ///
    /// Returns true only if the process was running and is gone afterwards.
    #[instrument(skip_all, fields(pid = handle.pid))]
    pub fn stop(&self, handle: &ProcessHandle) -> bool {
        if !self.is_running(handle) {
            debug!("process already stopped");
            return false;
        }
        if cfg!(windows) {
            let killed = quiet(Command::new("taskkill").args([
                "/F",
                "/T",
                "/PID",
                &handle.pid.to_string(),
            ]));
            if !killed {
                warn!("taskkill failed");
            }
            return killed;
        }

        signal(handle.pid, "TERM");
        if !self.exited_within(handle, self.stop_grace) {
            warn!("process ignored SIGTERM, sending SIGKILL");
            signal(handle.pid, "KILL");
            if !self.exited_within(handle, KILL_WAIT) {
                warn!("process survived SIGKILL");
                return false;
            }
        }
        info!("stopped detached process");
        true
    }

    fn exited_within(&self, handle: &ProcessHandle, budget: Duration) -> bool {
        let deadline = Instant::now() + budget;
        while self.is_running(handle) {
            if !sleep_within(deadline, Duration::from_millis(50)) {
                return !self.is_running(handle);
            }
        }
        true
    }

    /// Poll the output log until the exit-code line appears.
    ///
    /// A process that disappears without writing one completes as a failure
    /// with no code. Errors only when `timeout` elapses first.
    #[instrument(skip_all, fields(pid = handle.pid))]
    pub fn wait_for_completion(
        &self,
        handle: &ProcessHandle,
        timeout: Option<Duration>,
    ) -> Result<Completion> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            if let Some(completion) = completion_from_log(&handle.output_log) {
                debug!(code = ?completion.code, "detached process finished");
                return Ok(completion);
            }
            if !self.is_running(handle) {
                // The exit line may land between the log read and the probe.
                if let Some(completion) = completion_from_log(&handle.output_log) {
                    return Ok(completion);
                }
                warn!("process exited without reporting an exit code");
                return Ok(Completion {
                    success: false,
                    code: None,
                });
            }
            match deadline {
                Some(deadline) => {
                    if !sleep_within(deadline, self.poll_interval) {
                        bail!(
                            "timed out waiting for detached process {} ({})",
                            handle.pid,
                            handle.command
                        );
                    }
                }
                None => thread::sleep(self.poll_interval),
            }
        }
    }

    /// Stop the process once `timeout` elapses unless it finished on its own.
    pub fn stop_after(
        &self,
        handle: &ProcessHandle,
        timeout: Duration,
    ) -> Result<thread::JoinHandle<bool>> {
        let control = *self;
        let handle = handle.clone();
        thread::Builder::new()
            .name(format!("stepwise-stop-{}", handle.pid))
            .spawn(move || {
                let deadline = Instant::now() + timeout;
                while control.is_running(&handle) {
                    if !sleep_within(deadline, control.poll_interval) {
                        info!(pid = handle.pid, "auto-stop timeout reached");
                        return control.stop(&handle);
                    }
                }
                false
            })
            .context("spawn auto-stop thread")
    }
}

/// Everything captured in the output log so far.
pub fn read_output(handle: &ProcessHandle) -> Result<String> {
    match fs::read(&handle.output_log) {
        Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(String::new()),
        Err(err) => Err(err).with_context(|| format!("read {}", handle.output_log.display())),
    }
}

/// Remove the log, pid file and wrapper script. Missing files are ignored.
pub fn cleanup(handle: &ProcessHandle) -> Result<()> {
    for path in [&handle.output_log, &handle.pid_file, &handle.script] {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err).with_context(|| format!("remove {}", path.display())),
        }
    }
    Ok(())
}

/// Launches detached commands and hands out [`ProcessHandle`]s.
pub struct DetachedProcessManager {
    launcher: Box<dyn TerminalLauncher>,
    log_dir: PathBuf,
    pid_wait: Duration,
    control: ProcessControl,
}

impl DetachedProcessManager {
    pub fn new(config: &ProcessConfig) -> Self {
        Self::with_launcher(config, launcher_for(config.terminal))
    }

    pub fn with_launcher(config: &ProcessConfig, launcher: Box<dyn TerminalLauncher>) -> Self {
        Self {
            launcher,
            log_dir: config
                .log_dir
                .clone()
                .unwrap_or_else(std::env::temp_dir),
            pid_wait: Duration::from_millis(config.pid_wait_ms),
            control: ProcessControl::from_config(config),
        }
    }

    pub fn control(&self) -> ProcessControl {
        self.control
    }

    /// Start `command` in `cwd` under a new terminal session.
    ///
    /// Launch problems are reported as [`LaunchResult::Failed`] so the text can
    /// be classified like any other step failure.
    #[instrument(skip_all, fields(command = %command, launcher = self.launcher.name()))]
    pub fn launch(&self, command: &str, cwd: &Path) -> LaunchResult {
        match self.try_launch(command, cwd) {
            Ok(handle) => {
                info!(pid = handle.pid, log = %handle.output_log.display(), "launched detached process");
                LaunchResult::Launched(handle)
            }
            Err(err) => {
                let error = format!("{err:#}");
                warn!(error = %error, "detached launch failed");
                LaunchResult::Failed { error }
            }
        }
    }

    fn try_launch(&self, command: &str, cwd: &Path) -> Result<ProcessHandle> {
        if command.trim().is_empty() {
            bail!("cannot launch an empty command");
        }
        if !cwd.is_dir() {
            bail!("working directory does not exist: {}", cwd.display());
        }
        fs::create_dir_all(&self.log_dir)
            .with_context(|| format!("create {}", self.log_dir.display()))?;

        let stem = self.log_dir.join(format!("stepwise-{}", unique_id()));
        let output_log = stem.with_extension("log");
        let pid_file = stem.with_extension("pid");
        let script_path = stem.with_extension(SCRIPT_EXT);

        fs::File::create(&output_log)
            .with_context(|| format!("create {}", output_log.display()))?;
        let paths = ScriptPaths {
            cwd,
            output_log: &output_log,
            pid_file: &pid_file,
        };
        let body = if cfg!(windows) {
            script::render_windows(command, paths)
        } else {
            script::render_unix(command, paths)
        };
        write_script(&script_path, &body)?;

        let started_at = Local::now();
        let spawned_pid = self
            .launcher
            .launch(&script_path, &format!("stepwise: {command}"))?;
        let pid = self.resolve_pid(&pid_file, &script_path, spawned_pid)?;
        fs::write(&pid_file, format!("{pid}\n"))
            .with_context(|| format!("write {}", pid_file.display()))?;

        Ok(ProcessHandle {
            pid,
            command: command.to_string(),
            cwd: cwd.to_path_buf(),
            output_log,
            pid_file,
            script: script_path,
            started_at,
        })
    }

    fn resolve_pid(
        &self,
        pid_file: &Path,
        script: &Path,
        spawned_pid: Option<u32>,
    ) -> Result<u32> {
        let deadline = Instant::now() + self.pid_wait;
        loop {
            if let Some(pid) = read_pid(pid_file)? {
                return Ok(pid);
            }
            if !sleep_within(deadline, Duration::from_millis(50)) {
                break;
            }
        }
        if let Some(pid) = find_pid_by_script(script) {
            debug!(pid, "resolved pid from process table");
            return Ok(pid);
        }
        spawned_pid.ok_or_else(|| {
            anyhow!(
                "detached process did not report a pid within {} ms",
                self.pid_wait.as_millis()
            )
        })
    }
}

fn unique_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();
    let seq = LAUNCH_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{nanos}-{seq}")
}

fn write_script(path: &Path, body: &str) -> Result<()> {
    fs::write(path, body).with_context(|| format!("write {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))
            .with_context(|| format!("chmod {}", path.display()))?;
    }
    Ok(())
}

/// Pid from a pid file; `None` while the file is missing or still empty.
fn read_pid(pid_file: &Path) -> Result<Option<u32>> {
    match fs::read_to_string(pid_file) {
        Ok(contents) => Ok(contents.trim().parse().ok().filter(|pid: &u32| *pid > 0)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("read {}", pid_file.display())),
    }
}

fn completion_from_log(log: &Path) -> Option<Completion> {
    let contents = fs::read(log).ok()?;
    let code = parse_exit_code(&String::from_utf8_lossy(&contents))?;
    Some(Completion {
        success: code == 0,
        code: Some(code),
    })
}

fn find_pid_by_script(script: &Path) -> Option<u32> {
    if cfg!(windows) {
        return None;
    }
    let output = Command::new("pgrep")
        .arg("-f")
        .arg(script)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .ok()?;
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .min()
}

fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    if cfg!(windows) {
        let filter = format!("PID eq {pid}");
        let output = Command::new("tasklist")
            .args(["/FI", &filter, "/NH"])
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output();
        return match output {
            Ok(output) => String::from_utf8_lossy(&output.stdout)
                .split_whitespace()
                .any(|field| field == pid.to_string()),
            Err(_) => false,
        };
    }
    if !quiet(Command::new("kill").arg("-0").arg(pid.to_string())) {
        return false;
    }
    // Exited children linger as zombies until reaped and still accept signals.
    match Command::new("ps")
        .args(["-o", "stat=", "-p", &pid.to_string()])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
    {
        Ok(output) => !String::from_utf8_lossy(&output.stdout)
            .trim_start()
            .starts_with('Z'),
        Err(_) => true,
    }
}

/// Signal the process group; without one, the direct children and then the pid.
fn signal(pid: u32, name: &str) {
    let group = format!("-{pid}");
    let sig = format!("-{name}");
    if quiet(Command::new("kill").args([sig.as_str(), "--", group.as_str()])) {
        return;
    }
    quiet(Command::new("pkill").args([sig.as_str(), "-P", &pid.to_string()]));
    quiet(Command::new("kill").args([sig.as_str(), &pid.to_string()]));
}

/// Run a probe command with no output; true on exit status 0.
fn quiet(cmd: &mut Command) -> bool {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_ids_do_not_repeat() {
        let a = unique_id();
        let b = unique_id();
        assert_ne!(a, b);
    }

    #[test]
    fn completion_is_read_from_the_log() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = temp.path().join("out.log");
        assert_eq!(completion_from_log(&log), None);
        fs::write(&log, "=== stepwise: x ===\nhi\n").expect("write");
        assert_eq!(completion_from_log(&log), None);
        fs::write(&log, "hi\nProcess finished with exit code 3\n").expect("write");
        assert_eq!(
            completion_from_log(&log),
            Some(Completion {
                success: false,
                code: Some(3)
            })
        );
    }

    #[test]
    fn handle_from_pid_file_infers_siblings() {
        let temp = tempfile::tempdir().expect("tempdir");
        let pid_file = temp.path().join("stepwise-1-0.pid");
        fs::write(&pid_file, "4242\n").expect("write");
        let handle = ProcessHandle::from_pid_file(&pid_file).expect("handle");
        assert_eq!(handle.pid, 4242);
        assert_eq!(handle.output_log, temp.path().join("stepwise-1-0.log"));

        fs::write(&pid_file, "").expect("write");
        assert!(ProcessHandle::from_pid_file(&pid_file).is_err());
    }

    #[test]
    fn cleanup_ignores_missing_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let pid_file = temp.path().join("p.pid");
        fs::write(&pid_file, "1").expect("write");
        let handle = ProcessHandle::from_pid_file(&pid_file).expect("handle");
        cleanup(&handle).expect("cleanup");
        assert!(!pid_file.exists());
        cleanup(&handle).expect("second cleanup");
    }

    #[test]
    fn launch_rejects_missing_workdir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = ProcessConfig {
            log_dir: Some(temp.path().to_path_buf()),
            ..ProcessConfig::default()
        };
        let manager =
            DetachedProcessManager::with_launcher(&config, Box::new(launcher::HeadlessLauncher));
        let result = manager.launch("echo hi", &temp.path().join("missing"));
        let LaunchResult::Failed { error } = result else {
            panic!("expected failure");
        };
        assert!(error.contains("working directory does not exist"));
    }

    #[cfg(windows)]
    #[test]
    fn failed_taskkill_is_not_reported_as_stopped() {
        // PID 4 is the System process: always alive and never killable.
        let temp = tempfile::tempdir().expect("tempdir");
        let pid_file = temp.path().join("system.pid");
        fs::write(&pid_file, "4").expect("write");
        let handle = ProcessHandle::from_pid_file(&pid_file).expect("handle");
        let control = ProcessControl::from_config(&ProcessConfig::default());
        assert!(control.is_running(&handle));
        assert!(!control.stop(&handle));
    }
}
