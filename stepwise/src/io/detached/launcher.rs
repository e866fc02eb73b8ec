//! Strategies for starting a wrapper script in its own terminal session.

use std::ffi::OsString;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, warn};

use crate::io::config::TerminalKind;
use crate::io::shell::program_on_path;

/// Linux emulators in order of preference.
pub const LINUX_EMULATORS: [&str; 8] = [
    "gnome-terminal",
    "konsole",
    "xfce4-terminal",
    "mate-terminal",
    "tilix",
    "alacritty",
    "kitty",
    "xterm",
];

/// Starts a wrapper script without blocking on it.
pub trait TerminalLauncher: Send + Sync {
    fn name(&self) -> &'static str;

    /// Start `script`. Returns the wrapper shell's pid when the launcher
    /// spawned it directly; terminal launchers only know the emulator's pid.
    fn launch(&self, script: &Path, title: &str) -> Result<Option<u32>>;
}

/// Choose a launcher for the configured terminal kind.
pub fn launcher_for(kind: TerminalKind) -> Box<dyn TerminalLauncher> {
    let kind = match kind {
        TerminalKind::Auto if cfg!(target_os = "macos") => TerminalKind::Macos,
        TerminalKind::Auto if cfg!(windows) => TerminalKind::Windows,
        TerminalKind::Auto => TerminalKind::Linux,
        other => other,
    };
    match kind {
        TerminalKind::Macos => Box::new(MacTerminalLauncher),
        TerminalKind::Windows => Box::new(WindowsTerminalLauncher),
        TerminalKind::Headless => Box::new(HeadlessLauncher),
        TerminalKind::Linux | TerminalKind::Auto => Box::new(LinuxTerminalLauncher::default()),
    }
}

/// Opens the first installed emulator from a preference list.
#[derive(Debug, Clone)]
pub struct LinuxTerminalLauncher {
    candidates: Vec<&'static str>,
}

impl Default for LinuxTerminalLauncher {
    fn default() -> Self {
        Self {
            candidates: LINUX_EMULATORS.to_vec(),
        }
    }
}

impl LinuxTerminalLauncher {
    pub fn with_candidates(candidates: Vec<&'static str>) -> Self {
        Self { candidates }
    }

    fn find_emulator(&self) -> Option<&'static str> {
        self.candidates
            .iter()
            .copied()
            .find(|program| program_on_path(program))
    }
}

impl TerminalLauncher for LinuxTerminalLauncher {
    fn name(&self) -> &'static str {
        "linux"
    }

    fn launch(&self, script: &Path, title: &str) -> Result<Option<u32>> {
        let emulator = self.find_emulator().ok_or_else(|| {
            anyhow!(
                "no terminal emulator found (tried: {})",
                self.candidates.join(", ")
            )
        })?;
        debug!(emulator, "opening terminal");
        let mut cmd = Command::new(emulator);
        cmd.args(emulator_args(emulator, script, title));
        spawn_reaped(cmd).with_context(|| format!("launch {emulator}"))?;
        Ok(None)
    }
}

/// Argument conventions differ per emulator.
fn emulator_args(emulator: &str, script: &Path, title: &str) -> Vec<OsString> {
    let script = script.as_os_str().to_os_string();
    let bash = OsString::from("bash");
    let mut args: Vec<OsString> = match emulator {
        "gnome-terminal" => vec![format!("--title={title}").into(), "--".into()],
        "konsole" => vec!["-p".into(), format!("tabtitle={title}").into(), "-e".into()],
        "xfce4-terminal" | "mate-terminal" => vec!["--title".into(), title.into(), "-x".into()],
        "tilix" => {
            let mut joined = OsString::from("bash ");
            joined.push(&script);
            return vec!["-t".into(), title.into(), "-e".into(), joined];
        }
        "alacritty" => vec!["--title".into(), title.into(), "-e".into()],
        "kitty" => vec!["--title".into(), title.into()],
        _ => vec!["-T".into(), title.into(), "-e".into()],
    };
    args.push(bash);
    args.push(script);
    args
}

/// Runs the script in a new Terminal.app window through AppleScript.
#[derive(Debug, Clone, Copy)]
pub struct MacTerminalLauncher;

impl TerminalLauncher for MacTerminalLauncher {
    fn name(&self) -> &'static str {
        "macos"
    }

    fn launch(&self, script: &Path, _title: &str) -> Result<Option<u32>> {
        let shell_line = format!("bash {}", super::script::sh_quote(&script.to_string_lossy()));
        let escaped = shell_line.replace('\\', "\\\\").replace('"', "\\\"");
        let mut cmd = Command::new("osascript");
        cmd.arg("-e")
            .arg(format!("tell application \"Terminal\" to do script \"{escaped}\""))
            .arg("-e")
            .arg("tell application \"Terminal\" to activate");
        spawn_reaped(cmd).context("launch Terminal.app")?;
        Ok(None)
    }
}

/// Opens a new console window with `start`.
#[derive(Debug, Clone, Copy)]
pub struct WindowsTerminalLauncher;

impl TerminalLauncher for WindowsTerminalLauncher {
    fn name(&self) -> &'static str {
        "windows"
    }

    fn launch(&self, script: &Path, title: &str) -> Result<Option<u32>> {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C")
            .arg("start")
            .arg(title)
            .arg("cmd")
            .arg("/C")
            .arg(script);
        spawn_reaped(cmd).context("launch console window")?;
        Ok(None)
    }
}

/// Runs the script as a background process with no window.
#[derive(Debug, Clone, Copy)]
pub struct HeadlessLauncher;

impl TerminalLauncher for HeadlessLauncher {
    fn name(&self) -> &'static str {
        "headless"
    }

    fn launch(&self, script: &Path, _title: &str) -> Result<Option<u32>> {
        let mut cmd = if cfg!(windows) {
            let mut cmd = Command::new("cmd");
            cmd.arg("/C").arg(script);
            cmd
        } else {
            let mut cmd = Command::new("bash");
            cmd.arg(script);
            cmd
        };
        // Own process group so stop() can signal the whole pipeline.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        let pid = spawn_reaped(cmd).context("launch background shell")?;
        Ok(Some(pid))
    }
}

/// Spawn with null stdio and wait on the child from a thread so it never
/// lingers as a zombie. Returns the child's pid.
fn spawn_reaped(mut cmd: Command) -> Result<u32> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    let child = cmd.spawn().context("spawn")?;
    let pid = child.id();
    thread::Builder::new()
        .name(format!("stepwise-reap-{pid}"))
        .spawn(move || reap(child))
        .context("spawn reaper thread")?;
    Ok(pid)
}

fn reap(mut child: Child) {
    match child.wait() {
        Ok(status) => debug!(pid = child.id(), ?status, "launcher child exited"),
        Err(err) => warn!(pid = child.id(), err = %err, "failed to wait for launcher child"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: Vec<OsString>) -> Vec<String> {
        args.into_iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn emulator_arguments_follow_each_convention() {
        let script = Path::new("/tmp/run.sh");
        assert_eq!(
            strings(emulator_args("gnome-terminal", script, "t")),
            ["--title=t", "--", "bash", "/tmp/run.sh"]
        );
        assert_eq!(
            strings(emulator_args("xterm", script, "t")),
            ["-T", "t", "-e", "bash", "/tmp/run.sh"]
        );
        assert_eq!(
            strings(emulator_args("tilix", script, "t")),
            ["-t", "t", "-e", "bash /tmp/run.sh"]
        );
        assert_eq!(
            strings(emulator_args("kitty", script, "t")),
            ["--title", "t", "bash", "/tmp/run.sh"]
        );
    }

    #[test]
    fn missing_emulators_are_named_in_the_error() {
        let launcher =
            LinuxTerminalLauncher::with_candidates(vec!["no-such-term-a", "no-such-term-b"]);
        let err = launcher
            .launch(Path::new("/tmp/run.sh"), "t")
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "no terminal emulator found (tried: no-such-term-a, no-such-term-b)"
        );
    }

    #[test]
    fn launcher_for_respects_explicit_kind() {
        assert_eq!(launcher_for(TerminalKind::Headless).name(), "headless");
        assert_eq!(launcher_for(TerminalKind::Linux).name(), "linux");
        assert_eq!(launcher_for(TerminalKind::Macos).name(), "macos");
        assert_eq!(launcher_for(TerminalKind::Windows).name(), "windows");
    }
}
