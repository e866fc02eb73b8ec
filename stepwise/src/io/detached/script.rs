//! Wrapper scripts run inside the detached shell.
//!
//! The script records its own pid, prints a banner, runs the command with
//! stderr merged into stdout and tee'd into the output log, and finally
//! appends [`FINISH_MARKER`] followed by the exit code. That trailing line is
//! the only completion signal the orchestrator reads.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

/// Prefix of the final log line; the exit code follows it.
pub const FINISH_MARKER: &str = "Process finished with exit code";

static EXIT_CODE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)exit code\s+(-?\d+)").expect("exit code regex should compile")
});

/// Paths a wrapper script writes to.
#[derive(Debug, Clone, Copy)]
pub struct ScriptPaths<'a> {
    pub cwd: &'a Path,
    pub output_log: &'a Path,
    pub pid_file: &'a Path,
}

/// Exit code reported by the last `exit code <N>` line of a log, if any.
///
/// Only the last matching line counts, so command output that happens to
/// mention an exit code earlier in the log does not end the wait.
pub fn parse_exit_code(log: &str) -> Option<i32> {
    let line = log.lines().rev().find(|line| EXIT_CODE_RE.is_match(line))?;
    EXIT_CODE_RE
        .captures_iter(line)
        .last()
        .and_then(|caps| caps.get(1))
        .and_then(|code| code.as_str().parse().ok())
}

/// Bash wrapper for Unix-like systems.
pub fn render_unix(command: &str, paths: ScriptPaths<'_>) -> String {
    let log = sh_quote(&paths.output_log.to_string_lossy());
    let pid = sh_quote(&paths.pid_file.to_string_lossy());
    let cwd = sh_quote(&paths.cwd.to_string_lossy());
    let banner = sh_quote(&format!("=== stepwise: {command} ==="));
    format!(
        r#"#!/usr/bin/env bash
echo $$ > {pid}
if ! cd {cwd}; then
  echo "{FINISH_MARKER} 1" >> {log}
  exit 1
fi
{{
  printf '%s\n' {banner}
  echo "Started: $(date)"
  echo
}} | tee -a {log}
(
{command}
) 2>&1 | tee -a {log}
code=${{PIPESTATUS[0]}}
echo "{FINISH_MARKER} $code" | tee -a {log}
exit $code
"#
    )
}

/// Batch wrapper for Windows.
pub fn render_windows(command: &str, paths: ScriptPaths<'_>) -> String {
    let log = paths.output_log.to_string_lossy();
    let pid = paths.pid_file.to_string_lossy();
    let cwd = paths.cwd.to_string_lossy();
    let banner = batch_echo_escape(&format!("=== stepwise: {command} ==="));
    let ps_command = command.replace('\'', "''");
    let ps_log = log.replace('\'', "''");
    format!(
        "@echo off\r\n\
for /f %%i in ('powershell -NoProfile -Command \"(Get-CimInstance Win32_Process -Filter \\\"ProcessId=$PID\\\").ParentProcessId\"') do echo %%i> \"{pid}\"\r\n\
cd /d \"{cwd}\" || (echo {FINISH_MARKER} 1>> \"{log}\" & exit /b 1)\r\n\
echo {banner}>> \"{log}\"\r\n\
echo Started: %date% %time%>> \"{log}\"\r\n\
powershell -NoProfile -Command \"& {{ cmd /c '{ps_command}' 2>&1 | Tee-Object -FilePath '{ps_log}' -Append; exit $LASTEXITCODE }}\"\r\n\
set STEPWISE_EXIT=%ERRORLEVEL%\r\n\
echo {FINISH_MARKER} %STEPWISE_EXIT%>> \"{log}\"\r\n\
exit /b %STEPWISE_EXIT%\r\n"
    )
}

/// Single-quote for POSIX shells.
pub fn sh_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn batch_echo_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '^' | '&' | '|' | '<' | '>' | '(' | ')' => {
                out.push('^');
                out.push(ch);
            }
            '%' => out.push_str("%%"),
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths<'a>(cwd: &'a Path, log: &'a Path, pid: &'a Path) -> ScriptPaths<'a> {
        ScriptPaths {
            cwd,
            output_log: log,
            pid_file: pid,
        }
    }

    #[test]
    fn parses_last_exit_code_case_insensitively() {
        assert_eq!(parse_exit_code("banner\nProcess finished with exit code 0\n"), Some(0));
        assert_eq!(parse_exit_code("EXIT CODE 1"), Some(1));
        assert_eq!(
            parse_exit_code("tool says: exit code 7\nmore\nProcess finished with exit code 2"),
            Some(2)
        );
        assert_eq!(parse_exit_code("still running..."), None);
        assert_eq!(parse_exit_code("exit code -1"), Some(-1));
    }

    #[test]
    fn unix_script_writes_pid_banner_and_marker() {
        let script = render_unix(
            "npm run dev",
            paths(
                Path::new("/work dir"),
                Path::new("/tmp/out.log"),
                Path::new("/tmp/out.pid"),
            ),
        );
        assert!(script.starts_with("#!/usr/bin/env bash\n"));
        assert!(script.contains("echo $$ > '/tmp/out.pid'"));
        assert!(script.contains("cd '/work dir'"));
        assert!(script.contains("'=== stepwise: npm run dev ==='"));
        assert!(script.contains("(\nnpm run dev\n) 2>&1 | tee -a '/tmp/out.log'"));
        assert!(script.contains("code=${PIPESTATUS[0]}"));
        assert!(script.contains("echo \"Process finished with exit code $code\""));
    }

    #[test]
    fn windows_script_escapes_banner() {
        let script = render_windows(
            "echo a & echo b",
            paths(
                Path::new("C:\\work"),
                Path::new("C:\\tmp\\out.log"),
                Path::new("C:\\tmp\\out.pid"),
            ),
        );
        assert!(script.contains("echo === stepwise: echo a ^& echo b ===>> \"C:\\tmp\\out.log\""));
        assert!(script.contains("cmd /c 'echo a & echo b'"));
        assert!(script.contains("echo Process finished with exit code %STEPWISE_EXIT%"));
    }

    #[test]
    fn sh_quote_escapes_single_quotes() {
        assert_eq!(sh_quote("it's"), r"'it'\''s'");
    }
}
