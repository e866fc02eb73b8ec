//! Agent configuration stored under `.stepwise/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Agent configuration (TOML).
///
/// Missing fields default to the values below, so an empty file is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Self-heal retries per step after the first attempt.
    pub max_retries: u32,

    /// Ask the fixer for corrected steps after retryable failures.
    pub auto_retry: bool,

    /// Wall-clock limit for a blocking `run_command` step.
    pub command_timeout_secs: u64,

    /// Truncate captured command output beyond this many bytes.
    pub output_limit_bytes: usize,

    pub fixer: FixerConfig,
    pub heal: HealConfig,
    pub process: ProcessConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FixerConfig {
    /// Base URL of the planning service (`POST {url}/chat`).
    pub url: String,
    pub timeout_secs: u64,
    /// Repair prompts are trimmed to this many bytes before sending.
    pub max_prompt_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HealConfig {
    /// Number of workspace file paths included in repair prompts.
    pub max_known_files: usize,
}

/// Which terminal strategy launches detached commands.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TerminalKind {
    /// Pick by platform.
    Auto,
    Linux,
    Macos,
    Windows,
    /// Background shell with no window.
    Headless,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProcessConfig {
    pub terminal: TerminalKind,
    /// Where wrapper scripts, output logs and pid files go. Defaults to the temp dir.
    pub log_dir: Option<PathBuf>,
    /// Output monitor and completion polling interval.
    pub poll_interval_ms: u64,
    /// How long to wait for the detached shell to report its pid.
    pub pid_wait_ms: u64,
    /// Delay between SIGTERM and SIGKILL when stopping.
    pub stop_grace_ms: u64,
    /// Commands matching any of these regexes run detached instead of blocking.
    pub detach_patterns: Vec<String>,
}

impl Default for FixerConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:5000".to_string(),
            timeout_secs: 120,
            max_prompt_bytes: 10_000,
        }
    }
}

impl Default for HealConfig {
    fn default() -> Self {
        Self {
            max_known_files: 50,
        }
    }
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            terminal: TerminalKind::Auto,
            log_dir: None,
            poll_interval_ms: 500,
            pid_wait_ms: 5_000,
            stop_grace_ms: 2_000,
            detach_patterns: [
                r"^npm (run )?(start|dev|serve)\b",
                r"^(yarn|pnpm) (run )?(start|dev|serve)\b",
                r"^npx (vite|next dev|serve)\b",
                r"\bnodemon\b",
                r"--watch\b",
                r"^cargo watch\b",
                r"^python3? -m http\.server\b",
                r"^(flask|uvicorn|gunicorn)\b",
                r"manage\.py runserver\b",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            auto_retry: true,
            command_timeout_secs: 10 * 60,
            output_limit_bytes: 100_000,
            fixer: FixerConfig::default(),
            heal: HealConfig::default(),
            process: ProcessConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.command_timeout_secs == 0 {
            return Err(anyhow!("command_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.fixer.url.trim().is_empty() {
            return Err(anyhow!("fixer.url must be non-empty"));
        }
        if self.fixer.timeout_secs == 0 {
            return Err(anyhow!("fixer.timeout_secs must be > 0"));
        }
        if self.fixer.max_prompt_bytes < 256 {
            return Err(anyhow!("fixer.max_prompt_bytes must be >= 256"));
        }
        if self.process.poll_interval_ms == 0 {
            return Err(anyhow!("process.poll_interval_ms must be > 0"));
        }
        for pattern in &self.process.detach_patterns {
            Regex::new(pattern)
                .with_context(|| format!("process.detach_patterns: invalid regex {pattern:?}"))?;
        }
        Ok(())
    }

    /// Compile `process.detach_patterns`.
    pub fn detach_regexes(&self) -> Result<Vec<Regex>> {
        self.process
            .detach_patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).with_context(|| format!("compile detach pattern {pattern:?}"))
            })
            .collect()
    }
}

/// `<workdir>/.stepwise/config.toml`
pub fn default_config_path(workdir: &Path) -> PathBuf {
    workdir.join(".stepwise").join("config.toml")
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `AgentConfig::default()`.
pub fn load_config(path: &Path) -> Result<AgentConfig> {
    if !path.exists() {
        let cfg = AgentConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: AgentConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &AgentConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, AgentConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let cfg = AgentConfig {
            max_retries: 0,
            process: ProcessConfig {
                terminal: TerminalKind::Headless,
                log_dir: Some(temp.path().join("logs")),
                ..ProcessConfig::default()
            },
            ..AgentConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "max_retries = 5\n[fixer]\nurl = \"http://fixer:9000\"\n")
            .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_retries, 5);
        assert_eq!(cfg.fixer.url, "http://fixer:9000");
        assert_eq!(cfg.fixer.timeout_secs, FixerConfig::default().timeout_secs);
        assert!(cfg.auto_retry);
    }

    #[test]
    fn rejects_invalid_detach_pattern() {
        let cfg = AgentConfig {
            process: ProcessConfig {
                detach_patterns: vec!["(unclosed".to_string()],
                ..ProcessConfig::default()
            },
            ..AgentConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(format!("{err:#}").contains("detach_patterns"));
    }

    #[test]
    fn default_detach_patterns_match_servers_only() {
        let regexes = AgentConfig::default().detach_regexes().expect("compile");
        let detached = |cmd: &str| regexes.iter().any(|re| re.is_match(cmd));
        assert!(detached("npm run dev"));
        assert!(detached("npm start"));
        assert!(detached("python -m http.server 8000"));
        assert!(detached("tsc --watch"));
        assert!(!detached("npm install"));
        assert!(!detached("cargo test"));
    }
}
