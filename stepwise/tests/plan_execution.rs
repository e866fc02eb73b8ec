//! End-to-end plan execution against a real working directory.
//!
//! File steps hit the filesystem; commands and the fixer are scripted so the
//! retry and heal paths are deterministic.

use std::fs;
use std::path::Path;

use stepwise::core::types::{Action, StepOutcome, StepSpec, StepStatus};
use stepwise::executor::{ExecutorSettings, PlanExecutor};
use stepwise::heal::SelfHealer;
use stepwise::io::config::AgentConfig;
use stepwise::io::files::LocalFiles;
use stepwise::test_support::{
    RecordingConfirmer, RecordingProgress, ScriptedFixer, ScriptedShell, temp_workspace,
};

type TestExecutor = PlanExecutor<LocalFiles, ScriptedShell, ScriptedFixer, RecordingConfirmer>;

fn executor(
    workdir: &Path,
    shell: ScriptedShell,
    fixer: ScriptedFixer,
    config: &AgentConfig,
) -> TestExecutor {
    PlanExecutor::new(
        LocalFiles::new(workdir),
        shell,
        SelfHealer::new(fixer, workdir, config),
        RecordingConfirmer::approving(),
        ExecutorSettings::from_config(config, workdir).expect("settings"),
    )
}

fn command(cmd: &str) -> StepSpec {
    StepSpec {
        command: Some(cmd.to_string()),
        ..StepSpec::new(Action::RunCommand)
    }
}

fn no_fix() -> ScriptedFixer {
    ScriptedFixer::structured(None, Vec::new())
}

#[test]
fn create_file_step_writes_the_file() {
    let temp = tempfile::tempdir().expect("tempdir");
    let exec = executor(
        temp.path(),
        ScriptedShell::default(),
        no_fix(),
        &AgentConfig::default(),
    );
    let plan = vec![StepSpec {
        path: Some("a.txt".to_string()),
        content: Some("hi".to_string()),
        ..StepSpec::new(Action::CreateFile)
    }];

    let summary = exec.execute_plan(Some(&plan));

    assert_eq!((summary.completed, summary.total, summary.pending), (1, 1, 0));
    assert_eq!(
        fs::read_to_string(temp.path().join("a.txt")).expect("read"),
        "hi"
    );
    assert_eq!(summary.log, ["✓ Step 1: Created a.txt"]);
}

#[test]
fn empty_or_missing_plan_is_a_no_op() {
    let temp = tempfile::tempdir().expect("tempdir");
    let shell = ScriptedShell::default();
    let fixer = no_fix();
    let exec = executor(
        temp.path(),
        shell.clone(),
        fixer.clone(),
        &AgentConfig::default(),
    );

    for plan in [None, Some(&[][..])] {
        let summary = exec.execute_plan(plan);
        assert_eq!((summary.completed, summary.total, summary.pending), (0, 0, 0));
        assert!(summary.log.is_empty());
    }
    assert!(shell.commands().is_empty());
    assert_eq!(fixer.calls(), 0);
    assert_eq!(fs::read_dir(temp.path()).expect("list").count(), 0);
}

#[test]
fn failing_command_without_auto_retry_runs_once() {
    let temp = tempfile::tempdir().expect("tempdir");
    let shell = ScriptedShell::default().fail("exit 1", 1, "");
    let fixer = no_fix();
    let config = AgentConfig {
        auto_retry: false,
        ..AgentConfig::default()
    };
    let exec = executor(temp.path(), shell.clone(), fixer.clone(), &config);

    let summary = exec.execute_plan(Some(&[command("exit 1")]));

    assert_eq!(shell.commands(), ["exit 1"]);
    assert_eq!(fixer.calls(), 0);
    assert_eq!(summary.records[0].outcome, StepOutcome::RetryExhausted);
    assert_eq!((summary.completed, summary.total, summary.pending), (0, 1, 0));
}

#[test]
fn permission_errors_are_never_healed() {
    let temp = tempfile::tempdir().expect("tempdir");
    let shell = ScriptedShell::default().fail("touch /etc/x", 1, "EACCES: permission denied");
    let fixer = ScriptedFixer::structured(None, vec![command("sudo touch /etc/x")]);
    let exec = executor(
        temp.path(),
        shell.clone(),
        fixer.clone(),
        &AgentConfig::default(),
    );

    let summary = exec.execute_plan(Some(&[command("touch /etc/x")]));

    assert_eq!(fixer.calls(), 0);
    assert_eq!(shell.commands().len(), 1);
    assert_eq!(summary.records[0].outcome, StepOutcome::NonRetryableFailure);
    assert_eq!(summary.records[0].status, StepStatus::Failed);
}

#[test]
fn retry_budget_bounds_attempts() {
    let temp = tempfile::tempdir().expect("tempdir");
    let shell = ScriptedShell::default().fail("npm tset", 1, "missing script: tset");
    // The fixer keeps proposing the same broken command.
    let fixer = ScriptedFixer::structured(Some("try again"), vec![command("npm tset")]);
    let config = AgentConfig {
        max_retries: 2,
        ..AgentConfig::default()
    };
    let exec = executor(temp.path(), shell.clone(), fixer.clone(), &config);

    let summary = exec.execute_plan(Some(&[command("npm tset")]));

    assert_eq!(shell.commands().len(), 3);
    assert_eq!(fixer.calls(), 2);
    assert_eq!(summary.records[0].outcome, StepOutcome::RetryExhausted);
    assert_eq!(summary.records[0].retries, 2);

    let requests = fixer.requests();
    assert_eq!(requests[0].conversation_history, None);
    let history = requests[1]
        .conversation_history
        .as_ref()
        .expect("second repair carries the first exchange");
    assert_eq!(history.len(), 2);
    assert!(history[0].content.contains("missing script: tset"));
    assert!(history[1].content.contains("try again"));
}

#[test]
fn zero_retries_means_one_attempt() {
    let temp = tempfile::tempdir().expect("tempdir");
    let shell = ScriptedShell::default().fail("make", 2, "no rule");
    let fixer = no_fix();
    let config = AgentConfig {
        max_retries: 0,
        ..AgentConfig::default()
    };
    let exec = executor(temp.path(), shell.clone(), fixer.clone(), &config);

    exec.execute_plan(Some(&[command("make")]));

    assert_eq!(shell.commands().len(), 1);
    assert_eq!(fixer.calls(), 0);
}

#[test]
fn healed_step_runs_and_failure_is_reported_before_the_fix() {
    let temp = tempfile::tempdir().expect("tempdir");
    let shell = ScriptedShell::default().fail("npm tset", 1, "missing script: tset");
    let fixer = ScriptedFixer::structured(Some("typo in script name"), vec![command("npm test")]);
    let progress = RecordingProgress::default();
    let exec = executor(
        temp.path(),
        shell.clone(),
        fixer,
        &AgentConfig::default(),
    )
    .with_progress(Box::new(progress.clone()));

    let summary = exec.execute_plan(Some(&[command("npm tset")]));

    assert_eq!(shell.commands(), ["npm tset", "npm test"]);
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.records[0].retries, 1);
    assert_eq!(
        progress.events(),
        [
            "start 1",
            "failed 1 attempt 0 Retryable",
            "healed 1: typo in script name",
            "finished ✓ Step 1: Ran npm test",
        ]
    );
}

#[test]
fn read_and_patch_steps_see_existing_files() {
    let temp = temp_workspace(&[("src/config.js", "port = 3000\n")]).expect("workspace");
    let progress = RecordingProgress::default();
    let exec = executor(
        temp.path(),
        ScriptedShell::default(),
        no_fix(),
        &AgentConfig::default(),
    )
    .with_progress(Box::new(progress.clone()));
    let plan = vec![
        StepSpec {
            path: Some("src/config.js".to_string()),
            ..StepSpec::new(Action::ReadFile)
        },
        StepSpec {
            path: Some(temp.path().join("src/config.js").display().to_string()),
            old_content: Some("3000".to_string()),
            new_content: Some("8080".to_string()),
            ..StepSpec::new(Action::PatchFile)
        },
    ];

    let summary = exec.execute_plan(Some(&plan));

    assert_eq!(summary.completed, 2);
    assert!(progress.events().contains(&"output 1".to_string()));
    assert_eq!(
        fs::read_to_string(temp.path().join("src/config.js")).expect("read"),
        "port = 8080\n"
    );
}

#[test]
fn failures_leave_later_steps_running_when_operator_continues() {
    let temp = tempfile::tempdir().expect("tempdir");
    let shell = ScriptedShell::default().fail("exit 1", 1, "");
    let config = AgentConfig {
        auto_retry: false,
        ..AgentConfig::default()
    };
    let exec = executor(temp.path(), shell.clone(), no_fix(), &config);
    let plan = vec![
        command("exit 1"),
        StepSpec {
            path: Some("after.txt".to_string()),
            content: Some("ok".to_string()),
            ..StepSpec::new(Action::CreateFile)
        },
    ];

    let summary = exec.execute_plan(Some(&plan));

    assert_eq!((summary.completed, summary.total, summary.pending), (1, 2, 0));
    assert_eq!(summary.failed(), 1);
    assert!(temp.path().join("after.txt").is_file());
    assert!(!summary.is_success());
}

#[test]
fn existing_file_is_a_non_retryable_failure() {
    let temp = temp_workspace(&[("a.txt", "old")]).expect("workspace");
    let fixer = no_fix();
    let exec = executor(
        temp.path(),
        ScriptedShell::default(),
        fixer.clone(),
        &AgentConfig::default(),
    );
    let plan = vec![StepSpec {
        path: Some("a.txt".to_string()),
        content: Some("new".to_string()),
        ..StepSpec::new(Action::CreateFile)
    }];

    let summary = exec.execute_plan(Some(&plan));

    assert_eq!(summary.records[0].outcome, StepOutcome::NonRetryableFailure);
    assert_eq!(fixer.calls(), 0);
    assert_eq!(
        fs::read_to_string(temp.path().join("a.txt")).expect("read"),
        "old"
    );
}
