#![cfg(unix)]

use std::sync::Once;
use std::time::Instant;

use lazy_static::lazy_static;
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

use coderunner::config::{LanguageProfile, RunnerConfig};
use coderunner::driver::ExecutionDriver;
use coderunner::record::{ExecutionPhase, TerminationReason};
use coderunner::runtime::ProcessRuntime;
use coderunner::submission::{ExecutionLimits, SourceFile, SubmissionBundle};

static INIT: Once = Once::new();

lazy_static! {
    /// Shell "language" so the pipeline can be driven end to end without a
    /// compiler toolchain on the host.
    static ref SHELL: LanguageProfile = serde_json::from_str(
        r#"{
            "name": "shell",
            "entry_file": "main.sh",
            "run_command": ["sh", "%INPUT%"]
        }"#,
    )
    .unwrap();

    /// Two-phase variant: the build step copies the entry point into the
    /// artifact the run step executes.
    static ref SHELL_BUILD: LanguageProfile = serde_json::from_str(
        r#"{
            "name": "shell-build",
            "entry_file": "main.sh",
            "compile_command": ["cp", "%INPUT%", "built.sh"],
            "run_command": ["sh", "built.sh"]
        }"#,
    )
    .unwrap();

    /// Build step that always rejects the source.
    static ref SHELL_BROKEN_BUILD: LanguageProfile = serde_json::from_str(
        r#"{
            "name": "shell-broken",
            "entry_file": "main.sh",
            "compile_command": ["sh", "-c", "echo 'main.sh:1: unexpected token' >&2; exit 1"],
            "run_command": ["sh", "main.sh"]
        }"#,
    )
    .unwrap();
}

fn shell_driver() -> ExecutionDriver {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });

    let mut config = RunnerConfig::default();
    config.scratch_root = Some(std::env::temp_dir().join("coderunner-tests"));
    config.languages = vec![SHELL.clone(), SHELL_BUILD.clone(), SHELL_BROKEN_BUILD.clone()];

    let runtime = ProcessRuntime::build(&config).unwrap();
    ExecutionDriver::new(Box::new(runtime), &config)
}

fn script(language: &str, body: &str) -> SubmissionBundle {
    SubmissionBundle::new(language, vec![SourceFile::new("main.sh", body)])
}

fn tight_limits(wall_time_ms: u64, max_output_bytes: u64) -> ExecutionLimits {
    ExecutionLimits {
        cpu_time_ms: 2_000,
        wall_time_ms,
        memory_bytes: 256 * 1024 * 1024,
        max_output_bytes,
    }
}

#[tokio::test]
async fn test_hello_world() {
    let driver = shell_driver();
    let record = driver.execute(&script("shell", "echo Hello")).await.unwrap();

    assert_eq!(record.phase, ExecutionPhase::Completed);
    assert_eq!(record.termination_reason, TerminationReason::Ok);
    assert_eq!(record.exit_code, Some(0));
    assert_eq!(record.stdout, "Hello\n");
    assert!(!record.stdout_truncated);
}

#[tokio::test]
async fn test_exit_code_round_trip() {
    let driver = shell_driver();
    let record = driver.execute(&script("shell", "exit 7")).await.unwrap();

    assert_eq!(record.phase, ExecutionPhase::Completed);
    assert_eq!(record.exit_code, Some(7));
}

#[tokio::test]
async fn test_stdin_reaches_the_program() {
    let driver = shell_driver();
    let bundle = script("shell", "cat").with_stdin("ping\n");
    let record = driver.execute(&bundle).await.unwrap();

    assert_eq!(record.exit_code, Some(0));
    assert_eq!(record.stdout, "ping\n");
}

#[tokio::test]
async fn test_infinite_loop_times_out() {
    let driver = shell_driver();
    let bundle = script("shell", "sleep 30").with_limits(tight_limits(1_500, 65_536));

    let started = Instant::now();
    let record = driver.execute(&bundle).await.unwrap();

    assert_eq!(record.phase, ExecutionPhase::TimedOut);
    assert_eq!(record.termination_reason, TerminationReason::Timeout);
    assert_eq!(record.exit_code, None);
    // bounded grace period, nowhere near the program's own runtime
    assert!(started.elapsed().as_secs() < 10);
}

#[tokio::test]
async fn test_runaway_output_is_cut_and_flagged() {
    let driver = shell_driver();
    let bundle = script("shell", "while true; do echo spam; done")
        .with_limits(tight_limits(10_000, 4_096));

    let started = Instant::now();
    let record = driver.execute(&bundle).await.unwrap();

    assert_eq!(record.termination_reason, TerminationReason::OutputExceeded);
    assert!(record.stdout_truncated);
    assert!(record.stdout.len() <= 4_096);
    assert!(started.elapsed().as_secs() < 10);
}

#[tokio::test]
async fn test_scratch_does_not_leak_between_submissions() {
    let driver = shell_driver();

    let writer = driver
        .execute(&script("shell", "echo leaked > marker.txt"))
        .await
        .unwrap();
    assert_eq!(writer.exit_code, Some(0));

    let reader = driver
        .execute(&script("shell", "cat marker.txt"))
        .await
        .unwrap();
    assert_ne!(reader.exit_code, Some(0));
    assert_eq!(reader.stdout, "");
}

#[tokio::test]
async fn test_deterministic_program_is_idempotent() {
    let driver = shell_driver();
    let bundle = script("shell", "echo stable; exit 3");

    let first = driver.execute(&bundle).await.unwrap();
    let second = driver.execute(&bundle).await.unwrap();

    assert_eq!(first.stdout, second.stdout);
    assert_eq!(first.exit_code, second.exit_code);
    assert_eq!(first.exit_code, Some(3));
}

#[tokio::test]
async fn test_build_step_feeds_the_run_step() {
    let driver = shell_driver();
    let record = driver
        .execute(&script("shell-build", "echo built-and-run"))
        .await
        .unwrap();

    assert_eq!(record.phase, ExecutionPhase::Completed);
    assert_eq!(record.stdout, "built-and-run\n");
    assert_eq!(record.compile_diagnostics, None);
}

#[tokio::test]
async fn test_rejected_build_reports_compile_error() {
    let driver = shell_driver();
    let record = driver
        .execute(&script("shell-broken", "echo never runs"))
        .await
        .unwrap();

    assert_eq!(record.phase, ExecutionPhase::CompileFailed);
    assert_eq!(record.termination_reason, TerminationReason::CompileError);
    assert_eq!(record.exit_code, None);
    assert!(
        record
            .compile_diagnostics
            .as_deref()
            .unwrap()
            .contains("unexpected token")
    );
    assert_eq!(record.stdout, "");
}

#[tokio::test]
async fn test_cancellation_interrupts_a_running_submission() {
    let driver = shell_driver();
    let bundle = script("shell", "sleep 30");

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let record = driver.execute_cancellable(&bundle, &token).await.unwrap();

    assert_eq!(record.phase, ExecutionPhase::TimedOut);
    assert_eq!(record.termination_reason, TerminationReason::Timeout);
    assert!(started.elapsed().as_secs() < 10);
}
