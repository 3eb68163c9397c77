use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::create_timestamp;
use crate::runtime::{ResourceBreach, RunReport};
use crate::submission::ExecutionLimits;

/// Lifecycle of one submission. Transitions only move forward; the terminal
/// states absorb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPhase {
    Pending,
    Compiling,
    Running,
    Completed,
    CompileFailed,
    RuntimeFailed,
    TimedOut,
    ResourceExceeded,
}

impl ExecutionPhase {
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            ExecutionPhase::Pending | ExecutionPhase::Compiling | ExecutionPhase::Running
        )
    }
}

/// Caller-facing explanation of why the submission ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    Ok,
    CompileError,
    Timeout,
    MemoryExceeded,
    OutputExceeded,
    InternalError,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::Ok => "ok",
            TerminationReason::CompileError => "compile_error",
            TerminationReason::Timeout => "timeout",
            TerminationReason::MemoryExceeded => "memory_exceeded",
            TerminationReason::OutputExceeded => "output_exceeded",
            TerminationReason::InternalError => "internal_error",
        }
    }
}

/// The single immutable record produced for every submission once a terminal
/// phase is reached.
#[derive(Debug, Clone, Serialize)]
pub struct ResultRecord {
    pub phase: ExecutionPhase,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    /// Compiler output, verbatim and unfiltered
    pub compile_diagnostics: Option<String>,
    pub duration_ms: u64,
    pub termination_reason: TerminationReason,
    pub created_at: String,
}

impl ResultRecord {
    fn terminal(
        phase: ExecutionPhase,
        termination_reason: TerminationReason,
        duration: Duration,
    ) -> Self {
        debug_assert!(phase.is_terminal());
        Self {
            phase,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            stdout_truncated: false,
            stderr_truncated: false,
            compile_diagnostics: None,
            duration_ms: duration.as_millis() as u64,
            termination_reason,
            created_at: create_timestamp(),
        }
    }

    /// The build step rejected the source; diagnostics pass through verbatim.
    pub fn compile_failed(diagnostics: String, duration: Duration) -> Self {
        Self {
            compile_diagnostics: Some(diagnostics),
            ..Self::terminal(
                ExecutionPhase::CompileFailed,
                TerminationReason::CompileError,
                duration,
            )
        }
    }

    /// The build step breached a ceiling before producing a verdict.
    pub fn compile_aborted(
        phase: ExecutionPhase,
        reason: TerminationReason,
        diagnostics: String,
        duration: Duration,
    ) -> Self {
        Self {
            compile_diagnostics: if diagnostics.is_empty() {
                None
            } else {
                Some(diagnostics)
            },
            ..Self::terminal(phase, reason, duration)
        }
    }

    /// A collaborator fault, distinct from any user-code failure. The
    /// diagnostic is driver-internal and lands in stderr for the caller.
    pub fn internal_error(diagnostic: String, duration: Duration) -> Self {
        Self {
            stderr: diagnostic,
            ..Self::terminal(
                ExecutionPhase::RuntimeFailed,
                TerminationReason::InternalError,
                duration,
            )
        }
    }
}

pub(crate) struct BoundedStream {
    pub text: String,
    pub truncated: bool,
}

/// Cuts a captured stream at the output ceiling. Excess is dropped but the
/// cut is always flagged, never silent.
pub(crate) fn truncate_stream(bytes: &[u8], max_bytes: u64) -> BoundedStream {
    let max = max_bytes as usize;
    if bytes.len() > max {
        BoundedStream {
            text: String::from_utf8_lossy(&bytes[..max]).into_owned(),
            truncated: true,
        }
    } else {
        BoundedStream {
            text: String::from_utf8_lossy(bytes).into_owned(),
            truncated: false,
        }
    }
}

/// Maps the run-phase report onto the caller-facing record.
///
/// A breach always wins the recorded reason over the exit code, since it is
/// the signal that explains incomplete output; the exit code is still
/// reported where the process produced one on its own. Forced terminations
/// carry no exit code.
pub fn classify_run(report: RunReport, limits: &ExecutionLimits, duration: Duration) -> ResultRecord {
    let stdout = truncate_stream(&report.stdout, limits.max_output_bytes);
    let stderr = truncate_stream(&report.stderr, limits.max_output_bytes);
    let stdout_truncated = stdout.truncated || report.stdout_overflow;
    let stderr_truncated = stderr.truncated || report.stderr_overflow;
    let overflowed = stdout_truncated || stderr_truncated;

    let (phase, reason, exit_code) = match report.breach {
        Some(ResourceBreach::WallTime) | Some(ResourceBreach::CpuTime) => {
            (ExecutionPhase::TimedOut, TerminationReason::Timeout, None)
        }
        Some(ResourceBreach::Memory) => (
            ExecutionPhase::ResourceExceeded,
            TerminationReason::MemoryExceeded,
            report.exit_code,
        ),
        Some(ResourceBreach::Output) => (
            ExecutionPhase::ResourceExceeded,
            TerminationReason::OutputExceeded,
            report.exit_code,
        ),
        None if overflowed => (
            ExecutionPhase::ResourceExceeded,
            TerminationReason::OutputExceeded,
            report.exit_code,
        ),
        None => (
            ExecutionPhase::Completed,
            TerminationReason::Ok,
            report.exit_code,
        ),
    };

    ResultRecord {
        phase,
        exit_code,
        stdout: stdout.text,
        stderr: stderr.text,
        stdout_truncated,
        stderr_truncated,
        compile_diagnostics: None,
        duration_ms: duration.as_millis() as u64,
        termination_reason: reason,
        created_at: create_timestamp(),
    }
}
