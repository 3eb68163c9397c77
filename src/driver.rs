use std::collections::HashMap;
use std::time::Instant;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::config::{CompileLimits, LanguageCatalogue, LanguageProfile, RunnerConfig, apply_template};
use crate::record::{ExecutionPhase, ResultRecord, TerminationReason, classify_run};
use crate::runtime::{
    ResourceBreach, RunLimits, SandboxError, SandboxHandle, SandboxRuntime, create_sandbox_runtime,
};
use crate::submission::{ExecutionLimits, SubmissionBundle, SubmissionError, validate_bundle};

// Name the build step's artifact is written under
const ARTIFACT_NAME: &str = "main";

// Run-phase process tree ceilings
const RUN_PROCESSES: u32 = 64;
const RUN_OPEN_FILES: u32 = 256;

/// Drives one submission at a time through materialize, compile and run
/// inside a disposable sandbox, and produces exactly one result record per
/// call.
///
/// The driver owns no state that outlives a call: every submission gets a
/// fresh handle, and concurrent calls on the same driver share nothing but
/// the runtime and the catalogue.
pub struct ExecutionDriver {
    runtime: Box<dyn SandboxRuntime>,
    catalogue: LanguageCatalogue,
    compile: CompileLimits,
    default_limits: ExecutionLimits,
}

impl ExecutionDriver {
    /// Builds a driver over an explicit runtime implementation.
    pub fn new(runtime: Box<dyn SandboxRuntime>, config: &RunnerConfig) -> Self {
        let mut catalogue = LanguageCatalogue::builtin();
        catalogue.extend(&config.languages);

        Self {
            runtime,
            catalogue,
            compile: config.compile.clone(),
            default_limits: config.default_limits,
        }
    }

    /// Builds a driver over the strongest runtime available on this host.
    pub fn from_config(config: &RunnerConfig) -> Result<Self> {
        let runtime = create_sandbox_runtime(config)?;
        Ok(Self::new(runtime, config))
    }

    pub fn catalogue(&self) -> &LanguageCatalogue {
        &self.catalogue
    }

    /// Runs one submission to a terminal phase.
    ///
    /// A malformed bundle is rejected before any sandbox is created; every
    /// later failure is classified into the returned record instead, with
    /// collaborator faults reported as internal errors distinct from
    /// user-code failures.
    pub async fn execute(&self, bundle: &SubmissionBundle) -> Result<ResultRecord, SubmissionError> {
        self.execute_cancellable(bundle, &CancellationToken::new())
            .await
    }

    /// Like [`execute`](Self::execute), but the caller may abort the
    /// submission at any point. Cancellation forces sandbox teardown the same
    /// way a wall-clock timeout does.
    pub async fn execute_cancellable(
        &self,
        bundle: &SubmissionBundle,
        cancel: &CancellationToken,
    ) -> Result<ResultRecord, SubmissionError> {
        let profile = self
            .catalogue
            .resolve(&bundle.language)
            .ok_or_else(|| SubmissionError::UnknownLanguage(bundle.language.clone()))?;
        let limits = bundle.limits.unwrap_or(self.default_limits);
        validate_bundle(bundle, profile, &limits)?;

        let started = Instant::now();
        log::info!(
            "Executing {} submission ({} files)",
            profile.name,
            bundle.source_files.len()
        );

        let record = match self.drive(bundle, profile, &limits, cancel, started).await {
            Ok(record) => record,
            Err(fault) => {
                log::error!("Submission failed on a sandbox fault: {fault}");
                ResultRecord::internal_error(fault.to_string(), started.elapsed())
            }
        };

        log::info!(
            "Submission finished: {} after {}ms",
            record.termination_reason.as_str(),
            record.duration_ms
        );
        Ok(record)
    }

    /// The forward-only phase machine. Sandbox faults bubble up as errors and
    /// are folded into an internal-error record by the caller; teardown is
    /// guaranteed by the guard on every path out.
    async fn drive(
        &self,
        bundle: &SubmissionBundle,
        profile: &LanguageProfile,
        limits: &ExecutionLimits,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<ResultRecord, SandboxError> {
        let guard = SandboxGuard::acquire(self.runtime.as_ref(), profile)?;

        for file in &bundle.source_files {
            self.runtime
                .write_file(guard.handle(), &file.path, file.content.as_bytes())?;
        }
        log::debug!(
            "Sandbox {}: materialized {} files",
            guard.handle().id(),
            bundle.source_files.len()
        );

        if let Some(template) = &profile.compile_command {
            let command = render_command(template, profile);
            let compile_limits = RunLimits {
                cpu_time_ms: limits.cpu_time_ms,
                wall_time_ms: self.compile.wall_time_ms,
                memory_bytes: limits.memory_bytes,
                max_output_bytes: self.compile.max_output_bytes,
                processes: self.compile.processes,
                open_files: self.compile.open_files,
            };

            let report = self
                .runtime
                .run(guard.handle(), &command, None, &compile_limits, cancel)
                .await?;

            let diagnostics = compiler_diagnostics(&report.stdout, &report.stderr);
            match report.breach {
                Some(ResourceBreach::WallTime) | Some(ResourceBreach::CpuTime) => {
                    return Ok(ResultRecord::compile_aborted(
                        ExecutionPhase::TimedOut,
                        TerminationReason::Timeout,
                        diagnostics,
                        started.elapsed(),
                    ));
                }
                Some(ResourceBreach::Memory) => {
                    return Ok(ResultRecord::compile_aborted(
                        ExecutionPhase::ResourceExceeded,
                        TerminationReason::MemoryExceeded,
                        diagnostics,
                        started.elapsed(),
                    ));
                }
                _ => {}
            }
            if report.exit_code != Some(0) {
                log::debug!(
                    "Sandbox {}: build step rejected the source",
                    guard.handle().id()
                );
                return Ok(ResultRecord::compile_failed(diagnostics, started.elapsed()));
            }
        }

        let command = render_command(&profile.run_command, profile);
        let run_limits = RunLimits {
            cpu_time_ms: limits.cpu_time_ms,
            wall_time_ms: limits.wall_time_ms,
            memory_bytes: limits.memory_bytes,
            max_output_bytes: limits.max_output_bytes,
            processes: RUN_PROCESSES,
            open_files: RUN_OPEN_FILES,
        };

        let report = self
            .runtime
            .run(
                guard.handle(),
                &command,
                bundle.stdin.as_deref().map(str::as_bytes),
                &run_limits,
                cancel,
            )
            .await?;

        Ok(classify_run(report, limits, started.elapsed()))
    }
}

/// Scoped ownership of one sandbox. Dropping the guard destroys the handle,
/// so teardown runs on success, every failure branch and unwinds alike.
struct SandboxGuard<'a> {
    runtime: &'a dyn SandboxRuntime,
    handle: Option<SandboxHandle>,
}

impl<'a> SandboxGuard<'a> {
    fn acquire(
        runtime: &'a dyn SandboxRuntime,
        profile: &LanguageProfile,
    ) -> Result<Self, SandboxError> {
        let handle = runtime.create(profile)?;
        Ok(Self {
            runtime,
            handle: Some(handle),
        })
    }

    fn handle(&self) -> &SandboxHandle {
        self.handle.as_ref().expect("guard holds a handle until drop")
    }
}

impl Drop for SandboxGuard<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.runtime.destroy(handle);
        }
    }
}

fn render_command(template: &[String], profile: &LanguageProfile) -> Vec<String> {
    let stem = profile
        .entry_file
        .rsplit_once('.')
        .map_or(profile.entry_file.as_str(), |(stem, _)| stem);

    let mut mapping = HashMap::<&str, &str>::new();
    mapping.insert("%INPUT%", &profile.entry_file);
    mapping.insert("%OUTPUT%", ARTIFACT_NAME);
    mapping.insert("%MAIN%", stem);
    apply_template(template, &mapping)
}

/// The compiler's own stream, verbatim. Compilers that report on stdout
/// instead of stderr are covered by concatenation order stderr-first.
fn compiler_diagnostics(stdout: &[u8], stderr: &[u8]) -> String {
    let err = String::from_utf8_lossy(stderr);
    if stdout.is_empty() {
        return err.into_owned();
    }
    let out = String::from_utf8_lossy(stdout);
    if err.is_empty() {
        return out.into_owned();
    }
    format!("{err}{out}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LanguageCatalogue;

    #[test]
    fn test_render_command_substitutes_placeholders() {
        let catalogue = LanguageCatalogue::builtin();
        let java = catalogue.resolve("java").unwrap();
        assert_eq!(
            render_command(java.compile_command.as_ref().unwrap(), java),
            vec!["javac", "Solution.java"]
        );
        assert_eq!(render_command(&java.run_command, java), vec!["java", "Solution"]);

        let cpp = catalogue.resolve("cpp").unwrap();
        assert_eq!(
            render_command(cpp.compile_command.as_ref().unwrap(), cpp),
            vec!["g++", "-O2", "-o", "main", "solution.cpp"]
        );
        assert_eq!(render_command(&cpp.run_command, cpp), vec!["./main"]);
    }

    #[test]
    fn test_compiler_diagnostics_prefers_stderr_order() {
        assert_eq!(compiler_diagnostics(b"", b"boom"), "boom");
        assert_eq!(compiler_diagnostics(b"note", b""), "note");
        assert_eq!(compiler_diagnostics(b"note", b"boom"), "boomnote");
    }
}
