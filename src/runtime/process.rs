use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Local;
use tokio_util::sync::CancellationToken;

use crate::config::{LanguageProfile, RunnerConfig};

use super::{
    KillSwitch, RunLimits, RunReport, SandboxError, SandboxHandle, SandboxRuntime,
    resolve_scratch_root, supervise_child,
};

// Everything spawned inside a scratch region sees only this search path
const EXEC_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Runs submissions as plain child processes in disposable scratch
/// directories.
///
/// Each process tree gets its own session, pre-exec rlimits for cpu time,
/// address space and open files, and bounded output capture. There is no
/// namespace or filesystem isolation beyond the scratch directory, so this
/// runtime is for trusted or development hosts only.
pub struct ProcessRuntime {
    scratch_root: PathBuf,
    next_id: AtomicU64,
}

impl ProcessRuntime {
    pub fn build(config: &RunnerConfig) -> Result<Self> {
        let scratch_root = resolve_scratch_root(config)?;

        log::info!("ProcessRuntime initialized at {}", scratch_root.display());
        log::warn!(
            "ProcessRuntime provides NO security isolation - use only in trusted environments"
        );

        Ok(Self {
            scratch_root,
            next_id: AtomicU64::new(1),
        })
    }
}

#[async_trait]
impl SandboxRuntime for ProcessRuntime {
    fn create(&self, _profile: &LanguageProfile) -> Result<SandboxHandle, SandboxError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let stamp = Local::now().format("%y%m%d-%H%M%S");
        let scratch = tempfile::Builder::new()
            .prefix(&format!("box-{id}-{stamp}-"))
            .tempdir_in(&self.scratch_root)
            .map_err(|e| SandboxError::creation(e.to_string()))?;

        log::debug!("Sandbox {id} created at {}", scratch.path().display());
        Ok(SandboxHandle::new(id, scratch.path().to_path_buf()).with_scratch_guard(scratch))
    }

    async fn run(
        &self,
        handle: &SandboxHandle,
        command: &[String],
        stdin: Option<&[u8]>,
        limits: &RunLimits,
        cancel: &CancellationToken,
    ) -> Result<RunReport, SandboxError> {
        if command.is_empty() {
            return Err(SandboxError::fault("Empty command"));
        }

        let mut cmd = tokio::process::Command::new(&command[0]);
        cmd.args(&command[1..])
            .current_dir(handle.scratch_dir())
            .env_clear()
            .env("PATH", EXEC_PATH)
            .env("HOME", handle.scratch_dir())
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let cpu_secs = limits.cpu_time_ms.div_ceil(1000);
        let memory_bytes = limits.memory_bytes;
        let open_files = limits.open_files as u64;
        unsafe {
            cmd.pre_exec(move || {
                // New session: the whole tree shares one process group, so a
                // single killpg reaches every descendant
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                set_rlimit(libc::RLIMIT_CPU, cpu_secs)?;
                set_rlimit(libc::RLIMIT_AS, memory_bytes)?;
                set_rlimit(libc::RLIMIT_NOFILE, open_files)?;
                Ok(())
            });
        }

        let child = cmd
            .spawn()
            .map_err(|e| SandboxError::fault(format!("Failed to spawn {}: {e}", command[0])))?;

        // setsid makes the child the leader of a group with pgid == its pid
        let pgid = child.id().map(|pid| pid as i32).unwrap_or(0);

        log::debug!("Sandbox {} running {:?}", handle.id(), command);
        supervise_child(child, KillSwitch::ProcessGroup(pgid), limits, stdin, cancel).await
    }
}

fn set_rlimit(resource: libc::__rlimit_resource_t, value: u64) -> std::io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: value as libc::rlim_t,
        rlim_max: value as libc::rlim_t,
    };
    if unsafe { libc::setrlimit(resource, &limit) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}
