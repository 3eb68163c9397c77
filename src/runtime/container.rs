use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Local;
use tokio_util::sync::CancellationToken;

use crate::config::{LanguageProfile, RunnerConfig};

use super::{
    KillSwitch, ResourceBreach, RunLimits, RunReport, SandboxError, SandboxHandle, SandboxRuntime,
    resolve_scratch_root, supervise_child,
};

// Mount point of the scratch region inside the container, matching the
// toolchain images' working directory
const GUEST_WORKDIR: &str = "/code";

// Exit codes the container engine uses for its own failures
const ENGINE_ERROR_EXIT: i32 = 125;

// Containers killed by the kernel memory controller exit with 128 + SIGKILL
const OOM_KILLED_EXIT: i32 = 137;

/// Runs each submission in a disposable container from the language's
/// toolchain image.
///
/// The scratch region is bind-mounted read-write at the image working
/// directory; the container runs with networking disabled, a memory ceiling,
/// a pids ceiling and the image's unprivileged user. Forced termination is a
/// container force-remove, which kills the entire process tree at once.
pub struct ContainerRuntime {
    scratch_root: PathBuf,
    session: String,
    next_id: AtomicU64,
    run_seq: AtomicU64,
}

impl ContainerRuntime {
    pub fn build(config: &RunnerConfig) -> Result<Self> {
        let scratch_root = resolve_scratch_root(config)?;
        let session = Local::now().format("%y%m%d%H%M%S").to_string();

        log::info!("ContainerRuntime initialized at {}", scratch_root.display());
        Ok(Self {
            scratch_root,
            session,
            next_id: AtomicU64::new(1),
            run_seq: AtomicU64::new(1),
        })
    }
}

#[async_trait]
impl SandboxRuntime for ContainerRuntime {
    fn create(&self, profile: &LanguageProfile) -> Result<SandboxHandle, SandboxError> {
        let image = profile.image.as_deref().ok_or_else(|| {
            SandboxError::creation(format!("Language {} has no sandbox image", profile.name))
        })?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let scratch = tempfile::Builder::new()
            .prefix(&format!("box-{id}-"))
            .tempdir_in(&self.scratch_root)
            .map_err(|e| SandboxError::creation(e.to_string()))?;

        let name = format!("coderunner-{}-{id}", self.session);
        log::debug!(
            "Sandbox {id} created at {} using image {image}",
            scratch.path().display()
        );
        Ok(SandboxHandle::new(id, scratch.path().to_path_buf())
            .with_container(name, image.to_string())
            .with_scratch_guard(scratch))
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
        let (Some(base_name), Some(image)) = (handle.container_name(), handle.image()) else {
            return Err(SandboxError::fault("Handle was not created for containers"));
        };

        // Unique per invocation so compile and run never collide
        let name = format!("{base_name}-{}", self.run_seq.fetch_add(1, Ordering::SeqCst));
        let memory_arg = limits.memory_bytes.to_string();
        let pids_arg = limits.processes.to_string();
        let nofile_arg = format!("nofile={}:{}", limits.open_files, limits.open_files);
        let cpu_secs = limits.cpu_time_ms.div_ceil(1000);
        let cpu_arg = format!("cpu={cpu_secs}:{cpu_secs}");
        let mount_arg = format!("{}:{GUEST_WORKDIR}", handle.scratch_dir().display());

        let mut cmd = tokio::process::Command::new("docker");
        cmd.args([
            "run",
            "--rm",
            "--name",
            &name,
            "-i",
            "--network",
            "none",
            "--memory",
            &memory_arg,
            "--memory-swap",
            &memory_arg,
            "--pids-limit",
            &pids_arg,
            "--ulimit",
            &nofile_arg,
            "--ulimit",
            &cpu_arg,
            "-v",
            &mount_arg,
            "-w",
            GUEST_WORKDIR,
            image,
        ])
        .args(command)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| SandboxError::fault(format!("Failed to spawn docker run: {e}")))?;

        log::debug!("Sandbox {} running {:?} in container {name}", handle.id(), command);
        let mut report =
            supervise_child(child, KillSwitch::Container(name.clone()), limits, stdin, cancel)
                .await?;

        match report.exit_code {
            Some(ENGINE_ERROR_EXIT) => {
                return Err(SandboxError::fault(format!(
                    "docker run failed: {}",
                    String::from_utf8_lossy(&report.stderr).trim()
                )));
            }
            Some(OOM_KILLED_EXIT) if report.breach.is_none() => {
                report.breach = Some(ResourceBreach::Memory);
            }
            _ => {}
        }

        Ok(report)
    }
}
