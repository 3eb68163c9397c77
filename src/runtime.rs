mod container;
mod process;

pub use container::ContainerRuntime;
pub use process::ProcessRuntime;

use std::error::Error;
use std::fmt::{self, Display};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::{LanguageProfile, RunnerConfig};

// Scratch root permissions
const SCRATCH_ROOT_PERMISSIONS: u32 = 0o700;

// How long a killed process tree is given to actually die before the run is
// reported as a collaborator fault
const KILL_GRACE_MS: u64 = 2_000;

/// Ceilings the runtime must enforce on one invoked process tree.
#[derive(Debug, Clone, Copy)]
pub struct RunLimits {
    pub cpu_time_ms: u64,
    pub wall_time_ms: u64,
    pub memory_bytes: u64,
    pub max_output_bytes: u64,
    pub processes: u32,
    pub open_files: u32,
}

/// A ceiling the runtime observed being breached before natural exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceBreach {
    WallTime,
    CpuTime,
    Memory,
    Output,
}

/// What one invocation inside the sandbox produced.
#[derive(Debug)]
pub struct RunReport {
    /// Exit code as reported by the process itself; signal deaths are encoded
    /// as 128 + signal number, forced terminations report none
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub duration: Duration,
    pub breach: Option<ResourceBreach>,
    pub stdout_overflow: bool,
    pub stderr_overflow: bool,
}

/// Collaborator-level failure of the sandbox runtime itself. Never caused by
/// user code; the only category a caller may reasonably retry.
#[derive(Debug)]
pub enum SandboxError {
    Creation(String),
    Write(String),
    Fault(String),
}

impl SandboxError {
    pub fn creation<M: Into<String>>(msg: M) -> Self {
        SandboxError::Creation(msg.into())
    }

    pub fn write<M: Into<String>>(msg: M) -> Self {
        SandboxError::Write(msg.into())
    }

    pub fn fault<M: Into<String>>(msg: M) -> Self {
        SandboxError::Fault(msg.into())
    }
}

impl Display for SandboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SandboxError::Creation(msg) => write!(f, "Sandbox creation failed: {msg}"),
            SandboxError::Write(msg) => write!(f, "Sandbox write failed: {msg}"),
            SandboxError::Fault(msg) => write!(f, "Sandbox fault: {msg}"),
        }
    }
}

impl Error for SandboxError {}

impl From<std::io::Error> for SandboxError {
    fn from(err: std::io::Error) -> Self {
        SandboxError::Fault(err.to_string())
    }
}

/// Opaque capability over one disposable isolated environment. A handle hosts
/// exactly one submission and is destroyed afterwards; it is never reused.
#[derive(Debug)]
pub struct SandboxHandle {
    id: u64,
    scratch_dir: PathBuf,
    container_name: Option<String>,
    image: Option<String>,
    scratch_guard: Option<TempDir>,
}

impl SandboxHandle {
    pub fn new(id: u64, scratch_dir: PathBuf) -> Self {
        Self {
            id,
            scratch_dir,
            container_name: None,
            image: None,
            scratch_guard: None,
        }
    }

    pub(crate) fn with_container(mut self, name: String, image: String) -> Self {
        self.container_name = Some(name);
        self.image = Some(image);
        self
    }

    pub(crate) fn with_scratch_guard(mut self, guard: TempDir) -> Self {
        self.scratch_guard = Some(guard);
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The sole writable filesystem area of this sandbox, host-side.
    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    pub(crate) fn container_name(&self) -> Option<&str> {
        self.container_name.as_deref()
    }

    pub(crate) fn image(&self) -> Option<&str> {
        self.image.as_deref()
    }

    pub(crate) fn into_parts(self) -> (u64, PathBuf, Option<TempDir>) {
        (self.id, self.scratch_dir, self.scratch_guard)
    }
}

/// The contract the execution driver consumes. One implementation per
/// isolation mechanism; the driver never looks behind it.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Provisions a fresh, empty, isolated environment for one submission.
    fn create(&self, profile: &LanguageProfile) -> Result<SandboxHandle, SandboxError>;

    /// Materializes one file inside the handle's scratch region.
    fn write_file(
        &self,
        handle: &SandboxHandle,
        path: &str,
        bytes: &[u8],
    ) -> Result<(), SandboxError> {
        let target = resolve_in_scratch(handle, path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| SandboxError::write(e.to_string()))?;
        }
        fs::write(&target, bytes).map_err(|e| SandboxError::write(e.to_string()))
    }

    /// Runs one command inside the sandbox under the given ceilings,
    /// capturing bounded output. Must terminate the whole process tree, never
    /// just the leader, on breach, cancellation or demand.
    async fn run(
        &self,
        handle: &SandboxHandle,
        command: &[String],
        stdin: Option<&[u8]>,
        limits: &RunLimits,
        cancel: &CancellationToken,
    ) -> Result<RunReport, SandboxError>;

    /// Tears the environment down and wipes its scratch region. Always safe;
    /// failures are logged, never surfaced over an existing result.
    fn destroy(&self, handle: SandboxHandle) {
        let (id, scratch_dir, guard) = handle.into_parts();
        match guard {
            Some(guard) => {
                if let Err(e) = guard.close() {
                    log::error!("Sandbox {id} scratch cleanup failed: {e}");
                } else {
                    log::debug!("Sandbox {id} destroyed");
                }
            }
            None => {
                if scratch_dir.exists() {
                    if let Err(e) = fs::remove_dir_all(&scratch_dir) {
                        log::error!("Sandbox {id} scratch cleanup failed: {e}");
                    }
                }
            }
        }
    }
}

/// Picks the strongest isolation available on this host: container-backed
/// when a docker client responds, plain processes otherwise.
pub fn create_sandbox_runtime(config: &RunnerConfig) -> Result<Box<dyn SandboxRuntime>> {
    let docker_available = std::process::Command::new("docker")
        .arg("--version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false);

    if docker_available {
        log::info!("Creating ContainerRuntime (container isolation)");
        Ok(Box::new(ContainerRuntime::build(config)?))
    } else {
        log::info!("Creating ProcessRuntime (no container isolation)");
        Ok(Box::new(ProcessRuntime::build(config)?))
    }
}

/// Resolves the host directory scratch regions live under, creating it with
/// owner-only permissions.
pub(crate) fn resolve_scratch_root(config: &RunnerConfig) -> Result<PathBuf> {
    let root = match &config.scratch_root {
        Some(root) => root.clone(),
        None => {
            use directories::ProjectDirs;
            let proj_dirs = ProjectDirs::from("", "", "coderunner")
                .ok_or_else(|| anyhow!("Unable to find user directory"))?;
            proj_dirs.cache_dir().join("scratch")
        }
    };

    fs::create_dir_all(&root)?;
    fs::set_permissions(&root, fs::Permissions::from_mode(SCRATCH_ROOT_PERMISSIONS))?;
    Ok(root)
}

/// Maps a submission-relative path into the handle's scratch region,
/// rejecting anything that could step outside it.
pub(crate) fn resolve_in_scratch(
    handle: &SandboxHandle,
    path: &str,
) -> Result<PathBuf, SandboxError> {
    let rel = Path::new(path);
    let safe = !path.is_empty()
        && rel.is_relative()
        && rel.components().all(|c| matches!(c, Component::Normal(_)));
    if !safe {
        return Err(SandboxError::write(format!(
            "Refusing path outside the scratch region: {path}"
        )));
    }
    Ok(handle.scratch_dir().join(rel))
}

/// How a supervised process tree is force-terminated.
pub(crate) enum KillSwitch {
    /// SIGKILL to the whole process group (the child runs in its own session)
    ProcessGroup(i32),
    /// Force-remove of the named container
    Container(String),
}

impl KillSwitch {
    fn fire(&self) {
        match self {
            KillSwitch::ProcessGroup(pgid) => {
                if *pgid > 0 {
                    log::debug!("Killing process group {pgid}");
                    unsafe {
                        libc::killpg(*pgid, libc::SIGKILL);
                    }
                }
            }
            KillSwitch::Container(name) => {
                log::debug!("Force-removing container {name}");
                let _ = std::process::Command::new("docker")
                    .args(["rm", "-f", name])
                    .output();
            }
        }
    }
}

/// Shared supervision loop for a spawned child: feeds stdin, captures bounded
/// output, enforces the wall-clock deadline, honors cancellation, and fires
/// the kill switch on any breach.
pub(crate) async fn supervise_child(
    mut child: tokio::process::Child,
    kill: KillSwitch,
    limits: &RunLimits,
    stdin: Option<&[u8]>,
    cancel: &CancellationToken,
) -> Result<RunReport, SandboxError> {
    let started = Instant::now();
    let cap = limits.max_output_bytes as usize;

    if let Some(mut sink) = child.stdin.take() {
        let bytes = stdin.unwrap_or_default().to_vec();
        tokio::spawn(async move {
            let _ = sink.write_all(&bytes).await;
            let _ = sink.shutdown().await;
        });
    }

    let (overflow_tx, mut overflow_rx) = mpsc::channel::<()>(2);
    let stdout_task = child
        .stdout
        .take()
        .map(|r| tokio::spawn(read_capped(r, cap, overflow_tx.clone())));
    let stderr_task = child
        .stderr
        .take()
        .map(|r| tokio::spawn(read_capped(r, cap, overflow_tx.clone())));
    drop(overflow_tx);

    let mut breach: Option<ResourceBreach> = None;
    let mut status = None;

    {
        let wait_fut = child.wait();
        tokio::pin!(wait_fut);

        tokio::select! {
            res = wait_fut.as_mut() => {
                status = Some(res.map_err(|e| SandboxError::fault(format!("wait failed: {e}")))?);
            }
            _ = tokio::time::sleep(Duration::from_millis(limits.wall_time_ms)) => {
                log::info!("Wall-clock deadline of {}ms elapsed, terminating", limits.wall_time_ms);
                breach = Some(ResourceBreach::WallTime);
                kill.fire();
            }
            _ = cancel.cancelled() => {
                log::info!("Cancellation requested, terminating");
                breach = Some(ResourceBreach::WallTime);
                kill.fire();
            }
            Some(_) = overflow_rx.recv() => {
                log::info!("Output ceiling of {} bytes breached, terminating", limits.max_output_bytes);
                breach = Some(ResourceBreach::Output);
                kill.fire();
            }
        }

        if status.is_none() {
            match timeout(Duration::from_millis(KILL_GRACE_MS), wait_fut.as_mut()).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    return Err(SandboxError::fault(format!("wait after kill failed: {e}")));
                }
                Err(_) => {
                    return Err(SandboxError::fault(
                        "sandboxed process survived forced termination",
                    ));
                }
            }
        } else if let KillSwitch::ProcessGroup(_) = kill {
            // The leader can exit while grandchildren in its group hold the
            // pipes open; a container exit already tears the whole tree down
            kill.fire();
        }
    }

    let (stdout, stdout_overflow) = collect_stream(stdout_task).await;
    let (stderr, stderr_overflow) = collect_stream(stderr_task).await;

    if breach.is_none() && (stdout_overflow || stderr_overflow) {
        breach = Some(ResourceBreach::Output);
    }

    let exit_code = status.and_then(|s| {
        use std::os::unix::process::ExitStatusExt;
        s.code().or_else(|| s.signal().map(|sig| 128 + sig))
    });

    // The kernel delivers SIGXCPU once the cpu-time rlimit is spent
    if breach.is_none() && exit_code == Some(128 + libc::SIGXCPU) {
        breach = Some(ResourceBreach::CpuTime);
    }

    Ok(RunReport {
        exit_code,
        stdout,
        stderr,
        duration: started.elapsed(),
        breach,
        stdout_overflow,
        stderr_overflow,
    })
}

async fn collect_stream(
    task: Option<tokio::task::JoinHandle<(Vec<u8>, bool)>>,
) -> (Vec<u8>, bool) {
    match task {
        Some(task) => match timeout(Duration::from_millis(KILL_GRACE_MS), task).await {
            Ok(Ok(captured)) => captured,
            _ => (Vec::new(), false),
        },
        None => (Vec::new(), false),
    }
}

/// Reads a stream up to `cap` bytes, signalling overflow once and draining
/// the rest so the child never blocks on a full pipe.
async fn read_capped<R: tokio::io::AsyncRead + Unpin>(
    mut reader: R,
    cap: usize,
    overflow: mpsc::Sender<()>,
) -> (Vec<u8>, bool) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    let mut overflowed = false;

    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                if overflowed {
                    continue;
                }
                if buf.len() + n > cap {
                    let keep = cap.saturating_sub(buf.len());
                    buf.extend_from_slice(&chunk[..keep]);
                    overflowed = true;
                    let _ = overflow.send(()).await;
                } else {
                    buf.extend_from_slice(&chunk[..n]);
                }
            }
            Err(_) => break,
        }
    }

    (buf, overflowed)
}
