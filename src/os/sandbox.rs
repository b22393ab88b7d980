//! Isolated worker execution.
//!
//! One worker process per job, launched through `tokio::process::Command`
//! with a `pre_exec` hook that runs in the child between fork and exec, so
//! every restriction is in place before the worker's first instruction:
//!
//! - **Parent death signal**: the worker dies with the server
//! - **cgroup v2** (when `cgroup_root` is delegated): `memory.max` and
//!   `cpu.max` are written by the parent, the child joins before exec
//! - **Namespaces**: unprivileged user namespace with a random uid/gid
//!   mapping, then network (no interfaces but a down loopback), IPC, UTS
//!   and mount namespaces
//! - **Scratch**: a private tmpfs mounted over the workspace scratch
//!   directory with `noexec,nosuid,nodev` and a size cap
//! - **Resource limits via setrlimit**: FSIZE, CORE, NOFILE, LOCKS,
//!   SIGPENDING, MSGQUEUE, STACK, and AS/DATA when no cgroup carries the
//!   memory ceiling
//! - **Capability dropping**: Effective, Permitted and Inheritable sets cleared
//! - **Landlock** (ABI V6): read/execute beneath `read_paths`, read/write but
//!   never execute beneath the scratch directory, nothing else; signals and
//!   abstract Unix sockets scoped to the sandbox
//!
//! With `require_sandbox` unset, a missing kernel feature degrades isolation
//! instead of failing the job. With it set, any missing guarantee makes the
//! spawn fail, which is reported as a start failure.
//!
//! ## I/O Handling
//!
//! - stdin receives the whole input file, then EOF
//! - stdout is pumped in 8 KiB chunks into a bounded channel; when the
//!   consumer stops receiving, the pump stops reading, the pipe fills and
//!   the worker blocks on write
//! - stderr goes to a bounded `Sluice`

use std::ffi::CString;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use landlock::{Access as _, RulesetAttr as _, RulesetCreatedAttr as _};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

use crate::error::JobError;
use crate::prelude::RwArc;

use super::{Sluice, Workspace};

const CHUNK_SIZE: usize = 8192;
const CPU_PERIOD_US: u64 = 100_000;
const WORKER_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
/// Device nodes the worker may open besides `read_paths`
const DEVICE_PATHS: &[&str] = &["/dev/null", "/dev/zero", "/dev/urandom"];

/// Per-run resource ceilings
#[derive(Debug, Clone)]
pub struct SandboxLimits {
    pub ram_kb: u64,
    /// Share of one CPU, e.g. 0.5
    pub cpu_fraction: f64,
    pub scratch_kb: u64,
    pub wall_time_secs: u64,
    /// Bytes of stderr kept for failure reports
    pub diagnostics_capacity: usize,
    /// Output chunks in flight between the worker and the sink
    pub output_queue_depth: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            ram_kb: 512 * 1024,
            cpu_fraction: 0.5,
            scratch_kb: 128 * 1024,
            wall_time_secs: 300,
            diagnostics_capacity: 64 * 1024,
            output_queue_depth: 8,
        }
    }
}

/// How a worker run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    /// Exit code, or 128 + signal number when killed by a signal
    pub exit_code: Option<i32>,
    pub killed_by_timeout: bool,
}

impl WorkerExit {
    pub fn success(&self) -> bool {
        !self.killed_by_timeout && self.exit_code == Some(0)
    }
}

/// Channels of one running worker
pub struct SandboxHandle {
    pub pid: i32,
    /// Worker stdout, closed at EOF
    pub output: mpsc::Receiver<Bytes>,
    pub diagnostics: RwArc<Sluice>,
    /// Resolves once the worker has exited and stderr is drained
    pub exit: JoinHandle<WorkerExit>,
}

/// Worker launch configuration, shared by every job
#[derive(Debug, Clone)]
pub struct Sandbox {
    /// argv of the worker; the first element is resolved against `PATH`
    pub command: Vec<String>,
    pub limits: SandboxLimits,
    pub read_paths: Vec<PathBuf>,
    /// Delegated cgroup v2 directory for per-job memory and CPU quotas
    pub cgroup_root: Option<PathBuf>,
    pub require_sandbox: bool,
}

impl Sandbox {
    /// Launch the worker on a workspace's input
    pub async fn spawn(&self, ws: &Workspace) -> Result<SandboxHandle, JobError> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(JobError::SandboxStart("no worker command configured".to_string()));
        };

        let input = tokio::fs::read(&ws.input_path).await
            .map_err(|e| JobError::Workspace(format!("Failed to read input file: {}", e)))?;

        let cgroup = self.prepare_cgroup(&ws.job_id).await?;
        let plan = IsolationPlan::new(self, ws, cgroup.as_deref())
            .map_err(|e| JobError::SandboxStart(format!("invalid sandbox path: {}", e)))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .env_clear()
            .env("PATH", WORKER_PATH)
            .env("HOME", &ws.scratch_dir)
            .env("TMPDIR", &ws.scratch_dir)
            .env("LANG", "C.UTF-8")
            .env("SCRUBBOX_JOB_ID", &ws.job_id)
            .env("SCRUBBOX_INPUT_FORMAT", ws.output_kind.extension())
            .current_dir(&ws.scratch_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        // SAFETY: the hook only issues syscalls and touches memory prepared
        // before fork; it never takes a lock shared with other threads.
        unsafe {
            cmd.pre_exec(move || plan.apply());
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                if let Some(dir) = &cgroup {
                    remove_cgroup(dir).await;
                }
                tracing::warn!(job_id = %ws.job_id, program = %program, error = %e, "Worker failed to start");
                return Err(JobError::SandboxStart(e.to_string()));
            }
        };
        let pid = child.id().map(|p| p as i32).unwrap_or(0);
        tracing::debug!(job_id = %ws.job_id, pid, cgroup = ?cgroup, "Worker started");

        let (Some(mut stdin), Some(mut stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(JobError::SandboxStart("worker stdio was not captured".to_string()));
        };

        let job_id = ws.job_id.clone();
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(&input).await {
                // A worker that exits without reading is judged by its exit code
                tracing::debug!(job_id = %job_id, error = %e, "Worker closed stdin early");
            }
            // Dropping stdin delivers EOF
        });

        let (tx, output) = mpsc::channel(self.limits.output_queue_depth.max(1));
        tokio::spawn(async move {
            let mut buf = vec![0u8; CHUNK_SIZE];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let diagnostics = Arc::new(RwLock::new(Sluice::new(self.limits.diagnostics_capacity)));
        let stderr_task = spawn_diagnostics_reader(stderr, diagnostics.clone(), ws.job_id.clone());

        let wall_time = Duration::from_secs(self.limits.wall_time_secs);
        let job_id = ws.job_id.clone();
        let exit = tokio::spawn(async move {
            let mut killed_by_timeout = false;
            let status = match tokio::time::timeout(wall_time, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    tracing::warn!(job_id = %job_id, pid, wall_time_secs = wall_time.as_secs(), "Wall time exceeded, killing worker");
                    killed_by_timeout = true;
                    if pid > 0 {
                        // The worker leads its own process group
                        unsafe {
                            libc::kill(-pid, libc::SIGKILL);
                        }
                    }
                    child.wait().await
                }
            };

            let exit_code = match status {
                Ok(status) => status.code().or_else(|| status.signal().map(|sig| 128 + sig)),
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "Failed to wait for worker");
                    None
                }
            };

            let _ = stderr_task.await;
            if let Some(dir) = &cgroup {
                remove_cgroup(dir).await;
            }

            WorkerExit { exit_code, killed_by_timeout }
        });

        Ok(SandboxHandle { pid, output, diagnostics, exit })
    }

    /// Create the per-job cgroup and write its quotas
    async fn prepare_cgroup(&self, job_id: &str) -> Result<Option<PathBuf>, JobError> {
        let Some(root) = &self.cgroup_root else {
            if self.require_sandbox {
                return Err(JobError::SandboxStart(
                    "a delegated cgroup_root is required for memory and CPU quotas".to_string(),
                ));
            }
            return Ok(None);
        };

        let dir = root.join(format!("scrubbox-{}", job_id));
        let quota = ((self.limits.cpu_fraction * CPU_PERIOD_US as f64) as u64).max(1000);
        let result = async {
            tokio::fs::create_dir(&dir).await?;
            tokio::fs::write(dir.join("memory.max"), (self.limits.ram_kb << 10).to_string()).await?;
            tokio::fs::write(dir.join("cpu.max"), format!("{} {}", quota, CPU_PERIOD_US)).await?;
            // Not every kernel exposes swap accounting
            let _ = tokio::fs::write(dir.join("memory.swap.max"), "0").await;
            io::Result::Ok(())
        }.await;

        match result {
            Ok(()) => Ok(Some(dir)),
            Err(e) => {
                remove_cgroup(&dir).await;
                if self.require_sandbox {
                    Err(JobError::SandboxStart(format!("cgroup setup failed: {}", e)))
                } else {
                    tracing::warn!(job_id = %job_id, error = %e, "cgroup setup failed, continuing without memory and CPU quotas");
                    Ok(None)
                }
            }
        }
    }
}

async fn remove_cgroup(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir(dir).await {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::debug!(cgroup = ?dir, error = %e, "Failed to remove cgroup");
        }
    }
}

fn spawn_diagnostics_reader(
    mut stderr: tokio::process::ChildStderr,
    buffer: RwArc<Sluice>,
    job_id: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            match stderr.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    buffer.write().await.append(&buf[..n]);
                }
            }
        }
        let dropped = buffer.read().await.dropped();
        if dropped > 0 {
            tracing::warn!(job_id = %job_id, dropped, "Worker diagnostics exceeded capacity, truncated");
        }
    })
}

/// Everything the child needs, computed before fork
struct IsolationPlan {
    require: bool,
    cgroup_procs: Option<CString>,
    uid_map: String,
    gid_map: String,
    scratch: CString,
    scratch_path: PathBuf,
    tmpfs_options: CString,
    read_dirs: Vec<PathBuf>,
    read_files: Vec<PathBuf>,
    devices: Vec<PathBuf>,
    scratch_bytes: u64,
    /// Address-space ceiling, only when no cgroup carries the memory limit
    ram_bytes: Option<u64>,
}

fn denied(what: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::PermissionDenied,
        format!("{} required but unavailable: {}", what, io::Error::last_os_error()),
    )
}

impl IsolationPlan {
    fn new(sandbox: &Sandbox, ws: &Workspace, cgroup: Option<&Path>) -> Result<Self, std::ffi::NulError> {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        // Stay under INT32_MAX, some runtimes treat uid_t as signed
        let inside_uid: u32 = rng.gen_range(0x10000..0x7FFFFFFF);
        let inside_gid: u32 = rng.gen_range(0x10000..0x7FFFFFFF);
        let outside_uid = unsafe { libc::getuid() };
        let outside_gid = unsafe { libc::getgid() };

        let limits = &sandbox.limits;

        let (read_dirs, read_files): (Vec<PathBuf>, Vec<PathBuf>) = sandbox.read_paths.iter()
            .filter(|p| p.exists())
            .cloned()
            .partition(|p| p.is_dir());
        let devices = DEVICE_PATHS.iter()
            .map(PathBuf::from)
            .filter(|p| p.exists())
            .collect();

        Ok(Self {
            require: sandbox.require_sandbox,
            cgroup_procs: cgroup
                .map(|dir| CString::new(dir.join("cgroup.procs").to_string_lossy().as_bytes()))
                .transpose()?,
            uid_map: format!("{} {} 1\n", inside_uid, outside_uid),
            gid_map: format!("{} {} 1\n", inside_gid, outside_gid),
            scratch: CString::new(ws.scratch_dir.to_string_lossy().as_bytes())?,
            scratch_path: ws.scratch_dir.clone(),
            tmpfs_options: CString::new(format!("size={}k,mode=0700", limits.scratch_kb))?,
            read_dirs,
            read_files,
            devices,
            scratch_bytes: limits.scratch_kb << 10,
            ram_bytes: cgroup.is_none().then_some(limits.ram_kb << 10),
        })
    }

    /// Runs in the forked child. No logging here: the worker's stderr is
    /// already attached and belongs to the job's diagnostics.
    fn apply(&self) -> io::Result<()> {
        unsafe {
            libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL);
        }

        if let Some(procs) = &self.cgroup_procs {
            if !unsafe { write_proc_file(procs.as_bytes_with_nul(), b"0\n") } && self.require {
                return Err(denied("cgroup membership"));
            }
        }

        let isolated = self.enter_namespaces()?;
        if isolated {
            self.mount_scratch()?;
        }

        self.set_rlimits();

        for set in [caps::CapSet::Effective, caps::CapSet::Permitted, caps::CapSet::Inheritable] {
            if caps::clear(None, set).is_err() && self.require {
                return Err(denied("capability drop"));
            }
        }

        if let Err(e) = self.restrict_filesystem() {
            if self.require {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, format!("landlock required but unavailable: {}", e)));
            }
        }
        Ok(())
    }

    fn set_rlimits(&self) {
        let ram = self.ram_bytes.unwrap_or(libc::RLIM_INFINITY);
        let limits = [
            (libc::RLIMIT_AS, ram),
            (libc::RLIMIT_DATA, ram),
            (libc::RLIMIT_FSIZE, self.scratch_bytes),
            (libc::RLIMIT_STACK, 8 << 20),
            (libc::RLIMIT_CORE, 0),
            // The following are somewhat arbitrary limits
            (libc::RLIMIT_NOFILE, 256),
            (libc::RLIMIT_LOCKS, 256),
            (libc::RLIMIT_SIGPENDING, 64),
            (libc::RLIMIT_MSGQUEUE, 0),
        ];

        for &(resource, value) in &limits {
            let limit = libc::rlimit {
                rlim_cur: value,
                rlim_max: value,
            };
            unsafe {
                libc::setrlimit(resource, &limit);
            }
        }
    }

    /// Returns true when the mount namespace was entered
    fn enter_namespaces(&self) -> io::Result<bool> {
        if unsafe { libc::unshare(libc::CLONE_NEWUSER) } != 0 {
            if self.require {
                return Err(denied("user namespace"));
            }
            return Ok(false);
        }

        unsafe {
            write_proc_file(b"/proc/self/setgroups\0", b"deny\n");
            let mapped = write_proc_file(b"/proc/self/uid_map\0", self.uid_map.as_bytes())
                & write_proc_file(b"/proc/self/gid_map\0", self.gid_map.as_bytes());
            if !mapped && self.require {
                return Err(denied("uid/gid mapping"));
            }
        }

        let flags = libc::CLONE_NEWNET | libc::CLONE_NEWIPC | libc::CLONE_NEWUTS | libc::CLONE_NEWNS;
        if unsafe { libc::unshare(flags) } != 0 {
            if self.require {
                return Err(denied("network namespace"));
            }
            return Ok(false);
        }
        Ok(true)
    }

    fn mount_scratch(&self) -> io::Result<()> {
        unsafe {
            let root = b"/\0".as_ptr() as *const libc::c_char;
            let none = b"none\0".as_ptr() as *const libc::c_char;
            let tmpfs = b"tmpfs\0".as_ptr() as *const libc::c_char;

            if libc::mount(none, root, std::ptr::null(), libc::MS_REC | libc::MS_PRIVATE, std::ptr::null()) != 0 {
                return if self.require { Err(denied("private mount propagation")) } else { Ok(()) };
            }
            let flags = libc::MS_NOEXEC | libc::MS_NOSUID | libc::MS_NODEV;
            if libc::mount(tmpfs, self.scratch.as_ptr(), tmpfs, flags, self.tmpfs_options.as_ptr() as *const libc::c_void) != 0 {
                return if self.require { Err(denied("scratch tmpfs")) } else { Ok(()) };
            }
            // The cwd still points below the mount; re-enter to see the tmpfs
            if libc::chdir(self.scratch.as_ptr()) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    fn restrict_filesystem(&self) -> anyhow::Result<()> {
        let abi = landlock::ABI::V6;
        let read = landlock::AccessFs::from_read(abi);
        let read_file = landlock::AccessFs::from_read(abi) & landlock::AccessFs::from_file(abi);
        let device = landlock::AccessFs::ReadFile | landlock::AccessFs::WriteFile;
        let mut scratch_access = landlock::AccessFs::from_all(abi);
        scratch_access.remove(landlock::AccessFs::Execute);

        let mut created = landlock::Ruleset::default()
            .handle_access(landlock::AccessFs::from_all(abi))?
            .scope(landlock::Scope::Signal)?
            .scope(landlock::Scope::AbstractUnixSocket)?
            .create()?;

        for dir in &self.read_dirs {
            if let Ok(fd) = landlock::PathFd::new(dir) {
                created = created.add_rule(landlock::PathBeneath::new(fd, read))?;
            }
        }
        for file in &self.read_files {
            if let Ok(fd) = landlock::PathFd::new(file) {
                created = created.add_rule(landlock::PathBeneath::new(fd, read_file))?;
            }
        }
        for dev in &self.devices {
            if let Ok(fd) = landlock::PathFd::new(dev) {
                created = created.add_rule(landlock::PathBeneath::new(fd, device))?;
            }
        }
        created = created.add_rule(landlock::PathBeneath::new(landlock::PathFd::new(&self.scratch_path)?, scratch_access))?;

        created.restrict_self()?;
        Ok(())
    }
}

/// Write to a proc/cgroup file using raw syscalls.
/// `path` must be NUL-terminated. Returns true on success.
unsafe fn write_proc_file(path: &[u8], data: &[u8]) -> bool {
    unsafe {
        let fd = libc::open(path.as_ptr() as *const libc::c_char, libc::O_WRONLY | libc::O_CLOEXEC);
        if fd < 0 {
            return false;
        }
        let written = libc::write(fd, data.as_ptr() as *const libc::c_void, data.len());
        libc::close(fd);
        written == data.len() as isize
    }
}

#[cfg(test)]
impl Sandbox {
    /// Permissive sandbox around a stub worker such as `cat`
    pub(crate) fn stub(command: &[&str]) -> Self {
        Self {
            command: command.iter().map(|s| s.to_string()).collect(),
            limits: SandboxLimits { wall_time_secs: 10, ..SandboxLimits::default() },
            read_paths: ["/usr", "/lib", "/lib64", "/bin", "/etc"].iter().map(PathBuf::from).collect(),
            cgroup_root: None,
            require_sandbox: false,
        }
    }
}
