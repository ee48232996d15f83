use std::{
    fs::{self, File},
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;

pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";
pub const SUBTREE_CONTROL_FILE: &str = "cgroup.subtree_control";

/// Controllers the per-task limits below depend on. The server refuses to
/// start when any of them is missing from the root subtree control.
pub const REQUIRED_CONTROLLERS: &[&str] = &["cpu", "memory", "io"];

// Quota 200000 µs per 1000000 µs period, ~20% of one CPU.
const CPU_MAX: &str = "200000 1000000";
const MEMORY_MAX: &str = "64M";
// Device 8:0, 1 MiB/s read and write.
const IO_MAX: &str = "8:0 rbps=1048576 wbps=1048576";

const REMOVE_TICK: Duration = Duration::from_millis(100);
const REMOVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Creates, probes, and removes the per-task cgroup-v2 groups.
///
/// The root is configurable so tests can point it at a scratch directory;
/// production uses [`DEFAULT_CGROUP_ROOT`].
#[derive(Debug, Clone)]
pub struct CgroupController {
    root: PathBuf,
}

impl CgroupController {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root from `TASKD_CGROUP_ROOT`, falling back to the host hierarchy.
    pub fn from_env() -> Self {
        let root = std::env::var("TASKD_CGROUP_ROOT")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CGROUP_ROOT.to_string());
        Self::new(root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn task_path(&self, task_id: &str) -> PathBuf {
        self.root.join(task_id)
    }

    /// Creates the task's group, writes the CPU/memory/IO policy files, and
    /// returns an open handle to the group directory. The handle is what
    /// lets the child be started directly inside the group.
    ///
    /// A pre-existing directory (leftover from a crash) fails the creation
    /// rather than being reused.
    pub fn prepare(&self, task_id: &str) -> anyhow::Result<File> {
        let path = self.task_path(task_id);
        fs::create_dir(&path)
            .with_context(|| format!("create cgroup directory {}", path.display()))?;

        for (name, value) in [
            ("cpu.max", CPU_MAX),
            ("memory.max", MEMORY_MAX),
            ("io.max", IO_MAX),
        ] {
            let file = path.join(name);
            fs::write(&file, value)
                .with_context(|| format!("write {} to {}", value, file.display()))?;
        }

        File::open(&path).with_context(|| format!("open cgroup directory {}", path.display()))
    }

    /// Removes the task's group, retrying while the kernel still reports it
    /// busy or non-empty after a kill. Gives up after [`REMOVE_TIMEOUT`].
    pub async fn destroy(&self, task_id: &str) -> anyhow::Result<()> {
        let path = self.task_path(task_id);

        // cgroupfs drops its interface files with the directory; plain
        // filesystems backing a non-default root need them unlinked first.
        for name in ["cpu.max", "memory.max", "io.max", "cgroup.procs"] {
            let _ = fs::remove_file(path.join(name));
        }

        let deadline = tokio::time::Instant::now() + REMOVE_TIMEOUT;
        let mut tick = tokio::time::interval(REMOVE_TICK);
        loop {
            tick.tick().await;
            match fs::remove_dir(&path) {
                Ok(()) => return Ok(()),
                Err(err) if is_transient_remove_error(&err) => {
                    if tokio::time::Instant::now() >= deadline {
                        anyhow::bail!(
                            "remove cgroup directory {}: timeout reached",
                            path.display()
                        );
                    }
                }
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!("remove cgroup directory {}", path.display())
                    });
                }
            }
        }
    }

    /// True iff the out-of-memory reaper ran inside the task's group.
    ///
    /// This is the authoritative OOM check: the kernel may kill a process
    /// deep in the group rather than the leader, so the leader's wait
    /// status alone cannot prove an OOM kill.
    pub fn was_oom_killed(&self, task_id: &str) -> anyhow::Result<bool> {
        let path = self.task_path(task_id).join("memory.events");
        let data =
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        Ok(parse_oom_kill(&data))
    }
}

/// The kernel briefly refuses removal while a killed group still has
/// members; both errors clear once the zombies are reaped.
fn is_transient_remove_error(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(code) if code == libc::ENOTEMPTY || code == libc::EBUSY)
}

fn parse_oom_kill(memory_events: &str) -> bool {
    for line in memory_events.lines() {
        let mut fields = line.split_whitespace();
        if fields.next() == Some("oom_kill")
            && fields
                .next()
                .and_then(|v| v.parse::<u64>().ok())
                .is_some_and(|n| n >= 1)
        {
            return true;
        }
    }
    false
}

/// Returns which of `required` controllers are absent from the subtree
/// control file at `path`.
pub fn verify_controllers(path: &Path, required: &[&str]) -> anyhow::Result<Vec<String>> {
    let data = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let enabled: Vec<&str> = data.split_whitespace().collect();
    Ok(required
        .iter()
        .filter(|ctrl| !enabled.contains(*ctrl))
        .map(|ctrl| ctrl.to_string())
        .collect())
}
