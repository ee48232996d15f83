use std::{
    collections::HashMap,
    io,
    os::fd::{AsRawFd, RawFd},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use tokio::{process::Command, sync::RwLock};
use tokio_util::sync::CancellationToken;

use taskd_process::{TaskId, TerminationSource};

use crate::{
    auth,
    cgroup::CgroupController,
    error::TaskError,
    monitor,
    task::Task,
};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Owns the task table and the launch/lookup/stop/drain paths. One monitor
/// task per launched child does all terminal-state writing; the supervisor
/// itself only ever pre-sets the termination source on stop.
pub struct TaskManager {
    tasks: RwLock<HashMap<String, Arc<Task>>>,
    cgroup: CgroupController,
    shutdown: CancellationToken,
}

impl TaskManager {
    pub fn new(cgroup: CgroupController) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            cgroup,
            shutdown: CancellationToken::new(),
        }
    }

    /// Server-wide shutdown signal. Monitors kill their process groups and
    /// streams end with `Unavailable` once it fires.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Launch sequence: mint id, prepare the cgroup, spawn the child into
    /// it, capture the process-group id, insert the record, then start the
    /// monitor. The record is in the table before the monitor runs, so a
    /// racing lookup sees either `NotFound` or a `Started` task, never a
    /// half-initialized one.
    pub async fn start_task(
        &self,
        caller: &str,
        command: &str,
        args: &[String],
    ) -> Result<TaskId, TaskError> {
        tracing::info!(caller, command, ?args, "starting task");

        if command.is_empty() {
            return Err(TaskError::InvalidArgument(
                "command cannot be empty".to_string(),
            ));
        }

        let id = TaskId::new();

        let cgroup_dir = match self.cgroup.prepare(id.as_str()) {
            Ok(dir) => dir,
            Err(err) => {
                tracing::error!(task_id = %id, error = %format!("{err:#}"), "failed to create cgroup");
                self.cleanup_group(&id).await;
                return Err(TaskError::Internal("failed to create cgroup".to_string()));
            }
        };

        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Own process group, so one signal to -pgid reaches every
            // descendant.
            .process_group(0)
            .kill_on_drop(false);

        let cgroup_fd = cgroup_dir.as_raw_fd();
        // Runs between fork and exec: the child joins its cgroup before it
        // executes a single instruction of user code.
        unsafe {
            cmd.pre_exec(move || attach_self_to_cgroup(cgroup_fd));
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                drop(cgroup_dir);
                self.cleanup_group(&id).await;
                return Err(classify_spawn_error(command, &err));
            }
        };

        let pid = child.id().unwrap_or_default() as i32;
        let pgid = process_group_of(pid);
        // The child now pins the group; the handle has done its job.
        drop(cgroup_dir);

        let task = Arc::new(Task::new(id.clone(), caller.to_string(), pgid));

        let mut copiers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            copiers.push(monitor::spawn_output_copier(stdout, task.output().clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            copiers.push(monitor::spawn_output_copier(stderr, task.output().clone()));
        }

        self.tasks
            .write()
            .await
            .insert(id.to_string(), task.clone());

        monitor::spawn_monitor(
            task,
            child,
            copiers,
            self.cgroup.clone(),
            self.shutdown.clone(),
        );

        Ok(id)
    }

    /// Authorized lookup. A task the caller may not see and a task that
    /// does not exist produce the same error, so unauthorized callers
    /// cannot probe for valid ids.
    pub async fn get_task(&self, caller: &str, task_id: &str) -> Result<Arc<Task>, TaskError> {
        let tasks = self.tasks.read().await;
        let task = tasks
            .get(task_id)
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))?;
        if !auth::is_authorized(caller, task.owner()) {
            return Err(TaskError::NotFound(task_id.to_string()));
        }
        Ok(task.clone())
    }

    /// Records who initiated the stop, then SIGKILLs the process group.
    /// The source goes in first so the monitor sees it when the child dies.
    pub async fn stop_task(&self, caller: &str, task_id: &str) -> Result<(), TaskError> {
        let task = self.get_task(caller, task_id).await?;

        let source = if caller == auth::ADMIN_IDENTITY {
            TerminationSource::Admin
        } else {
            TerminationSource::User
        };
        task.begin_stop(source)?;

        tracing::info!(task_id, caller, source = %source, "stopping task");
        monitor::kill_process_group(task.process_group_id()).map_err(|err| {
            tracing::error!(task_id, error = %err, "failed to signal process group");
            TaskError::Internal("failed to send SIGKILL to process group".to_string())
        })
    }

    /// Waits for every monitor to finish recording terminal state, bounded
    /// by a single 30 s deadline across all tasks. Monitors already react
    /// to the shutdown token by killing their process groups.
    pub async fn drain(&self) -> Result<(), TaskError> {
        let tasks: Vec<Arc<Task>> = self.tasks.read().await.values().cloned().collect();
        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;

        for task in tasks {
            let mut done = task.done();
            match tokio::time::timeout_at(deadline, done.wait_for(|d| *d)).await {
                Ok(_) => continue,
                Err(_) => {
                    return Err(TaskError::Internal(
                        "timeout waiting for tasks to complete".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    async fn cleanup_group(&self, id: &TaskId) {
        if let Err(err) = self.cgroup.destroy(id.as_str()).await {
            tracing::warn!(task_id = %id, error = %format!("{err:#}"), "failed to clean up cgroup after launch failure");
        }
    }
}

/// Between fork and exec only async-signal-safe calls are allowed, so this
/// goes through raw `openat`/`write` on the already-open directory handle.
/// Writing pid 0 moves the calling process. `cgroup.procs` always exists
/// on cgroupfs; `O_CREAT` covers plain-directory roots.
fn attach_self_to_cgroup(cgroup_dirfd: RawFd) -> io::Result<()> {
    let fd = unsafe {
        libc::openat(
            cgroup_dirfd,
            c"cgroup.procs".as_ptr(),
            libc::O_WRONLY | libc::O_CREAT | libc::O_CLOEXEC,
            0o644 as libc::c_uint,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    let buf = b"0\n";
    let written = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
    let write_err = (written < 0).then(io::Error::last_os_error);
    unsafe { libc::close(fd) };

    match write_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn process_group_of(pid: i32) -> i32 {
    if pid <= 0 {
        return 0;
    }
    let pgid = unsafe { libc::getpgid(pid) };
    if pgid > 0 { pgid } else { pid }
}

fn classify_spawn_error(command: &str, err: &io::Error) -> TaskError {
    match err.kind() {
        io::ErrorKind::NotFound => {
            let detail = if command.contains('/') {
                "no such file or directory"
            } else {
                "executable file not found in PATH"
            };
            TaskError::InvalidArgument(format!("invalid command {command:?}: {detail}"))
        }
        io::ErrorKind::PermissionDenied => TaskError::InvalidArgument(format!(
            "invalid command {command:?}: permission denied"
        )),
        _ => TaskError::Internal(format!("failed to start process: {err}")),
    }
}
