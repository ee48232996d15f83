use std::{os::unix::process::ExitStatusExt, sync::Arc, time::SystemTime};

use tokio::{io::AsyncReadExt, process::Child, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use taskd_process::{TaskStatus, TerminationSource};

use crate::{
    cgroup::CgroupController,
    output::{MAX_CHUNK_SIZE, OutputBuffer},
    task::{Task, Termination},
};

/// Sends SIGKILL to the whole process group. The negated pgid is the
/// kernel idiom for "this group", so descendants are not leaked.
pub(crate) fn kill_process_group(pgid: i32) -> std::io::Result<()> {
    // A non-positive pgid would address "every process in our own group".
    if pgid <= 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "invalid process group id",
        ));
    }
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Pumps one child pipe into the shared output buffer until EOF.
pub(crate) fn spawn_output_copier<R>(mut source: R, buffer: Arc<OutputBuffer>) -> JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; MAX_CHUNK_SIZE];
        loop {
            match source.read(&mut chunk).await {
                Ok(0) => return,
                Ok(n) => {
                    buffer.append(&chunk[..n]);
                }
                Err(err) => {
                    tracing::debug!(error = %err, "output pipe read failed");
                    return;
                }
            }
        }
    })
}

/// Exit information extracted from the child's wait status. At most one of
/// the two fields is set; both absent is the `Unknown` path.
#[derive(Debug, Clone, Default)]
pub(crate) struct ExitInfo {
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
}

/// Derives the task's terminal fields from the wait status, the OOM probe,
/// and any termination source the stop path recorded before the kill.
///
/// The OOM override wins over signal interpretation: the reaper may have
/// killed a process inside the group rather than the leader, leaving a
/// misleading wait status on the leader.
pub(crate) fn resolve_termination(
    exit: ExitInfo,
    oom_killed: bool,
    preset: Option<TerminationSource>,
) -> Termination {
    if oom_killed {
        return Termination {
            status: TaskStatus::Signaled,
            exit_code: None,
            termination_signal: Some(signal_name(libc::SIGKILL)),
            termination_source: Some(TerminationSource::Oom),
        };
    }

    if let Some(code) = exit.exit_code {
        let status = if code == 0 {
            TaskStatus::ExitedOk
        } else {
            TaskStatus::ExitedError
        };
        return Termination {
            status,
            exit_code: Some(code),
            termination_signal: None,
            termination_source: preset,
        };
    }

    if let Some(signal) = exit.signal {
        let source = match preset {
            Some(s @ (TerminationSource::User | TerminationSource::Admin)) => s,
            _ => TerminationSource::System,
        };
        return Termination {
            status: TaskStatus::Signaled,
            exit_code: None,
            termination_signal: Some(signal),
            termination_source: Some(source),
        };
    }

    Termination {
        status: TaskStatus::Unknown,
        exit_code: None,
        termination_signal: None,
        termination_source: Some(TerminationSource::Unknown),
    }
}

pub(crate) fn signal_name(signo: i32) -> String {
    let name = match signo {
        libc::SIGHUP => "SIGHUP",
        libc::SIGINT => "SIGINT",
        libc::SIGQUIT => "SIGQUIT",
        libc::SIGILL => "SIGILL",
        libc::SIGTRAP => "SIGTRAP",
        libc::SIGABRT => "SIGABRT",
        libc::SIGBUS => "SIGBUS",
        libc::SIGFPE => "SIGFPE",
        libc::SIGKILL => "SIGKILL",
        libc::SIGUSR1 => "SIGUSR1",
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGUSR2 => "SIGUSR2",
        libc::SIGPIPE => "SIGPIPE",
        libc::SIGALRM => "SIGALRM",
        libc::SIGTERM => "SIGTERM",
        libc::SIGCHLD => "SIGCHLD",
        libc::SIGCONT => "SIGCONT",
        libc::SIGSTOP => "SIGSTOP",
        libc::SIGTSTP => "SIGTSTP",
        _ => return format!("signal {signo}"),
    };
    name.to_string()
}

/// One monitor per launched child: reconciles process death against server
/// shutdown, records the single terminal transition, tears down the
/// resource group, closes the output buffer, and fires the completion
/// latch, in that order.
pub(crate) fn spawn_monitor(
    task: Arc<Task>,
    mut child: Child,
    copiers: Vec<JoinHandle<()>>,
    cgroup: CgroupController,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let task_id = task.id().clone();

        let raced = tokio::select! {
            res = child.wait() => Some(res),
            _ = shutdown.cancelled() => None,
        };
        let wait_result = match raced {
            Some(res) => res,
            // Shutdown fired first: kill the whole group, then keep
            // waiting for the child so its wait status is still recorded.
            None => {
                tracing::info!(task_id = %task_id, "server shutting down; killing task process group");
                if let Err(err) = kill_process_group(task.process_group_id()) {
                    tracing::warn!(task_id = %task_id, error = %err, "failed to kill process group on shutdown");
                }
                child.wait().await
            }
        };
        let end_time = SystemTime::now();

        let exit = match wait_result {
            Ok(status) => ExitInfo {
                exit_code: status.code(),
                signal: status.signal().map(signal_name),
            },
            Err(err) => {
                tracing::error!(task_id = %task_id, error = %err, "wait for child failed");
                ExitInfo::default()
            }
        };

        // Read memory.events before the group is destroyed. Best-effort: a
        // probe failure downgrades to "not OOM killed".
        let oom_killed = match cgroup.was_oom_killed(task_id.as_str()) {
            Ok(v) => v,
            Err(err) => {
                tracing::debug!(task_id = %task_id, error = %err, "oom probe failed");
                false
            }
        };

        task.finalize(end_time, |preset| resolve_termination(exit, oom_killed, preset));

        let snap = task.snapshot();
        tracing::info!(
            task_id = %task_id,
            status = ?snap.status,
            exit_code = ?snap.exit_code,
            signal = ?snap.termination_signal,
            source = ?snap.termination_source,
            "task completed"
        );

        // Wait for the pipes to drain so no output is lost behind the EOF.
        for copier in copiers {
            let _ = copier.await;
        }

        if let Err(err) = cgroup.destroy(task_id.as_str()).await {
            tracing::warn!(task_id = %task_id, error = %err, "failed to remove cgroup after completion");
        }

        task.output().close();
        task.mark_done();
    })
}
