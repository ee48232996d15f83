//! End-to-end supervision scenarios with real child processes.
//!
//! The cgroup controller is pointed at a scratch directory, so the limit
//! files are written to a plain filesystem and no root privileges are
//! needed; OOM detection and actual resource enforcement are exercised
//! only on a real cgroup-v2 hierarchy.

use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use taskd_agent::{
    cgroup::CgroupController,
    error::TaskError,
    output::{OutputReader, ReadOutcome},
    supervisor::TaskManager,
    task::Task,
};
use taskd_process::{TaskStatus, TerminationSource};

const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

fn manager() -> (tempfile::TempDir, Arc<TaskManager>) {
    let dir = tempfile::tempdir().unwrap();
    let mgr = Arc::new(TaskManager::new(CgroupController::new(dir.path())));
    (dir, mgr)
}

fn args(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

async fn wait_done(task: &Task) {
    let mut done = task.done();
    tokio::time::timeout(WAIT_TIMEOUT, done.wait_for(|d| *d))
        .await
        .expect("task did not complete in time")
        .expect("completion latch dropped");
}

async fn read_all(mut reader: OutputReader) -> Vec<u8> {
    let cancel = CancellationToken::new();
    let mut out = Vec::new();
    loop {
        let outcome = tokio::time::timeout(WAIT_TIMEOUT, reader.next_chunk(&cancel))
            .await
            .expect("read timed out");
        match outcome {
            ReadOutcome::Data(chunk) => out.extend_from_slice(&chunk),
            ReadOutcome::Eof => return out,
            ReadOutcome::Canceled => panic!("unexpected cancellation"),
        }
    }
}

#[tokio::test]
async fn clean_exit_is_recorded_as_exited_ok() {
    let (_dir, mgr) = manager();
    let id = mgr.start_task("alice", "ls", &args(&["-l"])).await.unwrap();

    let task = mgr.get_task("alice", id.as_str()).await.unwrap();
    wait_done(&task).await;

    let snap = task.snapshot();
    assert_eq!(snap.status, TaskStatus::ExitedOk);
    assert_eq!(snap.exit_code, Some(0));
    assert!(snap.termination_signal.is_none());
    assert!(snap.termination_source.is_none());
    let end = snap.end_time.expect("end time must be set");
    assert!(end >= snap.start_time);
}

#[tokio::test]
async fn task_is_observable_as_started_before_it_ends() {
    let (_dir, mgr) = manager();
    let id = mgr
        .start_task("alice", "sleep", &args(&["5"]))
        .await
        .unwrap();

    let task = mgr.get_task("alice", id.as_str()).await.unwrap();
    let snap = task.snapshot();
    assert_eq!(snap.status, TaskStatus::Started);
    assert!(snap.end_time.is_none());
    assert!(snap.process_group_id > 0);

    mgr.stop_task("alice", id.as_str()).await.unwrap();
    wait_done(&task).await;
}

#[tokio::test]
async fn nonzero_exit_is_recorded_as_exited_error() {
    let (_dir, mgr) = manager();
    let id = mgr
        .start_task("alice", "ls", &args(&["/nonexistent-path-for-test"]))
        .await
        .unwrap();

    let task = mgr.get_task("alice", id.as_str()).await.unwrap();
    wait_done(&task).await;

    let snap = task.snapshot();
    assert_eq!(snap.status, TaskStatus::ExitedError);
    assert!(matches!(snap.exit_code, Some(code) if code != 0));
    assert!(snap.termination_signal.is_none());
}

#[tokio::test]
async fn exact_exit_code_is_preserved() {
    let (_dir, mgr) = manager();
    let id = mgr
        .start_task("alice", "sh", &args(&["-c", "exit 7"]))
        .await
        .unwrap();

    let task = mgr.get_task("alice", id.as_str()).await.unwrap();
    wait_done(&task).await;

    let snap = task.snapshot();
    assert_eq!(snap.status, TaskStatus::ExitedError);
    assert_eq!(snap.exit_code, Some(7));
}

#[tokio::test]
async fn unknown_command_is_rejected_and_rolled_back() {
    let (dir, mgr) = manager();
    let err = mgr
        .start_task("alice", "test-command-that-does-not-exist", &[])
        .await
        .unwrap_err();

    assert!(matches!(err, TaskError::InvalidArgument(_)));
    let message = err.to_string();
    assert!(message.contains("invalid command"));
    assert!(message.contains("executable file not found in PATH"));

    // The launch failure must not leak the prepared group.
    let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
    assert!(leftovers.is_empty());
}

#[tokio::test]
async fn unknown_absolute_path_is_rejected() {
    let (_dir, mgr) = manager();
    let err = mgr
        .start_task("alice", "/path/to/test-command-that-does-not-exist", &[])
        .await
        .unwrap_err();

    assert!(matches!(err, TaskError::InvalidArgument(_)));
    let message = err.to_string();
    assert!(message.contains("invalid command"));
    assert!(message.contains("no such file or directory"));
}

#[tokio::test]
async fn empty_command_is_rejected() {
    let (_dir, mgr) = manager();
    let err = mgr.start_task("alice", "", &[]).await.unwrap_err();
    assert!(matches!(err, TaskError::InvalidArgument(_)));
    assert_eq!(err.to_string(), "command cannot be empty");
}

#[tokio::test]
async fn stop_kills_the_task_and_records_the_user_source() {
    let (_dir, mgr) = manager();
    let id = mgr
        .start_task("alice", "sleep", &args(&["5"]))
        .await
        .unwrap();

    mgr.stop_task("alice", id.as_str()).await.unwrap();

    let task = mgr.get_task("alice", id.as_str()).await.unwrap();
    wait_done(&task).await;

    let snap = task.snapshot();
    assert_eq!(snap.status, TaskStatus::Signaled);
    assert_eq!(snap.termination_signal.as_deref(), Some("SIGKILL"));
    assert_eq!(snap.termination_source, Some(TerminationSource::User));
    assert!(snap.exit_code.is_none());
    assert!(snap.end_time.is_some());
}

#[tokio::test]
async fn second_stop_fails_the_precondition() {
    let (_dir, mgr) = manager();
    let id = mgr
        .start_task("alice", "sleep", &args(&["5"]))
        .await
        .unwrap();

    mgr.stop_task("alice", id.as_str()).await.unwrap();
    let task = mgr.get_task("alice", id.as_str()).await.unwrap();
    wait_done(&task).await;

    let err = mgr.stop_task("alice", id.as_str()).await.unwrap_err();
    assert!(matches!(err, TaskError::FailedPrecondition(_)));
    assert_eq!(err.to_string(), "task has already completed");
}

#[tokio::test]
async fn admin_stop_records_the_admin_source() {
    let (_dir, mgr) = manager();
    let id = mgr
        .start_task("alice", "sleep", &args(&["5"]))
        .await
        .unwrap();

    mgr.stop_task("admin", id.as_str()).await.unwrap();
    let task = mgr.get_task("alice", id.as_str()).await.unwrap();
    wait_done(&task).await;

    let snap = task.snapshot();
    assert_eq!(snap.status, TaskStatus::Signaled);
    assert_eq!(snap.termination_source, Some(TerminationSource::Admin));
}

#[tokio::test]
async fn unauthorized_lookup_is_indistinguishable_from_missing() {
    let (_dir, mgr) = manager();
    let id = mgr.start_task("alice", "ls", &[]).await.unwrap();

    let unauthorized = mgr.get_task("bob", id.as_str()).await.unwrap_err();
    assert!(matches!(unauthorized, TaskError::NotFound(_)));
    assert_eq!(
        unauthorized.to_string(),
        format!("task with id {id} not found")
    );

    let missing = mgr.get_task("bob", "no-such-id").await.unwrap_err();
    assert!(matches!(missing, TaskError::NotFound(_)));
    assert_eq!(missing.to_string(), "task with id no-such-id not found");

    // The admin identity sees any task; the owner sees its own.
    assert!(mgr.get_task("admin", id.as_str()).await.is_ok());
    assert!(mgr.get_task("alice", id.as_str()).await.is_ok());

    let task = mgr.get_task("alice", id.as_str()).await.unwrap();
    wait_done(&task).await;
}

#[tokio::test]
async fn terminal_snapshots_are_stable() {
    let (_dir, mgr) = manager();
    let id = mgr.start_task("alice", "ls", &[]).await.unwrap();
    let task = mgr.get_task("alice", id.as_str()).await.unwrap();
    wait_done(&task).await;

    let first = task.snapshot();
    for _ in 0..3 {
        let again = task.snapshot();
        assert_eq!(again.status, first.status);
        assert_eq!(again.end_time, first.end_time);
        assert_eq!(again.exit_code, first.exit_code);
        assert_eq!(again.termination_signal, first.termination_signal);
        assert_eq!(again.termination_source, first.termination_source);
    }
}

#[tokio::test]
async fn concurrent_streams_receive_identical_output() {
    let (_dir, mgr) = manager();
    let id = mgr
        .start_task("alice", "sh", &args(&["-c", "echo A; echo B; echo C"]))
        .await
        .unwrap();

    let task = mgr.get_task("alice", id.as_str()).await.unwrap();
    let r1 = task.reader();
    let r2 = task.reader();

    let h1 = tokio::spawn(read_all(r1));
    let h2 = tokio::spawn(read_all(r2));

    let o1 = h1.await.unwrap();
    let o2 = h2.await.unwrap();
    assert_eq!(o1, b"A\nB\nC\n");
    assert_eq!(o1, o2);
}

#[tokio::test]
async fn late_reader_replays_from_offset_zero() {
    let (_dir, mgr) = manager();
    let id = mgr
        .start_task("alice", "sh", &args(&["-c", "echo first; echo second"]))
        .await
        .unwrap();

    let task = mgr.get_task("alice", id.as_str()).await.unwrap();
    wait_done(&task).await;

    // Attaching after completion still yields the full byte sequence.
    let output = read_all(task.reader()).await;
    assert_eq!(output, b"first\nsecond\n");
}

#[tokio::test]
async fn stderr_is_merged_into_the_stream() {
    let (_dir, mgr) = manager();
    let id = mgr
        .start_task(
            "alice",
            "sh",
            &args(&["-c", "echo to-stdout; echo to-stderr >&2"]),
        )
        .await
        .unwrap();

    let task = mgr.get_task("alice", id.as_str()).await.unwrap();
    wait_done(&task).await;

    let output = String::from_utf8(read_all(task.reader()).await).unwrap();
    assert!(output.contains("to-stdout"));
    assert!(output.contains("to-stderr"));
}

#[tokio::test]
async fn reader_cancellation_interrupts_a_live_stream() {
    let (_dir, mgr) = manager();
    let id = mgr
        .start_task("alice", "sleep", &args(&["5"]))
        .await
        .unwrap();

    let task = mgr.get_task("alice", id.as_str()).await.unwrap();
    let mut reader = task.reader();
    let cancel = CancellationToken::new();

    let token = cancel.clone();
    let pending = tokio::spawn(async move { reader.next_chunk(&token).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();
    assert_eq!(pending.await.unwrap(), ReadOutcome::Canceled);

    mgr.stop_task("alice", id.as_str()).await.unwrap();
    wait_done(&task).await;
}

#[tokio::test]
async fn shutdown_kills_running_tasks_and_drain_completes() {
    let (_dir, mgr) = manager();
    let id = mgr
        .start_task("alice", "sleep", &args(&["30"]))
        .await
        .unwrap();
    let task = mgr.get_task("alice", id.as_str()).await.unwrap();

    mgr.shutdown();
    tokio::time::timeout(WAIT_TIMEOUT, mgr.drain())
        .await
        .expect("drain did not finish in time")
        .expect("drain reported a timeout");

    let snap = task.snapshot();
    assert_eq!(snap.status, TaskStatus::Signaled);
    assert_eq!(snap.termination_signal.as_deref(), Some("SIGKILL"));
    assert_eq!(snap.termination_source, Some(TerminationSource::System));
    assert!(task.output().is_closed());
}

#[tokio::test]
async fn launches_yield_distinct_task_ids() {
    let (_dir, mgr) = manager();
    let mut ids = std::collections::HashSet::new();
    let mut tasks = Vec::new();

    for _ in 0..5 {
        let id = mgr.start_task("alice", "ls", &[]).await.unwrap();
        tasks.push(mgr.get_task("alice", id.as_str()).await.unwrap());
        ids.insert(id.to_string());
    }
    assert_eq!(ids.len(), 5);

    for task in &tasks {
        wait_done(task).await;
    }
}

#[tokio::test]
async fn completed_task_cleans_up_its_cgroup() {
    let (dir, mgr) = manager();
    let id = mgr.start_task("alice", "ls", &[]).await.unwrap();
    let task = mgr.get_task("alice", id.as_str()).await.unwrap();
    wait_done(&task).await;

    assert!(!dir.path().join(id.as_str()).exists());
}
