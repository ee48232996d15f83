use std::{
    sync::{Arc, Mutex},
    time::SystemTime,
};

use tokio::sync::watch;

use taskd_process::{TaskId, TaskStatus, TerminationSource};

use crate::{
    error::TaskError,
    output::{OutputBuffer, OutputReader},
};

/// Terminal fields resolved by the monitor in its single transition out of
/// `Started`.
#[derive(Debug, Clone)]
pub struct Termination {
    pub status: TaskStatus,
    pub exit_code: Option<i32>,
    pub termination_signal: Option<String>,
    pub termination_source: Option<TerminationSource>,
}

#[derive(Debug)]
struct TerminalState {
    status: TaskStatus,
    end_time: Option<SystemTime>,
    exit_code: Option<i32>,
    termination_signal: Option<String>,
    termination_source: Option<TerminationSource>,
}

/// Consistent copy of all task fields, taken under one lock.
#[derive(Debug, Clone)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub owner: String,
    pub process_group_id: i32,
    pub status: TaskStatus,
    pub start_time: SystemTime,
    pub end_time: Option<SystemTime>,
    pub exit_code: Option<i32>,
    pub termination_signal: Option<String>,
    pub termination_source: Option<TerminationSource>,
}

/// One tracked execution: identity, ownership, process group, terminal
/// state, output buffer, and the completion latch.
///
/// Identity, owner, start time, and process-group id are immutable after
/// construction. Terminal fields are written exactly once, by the monitor;
/// the termination source is the single exception, pre-settable by the
/// stop path.
#[derive(Debug)]
pub struct Task {
    id: TaskId,
    owner: String,
    process_group_id: i32,
    start_time: SystemTime,
    output: Arc<OutputBuffer>,
    state: Mutex<TerminalState>,
    done_tx: watch::Sender<bool>,
}

impl Task {
    pub fn new(id: TaskId, owner: String, process_group_id: i32) -> Self {
        let (done_tx, _) = watch::channel(false);
        Self {
            id,
            owner,
            process_group_id,
            start_time: SystemTime::now(),
            output: Arc::new(OutputBuffer::new()),
            state: Mutex::new(TerminalState {
                status: TaskStatus::Started,
                end_time: None,
                exit_code: None,
                termination_signal: None,
                termination_source: None,
            }),
            done_tx,
        }
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn process_group_id(&self) -> i32 {
        self.process_group_id
    }

    pub fn output(&self) -> &Arc<OutputBuffer> {
        &self.output
    }

    /// A fresh reader over the task's output, starting at offset zero.
    pub fn reader(&self) -> OutputReader {
        OutputReader::new(self.output.clone())
    }

    pub fn has_ended(&self) -> bool {
        self.state.lock().unwrap().end_time.is_some()
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        let state = self.state.lock().unwrap();
        TaskSnapshot {
            id: self.id.clone(),
            owner: self.owner.clone(),
            process_group_id: self.process_group_id,
            status: state.status,
            start_time: self.start_time,
            end_time: state.end_time,
            exit_code: state.exit_code,
            termination_signal: state.termination_signal.clone(),
            termination_source: state.termination_source,
        }
    }

    /// Records the stop initiator ahead of the kill so the monitor observes
    /// it when the child dies. Fails if the task has already completed.
    pub fn begin_stop(&self, source: TerminationSource) -> Result<(), TaskError> {
        let mut state = self.state.lock().unwrap();
        if state.end_time.is_some() {
            return Err(TaskError::FailedPrecondition(
                "task has already completed".to_string(),
            ));
        }
        state.termination_source = Some(source);
        Ok(())
    }

    /// Single transition out of `Started`. `resolve` runs under the state
    /// lock and receives the pre-set termination source, so a concurrent
    /// stop cannot slip between observation and recording.
    ///
    /// Monitor-only; a second call is ignored.
    pub(crate) fn finalize(
        &self,
        end_time: SystemTime,
        resolve: impl FnOnce(Option<TerminationSource>) -> Termination,
    ) {
        let mut state = self.state.lock().unwrap();
        if state.end_time.is_some() {
            return;
        }
        let termination = resolve(state.termination_source);
        state.end_time = Some(end_time);
        state.status = termination.status;
        state.exit_code = termination.exit_code;
        state.termination_signal = termination.termination_signal;
        state.termination_source = termination.termination_source;
    }

    /// Fires the completion latch. All terminal fields must already be
    /// observable.
    pub(crate) fn mark_done(&self) {
        self.done_tx.send_replace(true);
    }

    /// Completion latch: the receiver observes `true` once the monitor has
    /// finished recording terminal state.
    pub fn done(&self) -> watch::Receiver<bool> {
        self.done_tx.subscribe()
    }
}
