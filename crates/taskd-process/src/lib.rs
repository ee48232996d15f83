/// Opaque task identifier, unique within a running server.
///
/// Minted at launch and rendered as a human-readable string on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a task. `Started` is the unique initial state; every
/// other state is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TaskStatus {
    Unknown,
    Started,
    Signaled,
    ExitedOk,
    ExitedError,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskStatus::Started)
    }
}

/// The agent that caused a task's termination.
///
/// `Oom` takes precedence over everything; `Admin` and `User` are recorded
/// by the stop path before the kill; `System` covers signals from outside
/// the service; `Unknown` means the wait status was unusable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TerminationSource {
    User,
    Admin,
    Oom,
    System,
    Unknown,
}

impl TerminationSource {
    pub fn as_str(self) -> &'static str {
        match self {
            TerminationSource::User => "user",
            TerminationSource::Admin => "admin",
            TerminationSource::Oom => "oom",
            TerminationSource::System => "system",
            TerminationSource::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for TerminationSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
