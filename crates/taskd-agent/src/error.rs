use thiserror::Error;
use tonic::Status;

/// Closed set of failures the supervision core can produce.
///
/// `Unauthenticated` is deliberately absent: a missing caller identity is
/// rejected by the transport interceptor before the core is entered.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("{0}")]
    InvalidArgument(String),

    /// Covers both "no such task" and "not your task"; the two must stay
    /// indistinguishable on the wire so task ids cannot be enumerated.
    #[error("task with id {0} not found")]
    NotFound(String),

    #[error("{0}")]
    FailedPrecondition(String),

    #[error("{0}")]
    Canceled(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Internal(String),
}

impl From<TaskError> for Status {
    fn from(err: TaskError) -> Self {
        let message = err.to_string();
        match err {
            TaskError::InvalidArgument(_) => Status::invalid_argument(message),
            TaskError::NotFound(_) => Status::not_found(message),
            TaskError::FailedPrecondition(_) => Status::failed_precondition(message),
            TaskError::Canceled(_) => Status::cancelled(message),
            TaskError::Unavailable(_) => Status::unavailable(message),
            TaskError::Internal(_) => Status::internal(message),
        }
    }
}
