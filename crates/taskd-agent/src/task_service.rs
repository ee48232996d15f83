use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, service::interceptor::InterceptedService};

use taskd_process::TaskStatus;
use taskd_proto::taskd_v1::{
    JobStatus, StartTaskRequest, StartTaskResponse, StopTaskRequest, StopTaskResponse,
    StreamTaskOutputRequest, StreamTaskOutputResponse, TaskStatusRequest, TaskStatusResponse,
    task_manager_server::{TaskManager as TaskManagerGrpc, TaskManagerServer},
};

use crate::{error::TaskError, output::ReadOutcome, supervisor::TaskManager, task::TaskSnapshot};

/// Metadata key the mTLS-terminating front end uses to forward the client
/// certificate's common name.
pub const CLIENT_CN_METADATA_KEY: &str = "x-client-cn";

/// Authenticated caller identity, injected into request extensions by
/// [`authenticate`] before any handler runs.
#[derive(Debug, Clone)]
pub struct CallerIdentity(pub String);

/// Interceptor applied to every call: an absent or empty identity is
/// rejected with `Unauthenticated` so the core never sees one.
pub fn authenticate(mut request: Request<()>) -> Result<Request<()>, Status> {
    let cn = request
        .metadata()
        .get(CLIENT_CN_METADATA_KEY)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .unwrap_or_default();

    if cn.is_empty() {
        return Err(Status::unauthenticated("failed to get client identity"));
    }

    let identity = CallerIdentity(cn.to_string());
    request.extensions_mut().insert(identity);
    Ok(request)
}

fn caller<T>(request: &Request<T>) -> Result<String, Status> {
    request
        .extensions()
        .get::<CallerIdentity>()
        .map(|identity| identity.0.clone())
        .ok_or_else(|| Status::unauthenticated("failed to get client identity"))
}

fn map_status(status: TaskStatus) -> JobStatus {
    match status {
        TaskStatus::Unknown => JobStatus::Unknown,
        TaskStatus::Started => JobStatus::Started,
        TaskStatus::Signaled => JobStatus::Signaled,
        TaskStatus::ExitedOk => JobStatus::ExitedOk,
        TaskStatus::ExitedError => JobStatus::ExitedError,
    }
}

fn map_snapshot(snap: TaskSnapshot) -> TaskStatusResponse {
    TaskStatusResponse {
        task_id: snap.id.to_string(),
        process_id: snap.process_group_id,
        status: map_status(snap.status) as i32,
        start_time: Some(prost_types::Timestamp::from(snap.start_time)),
        end_time: snap.end_time.map(prost_types::Timestamp::from),
        exit_code: snap.exit_code,
        termination_signal: snap.termination_signal.unwrap_or_default(),
        termination_source: snap
            .termination_source
            .map(|s| s.as_str().to_string())
            .unwrap_or_default(),
    }
}

#[derive(Clone)]
pub struct TaskApi {
    manager: Arc<TaskManager>,
}

impl TaskApi {
    pub fn new(manager: Arc<TaskManager>) -> Self {
        Self { manager }
    }
}

#[tonic::async_trait]
impl TaskManagerGrpc for TaskApi {
    async fn start_task(
        &self,
        request: Request<StartTaskRequest>,
    ) -> Result<Response<StartTaskResponse>, Status> {
        let caller = caller(&request)?;
        let req = request.into_inner();
        let task_id = self
            .manager
            .start_task(&caller, &req.command, &req.args)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(StartTaskResponse {
            task_id: task_id.to_string(),
        }))
    }

    async fn stop_task(
        &self,
        request: Request<StopTaskRequest>,
    ) -> Result<Response<StopTaskResponse>, Status> {
        let caller = caller(&request)?;
        let req = request.into_inner();
        self.manager
            .stop_task(&caller, &req.task_id)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(StopTaskResponse {}))
    }

    async fn get_task_status(
        &self,
        request: Request<TaskStatusRequest>,
    ) -> Result<Response<TaskStatusResponse>, Status> {
        let caller = caller(&request)?;
        let req = request.into_inner();
        let task = self
            .manager
            .get_task(&caller, &req.task_id)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(map_snapshot(task.snapshot())))
    }

    type StreamTaskOutputStream = ReceiverStream<Result<StreamTaskOutputResponse, Status>>;

    async fn stream_task_output(
        &self,
        request: Request<StreamTaskOutputRequest>,
    ) -> Result<Response<Self::StreamTaskOutputStream>, Status> {
        let caller = caller(&request)?;
        let req = request.into_inner();
        let task = self
            .manager
            .get_task(&caller, &req.task_id)
            .await
            .map_err(Status::from)?;

        let shutdown = self.manager.shutdown_token();
        // Child of the server token: shutdown cancels every stream, a
        // client disconnect cancels only this one.
        let cancel = shutdown.child_token();
        let mut reader = task.reader();
        let (tx, rx) = mpsc::channel::<Result<StreamTaskOutputResponse, Status>>(16);

        let disconnect = cancel.clone();
        let watched = tx.clone();
        tokio::spawn(async move {
            watched.closed().await;
            disconnect.cancel();
        });

        tokio::spawn(async move {
            loop {
                match reader.next_chunk(&cancel).await {
                    ReadOutcome::Data(output) => {
                        if tx
                            .send(Ok(StreamTaskOutputResponse { output }))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    ReadOutcome::Eof => return,
                    ReadOutcome::Canceled => {
                        let status = if shutdown.is_cancelled() {
                            Status::from(TaskError::Unavailable(
                                "server shutting down".to_string(),
                            ))
                        } else {
                            Status::from(TaskError::Canceled(
                                "client canceled stream".to_string(),
                            ))
                        };
                        let _ = tx.send(Err(status)).await;
                        return;
                    }
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

type AuthInterceptor = fn(Request<()>) -> Result<Request<()>, Status>;

pub fn server(
    manager: Arc<TaskManager>,
) -> InterceptedService<TaskManagerServer<TaskApi>, AuthInterceptor> {
    TaskManagerServer::with_interceptor(TaskApi::new(manager), authenticate as AuthInterceptor)
}
