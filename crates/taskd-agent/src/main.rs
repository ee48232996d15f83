use std::{net::SocketAddr, sync::Arc};

use tonic::transport::Server;
use tracing_subscriber::prelude::*;

use taskd_agent::{
    cgroup::{self, CgroupController},
    supervisor::TaskManager,
    task_service,
};

async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
    Ok(())
}

fn env_or(name: &str, default_value: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default_value.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Stdout logs always; a non-blocking rolling file when TASKD_LOG_DIR
    // is set. The guard must outlive main or buffered lines are dropped.
    let (file_layer, _file_guard) = match std::env::var("TASKD_LOG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => {
            std::fs::create_dir_all(&dir)?;
            let appender = tracing_appender::rolling::daily(&dir, "taskd.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_ansi(true),
        )
        .with(file_layer)
        .init();

    // The per-task limits depend on these controllers; refuse to start
    // without them rather than launching unconstrained tasks.
    let cgroups = CgroupController::from_env();
    let subtree = cgroups.root().join(cgroup::SUBTREE_CONTROL_FILE);
    let missing = cgroup::verify_controllers(&subtree, cgroup::REQUIRED_CONTROLLERS)?;
    if !missing.is_empty() {
        for ctrl in &missing {
            tracing::error!(
                controller = %ctrl,
                "cgroup v2 controller not enabled; enable it with: echo \"+{}\" | sudo tee {}",
                ctrl,
                subtree.display()
            );
        }
        anyhow::bail!("missing cgroup v2 controllers: {}", missing.join(", "));
    }

    let addr: SocketAddr = env_or("TASKD_ADDR", "127.0.0.1:50051").parse()?;
    let manager = Arc::new(TaskManager::new(cgroups));

    tracing::info!(%addr, "taskd gRPC listening");

    let shutdown_manager = manager.clone();
    let shutdown = async move {
        if let Err(err) = wait_for_shutdown_signal().await {
            tracing::error!(error = %err, "failed to listen for shutdown signals");
        }
        tracing::info!("shutdown signal received; stopping server");
        // Cancel monitors and streams before the listener winds down, so
        // in-flight streams end with Unavailable instead of hanging.
        shutdown_manager.shutdown();
    };

    Server::builder()
        .add_service(task_service::server(manager.clone()))
        .serve_with_shutdown(addr, shutdown)
        .await?;

    tracing::info!("waiting for tasks to complete");
    if let Err(err) = manager.drain().await {
        tracing::warn!(error = %err, "some tasks did not finish before the drain deadline");
    }
    tracing::info!("server stopped");

    Ok(())
}
