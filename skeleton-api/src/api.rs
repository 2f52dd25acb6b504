use std::io;
use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusHandle;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use graceful::{
    Coordinator, Deadline, GracefulError, ShutdownPhase, ShutdownTrigger, ShutdownWait,
};
use skeleton_common::context::ServiceContext;

use crate::handlers::{self, AppState};

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("failed to bind {bind}: {error}")]
    Bind { bind: String, error: io::Error },
    #[error("failed to read the listener address: {0}")]
    LocalAddr(io::Error),
    #[error(transparent)]
    Shutdown(#[from] GracefulError),
    #[error("http server failed: {0}")]
    Serve(io::Error),
    #[error("http server task failed: {0}")]
    ServerTask(String),
}

type ServerTask = JoinHandle<io::Result<()>>;

/// A running API server.
///
/// The server stops on the first termination signal, or on [`Api::stop`]:
/// it stops accepting connections, lets in-flight requests finish until the
/// shutdown deadline, then closes the database and messaging connections.
pub struct Api {
    local_addr: SocketAddr,
    wait: ShutdownWait,
    trigger: ShutdownTrigger,
}

impl Api {
    /// Binds `bind` and starts serving.
    pub async fn start(
        bind: &str,
        coordinator: Coordinator,
        state: AppState,
        metrics: Option<PrometheusHandle>,
    ) -> Result<Self, ApiError> {
        let listener = TcpListener::bind(bind)
            .await
            .map_err(|error| ApiError::Bind {
                bind: bind.to_owned(),
                error,
            })?;

        Self::serve(listener, coordinator, state, metrics)
    }

    pub fn serve(
        listener: TcpListener,
        coordinator: Coordinator,
        state: AppState,
        metrics: Option<PrometheusHandle>,
    ) -> Result<Self, ApiError> {
        let local_addr = listener.local_addr().map_err(ApiError::LocalAddr)?;

        let stopping = state.stopping.clone();
        let context = state.context.clone();
        let (server_sender, server_receiver) = oneshot::channel();

        let (wait, trigger) = coordinator.start(move |deadline| {
            teardown(deadline, stopping, server_receiver, context)
        })?;

        let app = handlers::app(state.clone(), metrics);
        let server_trigger = trigger.clone();
        let stopped = state.stopping.clone();
        let server: ServerTask = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { stopped.cancelled().await })
                .await;
            if let Err(err) = &result {
                error!(error = %err, "api: http server failed");
            }
            // Stopping on its own takes the whole service down. No-op when
            // the shutdown is what stopped it.
            server_trigger.trigger();
            result
        });
        if let Err(server) = server_sender.send(server) {
            server.abort();
        }

        info!(address = %local_addr, "api: listening");

        Ok(Self {
            local_addr,
            wait,
            trigger,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn phase(&self) -> ShutdownPhase {
        self.wait.phase()
    }

    /// Blocks until the server has shut down.
    pub async fn run(&self) {
        self.wait.wait().await
    }

    /// Shuts the server down and waits for the teardown to finish.
    pub async fn stop(&self) {
        let started = Instant::now();
        self.trigger.trigger();
        self.wait.wait().await;
        info!(
            duration_ms = started.elapsed().as_millis() as u64,
            "api: stopped"
        );
    }
}

async fn teardown(
    deadline: Deadline,
    stopping: CancellationToken,
    server: oneshot::Receiver<ServerTask>,
    context: ServiceContext,
) -> Result<(), ApiError> {
    info!("api: stopping http server");
    stopping.cancel();

    let mut result = Ok(());
    match server.await {
        Ok(server) => {
            let abort = server.abort_handle();
            match deadline.run(server).await {
                Ok(Ok(Ok(()))) => info!("api: http server stopped"),
                Ok(Ok(Err(err))) => result = Err(ApiError::Serve(err)),
                Ok(Err(err)) => result = Err(ApiError::ServerTask(err.to_string())),
                Err(_) => {
                    warn!("api: in-flight requests did not finish before the deadline");
                    abort.abort();
                }
            }
        }
        Err(_) => warn!("api: http server was never started"),
    }

    context.close().await;
    result
}
