//! Master side of remote execution
//!
//! Each remote command gets a private HTTP channel on the loopback
//! interface, rooted at a fresh UUID. The worker pulls its command and
//! parameters from it, streams log messages back, and registers exactly one
//! result.

use crate::error::RemoteError;
use crate::launcher::{WorkerFuture, WorkerLauncher};
use crate::protocol::{
    ForwardedLog, WorkerRequest, ROUTE_COMMAND, ROUTE_HEALTH, ROUTE_LOG, ROUTE_PARAMETERS,
    ROUTE_RESULT,
};
use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use kiln_core::{
    BuildParameters, CommandPayload, Logger, RemoteExecutor, RemoteFuture, RemoteRequest,
    ResultEntry,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

struct ChannelState {
    command: CommandPayload,
    parameters: BuildParameters,
    logger: Logger,
    result: Mutex<Option<oneshot::Sender<ResultEntry>>>,
}

/// One bound master/worker channel. The server stops when this is dropped.
pub struct ChannelServer {
    address: String,
    result: oneshot::Receiver<ResultEntry>,
    server: JoinHandle<()>,
}

impl ChannelServer {
    pub async fn bind(
        command: CommandPayload,
        parameters: BuildParameters,
        logger: Logger,
    ) -> Result<Self, RemoteError> {
        let channel_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        let state = Arc::new(ChannelState {
            command,
            parameters,
            logger,
            result: Mutex::new(Some(tx)),
        });

        let routes = Router::new()
            .route(ROUTE_COMMAND, get(get_command))
            .route(ROUTE_PARAMETERS, get(get_parameters))
            .route(ROUTE_LOG, post(post_log))
            .route(ROUTE_RESULT, post(post_result))
            .route(ROUTE_HEALTH, get(health_check))
            .with_state(state);
        let app = Router::new().nest(&format!("/{}", channel_id), routes);

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(RemoteError::Bind)?;
        let local = listener.local_addr().map_err(RemoteError::Bind)?;
        let address = format!("http://{}/{}", local, channel_id);
        debug!(%address, "channel listening");

        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("channel server error: {}", e);
            }
        });

        Ok(Self {
            address,
            result: rx,
            server,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Wait for the worker's result, its exit, or the timeout, whichever
    /// comes first
    pub async fn wait_for_result(
        mut self,
        worker: WorkerFuture,
        timeout: Duration,
    ) -> Result<ResultEntry, RemoteError> {
        enum Waited {
            Result(Result<ResultEntry, oneshot::error::RecvError>),
            Exited(anyhow::Result<i32>),
            TimedOut,
        }

        let waited = tokio::select! {
            result = &mut self.result => Waited::Result(result),
            exit = worker => Waited::Exited(exit),
            _ = tokio::time::sleep(timeout) => Waited::TimedOut,
        };

        match waited {
            Waited::Result(Ok(entry)) => Ok(entry),
            Waited::Result(Err(_)) => Err(RemoteError::ChannelClosed),
            // A worker acknowledges its result before exiting
            Waited::Exited(exit) => match self.result.try_recv() {
                Ok(entry) => Ok(entry),
                Err(_) => match exit {
                    Ok(code) => Err(RemoteError::WorkerExited { code }),
                    Err(e) => Err(RemoteError::Fatal(format!("{:#}", e))),
                },
            },
            Waited::TimedOut => Err(RemoteError::Timeout(timeout)),
        }
    }
}

impl Drop for ChannelServer {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn get_command(State(state): State<Arc<ChannelState>>) -> Json<CommandPayload> {
    Json(state.command.clone())
}

async fn get_parameters(State(state): State<Arc<ChannelState>>) -> Json<BuildParameters> {
    Json(state.parameters.clone())
}

async fn post_log(
    State(state): State<Arc<ChannelState>>,
    Json(log): Json<ForwardedLog>,
) -> StatusCode {
    debug!(origin = %log.origin, "forwarded log message");
    state.logger.record(log.message);
    StatusCode::NO_CONTENT
}

async fn post_result(
    State(state): State<Arc<ChannelState>>,
    Json(entry): Json<ResultEntry>,
) -> StatusCode {
    let sender = state.result.lock().unwrap().take();
    match sender {
        Some(tx) => {
            let _ = tx.send(entry);
            StatusCode::OK
        }
        None => {
            warn!("worker registered a second result");
            StatusCode::CONFLICT
        }
    }
}

async fn health_check() -> &'static str {
    "OK"
}

/// Run one command on a worker started by `launcher`
pub async fn run_channel(
    request: RemoteRequest,
    logger: Logger,
    launcher: Arc<dyn WorkerLauncher>,
    timeout: Duration,
) -> Result<ResultEntry, RemoteError> {
    let kind = request.command.kind.clone();
    let channel = ChannelServer::bind(request.command, request.parameters, logger).await?;
    let worker = launcher.launch(&WorkerRequest {
        address: channel.address().to_string(),
        build_dir: request.build_dir,
        profile: request.profile,
    })?;

    let result = channel.wait_for_result(worker, timeout).await;
    match &result {
        Ok(entry) => info!(command = %kind, status = %entry.status, "worker finished"),
        Err(e) => warn!(command = %kind, "worker failed: {}", e),
    }
    result
}

/// `RemoteExecutor` that runs every channel on a Tokio runtime, so the
/// builder's own thread only awaits the outcome
pub struct RemoteMaster {
    runtime: Handle,
    launcher: Arc<dyn WorkerLauncher>,
    timeout: Duration,
}

impl RemoteMaster {
    pub fn new(runtime: Handle, launcher: Arc<dyn WorkerLauncher>, timeout: Duration) -> Self {
        Self {
            runtime,
            launcher,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl RemoteExecutor for RemoteMaster {
    fn execute(&self, request: RemoteRequest, logger: Logger) -> RemoteFuture {
        let handle = self.runtime.spawn(run_channel(
            request,
            logger,
            self.launcher.clone(),
            self.timeout,
        ));
        Box::pin(async move {
            match handle.await {
                Ok(result) => result.map_err(anyhow::Error::from),
                Err(e) => Err(anyhow::anyhow!("remote channel task failed: {}", e)),
            }
        })
    }
}
