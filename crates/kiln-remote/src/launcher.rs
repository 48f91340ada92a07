//! Starting worker processes

use crate::error::RemoteError;
use crate::protocol::WorkerRequest;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use tracing::debug;

/// Resolves to the worker's exit code. Dropping it must stop the worker.
pub type WorkerFuture = Pin<Box<dyn Future<Output = anyhow::Result<i32>> + Send>>;

pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, request: &WorkerRequest) -> Result<WorkerFuture, RemoteError>;
}

/// Runs `<executable> slave --address A --build-dir D --profile P`
pub struct ProcessLauncher {
    executable: PathBuf,
}

impl ProcessLauncher {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }

    /// Launch workers from the running executable
    pub fn current_exe() -> Result<Self, RemoteError> {
        Ok(Self::new(std::env::current_exe().map_err(RemoteError::Launch)?))
    }

    pub fn executable(&self) -> &PathBuf {
        &self.executable
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, request: &WorkerRequest) -> Result<WorkerFuture, RemoteError> {
        debug!(exe = ?self.executable, address = %request.address, "launching worker");
        let mut child = tokio::process::Command::new(&self.executable)
            .arg("slave")
            .arg("--address")
            .arg(&request.address)
            .arg("--build-dir")
            .arg(&request.build_dir)
            .arg("--profile")
            .arg(&request.profile)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(RemoteError::Launch)?;

        Ok(Box::pin(async move {
            let status = child.wait().await?;
            Ok(status.code().unwrap_or(-1))
        }))
    }
}
