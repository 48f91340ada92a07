//! Seam for executing commands in worker processes
//!
//! The builder only knows this trait; `kiln-remote` provides the
//! master/slave implementation.

use crate::command::CommandPayload;
use crate::context::{BuildParameters, ResultEntry};
use crate::log::Logger;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

/// Everything a worker needs to execute one command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteRequest {
    pub command: CommandPayload,
    pub parameters: BuildParameters,
    pub build_dir: PathBuf,
    pub profile: String,
}

pub type RemoteFuture = Pin<Box<dyn Future<Output = anyhow::Result<ResultEntry>>>>;

pub trait RemoteExecutor: Send + Sync {
    /// Execute `request` out of process. Forwarded log messages are recorded
    /// into `logger`; the returned entry is the worker's registered result.
    /// A lost worker or a timeout must resolve to an error, never to a
    /// successful entry.
    fn execute(&self, request: RemoteRequest, logger: Logger) -> RemoteFuture;
}
