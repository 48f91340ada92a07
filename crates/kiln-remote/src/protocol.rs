//! Wire types of the master/worker channel
//!
//! A channel is rooted at `http://<host>:<port>/<channel-id>`:
//!
//! - `GET  /command`    the command payload to execute
//! - `GET  /parameters` the build parameters of the master
//! - `POST /log`        one forwarded log message
//! - `POST /result`     the final result entry, accepted exactly once
//! - `GET  /health`

use kiln_core::LogMessage;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const ROUTE_COMMAND: &str = "/command";
pub const ROUTE_PARAMETERS: &str = "/parameters";
pub const ROUTE_LOG: &str = "/log";
pub const ROUTE_RESULT: &str = "/result";
pub const ROUTE_HEALTH: &str = "/health";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardedLog {
    /// Host the worker runs on
    pub origin: String,
    pub message: LogMessage,
}

/// Everything a worker needs to connect back to its master
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRequest {
    pub address: String,
    pub build_dir: PathBuf,
    pub profile: String,
}
