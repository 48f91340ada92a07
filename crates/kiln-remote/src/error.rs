use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("worker did not register a result within {0:?}")]
    Timeout(Duration),

    #[error("worker exited with code {code} without registering a result")]
    WorkerExited { code: i32 },

    #[error("channel closed before a result was registered")]
    ChannelClosed,

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("failed to launch worker: {0}")]
    Launch(#[source] std::io::Error),

    #[error("failed to bind channel: {0}")]
    Bind(#[source] std::io::Error),

    /// A fault in the worker itself, as opposed to a failed command
    #[error("fatal worker fault: {0}")]
    Fatal(String),
}
