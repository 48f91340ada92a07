//! Worker side of remote execution
//!
//! A worker connects to the channel its master handed it, executes the one
//! command found there on its own scheduler, and reports back. Network calls
//! run on a Tokio runtime; the command itself runs on the worker's
//! microthread like it would inside the master.

use crate::error::RemoteError;
use crate::protocol::{ForwardedLog, ROUTE_COMMAND, ROUTE_LOG, ROUTE_PARAMETERS, ROUTE_RESULT};
use kiln_core::{
    execute_command_locally, BuildParameters, BuildResultCode, BuilderContext, CancellationFlag,
    CommandPayload, CommandRegistry, FileVersionTracker, LogForwarder, LogMessage, Logger,
    MicroThreadFlags, MicroThreadState, ResultEntry, ResultStatus, Scheduler,
};
use reqwest::StatusCode;
use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// HTTP client for one channel
#[derive(Clone)]
pub struct ChannelClient {
    http: reqwest::Client,
    base: String,
}

impl ChannelClient {
    pub fn new(address: impl Into<String>) -> Self {
        let base: String = address.into();
        Self {
            http: reqwest::Client::new(),
            base: base.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, route: &str) -> String {
        format!("{}{}", self.base, route)
    }

    pub async fn get_command_to_execute(&self) -> Result<CommandPayload, RemoteError> {
        let response = self.http.get(self.url(ROUTE_COMMAND)).send().await?;
        Ok(response.error_for_status()?.json().await?)
    }

    pub async fn get_build_parameters(&self) -> Result<BuildParameters, RemoteError> {
        let response = self.http.get(self.url(ROUTE_PARAMETERS)).send().await?;
        Ok(response.error_for_status()?.json().await?)
    }

    pub async fn forward_log(&self, log: &ForwardedLog) -> Result<(), RemoteError> {
        self.http
            .post(self.url(ROUTE_LOG))
            .json(log)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn register_result(&self, entry: &ResultEntry) -> Result<(), RemoteError> {
        let response = self.http.post(self.url(ROUTE_RESULT)).json(entry).send().await?;
        if response.status() == StatusCode::CONFLICT {
            return Err(RemoteError::Protocol("result already registered".into()));
        }
        response.error_for_status()?;
        Ok(())
    }
}

const FORWARD_ATTEMPTS: u64 = 3;

/// Sends log messages to the master in order, from a single task.
/// A message that still fails after a few attempts is dropped.
pub struct RemoteLogForwarder {
    sender: Mutex<Option<mpsc::UnboundedSender<LogMessage>>>,
    task: Mutex<Option<JoinHandle<usize>>>,
}

impl RemoteLogForwarder {
    pub fn spawn(client: ChannelClient, origin: String, runtime: &Handle) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<LogMessage>();
        let task = runtime.spawn(async move {
            let mut dropped = 0;
            while let Some(message) = rx.recv().await {
                let log = ForwardedLog {
                    origin: origin.clone(),
                    message,
                };
                if !send_with_retries(&client, &log).await {
                    dropped += 1;
                }
            }
            dropped
        });

        Arc::new(Self {
            sender: Mutex::new(Some(tx)),
            task: Mutex::new(Some(task)),
        })
    }

    /// Stop accepting messages and wait until the queue is drained.
    /// Returns how many messages were dropped.
    pub async fn close(&self) -> usize {
        self.sender.lock().unwrap().take();
        let task = self.task.lock().unwrap().take();
        match task {
            Some(task) => task.await.unwrap_or(0),
            None => 0,
        }
    }
}

impl LogForwarder for RemoteLogForwarder {
    fn forward(&self, message: &LogMessage) {
        if let Some(tx) = self.sender.lock().unwrap().as_ref() {
            let _ = tx.send(message.clone());
        }
    }
}

async fn send_with_retries(client: &ChannelClient, log: &ForwardedLog) -> bool {
    for attempt in 1..=FORWARD_ATTEMPTS {
        match client.forward_log(log).await {
            Ok(()) => return true,
            Err(e) => {
                debug!(attempt, "log forwarding failed: {}", e);
                tokio::time::sleep(Duration::from_millis(20 * attempt)).await;
            }
        }
    }
    false
}

#[derive(Debug, Clone)]
pub struct SlaveOptions {
    pub address: String,
    pub build_dir: PathBuf,
    pub profile: String,
    pub thread_count: usize,
}

impl SlaveOptions {
    pub fn new(address: impl Into<String>, build_dir: impl Into<PathBuf>, profile: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            build_dir: build_dir.into(),
            profile: profile.into(),
            thread_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        }
    }
}

/// Execute the command waiting on `options.address` and register its result.
///
/// Blocks the calling thread, which must not be a runtime worker thread; use
/// `spawn_blocking` from async code. A failed command is a normal outcome
/// (`BuildError`); anything that prevents reporting a result is `Fatal`.
pub fn run_slave(
    options: &SlaveOptions,
    registry: Arc<CommandRegistry>,
    runtime: Handle,
) -> Result<BuildResultCode, RemoteError> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.thread_count.max(1))
        .thread_name(|i| format!("kiln-slave-{}", i))
        .build()
        .map_err(|e| RemoteError::Fatal(e.to_string()))?;

    let origin = gethostname::gethostname().to_string_lossy().into_owned();
    let scheduler = Scheduler::new();
    let outcome: Rc<RefCell<Option<ResultStatus>>> = Rc::new(RefCell::new(None));

    let thread = {
        let outcome = outcome.clone();
        let options = options.clone();
        let pool = Arc::new(pool);
        scheduler.add_with("slave", 0, MicroThreadFlags::IGNORE_EXCEPTIONS, async move {
            let status = execute_on_slave(&options, registry, runtime, pool, origin).await?;
            *outcome.borrow_mut() = Some(status);
            Ok(())
        })
    };

    let driven = scheduler.run_until_idle(Duration::from_millis(1));
    scheduler.clear();
    driven.map_err(|e| RemoteError::Fatal(e.to_string()))?;

    if thread.state() == MicroThreadState::Failed {
        let message = thread
            .error()
            .map(|e| format!("{:#}", e))
            .unwrap_or_else(|| "unknown error".into());
        return Err(RemoteError::Fatal(message));
    }

    let status = outcome
        .borrow_mut()
        .take()
        .ok_or_else(|| RemoteError::Fatal("worker finished without a result".into()))?;
    Ok(BuildResultCode::from_status(status))
}

async fn execute_on_slave(
    options: &SlaveOptions,
    registry: Arc<CommandRegistry>,
    runtime: Handle,
    pool: Arc<rayon::ThreadPool>,
    origin: String,
) -> anyhow::Result<ResultStatus> {
    let client = ChannelClient::new(options.address.clone());

    let c = client.clone();
    let payload = runtime.spawn(async move { c.get_command_to_execute().await }).await??;
    let c = client.clone();
    let parameters = runtime.spawn(async move { c.get_build_parameters().await }).await??;
    let command = registry.create(&payload)?;
    info!(command = %command.title(), "executing for master");

    let forwarder = RemoteLogForwarder::spawn(client.clone(), origin, &runtime);
    let logger = Logger::forwarding(None, forwarder.clone());
    let context = Arc::new(BuilderContext::new(
        options.build_dir.clone(),
        options.profile.clone(),
        parameters,
        Arc::new(FileVersionTracker::new()),
        pool,
        CancellationFlag::new(),
    )
    .with_registry(registry));

    let entry = execute_command_locally(&context, command.as_ref(), &logger).await;
    let status = entry.status;

    let dropped = forwarder.close().await;
    if dropped > 0 {
        warn!(dropped, "log messages could not be forwarded");
    }

    runtime.spawn(async move { client.register_result(&entry).await }).await??;
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::LogLevel;

    #[tokio::test]
    async fn test_undeliverable_logs_are_counted_as_dropped() {
        let client = ChannelClient::new("http://127.0.0.1:1/gone");
        let forwarder = RemoteLogForwarder::spawn(client, "worker".into(), &Handle::current());
        forwarder.forward(&LogMessage::new(LogLevel::Info, None, "first"));
        forwarder.forward(&LogMessage::new(LogLevel::Warning, None, "second"));

        assert_eq!(forwarder.close().await, 2);
        // Closed: later messages are ignored
        forwarder.forward(&LogMessage::new(LogLevel::Info, None, "late"));
        assert_eq!(forwarder.close().await, 0);
    }
}
