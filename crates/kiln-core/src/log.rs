//! Per-step log capture
//!
//! A `Logger` records every message emitted by a command so that it can be
//! stored in the index and replayed when the step is skipped. Each message is
//! mirrored into `tracing` and optionally handed to a `LogForwarder` (the
//! slave uses one to stream messages back to the master).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Verbose,
    Info,
    Warning,
    Error,
    Fatal,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Debug => "debug",
            LogLevel::Verbose => "verbose",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMessage {
    pub level: LogLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    pub text: String,
}

impl LogMessage {
    pub fn new(level: LogLevel, module: Option<String>, text: impl Into<String>) -> Self {
        Self {
            level,
            module,
            text: text.into(),
        }
    }

    pub fn is_at_least(&self, level: LogLevel) -> bool {
        self.level >= level
    }
}

/// Receives each message as it is logged
pub trait LogForwarder: Send + Sync {
    fn forward(&self, message: &LogMessage);
}

struct LoggerInner {
    module: Option<String>,
    messages: Mutex<Vec<LogMessage>>,
    forwarder: Option<Arc<dyn LogForwarder>>,
}

/// Cheaply clonable message collector
#[derive(Clone)]
pub struct Logger {
    inner: Arc<LoggerInner>,
}

impl Logger {
    pub fn new(module: Option<String>) -> Self {
        Self {
            inner: Arc::new(LoggerInner {
                module,
                messages: Mutex::new(Vec::new()),
                forwarder: None,
            }),
        }
    }

    /// Create a logger that also hands every message to `forwarder`
    pub fn forwarding(module: Option<String>, forwarder: Arc<dyn LogForwarder>) -> Self {
        Self {
            inner: Arc::new(LoggerInner {
                module,
                messages: Mutex::new(Vec::new()),
                forwarder: Some(forwarder),
            }),
        }
    }

    pub fn module(&self) -> Option<&str> {
        self.inner.module.as_deref()
    }

    pub fn log(&self, level: LogLevel, text: impl Into<String>) {
        let message = LogMessage::new(level, self.inner.module.clone(), text);
        emit(&message);
        if let Some(forwarder) = &self.inner.forwarder {
            forwarder.forward(&message);
        }
        self.inner.messages.lock().unwrap().push(message);
    }

    /// Store a message produced elsewhere (a remote worker, a cached run)
    /// without forwarding it again
    pub fn record(&self, message: LogMessage) {
        emit(&message);
        self.inner.messages.lock().unwrap().push(message);
    }

    pub fn debug(&self, text: impl Into<String>) {
        self.log(LogLevel::Debug, text);
    }

    pub fn verbose(&self, text: impl Into<String>) {
        self.log(LogLevel::Verbose, text);
    }

    pub fn info(&self, text: impl Into<String>) {
        self.log(LogLevel::Info, text);
    }

    pub fn warning(&self, text: impl Into<String>) {
        self.log(LogLevel::Warning, text);
    }

    pub fn error(&self, text: impl Into<String>) {
        self.log(LogLevel::Error, text);
    }

    pub fn fatal(&self, text: impl Into<String>) {
        self.log(LogLevel::Fatal, text);
    }

    pub fn messages(&self) -> Vec<LogMessage> {
        self.inner.messages.lock().unwrap().clone()
    }

    pub fn has_errors(&self) -> bool {
        self.inner
            .messages
            .lock()
            .unwrap()
            .iter()
            .any(|m| m.is_at_least(LogLevel::Error))
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new(None)
    }
}

fn emit(message: &LogMessage) {
    let module = message.module.as_deref().unwrap_or("kiln");
    match message.level {
        LogLevel::Debug | LogLevel::Verbose => debug!(module, "{}", message.text),
        LogLevel::Info => info!(module, "{}", message.text),
        LogLevel::Warning => warn!(module, "{}", message.text),
        LogLevel::Error | LogLevel::Fatal => error!(module, "{}", message.text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Collect(Mutex<Vec<String>>);

    impl LogForwarder for Collect {
        fn forward(&self, message: &LogMessage) {
            self.0.lock().unwrap().push(message.text.clone());
        }
    }

    #[test]
    fn test_forwarding_and_recording() {
        let sink = Arc::new(Collect(Mutex::new(Vec::new())));
        let logger = Logger::forwarding(Some("asset".into()), sink.clone());

        logger.info("compiling");
        logger.record(LogMessage::new(LogLevel::Warning, None, "from worker"));

        assert_eq!(*sink.0.lock().unwrap(), vec!["compiling".to_string()]);
        let messages = logger.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].module.as_deref(), Some("asset"));
        assert!(!logger.has_errors());

        logger.error("boom");
        assert!(logger.has_errors());
    }
}
