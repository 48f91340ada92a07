//! Commands - the units of work executed by build steps
//!
//! A command is plain data (kind + JSON parameters) plus a suspendable
//! `execute` body. The data form (`CommandPayload`) is what travels to
//! remote workers and what the `CommandRegistry` rebuilds commands from.

use crate::context::CommandContext;
use crate::error::{BuildError, Result};
use crate::hasher::{ObjectId, ObjectIdBuilder};
use crate::status::ResultStatus;
use anyhow::{anyhow, bail, Context as _};
use serde::de::DeserializeOwned;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::{Command as Process, Output};
use std::str::FromStr;

/// Future returned by `Command::execute`
pub type CommandFuture<'a> = Pin<Box<dyn Future<Output = anyhow::Result<ResultStatus>> + 'a>>;

/// A declared input of a command
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InputLocation {
    /// A file on disk, fingerprinted by the tracker
    File(PathBuf),
    /// An object registered by an upstream step in the same build
    Output(String),
}

impl fmt::Display for InputLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputLocation::File(path) => write!(f, "file:{}", path.display()),
            InputLocation::Output(url) => write!(f, "output:{}", url),
        }
    }
}

impl FromStr for InputLocation {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix("file:") {
            Ok(InputLocation::File(PathBuf::from(path)))
        } else if let Some(url) = s.strip_prefix("output:") {
            Ok(InputLocation::Output(url.to_string()))
        } else {
            Err(anyhow!("invalid input location '{}'", s))
        }
    }
}

impl Serialize for InputLocation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for InputLocation {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

/// Serialized form of a command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandPayload {
    pub kind: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

pub trait Command: Send + Sync {
    /// Stable type identity, part of the fingerprint
    fn kind(&self) -> &str;

    fn title(&self) -> String {
        self.kind().to_string()
    }

    /// Implementation revision, part of the fingerprint. Bump it whenever
    /// the same parameters would now produce different outputs.
    fn version(&self) -> u32 {
        0
    }

    /// Everything that defines the command's work
    fn parameters(&self) -> serde_json::Value;

    /// Declared inputs. A command with none is always executed.
    fn inputs(&self) -> Vec<InputLocation> {
        Vec::new()
    }

    /// Whether the command should run in a worker process when one is available
    fn should_spawn_process(&self) -> bool {
        false
    }

    fn execute<'a>(&'a self, ctx: &'a CommandContext) -> CommandFuture<'a>;

    fn payload(&self) -> CommandPayload {
        CommandPayload {
            kind: self.kind().to_string(),
            parameters: self.parameters(),
        }
    }
}

/// Salts every fingerprint, so a new engine release invalidates old results
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// BLAKE3 of the engine version, the command kind and revision, and the
/// canonical (key-sorted) parameter JSON
pub fn fingerprint(command: &dyn Command) -> Result<ObjectId> {
    let parameters = serde_json::to_vec(&command.parameters())?;
    Ok(ObjectIdBuilder::new()
        .field(ENGINE_VERSION.as_bytes())
        .field(command.kind().as_bytes())
        .field(&command.version().to_le_bytes())
        .field(&parameters)
        .finish())
}

type CommandFactory =
    Box<dyn Fn(serde_json::Value) -> anyhow::Result<Box<dyn Command>> + Send + Sync>;

/// Rebuilds commands from their payloads
#[derive(Default)]
pub struct CommandRegistry {
    factories: HashMap<String, CommandFactory>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the shell and copy commands
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register::<ShellCommand>(ShellCommand::KIND);
        registry.register::<CopyCommand>(CopyCommand::KIND);
        registry
    }

    /// Register a command type deserialized straight from its parameters
    pub fn register<C>(&mut self, kind: &str)
    where
        C: Command + DeserializeOwned + 'static,
    {
        self.register_with(kind, |parameters| {
            let command: C = serde_json::from_value(parameters)?;
            Ok(Box::new(command))
        });
    }

    pub fn register_with<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn(serde_json::Value) -> anyhow::Result<Box<dyn Command>> + Send + Sync + 'static,
    {
        self.factories.insert(kind.to_string(), Box::new(factory));
    }

    pub fn create(&self, payload: &CommandPayload) -> anyhow::Result<Box<dyn Command>> {
        let factory = self
            .factories
            .get(&payload.kind)
            .ok_or_else(|| BuildError::UnknownCommand(payload.kind.clone()))?;
        factory(payload.parameters.clone())
            .with_context(|| format!("invalid parameters for '{}' command", payload.kind))
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<_> = self.factories.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

// ============================================================================
// Builtin commands
// ============================================================================

/// Runs a shell command line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellCommand {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub inputs: Vec<PathBuf>,
    #[serde(default)]
    pub outputs: Vec<PathBuf>,
    #[serde(default)]
    pub spawn_process: bool,
}

impl ShellCommand {
    pub const KIND: &'static str = "shell";

    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            working_dir: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            spawn_process: false,
        }
    }

    pub fn input(mut self, path: impl Into<PathBuf>) -> Self {
        self.inputs.push(path.into());
        self
    }

    pub fn output(mut self, path: impl Into<PathBuf>) -> Self {
        self.outputs.push(path.into());
        self
    }
}

impl Command for ShellCommand {
    fn kind(&self) -> &str {
        Self::KIND
    }

    fn version(&self) -> u32 {
        1
    }

    fn title(&self) -> String {
        format!("shell: {}", self.command)
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    fn inputs(&self) -> Vec<InputLocation> {
        self.inputs.iter().cloned().map(InputLocation::File).collect()
    }

    fn should_spawn_process(&self) -> bool {
        self.spawn_process
    }

    fn execute<'a>(&'a self, ctx: &'a CommandContext) -> CommandFuture<'a> {
        Box::pin(async move {
            ctx.checkpoint().await?;

            let line = self.command.clone();
            let working_dir = self.working_dir.clone();
            let output = ctx
                .offload(move || run_shell(&line, working_dir.as_deref()))
                .await?;

            for line in String::from_utf8_lossy(&output.stdout).lines() {
                ctx.logger().info(line);
            }
            for line in String::from_utf8_lossy(&output.stderr).lines() {
                ctx.logger().warning(line);
            }

            if !output.status.success() {
                ctx.logger().error(format!(
                    "command exited with code {}",
                    output.status.code().unwrap_or(-1)
                ));
                return Ok(ResultStatus::Failed);
            }

            for path in &self.outputs {
                ctx.register_output(path)?;
            }
            Ok(ResultStatus::Successful)
        })
    }
}

fn run_shell(line: &str, working_dir: Option<&Path>) -> anyhow::Result<Output> {
    // Use sh on Unix, cmd on Windows
    let (shell, shell_arg) = if cfg!(target_os = "windows") {
        ("cmd", "/C")
    } else {
        ("sh", "-c")
    };

    let mut process = Process::new(shell);
    process.arg(shell_arg).arg(line);
    if let Some(dir) = working_dir {
        process.current_dir(dir);
    }
    process
        .output()
        .with_context(|| format!("failed to spawn '{}'", line))
}

/// Copies one file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyCommand {
    pub source: PathBuf,
    pub destination: PathBuf,
}

impl CopyCommand {
    pub const KIND: &'static str = "copy";
}

impl Command for CopyCommand {
    fn kind(&self) -> &str {
        Self::KIND
    }

    fn version(&self) -> u32 {
        1
    }

    fn title(&self) -> String {
        format!(
            "copy {} -> {}",
            self.source.display(),
            self.destination.display()
        )
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    fn inputs(&self) -> Vec<InputLocation> {
        vec![InputLocation::File(self.source.clone())]
    }

    fn execute<'a>(&'a self, ctx: &'a CommandContext) -> CommandFuture<'a> {
        Box::pin(async move {
            ctx.checkpoint().await?;

            let source = self.source.clone();
            let destination = self.destination.clone();
            let copied = ctx
                .offload(move || {
                    if !source.is_file() {
                        bail!("source file {} does not exist", source.display());
                    }
                    if let Some(parent) = destination.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    Ok(fs::copy(&source, &destination)?)
                })
                .await?;

            ctx.logger()
                .verbose(format!("copied {} bytes to {}", copied, self.destination.display()));
            ctx.register_output(&self.destination)?;
            Ok(ResultStatus::Successful)
        })
    }
}
