//! PackageBuilder - the entry point assembling a build
//!
//! Master mode loads the manifest, runs it through a `Builder` wired to a
//! `RemoteMaster`, and turns every processed step into diagnostics.
//! Slave mode executes the one command waiting on a master's channel.

use crate::manifest::Manifest;
use anyhow::{bail, Context, Result};
use kiln_core::{
    BuildResultCode, BuildStep, Builder, BuilderConfig, BuilderOptions, CancellationFlag,
    CommandRegistry, LogLevel, Mode, ResultStatus,
};
use kiln_remote::{run_slave, ProcessLauncher, RemoteMaster, SlaveOptions};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct PackageBuilderOptions {
    pub manifest: Option<PathBuf>,
    pub build_dir: PathBuf,
    pub profile: Option<String>,
    /// Channel address; set only for worker processes
    pub slave_address: Option<String>,
    pub thread_count: Option<usize>,
    pub max_parallel_processes: Option<usize>,
    pub properties: BTreeMap<String, String>,
    pub remote_timeout: Duration,
    pub slave_builder_path: Option<PathBuf>,
    pub index_prefix: Option<String>,
    pub persist_input_hashes: bool,
    pub mode: Mode,
    pub merge_index: bool,
}

impl PackageBuilderOptions {
    /// Options seeded from the config file; flags are applied on top
    pub fn from_config(config: &BuilderConfig) -> Self {
        Self {
            manifest: None,
            build_dir: PathBuf::new(),
            profile: None,
            slave_address: None,
            thread_count: config.thread_count,
            max_parallel_processes: config.max_parallel_processes,
            properties: config.properties.clone(),
            remote_timeout: Duration::from_secs(config.remote_timeout_secs),
            slave_builder_path: config.slave_builder_path.clone(),
            index_prefix: config.index_prefix.clone(),
            persist_input_hashes: config.persist_input_hashes,
            mode: Mode::Build,
            merge_index: true,
        }
    }

    pub fn is_valid_for_slave(&self) -> bool {
        self.slave_address.as_deref().is_some_and(|a| !a.is_empty())
            && !self.build_dir.as_os_str().is_empty()
    }

    /// Check the options for the selected mode and make the build directory
    /// absolute
    pub fn validate(&mut self) -> Result<()> {
        if self.build_dir.as_os_str().is_empty() {
            bail!("a build directory is required");
        }
        if self.build_dir.is_relative() {
            self.build_dir = std::env::current_dir()?.join(&self.build_dir);
        }

        if self.slave_address.is_some() {
            return Ok(());
        }

        if self.profile.as_deref().map_or(true, |p| p.trim().is_empty()) {
            bail!("a build profile is required");
        }
        if self.mode == Mode::Build {
            match &self.manifest {
                None => bail!("a manifest file is required"),
                Some(path) if !path.is_file() => {
                    bail!("manifest file [{}] doesn't exist", path.display())
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    fn profile(&self) -> &str {
        self.profile.as_deref().unwrap_or("default")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticCode {
    InternalError,
    Succeeded,
    Failed,
    Cancelled,
    UpToDate,
    PrerequisiteFailed,
    /// A warning or error from the step's own log
    StepMessage,
}

impl fmt::Display for DiagnosticCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DiagnosticCode::InternalError => "internal error",
            DiagnosticCode::Succeeded => "succeeded",
            DiagnosticCode::Failed => "failed",
            DiagnosticCode::Cancelled => "cancelled",
            DiagnosticCode::UpToDate => "up-to-date",
            DiagnosticCode::PrerequisiteFailed => "prerequisite failed",
            DiagnosticCode::StepMessage => "message",
        };
        f.write_str(text)
    }
}

/// One line of build output about a tagged step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub tag: String,
    pub level: LogLevel,
    pub code: DiagnosticCode,
    pub text: Option<String>,
}

impl Diagnostic {
    fn emit(&self) {
        let text = self.text.as_deref().unwrap_or("");
        match self.level {
            LogLevel::Error | LogLevel::Fatal => error!(tag = %self.tag, code = %self.code, "{}", text),
            LogLevel::Warning => warn!(tag = %self.tag, code = %self.code, "{}", text),
            LogLevel::Info => info!(tag = %self.tag, code = %self.code, "{}", text),
            LogLevel::Debug | LogLevel::Verbose => {
                debug!(tag = %self.tag, code = %self.code, "{}", text)
            }
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.level, self.tag, self.code)?;
        if let Some(text) = &self.text {
            write!(f, ": {}", text)?;
        }
        Ok(())
    }
}

/// Diagnostics for a processed step: its log warnings and errors, then one
/// outcome line. Untagged steps produce nothing.
pub fn diagnostics_for(step: &BuildStep) -> Vec<Diagnostic> {
    let Some(tag) = step.tag() else {
        return Vec::new();
    };

    let mut diagnostics: Vec<Diagnostic> = step
        .log_messages()
        .into_iter()
        .filter(|message| message.is_at_least(LogLevel::Warning))
        .map(|message| Diagnostic {
            tag: tag.clone(),
            level: message.level,
            code: DiagnosticCode::StepMessage,
            text: Some(message.text),
        })
        .collect();

    let (level, code) = match step.status() {
        ResultStatus::NotProcessed => (LogLevel::Fatal, DiagnosticCode::InternalError),
        ResultStatus::Successful => (LogLevel::Verbose, DiagnosticCode::Succeeded),
        ResultStatus::Failed => (LogLevel::Error, DiagnosticCode::Failed),
        ResultStatus::Cancelled => (LogLevel::Verbose, DiagnosticCode::Cancelled),
        ResultStatus::NotTriggeredWasSuccessful => (LogLevel::Verbose, DiagnosticCode::UpToDate),
        ResultStatus::NotTriggeredPrerequisiteFailed => {
            (LogLevel::Error, DiagnosticCode::PrerequisiteFailed)
        }
    };
    diagnostics.push(Diagnostic {
        tag,
        level,
        code,
        text: None,
    });
    diagnostics
}

pub struct PackageBuilder {
    options: PackageBuilderOptions,
    registry: Arc<CommandRegistry>,
    cancellation: CancellationFlag,
    diagnostics: Arc<Mutex<Vec<Diagnostic>>>,
}

impl PackageBuilder {
    pub fn new(options: PackageBuilderOptions, registry: Arc<CommandRegistry>) -> Self {
        Self {
            options,
            registry,
            cancellation: CancellationFlag::new(),
            diagnostics: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn options(&self) -> &PackageBuilderOptions {
        &self.options
    }

    /// Flag observed by the running build; setting it cancels the build
    pub fn cancellation(&self) -> CancellationFlag {
        self.cancellation.clone()
    }

    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.diagnostics.lock().unwrap().clone()
    }

    /// Run the build. Blocks; call it from a thread that is not a runtime
    /// worker. `Err` means a fatal fault, not a failed build.
    pub fn build(&self, runtime: Handle) -> Result<BuildResultCode> {
        if self.options.is_valid_for_slave() {
            self.build_slave(runtime)
        } else {
            self.build_master(runtime)
        }
    }

    fn build_master(&self, runtime: Handle) -> Result<BuildResultCode> {
        let options = &self.options;
        let mut builder_options = BuilderOptions::new(options.build_dir.clone(), options.profile());
        builder_options.index_name = options
            .index_prefix
            .as_ref()
            .map(|prefix| format!("{}{}", prefix, options.profile()));
        if let Some(threads) = options.thread_count {
            builder_options.thread_count = threads.max(1);
        }
        builder_options.max_parallel_processes = options
            .max_parallel_processes
            .unwrap_or(builder_options.thread_count);
        builder_options.persist_input_hashes = options.persist_input_hashes;

        let manifest = match (&options.manifest, options.mode) {
            (Some(path), _) => Some(Manifest::load(path)?),
            (None, Mode::Build) => bail!("a manifest file is required"),
            (None, _) => None,
        };
        // Manifest properties are defaults; configured ones win
        if let Some(manifest) = &manifest {
            for (key, value) in &manifest.properties {
                builder_options.parameters.set(key.clone(), value.clone());
            }
        }
        for (key, value) in &options.properties {
            builder_options.parameters.set(key.clone(), value.clone());
        }

        let launcher = match &options.slave_builder_path {
            Some(path) => ProcessLauncher::new(path.clone()),
            None => ProcessLauncher::current_exe()?,
        };
        let remote = RemoteMaster::new(runtime, Arc::new(launcher), options.remote_timeout);

        let mut builder = Builder::new(builder_options)
            .context("failed to open the build directory")?
            .with_remote(Arc::new(remote))
            .with_registry(self.registry.clone())
            .with_cancellation(self.cancellation.clone());

        let diagnostics = self.diagnostics.clone();
        builder.on_step_processed(move |step| {
            for diagnostic in diagnostics_for(step) {
                diagnostic.emit();
                diagnostics.lock().unwrap().push(diagnostic);
            }
        });

        if let Some(manifest) = &manifest {
            for step in manifest.instantiate(&self.registry)? {
                builder.add(step)?;
            }
        }

        let result = builder.run(options.mode)?;
        if options.mode == Mode::Build {
            builder.write_index_file(options.merge_index)?;
        }
        Ok(result)
    }

    fn build_slave(&self, runtime: Handle) -> Result<BuildResultCode> {
        let options = &self.options;
        let address = options.slave_address.clone().unwrap_or_default();
        let mut slave = SlaveOptions::new(address, options.build_dir.clone(), options.profile());
        if let Some(threads) = options.thread_count {
            slave.thread_count = threads.max(1);
        }
        Ok(run_slave(&slave, self.registry.clone(), runtime)?)
    }
}
