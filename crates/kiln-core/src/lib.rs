//! Kiln Core - Incremental Build Engine
//!
//! Features:
//! - Cooperative microthread scheduler driving every build step
//! - BLAKE3 content fingerprints with an mtime/size shortcut
//! - Build step graph with prerequisite failure propagation
//! - Append-only result index shared safely between processes
//! - Parallel command work on a Rayon pool
//! - Remote execution seam for out-of-process workers

pub mod builder;
pub mod command;
pub mod config;
pub mod context;
pub mod error;
pub mod hasher;
pub mod index;
pub mod log;
pub mod remote;
pub mod scheduler;
pub mod status;
pub mod step;
pub mod tracker;

pub use builder::{
    execute_command_locally, Builder, BuilderOptions, Mode, StepCounter, StepListener,
};
pub use command::{
    fingerprint, Command, CommandFuture, CommandPayload, CommandRegistry, CopyCommand,
    InputLocation, ShellCommand, ENGINE_VERSION,
};
pub use config::{
    apply_setting, get_config_path, load_config, load_config_from, save_config, BuilderConfig,
};
pub use context::{
    BuildParameters, BuilderContext, CancellationFlag, CommandContext, ResultEntry, StepSpawner,
};
pub use error::{is_cancellation, BuildError, Result};
pub use hasher::ObjectId;
pub use index::{Index, INDEX_VERSION};
pub use log::{LogForwarder, LogLevel, LogMessage, Logger};
pub use remote::{RemoteExecutor, RemoteFuture, RemoteRequest};
pub use scheduler::{
    delay, next_tick, offload, wait_any, when_all, MicroThread, MicroThreadFlags, MicroThreadOutcome,
    MicroThreadState, Scheduler, Signal,
};
pub use status::{BuildResultCode, ResultStatus};
pub use step::{link_build_steps, BuildStep, BuildStepProvider, DynamicSteps, StepKind};
pub use tracker::FileVersionTracker;
