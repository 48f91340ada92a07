//! Execution environment of a build and of each command inside it

use crate::command::{CommandPayload, CommandRegistry, InputLocation};
use crate::error::{BuildError, Result};
use crate::hasher::ObjectId;
use crate::log::{LogMessage, Logger};
use crate::remote::RemoteExecutor;
use crate::scheduler::{self, next_tick};
use crate::status::ResultStatus;
use crate::step::BuildStep;
use crate::tracker::FileVersionTracker;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Named string parameters of a build
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildParameters(BTreeMap<String, String>);

impl BuildParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for BuildParameters {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Cooperative cancellation request, observed at suspension points
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Outcome of one command execution, as stored in the index
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultEntry {
    pub status: ResultStatus,
    /// Input location (`file:`/`output:`) -> fingerprint at execution time
    #[serde(default)]
    pub input_dependency_versions: BTreeMap<String, ObjectId>,
    /// Produced objects; file outputs use the `file:` form
    #[serde(default)]
    pub output_objects: BTreeMap<String, ObjectId>,
    #[serde(default)]
    pub log_messages: Vec<LogMessage>,
    #[serde(default)]
    pub spawned_commands: Vec<CommandPayload>,
}

impl ResultEntry {
    pub fn with_status(status: ResultStatus) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    /// Output files recorded in this entry
    pub fn output_files(&self) -> impl Iterator<Item = (PathBuf, ObjectId)> + '_ {
        self.output_objects
            .iter()
            .filter_map(|(key, id)| match key.parse::<InputLocation>() {
                Ok(InputLocation::File(path)) => Some((path, *id)),
                _ => None,
            })
    }
}

/// Shared state of one build
pub struct BuilderContext {
    build_dir: PathBuf,
    profile: String,
    parameters: BuildParameters,
    tracker: Arc<FileVersionTracker>,
    pool: Arc<rayon::ThreadPool>,
    cancellation: CancellationFlag,
    outputs: Mutex<HashMap<String, ObjectId>>,
    in_progress: Mutex<HashMap<ObjectId, Arc<BuildStep>>>,
    remote: Option<Arc<dyn RemoteExecutor>>,
    registry: Arc<CommandRegistry>,
    process_slots: Arc<Semaphore>,
}

impl BuilderContext {
    pub fn new(
        build_dir: impl Into<PathBuf>,
        profile: impl Into<String>,
        parameters: BuildParameters,
        tracker: Arc<FileVersionTracker>,
        pool: Arc<rayon::ThreadPool>,
        cancellation: CancellationFlag,
    ) -> Self {
        Self {
            build_dir: build_dir.into(),
            profile: profile.into(),
            parameters,
            tracker,
            pool,
            cancellation,
            outputs: Mutex::new(HashMap::new()),
            in_progress: Mutex::new(HashMap::new()),
            remote: None,
            registry: Arc::new(CommandRegistry::with_builtins()),
            process_slots: Arc::new(Semaphore::new(Semaphore::MAX_PERMITS)),
        }
    }

    /// Execute commands that want a worker process through `remote`
    pub fn with_remote(mut self, remote: Arc<dyn RemoteExecutor>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Rebuild spawned commands through `registry` instead of the builtins
    pub fn with_registry(mut self, registry: Arc<CommandRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Limit the number of worker processes alive at once
    pub fn with_max_parallel_processes(mut self, max: usize) -> Self {
        self.process_slots = Arc::new(Semaphore::new(max.clamp(1, Semaphore::MAX_PERMITS)));
        self
    }

    pub fn build_dir(&self) -> &Path {
        &self.build_dir
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    pub fn parameters(&self) -> &BuildParameters {
        &self.parameters
    }

    pub fn tracker(&self) -> &Arc<FileVersionTracker> {
        &self.tracker
    }

    pub fn pool(&self) -> &Arc<rayon::ThreadPool> {
        &self.pool
    }

    pub fn cancellation(&self) -> &CancellationFlag {
        &self.cancellation
    }

    pub fn remote(&self) -> Option<&Arc<dyn RemoteExecutor>> {
        self.remote.as_ref()
    }

    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.registry
    }

    pub async fn acquire_process_slot(&self) -> anyhow::Result<OwnedSemaphorePermit> {
        Ok(self.process_slots.clone().acquire_owned().await?)
    }

    /// Publish an object produced in this build (`file:`/`output:` key)
    pub fn register_run_output(&self, key: impl Into<String>, id: ObjectId) {
        self.outputs.lock().unwrap().insert(key.into(), id);
    }

    /// Fingerprint of an object registered upstream in this build
    pub fn run_output(&self, url: &str) -> Option<ObjectId> {
        let outputs = self.outputs.lock().unwrap();
        outputs
            .get(&format!("output:{}", url))
            .or_else(|| outputs.get(&format!("file:{}", url)))
            .copied()
    }

    /// Current fingerprint of an input, `None` when it cannot be resolved
    pub fn resolve_input(&self, location: &InputLocation) -> Option<ObjectId> {
        match location {
            InputLocation::File(path) => self.tracker.compute_file_hash(path),
            InputLocation::Output(url) => self.run_output(url),
        }
    }

    /// Claim `fingerprint` for `step`; returns the step already running the
    /// same command, if any
    pub(crate) fn begin_command(&self, fingerprint: ObjectId, step: &Arc<BuildStep>) -> Option<Arc<BuildStep>> {
        let mut in_progress = self.in_progress.lock().unwrap();
        if let Some(running) = in_progress.get(&fingerprint) {
            return Some(running.clone());
        }
        in_progress.insert(fingerprint, step.clone());
        None
    }

    pub(crate) fn end_command(&self, fingerprint: &ObjectId) {
        self.in_progress.lock().unwrap().remove(fingerprint);
    }
}

/// Schedules the steps spawned by a running command
pub trait StepSpawner {
    /// Schedule `step` and resolve to its terminal status
    fn spawn_step(&self, step: Arc<BuildStep>) -> Pin<Box<dyn Future<Output = ResultStatus>>>;
}

/// Environment handed to `Command::execute`
pub struct CommandContext {
    builder: Arc<BuilderContext>,
    logger: Logger,
    entry: RefCell<ResultEntry>,
    spawner: Option<Rc<dyn StepSpawner>>,
}

impl CommandContext {
    pub fn new(builder: Arc<BuilderContext>, logger: Logger) -> Self {
        Self {
            builder,
            logger,
            entry: RefCell::new(ResultEntry::default()),
            spawner: None,
        }
    }

    pub fn with_spawner(mut self, spawner: Rc<dyn StepSpawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    pub fn builder(&self) -> &BuilderContext {
        &self.builder
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    pub fn parameters(&self) -> &BuildParameters {
        self.builder.parameters()
    }

    pub fn build_dir(&self) -> &Path {
        self.builder.build_dir()
    }

    pub fn is_cancelled(&self) -> bool {
        self.builder.cancellation.is_cancelled()
    }

    /// Suspend until the next tick, then fail with `Cancelled` if a
    /// cancellation was requested meanwhile
    pub async fn checkpoint(&self) -> Result<()> {
        next_tick().await;
        if self.is_cancelled() {
            return Err(BuildError::Cancelled);
        }
        Ok(())
    }

    /// Record the current fingerprint of an input this command depends on
    pub fn register_input_dependency(&self, location: &InputLocation) -> Option<ObjectId> {
        let hash = self.builder.resolve_input(location)?;
        self.entry
            .borrow_mut()
            .input_dependency_versions
            .insert(location.to_string(), hash);
        Some(hash)
    }

    /// Record a file written by this command
    pub fn register_output(&self, path: impl AsRef<Path>) -> Result<ObjectId> {
        let path = path.as_ref();
        let tracker = self.builder.tracker();
        tracker.invalidate(path);
        let hash = tracker
            .compute_file_hash(path)
            .ok_or_else(|| BuildError::MissingOutput(path.to_path_buf()))?;
        self.register_output_hash(InputLocation::File(path.to_path_buf()).to_string(), hash);
        Ok(hash)
    }

    /// Record a non-file object under `key` (`output:` form unless already
    /// prefixed)
    pub fn register_output_hash(&self, key: impl Into<String>, hash: ObjectId) {
        let mut key = key.into();
        if key.parse::<InputLocation>().is_err() {
            key = InputLocation::Output(key).to_string();
        }
        self.entry.borrow_mut().output_objects.insert(key, hash);
    }

    /// Run a follow-up command as a step of its own and wait for it.
    ///
    /// The payload is kept in the result entry, so the command is spawned
    /// again whenever this command's result is reused. A worker process has
    /// no step graph: there the command is only recorded, the master runs it
    /// once the result comes back, and the returned status is `NotProcessed`.
    pub async fn spawn_command(&self, payload: CommandPayload) -> anyhow::Result<ResultStatus> {
        let command = self.builder.registry().create(&payload)?;
        self.entry.borrow_mut().spawned_commands.push(payload);
        match self.spawner.clone() {
            Some(spawner) => Ok(spawner.spawn_step(BuildStep::from_boxed(command)).await),
            None => Ok(ResultStatus::NotProcessed),
        }
    }

    /// Run blocking work on the build's thread pool
    pub async fn offload<T, F>(&self, work: F) -> anyhow::Result<T>
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        scheduler::offload(self.builder.pool.clone(), work).await
    }

    pub fn into_result_entry(self, status: ResultStatus) -> ResultEntry {
        let mut entry = self.entry.into_inner();
        entry.status = status;
        entry.log_messages = self.logger.messages();
        entry
    }
}
