//! Builder - runs one build of a step graph
//!
//! Every step gets its own microthread. A step waits for its prerequisites,
//! then either propagates their failure, observes a cancellation request,
//! or executes. Command steps consult the index first and are skipped when
//! their fingerprint and every input fingerprint are unchanged; the
//! commands they spawned are scheduled again either way.

use crate::command::{self, Command, CommandRegistry, InputLocation};
use crate::context::{
    BuildParameters, BuilderContext, CancellationFlag, CommandContext, ResultEntry, StepSpawner,
};
use crate::error::{is_cancellation, BuildError, Result};
use crate::hasher::ObjectId;
use crate::index::{prepare_database, Index};
use crate::log::{LogLevel, Logger};
use crate::remote::{RemoteExecutor, RemoteRequest};
use crate::scheduler::{self, catch_unwind, delay, wait_any, MicroThreadFlags, Scheduler};
use crate::status::{BuildResultCode, ResultStatus};
use crate::step::{check_for_cycles, composite_status, BuildStep, DynamicSteps, StepKind};
use crate::tracker::FileVersionTracker;
use std::fs;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Build,
    /// Forget the index and the cached input hashes
    Clean,
    /// `Clean`, and also delete every output file recorded in the index
    CleanAndDelete,
}

#[derive(Debug, Clone)]
pub struct BuilderOptions {
    pub build_dir: PathBuf,
    pub profile: String,
    /// Index file suffix; defaults to the profile
    pub index_name: Option<String>,
    pub thread_count: usize,
    pub max_parallel_processes: usize,
    pub parameters: BuildParameters,
    /// Sleep between ticks while every microthread is suspended
    pub poll_interval: Duration,
    /// Keep file fingerprints in a database under the build directory
    pub persist_input_hashes: bool,
}

impl BuilderOptions {
    pub fn new(build_dir: impl Into<PathBuf>, profile: impl Into<String>) -> Self {
        let threads = std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(4);
        Self {
            build_dir: build_dir.into(),
            profile: profile.into(),
            index_name: None,
            thread_count: threads,
            max_parallel_processes: threads,
            parameters: BuildParameters::new(),
            poll_interval: Duration::from_millis(1),
            persist_input_hashes: true,
        }
    }

    pub fn index_name(&self) -> &str {
        self.index_name.as_deref().unwrap_or(&self.profile)
    }
}

/// Per-status tally of processed steps
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepCounter {
    results: [usize; 6],
    total: usize,
}

impl StepCounter {
    pub fn add(&mut self, status: ResultStatus) {
        self.results[status.ordinal()] += 1;
        self.total += 1;
    }

    pub fn get(&self, status: ResultStatus) -> usize {
        self.results[status.ordinal()]
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn summary(&self) -> String {
        format!(
            "{} steps: {} succeeded, {} up-to-date, {} failed, {} not triggered due to previous failure",
            self.total,
            self.get(ResultStatus::Successful),
            self.get(ResultStatus::NotTriggeredWasSuccessful),
            self.get(ResultStatus::Failed),
            self.get(ResultStatus::NotTriggeredPrerequisiteFailed)
        )
    }
}

/// Called for every step once it is processed
pub type StepListener = Arc<dyn Fn(&BuildStep) + Send + Sync>;

/// How often a dynamic step waiting for work checks for cancellation
const DYNAMIC_CANCELLATION_POLL: Duration = Duration::from_millis(50);

pub struct Builder {
    id: Uuid,
    options: BuilderOptions,
    root: Arc<BuildStep>,
    tracker: Arc<FileVersionTracker>,
    pool: Arc<rayon::ThreadPool>,
    index: Arc<Mutex<Index>>,
    cancellation: CancellationFlag,
    remote: Option<Arc<dyn RemoteExecutor>>,
    registry: Arc<CommandRegistry>,
    listeners: Vec<StepListener>,
    counter: Arc<Mutex<StepCounter>>,
    running: AtomicBool,
}

impl Builder {
    pub fn new(options: BuilderOptions) -> Result<Self> {
        let db_dir = Index::database_dir(&options.build_dir);
        prepare_database(&db_dir)?;

        let index = Index::open(Index::index_path(&options.build_dir, options.index_name()))?;
        let tracker = if options.persist_input_hashes {
            FileVersionTracker::open(db_dir.join(format!("input_hashes.{}", options.index_name())))?
        } else {
            FileVersionTracker::new()
        };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.thread_count.max(1))
            .thread_name(|i| format!("kiln-worker-{}", i))
            .build()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        let builder = Self {
            id: Uuid::new_v4(),
            options,
            root: BuildStep::list(),
            tracker: Arc::new(tracker),
            pool: Arc::new(pool),
            index: Arc::new(Mutex::new(index)),
            cancellation: CancellationFlag::new(),
            remote: None,
            registry: Arc::new(CommandRegistry::with_builtins()),
            listeners: Vec::new(),
            counter: Arc::new(Mutex::new(StepCounter::default())),
            running: AtomicBool::new(false),
        };
        info!(
            builder = %builder.id,
            build_dir = %builder.options.build_dir.display(),
            profile = %builder.options.profile,
            "builder ready"
        );
        Ok(builder)
    }

    /// Execute process-spawning commands through `remote`
    pub fn with_remote(mut self, remote: Arc<dyn RemoteExecutor>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Rebuild spawned commands through `registry` instead of the builtins
    pub fn with_registry(mut self, registry: Arc<CommandRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Share an externally owned cancellation flag
    pub fn with_cancellation(mut self, cancellation: CancellationFlag) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn options(&self) -> &BuilderOptions {
        &self.options
    }

    pub fn root(&self) -> &Arc<BuildStep> {
        &self.root
    }

    pub fn add(&self, step: Arc<BuildStep>) -> Result<()> {
        self.root.add(step)
    }

    pub fn tracker(&self) -> &Arc<FileVersionTracker> {
        &self.tracker
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn on_step_processed(&mut self, listener: impl Fn(&BuildStep) + Send + Sync + 'static) {
        self.listeners.push(Arc::new(listener));
    }

    /// Request cooperative cancellation of the running build
    pub fn cancel_build(&self) {
        self.cancellation.cancel();
    }

    pub fn cancellation(&self) -> CancellationFlag {
        self.cancellation.clone()
    }

    pub fn stats(&self) -> StepCounter {
        self.counter.lock().unwrap().clone()
    }

    /// Index entry recorded for a command fingerprint
    pub fn index_entry(&self, fingerprint: &ObjectId) -> Option<ResultEntry> {
        self.index.lock().unwrap().get(fingerprint).cloned()
    }

    /// Start over with an empty root, a zeroed counter and no pending
    /// cancellation
    pub fn reset(&mut self) {
        self.root = BuildStep::list();
        self.counter.lock().unwrap().clear();
        self.cancellation.reset();
    }

    pub fn run(&self, mode: Mode) -> Result<BuildResultCode> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(BuildError::AlreadyRunning);
        }
        let result = match mode {
            Mode::Build => self.run_build(),
            Mode::Clean => self.clean(false),
            Mode::CleanAndDelete => self.clean(true),
        };
        self.running.store(false, Ordering::SeqCst);
        result
    }

    /// Persist the index. With `merge`, entries from this build are appended
    /// to whatever is on disk; otherwise the file is rewritten from the
    /// merged in-memory view.
    pub fn write_index_file(&self, merge: bool) -> Result<()> {
        let mut index = self.index.lock().unwrap();
        index.flush()?;
        if merge {
            index.refresh()?;
        } else {
            index.compact()?;
        }
        Ok(())
    }

    fn run_build(&self) -> Result<BuildResultCode> {
        if self.root.is_processed() {
            return Err(BuildError::AlreadyProcessed(self.root.title()));
        }
        check_for_cycles(&self.root)?;

        let started = Instant::now();
        self.index.lock().unwrap().refresh()?;
        self.counter.lock().unwrap().clear();

        let mut context = BuilderContext::new(
            &self.options.build_dir,
            &self.options.profile,
            self.options.parameters.clone(),
            self.tracker.clone(),
            self.pool.clone(),
            self.cancellation.clone(),
        )
        .with_max_parallel_processes(self.options.max_parallel_processes)
        .with_registry(self.registry.clone());
        if let Some(remote) = &self.remote {
            context = context.with_remote(remote.clone());
        }

        let scheduler = Scheduler::new();
        let run = Rc::new(RunState {
            scheduler: scheduler.clone(),
            context: Arc::new(context),
            index: self.index.clone(),
            listeners: self.listeners.clone(),
            counter: self.counter.clone(),
        });
        schedule_step(&run, self.root.clone());
        drop(run);

        let outcome = scheduler.run_until_idle(self.options.poll_interval);
        scheduler.clear();

        // Results recorded before a fault are still valid
        self.index.lock().unwrap().flush()?;
        self.tracker.flush()?;
        outcome?;

        let counter = self.stats();
        let failed = counter.get(ResultStatus::Failed) + counter.get(ResultStatus::NotTriggeredPrerequisiteFailed);
        let elapsed = started.elapsed();

        let result = if self.cancellation.is_cancelled() {
            error!("Build cancelled. {}", counter.summary());
            if failed > 0 || counter.get(ResultStatus::Cancelled) > 0 {
                BuildResultCode::BuildError
            } else {
                BuildResultCode::Successful
            }
        } else if failed > 0 {
            error!(elapsed = ?elapsed, "Build finished in {}", counter.summary());
            error!("Build failed.");
            BuildResultCode::BuildError
        } else {
            info!(elapsed = ?elapsed, "Build finished in {}", counter.summary());
            info!("Build is successful.");
            BuildResultCode::Successful
        };
        Ok(result)
    }

    fn clean(&self, delete_outputs: bool) -> Result<BuildResultCode> {
        let mode_name = if delete_outputs { "Clean-and-delete" } else { "Clean" };
        let mut index = self.index.lock().unwrap();
        index.refresh()?;

        let mut failures = 0;
        if delete_outputs {
            let mut deleted = 0;
            for (_, entry) in index.entries() {
                for (path, _) in entry.output_files() {
                    match fs::remove_file(&path) {
                        Ok(()) => deleted += 1,
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(e) => {
                            warn!(path = %path.display(), "failed to delete output: {}", e);
                            failures += 1;
                        }
                    }
                }
            }
            info!(deleted, "deleted recorded outputs");
        }

        index.clear()?;
        self.tracker.clear()?;

        if failures > 0 {
            error!("{} has failed.", mode_name);
            Ok(BuildResultCode::BuildError)
        } else {
            info!("{} has been successfully completed.", mode_name);
            Ok(BuildResultCode::Successful)
        }
    }
}

/// State shared by the microthreads of one run
struct RunState {
    scheduler: Scheduler,
    context: Arc<BuilderContext>,
    index: Arc<Mutex<Index>>,
    listeners: Vec<StepListener>,
    counter: Arc<Mutex<StepCounter>>,
}

fn schedule_step(run: &Rc<RunState>, step: Arc<BuildStep>) {
    if step.execution_id().is_some() || step.is_processed() {
        return;
    }

    let state = run.clone();
    let target = step.clone();
    let thread = run.scheduler.add_with(
        step.title(),
        step.effective_priority(),
        MicroThreadFlags::NONE,
        async move { process_step(&state, &target).await },
    );
    step.set_execution_id(thread.id());
    if let Some(tag) = step.tag() {
        thread.set_tag(tag);
    }
}

async fn process_step(run: &Rc<RunState>, step: &Arc<BuildStep>) -> anyhow::Result<()> {
    let prerequisites = step.prerequisites();
    for prerequisite in &prerequisites {
        prerequisite.processed().await;
    }

    let status = if prerequisites.iter().any(|p| !p.succeeded()) {
        ResultStatus::NotTriggeredPrerequisiteFailed
    } else if run.context.cancellation().is_cancelled() {
        ResultStatus::Cancelled
    } else {
        match step.kind() {
            StepKind::List(_) => run_list(run, step).await,
            StepKind::Dynamic(dynamic) => run_dynamic(run, step, dynamic).await,
            StepKind::Command(command) => execute_command(run, step, command.as_ref()).await,
        }
    };

    // Children that never started share the outcome of their container
    if matches!(
        status,
        ResultStatus::NotTriggeredPrerequisiteFailed | ResultStatus::Cancelled
    ) {
        for descendant in step.descendants() {
            if descendant.execution_id().is_none() && !descendant.is_processed() {
                complete_step(run, &descendant, status)?;
            }
        }
    }

    complete_step(run, step, status)?;
    Ok(())
}

async fn run_list(run: &Rc<RunState>, step: &Arc<BuildStep>) -> ResultStatus {
    let children = step.children();
    for child in &children {
        schedule_step(run, child.clone());
    }
    for child in &children {
        child.processed().await;
    }
    composite_status(&children)
}

async fn run_dynamic(
    run: &Rc<RunState>,
    step: &Arc<BuildStep>,
    dynamic: &DynamicSteps,
) -> ResultStatus {
    let cancellation = run.context.cancellation().clone();
    let mut running: Vec<Arc<BuildStep>> = Vec::new();

    loop {
        running.retain(|child| !child.is_processed());
        if cancellation.is_cancelled() {
            break;
        }

        let new_work = dynamic.new_work();
        let max_parallel = dynamic.max_parallel_steps();
        if running.len() >= max_parallel + dynamic.max_high_priority_parallel_steps() {
            wait_any(running.iter().map(|child| child.processed()).collect()).await;
            continue;
        }

        // Past the regular bound only high priority (negative) steps get a slot
        let high_priority_only = running.len() >= max_parallel;
        let max_priority = if high_priority_only { -1 } else { i64::MAX };
        match dynamic.provider().next_build_step(max_priority) {
            Some(child) if child.is_processed() || child.execution_id().is_some() => {}
            Some(child) => {
                step.adopt_provided(&child);
                schedule_step(run, child.clone());
                running.push(child);
            }
            None if dynamic.is_closed() && !high_priority_only => break,
            None => {
                let mut waits: Vec<Pin<Box<dyn Future<Output = ()>>>> = running
                    .iter()
                    .map(|child| Box::pin(child.processed()) as Pin<Box<dyn Future<Output = ()>>>)
                    .collect();
                waits.push(Box::pin(new_work));
                waits.push(Box::pin(delay(DYNAMIC_CANCELLATION_POLL)));
                wait_any(waits).await;
            }
        }
    }

    for child in &running {
        child.processed().await;
    }
    match composite_status(&dynamic.scheduled()) {
        ResultStatus::Successful if cancellation.is_cancelled() => ResultStatus::Cancelled,
        status => status,
    }
}

fn complete_step(run: &RunState, step: &BuildStep, status: ResultStatus) -> Result<()> {
    let title = step.title();
    let module = step.module().unwrap_or_else(|| "kiln".to_string());
    let (level, text) = match status {
        ResultStatus::Successful => (LogLevel::Info, format!("BuildStep {} was successful.", title)),
        ResultStatus::Failed => (LogLevel::Error, format!("BuildStep {} failed.", title)),
        ResultStatus::Cancelled => (LogLevel::Warning, format!("BuildStep {} cancelled.", title)),
        ResultStatus::NotTriggeredWasSuccessful => (
            LogLevel::Verbose,
            format!("BuildStep {} is up-to-date and has been skipped", title),
        ),
        ResultStatus::NotTriggeredPrerequisiteFailed => (
            LogLevel::Verbose,
            format!("BuildStep {} not triggered due to previous failure", title),
        ),
        ResultStatus::NotProcessed => return Err(BuildError::NotProcessed(title)),
    };
    match level {
        LogLevel::Error => error!(module = %module, "{}", text),
        LogLevel::Warning => warn!(module = %module, "{}", text),
        LogLevel::Info => info!(module = %module, "{}", text),
        _ => debug!(module = %module, "{}", text),
    }

    step.register_result(status)?;
    run.counter.lock().unwrap().add(status);
    for listener in &run.listeners {
        listener(step);
    }
    Ok(())
}

async fn execute_command(run: &Rc<RunState>, step: &Arc<BuildStep>, command: &dyn Command) -> ResultStatus {
    let context = &run.context;
    let fingerprint = match command::fingerprint(command) {
        Ok(fingerprint) => fingerprint,
        Err(e) => {
            let logger = Logger::new(step.module());
            logger.error(format!("Cannot fingerprint command {}: {}", step.title(), e));
            step.set_result(ResultEntry {
                status: ResultStatus::Failed,
                log_messages: logger.messages(),
                ..ResultEntry::default()
            });
            return ResultStatus::Failed;
        }
    };

    // The same command is already running in this build: share its outcome
    if let Some(running) = context.begin_command(fingerprint, step) {
        debug!(step = %step.title(), hash = %fingerprint.short(), "waiting for identical command");
        running.processed().await;
        let status = if running.succeeded() {
            ResultStatus::NotTriggeredWasSuccessful
        } else {
            running.status()
        };
        let mut entry = running.result().unwrap_or_default();
        entry.status = status;
        step.set_result(entry);
        return status;
    }

    let logger = Logger::new(step.module());
    let entry = run_command(run, step, command, fingerprint, &logger).await;
    context.end_command(&fingerprint);

    let status = entry.status;
    if status.succeeded() {
        for (key, id) in &entry.output_objects {
            context.register_run_output(key.clone(), *id);
        }
    }
    if status == ResultStatus::Successful {
        run.index.lock().unwrap().record(fingerprint, entry.clone());
    }
    step.set_result(entry);
    status
}

async fn run_command(
    run: &Rc<RunState>,
    step: &Arc<BuildStep>,
    command: &dyn Command,
    fingerprint: ObjectId,
    logger: &Logger,
) -> ResultEntry {
    let context = &run.context;
    let declared = command.inputs();

    // Only a command with declared inputs can be proven unchanged
    if !declared.is_empty() {
        let recorded = run.index.lock().unwrap().get(&fingerprint).map(recorded_files);
        if let Some(mut paths) = recorded {
            paths.extend(file_inputs(&declared));
            warm_file_hashes(context, paths).await;

            let cached = run
                .index
                .lock()
                .unwrap()
                .is_up_to_date(&fingerprint, &declared, |location| context.resolve_input(location))
                .cloned();
            if let Some(mut entry) = cached {
                debug!(step = %step.title(), hash = %fingerprint.short(), "up to date");
                for message in &entry.log_messages {
                    logger.record(message.clone());
                }
                entry.status = ResultStatus::NotTriggeredWasSuccessful;
                if !spawn_recorded_commands(run, step, &entry, logger).await {
                    entry.status = ResultStatus::Failed;
                }
                return entry;
            }
        }
    }

    match context.remote() {
        Some(remote) if command.should_spawn_process() => {
            let mut entry = execute_remote(context, remote.clone(), step, command, logger).await;
            // A worker only records what it spawned
            if entry.status.succeeded() && !spawn_recorded_commands(run, step, &entry, logger).await {
                entry.status = ResultStatus::Failed;
            }
            entry
        }
        _ => {
            let spawner = Rc::new(RunSpawner {
                run: run.clone(),
                parent: step.clone(),
            });
            let ctx = CommandContext::new(context.clone(), logger.clone()).with_spawner(spawner);
            run_in_context(ctx, command, logger).await
        }
    }
}

/// Runs the steps spawned by the command of `parent` on the build's scheduler
struct RunSpawner {
    run: Rc<RunState>,
    parent: Arc<BuildStep>,
}

impl StepSpawner for RunSpawner {
    fn spawn_step(&self, step: Arc<BuildStep>) -> Pin<Box<dyn Future<Output = ResultStatus>>> {
        self.parent.add_spawned(&step);
        schedule_step(&self.run, step.clone());
        Box::pin(async move {
            step.processed().await;
            step.status()
        })
    }
}

/// Schedule the commands recorded in `entry` as spawned by `parent` and
/// wait for them. Returns false when one of them cannot be rebuilt.
async fn spawn_recorded_commands(
    run: &Rc<RunState>,
    parent: &Arc<BuildStep>,
    entry: &ResultEntry,
    logger: &Logger,
) -> bool {
    if entry.spawned_commands.is_empty() {
        return true;
    }

    let spawner = RunSpawner {
        run: run.clone(),
        parent: parent.clone(),
    };
    let mut all_created = true;
    let mut waits = Vec::new();
    for payload in &entry.spawned_commands {
        match run.context.registry().create(payload) {
            Ok(command) => waits.push(spawner.spawn_step(BuildStep::from_boxed(command))),
            Err(e) => {
                logger.error(format!("Cannot spawn {} command: {:#}", payload.kind, e));
                all_created = false;
            }
        }
    }
    for wait in waits {
        wait.await;
    }
    all_created
}

fn file_inputs(locations: &[InputLocation]) -> Vec<PathBuf> {
    locations
        .iter()
        .filter_map(|location| match location {
            InputLocation::File(path) => Some(path.clone()),
            InputLocation::Output(_) => None,
        })
        .collect()
}

/// Files an up-to-date check of `entry` has to fingerprint
fn recorded_files(entry: &ResultEntry) -> Vec<PathBuf> {
    entry
        .input_dependency_versions
        .keys()
        .filter_map(|key| match key.parse::<InputLocation>() {
            Ok(InputLocation::File(path)) => Some(path),
            _ => None,
        })
        .chain(entry.output_files().map(|(path, _)| path))
        .collect()
}

/// Hash `paths` on the offload pool, so the tracker lookups that follow on
/// the scheduler thread only stat the files
async fn warm_file_hashes(context: &BuilderContext, paths: Vec<PathBuf>) {
    if paths.is_empty() {
        return;
    }
    let tracker = context.tracker().clone();
    let hashed = scheduler::offload(context.pool().clone(), move || {
        Ok(tracker.compute_file_hashes(&paths).len())
    })
    .await;
    if let Err(e) = hashed {
        warn!("failed to hash inputs in parallel: {:#}", e);
    }
}

/// Execute `command` in this process: register its declared inputs, run the
/// body, and turn errors or panics into a `Failed` entry
pub async fn execute_command_locally(
    context: &Arc<BuilderContext>,
    command: &dyn Command,
    logger: &Logger,
) -> ResultEntry {
    run_in_context(CommandContext::new(context.clone(), logger.clone()), command, logger).await
}

async fn run_in_context(ctx: CommandContext, command: &dyn Command, logger: &Logger) -> ResultEntry {
    let declared = command.inputs();
    warm_file_hashes(ctx.builder(), file_inputs(&declared)).await;
    for location in declared {
        if ctx.register_input_dependency(&location).is_none() {
            logger.warning(format!(
                "Location {} does not exist currently and is required to compute the current command hash. The build cache will not work for this command!",
                location
            ));
        }
    }

    let title = command.title();
    let status = match catch_unwind(command.execute(&ctx)).await {
        Ok(Ok(ResultStatus::NotProcessed)) => {
            logger.error(format!(
                "The command {} returned NotProcessed after completion.",
                title
            ));
            ResultStatus::Failed
        }
        Ok(Ok(status)) => status,
        Ok(Err(e)) if is_cancellation(&e) => ResultStatus::Cancelled,
        Ok(Err(e)) => {
            logger.error(format!("Exception in command {}: {:#}", title, e));
            ResultStatus::Failed
        }
        Err(panic) => {
            logger.error(format!("Command {} panicked: {}", title, panic));
            ResultStatus::Failed
        }
    };
    ctx.into_result_entry(status)
}

async fn execute_remote(
    context: &Arc<BuilderContext>,
    remote: Arc<dyn RemoteExecutor>,
    step: &BuildStep,
    command: &dyn Command,
    logger: &Logger,
) -> ResultEntry {
    let failed = |logger: &Logger, message: String| {
        logger.error(message);
        ResultEntry {
            status: ResultStatus::Failed,
            log_messages: logger.messages(),
            ..ResultEntry::default()
        }
    };

    let _slot = match context.acquire_process_slot().await {
        Ok(slot) => slot,
        Err(e) => return failed(logger, format!("no worker slot for {}: {}", step.title(), e)),
    };
    if context.cancellation().is_cancelled() {
        return ResultEntry::with_status(ResultStatus::Cancelled);
    }

    let request = RemoteRequest {
        command: command.payload(),
        parameters: context.parameters().clone(),
        build_dir: context.build_dir().to_path_buf(),
        profile: context.profile().to_string(),
    };
    match remote.execute(request, logger.clone()).await {
        Ok(mut entry) => {
            // The worker wrote these files; drop stale fingerprints
            for (path, _) in entry.output_files() {
                context.tracker().invalidate(&path);
            }
            if !entry.status.is_processed() {
                return failed(
                    logger,
                    format!("The build step {} returned NotProcessed after completion.", step.title()),
                );
            }
            if entry.log_messages.is_empty() {
                entry.log_messages = logger.messages();
            }
            entry
        }
        Err(e) if is_cancellation(&e) => ResultEntry::with_status(ResultStatus::Cancelled),
        Err(e) => failed(logger, format!("Remote execution of {} failed: {:#}", step.title(), e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandFuture;
    use crate::scheduler::next_tick;
    use crate::step::BuildStepProvider;
    use tempfile::tempdir;

    struct Counted {
        name: &'static str,
        status: ResultStatus,
        runs: Arc<Mutex<usize>>,
    }

    impl Command for Counted {
        fn kind(&self) -> &str {
            "counted"
        }
        fn title(&self) -> String {
            self.name.to_string()
        }
        fn parameters(&self) -> serde_json::Value {
            serde_json::json!({ "name": self.name })
        }
        fn execute<'a>(&'a self, ctx: &'a CommandContext) -> CommandFuture<'a> {
            Box::pin(async move {
                ctx.checkpoint().await?;
                *self.runs.lock().unwrap() += 1;
                Ok(self.status)
            })
        }
    }

    fn counted(name: &'static str, status: ResultStatus) -> (Arc<BuildStep>, Arc<Mutex<usize>>) {
        let runs = Arc::new(Mutex::new(0));
        let step = BuildStep::command(Counted {
            name,
            status,
            runs: runs.clone(),
        });
        (step, runs)
    }

    fn builder(dir: &std::path::Path) -> Builder {
        let mut options = BuilderOptions::new(dir, "test");
        options.thread_count = 2;
        options.persist_input_hashes = false;
        Builder::new(options).unwrap()
    }

    #[test]
    fn test_step_counter() {
        let mut counter = StepCounter::default();
        counter.add(ResultStatus::Successful);
        counter.add(ResultStatus::Successful);
        counter.add(ResultStatus::Failed);
        assert_eq!(counter.total(), 3);
        assert_eq!(counter.get(ResultStatus::Successful), 2);
        assert!(counter.summary().starts_with("3 steps: 2 succeeded"));
        counter.clear();
        assert_eq!(counter.total(), 0);
    }

    #[test]
    fn test_successful_build() {
        let dir = tempdir().unwrap();
        let builder = builder(dir.path());
        let (a, a_runs) = counted("a", ResultStatus::Successful);
        let (b, _) = counted("b", ResultStatus::Successful);
        builder.add(a.clone()).unwrap();
        builder.add(b.clone()).unwrap();

        assert_eq!(builder.run(Mode::Build).unwrap(), BuildResultCode::Successful);
        assert_eq!(a.status(), ResultStatus::Successful);
        assert_eq!(builder.root().status(), ResultStatus::Successful);
        assert_eq!(*a_runs.lock().unwrap(), 1);
        assert!(a.execution_id().is_some());
        assert_eq!(builder.stats().total(), 3);
        assert!(!builder.is_running());

        assert!(matches!(builder.run(Mode::Build), Err(BuildError::AlreadyProcessed(_))));
    }

    #[test]
    fn test_failure_does_not_stop_siblings() {
        let dir = tempdir().unwrap();
        let builder = builder(dir.path());
        let (bad, _) = counted("bad", ResultStatus::Failed);
        let (good, good_runs) = counted("good", ResultStatus::Successful);
        builder.add(bad.clone()).unwrap();
        builder.add(good.clone()).unwrap();

        assert_eq!(builder.run(Mode::Build).unwrap(), BuildResultCode::BuildError);
        assert_eq!(bad.status(), ResultStatus::Failed);
        assert_eq!(good.status(), ResultStatus::Successful);
        assert_eq!(*good_runs.lock().unwrap(), 1);
        assert_eq!(builder.root().status(), ResultStatus::Failed);
    }

    #[test]
    fn test_not_processed_result_is_reported_as_failure() {
        let dir = tempdir().unwrap();
        let builder = builder(dir.path());
        let (odd, _) = counted("odd", ResultStatus::NotProcessed);
        builder.add(odd.clone()).unwrap();

        assert_eq!(builder.run(Mode::Build).unwrap(), BuildResultCode::BuildError);
        assert_eq!(odd.status(), ResultStatus::Failed);
        assert!(odd
            .log_messages()
            .iter()
            .any(|m| m.level == LogLevel::Error && m.text.contains("NotProcessed")));
    }

    #[test]
    fn test_panicking_command_fails_its_step_only() {
        struct Explodes;
        impl Command for Explodes {
            fn kind(&self) -> &str {
                "explodes"
            }
            fn parameters(&self) -> serde_json::Value {
                serde_json::Value::Null
            }
            fn execute<'a>(&'a self, _ctx: &'a CommandContext) -> CommandFuture<'a> {
                Box::pin(async move {
                    next_tick().await;
                    if self.kind() == "explodes" {
                        panic!("asset importer crashed");
                    }
                    Ok(ResultStatus::Successful)
                })
            }
        }

        let dir = tempdir().unwrap();
        let builder = builder(dir.path());
        let exploding = BuildStep::command(Explodes);
        let (good, _) = counted("good", ResultStatus::Successful);
        builder.add(exploding.clone()).unwrap();
        builder.add(good.clone()).unwrap();

        assert_eq!(builder.run(Mode::Build).unwrap(), BuildResultCode::BuildError);
        assert_eq!(exploding.status(), ResultStatus::Failed);
        assert_eq!(good.status(), ResultStatus::Successful);
    }

    #[test]
    fn test_identical_commands_run_once() {
        let dir = tempdir().unwrap();
        let builder = builder(dir.path());
        let runs = Arc::new(Mutex::new(0));
        let first = BuildStep::command(Counted {
            name: "same",
            status: ResultStatus::Successful,
            runs: runs.clone(),
        });
        let second = BuildStep::command(Counted {
            name: "same",
            status: ResultStatus::Successful,
            runs: runs.clone(),
        });
        builder.add(first.clone()).unwrap();
        builder.add(second.clone()).unwrap();

        assert_eq!(builder.run(Mode::Build).unwrap(), BuildResultCode::Successful);
        assert_eq!(*runs.lock().unwrap(), 1);
        assert_eq!(first.status(), ResultStatus::Successful);
        assert_eq!(second.status(), ResultStatus::NotTriggeredWasSuccessful);
    }

    #[test]
    fn test_cycle_aborts_before_running() {
        let dir = tempdir().unwrap();
        let builder = builder(dir.path());
        let (a, a_runs) = counted("a", ResultStatus::Successful);
        let (b, _) = counted("b", ResultStatus::Successful);
        crate::step::link_build_steps(&a, &b);
        crate::step::link_build_steps(&b, &a);
        builder.add(a).unwrap();
        builder.add(b).unwrap();

        assert!(matches!(builder.run(Mode::Build), Err(BuildError::CycleDetected(_))));
        assert_eq!(*a_runs.lock().unwrap(), 0);
    }

    #[test]
    fn test_clean_and_delete_removes_outputs() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("out.bin");
        fs::write(&output, b"compiled").unwrap();

        let mut builder = builder(dir.path());
        let mut entry = ResultEntry::with_status(ResultStatus::Successful);
        entry.output_objects.insert(
            InputLocation::File(output.clone()).to_string(),
            ObjectId::from_content(b"compiled"),
        );
        let id = ObjectId::from_content(b"cmd");
        builder.index.lock().unwrap().record(id, entry);
        builder.write_index_file(true).unwrap();

        assert_eq!(builder.run(Mode::Clean).unwrap(), BuildResultCode::Successful);
        assert!(builder.index_entry(&id).is_none());
        assert!(output.exists());

        builder.reset();
        let mut entry = ResultEntry::with_status(ResultStatus::Successful);
        entry.output_objects.insert(
            InputLocation::File(output.clone()).to_string(),
            ObjectId::from_content(b"compiled"),
        );
        builder.index.lock().unwrap().record(id, entry);
        assert_eq!(
            builder.run(Mode::CleanAndDelete).unwrap(),
            BuildResultCode::Successful
        );
        assert!(!output.exists());
    }

    /// Tracks how many instances run at the same time
    struct Overlapping {
        name: String,
        active: Arc<Mutex<(usize, usize)>>,
    }

    impl Command for Overlapping {
        fn kind(&self) -> &str {
            "overlapping"
        }
        fn title(&self) -> String {
            self.name.clone()
        }
        fn parameters(&self) -> serde_json::Value {
            serde_json::json!({ "name": self.name })
        }
        fn execute<'a>(&'a self, _ctx: &'a CommandContext) -> CommandFuture<'a> {
            Box::pin(async move {
                {
                    let mut active = self.active.lock().unwrap();
                    active.0 += 1;
                    active.1 = active.1.max(active.0);
                }
                for _ in 0..3 {
                    next_tick().await;
                }
                self.active.lock().unwrap().0 -= 1;
                Ok(ResultStatus::Successful)
            })
        }
    }

    struct Queue(Mutex<Vec<Arc<BuildStep>>>);

    impl BuildStepProvider for Queue {
        fn next_build_step(&self, max_priority: i64) -> Option<Arc<BuildStep>> {
            let mut queue = self.0.lock().unwrap();
            let position = queue
                .iter()
                .position(|step| step.effective_priority() <= max_priority)?;
            Some(queue.remove(position))
        }
    }

    #[test]
    fn test_dynamic_step_bounds_parallel_steps() {
        let dir = tempdir().unwrap();
        let builder = builder(dir.path());
        let active = Arc::new(Mutex::new((0, 0)));
        let provided: Vec<_> = (0..6)
            .map(|i| {
                BuildStep::command(Overlapping {
                    name: format!("job{}", i),
                    active: active.clone(),
                })
            })
            .collect();
        let dynamic = BuildStep::dynamic(Arc::new(Queue(Mutex::new(provided.clone()))), 2);
        dynamic.dynamic_ref().unwrap().close();
        builder.add(dynamic.clone()).unwrap();

        assert_eq!(builder.run(Mode::Build).unwrap(), BuildResultCode::Successful);
        assert_eq!(dynamic.status(), ResultStatus::Successful);
        assert_eq!(active.lock().unwrap().1, 2);
        assert!(provided.iter().all(|step| step.status() == ResultStatus::Successful));
        assert_eq!(dynamic.children().len(), 6);
    }

    #[test]
    fn test_high_priority_steps_get_extra_slots() {
        let dir = tempdir().unwrap();
        let builder = builder(dir.path());
        let active = Arc::new(Mutex::new((0, 0)));
        let provided: Vec<_> = (0..4)
            .map(|i| {
                let step = BuildStep::command(Overlapping {
                    name: format!("urgent{}", i),
                    active: active.clone(),
                });
                step.set_priority(-1);
                step
            })
            .collect();
        let dynamic = BuildStep::dynamic(Arc::new(Queue(Mutex::new(provided))), 1);
        let state = dynamic.dynamic_ref().unwrap();
        state.set_max_high_priority_parallel_steps(1);
        state.close();
        builder.add(dynamic.clone()).unwrap();

        assert_eq!(builder.run(Mode::Build).unwrap(), BuildResultCode::Successful);
        assert_eq!(active.lock().unwrap().1, 2);
    }

    #[test]
    fn test_spawned_command_runs_as_child_step() {
        struct Spawner {
            target: PathBuf,
        }

        impl Command for Spawner {
            fn kind(&self) -> &str {
                "spawner"
            }
            fn parameters(&self) -> serde_json::Value {
                serde_json::json!({ "target": self.target })
            }
            fn execute<'a>(&'a self, ctx: &'a CommandContext) -> CommandFuture<'a> {
                Box::pin(async move {
                    let spawned = crate::command::ShellCommand {
                        outputs: vec![self.target.clone()],
                        ..crate::command::ShellCommand::new(format!(
                            "echo spawned > {}",
                            self.target.display()
                        ))
                    };
                    Ok(ctx.spawn_command(spawned.payload()).await?)
                })
            }
        }

        let dir = tempdir().unwrap();
        let builder = builder(dir.path());
        let target = dir.path().join("spawned.txt");
        let parent = BuildStep::command(Spawner { target: target.clone() });
        builder.add(parent.clone()).unwrap();

        assert_eq!(builder.run(Mode::Build).unwrap(), BuildResultCode::Successful);
        assert_eq!(parent.status(), ResultStatus::Successful);
        let spawned = parent.spawned_steps();
        assert_eq!(spawned.len(), 1);
        assert_eq!(spawned[0].status(), ResultStatus::Successful);
        assert!(Arc::ptr_eq(&spawned[0].parent().unwrap(), &parent));
        assert!(target.exists());
        assert_eq!(parent.result().unwrap().spawned_commands.len(), 1);
    }

    #[test]
    fn test_fault_still_saves_recorded_results() {
        let dir = tempdir().unwrap();
        let mut builder = builder(dir.path());
        let (a, _) = counted("a", ResultStatus::Successful);
        let (b, _) = counted("b", ResultStatus::Successful);
        crate::step::link_build_steps(&a, &b);
        builder.add(a.clone()).unwrap();
        builder.add(b).unwrap();
        builder.on_step_processed(|step| {
            if step.title() == "b" {
                panic!("listener crashed");
            }
        });

        assert!(matches!(builder.run(Mode::Build), Err(BuildError::MicroThread { .. })));

        let fingerprint = a.command_ref().map(crate::command::fingerprint).unwrap().unwrap();
        let mut index = Index::open(Index::index_path(dir.path(), "test")).unwrap();
        index.refresh().unwrap();
        assert!(index.get(&fingerprint).is_some());
    }

    #[test]
    fn test_warm_file_hashes_fills_the_tracker() {
        let dir = tempdir().unwrap();
        let builder = builder(dir.path());
        let paths: Vec<PathBuf> = (0..3)
            .map(|i| {
                let path = dir.path().join(format!("input{}.txt", i));
                fs::write(&path, format!("content {}", i)).unwrap();
                path
            })
            .collect();
        let context = Arc::new(BuilderContext::new(
            dir.path(),
            "test",
            BuildParameters::new(),
            builder.tracker.clone(),
            builder.pool.clone(),
            CancellationFlag::new(),
        ));

        let scheduler = Scheduler::new();
        let warmed = paths.clone();
        scheduler.add(MicroThreadFlags::NONE, async move {
            warm_file_hashes(&context, warmed).await;
            Ok(())
        });
        scheduler.run_until_idle(Duration::from_millis(1)).unwrap();
        assert_eq!(builder.tracker().stats().hashed_files, 3);

        builder.tracker().compute_file_hash(&paths[0]);
        assert_eq!(builder.tracker().stats().hashed_files, 3);
    }
}
