//! Build Step Graph - steps, prerequisites and status propagation
//!
//! Features:
//! - Command steps and list (composite) steps with ordered children
//! - Dynamic steps fed by a provider while the build runs
//! - Steps spawned by running commands, kept under their spawning step
//! - Prerequisite links between arbitrary steps
//! - Terminal status set exactly once, with one-shot completion handlers
//! - petgraph-based cycle detection before a run

use crate::command::Command;
use crate::context::ResultEntry;
use crate::error::{BuildError, Result};
use crate::log::LogMessage;
use crate::scheduler::{panic_message, Signal, SignalWait};
use crate::status::ResultStatus;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::warn;

static NEXT_STEP_ID: AtomicU64 = AtomicU64::new(1);

/// Handler invoked once when a step reaches its terminal status
pub type StepHandler = Box<dyn FnOnce(&BuildStep) + Send>;

pub enum StepKind {
    Command(Box<dyn Command>),
    List(Mutex<Vec<Arc<BuildStep>>>),
    Dynamic(DynamicSteps),
}

/// Supplies the steps of a dynamic step while a build runs
pub trait BuildStepProvider: Send + Sync {
    /// Next step to schedule with a priority of at most `max_priority`
    fn next_build_step(&self, max_priority: i64) -> Option<Arc<BuildStep>>;
}

/// State of a dynamic step: a provider polled for work, with a bound on the
/// number of its steps running at once.
///
/// When the bound is reached, up to `max_high_priority_parallel_steps` more
/// slots are handed out to steps of negative priority only. The step
/// finishes once it is closed and the provider has nothing left.
pub struct DynamicSteps {
    provider: Arc<dyn BuildStepProvider>,
    max_parallel_steps: AtomicUsize,
    max_high_priority_parallel_steps: AtomicUsize,
    new_work: Mutex<Signal>,
    closed: AtomicBool,
    scheduled: Mutex<Vec<Arc<BuildStep>>>,
}

impl DynamicSteps {
    pub fn provider(&self) -> &Arc<dyn BuildStepProvider> {
        &self.provider
    }

    pub fn max_parallel_steps(&self) -> usize {
        self.max_parallel_steps.load(Ordering::Relaxed)
    }

    pub fn set_max_parallel_steps(&self, max: usize) {
        self.max_parallel_steps.store(max.max(1), Ordering::Relaxed);
    }

    pub fn max_high_priority_parallel_steps(&self) -> usize {
        self.max_high_priority_parallel_steps.load(Ordering::Relaxed)
    }

    pub fn set_max_high_priority_parallel_steps(&self, max: usize) {
        self.max_high_priority_parallel_steps.store(max, Ordering::Relaxed);
    }

    /// Wake the dynamic step so it polls the provider again
    pub fn notify_new_work_available(&self) {
        let previous = std::mem::take(&mut *self.new_work.lock().unwrap());
        previous.set();
    }

    /// Finish once the provider runs dry instead of waiting for more work
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify_new_work_available();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves on the next `notify_new_work_available`. Take it before
    /// polling the provider so that no notification is missed.
    pub fn new_work(&self) -> SignalWait {
        self.new_work.lock().unwrap().wait()
    }

    /// Steps handed out by the provider so far
    pub fn scheduled(&self) -> Vec<Arc<BuildStep>> {
        self.scheduled.lock().unwrap().clone()
    }
}

pub struct BuildStep {
    id: u64,
    kind: StepKind,
    name: Mutex<Option<String>>,
    status: Mutex<ResultStatus>,
    tag: Mutex<Option<String>>,
    module: Mutex<Option<String>>,
    priority: Mutex<Option<i64>>,
    parent: Mutex<Weak<BuildStep>>,
    prerequisites: Mutex<Vec<Arc<BuildStep>>>,
    spawned: Mutex<Vec<Arc<BuildStep>>>,
    execution_id: AtomicU64,
    result: Mutex<Option<ResultEntry>>,
    handlers: Mutex<Vec<StepHandler>>,
    processed: Signal,
}

impl BuildStep {
    fn with_kind(kind: StepKind) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_STEP_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            name: Mutex::new(None),
            status: Mutex::new(ResultStatus::NotProcessed),
            tag: Mutex::new(None),
            module: Mutex::new(None),
            priority: Mutex::new(None),
            parent: Mutex::new(Weak::new()),
            prerequisites: Mutex::new(Vec::new()),
            spawned: Mutex::new(Vec::new()),
            execution_id: AtomicU64::new(0),
            result: Mutex::new(None),
            handlers: Mutex::new(Vec::new()),
            processed: Signal::new(),
        })
    }

    /// Step executing a single command
    pub fn command(command: impl Command + 'static) -> Arc<Self> {
        Self::from_boxed(Box::new(command))
    }

    pub fn from_boxed(command: Box<dyn Command>) -> Arc<Self> {
        Self::with_kind(StepKind::Command(command))
    }

    /// Empty composite step
    pub fn list() -> Arc<Self> {
        Self::with_kind(StepKind::List(Mutex::new(Vec::new())))
    }

    /// Step scheduling whatever `provider` hands out, at most
    /// `max_parallel_steps` at a time
    pub fn dynamic(provider: Arc<dyn BuildStepProvider>, max_parallel_steps: usize) -> Arc<Self> {
        Self::with_kind(StepKind::Dynamic(DynamicSteps {
            provider,
            max_parallel_steps: AtomicUsize::new(max_parallel_steps.max(1)),
            max_high_priority_parallel_steps: AtomicUsize::new(0),
            new_work: Mutex::new(Signal::new()),
            closed: AtomicBool::new(false),
            scheduled: Mutex::new(Vec::new()),
        }))
    }

    pub fn list_of(children: impl IntoIterator<Item = Arc<BuildStep>>) -> Result<Arc<Self>> {
        let list = Self::list();
        for child in children {
            list.add(child)?;
        }
        Ok(list)
    }

    /// Append a child to a list step
    pub fn add(self: &Arc<Self>, child: Arc<BuildStep>) -> Result<()> {
        let StepKind::List(children) = &self.kind else {
            return Err(BuildError::NotComposite(self.title()));
        };
        if self.is_processed() {
            return Err(BuildError::AlreadyProcessed(self.title()));
        }
        {
            let mut parent = child.parent.lock().unwrap();
            if parent.upgrade().is_some() {
                return Err(BuildError::AlreadyParented(child.title()));
            }
            *parent = Arc::downgrade(self);
        }
        children.lock().unwrap().push(child);
        Ok(())
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> &StepKind {
        &self.kind
    }

    pub fn command_ref(&self) -> Option<&dyn Command> {
        match &self.kind {
            StepKind::Command(command) => Some(command.as_ref()),
            _ => None,
        }
    }

    pub fn dynamic_ref(&self) -> Option<&DynamicSteps> {
        match &self.kind {
            StepKind::Dynamic(dynamic) => Some(dynamic),
            _ => None,
        }
    }

    /// Take ownership of a step handed out by this dynamic step's provider.
    /// A step that already has a parent keeps it.
    pub(crate) fn adopt_provided(self: &Arc<Self>, child: &Arc<BuildStep>) {
        let StepKind::Dynamic(dynamic) = &self.kind else {
            return;
        };
        {
            let mut parent = child.parent.lock().unwrap();
            if parent.upgrade().is_none() {
                *parent = Arc::downgrade(self);
            }
        }
        dynamic.scheduled.lock().unwrap().push(child.clone());
    }

    /// Record a step spawned while this step's command was running
    pub(crate) fn add_spawned(self: &Arc<Self>, child: &Arc<BuildStep>) {
        *child.parent.lock().unwrap() = Arc::downgrade(self);
        self.spawned.lock().unwrap().push(child.clone());
    }

    /// Steps spawned by this step's command, in spawn order
    pub fn spawned_steps(&self) -> Vec<Arc<BuildStep>> {
        self.spawned.lock().unwrap().clone()
    }

    pub fn is_list(&self) -> bool {
        matches!(self.kind, StepKind::List(_))
    }

    pub fn title(&self) -> String {
        if let Some(name) = self.name.lock().unwrap().as_ref() {
            return name.clone();
        }
        match &self.kind {
            StepKind::Command(command) => command.title(),
            StepKind::List(children) => format!("list ({} steps)", children.lock().unwrap().len()),
            StepKind::Dynamic(_) => "dynamic".to_string(),
        }
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.lock().unwrap() = Some(name.into());
    }

    pub fn status(&self) -> ResultStatus {
        *self.status.lock().unwrap()
    }

    pub fn is_processed(&self) -> bool {
        self.status().is_processed()
    }

    pub fn succeeded(&self) -> bool {
        self.status().succeeded()
    }

    pub fn failed(&self) -> bool {
        self.status().failed()
    }

    /// Opaque reference to whatever produced this step (usually an asset)
    pub fn tag(&self) -> Option<String> {
        self.tag.lock().unwrap().clone()
    }

    pub fn set_tag(&self, tag: impl Into<String>) {
        *self.tag.lock().unwrap() = Some(tag.into());
    }

    pub fn module(&self) -> Option<String> {
        self.module.lock().unwrap().clone()
    }

    pub fn set_module(&self, module: impl Into<String>) {
        *self.module.lock().unwrap() = Some(module.into());
    }

    pub fn priority(&self) -> Option<i64> {
        *self.priority.lock().unwrap()
    }

    pub fn set_priority(&self, priority: i64) {
        *self.priority.lock().unwrap() = Some(priority);
    }

    /// Own priority, else the nearest ancestor's, else 0
    pub fn effective_priority(&self) -> i64 {
        if let Some(priority) = self.priority() {
            return priority;
        }
        let mut current = self.parent();
        while let Some(step) = current {
            if let Some(priority) = step.priority() {
                return priority;
            }
            current = step.parent();
        }
        0
    }

    pub fn parent(&self) -> Option<Arc<BuildStep>> {
        self.parent.lock().unwrap().upgrade()
    }

    pub fn prerequisites(&self) -> Vec<Arc<BuildStep>> {
        self.prerequisites.lock().unwrap().clone()
    }

    /// List children, or the steps a dynamic step has scheduled so far
    pub fn children(&self) -> Vec<Arc<BuildStep>> {
        match &self.kind {
            StepKind::List(children) => children.lock().unwrap().clone(),
            StepKind::Dynamic(dynamic) => dynamic.scheduled(),
            StepKind::Command(_) => Vec::new(),
        }
    }

    /// Every step contained below this one, depth first
    pub fn descendants(&self) -> Vec<Arc<BuildStep>> {
        let mut out = Vec::new();
        let mut stack: Vec<_> = self.children().into_iter().rev().collect();
        while let Some(step) = stack.pop() {
            stack.extend(step.children().into_iter().rev());
            out.push(step);
        }
        out
    }

    /// Id of the microthread that processed this step
    pub fn execution_id(&self) -> Option<u64> {
        match self.execution_id.load(Ordering::Relaxed) {
            0 => None,
            id => Some(id),
        }
    }

    pub(crate) fn set_execution_id(&self, id: u64) {
        self.execution_id.store(id, Ordering::Relaxed);
    }

    /// Result entry of a command step once processed
    pub fn result(&self) -> Option<ResultEntry> {
        self.result.lock().unwrap().clone()
    }

    pub(crate) fn set_result(&self, entry: ResultEntry) {
        *self.result.lock().unwrap() = Some(entry);
    }

    pub fn log_messages(&self) -> Vec<LogMessage> {
        self.result
            .lock()
            .unwrap()
            .as_ref()
            .map(|entry| entry.log_messages.clone())
            .unwrap_or_default()
    }

    /// Run `handler` once when the step becomes processed; immediately if it
    /// already is
    pub fn on_processed(&self, handler: impl FnOnce(&BuildStep) + Send + 'static) {
        {
            let mut handlers = self.handlers.lock().unwrap();
            if !self.is_processed() {
                handlers.push(Box::new(handler));
                return;
            }
        }
        handler(self);
    }

    /// Resolves once the step has a terminal status
    pub fn processed(&self) -> SignalWait {
        self.processed.wait()
    }

    /// Set the terminal status, run and drop the completion handlers
    pub fn register_result(&self, status: ResultStatus) -> Result<()> {
        if !status.is_processed() {
            return Err(BuildError::NotProcessed(self.title()));
        }
        {
            let mut current = self.status.lock().unwrap();
            if current.is_processed() {
                return Err(BuildError::AlreadyProcessed(self.title()));
            }
            *current = status;
        }

        let handlers = std::mem::take(&mut *self.handlers.lock().unwrap());
        for handler in handlers {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| handler(self))) {
                warn!(step = %self.title(), "step handler panicked: {}", panic_message(payload.as_ref()));
            }
        }
        self.processed.set();
        Ok(())
    }
}

impl fmt::Debug for BuildStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildStep")
            .field("id", &self.id)
            .field("title", &self.title())
            .field("status", &self.status())
            .finish()
    }
}

/// Make `dependent` wait for `prerequisite`
pub fn link_build_steps(prerequisite: &Arc<BuildStep>, dependent: &Arc<BuildStep>) {
    dependent
        .prerequisites
        .lock()
        .unwrap()
        .push(prerequisite.clone());
}

/// Status of a list step from its children's: failures win over
/// cancellation, which wins over success
pub fn composite_status(children: &[Arc<BuildStep>]) -> ResultStatus {
    let statuses: Vec<_> = children.iter().map(|c| c.status()).collect();
    if statuses.iter().any(|s| s.failed()) {
        ResultStatus::Failed
    } else if statuses
        .iter()
        .any(|s| matches!(s, ResultStatus::Cancelled | ResultStatus::NotProcessed))
    {
        ResultStatus::Cancelled
    } else {
        ResultStatus::Successful
    }
}

/// Reject prerequisite cycles (including a step waiting on its own
/// container) and prerequisites outside `root` that are not yet processed
pub fn check_for_cycles(root: &Arc<BuildStep>) -> Result<()> {
    let mut steps = vec![root.clone()];
    steps.extend(root.descendants());

    let mut graph: DiGraph<Arc<BuildStep>, ()> = DiGraph::new();
    let mut index: HashMap<u64, NodeIndex> = HashMap::new();
    for step in &steps {
        index.insert(step.id(), graph.add_node(step.clone()));
    }

    for step in &steps {
        let node = index[&step.id()];
        if let Some(parent) = step.parent() {
            if let Some(&parent_node) = index.get(&parent.id()) {
                graph.add_edge(node, parent_node, ());
            }
        }
        for prerequisite in step.prerequisites() {
            match index.get(&prerequisite.id()) {
                Some(&prerequisite_node) => {
                    graph.add_edge(prerequisite_node, node, ());
                }
                None if prerequisite.is_processed() => {}
                None => return Err(BuildError::UnscheduledPrerequisite(step.title())),
            }
        }
    }

    match toposort(&graph, None) {
        Ok(_) => Ok(()),
        Err(cycle) => Err(BuildError::CycleDetected(graph[cycle.node_id()].title())),
    }
}
