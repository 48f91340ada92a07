//! MicroThread Scheduler - cooperative execution of suspendable build work
//!
//! Features:
//! - Many microthreads interleaved on the single driving thread
//! - Stable tick order: `(priority, id)` snapshot taken when a tick starts
//! - Wakes and spawns during a tick are deferred to the next tick
//! - Errors and panics are captured per microthread
//! - Runtime-agnostic: any std future (tokio oneshot, JoinHandle) can be awaited
//! - `offload` joins CPU or process work running on a rayon pool

use crate::error::BuildError;
use anyhow::anyhow;
use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::ops::BitOr;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Wake, Waker};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Body of a microthread
pub type MicroThreadFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>>>>;

static NEXT_MICROTHREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: RefCell<Option<(Scheduler, MicroThread)>> = const { RefCell::new(None) };
}

/// Microthread behaviour flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MicroThreadFlags(u8);

impl MicroThreadFlags {
    pub const NONE: MicroThreadFlags = MicroThreadFlags(0);
    /// Record failures without surfacing them from `Scheduler::run`
    pub const IGNORE_EXCEPTIONS: MicroThreadFlags = MicroThreadFlags(1);

    pub fn contains(self, other: MicroThreadFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for MicroThreadFlags {
    type Output = MicroThreadFlags;

    fn bitor(self, rhs: Self) -> Self {
        MicroThreadFlags(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicroThreadState {
    Starting,
    Running,
    Completed,
    Failed,
}

impl MicroThreadState {
    pub fn is_terminal(self) -> bool {
        matches!(self, MicroThreadState::Completed | MicroThreadState::Failed)
    }
}

// ============================================================================
// Signal
// ============================================================================

struct SignalInner {
    set: AtomicBool,
    waiters: Mutex<Vec<Waker>>,
}

/// One-shot latch: once set, every present and future waiter resolves
#[derive(Clone)]
pub struct Signal {
    inner: Arc<SignalInner>,
}

impl Signal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SignalInner {
                set: AtomicBool::new(false),
                waiters: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn set(&self) {
        self.inner.set.store(true, Ordering::SeqCst);
        let waiters = std::mem::take(&mut *self.inner.waiters.lock().unwrap());
        for waker in waiters {
            waker.wake();
        }
    }

    pub fn is_set(&self) -> bool {
        self.inner.set.load(Ordering::SeqCst)
    }

    pub fn wait(&self) -> SignalWait {
        SignalWait {
            signal: self.clone(),
        }
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SignalWait {
    signal: Signal,
}

impl Future for SignalWait {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.signal.is_set() {
            return Poll::Ready(());
        }
        let mut waiters = self.signal.inner.waiters.lock().unwrap();
        // Re-check under the lock so a concurrent `set` cannot be missed
        if self.signal.is_set() {
            return Poll::Ready(());
        }
        waiters.push(cx.waker().clone());
        Poll::Pending
    }
}

// ============================================================================
// MicroThread
// ============================================================================

struct MicroThreadInner {
    id: u64,
    name: String,
    priority: i64,
    flags: MicroThreadFlags,
    state: Mutex<MicroThreadState>,
    error: Mutex<Option<Arc<anyhow::Error>>>,
    tag: Mutex<Option<String>>,
    done: Signal,
}

/// Handle to a unit of work owned by a `Scheduler`
#[derive(Clone)]
pub struct MicroThread {
    inner: Arc<MicroThreadInner>,
}

impl MicroThread {
    fn new(name: String, priority: i64, flags: MicroThreadFlags) -> Self {
        Self {
            inner: Arc::new(MicroThreadInner {
                id: NEXT_MICROTHREAD_ID.fetch_add(1, Ordering::Relaxed),
                name,
                priority,
                flags,
                state: Mutex::new(MicroThreadState::Starting),
                error: Mutex::new(None),
                tag: Mutex::new(None),
                done: Signal::new(),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Lower values run first within a tick
    pub fn priority(&self) -> i64 {
        self.inner.priority
    }

    pub fn flags(&self) -> MicroThreadFlags {
        self.inner.flags
    }

    pub fn state(&self) -> MicroThreadState {
        *self.inner.state.lock().unwrap()
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn error(&self) -> Option<Arc<anyhow::Error>> {
        self.inner.error.lock().unwrap().clone()
    }

    pub fn tag(&self) -> Option<String> {
        self.inner.tag.lock().unwrap().clone()
    }

    pub fn set_tag(&self, tag: impl Into<String>) {
        *self.inner.tag.lock().unwrap() = Some(tag.into());
    }

    /// Resolves once the microthread is `Completed` or `Failed`
    pub fn completed(&self) -> SignalWait {
        self.inner.done.wait()
    }

    pub fn outcome(&self) -> MicroThreadOutcome {
        MicroThreadOutcome {
            id: self.id(),
            state: self.state(),
            error: self.error(),
        }
    }

    fn set_state(&self, state: MicroThreadState) {
        *self.inner.state.lock().unwrap() = state;
    }

    fn finish(&self, error: Option<anyhow::Error>) {
        match error {
            Some(err) => {
                *self.inner.error.lock().unwrap() = Some(Arc::new(err));
                self.set_state(MicroThreadState::Failed);
            }
            None => self.set_state(MicroThreadState::Completed),
        }
        self.inner.done.set();
    }
}

impl fmt::Debug for MicroThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MicroThread")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

/// Terminal view of a joined microthread
#[derive(Debug, Clone)]
pub struct MicroThreadOutcome {
    pub id: u64,
    pub state: MicroThreadState,
    pub error: Option<Arc<anyhow::Error>>,
}

impl MicroThreadOutcome {
    pub fn succeeded(&self) -> bool {
        self.state == MicroThreadState::Completed
    }
}

// ============================================================================
// Scheduler
// ============================================================================

struct ThreadWaker {
    id: u64,
    queued: AtomicBool,
    ready: Arc<Mutex<Vec<u64>>>,
}

impl Wake for ThreadWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if !self.queued.swap(true, Ordering::AcqRel) {
            self.ready.lock().unwrap().push(self.id);
        }
    }
}

struct Entry {
    thread: MicroThread,
    future: Option<MicroThreadFuture>,
    waker: Arc<ThreadWaker>,
}

struct SchedulerInner {
    entries: RefCell<HashMap<u64, Entry>>,
    ready: Arc<Mutex<Vec<u64>>>,
    timers: RefCell<Vec<(Instant, Waker)>>,
}

/// Single-threaded cooperative scheduler
///
/// The handle is cheap to clone but not `Send`: a scheduler is driven by the
/// thread that created it.
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<SchedulerInner>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(SchedulerInner {
                entries: RefCell::new(HashMap::new()),
                ready: Arc::new(Mutex::new(Vec::new())),
                timers: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Register a new microthread; it first runs on the next tick
    pub fn add<F>(&self, flags: MicroThreadFlags, future: F) -> MicroThread
    where
        F: Future<Output = anyhow::Result<()>> + 'static,
    {
        self.add_with("microthread", 0, flags, future)
    }

    pub fn add_with_priority<F>(&self, priority: i64, flags: MicroThreadFlags, future: F) -> MicroThread
    where
        F: Future<Output = anyhow::Result<()>> + 'static,
    {
        self.add_with("microthread", priority, flags, future)
    }

    pub fn add_with<F>(
        &self,
        name: impl Into<String>,
        priority: i64,
        flags: MicroThreadFlags,
        future: F,
    ) -> MicroThread
    where
        F: Future<Output = anyhow::Result<()>> + 'static,
    {
        let thread = MicroThread::new(name.into(), priority, flags);
        let waker = Arc::new(ThreadWaker {
            id: thread.id(),
            queued: AtomicBool::new(true),
            ready: self.inner.ready.clone(),
        });
        self.inner.entries.borrow_mut().insert(
            thread.id(),
            Entry {
                thread: thread.clone(),
                future: Some(Box::pin(future)),
                waker,
            },
        );
        self.inner.ready.lock().unwrap().push(thread.id());
        thread
    }

    /// Number of microthreads not yet terminal
    pub fn len(&self) -> usize {
        self.inner.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_ready(&self) -> bool {
        !self.inner.ready.lock().unwrap().is_empty()
    }

    /// Scheduler driving the microthread currently being polled
    pub fn current() -> Option<Scheduler> {
        CURRENT.with(|current| current.borrow().as_ref().map(|(s, _)| s.clone()))
    }

    pub fn current_microthread() -> Option<MicroThread> {
        CURRENT.with(|current| current.borrow().as_ref().map(|(_, t)| t.clone()))
    }

    /// Advance every ready microthread to its next suspension point.
    ///
    /// The tick always completes; the first failure of a microthread without
    /// `IGNORE_EXCEPTIONS` is then returned.
    pub fn run(&self) -> Result<(), BuildError> {
        self.fire_timers();

        let ids = std::mem::take(&mut *self.inner.ready.lock().unwrap());
        let mut batch: Vec<(i64, u64)> = {
            let entries = self.inner.entries.borrow();
            ids.into_iter()
                .filter_map(|id| entries.get(&id).map(|e| (e.thread.priority(), id)))
                .collect()
        };
        batch.sort_unstable();
        batch.dedup();

        let mut first_failure = None;
        for (_, id) in batch {
            let taken = {
                let mut entries = self.inner.entries.borrow_mut();
                entries.get_mut(&id).and_then(|entry| {
                    entry
                        .future
                        .take()
                        .map(|future| (future, entry.waker.clone(), entry.thread.clone()))
                })
            };
            let Some((mut future, thread_waker, thread)) = taken else {
                continue;
            };

            thread_waker.queued.store(false, Ordering::Release);
            thread.set_state(MicroThreadState::Running);
            let waker = Waker::from(thread_waker);
            let mut cx = Context::from_waker(&waker);

            let polled = {
                let _guard = CurrentGuard::enter(self.clone(), thread.clone());
                panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx)))
            };

            let error = match polled {
                Ok(Poll::Pending) => {
                    if let Some(entry) = self.inner.entries.borrow_mut().get_mut(&id) {
                        entry.future = Some(future);
                    }
                    continue;
                }
                Ok(Poll::Ready(Ok(()))) => None,
                Ok(Poll::Ready(Err(err))) => Some(err),
                Err(payload) => Some(anyhow!("panicked: {}", panic_message(payload.as_ref()))),
            };

            let removed = self.inner.entries.borrow_mut().remove(&id);
            drop(removed);
            drop(future);

            if let Some(err) = &error {
                if thread.flags().contains(MicroThreadFlags::IGNORE_EXCEPTIONS) {
                    debug!(microthread = id, "ignored failure: {:#}", err);
                } else {
                    warn!(microthread = id, name = thread.name(), "microthread failed: {:#}", err);
                    if first_failure.is_none() {
                        first_failure = Some(BuildError::MicroThread {
                            id,
                            name: thread.name().to_string(),
                            message: format!("{:#}", err),
                        });
                    }
                }
            }
            thread.finish(error);
        }

        match first_failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Drive ticks until no microthread remains, yielding the OS thread while
    /// everything is suspended on external work
    pub fn run_until_idle(&self, poll_interval: Duration) -> Result<(), BuildError> {
        loop {
            self.run()?;
            if self.is_empty() {
                return Ok(());
            }
            if !self.has_ready() {
                thread::sleep(self.idle_sleep(poll_interval));
            }
        }
    }

    /// Drop every pending microthread without running it further
    pub fn clear(&self) {
        let entries = std::mem::take(&mut *self.inner.entries.borrow_mut());
        self.inner.ready.lock().unwrap().clear();
        self.inner.timers.borrow_mut().clear();
        drop(entries);
    }

    fn register_timer(&self, deadline: Instant, waker: Waker) {
        self.inner.timers.borrow_mut().push((deadline, waker));
    }

    fn fire_timers(&self) {
        let now = Instant::now();
        let expired: Vec<Waker> = {
            let mut timers = self.inner.timers.borrow_mut();
            let (expired, pending): (Vec<_>, Vec<_>) =
                timers.drain(..).partition(|(deadline, _)| *deadline <= now);
            *timers = pending;
            expired.into_iter().map(|(_, waker)| waker).collect()
        };
        for waker in expired {
            waker.wake();
        }
    }

    fn idle_sleep(&self, poll_interval: Duration) -> Duration {
        let now = Instant::now();
        self.inner
            .timers
            .borrow()
            .iter()
            .map(|(deadline, _)| deadline.saturating_duration_since(now))
            .min()
            .map_or(poll_interval, |until| until.min(poll_interval))
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

struct CurrentGuard {
    previous: Option<(Scheduler, MicroThread)>,
}

impl CurrentGuard {
    fn enter(scheduler: Scheduler, thread: MicroThread) -> Self {
        let previous = CURRENT.with(|current| current.borrow_mut().replace((scheduler, thread)));
        Self { previous }
    }
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|current| *current.borrow_mut() = previous);
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// ============================================================================
// Suspension primitives
// ============================================================================

pub struct NextTick {
    yielded: bool,
}

/// Suspend until the next scheduler tick
pub fn next_tick() -> NextTick {
    NextTick { yielded: false }
}

impl Future for NextTick {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

pub struct Delay {
    deadline: Instant,
}

/// Suspend for at least `duration`, measured across ticks
pub fn delay(duration: Duration) -> Delay {
    Delay {
        deadline: Instant::now() + duration,
    }
}

impl Future for Delay {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if Instant::now() >= self.deadline {
            return Poll::Ready(());
        }
        match Scheduler::current() {
            Some(scheduler) => scheduler.register_timer(self.deadline, cx.waker().clone()),
            None => cx.waker().wake_by_ref(),
        }
        Poll::Pending
    }
}

/// Wait until every microthread is terminal. A failed branch does not
/// affect its siblings; each outcome is reported independently.
pub async fn when_all(threads: &[MicroThread]) -> Vec<MicroThreadOutcome> {
    for thread in threads {
        thread.completed().await;
    }
    threads.iter().map(MicroThread::outcome).collect()
}

pub struct WaitAny<F> {
    waits: Vec<F>,
}

/// Resolves as soon as any of `waits` does. An empty list never resolves.
pub fn wait_any<F: Future<Output = ()> + Unpin>(waits: Vec<F>) -> WaitAny<F> {
    WaitAny { waits }
}

impl<F: Future<Output = ()> + Unpin> Future for WaitAny<F> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        for wait in self.waits.iter_mut() {
            if Pin::new(wait).poll(cx).is_ready() {
                return Poll::Ready(());
            }
        }
        Poll::Pending
    }
}

/// Turns a panic raised while polling the inner future into an error
pub struct CatchUnwind<F> {
    future: Pin<Box<F>>,
}

pub fn catch_unwind<F: Future>(future: F) -> CatchUnwind<F> {
    CatchUnwind {
        future: Box::pin(future),
    }
}

impl<F: Future> Future for CatchUnwind<F> {
    type Output = Result<F::Output, String>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let future = self.future.as_mut();
        match panic::catch_unwind(AssertUnwindSafe(|| future.poll(cx))) {
            Ok(Poll::Ready(output)) => Poll::Ready(Ok(output)),
            Ok(Poll::Pending) => Poll::Pending,
            Err(payload) => Poll::Ready(Err(panic_message(payload.as_ref()))),
        }
    }
}

/// Run ordinary blocking work on `pool` and suspend until it is done
pub async fn offload<T, F>(pool: Arc<rayon::ThreadPool>, work: F) -> anyhow::Result<T>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = tokio::sync::oneshot::channel();
    pool.spawn(move || {
        let result = panic::catch_unwind(AssertUnwindSafe(work)).unwrap_or_else(|payload| {
            Err(anyhow!(
                "offloaded work panicked: {}",
                panic_message(payload.as_ref())
            ))
        });
        let _ = tx.send(result);
    });
    rx.await
        .map_err(|_| anyhow!("offloaded work was dropped before completing"))?
}
