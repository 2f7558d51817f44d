//! Deferral of reaction jobs to a later scheduling turn.
//!
//! A [`MicrotaskQueue`] is the fine-grained facility: jobs wait in FIFO order
//! until the host drains the queue. A [`TimerScheduler`] is the coarse
//! fallback: a worker thread fed through an `mpsc` channel runs every job a
//! short delay after it was deferred. [`current`] picks between them.
use crate::{config::SchedulerConfig, Error};
use std::{
    cell::RefCell,
    collections::VecDeque,
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        mpsc::{channel, Receiver, Sender},
        Arc, Mutex, MutexGuard, OnceLock, PoisonError,
    },
    thread,
    time::Instant,
};

/// A unit of deferred work.
pub type Job = Box<dyn FnOnce() + Send>;

/// Runs jobs on a scheduling turn after the one that deferred them.
///
/// Jobs deferred through the same scheduler must run in the order they were
/// deferred.
pub trait Scheduler: Send + Sync {
    fn defer(&self, job: Job);
}

thread_local! {
    static ENTERED: RefCell<Option<MicrotaskQueue>> = const { RefCell::new(None) };
}

static FALLBACK: OnceLock<Arc<dyn Scheduler>> = OnceLock::new();
static ORPHAN: OnceLock<MicrotaskQueue> = OnceLock::new();

/// The scheduler new settlables use when none is given.
///
/// Prefers the [`MicrotaskQueue`] entered on this thread. Without one, a
/// process-wide [`TimerScheduler`] configured from the environment is used.
/// If its worker thread cannot be spawned the process falls back to
/// [`orphan_queue`], which the host then has to drain itself.
pub fn current() -> Arc<dyn Scheduler> {
    if let Some(queue) = ENTERED.with(|entered| entered.borrow().clone()) {
        return Arc::new(queue);
    }
    FALLBACK
        .get_or_init(|| match TimerScheduler::spawn(SchedulerConfig::from_env()) {
            Ok(timer) => {
                tracing::debug!("using timer scheduler as the default");
                Arc::new(timer)
            }
            Err(err) => {
                tracing::error!(%err, "timer scheduler unavailable, deferring to the orphan queue");
                Arc::new(orphan_queue())
            }
        })
        .clone()
}

/// Queue used by [`current`] when no timer thread could be started.
pub fn orphan_queue() -> MicrotaskQueue {
    ORPHAN.get_or_init(MicrotaskQueue::new).clone()
}

/// FIFO job queue drained explicitly by the host.
///
/// Cloning yields another handle to the same queue.
///
/// # Examples
///
/// ```
/// use settlable::scheduler::{MicrotaskQueue, Scheduler};
/// use std::sync::{Arc, Mutex};
///
/// let queue = MicrotaskQueue::new();
/// let seen = Arc::new(Mutex::new(Vec::new()));
/// for i in 0..3 {
///     let seen = seen.clone();
///     queue.defer(Box::new(move || seen.lock().unwrap().push(i)));
/// }
/// assert_eq!(queue.run_until_stalled(), 3);
/// assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
/// ```
#[derive(Clone, Default)]
pub struct MicrotaskQueue {
    jobs: Arc<Mutex<VecDeque<Job>>>,
}

impl MicrotaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Job>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs the oldest job. Returns `false` when the queue was empty.
    pub fn run_once(&self) -> bool {
        // The lock is released before the job runs; jobs defer more jobs.
        let job = self.lock().pop_front();
        match job {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }

    /// Runs jobs until the queue is empty, including jobs deferred while
    /// draining. Returns how many ran.
    pub fn run_until_stalled(&self) -> usize {
        let mut ran = 0;
        while self.run_once() {
            ran += 1;
        }
        tracing::trace!(ran, "microtask queue stalled");
        ran
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Makes this queue the current thread's default scheduler until the
    /// guard is dropped.
    pub fn enter(&self) -> EnterGuard {
        let previous = ENTERED.with(|entered| entered.borrow_mut().replace(self.clone()));
        EnterGuard { previous }
    }
}

impl Scheduler for MicrotaskQueue {
    fn defer(&self, job: Job) {
        self.lock().push_back(job);
    }
}

impl fmt::Debug for MicrotaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MicrotaskQueue")
            .field("pending", &self.len())
            .finish()
    }
}

/// Restores the previously entered queue on drop.
#[must_use = "the queue is only current while the guard is alive"]
#[derive(Debug)]
pub struct EnterGuard {
    previous: Option<MicrotaskQueue>,
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        ENTERED.with(|entered| *entered.borrow_mut() = previous);
    }
}

struct Timed {
    due: Instant,
    job: Job,
}

/// Runs jobs on a dedicated thread once their delay has elapsed.
///
/// Every job gets the same delay, so due times never decrease and the
/// channel order is the run order.
#[derive(Debug)]
pub struct TimerScheduler {
    sender: Mutex<Sender<Timed>>,
    config: SchedulerConfig,
}

impl TimerScheduler {
    /// Starts the worker thread. The thread exits once the scheduler is
    /// dropped and the jobs already sent have run.
    pub fn spawn(config: SchedulerConfig) -> Result<Self, Error> {
        let (tx, rx) = channel();
        thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || run_timer(rx))?;
        tracing::debug!(thread = %config.thread_name, delay = ?config.timer_delay, "timer scheduler started");
        Ok(Self {
            sender: Mutex::new(tx),
            config,
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }
}

impl Scheduler for TimerScheduler {
    fn defer(&self, job: Job) {
        let timed = Timed {
            due: Instant::now() + self.config.timer_delay,
            job,
        };
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        if sender.send(timed).is_err() {
            tracing::error!(thread = %self.config.thread_name, "timer worker is gone, job dropped");
        }
    }
}

fn run_timer(receiver: Receiver<Timed>) {
    for Timed { due, job } in receiver {
        let now = Instant::now();
        if due > now {
            thread::sleep(due - now);
        }
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            tracing::error!("deferred job panicked");
        }
    }
}
