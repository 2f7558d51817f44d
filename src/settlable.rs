//! The settlement state machine, the resolution procedure and `then`.
//!
//! A [`Settlable`] starts unsettled and settles exactly once, either
//! fulfilled with a value or rejected with a reason. Reactions attached with
//! [`Settlable::then`] never run inside the call that attached them nor inside
//! the call that settled the receiver: they are handed to the receiver's
//! [`Scheduler`] and run on a later turn.
use crate::{
    resolution::{Resolution, Thenable},
    scheduler::{self, Scheduler},
    Error,
};
use std::{
    any::Any,
    convert::Infallible,
    fmt,
    future::Future,
    mem,
    panic::{catch_unwind, AssertUnwindSafe},
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    task::{Context, Poll, Waker},
};

/// Success reaction. Returning `Err` rejects the chained settlable.
pub type OnFulfilled<T, E> = Box<dyn FnOnce(T) -> Result<Resolution<T, E>, E> + Send>;

/// Failure reaction. Returning `Ok` recovers the chained settlable.
pub type OnRejected<T, E> = Box<dyn FnOnce(E) -> Result<Resolution<T, E>, E> + Send>;

type Reaction<A> = Box<dyn FnOnce(A) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Unsettled,
    Fulfilled,
    Rejected,
}

enum Outcome<T, E> {
    Unsettled,
    Fulfilled(T),
    Rejected(E),
}

struct Inner<T, E> {
    outcome: Outcome<T, E>,
    fulfill_reactions: Vec<Reaction<T>>,
    reject_reactions: Vec<Reaction<E>>,
    wakers: Vec<Waker>,
}

/// Registries emptied by a transition.
struct Drained<T, E> {
    fulfill: Vec<Reaction<T>>,
    reject: Vec<Reaction<E>>,
    wakers: Vec<Waker>,
}

/// A value that is not available yet.
///
/// Cloning yields another handle to the same settlable.
///
/// # Examples
///
/// ```
/// use settlable::{scheduler::MicrotaskQueue, Resolution, Settlable, State};
/// use std::sync::Arc;
///
/// let queue = MicrotaskQueue::new();
/// let p = Settlable::<i32, String>::with_scheduler(Arc::new(queue.clone()), |resolve, _reject| {
///     resolve.fulfill(3);
/// });
/// let doubled = p.then(Some(Box::new(|v: i32| Ok(Resolution::Value(v * 2)))), None);
/// assert_eq!(doubled.state(), State::Unsettled);
/// queue.run_until_stalled();
/// assert_eq!(doubled.peek(), Some(Ok(6)));
/// ```
pub struct Settlable<T, E> {
    inner: Arc<Mutex<Inner<T, E>>>,
    scheduler: Arc<dyn Scheduler>,
}

impl<T, E> Clone for Settlable<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            scheduler: self.scheduler.clone(),
        }
    }
}

impl<T, E> Settlable<T, E> {
    fn lock(&self) -> MutexGuard<'_, Inner<T, E>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> State {
        match self.lock().outcome {
            Outcome::Unsettled => State::Unsettled,
            Outcome::Fulfilled(_) => State::Fulfilled,
            Outcome::Rejected(_) => State::Rejected,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.state() != State::Unsettled
    }

    /// The scheduler reactions of this settlable and its chain are deferred to.
    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    /// Whether both handles point at the same settlable.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T, E> Settlable<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Creates a settlable on the [current](scheduler::current) scheduler and
    /// runs `init` immediately with its capabilities.
    pub fn new<F>(init: F) -> Self
    where
        F: FnOnce(Resolver<T, E>, Rejecter<T, E>),
    {
        Self::with_scheduler(scheduler::current(), init)
    }

    /// Like [`new`](Self::new), but an initializer failure is returned instead
    /// of a settlable.
    pub fn try_new<F, X>(init: F) -> Result<Self, X>
    where
        F: FnOnce(Resolver<T, E>, Rejecter<T, E>) -> Result<(), X>,
    {
        Self::try_with_scheduler(scheduler::current(), init)
    }

    pub fn with_scheduler<F>(scheduler: Arc<dyn Scheduler>, init: F) -> Self
    where
        F: FnOnce(Resolver<T, E>, Rejecter<T, E>),
    {
        let constructed = Self::try_with_scheduler(scheduler, |resolve, reject| {
            init(resolve, reject);
            Ok::<(), Infallible>(())
        });
        match constructed {
            Ok(settlable) => settlable,
            Err(never) => match never {},
        }
    }

    pub fn try_with_scheduler<F, X>(scheduler: Arc<dyn Scheduler>, init: F) -> Result<Self, X>
    where
        F: FnOnce(Resolver<T, E>, Rejecter<T, E>) -> Result<(), X>,
    {
        let settlable = Self::pending(scheduler);
        let (resolve, reject) = settlable.capabilities();
        init(resolve, reject)?;
        Ok(settlable)
    }

    pub(crate) fn pending(scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                outcome: Outcome::Unsettled,
                fulfill_reactions: vec![],
                reject_reactions: vec![],
                wakers: vec![],
            })),
            scheduler,
        }
    }

    pub(crate) fn capabilities(&self) -> (Resolver<T, E>, Rejecter<T, E>) {
        (
            Resolver {
                target: self.clone(),
                latch: None,
            },
            Rejecter {
                target: self.clone(),
                latch: None,
            },
        )
    }

    /// The settled outcome, if any.
    pub fn peek(&self) -> Option<Result<T, E>> {
        match &self.lock().outcome {
            Outcome::Unsettled => None,
            Outcome::Fulfilled(value) => Some(Ok(value.clone())),
            Outcome::Rejected(reason) => Some(Err(reason.clone())),
        }
    }

    /// Attaches reactions and returns the settlable they settle.
    ///
    /// A missing reaction passes the value or reason through unchanged.
    /// Whatever a reaction returns goes through the resolution procedure, so a
    /// returned settlable or thenable is unwrapped; an `Err` rejects.
    ///
    /// Failures of the chain itself also reject: a reaction returning the
    /// settlable it settles rejects with [`Error::SelfResolution`], and a
    /// panicking reaction with [`Error::ReactionPanicked`].
    pub fn then(
        &self,
        on_fulfilled: Option<OnFulfilled<T, E>>,
        on_rejected: Option<OnRejected<T, E>>,
    ) -> Self
    where
        E: From<Error>,
    {
        let next = Self::pending(self.scheduler.clone());
        let fulfilled_next = next.clone();
        let rejected_next = next.clone();
        self.subscribe(
            move |value| {
                fulfilled_next.settle_with(match on_fulfilled {
                    Some(reaction) => run_reaction(reaction, value),
                    None => Ok(Resolution::Value(value)),
                })
            },
            move |reason| {
                rejected_next.settle_with(match on_rejected {
                    Some(reaction) => run_reaction(reaction, reason),
                    None => Err(reason),
                })
            },
        );
        next
    }

    /// `then` with only a failure reaction.
    pub fn catch<F>(&self, on_rejected: F) -> Self
    where
        E: From<Error>,
        F: FnOnce(E) -> Result<Resolution<T, E>, E> + Send + 'static,
    {
        self.then(None, Some(Box::new(on_rejected)))
    }

    /// Runs `on_fulfilled` or `on_rejected` on a later turn once settled.
    fn subscribe<F, R>(&self, on_fulfilled: F, on_rejected: R)
    where
        F: FnOnce(T) + Send + 'static,
        R: FnOnce(E) + Send + 'static,
    {
        let settled = {
            let mut guard = self.lock();
            let inner = &mut *guard;
            match &inner.outcome {
                Outcome::Unsettled => {
                    let scheduler = self.scheduler.clone();
                    inner.fulfill_reactions.push(Box::new(move |value| {
                        scheduler.defer(Box::new(move || on_fulfilled(value)))
                    }));
                    let scheduler = self.scheduler.clone();
                    inner.reject_reactions.push(Box::new(move |reason| {
                        scheduler.defer(Box::new(move || on_rejected(reason)))
                    }));
                    return;
                }
                Outcome::Fulfilled(value) => Ok(value.clone()),
                Outcome::Rejected(reason) => Err(reason.clone()),
            }
        };
        match settled {
            Ok(value) => self.scheduler.defer(Box::new(move || on_fulfilled(value))),
            Err(reason) => self.scheduler.defer(Box::new(move || on_rejected(reason))),
        }
    }

    fn settle_with(&self, outcome: Result<Resolution<T, E>, E>)
    where
        E: From<Error>,
    {
        match outcome {
            Ok(resolution) => {
                if let Err(err) = self.resolve_with(resolution) {
                    tracing::debug!(%err, "reaction result refused, rejecting the chain");
                    self.reject_with(err.into());
                }
            }
            Err(reason) => self.reject_with(reason),
        }
    }

    /// The resolution procedure.
    pub(crate) fn resolve_with(&self, result: Resolution<T, E>) -> Result<(), Error> {
        match result {
            Resolution::Settlable(other) if self.ptr_eq(&other) => Err(Error::SelfResolution),
            _ if self.is_settled() => Ok(()),
            Resolution::Settlable(other) => {
                self.adopt(&other);
                Ok(())
            }
            Resolution::Thenable(object) => {
                self.assimilate(object);
                Ok(())
            }
            Resolution::Value(value) => {
                self.fulfill(value);
                Ok(())
            }
        }
    }

    /// Mirrors the outcome of `other` once it settles.
    fn adopt(&self, other: &Self) {
        let fulfill = self.clone();
        let reject = self.clone();
        // Payloads of a settled settlable are already unwrapped.
        other.subscribe(
            move |value| fulfill.fulfill(value),
            move |reason| reject.reject_with(reason),
        );
    }

    fn assimilate(&self, object: Box<dyn Thenable<T, E>>) {
        let then = match object.then_op() {
            Ok(Some(then)) => then,
            Ok(None) => return self.fulfill(object.into_value()),
            Err(reason) => return self.reject_with(reason),
        };
        let latch = Arc::new(AtomicBool::new(false));
        let resolve = Resolver {
            target: self.clone(),
            latch: Some(latch.clone()),
        };
        let reject = Rejecter {
            target: self.clone(),
            latch: Some(latch.clone()),
        };
        if let Err(reason) = then(resolve, reject) {
            if latch.swap(true, Ordering::AcqRel) {
                tracing::debug!("thenable failed after settling it, error discarded");
            } else {
                self.reject_with(reason);
            }
        }
    }

    fn transition(&self, outcome: Outcome<T, E>) -> Option<Drained<T, E>> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if !matches!(inner.outcome, Outcome::Unsettled) {
            return None;
        }
        inner.outcome = outcome;
        Some(Drained {
            fulfill: mem::take(&mut inner.fulfill_reactions),
            reject: mem::take(&mut inner.reject_reactions),
            wakers: mem::take(&mut inner.wakers),
        })
    }

    fn fulfill(&self, value: T) {
        let Some(drained) = self.transition(Outcome::Fulfilled(value.clone())) else {
            return;
        };
        tracing::trace!(reactions = drained.fulfill.len(), "settlable fulfilled");
        for reaction in drained.fulfill {
            reaction(value.clone());
        }
        drained.wakers.into_iter().for_each(Waker::wake);
    }

    pub(crate) fn reject_with(&self, reason: E) {
        let Some(drained) = self.transition(Outcome::Rejected(reason.clone())) else {
            return;
        };
        tracing::trace!(reactions = drained.reject.len(), "settlable rejected");
        for reaction in drained.reject {
            reaction(reason.clone());
        }
        drained.wakers.into_iter().for_each(Waker::wake);
    }
}

impl<T: Clone, E: Clone> Future for Settlable<T, E> {
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        match &inner.outcome {
            Outcome::Fulfilled(value) => Poll::Ready(Ok(value.clone())),
            Outcome::Rejected(reason) => Poll::Ready(Err(reason.clone())),
            Outcome::Unsettled => {
                if !inner.wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    inner.wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

impl<T: fmt::Debug, E: fmt::Debug> fmt::Debug for Settlable<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        let mut out = f.debug_struct("Settlable");
        match &inner.outcome {
            Outcome::Unsettled => out.field("state", &State::Unsettled),
            Outcome::Fulfilled(value) => out.field("state", &State::Fulfilled).field("value", value),
            Outcome::Rejected(reason) => out.field("state", &State::Rejected).field("reason", reason),
        };
        out.finish()
    }
}

/// Runs a user reaction, turning a panic into a rejection of the chain.
fn run_reaction<A, T, E>(
    reaction: Box<dyn FnOnce(A) -> Result<Resolution<T, E>, E> + Send>,
    input: A,
) -> Result<Resolution<T, E>, E>
where
    E: From<Error>,
{
    catch_unwind(AssertUnwindSafe(move || reaction(input))).unwrap_or_else(|payload| {
        let message = panic_message(payload.as_ref());
        tracing::warn!(%message, "reaction panicked");
        Err(Error::ReactionPanicked(message).into())
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

fn claim(latch: &Option<Arc<AtomicBool>>) -> bool {
    latch
        .as_ref()
        .map_or(true, |latch| !latch.swap(true, Ordering::AcqRel))
}

/// Capability that moves a settlable toward fulfillment.
pub struct Resolver<T, E> {
    target: Settlable<T, E>,
    latch: Option<Arc<AtomicBool>>,
}

/// Capability that rejects a settlable.
pub struct Rejecter<T, E> {
    target: Settlable<T, E>,
    latch: Option<Arc<AtomicBool>>,
}

impl<T, E> Resolver<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Resolves the target with `result`, unwrapping settlables and
    /// thenables first. No-op once the target is settled.
    ///
    /// Resolving a settlable with itself is refused with
    /// [`Error::SelfResolution`] and leaves it untouched.
    pub fn resolve(&self, result: Resolution<T, E>) -> Result<(), Error> {
        // A refused resolution must leave a thenable's latch open.
        if self.latch.as_ref().is_some_and(|latch| latch.load(Ordering::Acquire)) {
            return Ok(());
        }
        if matches!(&result, Resolution::Settlable(other) if self.target.ptr_eq(other)) {
            return Err(Error::SelfResolution);
        }
        if !claim(&self.latch) {
            return Ok(());
        }
        self.target.resolve_with(result)
    }

    pub fn fulfill(&self, value: T) {
        if claim(&self.latch) {
            self.target.fulfill(value);
        }
    }
}

impl<T, E> Rejecter<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    pub fn reject(&self, reason: E) {
        if claim(&self.latch) {
            self.target.reject_with(reason);
        }
    }
}

impl<T, E> Clone for Resolver<T, E> {
    fn clone(&self) -> Self {
        Self {
            target: self.target.clone(),
            latch: self.latch.clone(),
        }
    }
}

impl<T, E> Clone for Rejecter<T, E> {
    fn clone(&self) -> Self {
        Self {
            target: self.target.clone(),
            latch: self.latch.clone(),
        }
    }
}

impl<T, E> fmt::Debug for Resolver<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("latched", &self.latch.is_some())
            .finish_non_exhaustive()
    }
}

impl<T, E> fmt::Debug for Rejecter<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejecter")
            .field("latched", &self.latch.is_some())
            .finish_non_exhaustive()
    }
}
