//! Deferred values that settle once and notify their reactions on a later
//! scheduling turn.
//!
//! A [`Settlable`] is created with an initializer receiving a [`Resolver`]
//! and a [`Rejecter`], or through a [`Deferred`] that hands both out.
//! Resolving runs the resolution procedure: another settlable is followed to
//! its outcome and a foreign [`Thenable`] is adopted through its `then`
//! operation, so reactions only ever observe plain values.
//!
//! # Examples
//!
//! ```
//! use settlable::{scheduler::MicrotaskQueue, Deferred, Resolution};
//! use std::sync::Arc;
//!
//! let queue = MicrotaskQueue::new();
//! let deferred = Deferred::<i32, String>::with_scheduler(Arc::new(queue.clone()));
//! let chained = deferred
//!     .settlable
//!     .then(Some(Box::new(|v: i32| Err(format!("got {v}")))), None)
//!     .catch(|reason| Ok(Resolution::Value(reason.len() as i32)));
//!
//! deferred.resolve.fulfill(1);
//! queue.run_until_stalled();
//! assert_eq!(chained.peek(), Some(Ok(5)));
//! ```
use thiserror::Error;

pub mod config;
mod deferred;
mod resolution;
pub mod scheduler;
mod settlable;

pub use deferred::Deferred;
pub use resolution::{Resolution, ThenFn, Thenable};
pub use settlable::{OnFulfilled, OnRejected, Rejecter, Resolver, Settlable, State};

/// Failures of the settlement machinery itself.
///
/// Chained settlables reject with these, so [`Settlable::then`] requires the
/// rejection type to be convertible from `Error`.
#[derive(Error, Debug)]
pub enum Error {
    #[error("a settlable cannot be resolved with itself")]
    SelfResolution,
    #[error("reaction panicked: {0}")]
    ReactionPanicked(String),
    #[error("failed to start the timer scheduler: {0}")]
    SchedulerSpawn(#[from] std::io::Error),
}

impl From<Error> for String {
    fn from(err: Error) -> Self {
        err.to_string()
    }
}
