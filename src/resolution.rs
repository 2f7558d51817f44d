//! The argument a settlable is resolved with.
use crate::settlable::{Rejecter, Resolver, Settlable};
use std::fmt;

/// The `then` operation of a foreign object. It receives capabilities that
/// share a one-shot latch: only the first call of either has effect.
/// Returning `Err` is the operation failing.
pub type ThenFn<T, E> = Box<dyn FnOnce(Resolver<T, E>, Rejecter<T, E>) -> Result<(), E> + Send>;

/// A foreign object that may expose a `then` operation.
///
/// # Examples
///
/// ```
/// use settlable::{Rejecter, Resolution, Resolver, ThenFn, Thenable};
///
/// struct Five;
///
/// impl Thenable<i32, String> for Five {
///     fn then_op(&self) -> Result<Option<ThenFn<i32, String>>, String> {
///         Ok(Some(Box::new(|resolve: Resolver<i32, String>, _reject: Rejecter<i32, String>| {
///             resolve.fulfill(5);
///             Ok(())
///         })))
///     }
///
///     fn into_value(self: Box<Self>) -> i32 {
///         0
///     }
/// }
///
/// let _arg: Resolution<i32, String> = Resolution::thenable(Five);
/// ```
pub trait Thenable<T, E>: Send {
    /// Reads the `then` member. Called at most once per resolution.
    ///
    /// `Ok(None)` means the member is not invokable and the object is taken
    /// as a plain value; `Err` means reading it failed.
    fn then_op(&self) -> Result<Option<ThenFn<T, E>>, E>;

    /// The object as a payload, used when it has no invokable `then`.
    fn into_value(self: Box<Self>) -> T;
}

/// What a settlable is resolved with.
pub enum Resolution<T, E> {
    /// A final payload.
    Value(T),
    /// Another settlable whose outcome is mirrored once it settles.
    Settlable(Settlable<T, E>),
    /// A foreign object adopted through its `then` operation.
    Thenable(Box<dyn Thenable<T, E>>),
}

impl<T, E> Resolution<T, E> {
    pub fn thenable(object: impl Thenable<T, E> + 'static) -> Self {
        Resolution::Thenable(Box::new(object))
    }
}

impl<T, E> From<Settlable<T, E>> for Resolution<T, E> {
    fn from(settlable: Settlable<T, E>) -> Self {
        Resolution::Settlable(settlable)
    }
}

impl<T: fmt::Debug, E> fmt::Debug for Resolution<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Resolution::Settlable(_) => f.write_str("Settlable(..)"),
            Resolution::Thenable(_) => f.write_str("Thenable(..)"),
        }
    }
}
