use crate::{
    scheduler::{self, Scheduler},
    settlable::{Rejecter, Resolver, Settlable},
};
use std::sync::Arc;

/// A settlable together with the capabilities that settle it, so it can be
/// settled from outside an initializer.
///
/// # Examples
///
/// ```
/// use settlable::Deferred;
/// use futures::executor::block_on;
/// use std::thread;
///
/// let deferred = Deferred::<String, String>::new();
/// let (settlable, resolve, _reject) = deferred.into_parts();
/// let task1 = thread::spawn(move || block_on(async {
///     println!("Received {:?}", settlable.await);
/// }));
/// resolve.fulfill("Hi".into());
/// task1.join().expect("The task1 thread has panicked.");
/// ```
#[derive(Debug)]
pub struct Deferred<T, E> {
    pub settlable: Settlable<T, E>,
    pub resolve: Resolver<T, E>,
    pub reject: Rejecter<T, E>,
}

impl<T, E> Deferred<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::with_scheduler(scheduler::current())
    }

    pub fn with_scheduler(scheduler: Arc<dyn Scheduler>) -> Self {
        let settlable = Settlable::pending(scheduler);
        let (resolve, reject) = settlable.capabilities();
        Self {
            settlable,
            resolve,
            reject,
        }
    }

    pub fn into_parts(self) -> (Settlable<T, E>, Resolver<T, E>, Rejecter<T, E>) {
        (self.settlable, self.resolve, self.reject)
    }
}

impl<T, E> Default for Deferred<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::Deferred;
    use crate::{scheduler::MicrotaskQueue, Resolution, State};
    use futures::executor::block_on;
    use std::{sync::Arc, thread};

    #[test]
    fn test_deferred_resolve() {
        let (settlable, resolve, _reject) = Deferred::<String, ()>::new().into_parts();
        let task1 = thread::spawn(move || block_on(async { settlable.await }));
        let task2 = thread::spawn(move || resolve.fulfill(String::from("🍓")));
        task2.join().expect("The task2 thread has panicked");
        let got = task1.join().expect("The task1 thread has panicked");
        assert_eq!(got, Ok(String::from("🍓")));
    }

    #[test]
    fn test_deferred_reject() {
        let (settlable, _resolve, reject) = Deferred::<(), String>::new().into_parts();
        let task1 = thread::spawn(move || block_on(settlable));
        let task2 = thread::spawn(move || reject.reject("reject!!".into()));
        task2.join().expect("The task2 thread has panicked");
        let got = task1.join().expect("The task1 thread has panicked");
        assert_eq!(got, Err(String::from("reject!!")));
    }

    #[test]
    fn test_capabilities_settle_the_same_instance() {
        let queue = MicrotaskQueue::new();
        let deferred = Deferred::<i32, String>::with_scheduler(Arc::new(queue.clone()));
        let chained = deferred.settlable.then(None, None);
        deferred.resolve.resolve(Resolution::Value(2)).unwrap();
        deferred.reject.reject("ignored".into());
        assert_eq!(deferred.settlable.state(), State::Fulfilled);
        queue.run_until_stalled();
        assert_eq!(chained.peek(), Some(Ok(2)));
    }

    #[test]
    fn test_resolve_with_unsettled_deferred_waits() {
        let queue = MicrotaskQueue::new();
        let outer = Deferred::<i32, String>::with_scheduler(Arc::new(queue.clone()));
        let inner = Deferred::<i32, String>::with_scheduler(Arc::new(queue.clone()));
        outer.resolve.resolve(inner.settlable.clone().into()).unwrap();
        queue.run_until_stalled();
        assert_eq!(outer.settlable.state(), State::Unsettled);
        inner.reject.reject("late".into());
        queue.run_until_stalled();
        assert_eq!(outer.settlable.peek(), Some(Err("late".to_string())));
    }
}
