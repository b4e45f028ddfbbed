//! Thread-safe multi-subscriber callback registry.
//!
//! # Dispatch rules
//!
//! 1. `invoke` copies the subscriber list before dispatching.  A subscriber
//!    that was registered when `invoke` began receives exactly one job, even
//!    if another thread adds or removes subscribers mid-dispatch.
//! 2. Each job runs on the subscriber's own [`Executor`].  The caller never
//!    runs feature code, so it is safe to call `invoke` from a transport
//!    thread, and a callback may re-enter the registry (e.g. unregister
//!    itself) without deadlocking.
//!
//! Subscribers are identified by `Arc` pointer identity; see [`same_callback`].

use std::sync::Arc;

use parking_lot::RwLock;

use super::executor::Executor;

/// Returns `true` when both handles point at the same callback object.
///
/// Only the data pointer is compared, so two `Arc<dyn Trait>` built from the
/// same allocation match even if their vtable pointers differ.
pub fn same_callback<C: ?Sized>(a: &Arc<C>, b: &Arc<C>) -> bool {
    std::ptr::eq(Arc::as_ptr(a).cast::<()>(), Arc::as_ptr(b).cast::<()>())
}

/// A callback paired with the executor it must run on.
pub struct Subscription<C: ?Sized> {
    callback: Arc<C>,
    executor: Arc<dyn Executor>,
}

impl<C: ?Sized> Clone for Subscription<C> {
    fn clone(&self) -> Self {
        Self {
            callback: Arc::clone(&self.callback),
            executor: Arc::clone(&self.executor),
        }
    }
}

impl<C: ?Sized + Send + Sync + 'static> Subscription<C> {
    pub fn new(callback: Arc<C>, executor: Arc<dyn Executor>) -> Self {
        Self { callback, executor }
    }

    pub fn callback(&self) -> &Arc<C> {
        &self.callback
    }

    /// Returns `true` if this subscription belongs to `callback`.
    pub fn is_for(&self, callback: &Arc<C>) -> bool {
        same_callback(&self.callback, callback)
    }

    /// Schedules `action` against the callback on its executor.
    pub fn dispatch<F>(&self, action: F)
    where
        F: FnOnce(&C) + Send + 'static,
    {
        let callback = Arc::clone(&self.callback);
        self.executor.execute(Box::new(move || action(&callback)));
    }
}

/// A set of subscribers that can be notified together.
pub struct ThreadSafeCallbacks<C: ?Sized> {
    subscriptions: RwLock<Vec<Subscription<C>>>,
}

impl<C: ?Sized> Default for ThreadSafeCallbacks<C> {
    fn default() -> Self {
        Self {
            subscriptions: RwLock::new(Vec::new()),
        }
    }
}

impl<C: ?Sized + Send + Sync + 'static> ThreadSafeCallbacks<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `callback`.  Adding a callback that is already present replaces
    /// its executor rather than creating a second subscription.
    pub fn add(&self, callback: Arc<C>, executor: Arc<dyn Executor>) {
        let mut subscriptions = self.subscriptions.write();
        match subscriptions.iter_mut().find(|s| s.is_for(&callback)) {
            Some(existing) => existing.executor = executor,
            None => subscriptions.push(Subscription::new(callback, executor)),
        }
    }

    /// Removes `callback`.  Returns `false` if it was not registered.
    pub fn remove(&self, callback: &Arc<C>) -> bool {
        let mut subscriptions = self.subscriptions.write();
        let before = subscriptions.len();
        subscriptions.retain(|s| !s.is_for(callback));
        subscriptions.len() != before
    }

    pub fn size(&self) -> usize {
        self.subscriptions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Runs `action` once for every current subscriber, each on its own executor.
    pub fn invoke<F>(&self, action: F)
    where
        F: Fn(&C) + Send + Sync + 'static,
    {
        let snapshot: Vec<Subscription<C>> = self.subscriptions.read().clone();
        let action = Arc::new(action);
        for subscription in snapshot {
            let action = Arc::clone(&action);
            subscription.dispatch(move |callback| action(callback));
        }
    }
}
