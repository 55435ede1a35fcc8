//! Synchronous promises.
//!
//! A [`SyncPromise`] settles and runs its reactions on the caller's stack
//! whenever the value is already known. Attaching a handler to a settled
//! promise runs the handler before the attaching call returns; attaching to a
//! pending promise queues the handler until settlement, in attachment order.
//!
//! # Example
//!
//! ```
//! use graft_flow::{PromiseState, SyncPromise};
//!
//! let doubled = SyncPromise::resolve(21).map(|x| x * 2);
//! assert_eq!(doubled.state(), PromiseState::Fulfilled(42));
//!
//! let (pending, resolver) = SyncPromise::<i32>::unresolved();
//! let plus_one = pending.map(|x| x + 1);
//! assert!(plus_one.state().is_pending());
//! resolver.resolve(1);
//! assert_eq!(plus_one.state(), PromiseState::Fulfilled(2));
//! ```

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;

use indexmap::IndexMap;

use crate::PromiseError;

/// The settled result of a promise.
pub type Outcome<T> = Result<T, PromiseError>;

type Reaction<T> = Box<dyn FnOnce(Outcome<T>)>;

/// Snapshot of a promise's state, as returned by [`SyncPromise::state`].
#[derive(Debug, Clone, PartialEq)]
pub enum PromiseState<T> {
    /// Not settled yet.
    Pending,
    /// Settled with a value.
    Fulfilled(T),
    /// Settled with a rejection reason.
    Rejected(PromiseError),
}

impl<T> PromiseState<T> {
    /// Returns true if the promise has not settled.
    pub fn is_pending(&self) -> bool {
        matches!(self, PromiseState::Pending)
    }

    /// Returns true if the promise settled with a value.
    pub fn is_fulfilled(&self) -> bool {
        matches!(self, PromiseState::Fulfilled(_))
    }

    /// Returns true if the promise settled with a rejection.
    pub fn is_rejected(&self) -> bool {
        matches!(self, PromiseState::Rejected(_))
    }

    /// The fulfilled value, if any.
    pub fn value(&self) -> Option<&T> {
        match self {
            PromiseState::Fulfilled(value) => Some(value),
            _ => None,
        }
    }

    /// The rejection reason, if any.
    pub fn reason(&self) -> Option<&PromiseError> {
        match self {
            PromiseState::Rejected(reason) => Some(reason),
            _ => None,
        }
    }

    /// Convert into an outcome; `None` while pending.
    pub fn into_outcome(self) -> Option<Outcome<T>> {
        match self {
            PromiseState::Pending => None,
            PromiseState::Fulfilled(value) => Some(Ok(value)),
            PromiseState::Rejected(reason) => Some(Err(reason)),
        }
    }
}

impl<T: Clone> PromiseState<T> {
    fn outcome(&self) -> Option<Outcome<T>> {
        self.clone().into_outcome()
    }
}

struct Inner<T> {
    state: PromiseState<T>,
    reactions: VecDeque<Reaction<T>>,
    paused: bool,
}

/// A promise that settles synchronously whenever it can.
///
/// Cloning yields another handle to the same promise. Equality is identity:
/// two handles are equal only if they refer to the same promise, which is what
/// a dependency list needs.
pub struct SyncPromise<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T> Clone for SyncPromise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> SyncPromise<T> {
    /// Returns true if both handles refer to the same promise.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T> PartialEq for SyncPromise<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl<T> Eq for SyncPromise<T> {}

impl<T: fmt::Debug> fmt::Debug for SyncPromise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("SyncPromise")
            .field("state", &inner.state)
            .field("queued", &inner.reactions.len())
            .field("paused", &inner.paused)
            .finish()
    }
}

/// The settling side of a promise.
///
/// Obtained from [`SyncPromise::new`] or [`SyncPromise::unresolved`]. The first
/// call that settles the promise wins; every later call is a no-op.
pub struct Resolver<T> {
    promise: SyncPromise<T>,
}

impl<T> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        Self {
            promise: self.promise.clone(),
        }
    }
}

impl<T: Clone + 'static> Resolver<T> {
    /// Fulfill the promise with `value`.
    pub fn resolve(&self, value: T) {
        self.settle(Ok(value));
    }

    /// Reject the promise with `reason`.
    pub fn reject(&self, reason: impl Into<PromiseError>) {
        self.settle(Err(reason.into()));
    }

    /// Settle the promise with an outcome.
    pub fn settle(&self, outcome: Outcome<T>) {
        self.promise.settle(outcome);
    }

    /// Settle the promise the same way `source` settles.
    pub fn follow(&self, source: &SyncPromise<T>) {
        let resolver = self.clone();
        source.subscribe(Box::new(move |outcome| resolver.settle(outcome)));
    }

    /// Returns true if the promise has already settled.
    pub fn is_settled(&self) -> bool {
        !self.promise.state().is_pending()
    }
}

impl<T: Clone + 'static> SyncPromise<T> {
    fn pending() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                state: PromiseState::Pending,
                reactions: VecDeque::new(),
                paused: false,
            })),
        }
    }

    /// Create a promise and run `executor` synchronously.
    ///
    /// Settling through the resolver during `executor` settles the promise
    /// immediately. The resolver may also be kept and settled later.
    pub fn new(executor: impl FnOnce(Resolver<T>)) -> Self {
        let promise = Self::pending();
        executor(Resolver {
            promise: promise.clone(),
        });
        promise
    }

    /// A pending promise together with its resolver.
    ///
    /// This is how a forward reference is handed out before its producer has run.
    pub fn unresolved() -> (Self, Resolver<T>) {
        let promise = Self::pending();
        let resolver = Resolver {
            promise: promise.clone(),
        };
        (promise, resolver)
    }

    /// An already fulfilled promise.
    pub fn resolve(value: T) -> Self {
        Self::from_outcome(Ok(value))
    }

    /// An already rejected promise.
    pub fn reject(reason: impl Into<PromiseError>) -> Self {
        Self::from_outcome(Err(reason.into()))
    }

    /// An already settled promise.
    pub fn from_outcome(outcome: Outcome<T>) -> Self {
        let promise = Self::pending();
        promise.settle(outcome);
        promise
    }

    /// Inverse of [`state`](Self::state). A pending state yields a promise that
    /// never settles.
    pub fn from_state(state: PromiseState<T>) -> Self {
        match state.into_outcome() {
            Some(outcome) => Self::from_outcome(outcome),
            None => Self::pending(),
        }
    }

    /// The current state, read synchronously.
    ///
    /// A settlement made while the promise is paused is already visible here.
    pub fn state(&self) -> PromiseState<T> {
        self.inner.borrow().state.clone()
    }

    /// Run `f` now. `Err` results and panics become rejections.
    pub fn try_run(f: impl FnOnce() -> Outcome<T>) -> Self {
        Self::from_outcome(guarded(f).and_then(|outcome| outcome))
    }

    /// Run `f` now and adopt the settlement of the promise it returns.
    ///
    /// The result is settled before this returns when the inner promise is.
    pub fn try_flatten(f: impl FnOnce() -> Outcome<SyncPromise<T>>) -> Self {
        match guarded(f).and_then(|outcome| outcome) {
            Ok(inner) => {
                let (promise, resolver) = Self::unresolved();
                resolver.follow(&inner);
                promise
            }
            Err(reason) => Self::reject(reason),
        }
    }

    /// Withhold reactions until [`resume`](Self::resume).
    pub fn pause(&self) -> Self {
        self.inner.borrow_mut().paused = true;
        self.clone()
    }

    /// Stop withholding reactions and run the queued ones in FIFO order.
    pub fn resume(&self) -> Self {
        self.inner.borrow_mut().paused = false;
        self.flush();
        self.clone()
    }

    /// Attach handlers for both outcomes.
    ///
    /// If this promise is settled, the matching handler has run and the returned
    /// promise is settled by the time this returns. A handler that panics
    /// rejects the returned promise with [`PromiseError::Panicked`].
    pub fn then_with<U: Clone + 'static>(
        &self,
        on_fulfilled: impl FnOnce(T) -> Outcome<U> + 'static,
        on_rejected: impl FnOnce(PromiseError) -> Outcome<U> + 'static,
    ) -> SyncPromise<U> {
        let (next, resolver) = SyncPromise::unresolved();
        self.subscribe(Box::new(move |outcome| {
            let handled = guarded(move || match outcome {
                Ok(value) => on_fulfilled(value),
                Err(reason) => on_rejected(reason),
            });
            resolver.settle(handled.and_then(|outcome| outcome))
        }));
        next
    }

    /// Attach a fulfillment handler. Returning `Err` rejects the result.
    pub fn then<U: Clone + 'static>(
        &self,
        on_fulfilled: impl FnOnce(T) -> Outcome<U> + 'static,
    ) -> SyncPromise<U> {
        self.then_with(on_fulfilled, Err)
    }

    /// Transform the fulfilled value.
    pub fn map<U: Clone + 'static>(&self, f: impl FnOnce(T) -> U + 'static) -> SyncPromise<U> {
        self.then(move |value| Ok(f(value)))
    }

    /// Attach a rejection handler. Returning `Ok` recovers.
    pub fn catch(
        &self,
        on_rejected: impl FnOnce(PromiseError) -> Outcome<T> + 'static,
    ) -> SyncPromise<T> {
        self.then_with(Ok, on_rejected)
    }

    /// Chain a handler that returns another promise, flattening the result.
    pub fn and_then<U: Clone + 'static>(
        &self,
        f: impl FnOnce(T) -> SyncPromise<U> + 'static,
    ) -> SyncPromise<U> {
        let (next, resolver) = SyncPromise::unresolved();
        self.subscribe(Box::new(move |outcome| {
            match outcome.and_then(|value| guarded(move || f(value))) {
                Ok(chained) => resolver.follow(&chained),
                Err(reason) => resolver.reject(reason),
            }
        }));
        next
    }

    /// Recover from a rejection with another promise, flattening the result.
    pub fn or_else(
        &self,
        f: impl FnOnce(PromiseError) -> SyncPromise<T> + 'static,
    ) -> SyncPromise<T> {
        let (next, resolver) = SyncPromise::unresolved();
        self.subscribe(Box::new(move |outcome| match outcome {
            Ok(value) => resolver.resolve(value),
            Err(reason) => match guarded(move || f(reason)) {
                Ok(recovered) => resolver.follow(&recovered),
                Err(panicked) => resolver.reject(panicked),
            },
        }));
        next
    }

    /// Fulfill with every value once all inputs fulfill; the first rejection wins.
    pub fn all(promises: impl IntoIterator<Item = SyncPromise<T>>) -> SyncPromise<Vec<T>> {
        let promises: Vec<_> = promises.into_iter().collect();
        let (result, resolver) = SyncPromise::unresolved();
        if promises.is_empty() {
            resolver.resolve(Vec::new());
            return result;
        }

        let gathered = Rc::new(RefCell::new(Gathered::new(promises.len())));
        for (index, promise) in promises.iter().enumerate() {
            let gathered = gathered.clone();
            let resolver = resolver.clone();
            promise.subscribe(Box::new(move |outcome| match outcome {
                Ok(value) => {
                    let complete = gathered.borrow_mut().fill(index, value);
                    if let Some(values) = complete {
                        resolver.resolve(values);
                    }
                }
                Err(reason) => resolver.reject(reason),
            }));
        }
        result
    }

    /// Like [`all`](Self::all) over a keyed map, preserving keys and order.
    pub fn all_values<K>(promises: IndexMap<K, SyncPromise<T>>) -> SyncPromise<IndexMap<K, T>>
    where
        K: Hash + Eq + Clone + 'static,
    {
        let (keys, promises): (Vec<K>, Vec<SyncPromise<T>>) = promises.into_iter().unzip();
        Self::all(promises).map(move |values| keys.into_iter().zip(values).collect())
    }

    /// Fulfill with the first input to fulfill.
    ///
    /// Rejects with [`PromiseError::AllRejected`] once every input has rejected,
    /// carrying the reasons in input order. No inputs means an immediate rejection.
    pub fn any(promises: impl IntoIterator<Item = SyncPromise<T>>) -> SyncPromise<T> {
        let promises: Vec<_> = promises.into_iter().collect();
        let (result, resolver) = SyncPromise::unresolved();
        if promises.is_empty() {
            resolver.reject(PromiseError::AllRejected {
                reasons: Vec::new(),
            });
            return result;
        }

        let rejections = Rc::new(RefCell::new(Gathered::new(promises.len())));
        for (index, promise) in promises.iter().enumerate() {
            let rejections = rejections.clone();
            let resolver = resolver.clone();
            promise.subscribe(Box::new(move |outcome| match outcome {
                Ok(value) => resolver.resolve(value),
                Err(reason) => {
                    let complete = rejections.borrow_mut().fill(index, reason);
                    if let Some(reasons) = complete {
                        resolver.reject(PromiseError::AllRejected { reasons });
                    }
                }
            }));
        }
        result
    }

    /// Fulfill with every outcome once all inputs have settled. Never rejects.
    pub fn all_settled(
        promises: impl IntoIterator<Item = SyncPromise<T>>,
    ) -> SyncPromise<Vec<Outcome<T>>> {
        SyncPromise::all(
            promises
                .into_iter()
                .map(|promise| promise.then_with(|value| Ok(Ok(value)), |reason| Ok(Err(reason)))),
        )
    }

    fn settle(&self, outcome: Outcome<T>) {
        let waiting = {
            let mut inner = self.inner.borrow_mut();
            if !inner.state.is_pending() {
                return;
            }
            inner.state = match outcome {
                Ok(value) => PromiseState::Fulfilled(value),
                Err(reason) => PromiseState::Rejected(reason),
            };
            !inner.reactions.is_empty()
        };
        if waiting {
            self.flush();
        }
    }

    fn subscribe(&self, reaction: Reaction<T>) {
        let mut inner = self.inner.borrow_mut();
        // Queue behind earlier reactions so attachment order holds.
        let ready = if inner.paused || !inner.reactions.is_empty() {
            None
        } else {
            inner.state.outcome()
        };
        match ready {
            Some(outcome) => {
                drop(inner);
                reaction(outcome);
            }
            None => inner.reactions.push_back(reaction),
        }
    }

    // Settling inside a reaction only enqueues; the outermost flush drains.
    fn flush(&self) {
        let promise = self.clone();
        trampoline(Box::new(move || promise.drain()));
    }

    fn drain(&self) {
        loop {
            let (reaction, outcome) = {
                let mut inner = self.inner.borrow_mut();
                if inner.paused {
                    return;
                }
                let Some(outcome) = inner.state.outcome() else {
                    return;
                };
                match inner.reactions.pop_front() {
                    Some(reaction) => (reaction, outcome),
                    None => return,
                }
            };
            reaction(outcome);
        }
    }
}

thread_local! {
    static SETTLEMENTS: Trampoline = Trampoline::default();
}

#[derive(Default)]
struct Trampoline {
    draining: Cell<bool>,
    jobs: RefCell<VecDeque<Box<dyn FnOnce()>>>,
}

/// Run `job` before the outermost settling call on this thread returns.
///
/// Nested calls only enqueue, so a chain of any length settles in constant
/// stack depth.
fn trampoline(job: Box<dyn FnOnce()>) {
    let outermost = SETTLEMENTS.with(|t| {
        t.jobs.borrow_mut().push_back(job);
        !t.draining.replace(true)
    });
    if !outermost {
        return;
    }
    let _draining = DrainGuard;
    while let Some(job) = SETTLEMENTS.with(|t| t.jobs.borrow_mut().pop_front()) {
        job();
    }
}

struct DrainGuard;

impl Drop for DrainGuard {
    fn drop(&mut self) {
        let _ = SETTLEMENTS.try_with(|t| t.draining.set(false));
    }
}

fn guarded<R>(f: impl FnOnce() -> R) -> Result<R, PromiseError> {
    catch_unwind(AssertUnwindSafe(f)).map_err(PromiseError::from_panic)
}

struct Gathered<T> {
    values: Vec<Option<T>>,
    remaining: usize,
}

impl<T> Gathered<T> {
    fn new(len: usize) -> Self {
        Self {
            values: (0..len).map(|_| None).collect(),
            remaining: len,
        }
    }

    fn fill(&mut self, index: usize, value: T) -> Option<Vec<T>> {
        if self.values[index].replace(value).is_none() {
            self.remaining -= 1;
        }
        if self.remaining == 0 {
            Some(self.values.drain(..).flatten().collect())
        } else {
            None
        }
    }
}
