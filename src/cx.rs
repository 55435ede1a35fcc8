//! The cursor through which a pass calls incremental primitives.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashSet;
use std::ops::{Deref, DerefMut};
use std::rc::Rc;

use indexmap::IndexMap;

use crate::gate::Gate;
use crate::memory::{CellSlot, DedupeSlot, Env, ForkSlot, MemoSlot, Memory, Scope, Slot, SlotKind};
use crate::tracer::{CacheCheck, SpanId};

/// Cursor into one scope of a [`Memory`] during a pass.
///
/// Every primitive call consumes the next slot of the scope. Within a scope,
/// the sequence of calls must be the same on every pass; anything that varies
/// from pass to pass belongs inside [`fork`](Cx::fork).
pub struct Cx<'a> {
    scope: &'a mut Scope,
    index: usize,
    env: &'a Env,
    span: SpanId,
}

impl<'a> Cx<'a> {
    pub(crate) fn new(scope: &'a mut Scope, env: &'a Env, span: SpanId) -> Self {
        Self {
            scope,
            index: 0,
            env,
            span,
        }
    }

    /// The span of the current pass.
    pub fn span_id(&self) -> SpanId {
        self.span
    }

    /// The branch key of this scope, if it was created by `fork`.
    pub fn key(&self) -> Option<&str> {
        self.scope.key.as_deref()
    }

    /// Return the cached value if `deps` equals the previous pass's deps,
    /// otherwise run `compute` and cache its result.
    ///
    /// `deps` is compared with `PartialEq`, so a tuple acts as a dependency
    /// list compared element by element. Use [`ByRef`](crate::ByRef) or a
    /// [`SyncPromise`](crate::SyncPromise) for elements that should compare by
    /// identity. A `Vec` or `String` dep is compared by content on every pass,
    /// so wrap large values that are rebuilt each pass in `ByRef`. `compute` gets its own scope, kept across recomputations, so it
    /// may call primitives too.
    pub fn memo<D, T>(&mut self, deps: D, compute: impl FnOnce(&mut Cx<'_>) -> T) -> T
    where
        D: PartialEq + 'static,
        T: Clone + 'static,
    {
        self.memo_with(deps, |a, b| a == b, compute)
    }

    /// Like [`memo`](Self::memo) with a caller-supplied equality on the key.
    pub fn memo_with<K, T>(
        &mut self,
        key: K,
        eq: impl FnOnce(&K, &K) -> bool,
        compute: impl FnOnce(&mut Cx<'_>) -> T,
    ) -> T
    where
        K: 'static,
        T: Clone + 'static,
    {
        let index = self.advance(SlotKind::Memo);

        let mut scope = Scope::default();
        let check = match self.scope.slots.get_mut(index) {
            Some(Slot::Memo(slot)) => {
                let cached = slot.value.downcast_ref::<T>();
                let hit = slot.key.downcast_ref::<K>().is_some_and(|prev| eq(prev, &key));
                if let (true, Some(value)) = (hit, cached) {
                    self.env.tracer.on_memo_check(self.span, index, CacheCheck::Hit);
                    return value.clone();
                }
                scope = std::mem::take(&mut slot.scope);
                CacheCheck::Miss
            }
            Some(_) => CacheCheck::Miss,
            None => CacheCheck::Fresh,
        };
        self.env.tracer.on_memo_check(self.span, index, check);

        let value = scope.enter(self.env, self.span, compute);
        self.install(
            index,
            Slot::Memo(MemoSlot {
                key: Box::new(key),
                value: Box::new(value.clone()),
                scope,
            }),
        );
        value
    }

    /// Return the previously stored value if `equals` says it matches `value`,
    /// otherwise store `value` and return it.
    ///
    /// The returned value stays the same object while content is unchanged, so
    /// it can be used as an identity-compared dependency downstream.
    pub fn dedupe<T>(&mut self, value: T, equals: impl FnOnce(&T, &T) -> bool) -> T
    where
        T: Clone + 'static,
    {
        let index = self.advance(SlotKind::Dedupe);

        let check = match self.scope.slots.get(index) {
            Some(Slot::Dedupe(slot)) => match slot.value.downcast_ref::<T>() {
                Some(prev) => {
                    if equals(prev, &value) {
                        self.env.tracer.on_dedupe_check(self.span, index, CacheCheck::Hit);
                        return prev.clone();
                    }
                    CacheCheck::Miss
                }
                None => CacheCheck::Miss,
            },
            Some(_) => CacheCheck::Miss,
            None => CacheCheck::Fresh,
        };
        self.env.tracer.on_dedupe_check(self.span, index, check);

        self.install(
            index,
            Slot::Dedupe(DedupeSlot {
                value: Box::new(value.clone()),
            }),
        );
        value
    }

    /// Run `build` with a [`Fork`] that gives each key its own persistent scope.
    ///
    /// Branches not visited during `build` are dropped afterwards, with every
    /// value cached beneath them.
    pub fn fork<R>(&mut self, build: impl FnOnce(&mut Fork<'_>) -> R) -> R {
        let mut fork = self.fork_later();
        let result = build(&mut fork);
        fork.done();
        result
    }

    /// A fork whose pruning waits for [`ForkLater::done`].
    ///
    /// Branches can be entered from anywhere in the rest of the pass while the
    /// handle is alive. Unvisited branches are dropped when `done` is called or
    /// the handle goes out of scope.
    pub fn fork_later(&mut self) -> ForkLater<'a> {
        ForkLater {
            fork: self.fork_slot(),
        }
    }

    /// A single persistent scope that the pass may or may not enter.
    ///
    /// The slot is claimed either way, and the scope keeps its cache on passes
    /// that skip [`Later::run`].
    pub fn later(&mut self) -> Later<'a> {
        Later {
            fork: self.fork_slot(),
        }
    }

    fn fork_slot(&mut self) -> Fork<'a> {
        let index = self.advance(SlotKind::Fork);
        let branches = match self.scope.slots.get(index) {
            Some(Slot::Fork(slot)) => slot.branches.clone(),
            _ => {
                let slot = ForkSlot::default();
                let branches = slot.branches.clone();
                self.install(index, Slot::Fork(slot));
                branches
            }
        };
        Fork {
            branches,
            visited: HashSet::new(),
            env: self.env,
            span: self.span,
        }
    }

    /// A persistent mutable cell, created by `init` on the first pass.
    pub fn cell<T: 'static>(&mut self, init: impl FnOnce() -> T) -> Rc<RefCell<T>> {
        let index = self.advance(SlotKind::Cell);
        if let Some(Slot::Cell(slot)) = self.scope.slots.get(index) {
            if let Some(cell) = slot.cell.downcast_ref::<Rc<RefCell<T>>>() {
                return cell.clone();
            }
        }
        let cell = Rc::new(RefCell::new(init()));
        self.install(
            index,
            Slot::Cell(CellSlot {
                cell: Box::new(cell.clone()) as Box<dyn Any>,
            }),
        );
        cell
    }

    /// The value passed on the previous pass, or `init()` on the first.
    pub fn previous<T: 'static>(&mut self, value: T, init: impl FnOnce() -> T) -> T {
        self.cell(init).replace(value)
    }

    /// A persistent child memory, for running another gated computation with
    /// its own lifecycle.
    pub fn child_memory(&mut self) -> &mut Memory {
        let index = self.advance(SlotKind::Nested);
        if !matches!(self.scope.slots.get(index), Some(Slot::Nested(_))) {
            let memory = Memory::with_env(self.env.clone());
            self.install(index, Slot::Nested(Box::new(memory)));
        }
        match self.scope.slots.get_mut(index) {
            Some(Slot::Nested(memory)) => &mut **memory,
            _ => unreachable!("nested slot installed above"),
        }
    }

    /// Run `gate` against a persistent child memory.
    pub fn call<P, R>(&mut self, gate: &Gate<P, R>, props: P) -> R
    where
        P: 'static,
        R: Clone + 'static,
    {
        gate.run(self.child_memory(), props)
    }

    /// Claim the next slot index.
    fn advance(&mut self, expected: SlotKind) -> usize {
        let index = self.index;
        self.index += 1;
        if self.env.strict {
            if let Some(slot) = self.scope.slots.get(index) {
                let found = slot.kind();
                assert!(
                    found == expected,
                    "slot {index} held a {found} on the previous pass but is now used as a {expected}; \
                     primitive calls must keep the same order in every pass"
                );
            }
        }
        index
    }

    fn install(&mut self, index: usize, slot: Slot) {
        match self.scope.slots.get_mut(index) {
            Some(existing) => *existing = slot,
            None => self.scope.slots.push(slot),
        }
    }

    pub(crate) fn finish(self) {
        if self.env.strict && self.scope.settled {
            assert!(
                self.index == self.scope.slots.len(),
                "scope changed number of primitive calls between passes: {} => {}",
                self.scope.slots.len(),
                self.index
            );
        }
        self.scope.settled = true;
    }
}

/// Handle passed to the body of [`Cx::fork`].
pub struct Fork<'a> {
    branches: Rc<RefCell<IndexMap<String, Scope>>>,
    visited: HashSet<String>,
    env: &'a Env,
    span: SpanId,
}

impl Fork<'_> {
    /// Run `body` in the scope for `key`, creating it if this key is new.
    ///
    /// # Panics
    ///
    /// Panics if `key` was already visited during this pass.
    pub fn branch<R>(&mut self, key: impl Into<String>, body: impl FnOnce(&mut Cx<'_>) -> R) -> R {
        let key = key.into();
        assert!(
            self.visited.insert(key.clone()),
            "fork key `{key}` used twice in one pass"
        );
        // The body only sees its own branch's cursor, never this fork.
        let mut branches = self.branches.borrow_mut();
        let created = !branches.contains_key(&key);
        self.env.tracer.on_branch_enter(self.span, &key, created);
        let scope = branches
            .entry(key)
            .or_insert_with_key(|key| Scope::keyed(key.clone()));
        scope.enter(self.env, self.span, body)
    }

    /// Keys of the branches that exist right now, visited or not.
    pub fn keys(&self) -> Vec<String> {
        self.branches.borrow().keys().cloned().collect()
    }

    fn prune(&mut self) {
        let (visited, env, span) = (&self.visited, self.env, self.span);
        self.branches.borrow_mut().retain(|key, _| {
            let keep = visited.contains(key);
            if !keep {
                env.tracer.on_branch_pruned(span, key);
            }
            keep
        });
    }
}

/// Handle returned by [`Cx::fork_later`]. Prunes unvisited branches on drop.
///
/// It does not borrow the cursor, so other primitives may be called between
/// branches.
pub struct ForkLater<'a> {
    fork: Fork<'a>,
}

impl ForkLater<'_> {
    /// Drop every branch not visited since the handle was created.
    pub fn done(self) {
        drop(self);
    }
}

impl<'a> Deref for ForkLater<'a> {
    type Target = Fork<'a>;

    fn deref(&self) -> &Fork<'a> {
        &self.fork
    }
}

impl<'a> DerefMut for ForkLater<'a> {
    fn deref_mut(&mut self) -> &mut Fork<'a> {
        &mut self.fork
    }
}

impl Drop for ForkLater<'_> {
    fn drop(&mut self) {
        self.fork.prune();
    }
}

/// Handle returned by [`Cx::later`].
pub struct Later<'a> {
    fork: Fork<'a>,
}

impl Later<'_> {
    /// Enter the scope.
    pub fn run<R>(mut self, body: impl FnOnce(&mut Cx<'_>) -> R) -> R {
        self.fork.branch("", body)
    }
}
