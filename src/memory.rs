//! The memoization store: a persistent tree of scopes and slots.
//!
//! One [`Memory`] belongs to one logical computation instance. Every pass over
//! it walks the root [`Scope`] with a [`Cx`] cursor; each primitive call takes
//! the next slot in order. Scopes created by `fork` are addressed by key
//! instead, and are dropped with their whole subtree when a pass stops
//! visiting them.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::Serialize;

use crate::cx::Cx;
use crate::tracer::{NoopTracer, SpanId, Tracer};

/// Settings shared by a memory and all child memories created beneath it.
#[derive(Clone)]
pub(crate) struct Env {
    pub(crate) tracer: Arc<dyn Tracer>,
    pub(crate) strict: bool,
}

/// Root of a persistent call-result tree.
///
/// Create one per logical instance, keep it for the instance's lifetime and
/// pass it to every [`Gate::run`](crate::Gate::run) or [`Memory::run`] for that
/// instance. Dropping it drops every cached value.
///
/// # Example
///
/// ```
/// use graft_flow::Memory;
///
/// let mut memory = Memory::new();
/// let mut runs = 0;
/// for _ in 0..3 {
///     let value = memory.run(|cx| cx.memo(("same", 1), |_| { runs += 1; 42 }));
///     assert_eq!(value, 42);
/// }
/// assert_eq!(runs, 1);
/// ```
pub struct Memory {
    pub(crate) root: Scope,
    /// Last `(props, result)` seen by a gate over this memory.
    pub(crate) gate: Option<Box<dyn Any>>,
    pub(crate) env: Env,
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

impl Memory {
    /// Create a memory with default settings.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Create a builder for customizing the memory.
    ///
    /// # Example
    ///
    /// ```
    /// use graft_flow::{Memory, NoopTracer};
    ///
    /// let memory = Memory::builder().tracer(NoopTracer).strict(true).build();
    /// assert!(memory.is_strict());
    /// ```
    pub fn builder() -> MemoryBuilder {
        MemoryBuilder::new()
    }

    pub(crate) fn with_env(env: Env) -> Self {
        Self {
            root: Scope::default(),
            gate: None,
            env,
        }
    }

    /// Run one pass of `body` over the root scope.
    ///
    /// This bypasses any gate: the body always runs, and the primitives inside
    /// it decide what to reuse.
    pub fn run<R>(&mut self, body: impl FnOnce(&mut Cx<'_>) -> R) -> R {
        let span = self.env.tracer.new_span_id();
        self.env.tracer.on_pass_start(span);
        let result = self.root.enter(&self.env, span, body);
        self.env.tracer.on_pass_end(span, self.root.slots.len());
        result
    }

    /// Drop every cached value and start over, as if newly mounted.
    pub fn clear(&mut self) {
        self.root = Scope::default();
        self.gate = None;
    }

    /// Returns true if slot-order checks are enabled.
    pub fn is_strict(&self) -> bool {
        self.env.strict
    }

    /// Returns true if a gate has cached a result in this memory.
    pub fn has_gate_result(&self) -> bool {
        self.gate.is_some()
    }

    /// Structural view of the tree, without cached values.
    pub fn snapshot(&self) -> MemorySnapshot {
        MemorySnapshot {
            gated: self.gate.is_some(),
            root: self.root.snapshot(),
        }
    }
}

impl fmt::Debug for Memory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memory")
            .field("strict", &self.env.strict)
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

/// Builder for [`Memory`].
pub struct MemoryBuilder {
    tracer: Arc<dyn Tracer>,
    strict: bool,
}

impl Default for MemoryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBuilder {
    /// Create a builder with a [`NoopTracer`] and strict mode off.
    pub fn new() -> Self {
        Self {
            tracer: Arc::new(NoopTracer),
            strict: false,
        }
    }

    /// Observe passes with `tracer`.
    pub fn tracer(self, tracer: impl Tracer) -> Self {
        self.shared_tracer(Arc::new(tracer))
    }

    /// Observe passes with a tracer shared with other memories.
    pub fn shared_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    /// Panic when a scope's sequence of primitive calls changes between passes.
    ///
    /// Off by default. With it off, a slot of the wrong kind is replaced and a
    /// changed call count goes unnoticed.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Build the memory.
    pub fn build(self) -> Memory {
        Memory::with_env(Env {
            tracer: self.tracer,
            strict: self.strict,
        })
    }
}

/// One node of the memory tree: the slots of one execution of a body.
#[derive(Default)]
pub(crate) struct Scope {
    pub(crate) key: Option<String>,
    pub(crate) slots: Vec<Slot>,
    /// Set once a pass over this scope has completed.
    pub(crate) settled: bool,
}

impl Scope {
    pub(crate) fn keyed(key: String) -> Self {
        Self {
            key: Some(key),
            ..Self::default()
        }
    }

    /// Walk this scope with a fresh cursor.
    pub(crate) fn enter<R>(
        &mut self,
        env: &Env,
        span: SpanId,
        body: impl FnOnce(&mut Cx<'_>) -> R,
    ) -> R {
        let mut cx = Cx::new(self, env, span);
        let result = body(&mut cx);
        cx.finish();
        result
    }

    fn snapshot(&self) -> ScopeSnapshot {
        ScopeSnapshot {
            key: self.key.clone(),
            slots: self.slots.iter().map(Slot::snapshot).collect(),
        }
    }
}

/// Discriminator of a slot, used by strict mode and snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum SlotKind {
    Memo,
    Dedupe,
    Fork,
    Cell,
    Nested,
}

impl fmt::Display for SlotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SlotKind::Memo => "memo",
            SlotKind::Dedupe => "dedupe",
            SlotKind::Fork => "fork",
            SlotKind::Cell => "cell",
            SlotKind::Nested => "nested memory",
        };
        f.write_str(name)
    }
}

pub(crate) enum Slot {
    Memo(MemoSlot),
    Dedupe(DedupeSlot),
    Fork(ForkSlot),
    Cell(CellSlot),
    Nested(Box<Memory>),
}

impl Slot {
    pub(crate) fn kind(&self) -> SlotKind {
        match self {
            Slot::Memo(_) => SlotKind::Memo,
            Slot::Dedupe(_) => SlotKind::Dedupe,
            Slot::Fork(_) => SlotKind::Fork,
            Slot::Cell(_) => SlotKind::Cell,
            Slot::Nested(_) => SlotKind::Nested,
        }
    }

    fn snapshot(&self) -> SlotSnapshot {
        match self {
            Slot::Memo(memo) => SlotSnapshot::Memo {
                scope: memo.scope.snapshot(),
            },
            Slot::Dedupe(_) => SlotSnapshot::Dedupe,
            Slot::Fork(fork) => SlotSnapshot::Fork {
                branches: fork
                    .branches
                    .borrow()
                    .iter()
                    .map(|(key, scope)| (key.clone(), scope.snapshot()))
                    .collect(),
            },
            Slot::Cell(_) => SlotSnapshot::Cell,
            Slot::Nested(memory) => SlotSnapshot::Nested(memory.snapshot()),
        }
    }
}

pub(crate) struct MemoSlot {
    pub(crate) key: Box<dyn Any>,
    pub(crate) value: Box<dyn Any>,
    /// Scope for primitives called inside the compute body; kept across misses.
    pub(crate) scope: Scope,
}

pub(crate) struct DedupeSlot {
    pub(crate) value: Box<dyn Any>,
}

/// Branches are shared with a live [`ForkLater`](crate::ForkLater) handle,
/// which lets the pass keep using its cursor meanwhile.
#[derive(Default)]
pub(crate) struct ForkSlot {
    pub(crate) branches: Rc<RefCell<IndexMap<String, Scope>>>,
}

pub(crate) struct CellSlot {
    pub(crate) cell: Box<dyn Any>,
}

/// Structural view of a [`Memory`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemorySnapshot {
    /// Whether a gate result is cached.
    pub gated: bool,
    /// The root scope.
    pub root: ScopeSnapshot,
}

/// Structural view of one scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScopeSnapshot {
    /// Branch key, for scopes created by `fork`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Slots in call order.
    pub slots: Vec<SlotSnapshot>,
}

/// Structural view of one slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SlotSnapshot {
    /// A `memo` slot and the scope of its compute body.
    Memo {
        /// Scope used by the compute body.
        scope: ScopeSnapshot,
    },
    /// A `dedupe` slot.
    Dedupe,
    /// A `fork` slot with its live branches in first-visit order.
    Fork {
        /// Branch scopes by key.
        branches: IndexMap<String, ScopeSnapshot>,
    },
    /// A `cell` slot.
    Cell,
    /// A child memory.
    Nested(MemorySnapshot),
}
