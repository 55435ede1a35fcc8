//! Tracer trait for observing recomputation passes.
//!
//! This module defines the [`Tracer`] trait and related types for observing
//! how a pass walks the memory tree. The default [`NoopTracer`] costs nothing
//! when tracing is not needed.
//!
//! # Example
//!
//! ```ignore
//! use graft_flow::{Memory, SpanId, Tracer};
//!
//! struct PrintTracer;
//!
//! impl Tracer for PrintTracer {
//!     fn new_span_id(&self) -> SpanId {
//!         SpanId(1)
//!     }
//!
//!     fn on_branch_pruned(&self, _span_id: SpanId, key: &str) {
//!         println!("pruned branch {key}");
//!     }
//! }
//!
//! let memory = Memory::builder().tracer(PrintTracer).build();
//! ```

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for one recomputation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpanId(pub u64);

/// Outcome of a cache check made by a primitive or the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheCheck {
    /// The slot was created during this pass.
    Fresh,
    /// The stored key compared equal; the cached value was reused.
    Hit,
    /// The stored key changed; the value was recomputed.
    Miss,
}

/// Tracer trait for observing passes over a [`Memory`](crate::Memory).
///
/// All methods except [`new_span_id`](Tracer::new_span_id) have default empty
/// implementations, so you only override the events you care about.
///
/// A tracer is shared by a memory and every child memory created beneath it.
pub trait Tracer: Send + Sync + 'static {
    /// Generate a new unique span ID.
    ///
    /// Called once at the start of every pass that is not short-circuited.
    fn new_span_id(&self) -> SpanId;

    /// Called when a pass starts walking a memory's root scope.
    #[inline]
    fn on_pass_start(&self, _span_id: SpanId) {}

    /// Called when a pass finishes, with the number of slots visited at the root.
    #[inline]
    fn on_pass_end(&self, _span_id: SpanId, _root_slots: usize) {}

    /// Called when a gate compares props. `Hit` means the pass was skipped.
    #[inline]
    fn on_gate_check(&self, _check: CacheCheck) {}

    /// Called for every `memo` call.
    #[inline]
    fn on_memo_check(&self, _span_id: SpanId, _index: usize, _check: CacheCheck) {}

    /// Called for every `dedupe` call. `Hit` means the stored value was returned.
    #[inline]
    fn on_dedupe_check(&self, _span_id: SpanId, _index: usize, _check: CacheCheck) {}

    /// Called when a fork branch is entered. `created` is true for a new scope.
    #[inline]
    fn on_branch_enter(&self, _span_id: SpanId, _key: &str, _created: bool) {}

    /// Called when a fork branch was not visited and its scope was dropped.
    #[inline]
    fn on_branch_pruned(&self, _span_id: SpanId, _key: &str) {}
}

/// Zero-cost tracer that discards all events.
///
/// This is the default tracer for [`Memory`](crate::Memory).
pub struct NoopTracer;

/// Global span counter for NoopTracer.
static NOOP_SPAN_COUNTER: AtomicU64 = AtomicU64::new(1);

impl Tracer for NoopTracer {
    #[inline(always)]
    fn new_span_id(&self) -> SpanId {
        SpanId(NOOP_SPAN_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}
