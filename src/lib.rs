#![deny(missing_docs)]
#![doc = include_str!("../README.md")]

mod compose;
mod cx;
mod error;
pub mod eq;
mod gate;
mod memory;
mod promise;
mod tool;
pub mod toposort;
pub mod tracer;

pub use compose::{dependents_of, network_references, run_cells, run_cells_with_prev, CellSpec};
pub use cx::{Cx, Fork, ForkLater, Later};
pub use eq::ByRef;
pub use error::{ProgramError, PromiseError, ToposortError};
pub use gate::{Gate, PropsComparator};
pub use memory::{Memory, MemoryBuilder, MemorySnapshot, ScopeSnapshot, SlotSnapshot};
pub use promise::{Outcome, PromiseState, Resolver, SyncPromise};
pub use tool::{
    run_tool, ErrorView, Program, Tool, ToolOutput, ToolProps, ToolRegistry, ToolResult, Var,
    VarBinding, VarBindings, View,
};
pub use toposort::{toposort, Toposorted};
pub use tracer::{CacheCheck, NoopTracer, SpanId, Tracer};
