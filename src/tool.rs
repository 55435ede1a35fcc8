//! The tool convention built on the engine.
//!
//! A [`Tool`] turns a serializable [`Program`] plus the var bindings in scope
//! into a [`ToolResult`]: an output promise and a view. Tools are looked up by
//! name in a [`ToolRegistry`] and run through [`run_tool`], which gives every
//! tool instance its own gated memory.

use std::collections::BTreeSet;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::cx::Cx;
use crate::error::ProgramError;
use crate::gate::Gate;
use crate::promise::SyncPromise;
use crate::PromiseError;

/// Serializable configuration of one tool instance.
///
/// Serialized as a JSON object with a `toolName` field and the tool's own
/// fields beside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    /// Name the tool is registered under.
    #[serde(rename = "toolName")]
    pub tool_name: String,
    /// Tool-specific fields.
    #[serde(flatten)]
    pub config: Map<String, Value>,
}

impl Program {
    /// An empty program for `tool_name`.
    pub fn new(tool_name: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            config: Map::new(),
        }
    }

    /// Set a field, builder style.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(field.into(), value.into());
        self
    }

    /// A field of the configuration.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.config.get(field)
    }

    /// Deserialize the configuration into the tool's own type.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, ProgramError> {
        serde_json::from_value(Value::Object(self.config.clone())).map_err(|source| {
            ProgramError::Invalid {
                tool: self.tool_name.clone(),
                source,
            }
        })
    }
}

/// Value produced by a tool.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    /// The produced value.
    pub value: Value,
}

impl ToolOutput {
    /// Wrap a value.
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

/// A named value slot in the composition graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Var {
    /// Identifier programs reference the var by.
    pub id: String,
    /// Human-readable label.
    pub label: String,
}

impl Var {
    /// Create a var.
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
        }
    }
}

/// A var together with the promise of its current value.
///
/// Two bindings are equal when they name the same var and hold the very same
/// output promise; a rebuilt promise with an equal value is a change.
#[derive(Debug, Clone, PartialEq)]
pub struct VarBinding {
    /// The var being bound.
    pub var: Var,
    /// Its output.
    pub output: SyncPromise<ToolOutput>,
}

/// Var bindings in scope, keyed by var id.
pub type VarBindings = IndexMap<String, VarBinding>;

/// Props a tool is run with.
///
/// Compared by the tool gate: the program structurally, bindings by var and
/// output-promise identity.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolProps {
    /// The tool's program.
    pub program: Program,
    /// Bindings visible to the program.
    pub var_bindings: VarBindings,
}

impl ToolProps {
    /// Props with no bindings.
    pub fn new(program: Program) -> Self {
        Self {
            program,
            var_bindings: VarBindings::new(),
        }
    }

    /// Add a binding, builder style.
    pub fn bind(mut self, binding: VarBinding) -> Self {
        self.var_bindings.insert(binding.var.id.clone(), binding);
        self
    }

    /// The output promise bound to `id`, or a promise rejected with
    /// [`PromiseError::UnboundVar`].
    pub fn lookup(&self, id: &str) -> SyncPromise<ToolOutput> {
        match self.var_bindings.get(id) {
            Some(binding) => binding.output.clone(),
            None => SyncPromise::reject(PromiseError::UnboundVar { id: id.to_string() }),
        }
    }
}

/// Interactive surface of a tool, rendered by the host.
pub trait View {
    /// A textual rendering, for headless hosts and tests.
    fn render(&self) -> String;
}

/// View shown in place of a tool that could not run.
#[derive(Debug, Clone)]
pub struct ErrorView {
    /// What went wrong.
    pub message: String,
}

impl View for ErrorView {
    fn render(&self) -> String {
        format!("error: {}", self.message)
    }
}

/// What running a tool produces.
#[derive(Clone)]
pub struct ToolResult {
    /// The tool's output.
    pub output: SyncPromise<ToolOutput>,
    /// The tool's view.
    pub view: Rc<dyn View>,
}

impl ToolResult {
    /// A result whose output is rejected with `error` and whose view shows it.
    pub fn failed(error: PromiseError) -> Self {
        Self {
            view: Rc::new(ErrorView {
                message: error.to_string(),
            }),
            output: SyncPromise::reject(error),
        }
    }
}

impl fmt::Debug for ToolResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolResult")
            .field("output", &self.output)
            .field("view", &self.view.render())
            .finish()
    }
}

/// A kind of computation that can be placed in a composition.
///
/// Implementations hold no per-instance state: everything that must persist
/// between runs lives in the memory behind the [`Cx`] passed to `run`.
pub trait Tool: Send + Sync + 'static {
    /// Name the tool is registered under; matches [`Program::tool_name`].
    fn name(&self) -> &'static str;

    /// A fresh program, optionally seeded with input code.
    fn program_factory(&self, default_input: Option<&str>) -> Program;

    /// Identifiers of the vars `program` reads.
    fn compute_references(&self, program: &Program) -> BTreeSet<String>;

    /// Produce an output and a view.
    fn run(&self, cx: &mut Cx<'_>, props: &ToolProps) -> ToolResult;
}

/// Name-to-tool lookup.
///
/// Prefer passing an explicit registry around; [`ToolRegistry::global`] exists
/// for hosts that want one process-wide instance.
#[derive(Default)]
pub struct ToolRegistry {
    #[cfg(feature = "global-registry")]
    tools: parking_lot::RwLock<IndexMap<String, Arc<dyn Tool>>>,
    #[cfg(not(feature = "global-registry"))]
    tools: std::cell::RefCell<IndexMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `tool` under its name, returning any tool it replaces.
    pub fn register(&self, tool: impl Tool) -> Option<Arc<dyn Tool>> {
        self.register_shared(Arc::new(tool))
    }

    /// Register an already shared tool.
    pub fn register_shared(&self, tool: Arc<dyn Tool>) -> Option<Arc<dyn Tool>> {
        let name = tool.name().to_string();
        self.write().insert(name, tool)
    }

    /// The tool registered under `name`.
    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.read().get(name).cloned()
    }

    /// Registered names, in registration order.
    pub fn names(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    /// A fresh program for the tool named `name`.
    pub fn new_program(&self, name: &str, default_input: Option<&str>) -> Option<Program> {
        self.lookup(name)
            .map(|tool| tool.program_factory(default_input))
    }

    /// References of `program`, or none if its tool is unknown.
    pub fn references(&self, program: &Program) -> BTreeSet<String> {
        self.lookup(&program.tool_name)
            .map(|tool| tool.compute_references(program))
            .unwrap_or_default()
    }

    /// The process-wide registry.
    #[cfg(feature = "global-registry")]
    pub fn global() -> &'static ToolRegistry {
        static GLOBAL: std::sync::OnceLock<ToolRegistry> = std::sync::OnceLock::new();
        GLOBAL.get_or_init(ToolRegistry::new)
    }

    #[cfg(feature = "global-registry")]
    fn read(&self) -> parking_lot::RwLockReadGuard<'_, IndexMap<String, Arc<dyn Tool>>> {
        self.tools.read()
    }

    #[cfg(feature = "global-registry")]
    fn write(&self) -> parking_lot::RwLockWriteGuard<'_, IndexMap<String, Arc<dyn Tool>>> {
        self.tools.write()
    }

    #[cfg(not(feature = "global-registry"))]
    fn read(&self) -> std::cell::Ref<'_, IndexMap<String, Arc<dyn Tool>>> {
        self.tools.borrow()
    }

    #[cfg(not(feature = "global-registry"))]
    fn write(&self) -> std::cell::RefMut<'_, IndexMap<String, Arc<dyn Tool>>> {
        self.tools.borrow_mut()
    }
}

/// Run the tool named by `props.program` with its own gated memory.
///
/// The memory is keyed by tool name, so switching a program to another tool
/// starts from scratch. An unknown tool, or a panic inside the tool, becomes a
/// rejected output instead of unwinding through the caller's pass.
pub fn run_tool(cx: &mut Cx<'_>, registry: &ToolRegistry, props: ToolProps) -> ToolResult {
    let tool_name = props.program.tool_name.clone();
    cx.fork(|fork| {
        fork.branch(tool_name.as_str(), |cx| match registry.lookup(&tool_name) {
            Some(tool) => {
                let gate = Gate::new(move |cx, props: &ToolProps| {
                    catch_unwind(AssertUnwindSafe(|| tool.run(cx, props))).unwrap_or_else(
                        |payload| ToolResult::failed(PromiseError::from_panic(payload)),
                    )
                });
                cx.call(&gate, props)
            }
            None => ToolResult::failed(PromiseError::UnknownTool {
                name: tool_name.clone(),
            }),
        })
    })
}
