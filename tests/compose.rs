//! End-to-end tests for tools composed with run_cells.

use std::collections::BTreeSet;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use graft_flow::{
    dependents_of, network_references, run_cells, run_cells_with_prev, run_tool, CellSpec, Cx, Memory, Program, PromiseError, SlotSnapshot,
    SyncPromise, Tool, ToolOutput, ToolProps, ToolRegistry, ToolResult, Var, VarBinding,
    VarBindings, View,
};
use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value;

// =============================================================================
// Test tools
// =============================================================================

struct TextView(String);

impl View for TextView {
    fn render(&self) -> String {
        self.0.clone()
    }
}

fn result(output: SyncPromise<ToolOutput>, text: String) -> ToolResult {
    ToolResult {
        output,
        view: Rc::new(TextView(text)),
    }
}

/// A constant number.
struct Number {
    runs: Arc<AtomicUsize>,
}

#[derive(Deserialize)]
struct NumberConfig {
    value: i64,
}

impl Tool for Number {
    fn name(&self) -> &'static str {
        "number"
    }

    fn program_factory(&self, default_input: Option<&str>) -> Program {
        let value = default_input.and_then(|s| s.parse::<i64>().ok()).unwrap_or(0);
        Program::new("number").with("value", value)
    }

    fn compute_references(&self, _program: &Program) -> BTreeSet<String> {
        BTreeSet::new()
    }

    fn run(&self, _cx: &mut Cx<'_>, props: &ToolProps) -> ToolResult {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let output = SyncPromise::try_run(|| {
            let config: NumberConfig = props.program.parse()?;
            Ok(ToolOutput::new(config.value))
        });
        result(output, "number".into())
    }
}

/// Adds a constant to another var.
struct Add {
    runs: Arc<AtomicUsize>,
}

#[derive(Deserialize)]
struct AddConfig {
    var: String,
    amount: i64,
}

impl Tool for Add {
    fn name(&self) -> &'static str {
        "add"
    }

    fn program_factory(&self, default_input: Option<&str>) -> Program {
        Program::new("add")
            .with("var", default_input.unwrap_or(""))
            .with("amount", 0)
    }

    fn compute_references(&self, program: &Program) -> BTreeSet<String> {
        program
            .get("var")
            .and_then(Value::as_str)
            .map(String::from)
            .into_iter()
            .collect()
    }

    fn run(&self, _cx: &mut Cx<'_>, props: &ToolProps) -> ToolResult {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let config: AddConfig = match props.program.parse() {
            Ok(config) => config,
            Err(err) => return ToolResult::failed(err.into()),
        };
        let amount = config.amount;
        let output = props.lookup(&config.var).then(move |input| {
            let n = input
                .value
                .as_i64()
                .ok_or_else(|| anyhow::anyhow!("not a number: {}", input.value))?;
            Ok(ToolOutput::new(n + amount))
        });
        result(output, format!("{} + {}", config.var, amount))
    }
}

/// Sums several vars.
struct Sum {
    runs: Arc<AtomicUsize>,
}

#[derive(Deserialize)]
struct SumConfig {
    vars: Vec<String>,
}

impl Tool for Sum {
    fn name(&self) -> &'static str {
        "sum"
    }

    fn program_factory(&self, _default_input: Option<&str>) -> Program {
        Program::new("sum").with("vars", Vec::<Value>::new())
    }

    fn compute_references(&self, program: &Program) -> BTreeSet<String> {
        program
            .parse::<SumConfig>()
            .map(|config| config.vars.into_iter().collect())
            .unwrap_or_default()
    }

    fn run(&self, _cx: &mut Cx<'_>, props: &ToolProps) -> ToolResult {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let output = SyncPromise::try_flatten(|| {
            let config: SumConfig = props.program.parse()?;
            let inputs = config.vars.iter().map(|id| props.lookup(id));
            Ok(SyncPromise::all(inputs).map(|outputs| {
                ToolOutput::new(outputs.iter().filter_map(|o| o.value.as_i64()).sum::<i64>())
            }))
        });
        result(output, "sum".into())
    }
}

/// Always panics.
struct Explode;

impl Tool for Explode {
    fn name(&self) -> &'static str {
        "explode"
    }

    fn program_factory(&self, _default_input: Option<&str>) -> Program {
        Program::new("explode")
    }

    fn compute_references(&self, _program: &Program) -> BTreeSet<String> {
        BTreeSet::new()
    }

    fn run(&self, _cx: &mut Cx<'_>, _props: &ToolProps) -> ToolResult {
        panic!("tool exploded")
    }
}

/// Outputs the label of the var bound under `var`.
struct Describe;

impl Tool for Describe {
    fn name(&self) -> &'static str {
        "describe"
    }

    fn program_factory(&self, default_input: Option<&str>) -> Program {
        Program::new("describe").with("var", default_input.unwrap_or(""))
    }

    fn compute_references(&self, program: &Program) -> BTreeSet<String> {
        program
            .get("var")
            .and_then(Value::as_str)
            .map(String::from)
            .into_iter()
            .collect()
    }

    fn run(&self, _cx: &mut Cx<'_>, props: &ToolProps) -> ToolResult {
        let id = props.program.get("var").and_then(Value::as_str).unwrap_or("");
        let output = match props.var_bindings.get(id) {
            Some(binding) => SyncPromise::resolve(ToolOutput::new(binding.var.label.clone())),
            None => SyncPromise::reject(PromiseError::UnboundVar { id: id.into() }),
        };
        result(output, "describe".into())
    }
}

struct Fixture {
    registry: ToolRegistry,
    number_runs: Arc<AtomicUsize>,
    add_runs: Arc<AtomicUsize>,
    sum_runs: Arc<AtomicUsize>,
}

impl Fixture {
    fn new() -> Self {
        let fixture = Fixture {
            registry: ToolRegistry::new(),
            number_runs: Arc::default(),
            add_runs: Arc::default(),
            sum_runs: Arc::default(),
        };
        fixture.registry.register(Number {
            runs: fixture.number_runs.clone(),
        });
        fixture.registry.register(Add {
            runs: fixture.add_runs.clone(),
        });
        fixture.registry.register(Sum {
            runs: fixture.sum_runs.clone(),
        });
        fixture.registry.register(Explode);
        fixture.registry.register(Describe);
        fixture
    }

    fn runs(&self) -> (usize, usize, usize) {
        (
            self.number_runs.load(Ordering::SeqCst),
            self.add_runs.load(Ordering::SeqCst),
            self.sum_runs.load(Ordering::SeqCst),
        )
    }

    fn pass(&self, memory: &mut Memory, cells: &[CellSpec]) -> IndexMap<String, ToolResult> {
        self.pass_with(memory, cells, &VarBindings::new())
    }

    fn pass_with(
        &self,
        memory: &mut Memory,
        cells: &[CellSpec],
        outer: &VarBindings,
    ) -> IndexMap<String, ToolResult> {
        memory.run(|cx| run_cells(cx, &self.registry, cells, outer))
    }

    fn pass_with_prev(&self, memory: &mut Memory, cells: &[CellSpec]) -> IndexMap<String, ToolResult> {
        memory.run(|cx| run_cells_with_prev(cx, &self.registry, cells, &VarBindings::new(), PREV))
    }
}

const PREV: &str = "prev";

fn number(id: &str, value: i64) -> CellSpec {
    CellSpec::new(Var::new(id, id), Program::new("number").with("value", value))
}

fn add(id: &str, var: &str, amount: i64) -> CellSpec {
    CellSpec::new(
        Var::new(id, id),
        Program::new("add").with("var", var).with("amount", amount),
    )
}

fn sum(id: &str, vars: &[&str]) -> CellSpec {
    CellSpec::new(
        Var::new(id, id),
        Program::new("sum").with("vars", vars.to_vec()),
    )
}

fn value(result: &ToolResult) -> Option<i64> {
    result.output.state().value().and_then(|output| output.value.as_i64())
}

fn reason(result: &ToolResult) -> Option<PromiseError> {
    result.output.state().reason().cloned()
}

// =============================================================================
// Incremental re-runs
// =============================================================================

#[test]
fn test_two_cells_compose_and_only_edited_cell_reruns() {
    let fixture = Fixture::new();
    let mut memory = Memory::new();

    let results = fixture.pass(&mut memory, &[number("a", 1), add("b", "a", 20)]);
    assert_eq!(value(&results["b"]), Some(21));
    assert_eq!(fixture.runs(), (1, 1, 0));

    // Edit only the second cell.
    let results = fixture.pass(&mut memory, &[number("a", 1), add("b", "a", 30)]);
    assert_eq!(value(&results["b"]), Some(31));
    assert_eq!(fixture.runs(), (1, 2, 0));

    // Nothing changed: nothing runs.
    let results = fixture.pass(&mut memory, &[number("a", 1), add("b", "a", 30)]);
    assert_eq!(value(&results["a"]), Some(1));
    assert_eq!(fixture.runs(), (1, 2, 0));

    // Editing the upstream cell re-runs its dependent too.
    let results = fixture.pass(&mut memory, &[number("a", 2), add("b", "a", 30)]);
    assert_eq!(value(&results["b"]), Some(32));
    assert_eq!(fixture.runs(), (2, 3, 0));
}

#[test]
fn test_cells_evaluate_in_dependency_order() {
    let fixture = Fixture::new();
    let mut memory = Memory::new();
    // "c" is listed before the cells it reads.
    let cells = [sum("c", &["a", "b"]), add("b", "a", 5), number("a", 10)];
    let results = fixture.pass(&mut memory, &cells);
    assert_eq!(value(&results["c"]), Some(25));
    // Results come back in cell order.
    assert_eq!(results.keys().collect::<Vec<_>>(), vec!["c", "b", "a"]);
}

#[test]
fn test_result_promise_is_stable_across_passes() {
    let fixture = Fixture::new();
    let mut memory = Memory::new();
    let first = fixture.pass(&mut memory, &[number("a", 1)]);
    let second = fixture.pass(&mut memory, &[number("a", 1)]);
    assert!(first["a"].output.ptr_eq(&second["a"].output));
}

#[test]
fn test_list_shrink_and_grow() {
    let fixture = Fixture::new();
    let mut memory = Memory::new();
    let branch_keys = |memory: &Memory| match &memory.snapshot().root.slots[0] {
        SlotSnapshot::Fork { branches } => branches.keys().cloned().collect::<Vec<_>>(),
        other => panic!("expected a fork slot, got {other:?}"),
    };

    fixture.pass(&mut memory, &[number("a", 1), number("b", 2), number("c", 3)]);
    assert_eq!(branch_keys(&memory), vec!["a", "b", "c"]);
    assert_eq!(fixture.runs().0, 3);

    fixture.pass(&mut memory, &[number("a", 1), number("b", 2)]);
    assert_eq!(branch_keys(&memory), vec!["a", "b"]);
    assert_eq!(fixture.runs().0, 3);

    // The re-added cell starts from a fresh scope, so its tool runs again.
    let results = fixture.pass(&mut memory, &[number("a", 1), number("b", 2), number("c", 3)]);
    assert_eq!(branch_keys(&memory), vec!["a", "b", "c"]);
    assert_eq!(fixture.runs().0, 4);
    assert_eq!(value(&results["c"]), Some(3));
}

// =============================================================================
// Cycles
// =============================================================================

#[test]
fn test_cycle_rejects_every_member_without_running() {
    let fixture = Fixture::new();
    let mut memory = Memory::new();
    let cells = [
        sum("a", &["b"]),
        sum("b", &["a"]),
        number("c", 5),
        add("d", "a", 1),
    ];
    let results = fixture.pass(&mut memory, &cells);

    let cyclic = PromiseError::Cyclic {
        ids: vec!["a".into(), "b".into(), "d".into()],
    };
    for id in ["a", "b", "d"] {
        assert_eq!(reason(&results[id]), Some(cyclic.clone()), "cell {id}");
    }
    assert_eq!(value(&results["c"]), Some(5));
    assert_eq!(fixture.runs(), (1, 0, 0));
    assert!(results["a"].view.render().contains("cyclic dependency"));
}

#[test]
fn test_self_reference_is_cyclic() {
    let fixture = Fixture::new();
    let mut memory = Memory::new();
    let results = fixture.pass(&mut memory, &[add("a", "a", 1)]);
    assert!(reason(&results["a"]).is_some_and(|reason| reason.is_cyclic()));
}

#[test]
fn test_breaking_a_cycle_recovers() {
    let fixture = Fixture::new();
    let mut memory = Memory::new();
    fixture.pass(&mut memory, &[sum("a", &["b"]), sum("b", &["a"])]);
    let results = fixture.pass(&mut memory, &[sum("a", &["b"]), number("b", 2)]);
    assert_eq!(value(&results["a"]), Some(2));
    assert_eq!(value(&results["b"]), Some(2));
}

// =============================================================================
// Bindings and failures
// =============================================================================

#[test]
fn test_outer_bindings_and_unbound_vars() {
    let fixture = Fixture::new();
    let mut memory = Memory::new();
    let mut outer = VarBindings::new();
    outer.insert(
        "x".into(),
        VarBinding {
            var: Var::new("x", "Outer x"),
            output: SyncPromise::resolve(ToolOutput::new(5)),
        },
    );

    let results = fixture.pass_with(
        &mut memory,
        &[add("y", "x", 1), add("z", "missing", 1)],
        &outer,
    );
    assert_eq!(value(&results["y"]), Some(6));
    assert_eq!(
        reason(&results["z"]),
        Some(PromiseError::UnboundVar {
            id: "missing".into()
        })
    );
}

#[test]
fn test_failures_stay_in_their_cell() {
    let fixture = Fixture::new();
    let mut memory = Memory::new();
    let cells = [
        CellSpec::new(Var::new("p", "p"), Program::new("explode")),
        number("q", 1),
        CellSpec::new(Var::new("r", "r"), Program::new("nope")),
        CellSpec::new(
            Var::new("s", "s"),
            Program::new("add").with("var", "q").with("amount", "lots"),
        ),
    ];
    let results = fixture.pass(&mut memory, &cells);

    assert_eq!(
        reason(&results["p"]),
        Some(PromiseError::Panicked {
            message: "tool exploded".into()
        })
    );
    assert_eq!(value(&results["q"]), Some(1));
    assert_eq!(
        reason(&results["r"]),
        Some(PromiseError::UnknownTool {
            name: "nope".into()
        })
    );
    assert!(matches!(reason(&results["s"]), Some(PromiseError::UserError(_))));
}

#[test]
fn test_switching_tool_starts_fresh() {
    let fixture = Fixture::new();
    let mut memory = Memory::new();
    fixture.pass(&mut memory, &[number("a", 1)]);
    fixture.pass(&mut memory, &[sum("a", &[])]);
    let results = fixture.pass(&mut memory, &[number("a", 1)]);
    assert_eq!(value(&results["a"]), Some(1));
    assert_eq!(fixture.runs(), (2, 0, 1));
}

// =============================================================================
// Previous-cell binding
// =============================================================================

#[test]
fn test_prev_reads_the_cell_above() {
    let fixture = Fixture::new();
    let mut memory = Memory::new();
    let cells = [number("a", 1), add("b", PREV, 10), add("c", PREV, 100)];
    let results = fixture.pass_with_prev(&mut memory, &cells);
    assert_eq!(value(&results["b"]), Some(11));
    assert_eq!(value(&results["c"]), Some(111));

    // Without the option the same cells see nothing under that id.
    let results = fixture.pass(&mut Memory::new(), &cells);
    assert_eq!(
        reason(&results["b"]),
        Some(PromiseError::UnboundVar { id: PREV.into() })
    );
}

#[test]
fn test_prev_var_is_labelled_after_the_cell_above() {
    let fixture = Fixture::new();
    let mut memory = Memory::new();
    let describe = |id: &str| {
        CellSpec::new(Var::new(id, ""), Program::new("describe").with("var", PREV))
    };
    let cells = [
        CellSpec::new(Var::new("a", "total"), Program::new("number").with("value", 1)),
        describe("b"),
        describe("c"),
    ];
    let results = fixture.pass_with_prev(&mut memory, &cells);
    let label = |id: &str| results[id].output.state().value().map(|o| o.value.clone());
    assert_eq!(label("b"), Some(Value::from("\u{2191} total")));
    assert_eq!(label("c"), Some(Value::from("\u{2191} [no label]")));
}

#[test]
fn test_prev_orders_and_reruns_with_the_list() {
    let fixture = Fixture::new();
    let mut memory = Memory::new();
    // "b" is evaluated after "a" because it reads the cell above.
    let results = fixture.pass_with_prev(&mut memory, &[number("a", 2), add("b", PREV, 1)]);
    assert_eq!(value(&results["b"]), Some(3));
    assert_eq!(fixture.runs(), (1, 1, 0));

    fixture.pass_with_prev(&mut memory, &[number("a", 2), add("b", PREV, 1)]);
    assert_eq!(fixture.runs(), (1, 1, 0));

    // Inserting a cell above changes what "b" reads.
    let results = fixture.pass_with_prev(
        &mut memory,
        &[number("a", 2), number("n", 40), add("b", PREV, 1)],
    );
    assert_eq!(value(&results["b"]), Some(41));
    assert_eq!(fixture.runs(), (2, 2, 0));
}

#[test]
fn test_prev_on_first_cell_and_through_cycles() {
    let fixture = Fixture::new();
    let mut memory = Memory::new();
    let results = fixture.pass_with_prev(&mut memory, &[add("a", PREV, 1)]);
    assert_eq!(
        reason(&results["a"]),
        Some(PromiseError::UnboundVar { id: PREV.into() })
    );

    // "a" reads "b", and "b" reads the cell above it, which is "a".
    let results = fixture.pass_with_prev(&mut memory, &[add("a", "b", 1), add("b", PREV, 1)]);
    for id in ["a", "b"] {
        assert!(reason(&results[id]).is_some_and(|reason| reason.is_cyclic()), "cell {id}");
    }
}

// =============================================================================
// Registry helpers
// =============================================================================

#[test]
fn test_dependents_of() {
    let fixture = Fixture::new();
    let cells = [number("a", 1), add("b", "a", 1), sum("c", &["a", "b"]), number("d", 0)];
    let dependents = dependents_of(&fixture.registry, &cells, "a");
    assert_eq!(dependents.into_iter().collect::<Vec<_>>(), vec!["b", "c"]);
}

#[test]
fn test_network_references_are_the_outside_inputs() {
    let fixture = Fixture::new();
    let cells = [add("b", "x", 1), sum("c", &["b", "y", PREV]), number("d", 0)];

    let outside = network_references(&fixture.registry, &cells, Some(PREV));
    assert_eq!(outside.into_iter().collect::<Vec<_>>(), vec!["x", "y"]);

    let outside = network_references(&fixture.registry, &cells, None);
    assert_eq!(outside.into_iter().collect::<Vec<_>>(), vec!["prev", "x", "y"]);
}

#[test]
fn test_program_factory_through_registry() {
    let fixture = Fixture::new();
    let program = fixture.registry.new_program("number", Some("7")).unwrap();
    let mut memory = Memory::new();
    let result = memory.run(|cx| run_tool(cx, &fixture.registry, ToolProps::new(program)));
    assert_eq!(value(&result), Some(7));
}
