//! Running sibling computations that reference each other's outputs.
//!
//! [`run_cells`] is the building block for composite tools such as notebooks:
//! it orders cells by the vars they reference, runs each one exactly once with
//! bindings to the outputs it needs, and refuses to run cells caught in a
//! reference cycle. [`run_cells_with_prev`] adds a binding to the previous
//! cell's output, for notebook-style "use the cell above" references.

use std::collections::{BTreeSet, HashSet};

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};

use crate::cx::Cx;
use crate::tool::{run_tool, Program, ToolProps, ToolRegistry, ToolResult, Var, VarBinding, VarBindings};
use crate::toposort::toposort;
use crate::PromiseError;

/// One computation in a composition: a var to publish its output under, and
/// the program that produces it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellSpec {
    /// The var the output is bound to.
    pub var: Var,
    /// The program to run.
    pub program: Program,
}

impl CellSpec {
    /// Create a cell.
    pub fn new(var: Var, program: Program) -> Self {
        Self { var, program }
    }
}

/// Run `cells` in dependency order inside a `fork`, one branch per var id.
///
/// Each cell sees bindings for exactly the identifiers its tool reports as
/// references: sibling cells' outputs first, then `outer`. Cells that are in
/// or downstream of a cycle are not run; their outputs are rejected with
/// [`PromiseError::Cyclic`]. Results come back keyed by var id, in cell order.
///
/// Var ids are expected to be unique; a later cell with a repeated id replaces
/// the earlier one.
pub fn run_cells(
    cx: &mut Cx<'_>,
    registry: &ToolRegistry,
    cells: &[CellSpec],
    outer: &VarBindings,
) -> IndexMap<String, ToolResult> {
    run_network(cx, registry, cells, outer, None)
}

/// Like [`run_cells`], and every cell but the first may also reference
/// `prev_var` to read the output of the cell listed just before it.
///
/// The bound var is labelled after that cell, as in `↑ total`. Referencing
/// `prev_var` orders the cell after its predecessor and counts as an edge for
/// cycle detection. The first cell has no predecessor, so there `prev_var`
/// resolves through `outer` like any other identifier.
pub fn run_cells_with_prev(
    cx: &mut Cx<'_>,
    registry: &ToolRegistry,
    cells: &[CellSpec],
    outer: &VarBindings,
    prev_var: &str,
) -> IndexMap<String, ToolResult> {
    run_network(cx, registry, cells, outer, Some(prev_var))
}

fn run_network(
    cx: &mut Cx<'_>,
    registry: &ToolRegistry,
    cells: &[CellSpec],
    outer: &VarBindings,
    prev_var: Option<&str>,
) -> IndexMap<String, ToolResult> {
    let cells: IndexMap<&str, &CellSpec> = cells
        .iter()
        .map(|cell| (cell.var.id.as_str(), cell))
        .collect();
    let references: IndexMap<&str, BTreeSet<String>> = cells
        .iter()
        .map(|(id, cell)| (*id, registry.references(&cell.program)))
        .collect();

    // cell id -> predecessor id, for cells that read `prev_var`
    let predecessors: IndexMap<&str, &str> = match prev_var {
        Some(prev_var) => cells
            .keys()
            .zip(cells.keys().skip(1))
            .filter(|(_, id)| references[**id].contains(prev_var))
            .map(|(prev, id)| (*id, *prev))
            .collect(),
        None => IndexMap::new(),
    };

    let mut edges: Vec<(&str, &str)> = Vec::new();
    for (id, refs) in &references {
        for r in refs {
            if let Some((r, _)) = cells.get_key_value(r.as_str()) {
                edges.push((*id, *r));
            }
        }
    }
    edges.extend(predecessors.iter().map(|(id, prev)| (*id, *prev)));

    let (sorted, cyclic) = match toposort(cells.keys().copied(), edges) {
        Ok(order) => (order.sorted, order.cyclic),
        // Edges only name listed cells, but stay total rather than panic.
        Err(err) => {
            let err = PromiseError::from(err);
            return cells
                .keys()
                .map(|id| (id.to_string(), ToolResult::failed(err.clone())))
                .collect();
        }
    };
    let cyclic_ids: Vec<String> = cyclic.iter().map(|id| id.to_string()).collect();

    let mut results: IndexMap<String, ToolResult> = IndexMap::new();
    cx.fork(|fork| {
        for id in &sorted {
            let mut var_bindings = bindings_for(&references[id], &cells, &results, outer);
            if let (Some(prev_var), Some(prev)) = (prev_var, predecessors.get(id)) {
                if let Some(binding) = prev_binding(prev_var, cells[prev], &results) {
                    var_bindings.insert(prev_var.to_string(), binding);
                }
            }
            let props = ToolProps {
                program: cells[id].program.clone(),
                var_bindings,
            };
            let result = fork.branch(*id, |cx| run_tool(cx, registry, props));
            results.insert(id.to_string(), result);
        }
        for id in &cyclic {
            let result = fork.branch(*id, |cx| {
                // Same slot shape as run_tool, with no branch, so the cell's
                // tool memory is dropped while it is cyclic.
                cx.fork(|_| {
                    ToolResult::failed(PromiseError::Cyclic {
                        ids: cyclic_ids.clone(),
                    })
                })
            });
            results.insert(id.to_string(), result);
        }
    });

    cells
        .keys()
        .filter_map(|id| results.swap_remove(*id).map(|result| (id.to_string(), result)))
        .collect()
}

fn bindings_for(
    references: &BTreeSet<String>,
    cells: &IndexMap<&str, &CellSpec>,
    results: &IndexMap<String, ToolResult>,
    outer: &VarBindings,
) -> VarBindings {
    let mut bindings = VarBindings::new();
    for id in references {
        let binding = match (cells.get(id.as_str()), results.get(id)) {
            (Some(cell), Some(result)) => VarBinding {
                var: cell.var.clone(),
                output: result.output.clone(),
            },
            _ => match outer.get(id) {
                Some(binding) => binding.clone(),
                None => continue,
            },
        };
        bindings.insert(id.clone(), binding);
    }
    bindings
}

fn prev_binding(
    prev_var: &str,
    prev: &CellSpec,
    results: &IndexMap<String, ToolResult>,
) -> Option<VarBinding> {
    let result = results.get(&prev.var.id)?;
    let label = match prev.var.label.as_str() {
        "" => "[no label]",
        label => label,
    };
    Some(VarBinding {
        var: Var::new(prev_var, format!("\u{2191} {label}")),
        output: result.output.clone(),
    })
}

/// Identifiers the cells reference that the network does not provide itself,
/// i.e. what a host has to bind from outside.
///
/// Cell var ids are provided by the network, and so is `prev_var` when given.
pub fn network_references(
    registry: &ToolRegistry,
    cells: &[CellSpec],
    prev_var: Option<&str>,
) -> BTreeSet<String> {
    let provided: HashSet<&str> = cells
        .iter()
        .map(|cell| cell.var.id.as_str())
        .chain(prev_var)
        .collect();
    cells
        .iter()
        .flat_map(|cell| registry.references(&cell.program))
        .filter(|id| !provided.contains(id.as_str()))
        .collect()
}

/// Ids of `cells` whose programs reference `id`, directly.
pub fn dependents_of(registry: &ToolRegistry, cells: &[CellSpec], id: &str) -> IndexSet<String> {
    cells
        .iter()
        .filter(|cell| registry.references(&cell.program).contains(id))
        .map(|cell| cell.var.id.clone())
        .collect()
}
