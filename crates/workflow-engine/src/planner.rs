//! Execution order planning
//!
//! Converts a graph into an ordered list of steps. Each step is a set of
//! nodes with no ordering dependency between them, so the coordinator may
//! dispatch a step's nodes concurrently.
//!
//! # Algorithm
//!
//! 1. Drop inactive nodes and the edges touching them, plus `LoopEnd ->
//!    LoopStart` back-edges.
//! 2. Pair every `LoopStart` with the first `LoopEnd` reached going
//!    forward. Everything reachable from the start without passing the end
//!    forms the loop region.
//! 3. Contract each loop region into a single unit and layer the units with
//!    Kahn's algorithm. A unit joins a layer once all its predecessors sit in
//!    earlier layers.
//! 4. Emit one parallel step per layer for ordinary nodes, followed by the
//!    layer's loop regions as sequential single-node steps.
//!
//! `IfElse` nodes additionally get their downstream split into a True and a
//! False partition so the coordinator can skip the unselected branch.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::ops::Range;

use serde::Serialize;

use crate::activity::inactive_nodes;
use crate::types::{handles, GraphEdge, NodeId, NodeKind, WorkflowGraph};
use crate::validation::ValidationError;

/// How the nodes of a step may be dispatched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepMode {
    /// Nodes are independent and may run concurrently
    Parallel,
    /// Single node inside a region that is not analysed for parallelism
    Sequential,
}

/// A set of nodes eligible for dispatch together
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub nodes: Vec<NodeId>,
    pub mode: StepMode,
    /// The LoopStart of the region this step belongs to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loop_id: Option<NodeId>,
}

/// A LoopStart/LoopEnd pair and the region they delimit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopRegion {
    pub start: NodeId,
    pub end: NodeId,
    /// Region nodes in execution order, including start and end
    pub members: Vec<NodeId>,
    /// Indices of the plan steps covering this region
    pub steps: Range<usize>,
}

impl LoopRegion {
    /// Whether a node belongs to this region
    pub fn contains(&self, node_id: &str) -> bool {
        self.members.iter().any(|m| m == node_id)
    }
}

/// The downstream split of an IfElse node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchPartition {
    pub node_id: NodeId,
    /// Nodes that only run when the condition holds
    pub when_true: BTreeSet<NodeId>,
    /// Nodes that only run when the condition fails
    pub when_false: BTreeSet<NodeId>,
}

impl BranchPartition {
    /// Nodes skipped for a given condition result
    pub fn skipped_for(&self, condition: bool) -> &BTreeSet<NodeId> {
        if condition {
            &self.when_false
        } else {
            &self.when_true
        }
    }
}

/// The planned execution order of a graph
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPlan {
    pub steps: Vec<Step>,
    pub loops: Vec<LoopRegion>,
    pub branches: Vec<BranchPartition>,
    /// Nodes excluded because they, or an ancestor, are inactive
    pub inactive: BTreeSet<NodeId>,
    /// Nodes placed sequentially because they sit inside a loop region
    pub unsupported_parallel: BTreeSet<NodeId>,
}

impl ExecutionPlan {
    /// All planned nodes in step order
    pub fn node_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.steps.iter().flat_map(|s| s.nodes.iter())
    }

    /// Index of the step containing a node
    pub fn step_of(&self, node_id: &str) -> Option<usize> {
        self.steps
            .iter()
            .position(|s| s.nodes.iter().any(|n| n == node_id))
    }

    /// The loop region whose first step is `step_index`
    pub fn loop_starting_at(&self, step_index: usize) -> Option<&LoopRegion> {
        self.loops.iter().find(|l| l.steps.start == step_index)
    }

    /// The loop region containing a node
    pub fn loop_of(&self, node_id: &str) -> Option<&LoopRegion> {
        self.loops.iter().find(|l| l.contains(node_id))
    }

    /// Branch partition of an IfElse node
    pub fn branch(&self, node_id: &str) -> Option<&BranchPartition> {
        self.branches.iter().find(|b| b.node_id == node_id)
    }

    /// Presentation label of a step ("Parallel Step N (k)" or "Step N")
    pub fn step_label(&self, step_index: usize) -> Option<String> {
        let step = self.steps.get(step_index)?;
        let number = step_index + 1;
        Some(if step.mode == StepMode::Parallel && step.nodes.len() > 1 {
            format!("Parallel Step {} ({})", number, step.nodes.len())
        } else {
            format!("Step {}", number)
        })
    }

    /// Branch suffix of a node ("– True" / "– False")
    pub fn branch_suffix(&self, node_id: &str) -> Option<&'static str> {
        self.branches.iter().find_map(|b| {
            if b.when_true.contains(node_id) {
                Some("– True")
            } else if b.when_false.contains(node_id) {
                Some("– False")
            } else {
                None
            }
        })
    }
}

/// Plan a graph, deriving the inactive set from the nodes' `active` flags
pub fn plan_graph(graph: &WorkflowGraph) -> Result<ExecutionPlan, ValidationError> {
    let inactive = inactive_nodes(graph);
    plan(graph, &inactive)
}

/// LoopStart/LoopEnd pairs of a graph, ignoring node activity
pub fn loop_pairs(graph: &WorkflowGraph) -> Vec<(NodeId, NodeId)> {
    let pg = PlanningGraph::new(graph, &BTreeSet::new());
    find_loop_regions(&pg)
        .into_iter()
        .map(|(start, end, _)| (start.to_string(), end.to_string()))
        .collect()
}

/// Whether an edge closes a loop (LoopEnd feeding back into a LoopStart)
pub fn is_loop_back_edge(graph: &WorkflowGraph, edge: &GraphEdge) -> bool {
    let source_is_end = graph
        .find_node(&edge.source)
        .map_or(false, |n| matches!(n.kind, NodeKind::LoopEnd));
    let target_is_start = graph
        .find_node(&edge.target)
        .map_or(false, |n| matches!(n.kind, NodeKind::LoopStart(_)));
    source_is_end && target_is_start
}

/// Adjacency over the active part of a graph
struct PlanningGraph<'a> {
    graph: &'a WorkflowGraph,
    /// Active node IDs in graph order
    nodes: Vec<&'a str>,
    index: HashMap<&'a str, usize>,
    edges: Vec<&'a GraphEdge>,
    successors: HashMap<&'a str, Vec<&'a str>>,
    predecessors: HashMap<&'a str, Vec<&'a str>>,
}

impl<'a> PlanningGraph<'a> {
    fn new(graph: &'a WorkflowGraph, inactive: &BTreeSet<NodeId>) -> Self {
        let nodes: Vec<&str> = graph
            .nodes
            .iter()
            .filter(|n| !inactive.contains(&n.id))
            .map(|n| n.id.as_str())
            .collect();
        let index: HashMap<&str, usize> = nodes.iter().enumerate().map(|(i, id)| (*id, i)).collect();

        let edges: Vec<&GraphEdge> = graph
            .edges
            .iter()
            .filter(|e| index.contains_key(e.source.as_str()) && index.contains_key(e.target.as_str()))
            .filter(|e| !is_loop_back_edge(graph, e))
            .collect();

        let mut successors: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut predecessors: HashMap<&str, Vec<&str>> = HashMap::new();
        for edge in &edges {
            successors
                .entry(edge.source.as_str())
                .or_default()
                .push(edge.target.as_str());
            predecessors
                .entry(edge.target.as_str())
                .or_default()
                .push(edge.source.as_str());
        }

        Self {
            graph,
            nodes,
            index,
            edges,
            successors,
            predecessors,
        }
    }

    fn kind(&self, id: &str) -> Option<&'a NodeKind> {
        self.graph.find_node(id).map(|n| &n.kind)
    }

    fn successors(&self, id: &str) -> &[&'a str] {
        self.successors.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    fn predecessors(&self, id: &str) -> &[&'a str] {
        self.predecessors.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Targets of a node's edges leaving through `handle`
    fn branch_targets(&self, node: &str, handle: &str) -> Vec<&'a str> {
        self.edges
            .iter()
            .copied()
            .filter(|e| e.source == node && e.source_handle.as_deref() == Some(handle))
            .map(|e| e.target.as_str())
            .collect()
    }

    /// Forward reachability from `roots`, including the roots themselves
    fn reachable_from<I: IntoIterator<Item = &'a str>>(&self, roots: I) -> BTreeSet<NodeId> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        for root in roots {
            if seen.insert(root) {
                queue.push_back(root);
            }
        }
        while let Some(node) = queue.pop_front() {
            for &next in self.successors(node) {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        seen.into_iter().map(str::to_string).collect()
    }
}

/// Pairs LoopStart nodes with their LoopEnd and collects region members
fn find_loop_regions<'a>(pg: &PlanningGraph<'a>) -> Vec<(&'a str, &'a str, HashSet<&'a str>)> {
    let mut regions: Vec<(&str, &str, HashSet<&str>)> = Vec::new();

    for &start in &pg.nodes {
        if !matches!(pg.kind(start), Some(NodeKind::LoopStart(_))) {
            continue;
        }
        if regions.iter().any(|(_, _, members)| members.contains(start)) {
            // Nested loop starts run as plain nodes of the enclosing region.
            continue;
        }

        let mut members: HashSet<&str> = HashSet::from([start]);
        let mut queue: VecDeque<&str> = VecDeque::from([start]);
        let mut end: Option<&str> = None;
        while let Some(node) = queue.pop_front() {
            for &next in pg.successors(node) {
                if !members.insert(next) {
                    continue;
                }
                if matches!(pg.kind(next), Some(NodeKind::LoopEnd)) {
                    end.get_or_insert(next);
                    continue;
                }
                queue.push_back(next);
            }
        }

        let Some(end) = end else {
            log::debug!("LoopStart '{}' has no reachable LoopEnd; planning it as a plain node", start);
            continue;
        };
        // Other LoopEnds reached on side paths are plain members of the region.
        if regions
            .iter()
            .any(|(_, _, other)| other.iter().any(|m| members.contains(m)))
        {
            log::debug!("Loop region of '{}' overlaps an earlier region; planning it as plain nodes", start);
            continue;
        }
        regions.push((start, end, members));
    }

    regions
}

/// Kahn's algorithm in layers over unit indices
///
/// Returns the layers, or the units left over when a cycle blocks progress.
fn layer_units(unit_count: usize, edges: &BTreeSet<(usize, usize)>) -> Result<Vec<Vec<usize>>, Vec<usize>> {
    let mut in_degree = vec![0usize; unit_count];
    let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); unit_count];
    for &(from, to) in edges {
        adjacency[from].push(to);
        in_degree[to] += 1;
    }

    let mut layers = Vec::new();
    let mut current: Vec<usize> = (0..unit_count).filter(|&u| in_degree[u] == 0).collect();
    let mut placed = 0;

    while !current.is_empty() {
        placed += current.len();
        let mut next = Vec::new();
        for &unit in &current {
            for &succ in &adjacency[unit] {
                in_degree[succ] -= 1;
                if in_degree[succ] == 0 {
                    next.push(succ);
                }
            }
        }
        next.sort_unstable();
        layers.push(std::mem::take(&mut current));
        current = next;
    }

    if placed < unit_count {
        return Err((0..unit_count).filter(|&u| in_degree[u] > 0).collect());
    }
    Ok(layers)
}

/// Order a loop region's members; start first, end last
fn order_region<'a>(
    pg: &PlanningGraph<'a>,
    members: &HashSet<&'a str>,
) -> Result<Vec<&'a str>, ValidationError> {
    let mut ordered_members: Vec<&str> = members.iter().copied().collect();
    ordered_members.sort_by_key(|id| pg.index[id]);
    let local: HashMap<&str, usize> = ordered_members.iter().enumerate().map(|(i, id)| (*id, i)).collect();

    let mut edges = BTreeSet::new();
    for &node in &ordered_members {
        for &next in pg.successors(node) {
            if let Some(&to) = local.get(next) {
                edges.insert((local[node], to));
            }
        }
    }

    match layer_units(ordered_members.len(), &edges) {
        Ok(layers) => Ok(layers
            .into_iter()
            .flatten()
            .map(|i| ordered_members[i])
            .collect()),
        Err(stuck) => Err(ValidationError::CycleDetected {
            node_ids: stuck.into_iter().map(|i| ordered_members[i].to_string()).collect(),
        }),
    }
}

/// Compute the downstream partitions of every IfElse node
fn branch_partitions(pg: &PlanningGraph<'_>) -> Vec<BranchPartition> {
    let mut partitions = Vec::new();
    for &node in &pg.nodes {
        if !matches!(pg.kind(node), Some(NodeKind::IfElse(_))) {
            continue;
        }
        let reach_true = pg.reachable_from(pg.branch_targets(node, handles::BRANCH_TRUE));
        let reach_false = pg.reachable_from(pg.branch_targets(node, handles::BRANCH_FALSE));

        let when_true: BTreeSet<NodeId> = reach_true
            .difference(&reach_false)
            .filter(|id| id.as_str() != node)
            .cloned()
            .collect();
        let when_false: BTreeSet<NodeId> = reach_false
            .difference(&reach_true)
            .filter(|id| id.as_str() != node)
            .cloned()
            .collect();

        partitions.push(BranchPartition {
            node_id: node.to_string(),
            when_true,
            when_false,
        });
    }
    partitions
}

/// Plan a graph given its precomputed inactive set
pub fn plan(graph: &WorkflowGraph, inactive: &BTreeSet<NodeId>) -> Result<ExecutionPlan, ValidationError> {
    let pg = PlanningGraph::new(graph, inactive);
    let regions = find_loop_regions(&pg);

    let mut region_of: HashMap<&str, usize> = HashMap::new();
    for (r, (_, _, members)) in regions.iter().enumerate() {
        for &member in members {
            region_of.insert(member, r);
        }
    }

    // Contract each loop region into one unit, numbering units by first
    // appearance in graph order so ties break deterministically.
    enum Unit<'a> {
        Node(&'a str),
        Loop(usize),
    }
    let mut units: Vec<Unit> = Vec::new();
    let mut unit_of: HashMap<&str, usize> = HashMap::new();
    let mut unit_of_region: HashMap<usize, usize> = HashMap::new();
    for &node in &pg.nodes {
        let unit = match region_of.get(node) {
            Some(&r) => *unit_of_region.entry(r).or_insert_with(|| {
                units.push(Unit::Loop(r));
                units.len() - 1
            }),
            None => {
                units.push(Unit::Node(node));
                units.len() - 1
            }
        };
        unit_of.insert(node, unit);
    }

    let mut unit_edges = BTreeSet::new();
    for edge in &pg.edges {
        let from = unit_of[edge.source.as_str()];
        let to = unit_of[edge.target.as_str()];
        if from != to {
            unit_edges.insert((from, to));
        }
    }

    let layers = layer_units(units.len(), &unit_edges).map_err(|stuck| {
        let mut node_ids: Vec<NodeId> = Vec::new();
        for unit in stuck {
            match &units[unit] {
                Unit::Node(id) => node_ids.push(id.to_string()),
                Unit::Loop(r) => node_ids.push(regions[*r].0.to_string()),
            }
        }
        ValidationError::CycleDetected { node_ids }
    })?;

    let mut plan = ExecutionPlan {
        inactive: inactive.clone(),
        ..Default::default()
    };

    for layer in layers {
        let parallel: Vec<NodeId> = layer
            .iter()
            .filter_map(|&u| match units[u] {
                Unit::Node(id) => Some(id.to_string()),
                Unit::Loop(_) => None,
            })
            .collect();
        if !parallel.is_empty() {
            plan.steps.push(Step {
                nodes: parallel,
                mode: StepMode::Parallel,
                loop_id: None,
            });
        }

        for &u in &layer {
            let Unit::Loop(r) = units[u] else { continue };
            let (start, end, members) = &regions[r];
            let ordered = order_region(&pg, members)?;
            let first_step = plan.steps.len();
            for &member in &ordered {
                plan.steps.push(Step {
                    nodes: vec![member.to_string()],
                    mode: StepMode::Sequential,
                    loop_id: Some(start.to_string()),
                });
                plan.unsupported_parallel.insert(member.to_string());
            }
            plan.loops.push(LoopRegion {
                start: start.to_string(),
                end: end.to_string(),
                members: ordered.iter().map(|m| m.to_string()).collect(),
                steps: first_step..plan.steps.len(),
            });
        }
    }

    plan.branches = branch_partitions(&pg);
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::WorkflowBuilder;

    fn ids(step: &Step) -> Vec<&str> {
        step.nodes.iter().map(String::as_str).collect()
    }

    #[test]
    fn test_linear_chain_one_node_per_step() {
        let graph = WorkflowBuilder::new()
            .add_shell("diff", "git diff")
            .add_agent("summary", "summarize ${1}")
            .add_shell("commit", "git commit -m \"${1}\"")
            .connect("diff", "summary")
            .connect("summary", "commit")
            .build();

        let plan = plan_graph(&graph).unwrap();
        assert_eq!(plan.steps.len(), 3);
        assert_eq!(ids(&plan.steps[0]), vec!["diff"]);
        assert_eq!(ids(&plan.steps[1]), vec!["summary"]);
        assert_eq!(ids(&plan.steps[2]), vec!["commit"]);
    }

    #[test]
    fn test_independent_nodes_share_a_step() {
        let graph = WorkflowBuilder::new()
            .add_text("a", "a")
            .add_text("b", "b")
            .add_preview("join")
            .add_text("solo", "x")
            .connect("a", "join")
            .connect("b", "join")
            .build();

        let plan = plan_graph(&graph).unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(ids(&plan.steps[0]), vec!["a", "b", "solo"]);
        assert_eq!(ids(&plan.steps[1]), vec!["join"]);
        assert_eq!(plan.step_label(0).unwrap(), "Parallel Step 1 (3)");
        assert_eq!(plan.step_label(1).unwrap(), "Step 2");
    }

    #[test]
    fn test_diamond_waits_for_all_ancestors() {
        let graph = WorkflowBuilder::new()
            .add_text("root", "r")
            .add_text("fast", "f")
            .add_text("slow1", "s")
            .add_text("slow2", "s")
            .add_preview("sink")
            .connect("root", "fast")
            .connect("root", "slow1")
            .connect("slow1", "slow2")
            .connect("fast", "sink")
            .connect("slow2", "sink")
            .build();

        let plan = plan_graph(&graph).unwrap();
        assert_eq!(plan.step_of("sink"), Some(3));
        assert_eq!(plan.step_of("fast"), plan.step_of("slow1"));
    }

    #[test]
    fn test_inactive_nodes_excluded() {
        let graph = WorkflowBuilder::new()
            .add_text("a", "a")
            .add_text("b", "b")
            .inactive()
            .add_text("c", "c")
            .connect("a", "b")
            .connect("b", "c")
            .build();

        let plan = plan_graph(&graph).unwrap();
        let planned: Vec<&NodeId> = plan.node_ids().collect();
        assert_eq!(planned, vec!["a"]);
        assert!(plan.inactive.contains("b"));
        assert!(plan.inactive.contains("c"));
    }

    #[test]
    fn test_loop_region_is_sequential() {
        let graph = WorkflowBuilder::new()
            .add_text("seed", "s")
            .add_text("side", "x")
            .add_loop_start("loop", 3, "i")
            .add_text("body1", "b1 ${i}")
            .add_text("body2", "b2")
            .add_loop_end("end")
            .add_preview("after")
            .connect("seed", "loop")
            .connect("loop", "body1")
            .connect("loop", "body2")
            .connect("body1", "end")
            .connect("body2", "end")
            .connect("end", "after")
            .connect("side", "after")
            .build();

        let plan = plan_graph(&graph).unwrap();
        assert_eq!(plan.loops.len(), 1);
        let region = &plan.loops[0];
        assert_eq!(region.start, "loop");
        assert_eq!(region.end, "end");
        assert_eq!(region.members, vec!["loop", "body1", "body2", "end"]);

        for index in region.steps.clone() {
            assert_eq!(plan.steps[index].mode, StepMode::Sequential);
            assert_eq!(plan.steps[index].nodes.len(), 1);
        }
        // Outside the loop, layering still applies.
        assert_eq!(ids(&plan.steps[0]), vec!["seed", "side"]);
        assert_eq!(plan.step_of("after"), Some(region.steps.end));
        assert!(plan.unsupported_parallel.contains("body1"));
        assert!(!plan.unsupported_parallel.contains("after"));
    }

    #[test]
    fn test_loop_back_edge_is_not_a_cycle() {
        let graph = WorkflowBuilder::new()
            .add_loop_start("loop", 2, "i")
            .add_text("body", "b")
            .add_loop_end("end")
            .connect("loop", "body")
            .connect("body", "end")
            .connect("end", "loop")
            .build();

        let plan = plan_graph(&graph).unwrap();
        assert_eq!(plan.steps.len(), 3);
        assert!(plan.loop_starting_at(0).is_some());
    }

    #[test]
    fn test_plain_cycle_rejected() {
        let graph = WorkflowBuilder::new()
            .add_text("a", "a")
            .add_text("b", "b")
            .connect("a", "b")
            .connect("b", "a")
            .build();

        let err = plan_graph(&graph).unwrap_err();
        assert!(matches!(err, ValidationError::CycleDetected { node_ids } if node_ids.len() == 2));
    }

    #[test]
    fn test_if_else_partitions() {
        let graph = WorkflowBuilder::new()
            .add_text("input", "yes")
            .add_if_else("check", "${1} == yes")
            .add_shell("on_true", "echo yes")
            .add_shell("then_more", "echo more")
            .add_shell("on_false", "echo no")
            .add_preview("merge")
            .connect("input", "check")
            .connect_from("check", "true", "on_true")
            .connect("on_true", "then_more")
            .connect_from("check", "false", "on_false")
            .connect("then_more", "merge")
            .connect("on_false", "merge")
            .build();

        let plan = plan_graph(&graph).unwrap();
        let branch = plan.branch("check").unwrap();
        assert!(branch.when_true.contains("on_true"));
        assert!(branch.when_true.contains("then_more"));
        assert!(branch.when_false.contains("on_false"));
        assert!(!branch.when_true.contains("merge"));
        assert!(!branch.when_false.contains("merge"));
        assert!(branch.skipped_for(true).contains("on_false"));
        assert_eq!(plan.branch_suffix("on_true"), Some("– True"));
        assert_eq!(plan.branch_suffix("on_false"), Some("– False"));
        assert_eq!(plan.branch_suffix("merge"), None);
    }

    #[test]
    fn test_plan_is_deterministic() {
        let graph = WorkflowBuilder::new()
            .add_text("a", "a")
            .add_text("b", "b")
            .add_text("c", "c")
            .add_preview("d")
            .connect("c", "d")
            .connect("a", "d")
            .connect("b", "d")
            .build();
        assert_eq!(plan_graph(&graph).unwrap(), plan_graph(&graph).unwrap());
    }
}
