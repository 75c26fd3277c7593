//! The points-to memory model (§4.3): which abstract memory locations an
//! expression may alias, and the resolver that widens away points-to
//! cycles so the fixpoint below always terminates.

use crate::access_path::PathElement;
use crate::interning::FieldId;
use crate::tree::{Element, Tree, TreeConfig, UpdateKind};
use petgraph::algo::kosaraju_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// An abstract memory cell: a parameter, the value produced by one
/// instruction, or a field projected off another location.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum MemoryLocation {
    Parameter(u32),
    Instruction(u32),
    Field(Arc<MemoryLocation>, FieldId),
    /// The unresolved "could be anything" location, used when a load
    /// escapes the locations this resolver tracks (e.g. a static field
    /// read with no modeled initializer).
    Root,
}

impl MemoryLocation {
    pub fn field(parent: MemoryLocation, name: FieldId) -> Self {
        MemoryLocation::Field(Arc::new(parent), name)
    }
}

/// Whether a [`PointsToSet`] should be collapsed to its root element the
/// moment it is read, rather than traversed field by field. Set once a
/// location is known to alias something whose shape can't be tracked
/// precisely (e.g. it points into a cycle that was widened away).
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct AliasingProperties {
    pub always_collapse: bool,
}

impl AliasingProperties {
    fn join(&self, other: &Self) -> Self {
        AliasingProperties { always_collapse: self.always_collapse || other.always_collapse }
    }
}

/// The set of locations one abstract memory cell may point to.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct PointsToSet {
    locations: HashSet<MemoryLocation>,
    properties: AliasingProperties,
}

impl PointsToSet {
    pub fn singleton(location: MemoryLocation) -> Self {
        PointsToSet { locations: HashSet::from([location]), properties: AliasingProperties::default() }
    }

    pub fn locations(&self) -> impl Iterator<Item = &MemoryLocation> {
        self.locations.iter()
    }

    pub fn always_collapse(&self) -> bool {
        self.properties.always_collapse
    }

    pub fn collapsed(&self) -> Self {
        PointsToSet { locations: self.locations.clone(), properties: AliasingProperties { always_collapse: true } }
    }
}

impl Element for PointsToSet {
    fn bottom() -> Self {
        PointsToSet::default()
    }

    fn is_bottom(&self) -> bool {
        self.locations.is_empty()
    }

    fn leq(&self, other: &Self) -> bool {
        self.locations.is_subset(&other.locations) && (!self.properties.always_collapse || other.properties.always_collapse)
    }

    fn join(&self, other: &Self) -> Self {
        PointsToSet {
            locations: self.locations.union(&other.locations).cloned().collect(),
            properties: self.properties.join(&other.properties),
        }
    }
}

/// [`TreeConfig`] for points-to trees: a cycle that would otherwise grow
/// the tree without bound is widened by collapsing it to an
/// always-collapsed singleton (§4.3).
pub struct PointsToConfig;

impl TreeConfig for PointsToConfig {
    type Element = PointsToSet;

    fn max_tree_height_after_widening() -> usize {
        crate::config::active_heuristics().max_tree_height_after_widening
    }

    fn transform_on_widening_collapse(element: Self::Element) -> Self::Element {
        element.collapsed()
    }
}

pub type PointsToTree = Tree<PointsToConfig>;

/// The per-method points-to state: every tracked location's current
/// points-to tree.
#[derive(Clone, Default)]
pub struct PointsToEnvironment {
    trees: HashMap<MemoryLocation, PointsToTree>,
}

impl PointsToEnvironment {
    pub fn new() -> Self {
        PointsToEnvironment::default()
    }

    pub fn get(&self, location: &MemoryLocation) -> PointsToTree {
        self.trees.get(location).cloned().unwrap_or_else(PointsToTree::bottom)
    }

    pub fn write(&mut self, location: MemoryLocation, path: &[PathElement], value: PointsToTree, kind: UpdateKind) {
        let current = self.get(&location);
        let path = crate::access_path::Path::of(path.to_vec());
        let updated = current.write(&path, value, kind);
        self.trees.insert(location, updated);
    }

    pub fn locations(&self) -> impl Iterator<Item = &MemoryLocation> {
        self.trees.keys()
    }
}

/// Resolves every location's points-to tree to a fixpoint, widening away
/// reference cycles instead of iterating them to a (possibly unbounded)
/// fixpoint directly.
///
/// Mariana Trench orders the points-to graph with a Bourdoncle weak
/// topological ordering; `petgraph`'s `kosaraju_scc` gives the same
/// guarantee (every cycle collapsed into one component, components in
/// reverse-dependency order) without hand-rolling a WTO.
pub struct WideningPointsToResolver {
    resolved: HashMap<MemoryLocation, PointsToTree>,
}

impl WideningPointsToResolver {
    pub fn resolve(environment: &PointsToEnvironment) -> Self {
        let mut graph: DiGraph<MemoryLocation, ()> = DiGraph::new();
        let mut index_of: HashMap<MemoryLocation, NodeIndex> = HashMap::new();
        for location in environment.locations() {
            let idx = graph.add_node(location.clone());
            index_of.insert(location.clone(), idx);
        }
        for location in environment.locations() {
            let tree = environment.get(location);
            for pointee in collect_pointees(&tree) {
                let from = *index_of.entry(location.clone()).or_insert_with(|| graph.add_node(location.clone()));
                let to = *index_of.entry(pointee.clone()).or_insert_with(|| graph.add_node(pointee.clone()));
                graph.add_edge(from, to, ());
            }
        }

        let sccs = kosaraju_scc(&graph);
        let mut resolved: HashMap<MemoryLocation, PointsToTree> = HashMap::new();

        // `kosaraju_scc` returns components in reverse topological order
        // (sinks first), which is exactly the order we need to resolve a
        // location's pointees before the location itself.
        for component in sccs {
            if component.len() == 1 {
                let idx = component[0];
                let location = graph[idx].clone();
                let tree = environment.get(&location);
                resolved.insert(location, substitute_pointees(&tree, &resolved));
                continue;
            }
            // A genuine cycle: join every member's tree and widen it to a
            // bounded height so the resolved value doesn't encode the
            // cycle's unrolling.
            let mut merged = PointsToTree::bottom();
            for &idx in &component {
                let location = graph[idx].clone();
                let tree = environment.get(&location);
                merged = merged.widen_with(&substitute_pointees(&tree, &resolved));
            }
            for &idx in &component {
                resolved.insert(graph[idx].clone(), merged.clone());
            }
        }

        WideningPointsToResolver { resolved }
    }

    pub fn resolved(&self, location: &MemoryLocation) -> PointsToTree {
        self.resolved.get(location).cloned().unwrap_or_else(PointsToTree::bottom)
    }
}

fn collect_pointees(tree: &PointsToTree) -> Vec<MemoryLocation> {
    tree.root_element().locations().cloned().collect()
}

/// A location's resolved tree should reflect what its pointees resolve
/// to, not the raw unresolved pointee set; since we don't have a cheap
/// tree-map here we simply re-join in the already-resolved pointee
/// trees on top of the original element.
fn substitute_pointees(tree: &PointsToTree, resolved: &HashMap<MemoryLocation, PointsToTree>) -> PointsToTree {
    let mut result = tree.clone();
    for pointee in collect_pointees(tree) {
        if let Some(pointee_tree) = resolved.get(&pointee) {
            result = result.join(pointee_tree);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn points_to_join_unions_locations() {
        let a = PointsToSet::singleton(MemoryLocation::Parameter(0));
        let b = PointsToSet::singleton(MemoryLocation::Parameter(1));
        let joined = a.join(&b);
        assert_eq!(joined.locations().count(), 2);
    }

    #[test]
    fn resolver_terminates_on_a_self_cycle() {
        let mut env = PointsToEnvironment::new();
        let a = MemoryLocation::Instruction(0);
        env.write(a.clone(), &[], PointsToTree::leaf(PointsToSet::singleton(a.clone())), UpdateKind::Strong);

        let resolver = WideningPointsToResolver::resolve(&env);
        let resolved = resolver.resolved(&a);
        assert!(!resolved.is_bottom());
    }

    #[test]
    fn resolver_handles_a_simple_chain() {
        let mut env = PointsToEnvironment::new();
        let a = MemoryLocation::Instruction(0);
        let b = MemoryLocation::Instruction(1);
        env.write(a.clone(), &[], PointsToTree::leaf(PointsToSet::singleton(b.clone())), UpdateKind::Strong);
        env.write(b.clone(), &[], PointsToTree::leaf(PointsToSet::singleton(MemoryLocation::Parameter(0))), UpdateKind::Strong);

        let resolver = WideningPointsToResolver::resolve(&env);
        let resolved_a = resolver.resolved(&a);
        assert!(resolved_a.root_element().locations().any(|l| *l == MemoryLocation::Parameter(0)));
    }
}
