//! The interprocedural fixpoint (§4.6): per-instruction forward and
//! backward transfer functions over a method's [`ControlFlowGraph`], driven
//! to a whole-program fixpoint by a `rayon`-parallel worker pool reading and
//! writing a `dashmap`-backed [`ModelRegistry`]. The scheduler runs one
//! dirty-method batch per sweep through a `rayon` parallel iterator and
//! folds the results back into the shared registry, the same shape a
//! parallel file-scan pipeline uses for a batch of independent units of
//! work.

use crate::access_path::{AccessPath, Root};
use crate::callgraph::CallGraph;
use crate::config::Configuration;
use crate::frame::{ClassIntervalContext, Frame, FeatureSet, OutputPaths};
use crate::interfaces::{ControlFlowGraph, ModelRegistry, Opcode, ProgramView};
use crate::interning::{FeatureId, FieldId, MethodId, PositionId};
use crate::issue::Issue;
use crate::kind::{Kind, PropagationKind};
use crate::memory::MemoryLocation;
use crate::model::{CalleeModel, ModeBits, Model};
use crate::rules::{RuleCode, Rules};
use crate::statistics::Statistics;
use crate::taint::Taint;
use crate::tree::{Tree, TreeConfig, UpdateKind};
use dashmap::DashMap;
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};

/// [`TreeConfig`] for per-register taint trees: widening height comes from
/// the active [`crate::config::Heuristics`] (same publish-once mechanism
/// [`crate::memory::PointsToConfig`] uses), and a widening collapse tags
/// the folded taint with a feature recording the loss of precision.
pub struct TaintTreeConfig;

impl TreeConfig for TaintTreeConfig {
    type Element = Taint;

    fn max_tree_height_after_widening() -> usize {
        crate::config::active_heuristics().max_tree_height_after_widening
    }

    fn transform_on_widening_collapse(element: Taint) -> Taint {
        let feature = FeatureSet::always([FeatureId::intern("via-tree-widen")]);
        element.transform_kind(|k| vec![k.clone()], &feature)
    }
}

pub type TaintTree = Tree<TaintTreeConfig>;

/// Adds a feature (or any other root-level rewrite) to a tree's root
/// element without disturbing its children, which the public [`Tree`] API
/// has no direct way to map over; a `Weak` self-join at the empty path
/// folds the rewritten root back in alongside whatever was already there.
fn attach_to_root(tree: &TaintTree, f: impl Fn(&Taint) -> Taint) -> TaintTree {
    let new_root = f(tree.root_element());
    tree.join(&TaintTree::leaf(new_root))
}

fn limit(tree: TaintTree, config: &Configuration) -> TaintTree {
    tree.limit_leaves(config.heuristics.max_tree_leaves)
}

/// One method's dense register file, each slot a full taint tree so a
/// register can carry field-sensitive taint on whatever it refers to (§4.1,
/// §4.6).
#[derive(Clone, Default)]
struct RegisterEnvironment {
    registers: HashMap<u32, TaintTree>,
}

impl RegisterEnvironment {
    fn get(&self, register: u32) -> TaintTree {
        self.registers.get(&register).cloned().unwrap_or_else(TaintTree::bottom)
    }

    fn set(&mut self, register: u32, value: TaintTree) {
        self.registers.insert(register, value);
    }

    fn join(&self, other: &Self) -> Self {
        let mut registers = self.registers.clone();
        for (register, tree) in &other.registers {
            registers
                .entry(*register)
                .and_modify(|existing| *existing = existing.join(tree))
                .or_insert_with(|| tree.clone());
        }
        RegisterEnvironment { registers }
    }

    fn leq(&self, other: &Self) -> bool {
        self.registers
            .keys()
            .chain(other.registers.keys())
            .all(|&register| self.get(register).leq(&other.get(register)))
    }
}

/// Tracks, per multi-source rule, which partial labels have already been
/// satisfied somewhere in the method currently being analyzed (§8 scenario
/// 2 "partial-kind multi-source rule"). Scoped to one method's analysis
/// rather than threaded across the whole call stack — a method-local
/// approximation of Mariana Trench's `FulfilledPartialKindState`, adequate
/// for the common case of a single call site gathering every partial sink.
#[derive(Clone, Default)]
struct FulfilledPartialKindState {
    fulfilled: HashMap<RuleCode, HashMap<String, Taint>>,
}

impl FulfilledPartialKindState {
    fn fulfill(&mut self, rule: RuleCode, label: String, source_taint: Taint) {
        self.fulfilled.entry(rule).or_default().insert(label, source_taint);
    }

    fn is_triggered(&self, rule: RuleCode, labels: &[String]) -> bool {
        !labels.is_empty()
            && self
                .fulfilled
                .get(&rule)
                .is_some_and(|byl| labels.iter().all(|l| byl.contains_key(l)))
    }

    fn combined_source_taint(&self, rule: RuleCode) -> Taint {
        self.fulfilled
            .get(&rule)
            .map(|byl| byl.values().fold(Taint::bottom(), |acc, t| acc.join(t)))
            .unwrap_or_else(Taint::bottom)
    }
}

/// Per-method mutable state threaded through one sweep of instruction
/// processing (§4.6). `heap` holds field-sensitive taint keyed by the
/// abstract memory location it was written through. Object identity for a
/// register comes from `register_locations` rather than from
/// `memory.rs`'s full points-to graph: that graph's widening resolver
/// earns its keep once two registers can alias the same heap cell through
/// branch-merged control flow, but this straight-line per-instruction
/// tracking only ever needs "what did this register last refer to",
/// which a plain map already gives us.
#[derive(Default)]
struct MethodState {
    registers: RegisterEnvironment,
    register_locations: HashMap<u32, MemoryLocation>,
    heap: HashMap<MemoryLocation, TaintTree>,
    /// Holds whatever an `Invoke` routed to `Root::Return` until the
    /// matching `MoveResult` consumes it — the two-instruction Dex idiom
    /// (`invoke-virtual ...; move-result v0`).
    pending_result: TaintTree,
    partial: FulfilledPartialKindState,
}

impl MethodState {
    fn heap_get(&self, location: &MemoryLocation) -> TaintTree {
        self.heap.get(location).cloned().unwrap_or_else(TaintTree::bottom)
    }

    fn location_of(&self, register: u32) -> MemoryLocation {
        self.register_locations.get(&register).cloned().unwrap_or(MemoryLocation::Root)
    }
}

const ARRAY_CELL: &str = "[]";

fn instruction_position(method: MethodId, instruction: u32) -> PositionId {
    PositionId::intern(&format!("{}@{}", method.name(), instruction))
}

fn resolve_register(port: &AccessPath, arguments: &[u32]) -> Option<u32> {
    match port.root {
        Root::Argument(i) => arguments.get(i as usize).copied(),
        _ => None,
    }
}

/// Emits an [`Issue`] for every rule whose source/sink kinds are present in
/// `source_taint`/`sink_taint`, and advances `partial` for any partial-kind
/// rule `sink_taint` realizes, emitting a combined issue the moment every
/// sibling label has been seen (§8 scenario 2).
#[allow(clippy::too_many_arguments)]
fn check_flows(
    model: &mut Model,
    rules: &Rules,
    source_taint: &Taint,
    sink_taint: &Taint,
    callee: Option<MethodId>,
    sink_index: usize,
    position: PositionId,
    partial: &mut FulfilledPartialKindState,
) {
    if source_taint.is_bottom() || sink_taint.is_bottom() {
        return;
    }
    for sink_kind in sink_taint.kinds() {
        if !sink_kind.is_sink() {
            continue;
        }
        for source_kind in source_taint.kinds() {
            if !source_kind.is_source() {
                continue;
            }
            for rule in rules.matching(source_kind, sink_kind) {
                model.add_issue(Issue::new(rule, source_taint.clone(), sink_taint.clone(), callee, sink_index, Some(position)));
            }
        }
        if let Some(name) = crate::rules::kind_name(sink_kind) {
            for (rule, label) in rules.partial_rules_for_sink(&name) {
                partial.fulfill(rule, label, source_taint.clone());
                let labels = rules.partial_labels(rule);
                if partial.is_triggered(rule, &labels) {
                    model.add_issue(Issue::new(
                        rule,
                        partial.combined_source_taint(rule),
                        sink_taint.clone(),
                        callee,
                        sink_index,
                        Some(position),
                    ));
                }
            }
        }
    }
}

/// Ports sorted into a stable order so repeated analyses of the same
/// method hand out the same `sink_index` to the same logical sink (§4.6:
/// `Issue::sink_index` only needs to be stable within one callee/position,
/// not globally meaningful).
fn sorted_ports(map: &HashMap<AccessPath, Taint>) -> Vec<(&AccessPath, &Taint)> {
    let mut entries: Vec<_> = map.iter().collect();
    entries.sort_by_key(|(port, _)| format!("{port:?}"));
    entries
}

/// Applies one resolved callee's (or a synthesized obscure stand-in's)
/// effects at one callsite: feature side effects, sink checks, declared
/// propagations, inferred generations, and `TaintInTaintOut`/`TaintInTaintThis`
/// defaults (§4.4, §4.6).
#[allow(clippy::too_many_arguments)]
fn apply_callee_effects(
    state: &mut MethodState,
    model: &mut Model,
    rules: &Rules,
    config: &Configuration,
    stats: &Statistics,
    caller: MethodId,
    callee: Option<MethodId>,
    position: PositionId,
    arguments: &[u32],
    result_register: Option<u32>,
    callee_model: &CalleeModel,
    force_weak: bool,
) {
    let update_kind = if force_weak || !callee_model.mode.contains(ModeBits::STRONG_WRITE_ON_PROPAGATION) {
        UpdateKind::Weak
    } else {
        UpdateKind::Strong
    };

    // Feature side effects on the caller's argument registers.
    for (i, &reg) in arguments.iter().enumerate() {
        let port = AccessPath::of_root(Root::Argument(i as u32));
        let mut features: Vec<FeatureId> = callee_model
            .add_features_to_arguments
            .get(&port)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        if callee_model.mode.contains(ModeBits::ADD_VIA_OBSCURE_FEATURE) {
            features.push(FeatureId::intern("via-obscure"));
        }
        if !features.is_empty() {
            let feature_set = FeatureSet::always(features);
            let existing = state.registers.get(reg);
            let updated = attach_to_root(&existing, |t| t.transform_kind(|k| vec![k.clone()], &feature_set));
            state.registers.set(reg, limit(updated, config));
        }
    }

    // Sink checks: every declared sink port the callee is known to carry.
    for (index, (port, sink_taint)) in sorted_ports(&callee_model.sinks).into_iter().enumerate() {
        let Some(reg) = resolve_register(port, arguments) else { continue };
        let source_taint = state.registers.get(reg).read(&port.path).root_element().clone();
        check_flows(model, rules, &source_taint, sink_taint, callee, index, position, &mut state.partial);
    }

    // Declared propagations: input port -> (output port, collapse depth).
    for (port, taint) in &callee_model.propagations {
        let Some(input_reg) = resolve_register(port, arguments) else { continue };
        let input_subtree = state.registers.get(input_reg).read(&port.path);
        for kind in taint.kinds() {
            let Some(frames) = taint.kind_frames(kind) else { continue };
            for frame in frames.frames() {
                for (output_port, collapse_depth) in frame.output_paths.entries() {
                    let mut written = match collapse_depth {
                        Some(depth) => input_subtree.collapse_deeper_than(*depth as usize),
                        None => input_subtree.clone(),
                    };
                    written = attach_to_root(&written, |t| {
                        t.attach_position(position, &frame.user_features).transform_kind(
                            |k| vec![k.clone()],
                            &frame.inferred_features,
                        )
                    });
                    write_port(state, output_port, arguments, result_register, written, update_kind, config);
                }
            }
        }
    }

    // Inferred generations: new sources the callee introduces at a port,
    // lifted one hop into the caller's frame of reference (§4.6).
    for (port, taint) in &callee_model.generations {
        let callee_for_distance = callee.unwrap_or(caller);
        let propagated = taint.propagate(
            callee_for_distance,
            position,
            port.clone(),
            FeatureSet::default(),
            config.heuristics.max_source_sink_distance,
            ClassIntervalContext::unbounded(),
        );
        if propagated.is_bottom() {
            continue;
        }
        write_port(state, port, arguments, result_register, TaintTree::leaf(propagated), UpdateKind::Weak, config);
    }

    if callee_model.mode.contains(ModeBits::TAINT_IN_TAINT_OUT) {
        let mut combined = TaintTree::bottom();
        for &reg in arguments {
            combined = combined.join(&state.registers.get(reg));
        }
        let combined = attach_to_root(&combined, |t| t.update_non_leaf_positions(position));
        write_return(state, result_register, combined, UpdateKind::Weak, config);
    }
    if callee_model.mode.contains(ModeBits::TAINT_IN_TAINT_THIS) {
        if let Some(&this_reg) = arguments.first() {
            let mut combined = TaintTree::bottom();
            for &reg in arguments.iter().skip(1) {
                combined = combined.join(&state.registers.get(reg));
            }
            let existing = state.registers.get(this_reg);
            state.registers.set(this_reg, limit(existing.join(&combined), config));
        }
    }
    if callee_model.mode.contains(ModeBits::OBSCURE) {
        stats.record_resolution_miss();
    }
}

fn write_return(state: &mut MethodState, result_register: Option<u32>, value: TaintTree, kind: UpdateKind, config: &Configuration) {
    state.pending_result = match kind {
        UpdateKind::Strong => value.clone(),
        UpdateKind::Weak => state.pending_result.join(&value),
    };
    if let Some(reg) = result_register {
        let existing = state.registers.get(reg);
        let updated = match kind {
            UpdateKind::Strong => value,
            UpdateKind::Weak => existing.join(&value),
        };
        state.registers.set(reg, limit(updated, config));
    }
}

fn write_port(
    state: &mut MethodState,
    port: &AccessPath,
    arguments: &[u32],
    result_register: Option<u32>,
    value: TaintTree,
    kind: UpdateKind,
    config: &Configuration,
) {
    match port.root {
        Root::Return => write_return(state, result_register, value, kind, config),
        Root::Argument(i) => {
            if let Some(&reg) = arguments.get(i as usize) {
                let existing = state.registers.get(reg);
                let updated = existing.write(&port.path, value, kind);
                state.registers.set(reg, limit(updated, config));
            }
        }
        _ => {}
    }
}

/// An obscure method's stand-in model (§4.4: "missing code yields no-op
/// methods" unless a template or heuristic says otherwise — here a missing
/// body is treated conservatively as taint-in-taint-out rather than a
/// no-op, so unresolved calls don't silently sanitize taint).
fn obscure_callee_model() -> CalleeModel {
    CalleeModel {
        mode: ModeBits::OBSCURE | ModeBits::TAINT_IN_TAINT_OUT | ModeBits::ADD_VIA_OBSCURE_FEATURE,
        ..CalleeModel::default()
    }
}

#[allow(clippy::too_many_arguments)]
fn forward_invoke(
    state: &mut MethodState,
    model: &mut Model,
    rules: &Rules,
    config: &Configuration,
    stats: &Statistics,
    registry: &dyn ModelRegistry,
    callgraph: &CallGraph,
    caller: MethodId,
    instruction_id: u32,
    callee: MethodId,
    arguments: &[u32],
    result_register: Option<u32>,
) {
    let position = instruction_position(caller, instruction_id);
    let target = callgraph.callee(caller, instruction_id);
    let resolved: Vec<MethodId> = target.map(|t| t.resolved_callees().collect()).unwrap_or_default();
    let obscure = target.map(|t| t.obscure).unwrap_or(true);

    if obscure || resolved.is_empty() {
        stats.record_resolution_miss();
        let synthetic = obscure_callee_model();
        apply_callee_effects(state, model, rules, config, stats, caller, Some(callee), position, arguments, result_register, &synthetic, false);
    } else {
        let force_weak = resolved.len() > 1;
        for callee_id in &resolved {
            let callee_model = registry.get(*callee_id).as_callee_model();
            apply_callee_effects(state, model, rules, config, stats, caller, Some(*callee_id), position, arguments, result_register, &callee_model, force_weak);
        }
    }

    for artificial in callgraph.artificial_callees(caller, instruction_id) {
        let callee_model = registry.get(artificial.callee).as_callee_model();
        let mapped_args: Vec<u32> = (0..=artificial.parameter_registers.keys().copied().max().unwrap_or(0))
            .map(|i| *artificial.parameter_registers.get(&i).unwrap_or(&u32::MAX))
            .collect();
        if !artificial.features.is_empty() {
            let feature_set = FeatureSet::always(artificial.features.iter().copied());
            for &reg in mapped_args.iter().filter(|&&r| r != u32::MAX) {
                let existing = state.registers.get(reg);
                let updated = attach_to_root(&existing, |t| t.transform_kind(|k| vec![k.clone()], &feature_set));
                state.registers.set(reg, limit(updated, config));
            }
        }
        apply_callee_effects(state, model, rules, config, stats, caller, Some(artificial.callee), position, &mapped_args, None, &callee_model, true);
    }
}

/// Splits a returned value's taint into inferred generations and inferred
/// propagations (§4.6 step 8, `Transfer.cpp`'s `infer_output_taint`): a
/// real source becomes a generation at `output_port`; an artificial source
/// minted at `LoadParam` whose own port differs from `output_port` becomes
/// a propagation from that parameter's port to `output_port` instead — the
/// artificial kind itself never surfaces in the model.
fn infer_output_taint(model: &mut Model, output_port: AccessPath, taint: &Taint) {
    let mut generation = Taint::bottom();
    for kind in taint.kinds() {
        let Some(frames) = taint.kind_frames(kind) else { continue };
        if kind.is_artificial_source() {
            for frame in frames.frames() {
                if frame.callee_port.root == output_port.root {
                    continue;
                }
                let propagation_kind = Kind::propagation(PropagationKind::LocalReturn);
                let propagation_frame = Frame::propagation(
                    propagation_kind.clone(),
                    frame.callee_port.clone(),
                    OutputPaths::single(output_port.clone(), None),
                );
                model.add_inferred_propagation(frame.callee_port.clone(), Taint::leaf(propagation_kind, propagation_frame));
            }
        } else {
            for frame in frames.frames() {
                generation.add(kind.clone(), frame.clone());
            }
        }
    }
    if !generation.is_bottom() {
        model.add_inferred_generation(output_port, generation);
    }
}

/// The forward transfer function for one instruction (§4.6): advances
/// source taint, checks it against every reachable sink, records
/// `Model::generations` when the method's own return becomes newly
/// tainted.
#[allow(clippy::too_many_arguments)]
fn forward_transfer(
    state: &mut MethodState,
    model: &mut Model,
    rules: &Rules,
    config: &Configuration,
    stats: &Statistics,
    registry: &dyn ModelRegistry,
    callgraph: &CallGraph,
    method: MethodId,
    instruction: &crate::interfaces::Instruction,
) {
    match &instruction.op {
        Opcode::LoadParam { register, parameter } => {
            state.register_locations.insert(*register, MemoryLocation::Parameter(*parameter));
            let port = AccessPath::of_root(Root::Argument(*parameter));
            let mut taint = match model.parameter_sources().get(&port) {
                Some(declared) => TaintTree::leaf(declared.clone()),
                None => TaintTree::bottom(),
            };
            // Seed an artificial source naming this parameter's own port,
            // so infer_output_taint can recover at `return` which
            // parameters the returned value derived from (§4.6 step 1).
            let artificial = Taint::leaf(Kind::artificial_source(), Frame::artificial_source(port));
            taint = taint.join(&TaintTree::leaf(artificial));
            state.registers.set(*register, taint);
        }
        Opcode::Move { dest, src } => {
            state.registers.set(*dest, state.registers.get(*src));
            state.register_locations.insert(*dest, state.location_of(*src));
        }
        Opcode::MoveResult { dest } => {
            state.registers.set(*dest, state.pending_result.clone());
            state.register_locations.insert(*dest, MemoryLocation::Instruction(instruction.id));
        }
        Opcode::CheckCast { dest, src, target_type } => {
            let tree = state.registers.get(*src);
            let via_cast = config.via_cast.emit_all_via_cast_features
                || config.via_cast.allow_via_cast_features.iter().any(|t| t == target_type);
            let tree = if via_cast {
                let feature = FeatureSet::always([FeatureId::intern("via-cast")]);
                attach_to_root(&tree, |t| t.transform_kind(|k| vec![k.clone()], &feature))
            } else {
                tree
            };
            state.registers.set(*dest, limit(tree, config));
            state.register_locations.insert(*dest, state.location_of(*src));
        }
        Opcode::IGet { dest, receiver, field } => {
            let field_loc = MemoryLocation::field(state.location_of(*receiver), *field);
            state.registers.set(*dest, state.heap_get(&field_loc));
            state.register_locations.insert(*dest, field_loc);
        }
        Opcode::SGet { dest, field } => {
            let field_loc = MemoryLocation::field(MemoryLocation::Root, *field);
            state.registers.set(*dest, state.heap_get(&field_loc));
            state.register_locations.insert(*dest, field_loc);
        }
        Opcode::IPut { src, receiver, field } => {
            let receiver_loc = state.location_of(*receiver);
            let field_loc = MemoryLocation::field(receiver_loc.clone(), *field);
            let value = state.registers.get(*src);
            let existing = state.heap_get(&field_loc);
            let updated = if receiver_loc == MemoryLocation::Root { existing.join(&value) } else { value };
            state.heap.insert(field_loc, limit(updated, config));
        }
        Opcode::SPut { src, field } => {
            let field_loc = MemoryLocation::field(MemoryLocation::Root, *field);
            let value = state.registers.get(*src);
            let existing = state.heap_get(&field_loc);
            state.heap.insert(field_loc, limit(existing.join(&value), config));
        }
        Opcode::NewArray { dest, .. } => {
            state.registers.set(*dest, TaintTree::bottom());
            state.register_locations.insert(*dest, MemoryLocation::Instruction(instruction.id));
        }
        Opcode::FilledNewArray { dest, elements } => {
            let location = MemoryLocation::Instruction(instruction.id);
            let cell = MemoryLocation::field(location.clone(), FieldId::intern(ARRAY_CELL));
            let feature = FeatureSet::always([FeatureId::intern("via-array")]);
            let mut combined = state.heap_get(&cell);
            for &reg in elements {
                let value = attach_to_root(&state.registers.get(reg), |t| t.transform_kind(|k| vec![k.clone()], &feature));
                combined = combined.join(&value);
            }
            state.heap.insert(cell.clone(), limit(combined.clone(), config));

            let position = instruction_position(method, instruction.id);
            let effect_port = AccessPath::of_root(Root::CallEffect(crate::access_path::CallEffectKind::ArrayAllocation));
            if let Some(sink_taint) = model.sinks().get(&effect_port).cloned() {
                check_flows(model, rules, combined.root_element(), &sink_taint, None, 0, position, &mut state.partial);
            }
            state.registers.set(*dest, TaintTree::bottom());
            state.register_locations.insert(*dest, location);
        }
        Opcode::AGet { dest, array, .. } => {
            let cell = MemoryLocation::field(state.location_of(*array), FieldId::intern(ARRAY_CELL));
            state.registers.set(*dest, state.heap_get(&cell));
            state.register_locations.insert(*dest, cell);
        }
        Opcode::APut { src, array, .. } => {
            let cell = MemoryLocation::field(state.location_of(*array), FieldId::intern(ARRAY_CELL));
            let feature = FeatureSet::always([FeatureId::intern("via-array")]);
            let value = attach_to_root(&state.registers.get(*src), |t| t.transform_kind(|k| vec![k.clone()], &feature));
            let existing = state.heap_get(&cell);
            state.heap.insert(cell, limit(existing.join(&value), config));
        }
        Opcode::Invoke { callee, arguments, result_register, .. } => {
            forward_invoke(state, model, rules, config, stats, registry, callgraph, method, instruction.id, *callee, arguments, *result_register);
        }
        Opcode::Return { register } => {
            if let Some(reg) = register {
                let value = state.registers.get(*reg);
                let output_port = AccessPath::of_root(Root::Return);
                infer_output_taint(model, output_port.clone(), value.root_element());
                if let Some(sink_taint) = model.sinks().get(&output_port).cloned() {
                    let position = instruction_position(method, instruction.id);
                    check_flows(model, rules, value.root_element(), &sink_taint, None, 0, position, &mut state.partial);
                }
            }
        }
        Opcode::Nop => {}
    }
}

/// The backward transfer function (§4.6 "mirrors the forward pass, but
/// sinks replace sources"): propagates a callee's declared sinks back
/// through an `Invoke` onto the caller's argument registers, so that at
/// `LoadParam` we can record which of this method's own parameters should
/// be inferred as sinks for ITS callers to see.
fn backward_transfer(
    regs: &mut RegisterEnvironment,
    instruction: &crate::interfaces::Instruction,
    method: MethodId,
    callgraph: &CallGraph,
    registry: &dyn ModelRegistry,
    config: &Configuration,
    model: &mut Model,
) {
    match &instruction.op {
        Opcode::Invoke { callee, arguments, .. } => {
            let position = instruction_position(method, instruction.id);
            let target = callgraph.callee(method, instruction.id);
            let resolved: Vec<MethodId> = target.map(|t| t.resolved_callees().collect()).unwrap_or_default();
            let candidates: Vec<MethodId> = if resolved.is_empty() { vec![*callee] } else { resolved };
            for callee_id in candidates {
                let sinks = registry.get(callee_id).sinks().clone();
                for (port, sink_taint) in sinks {
                    let Root::Argument(i) = port.root else { continue };
                    let Some(&reg) = arguments.get(i as usize) else { continue };
                    let propagated = sink_taint.propagate(
                        callee_id,
                        position,
                        port.clone(),
                        FeatureSet::default(),
                        config.heuristics.max_source_sink_distance,
                        ClassIntervalContext::unbounded(),
                    );
                    if propagated.is_bottom() {
                        continue;
                    }
                    let existing = regs.get(reg);
                    regs.set(reg, limit(existing.join(&TaintTree::leaf(propagated)), config));
                }
            }
        }
        Opcode::Move { dest, src } => {
            let carried = regs.get(*dest);
            let existing = regs.get(*src);
            regs.set(*src, existing.join(&carried));
        }
        Opcode::MoveResult { dest } => {
            // A move-result's backward demand doesn't flow anywhere further
            // back within this simplified model; nothing to propagate.
            let _ = dest;
        }
        Opcode::IGet { dest, receiver, .. } => {
            let carried = regs.get(*dest);
            let existing = regs.get(*receiver);
            regs.set(*receiver, existing.join(&carried));
        }
        Opcode::IPut { src, receiver, .. } => {
            let carried = regs.get(*receiver);
            let existing = regs.get(*src);
            regs.set(*src, existing.join(&carried));
        }
        Opcode::AGet { dest, array, .. } => {
            let carried = regs.get(*dest);
            let existing = regs.get(*array);
            regs.set(*array, existing.join(&carried));
        }
        Opcode::APut { src, array, .. } => {
            let carried = regs.get(*array);
            let existing = regs.get(*src);
            regs.set(*src, existing.join(&carried));
        }
        Opcode::LoadParam { register, parameter } => {
            let taint = regs.get(*register).root_element().clone();
            if !taint.is_bottom() {
                model.add_inferred_sink(AccessPath::of_root(Root::Argument(*parameter)), taint);
            }
        }
        Opcode::CheckCast { .. } | Opcode::SGet { .. } | Opcode::SPut { .. } | Opcode::NewArray { .. } | Opcode::FilledNewArray { .. } | Opcode::Return { .. } | Opcode::Nop => {}
    }
}

fn analyze_forward(
    method: MethodId,
    cfg: &ControlFlowGraph,
    registry: &dyn ModelRegistry,
    callgraph: &CallGraph,
    rules: &Rules,
    config: &Configuration,
    stats: &Statistics,
    model: &mut Model,
) -> MethodState {
    let order = cfg.reverse_postorder();
    let mut state = MethodState::default();
    let mut block_exit: HashMap<usize, RegisterEnvironment> = HashMap::new();

    for _ in 0..config.heuristics.max_global_analysis_iteration {
        let mut changed = false;
        for &block in &order {
            let mut incoming = RegisterEnvironment::default();
            let mut has_pred = false;
            for pred in cfg.predecessors(block) {
                if let Some(exit) = block_exit.get(&pred) {
                    incoming = incoming.join(exit);
                    has_pred = true;
                }
            }
            if !has_pred && block == cfg.entry {
                incoming = RegisterEnvironment::default();
            }
            state.registers = incoming;
            for instruction in &cfg.blocks[block].instructions {
                forward_transfer(&mut state, model, rules, config, stats, registry, callgraph, method, instruction);
            }
            let exit = state.registers.clone();
            let stable = block_exit.get(&block).is_some_and(|prev| exit.leq(prev) && prev.leq(&exit));
            if !stable {
                changed = true;
            }
            block_exit.insert(block, exit);
        }
        if !changed {
            break;
        }
    }
    state
}

fn analyze_backward(
    method: MethodId,
    cfg: &ControlFlowGraph,
    registry: &dyn ModelRegistry,
    callgraph: &CallGraph,
    config: &Configuration,
    model: &mut Model,
) {
    let mut order = cfg.reverse_postorder();
    order.reverse();
    let mut block_in: HashMap<usize, RegisterEnvironment> = HashMap::new();

    for _ in 0..config.heuristics.max_global_analysis_iteration {
        let mut changed = false;
        for &block in &order {
            let mut incoming = RegisterEnvironment::default();
            for succ in cfg.successors(block) {
                if let Some(s) = block_in.get(&succ) {
                    incoming = incoming.join(s);
                }
            }
            let mut regs = incoming;
            for instruction in cfg.blocks[block].instructions.iter().rev() {
                backward_transfer(&mut regs, instruction, method, callgraph, registry, config, model);
            }
            let stable = block_in.get(&block).is_some_and(|prev| regs.leq(prev) && prev.leq(&regs));
            if !stable {
                changed = true;
            }
            block_in.insert(block, regs);
        }
        if !changed {
            break;
        }
    }
}

/// The `dashmap`-backed [`ModelRegistry`] the fixpoint uses by default
/// (§4.6, §6): a shared `DashMap` that every worker in the `rayon`
/// parallel iterator reads and writes directly, with no separate
/// merge step once a sweep's batch finishes.
#[derive(Default)]
pub struct DefaultModelRegistry {
    models: DashMap<MethodId, Model>,
}

impl DefaultModelRegistry {
    pub fn new() -> Self {
        DefaultModelRegistry::default()
    }

    /// Installs a user-supplied template model before the fixpoint starts
    /// (e.g. a declared source/sink/propagation set from a model
    /// generator's JSON template).
    pub fn seed(&self, method: MethodId, model: Model) {
        self.models.insert(method, model);
    }

    pub fn into_models(self) -> HashMap<MethodId, Model> {
        self.models.into_iter().collect()
    }
}

impl ModelRegistry for DefaultModelRegistry {
    fn get(&self, method: MethodId) -> Model {
        self.models.get(&method).map(|entry| entry.value().clone()).unwrap_or_else(|| Model::new(method))
    }

    fn join_with(&self, method: MethodId, updates: Model) -> bool {
        let mut entry = self.models.entry(method).or_insert_with(|| Model::new(method));
        let mut changed = entry.join_inferred(&updates);
        for issue in updates.issues() {
            entry.add_issue(issue.clone());
        }
        if !updates.issues().is_empty() {
            entry.dedup_issues();
            changed = true;
        }
        changed
    }
}

/// Drives every reachable method to a whole-program fixpoint (§4.6, §7):
/// each sweep analyzes every currently-dirty method in parallel, and a
/// method whose model grew marks its callers dirty for the next sweep.
pub struct Fixpoint<'a> {
    program: &'a dyn ProgramView,
    callgraph: &'a CallGraph,
    rules: &'a Rules,
    config: &'a Configuration,
    registry: DefaultModelRegistry,
    stats: Statistics,
    reverse_edges: HashMap<MethodId, Vec<MethodId>>,
}

impl<'a> Fixpoint<'a> {
    pub fn new(program: &'a dyn ProgramView, callgraph: &'a CallGraph, rules: &'a Rules, config: &'a Configuration) -> Self {
        crate::config::set_active_heuristics(config.heuristics);
        let mut reverse_edges: HashMap<MethodId, Vec<MethodId>> = HashMap::new();
        for caller in program.methods() {
            for callee in callgraph.callees(caller) {
                reverse_edges.entry(callee).or_default().push(caller);
            }
        }
        Fixpoint {
            program,
            callgraph,
            rules,
            config,
            registry: DefaultModelRegistry::new(),
            stats: Statistics::new(),
            reverse_edges,
        }
    }

    /// Installs a declared template model for `method` before the fixpoint
    /// runs (model generator output, §4.4).
    pub fn seed(&self, method: MethodId, model: Model) {
        self.registry.seed(method, model);
    }

    pub fn statistics(&self) -> &Statistics {
        &self.stats
    }

    /// Runs every reachable method to a fixpoint and returns the converged
    /// per-method models.
    pub fn run(self) -> HashMap<MethodId, Model> {
        let mut dirty: HashSet<MethodId> = self.program.methods().into_iter().collect();
        let max_sweeps = self.config.heuristics.max_global_analysis_iteration;

        for sweep in 0..max_sweeps {
            if dirty.is_empty() {
                break;
            }
            self.stats.record_sweep();
            let batch: Vec<MethodId> = dirty.drain().collect();
            let newly_dirty: Vec<MethodId> = batch
                .par_iter()
                .flat_map(|&method| self.analyze_one(method))
                .collect();
            dirty.extend(newly_dirty);
            if sweep + 1 == max_sweeps && !dirty.is_empty() {
                self.stats.record_iteration_cap_hit();
            }
        }

        self.registry.into_models()
    }

    fn analyze_one(&self, method: MethodId) -> Vec<MethodId> {
        let Some(cfg) = self.program.get_code(method) else { return Vec::new() };
        let mut model = self.registry.get(method);
        analyze_forward(method, cfg, &self.registry, self.callgraph, self.rules, self.config, &self.stats, &mut model);
        analyze_backward(method, cfg, &self.registry, self.callgraph, self.config, &mut model);
        model.dedup_issues();

        let grew = self.registry.join_with(method, model);
        if grew {
            self.stats.record_method_reanalyzed();
            self.reverse_edges.get(&method).cloned().unwrap_or_default()
        } else {
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access_path::Root;
    use crate::frame::Frame;
    use crate::interfaces::{BasicBlock, ClassHierarchy, Instruction, TypeEnvironment, TypeOracle};
    use crate::kind::NamedKindRole;
    use std::collections::HashSet as StdHashSet;

    struct FakeProgram {
        methods: Vec<MethodId>,
        code: HashMap<MethodId, ControlFlowGraph>,
        parameter_counts: HashMap<MethodId, u32>,
    }

    impl ProgramView for FakeProgram {
        fn parameter_type(&self, _method: MethodId, _index: u32) -> Option<String> {
            None
        }
        fn get_class(&self, _method: MethodId) -> Option<String> {
            None
        }
        fn signature(&self, method: MethodId) -> String {
            method.name().to_string()
        }
        fn returns_void(&self, _method: MethodId) -> bool {
            false
        }
        fn get_code(&self, method: MethodId) -> Option<&ControlFlowGraph> {
            self.code.get(&method)
        }
        fn is_static(&self, _method: MethodId) -> bool {
            true
        }
        fn is_constructor(&self, _method: MethodId) -> bool {
            false
        }
        fn is_native(&self, _method: MethodId) -> bool {
            false
        }
        fn parameter_count(&self, method: MethodId) -> u32 {
            *self.parameter_counts.get(&method).unwrap_or(&0)
        }
        fn methods(&self) -> Vec<MethodId> {
            self.methods.clone()
        }
    }

    struct NoOracle;
    impl TypeOracle for NoOracle {
        fn receiver_type(&self, _caller: MethodId, _instruction: u32) -> Option<String> {
            None
        }
        fn register_type(&self, _caller: MethodId, _instruction: u32, _register: u32) -> Option<String> {
            None
        }
        fn register_const_class_type(&self, _caller: MethodId, _instruction: u32, _register: u32) -> Option<String> {
            None
        }
        fn environment(&self, _caller: MethodId, _instruction: u32) -> TypeEnvironment {
            TypeEnvironment::new()
        }
    }

    struct NoHierarchy;
    impl ClassHierarchy for NoHierarchy {
        fn extends(&self, _class: &str) -> StdHashSet<String> {
            StdHashSet::new()
        }
        fn overrides(&self, _method: MethodId) -> Vec<MethodId> {
            Vec::new()
        }
    }

    fn source_taint(port: AccessPath) -> Taint {
        let kind = Kind::named("UserInput", NamedKindRole::Source);
        Taint::leaf(kind.clone(), Frame::declaration(kind, port))
    }

    fn sink_taint(port: AccessPath) -> Taint {
        let kind = Kind::named("SqlQuery", NamedKindRole::Sink);
        Taint::leaf(kind.clone(), Frame::declaration(kind, port))
    }

    fn rules() -> Rules {
        Rules::from_definitions(vec![crate::rules::RuleDefinition {
            code: 1,
            name: "user input flows into sql".to_string(),
            description: String::new(),
            source_kinds: vec!["UserInput".to_string()],
            sink_kinds: vec!["SqlQuery".to_string()],
            partial_sink_labels: HashMap::new(),
        }])
    }

    /// §8 scenario 1: a source on argument 0 of a direct call reaches the
    /// callee's declared sink on its own argument 0 — exactly one issue.
    #[test]
    fn single_propagation_flags_source_reaching_declared_sink() {
        let caller = MethodId::intern("Lcom/app/Caller;.run:(Ljava/lang/String;)V");
        let callee = MethodId::intern("Lcom/app/Callee;.sink:(Ljava/lang/String;)V");

        let cfg = ControlFlowGraph {
            blocks: vec![BasicBlock {
                instructions: vec![
                    Instruction { id: 0, op: Opcode::LoadParam { register: 0, parameter: 0 } },
                    Instruction {
                        id: 1,
                        op: Opcode::Invoke { callee, is_static: true, arguments: vec![0], result_register: None },
                    },
                ],
            }],
            edges: Vec::new(),
            entry: 0,
            exits: vec![0],
        };

        let program = FakeProgram {
            methods: vec![caller, callee],
            code: HashMap::from([(caller, cfg)]),
            parameter_counts: HashMap::from([(caller, 1)]),
        };

        let config = Configuration::default();
        let callgraph = CallGraph::build(&program, &NoOracle, &NoHierarchy, &config, &[], &HashMap::new());
        let rules = rules();

        let fixpoint = Fixpoint::new(&program, &callgraph, &rules, &config);

        let mut caller_model = Model::new(caller);
        caller_model.add_inferred_parameter_source(AccessPath::of_root(Root::Argument(0)), source_taint(AccessPath::of_root(Root::Argument(0))));
        fixpoint.seed(caller, caller_model);

        let mut callee_model = Model::new(callee);
        callee_model.add_inferred_sink(AccessPath::of_root(Root::Argument(0)), sink_taint(AccessPath::of_root(Root::Argument(0))));
        fixpoint.seed(callee, callee_model);

        let models = fixpoint.run();
        let caller_result = &models[&caller];
        assert_eq!(caller_result.issues().len(), 1);
        assert_eq!(caller_result.issues()[0].rule, RuleCode(1));
    }

    /// §8 scenario 2: two partial sinks on the same callee, fed by
    /// distinct source arguments, only trigger once both have been seen.
    #[test]
    fn partial_kind_rule_triggers_once_both_labels_are_fulfilled() {
        let caller = MethodId::intern("Lcom/app/Caller2;.run:(Ljava/lang/String;Ljava/lang/String;)V");
        let callee = MethodId::intern("Lcom/app/Callee2;.combine:(Ljava/lang/String;Ljava/lang/String;)V");

        let cfg = ControlFlowGraph {
            blocks: vec![BasicBlock {
                instructions: vec![
                    Instruction { id: 0, op: Opcode::LoadParam { register: 0, parameter: 0 } },
                    Instruction { id: 1, op: Opcode::LoadParam { register: 1, parameter: 1 } },
                    Instruction {
                        id: 2,
                        op: Opcode::Invoke { callee, is_static: true, arguments: vec![0, 1], result_register: None },
                    },
                ],
            }],
            edges: Vec::new(),
            entry: 0,
            exits: vec![0],
        };

        let program = FakeProgram {
            methods: vec![caller, callee],
            code: HashMap::from([(caller, cfg)]),
            parameter_counts: HashMap::from([(caller, 2)]),
        };

        let config = Configuration::default();
        let callgraph = CallGraph::build(&program, &NoOracle, &NoHierarchy, &config, &[], &HashMap::new());

        let mut rule = crate::rules::RuleDefinition {
            code: 2,
            name: "two sources combine".to_string(),
            description: String::new(),
            source_kinds: vec!["UserInput".to_string()],
            sink_kinds: Vec::new(),
            partial_sink_labels: HashMap::new(),
        };
        rule.partial_sink_labels.insert("left".to_string(), vec!["PartialLeft".to_string()]);
        rule.partial_sink_labels.insert("right".to_string(), vec!["PartialRight".to_string()]);
        let rules = Rules::from_definitions(vec![rule]);

        let fixpoint = Fixpoint::new(&program, &callgraph, &rules, &config);

        let mut caller_model = Model::new(caller);
        caller_model.add_inferred_parameter_source(AccessPath::of_root(Root::Argument(0)), source_taint(AccessPath::of_root(Root::Argument(0))));
        caller_model.add_inferred_parameter_source(AccessPath::of_root(Root::Argument(1)), source_taint(AccessPath::of_root(Root::Argument(1))));
        fixpoint.seed(caller, caller_model);

        let left_sink = Kind::named("PartialLeft", NamedKindRole::Sink);
        let right_sink = Kind::named("PartialRight", NamedKindRole::Sink);
        let mut callee_model = Model::new(callee);
        callee_model.add_inferred_sink(
            AccessPath::of_root(Root::Argument(0)),
            Taint::leaf(left_sink.clone(), Frame::declaration(left_sink, AccessPath::of_root(Root::Argument(0)))),
        );
        callee_model.add_inferred_sink(
            AccessPath::of_root(Root::Argument(1)),
            Taint::leaf(right_sink.clone(), Frame::declaration(right_sink, AccessPath::of_root(Root::Argument(1)))),
        );
        fixpoint.seed(callee, callee_model);

        let models = fixpoint.run();
        let caller_result = &models[&caller];
        assert_eq!(caller_result.issues().len(), 1);
        assert_eq!(caller_result.issues()[0].rule, RuleCode(2));
    }

    /// A method with no explicit `TaintInTaintOut` mode bit still infers a
    /// return propagation from its own `LoadParam`/`Return` pair (§4.6
    /// steps 1 and 8): `f(x) { return x; }` summarizes as "argument 0
    /// flows to Return", which a caller picks up as a generation on its
    /// own return.
    #[test]
    fn implicit_identity_propagation_flows_through_an_uninstrumented_method() {
        let caller = MethodId::intern("Lcom/app/Caller3;.run:(Ljava/lang/String;)Ljava/lang/String;");
        let callee = MethodId::intern("Lcom/app/Identity3;.identity:(Ljava/lang/String;)Ljava/lang/String;");

        let callee_cfg = ControlFlowGraph {
            blocks: vec![BasicBlock {
                instructions: vec![
                    Instruction { id: 0, op: Opcode::LoadParam { register: 0, parameter: 0 } },
                    Instruction { id: 1, op: Opcode::Return { register: Some(0) } },
                ],
            }],
            edges: Vec::new(),
            entry: 0,
            exits: vec![0],
        };

        let caller_cfg = ControlFlowGraph {
            blocks: vec![BasicBlock {
                instructions: vec![
                    Instruction { id: 0, op: Opcode::LoadParam { register: 0, parameter: 0 } },
                    Instruction {
                        id: 1,
                        op: Opcode::Invoke { callee, is_static: true, arguments: vec![0], result_register: Some(1) },
                    },
                    Instruction { id: 2, op: Opcode::Return { register: Some(1) } },
                ],
            }],
            edges: Vec::new(),
            entry: 0,
            exits: vec![0],
        };

        let program = FakeProgram {
            methods: vec![caller, callee],
            code: HashMap::from([(caller, caller_cfg), (callee, callee_cfg)]),
            parameter_counts: HashMap::from([(caller, 1), (callee, 1)]),
        };

        let config = Configuration::default();
        let callgraph = CallGraph::build(&program, &NoOracle, &NoHierarchy, &config, &[], &HashMap::new());
        let rules = rules();

        let fixpoint = Fixpoint::new(&program, &callgraph, &rules, &config);

        let mut caller_model = Model::new(caller);
        caller_model.add_inferred_parameter_source(AccessPath::of_root(Root::Argument(0)), source_taint(AccessPath::of_root(Root::Argument(0))));
        fixpoint.seed(caller, caller_model);
        fixpoint.seed(callee, Model::new(callee));

        let models = fixpoint.run();

        let callee_result = &models[&callee];
        let callee_propagation = callee_result.propagations().get(&AccessPath::of_root(Root::Argument(0)));
        assert!(callee_propagation.is_some_and(|t| !t.is_bottom()));

        let caller_result = &models[&caller];
        let returned = caller_result
            .generations()
            .get(&AccessPath::of_root(Root::Return))
            .expect("caller's return should be tainted via the inferred propagation");
        assert!(returned.contains_kind(&Kind::named("UserInput", NamedKindRole::Source)));
    }

    #[test]
    fn register_environment_join_is_the_lattice_upper_bound() {
        let mut a = RegisterEnvironment::default();
        a.set(0, TaintTree::leaf(source_taint(AccessPath::of_root(Root::Return))));
        let b = RegisterEnvironment::default();
        let joined = a.join(&b);
        assert!(a.leq(&joined));
        assert!(b.leq(&joined));
    }

    #[test]
    fn fulfilled_partial_kind_state_requires_every_label() {
        let mut partial = FulfilledPartialKindState::default();
        let rule = RuleCode(9);
        let labels = vec!["a".to_string(), "b".to_string()];
        assert!(!partial.is_triggered(rule, &labels));
        partial.fulfill(rule, "a".to_string(), Taint::bottom());
        assert!(!partial.is_triggered(rule, &labels));
        partial.fulfill(rule, "b".to_string(), Taint::bottom());
        assert!(partial.is_triggered(rule, &labels));
    }
}
