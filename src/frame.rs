//! [`Frame`]: the atomic element of taint (§3, §4.2).

use crate::access_path::AccessPath;
use crate::interning::{FeatureId, FieldId, MethodId, OriginId, PositionId};
use crate::kind::Kind;
use std::collections::BTreeSet;

/// Where a frame sits in the call chain that produced it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum CallKind {
    /// Declared directly on a model template, not yet tied to a callsite.
    Declaration,
    /// The frame's first hop away from its declaration.
    Origin,
    /// The frame has crossed at least one more callsite since its origin.
    Callsite,
    /// A local propagation frame (input port -> output port within one call).
    Propagation,
}

impl CallKind {
    /// The call-kind a frame takes on after crossing one more callsite
    /// (§4.6 "Compute a new call-kind").
    pub fn advance(self) -> CallKind {
        match self {
            CallKind::Declaration => CallKind::Origin,
            CallKind::Origin | CallKind::Callsite => CallKind::Callsite,
            CallKind::Propagation => CallKind::Propagation,
        }
    }

    pub fn is_leaf_like(self) -> bool {
        matches!(self, CallKind::Declaration | CallKind::Origin)
    }
}

/// One contributor to a frame's provenance: the method, field, or crtex
/// canonical name that ultimately introduced the taint.
#[derive(Clone, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub enum Origin {
    Method(MethodId),
    Field(FieldId),
    CanonicalName(OriginId),
}

/// A may/always feature pair: "always" features are guaranteed to have
/// been applied on every path a frame represents; "may" features were
/// applied on at least one path.
#[derive(Clone, PartialEq, Eq, Default, Debug)]
pub struct FeatureSet {
    pub always: BTreeSet<FeatureId>,
    pub may: BTreeSet<FeatureId>,
}

impl FeatureSet {
    pub fn always(features: impl IntoIterator<Item = FeatureId>) -> Self {
        FeatureSet { always: features.into_iter().collect(), may: BTreeSet::new() }
    }

    pub fn join(&self, other: &Self) -> Self {
        FeatureSet {
            // "always" only survives a join if both sides always had it;
            // anything lost that way becomes a "may" feature instead.
            always: self.always.intersection(&other.always).copied().collect(),
            may: self
                .may
                .union(&other.may)
                .chain(self.always.symmetric_difference(&other.always))
                .copied()
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.always.is_empty() && self.may.is_empty()
    }
}

/// A numeric class-interval plus the flag that controls whether it
/// filters callee frames at a callsite (§3, §4.6).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ClassIntervalContext {
    pub lower: i32,
    pub upper: i32,
    pub preserves_type_context: bool,
}

impl ClassIntervalContext {
    pub fn unbounded() -> Self {
        ClassIntervalContext { lower: i32::MIN, upper: i32::MAX, preserves_type_context: false }
    }

    pub fn intersect(&self, other: &Self) -> Option<Self> {
        let lower = self.lower.max(other.lower);
        let upper = self.upper.min(other.upper);
        if lower > upper {
            None
        } else {
            Some(ClassIntervalContext { lower, upper, preserves_type_context: self.preserves_type_context })
        }
    }
}

/// A collapse-depth tree for a propagation frame's output port (§3): how
/// many levels of the written taint tree survive the propagation, keyed
/// by the path under the output port. `None` means "no limit".
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct OutputPaths(Vec<(AccessPath, Option<u32>)>);

impl OutputPaths {
    pub fn empty() -> Self {
        OutputPaths(Vec::new())
    }

    pub fn single(port: AccessPath, collapse_depth: Option<u32>) -> Self {
        OutputPaths(vec![(port, collapse_depth)])
    }

    pub fn is_bottom(&self) -> bool {
        self.0.is_empty()
    }

    pub fn entries(&self) -> &[(AccessPath, Option<u32>)] {
        &self.0
    }

    pub fn join(&self, other: &Self) -> Self {
        let mut merged = self.0.clone();
        for (port, depth) in &other.0 {
            if !merged.iter().any(|(p, _)| p == port) {
                merged.push((port.clone(), *depth));
            }
        }
        OutputPaths(merged)
    }
}

/// The atomic element of taint (§3): one record of "kind `K` reaches this
/// access path via callee `M`'s port `P`, `D` hops from a declared
/// source/sink".
#[derive(Clone, PartialEq, Debug)]
pub struct Frame {
    pub kind: Kind,
    pub callee_port: AccessPath,
    pub callee: Option<MethodId>,
    pub call_position: Option<PositionId>,
    pub call_kind: CallKind,
    pub distance: u32,
    pub origins: BTreeSet<Origin>,
    pub inferred_features: FeatureSet,
    pub locally_inferred_features: FeatureSet,
    pub user_features: BTreeSet<FeatureId>,
    pub via_type_of_ports: Vec<AccessPath>,
    pub via_value_of_ports: Vec<AccessPath>,
    pub canonical_names: Vec<OriginId>,
    pub output_paths: OutputPaths,
    pub class_interval_context: ClassIntervalContext,
    pub local_positions: BTreeSet<PositionId>,
    pub extra_traces: Vec<String>,
}

impl Frame {
    /// A leaf frame straight off a declared source/sink template: origin
    /// call-kind, no callee, distance zero (§3 invariants).
    pub fn declaration(kind: Kind, port: AccessPath) -> Self {
        Frame {
            kind,
            callee_port: port,
            callee: None,
            call_position: None,
            call_kind: CallKind::Declaration,
            distance: 0,
            origins: BTreeSet::new(),
            inferred_features: FeatureSet::default(),
            locally_inferred_features: FeatureSet::default(),
            user_features: BTreeSet::new(),
            via_type_of_ports: Vec::new(),
            via_value_of_ports: Vec::new(),
            canonical_names: Vec::new(),
            output_paths: OutputPaths::empty(),
            class_interval_context: ClassIntervalContext::unbounded(),
            local_positions: BTreeSet::new(),
            extra_traces: Vec::new(),
        }
    }

    /// A frame minted at `LoadParam`, naming the parameter it was seeded
    /// from in its own `callee_port` (§4.6 step 1). Never itself surfaces
    /// as a declared source; `infer_output_taint` strips it out of
    /// `return`'s inferred generation and turns it into an inferred
    /// propagation instead.
    pub fn artificial_source(port: AccessPath) -> Self {
        Frame::declaration(Kind::artificial_source(), port)
    }

    pub fn propagation(kind: Kind, callee_port: AccessPath, output_paths: OutputPaths) -> Self {
        debug_assert!(!output_paths.is_bottom(), "propagation frame must have non-bottom output paths");
        Frame {
            call_kind: CallKind::Propagation,
            output_paths,
            ..Frame::declaration(kind, callee_port)
        }
    }

    /// Debug-only invariant check (§3, §7 `InvariantViolation`). Compiles
    /// away entirely in release builds.
    pub fn debug_assert_valid(&self) {
        if !cfg!(debug_assertions) {
            return;
        }
        match self.call_kind {
            CallKind::Declaration => {
                debug_assert!(self.callee.is_none());
                debug_assert!(self.call_position.is_none());
            }
            CallKind::Origin => {
                debug_assert_eq!(self.distance, 0);
                debug_assert!(self.callee.is_none());
            }
            CallKind::Callsite => {
                debug_assert!(self.callee.is_some());
                debug_assert!(self.call_position.is_some());
            }
            CallKind::Propagation => {
                debug_assert!(!self.output_paths.is_bottom());
            }
        }
    }

    /// Rewrite every frame's call-position to `position`, adding
    /// `features` to the user feature set.
    pub fn attach_position(&self, position: PositionId, features: &BTreeSet<FeatureId>) -> Frame {
        let mut f = self.clone();
        f.call_position = Some(position);
        f.user_features.extend(features.iter().copied());
        f
    }

    /// Join two frames known to share a call-info key (§4.2): the parts
    /// that identify *where* the frame sits stay fixed, everything else
    /// is combined pointwise. Distance is reversed in the lattice order,
    /// so the join keeps the smaller (closer to the source/sink) one.
    pub fn join(&self, other: &Frame) -> Frame {
        debug_assert_eq!(self.kind, other.kind);
        debug_assert_eq!(self.callee_port, other.callee_port);
        debug_assert_eq!(self.callee, other.callee);
        debug_assert_eq!(self.call_kind, other.call_kind);
        let mut origins = self.origins.clone();
        origins.extend(other.origins.iter().cloned());
        let mut user_features = self.user_features.clone();
        user_features.extend(other.user_features.iter().copied());
        let mut local_positions = self.local_positions.clone();
        local_positions.extend(other.local_positions.iter().copied());
        let mut via_type_of_ports = self.via_type_of_ports.clone();
        for p in &other.via_type_of_ports {
            if !via_type_of_ports.contains(p) {
                via_type_of_ports.push(p.clone());
            }
        }
        let mut via_value_of_ports = self.via_value_of_ports.clone();
        for p in &other.via_value_of_ports {
            if !via_value_of_ports.contains(p) {
                via_value_of_ports.push(p.clone());
            }
        }
        let mut canonical_names = self.canonical_names.clone();
        for n in &other.canonical_names {
            if !canonical_names.contains(n) {
                canonical_names.push(*n);
            }
        }
        let mut extra_traces = self.extra_traces.clone();
        for t in &other.extra_traces {
            if !extra_traces.contains(t) {
                extra_traces.push(t.clone());
            }
        }
        Frame {
            kind: self.kind.clone(),
            callee_port: self.callee_port.clone(),
            callee: self.callee,
            call_position: self.call_position.or(other.call_position),
            call_kind: self.call_kind,
            distance: self.distance.min(other.distance),
            origins,
            inferred_features: self.inferred_features.join(&other.inferred_features),
            locally_inferred_features: self.locally_inferred_features.join(&other.locally_inferred_features),
            user_features,
            via_type_of_ports,
            via_value_of_ports,
            canonical_names,
            output_paths: self.output_paths.join(&other.output_paths),
            class_interval_context: self
                .class_interval_context
                .intersect(&other.class_interval_context)
                .unwrap_or(self.class_interval_context),
            local_positions,
            extra_traces,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access_path::Root;
    use crate::kind::NamedKindRole;

    #[test]
    fn declaration_frame_has_no_callee_or_position() {
        let f = Frame::declaration(Kind::named("UserInput", NamedKindRole::Source), AccessPath::of_root(Root::Return));
        f.debug_assert_valid();
        assert!(f.callee.is_none());
        assert!(f.call_position.is_none());
    }

    #[test]
    fn class_interval_intersection_can_be_empty() {
        let a = ClassIntervalContext { lower: 2, upper: 3, preserves_type_context: true };
        let b = ClassIntervalContext { lower: 4, upper: 5, preserves_type_context: false };
        assert!(a.intersect(&b).is_none());

        let c = ClassIntervalContext { lower: 0, upper: 10, preserves_type_context: false };
        assert!(a.intersect(&c).is_some());
    }

    #[test]
    fn feature_set_join_demotes_disagreements_to_may() {
        let a = FeatureSet::always([FeatureId::intern("via-cast")]);
        let b = FeatureSet::default();
        let joined = a.join(&b);
        assert!(joined.always.is_empty());
        assert!(joined.may.contains(&FeatureId::intern("via-cast")));
    }
}
