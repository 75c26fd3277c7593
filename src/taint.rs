//! [`Taint`]: the map from [`Kind`] to [`KindFrames`] that is the value
//! type threaded through every tree in a [`crate::model::Model`] (§3).

use crate::access_path::AccessPath;
use crate::frame::{ClassIntervalContext, FeatureSet};
use crate::interning::{FeatureId, MethodId, PositionId};
use crate::kind::Kind;
use crate::kind_frames::KindFrames;
use std::collections::HashMap;

#[derive(Clone, PartialEq, Debug, Default)]
pub struct Taint {
    by_kind: HashMap<Kind, KindFrames>,
}

impl Taint {
    pub fn bottom() -> Self {
        Taint::default()
    }

    pub fn is_bottom(&self) -> bool {
        self.by_kind.values().all(KindFrames::is_bottom)
    }

    pub fn leaf(kind: Kind, frame: crate::frame::Frame) -> Self {
        let mut t = Taint::bottom();
        t.add(kind, frame);
        t
    }

    pub fn add(&mut self, kind: Kind, frame: crate::frame::Frame) {
        self.by_kind.entry(kind).or_default().add(frame);
    }

    pub fn contains_kind(&self, kind: &Kind) -> bool {
        self.by_kind.get(kind).is_some_and(|kf| !kf.is_bottom())
    }

    pub fn kinds(&self) -> impl Iterator<Item = &Kind> {
        self.by_kind.keys()
    }

    pub fn kind_frames(&self, kind: &Kind) -> Option<&KindFrames> {
        self.by_kind.get(kind)
    }

    pub fn join(&self, other: &Self) -> Self {
        let mut out = self.clone();
        for (kind, frames) in &other.by_kind {
            out.by_kind
                .entry(kind.clone())
                .and_modify(|existing| *existing = existing.join(frames))
                .or_insert_with(|| frames.clone());
        }
        out
    }

    /// Everything in `self` that is not dominated by `other` (used to
    /// detect "nothing new" at a fixpoint iteration: a worker reschedules
    /// a caller only if `difference` is non-bottom).
    pub fn difference(&self, other: &Self) -> Self {
        let mut out = Taint::bottom();
        for (kind, frames) in &self.by_kind {
            let dominated = other.by_kind.get(kind).is_some_and(|o| frames.leq(o));
            if !dominated {
                out.by_kind.insert(kind.clone(), frames.clone());
            }
        }
        out
    }

    pub fn leq(&self, other: &Self) -> bool {
        self.by_kind.iter().all(|(kind, frames)| {
            other.by_kind.get(kind).is_some_and(|o| frames.leq(o)) || frames.is_bottom()
        })
    }

    /// Rewrite every kind through `f`, which may fan a single kind out
    /// into several (e.g. a sanitizer transform that also preserves the
    /// untransformed kind), adding `features` to every surviving frame.
    pub fn transform_kind(&self, f: impl Fn(&Kind) -> Vec<Kind>, features: &FeatureSet) -> Self {
        let mut out = Taint::bottom();
        for (kind, frames) in &self.by_kind {
            for new_kind in f(kind) {
                let transformed = frames.map(|frame| {
                    let mut frame = frame.clone();
                    frame.inferred_features = frame.inferred_features.join(features);
                    frame
                });
                out.by_kind
                    .entry(new_kind)
                    .and_modify(|existing| *existing = existing.join(&transformed))
                    .or_insert(transformed);
            }
        }
        out
    }

    pub fn partition_by_kind<K: std::hash::Hash + Eq>(&self, classifier: impl Fn(&Kind) -> K) -> HashMap<K, Taint> {
        let mut out: HashMap<K, Taint> = HashMap::new();
        for (kind, frames) in &self.by_kind {
            out.entry(classifier(kind))
                .or_default()
                .by_kind
                .insert(kind.clone(), frames.clone());
        }
        out
    }

    pub fn attach_position(&self, position: PositionId, features: &std::collections::BTreeSet<FeatureId>) -> Self {
        let mut out = Taint::bottom();
        for (kind, frames) in &self.by_kind {
            out.by_kind.insert(kind.clone(), frames.map(|frame| frame.attach_position(position, features)));
        }
        out
    }

    /// Like [`Self::attach_position`] but skips frames that are still at
    /// their declaration (those have no prior hop to record a position
    /// for).
    pub fn update_non_leaf_positions(&self, position: PositionId) -> Self {
        let mut out = Taint::bottom();
        for (kind, frames) in &self.by_kind {
            out.by_kind.insert(
                kind.clone(),
                frames.map(|frame| {
                    if frame.call_kind.is_leaf_like() {
                        frame.clone()
                    } else {
                        let mut f = frame.clone();
                        f.local_positions.insert(position);
                        f
                    }
                }),
            );
        }
        out
    }

    pub fn features_joined(&self) -> FeatureSet {
        self.by_kind
            .values()
            .flat_map(KindFrames::frames)
            .fold(FeatureSet::default(), |acc, frame| acc.join(&frame.inferred_features))
    }

    /// The core callsite-crossing operation (§4.6): lift `self` (a
    /// callee's inferred taint on one access path) into the caller's
    /// frame of reference, one hop further from the original
    /// source/sink, dropping anything that would exceed
    /// `max_source_sink_distance` or whose class interval no longer
    /// intersects the caller's.
    #[allow(clippy::too_many_arguments)]
    pub fn propagate(
        &self,
        callee_method: MethodId,
        call_position: PositionId,
        new_callee_port: AccessPath,
        locally_inferred_features: FeatureSet,
        max_source_sink_distance: u32,
        caller_class_interval_context: ClassIntervalContext,
    ) -> Self {
        let mut out = Taint::bottom();
        for (kind, frames) in &self.by_kind {
            for frame in frames.frames() {
                let new_distance = frame.distance + 1;
                if new_distance > max_source_sink_distance {
                    continue;
                }
                let class_interval_context = if frame.class_interval_context.preserves_type_context {
                    match frame.class_interval_context.intersect(&caller_class_interval_context) {
                        Some(merged) => merged,
                        None => continue,
                    }
                } else {
                    caller_class_interval_context
                };

                let mut origins = frame.origins.clone();
                if frame.call_kind.is_leaf_like() {
                    origins.insert(crate::frame::Origin::Method(callee_method));
                }

                let mut local_positions = frame.local_positions.clone();
                local_positions.insert(call_position);

                let new_frame = crate::frame::Frame {
                    kind: kind.clone(),
                    callee_port: new_callee_port.clone(),
                    callee: Some(callee_method),
                    call_position: Some(call_position),
                    call_kind: frame.call_kind.advance(),
                    distance: new_distance,
                    origins,
                    inferred_features: frame.inferred_features.join(&frame.locally_inferred_features),
                    locally_inferred_features: locally_inferred_features.clone(),
                    user_features: frame.user_features.clone(),
                    via_type_of_ports: frame.via_type_of_ports.clone(),
                    via_value_of_ports: frame.via_value_of_ports.clone(),
                    canonical_names: frame.canonical_names.clone(),
                    output_paths: crate::frame::OutputPaths::empty(),
                    class_interval_context,
                    local_positions,
                    extra_traces: frame.extra_traces.clone(),
                };
                new_frame.debug_assert_valid();
                out.add(kind.clone(), new_frame);
            }
        }
        out
    }
}

/// Lets [`Taint`] sit directly as the element lattice of a
/// [`crate::tree::Tree`], so a register or access path can hold a full
/// taint tree rather than a single flat [`Taint`] value (§3 `TaintTree`).
impl crate::tree::Element for Taint {
    fn bottom() -> Self {
        Taint::bottom()
    }

    fn is_bottom(&self) -> bool {
        Taint::is_bottom(self)
    }

    fn leq(&self, other: &Self) -> bool {
        Taint::leq(self, other)
    }

    fn join(&self, other: &Self) -> Self {
        Taint::join(self, other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access_path::Root;
    use crate::kind::NamedKindRole;

    fn source_taint() -> Taint {
        let kind = Kind::named("UserInput", NamedKindRole::Source);
        let frame = crate::frame::Frame::declaration(kind.clone(), AccessPath::of_root(Root::Return));
        Taint::leaf(kind, frame)
    }

    #[test]
    fn propagate_advances_distance_and_sets_callee() {
        let t = source_taint();
        let callee = MethodId::intern("Lcom/app/Foo;.source:()Ljava/lang/String;");
        let pos = PositionId::intern("Foo.java:10");
        let propagated = t.propagate(
            callee,
            pos,
            AccessPath::of_root(Root::Return),
            FeatureSet::default(),
            10,
            ClassIntervalContext::unbounded(),
        );
        let kind = Kind::named("UserInput", NamedKindRole::Source);
        let frames: Vec<_> = propagated.kind_frames(&kind).unwrap().frames().collect();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].distance, 1);
        assert_eq!(frames[0].callee, Some(callee));
        assert!(frames[0].origins.contains(&crate::frame::Origin::Method(callee)));
    }

    #[test]
    fn propagate_drops_frames_past_max_distance() {
        let t = source_taint();
        let callee = MethodId::intern("Lcom/app/Foo;.source2:()Ljava/lang/String;");
        let pos = PositionId::intern("Foo.java:11");
        let propagated = t.propagate(
            callee,
            pos,
            AccessPath::of_root(Root::Return),
            FeatureSet::default(),
            0,
            ClassIntervalContext::unbounded(),
        );
        assert!(propagated.is_bottom());
    }

    #[test]
    fn join_is_commutative_on_distinct_kinds() {
        let a = source_taint();
        let kind2 = Kind::named("Secret", NamedKindRole::Source);
        let frame2 = crate::frame::Frame::declaration(kind2.clone(), AccessPath::of_root(Root::Return));
        let b = Taint::leaf(kind2, frame2);
        let joined = a.join(&b);
        assert!(joined.contains_kind(&Kind::named("UserInput", NamedKindRole::Source)));
        assert!(joined.contains_kind(&Kind::named("Secret", NamedKindRole::Source)));
    }
}
