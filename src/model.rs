//! [`Model`]: the per-method taint summary that the fixpoint converges
//! to (§4.4).

use crate::access_path::AccessPath;
use crate::interning::{FeatureId, MethodId};
use crate::taint::Taint;
use bitflags::bitflags;
use std::collections::{BTreeSet, HashMap};

bitflags! {
    /// Which parts of a [`Model`] were frozen by a user-supplied template
    /// and should not be overwritten by inference (§4.4).
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct FreezeKind: u16 {
        const GENERATIONS   = 0b0000_0001;
        const PARAMETER_SOURCES = 0b0000_0010;
        const SINKS         = 0b0000_0100;
        const PROPAGATIONS  = 0b0000_1000;
        const SANITIZERS    = 0b0001_0000;
        const ATTACH_TO     = 0b0010_0000;
        const ADD_FEATURES  = 0b0100_0000;
    }
}

bitflags! {
    /// Behavioral flags attached to a model, analogous to Mariana
    /// Trench's `Model::Mode` bitset.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct ModeBits: u16 {
        /// Every tainted argument flows to the return value and vice
        /// versa, without a declared propagation for each pair.
        const TAINT_IN_TAINT_OUT   = 0b0000_0001;
        /// Every tainted argument flows to `this` (the receiver).
        const TAINT_IN_TAINT_THIS  = 0b0000_0010;
        const NO_COLLAPSE_ON_APPROXIMATE = 0b0000_0100;
        const NO_JOIN_VIRTUAL_OVERRIDES  = 0b0000_1000;
        const ADD_VIA_OBSCURE_FEATURE    = 0b0001_0000;
        const STRONG_WRITE_ON_PROPAGATION = 0b0010_0000;
        /// No callable body was found for this method; treated
        /// conservatively (as if `TAINT_IN_TAINT_OUT` were set) unless a
        /// template says otherwise.
        const OBSCURE = 0b0100_0000;
    }
}

/// A view of a callee's model as seen from one callsite: just the pieces
/// the fixpoint's transfer functions read, already filtered to the
/// ports that are actually live at this call (§4.6).
#[derive(Clone, Default)]
pub struct CalleeModel {
    pub generations: HashMap<AccessPath, Taint>,
    pub sinks: HashMap<AccessPath, Taint>,
    pub propagations: HashMap<AccessPath, Taint>,
    pub add_features_to_arguments: HashMap<AccessPath, BTreeSet<FeatureId>>,
    pub mode: ModeBits,
}

impl CalleeModel {
    pub fn empty() -> Self {
        CalleeModel::default()
    }
}

/// A method's complete, converged (or in-progress) taint summary.
#[derive(Clone, Default)]
pub struct Model {
    pub method: Option<MethodId>,
    generations: HashMap<AccessPath, Taint>,
    parameter_sources: HashMap<AccessPath, Taint>,
    sinks: HashMap<AccessPath, Taint>,
    call_effect_sources: HashMap<AccessPath, Taint>,
    call_effect_sinks: HashMap<AccessPath, Taint>,
    propagations: HashMap<AccessPath, Taint>,
    sanitizers: BTreeSet<FeatureId>,
    attach_to_sources: BTreeSet<FeatureId>,
    attach_to_sinks: BTreeSet<FeatureId>,
    add_features_to_arguments: HashMap<AccessPath, BTreeSet<FeatureId>>,
    issues: Vec<crate::issue::Issue>,
    freeze: FreezeKind,
    pub mode: ModeBits,
}

impl Model {
    pub fn new(method: MethodId) -> Self {
        Model { method: Some(method), ..Model::default() }
    }

    pub fn freeze(&self) -> FreezeKind {
        self.freeze
    }

    pub fn set_freeze(&mut self, freeze: FreezeKind) {
        self.freeze = freeze;
    }

    fn add_to(map: &mut HashMap<AccessPath, Taint>, port: AccessPath, taint: Taint) -> bool {
        let existing = map.entry(port).or_insert_with(Taint::bottom);
        let joined = existing.join(&taint);
        let changed = !joined.leq(existing);
        *existing = joined;
        changed
    }

    /// Returns `true` if this call actually grew the model (the caller
    /// uses this to decide whether to reschedule dependents).
    pub fn add_inferred_generation(&mut self, port: AccessPath, taint: Taint) -> bool {
        if self.freeze.contains(FreezeKind::GENERATIONS) {
            return false;
        }
        Self::add_to(&mut self.generations, port, taint)
    }

    pub fn add_inferred_parameter_source(&mut self, port: AccessPath, taint: Taint) -> bool {
        if self.freeze.contains(FreezeKind::PARAMETER_SOURCES) {
            return false;
        }
        Self::add_to(&mut self.parameter_sources, port, taint)
    }

    pub fn add_inferred_sink(&mut self, port: AccessPath, taint: Taint) -> bool {
        if self.freeze.contains(FreezeKind::SINKS) {
            return false;
        }
        Self::add_to(&mut self.sinks, port, taint)
    }

    pub fn add_inferred_call_effect_source(&mut self, port: AccessPath, taint: Taint) -> bool {
        Self::add_to(&mut self.call_effect_sources, port, taint)
    }

    pub fn add_inferred_call_effect_sink(&mut self, port: AccessPath, taint: Taint) -> bool {
        Self::add_to(&mut self.call_effect_sinks, port, taint)
    }

    pub fn add_inferred_propagation(&mut self, port: AccessPath, taint: Taint) -> bool {
        if self.freeze.contains(FreezeKind::PROPAGATIONS) {
            return false;
        }
        Self::add_to(&mut self.propagations, port, taint)
    }

    pub fn add_sanitizer(&mut self, feature: FeatureId) {
        self.sanitizers.insert(feature);
    }

    pub fn add_attach_to_sources(&mut self, feature: FeatureId) {
        self.attach_to_sources.insert(feature);
    }

    pub fn add_attach_to_sinks(&mut self, feature: FeatureId) {
        self.attach_to_sinks.insert(feature);
    }

    pub fn add_add_features_to_arguments(&mut self, port: AccessPath, features: BTreeSet<FeatureId>) {
        self.add_features_to_arguments.entry(port).or_default().extend(features);
    }

    pub fn add_issue(&mut self, issue: crate::issue::Issue) {
        self.issues.push(issue);
    }

    pub fn issues(&self) -> &[crate::issue::Issue] {
        &self.issues
    }

    pub fn add_features_to_arguments(&self) -> &HashMap<AccessPath, BTreeSet<FeatureId>> {
        &self.add_features_to_arguments
    }

    /// Collapses issues sharing a [`crate::issue::Issue::dedup_key`] into
    /// one, joining their source/sink taint (§4.6: the fixpoint revisits a
    /// method across sweeps and must not grow its issue list on every
    /// revisit).
    pub fn dedup_issues(&mut self) {
        let mut by_key: HashMap<_, crate::issue::Issue> = HashMap::new();
        for issue in self.issues.drain(..) {
            by_key
                .entry(issue.dedup_key())
                .and_modify(|existing| *existing = existing.merge(&issue))
                .or_insert(issue);
        }
        self.issues = by_key.into_values().collect();
    }

    pub fn generations(&self) -> &HashMap<AccessPath, Taint> {
        &self.generations
    }

    pub fn parameter_sources(&self) -> &HashMap<AccessPath, Taint> {
        &self.parameter_sources
    }

    pub fn sinks(&self) -> &HashMap<AccessPath, Taint> {
        &self.sinks
    }

    pub fn propagations(&self) -> &HashMap<AccessPath, Taint> {
        &self.propagations
    }

    pub fn is_sanitized(&self, feature: &FeatureId) -> bool {
        self.sanitizers.contains(feature)
    }

    /// Joins `other`'s inferred taint into `self`, used to combine a
    /// method's override-resolved callees' models into one conservative
    /// view at a polymorphic callsite. Returns whether anything grew.
    pub fn join_inferred(&mut self, other: &Model) -> bool {
        let mut changed = false;
        for (port, taint) in &other.generations {
            changed |= Self::add_to(&mut self.generations, port.clone(), taint.clone());
        }
        for (port, taint) in &other.parameter_sources {
            changed |= Self::add_to(&mut self.parameter_sources, port.clone(), taint.clone());
        }
        for (port, taint) in &other.sinks {
            changed |= Self::add_to(&mut self.sinks, port.clone(), taint.clone());
        }
        for (port, taint) in &other.propagations {
            changed |= Self::add_to(&mut self.propagations, port.clone(), taint.clone());
        }
        changed
    }

    /// Project the parts a callsite needs out of this model (§4.6).
    pub fn as_callee_model(&self) -> CalleeModel {
        CalleeModel {
            generations: self.generations.clone(),
            sinks: self.sinks.clone(),
            propagations: self.propagations.clone(),
            add_features_to_arguments: self.add_features_to_arguments.clone(),
            mode: self.mode,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access_path::Root;
    use crate::frame::Frame;
    use crate::kind::{Kind, NamedKindRole};

    fn taint() -> Taint {
        let kind = Kind::named("UserInput", NamedKindRole::Source);
        Taint::leaf(kind.clone(), Frame::declaration(kind, AccessPath::of_root(Root::Return)))
    }

    #[test]
    fn frozen_generations_reject_new_inference() {
        let mut model = Model::new(MethodId::intern("Lcom/app/Foo;.bar:()V"));
        model.set_freeze(FreezeKind::GENERATIONS);
        let changed = model.add_inferred_generation(AccessPath::of_root(Root::Return), taint());
        assert!(!changed);
        assert!(model.generations().get(&AccessPath::of_root(Root::Return)).is_none());
    }

    #[test]
    fn join_inferred_reports_growth_only_once() {
        let mut a = Model::new(MethodId::intern("Lcom/app/Foo;.a:()V"));
        let mut b = Model::new(MethodId::intern("Lcom/app/Foo;.b:()V"));
        b.add_inferred_sink(AccessPath::of_root(Root::Argument(0)), taint());
        assert!(a.join_inferred(&b));
        assert!(!a.join_inferred(&b));
    }
}
