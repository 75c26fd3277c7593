//! A detected source-to-sink flow (§4.6).

use crate::interning::{MethodId, PositionId};
use crate::rules::RuleCode;
use crate::taint::Taint;

#[derive(Clone, PartialEq, Debug)]
pub struct Issue {
    pub rule: RuleCode,
    pub sources: Taint,
    pub sinks: Taint,
    pub callee: Option<MethodId>,
    pub sink_index: usize,
    pub position: Option<PositionId>,
}

impl Issue {
    pub fn new(rule: RuleCode, sources: Taint, sinks: Taint, callee: Option<MethodId>, sink_index: usize, position: Option<PositionId>) -> Self {
        Issue { rule, sources, sinks, callee, sink_index, position }
    }

    /// Two issues at the same callee/position for the same rule are
    /// considered duplicates: their source/sink taint is joined rather
    /// than kept as two separate entries (mirrors how a `Model`'s issue
    /// set is built up incrementally as the fixpoint runs).
    pub fn dedup_key(&self) -> (RuleCode, Option<MethodId>, usize, Option<PositionId>) {
        (self.rule, self.callee, self.sink_index, self.position)
    }

    pub fn merge(&self, other: &Issue) -> Issue {
        debug_assert_eq!(self.dedup_key(), other.dedup_key());
        Issue {
            rule: self.rule,
            sources: self.sources.join(&other.sources),
            sinks: self.sinks.join(&other.sinks),
            callee: self.callee,
            sink_index: self.sink_index,
            position: self.position,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access_path::{AccessPath, Root};
    use crate::frame::Frame;
    use crate::kind::{Kind, NamedKindRole};

    fn leaf_taint(name: &str, role: NamedKindRole) -> Taint {
        let kind = Kind::named(name, role);
        Taint::leaf(kind.clone(), Frame::declaration(kind, AccessPath::of_root(Root::Return)))
    }

    #[test]
    fn merging_same_key_joins_taint_not_duplicates() {
        let a = Issue::new(RuleCode(1), leaf_taint("UserInput", NamedKindRole::Source), leaf_taint("SqlQuery", NamedKindRole::Sink), None, 0, None);
        let b = Issue::new(RuleCode(1), leaf_taint("Secret", NamedKindRole::Source), leaf_taint("SqlQuery", NamedKindRole::Sink), None, 0, None);
        let merged = a.merge(&b);
        assert!(merged.sources.contains_kind(&Kind::named("UserInput", NamedKindRole::Source)));
        assert!(merged.sources.contains_kind(&Kind::named("Secret", NamedKindRole::Source)));
    }
}
