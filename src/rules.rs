//! Rules: declared source-kind/sink-kind pairs that the fixpoint checks
//! for at every sink (§6).

use crate::kind::Kind;
use serde::Deserialize;
use std::collections::HashMap;

/// A rule's numeric identifier, as referenced by a [`crate::issue::Issue`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct RuleCode(pub u32);

/// One rule as declared in a rules file: flag when any of `source_kinds`
/// reaches any of `sink_kinds` (or, for partial rules, when every
/// `partial_sink_labels` sibling has independently been satisfied).
#[derive(Clone, Debug, Deserialize)]
pub struct RuleDefinition {
    pub code: u32,
    pub name: String,
    pub description: String,
    pub source_kinds: Vec<String>,
    pub sink_kinds: Vec<String>,
    #[serde(default)]
    pub partial_sink_labels: HashMap<String, Vec<String>>,
}

/// The parsed, queryable rule set.
#[derive(Clone, Default)]
pub struct Rules {
    definitions: Vec<RuleDefinition>,
}

impl Rules {
    pub fn from_definitions(definitions: Vec<RuleDefinition>) -> Self {
        Rules { definitions }
    }

    pub fn from_json(text: &str) -> crate::errors::TrenchResult<Self> {
        let definitions: Vec<RuleDefinition> = serde_json::from_str(text)?;
        Ok(Rules::from_definitions(definitions))
    }

    /// Every rule whose source/sink kind lists match `source` and `sink`
    /// by name (§6).
    pub fn matching(&self, source: &Kind, sink: &Kind) -> Vec<RuleCode> {
        let source_name = kind_name(source);
        let sink_name = kind_name(sink);
        self.definitions
            .iter()
            .filter(|rule| {
                source_name.as_deref().is_some_and(|n| rule.source_kinds.iter().any(|k| k == n))
                    && sink_name.as_deref().is_some_and(|n| rule.sink_kinds.iter().any(|k| k == n))
            })
            .map(|rule| RuleCode(rule.code))
            .collect()
    }

    pub fn definitions(&self) -> &[RuleDefinition] {
        &self.definitions
    }

    /// Every `(rule, label)` pair for which `sink` is one of the kinds
    /// that realizes that partial label (§3 "Partial kind", §8 scenario 2).
    pub fn partial_rules_for_sink(&self, sink: &str) -> Vec<(RuleCode, String)> {
        self.definitions
            .iter()
            .flat_map(|rule| {
                rule.partial_sink_labels
                    .iter()
                    .filter(|(_, kinds)| kinds.iter().any(|k| k == sink))
                    .map(move |(label, _)| (RuleCode(rule.code), label.clone()))
            })
            .collect()
    }

    /// Every label a multi-source `rule` requires to be fulfilled before
    /// it triggers.
    pub fn partial_labels(&self, rule: RuleCode) -> Vec<String> {
        self.definitions
            .iter()
            .find(|r| r.code == rule.0)
            .map(|r| r.partial_sink_labels.keys().cloned().collect())
            .unwrap_or_default()
    }
}

pub(crate) fn kind_name(kind: &Kind) -> Option<std::sync::Arc<str>> {
    match kind.base_kind() {
        crate::kind::BaseKind::Named(named) => Some(named.name()),
        crate::kind::BaseKind::Propagation(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kind::NamedKindRole;

    #[test]
    fn matching_finds_rule_by_kind_name() {
        let rules = Rules::from_definitions(vec![RuleDefinition {
            code: 1,
            name: "User input flows into SQL query".to_string(),
            description: "".to_string(),
            source_kinds: vec!["UserInput".to_string()],
            sink_kinds: vec!["SqlQuery".to_string()],
            partial_sink_labels: HashMap::new(),
        }]);
        let source = Kind::named("UserInput", NamedKindRole::Source);
        let sink = Kind::named("SqlQuery", NamedKindRole::Sink);
        assert_eq!(rules.matching(&source, &sink), vec![RuleCode(1)]);

        let other_sink = Kind::named("Log", NamedKindRole::Sink);
        assert!(rules.matching(&source, &other_sink).is_empty());
    }
}
