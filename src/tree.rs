//! The abstract tree domain (§4.1): a map from [`Path`] to an element
//! lattice `E`, where interior elements are implicitly propagated to every
//! descendant.
//!
//! A `TreeConfig` supplies the widening height plus the sink/hoist/
//! widening-collapse transforms, expressed as ordinary Rust traits rather
//! than compile-time template parameters.

use crate::access_path::{Path, PathElement};
use std::collections::HashMap;
use std::sync::Arc;

/// The element lattice stored at each tree node. Only the operations the
/// tree domain itself needs are required; `meet`/`top` are intentionally
/// absent (§4.1: "used only as a bounded join semi-lattice").
pub trait Element: Clone + PartialEq {
    fn bottom() -> Self;
    fn is_bottom(&self) -> bool;
    fn leq(&self, other: &Self) -> bool;
    fn join(&self, other: &Self) -> Self;
}

/// Per-domain configuration: widening height plus the three transforms
/// applied as elements move through the tree.
pub trait TreeConfig {
    type Element: Element;

    fn max_tree_height_after_widening() -> usize;

    /// Applied to an ancestor's element as it is propagated down to a
    /// child during reads/joins ("sink" = moving toward the leaves).
    fn transform_on_sink(element: Self::Element) -> Self::Element {
        element
    }

    /// Applied to a descendant's element as it is folded up into an
    /// ancestor during `collapse`/`shape_with` ("hoist" = moving toward
    /// the root).
    fn transform_on_hoist(element: Self::Element) -> Self::Element {
        element
    }

    /// Applied when a subtree is collapsed because of widening.
    fn transform_on_widening_collapse(element: Self::Element) -> Self::Element {
        element
    }
}

/// Strong writes replace the subtree at the write path; weak writes join.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum UpdateKind {
    Strong,
    Weak,
}

/// An [`Element`]-valued tree keyed by [`PathElement`], persistent via
/// `Arc`-shared child maps: operations that do not touch a subtree reuse
/// the existing `Arc` instead of cloning it.
pub struct Tree<C: TreeConfig> {
    element: C::Element,
    children: Arc<HashMap<PathElement, Tree<C>>>,
}

impl<C: TreeConfig> Clone for Tree<C> {
    fn clone(&self) -> Self {
        Tree { element: self.element.clone(), children: Arc::clone(&self.children) }
    }
}

impl<C: TreeConfig> PartialEq for Tree<C> {
    fn eq(&self, other: &Self) -> bool {
        if self.element != other.element || self.children.len() != other.children.len() {
            return false;
        }
        self.children
            .iter()
            .all(|(key, child)| other.children.get(key).is_some_and(|o| child == o))
    }
}

impl<C: TreeConfig> Tree<C> {
    pub fn leaf(element: C::Element) -> Self {
        Tree { element, children: Arc::new(HashMap::new()) }
    }

    pub fn bottom() -> Self {
        Tree::leaf(C::Element::bottom())
    }

    pub fn is_bottom(&self) -> bool {
        self.element.is_bottom() && self.children.values().all(|c| c.is_bottom())
    }

    /// The element stored directly at this node, ignoring ancestors.
    pub fn root_element(&self) -> &C::Element {
        &self.element
    }

    fn child(&self, key: &PathElement) -> Option<&Tree<C>> {
        self.children.get(key)
    }

    /// The subtree reached through `key`, falling back to the `[*]`
    /// subtree when `key` is an absent `Index` (§4.1 wildcard semantics).
    fn child_or_any(&self, key: &PathElement) -> Option<&Tree<C>> {
        match self.child(key) {
            Some(c) => Some(c),
            None if matches!(key, PathElement::Index(_)) => self.child(&PathElement::AnyIndex),
            None => None,
        }
    }

    // -- read --------------------------------------------------------------

    /// Read the subtree at `path`. Ancestor elements are propagated into
    /// the result (through `transform_on_sink` at each descent) unless
    /// `raw_read` is used instead.
    pub fn read(&self, path: &Path) -> Tree<C> {
        self.read_impl(path, true)
    }

    pub fn raw_read(&self, path: &Path) -> Tree<C> {
        self.read_impl(path, false)
    }

    fn read_impl(&self, path: &Path, propagate: bool) -> Tree<C> {
        match path.split_first() {
            None => self.clone(),
            Some((head, rest)) => match self.child_or_any(&head) {
                Some(sub) => {
                    let result = sub.read_impl(&rest, propagate);
                    if propagate {
                        Tree {
                            element: C::transform_on_sink(self.element.clone()).join(&result.element),
                            children: result.children,
                        }
                    } else {
                        result
                    }
                }
                None => {
                    // Missing node: synthesize one whose element is the
                    // running ancestor accumulator.
                    let accumulator = if propagate {
                        C::transform_on_sink(self.element.clone())
                    } else {
                        C::Element::bottom()
                    };
                    Tree::leaf(accumulator)
                }
            },
        }
    }

    // -- write -------------------------------------------------------------

    pub fn write(&self, path: &Path, value: Tree<C>, kind: UpdateKind) -> Tree<C> {
        match path.split_first() {
            None => match kind {
                UpdateKind::Strong => value,
                UpdateKind::Weak => self.join(&value),
            },
            Some((PathElement::AnyIndex, rest)) => self.write_any_index(&rest, value, kind),
            Some((head, rest)) => {
                let mut children = (*self.children).clone();
                let existing = match children.remove(&head) {
                    Some(existing) => existing,
                    None => Self::seed_for_missing_write(&head, kind, &children),
                };
                let updated = existing.write(&rest, value, kind);
                if !updated.is_bottom() {
                    children.insert(head, updated);
                }
                Tree { element: self.element.clone(), children: Arc::new(children) }
            }
        }
    }

    /// A weak write into a missing `Index(i)` child first seeds it from the
    /// sibling `[*]` subtree, so the new index inherits whatever wildcard
    /// content already applies to it instead of starting from bottom
    /// (`AbstractTreeDomain.h`'s `write_internal`, §8 scenario 3). Any other
    /// missing-child case — a strong write, or a key that isn't an index —
    /// still starts from bottom.
    fn seed_for_missing_write(head: &PathElement, kind: UpdateKind, children: &HashMap<PathElement, Tree<C>>) -> Tree<C> {
        if kind == UpdateKind::Weak && matches!(head, PathElement::Index(_)) {
            children.get(&PathElement::AnyIndex).cloned().unwrap_or_else(Tree::bottom)
        } else {
            Tree::bottom()
        }
    }

    /// Writes through an `[*]` path element are always weak, broadcast to
    /// every existing `Index` child plus the `[*]` subtree itself (§4.1).
    fn write_any_index(&self, rest: &Path, value: Tree<C>, _kind: UpdateKind) -> Tree<C> {
        let mut children = (*self.children).clone();
        let keys: Vec<PathElement> = children
            .keys()
            .filter(|k| matches!(k, PathElement::Index(_)) || **k == PathElement::AnyIndex)
            .copied()
            .collect();

        for key in keys {
            let existing = children.remove(&key).unwrap_or_else(Tree::bottom);
            let updated = existing.write(rest, value.clone(), UpdateKind::Weak);
            children.insert(key, updated);
        }
        if !children.contains_key(&PathElement::AnyIndex) {
            let updated = Tree::<C>::bottom().write(rest, value, UpdateKind::Weak);
            if !updated.is_bottom() {
                children.insert(PathElement::AnyIndex, updated);
            }
        }
        Tree { element: self.element.clone(), children: Arc::new(children) }
    }

    // -- lattice -------------------------------------------------------------

    pub fn leq(&self, other: &Self) -> bool {
        if !self.element.leq(&other.element) {
            return false;
        }
        let self_any = self.child(&PathElement::AnyIndex);
        let other_any = other.child(&PathElement::AnyIndex);
        let mut keys: Vec<&PathElement> = self.children.keys().chain(other.children.keys()).collect();
        keys.sort_by_key(|k| key_order(k));
        keys.dedup();
        keys.into_iter().all(|key| {
            let l = self.child(key);
            let r = other.child(key);
            match (l, r, key) {
                (Some(l), Some(r), _) => l.leq(r),
                (Some(l), None, PathElement::Index(_)) => match other_any {
                    Some(any) => l.leq(any),
                    None => l.is_bottom(),
                },
                (Some(l), None, _) => l.is_bottom(),
                (None, Some(r), PathElement::Index(_)) => match self_any {
                    Some(any) => any.leq(r),
                    None => true,
                },
                (None, Some(_), _) => true,
                (None, None, _) => true,
            }
        })
    }

    pub fn join(&self, other: &Self) -> Self {
        self.join_with_height(other, usize::MAX)
    }

    fn join_with_height(&self, other: &Self, max_height: usize) -> Self {
        let element = self.element.join(&other.element);
        if max_height == 0 {
            let left = self.collapse(C::transform_on_widening_collapse).element;
            let right = other.collapse(C::transform_on_widening_collapse).element;
            return Tree::leaf(left.join(&right));
        }

        let self_any = self.child(&PathElement::AnyIndex);
        let other_any = other.child(&PathElement::AnyIndex);
        let mut keys: Vec<PathElement> = self.children.keys().chain(other.children.keys()).copied().collect();
        keys.sort_by_key(|k| key_order(k));
        keys.dedup();

        let mut children = HashMap::new();
        for key in keys {
            let l = self.child(&key);
            let r = other.child(&key);
            let joined = match (l, r, key) {
                (Some(l), Some(r), _) => l.join_with_height(r, max_height.saturating_sub(1)),
                (Some(l), None, PathElement::Index(_)) => match other_any {
                    Some(any) => l.join_with_height(any, max_height.saturating_sub(1)),
                    None => l.clone(),
                },
                (Some(l), None, _) => l.clone(),
                (None, Some(r), PathElement::Index(_)) => match self_any {
                    Some(any) => any.join_with_height(r, max_height.saturating_sub(1)),
                    None => r.clone(),
                },
                (None, Some(r), _) => r.clone(),
                (None, None, _) => unreachable!("key drawn from one of the two maps"),
            };
            if !joined.is_bottom() {
                children.insert(key, joined);
            }
        }
        Tree { element, children: Arc::new(children) }
    }

    /// Join bounded by [`TreeConfig::max_tree_height_after_widening`]; at
    /// height 0 both sides collapse to their root through
    /// `transform_on_widening_collapse` before joining (§4.1, §8).
    pub fn widen_with(&self, other: &Self) -> Self {
        self.join_with_height(other, C::max_tree_height_after_widening())
    }

    // -- shaping -------------------------------------------------------------

    /// Fold every descendant element into the root via `transform`.
    pub fn collapse(&self, transform: impl Fn(C::Element) -> C::Element + Copy) -> Tree<C> {
        let mut acc = self.element.clone();
        for child in self.children.values() {
            let collapsed = child.collapse(transform);
            acc = acc.join(&transform(collapsed.element));
        }
        Tree::leaf(acc)
    }

    /// Collapse every subtree whose depth exceeds `height`.
    pub fn collapse_deeper_than(&self, height: usize) -> Tree<C> {
        if height == 0 {
            return self.collapse(C::transform_on_widening_collapse);
        }
        let mut children = HashMap::new();
        for (key, child) in self.children.iter() {
            let shrunk = child.collapse_deeper_than(height - 1);
            if !shrunk.is_bottom() {
                children.insert(*key, shrunk);
            }
        }
        Tree { element: self.element.clone(), children: Arc::new(children) }
    }

    fn leaf_count(&self) -> usize {
        if self.children.is_empty() {
            1
        } else {
            self.children.values().map(Tree::leaf_count).sum()
        }
    }

    fn depth(&self) -> usize {
        self.children.values().map(|c| c.depth() + 1).max().unwrap_or(0)
    }

    /// BFS to find the shallowest depth at which leaf count exceeds
    /// `max_leaves`, then collapse to that depth.
    pub fn limit_leaves(&self, max_leaves: usize) -> Tree<C> {
        if self.leaf_count() <= max_leaves {
            return self.clone();
        }
        let max_depth = self.depth();
        for height in 0..=max_depth {
            let candidate = self.collapse_deeper_than(height);
            if candidate.leaf_count() <= max_leaves {
                return candidate;
            }
        }
        self.collapse(C::transform_on_widening_collapse)
    }

    /// Prune any branch absent in `mold`, collapsing its content into the
    /// nearest retained ancestor via `transform`.
    pub fn shape_with(&self, mold: &Tree<C>, transform: impl Fn(C::Element) -> C::Element + Copy) -> Tree<C> {
        let mut element = self.element.clone();
        let mut children = HashMap::new();
        for (key, child) in self.children.iter() {
            match mold.child(key) {
                Some(mold_child) => {
                    let shaped = child.shape_with(mold_child, transform);
                    if !shaped.is_bottom() {
                        children.insert(*key, shaped);
                    }
                }
                None => {
                    let collapsed = child.collapse(transform);
                    element = element.join(&transform(collapsed.element));
                }
            }
        }
        Tree { element, children: Arc::new(children) }
    }
}

fn key_order(key: &PathElement) -> (u8, u32) {
    match key {
        PathElement::Field(f) => (0, f.name().len() as u32),
        PathElement::Index(i) => (1, *i),
        PathElement::AnyIndex => (2, 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[derive(Clone, PartialEq, Debug)]
    struct Labels(BTreeSet<&'static str>);

    impl Element for Labels {
        fn bottom() -> Self {
            Labels(BTreeSet::new())
        }
        fn is_bottom(&self) -> bool {
            self.0.is_empty()
        }
        fn leq(&self, other: &Self) -> bool {
            self.0.is_subset(&other.0)
        }
        fn join(&self, other: &Self) -> Self {
            Labels(self.0.union(&other.0).copied().collect())
        }
    }

    struct Cfg;
    impl TreeConfig for Cfg {
        type Element = Labels;
        fn max_tree_height_after_widening() -> usize {
            2
        }
        fn transform_on_widening_collapse(element: Labels) -> Labels {
            let mut s = element.0;
            s.insert("widened");
            Labels(s)
        }
    }

    fn lbl(vals: &[&'static str]) -> Labels {
        Labels(vals.iter().copied().collect())
    }

    fn field(name: &str) -> PathElement {
        crate::access_path::PathElement::Field(crate::interning::FieldId::intern(name))
    }

    #[test]
    fn join_is_upper_bound() {
        let x = Tree::<Cfg>::leaf(lbl(&["a"])).write(&Path::of([field("f")]), Tree::leaf(lbl(&["b"])), UpdateKind::Weak);
        let y = Tree::<Cfg>::leaf(lbl(&["c"]));
        let j = x.join(&y);
        assert!(x.leq(&j));
        assert!(y.leq(&j));
    }

    #[test]
    fn strong_write_then_read_is_observable() {
        let t = Tree::<Cfg>::bottom();
        let p = Path::of([field("x")]);
        let t2 = t.write(&p, Tree::leaf(lbl(&["K"])), UpdateKind::Strong);
        let read_back = t2.read(&p);
        assert_eq!(read_back.root_element(), &lbl(&["K"]));
    }

    #[test]
    fn weak_write_joins_rather_than_replaces() {
        let p = Path::of([field("x")]);
        let t = Tree::<Cfg>::bottom().write(&p, Tree::leaf(lbl(&["A"])), UpdateKind::Strong);
        let t2 = t.write(&p, Tree::leaf(lbl(&["B"])), UpdateKind::Weak);
        let got = t2.read(&p);
        assert!(lbl(&["A"]).leq(got.root_element()));
        assert!(lbl(&["B"]).leq(got.root_element()));
    }

    #[test]
    fn reading_absent_path_returns_ancestor_accumulator() {
        let t = Tree::<Cfg>::leaf(lbl(&["top"]));
        let p = Path::of([field("missing")]);
        let got = t.read(&p);
        assert_eq!(got.root_element(), &lbl(&["top"]));
    }

    #[test]
    fn wildcard_index_write_hits_existing_index_children() {
        let t = Tree::<Cfg>::bottom()
            .write(&Path::of([PathElement::Index(0)]), Tree::leaf(lbl(&["zero"])), UpdateKind::Strong)
            .write(&Path::of([PathElement::Index(1)]), Tree::leaf(lbl(&["one"])), UpdateKind::Strong);

        let t2 = t.write(&Path::of([PathElement::AnyIndex]), Tree::leaf(lbl(&["all"])), UpdateKind::Weak);

        let at0 = t2.read(&Path::of([PathElement::Index(0)]));
        let at1 = t2.read(&Path::of([PathElement::Index(1)]));
        assert!(lbl(&["all"]).leq(at0.root_element()));
        assert!(lbl(&["all"]).leq(at1.root_element()));
    }

    /// §8 scenario 3: a wildcard write followed by a specific-index write
    /// joins rather than shadows — the new index child is seeded from
    /// `[*]` before the specific write is applied.
    #[test]
    fn wildcard_then_specific_index_write_joins_at_the_index() {
        let t = Tree::<Cfg>::bottom().write(
            &Path::of([field("a"), PathElement::AnyIndex, field("x")]),
            Tree::leaf(lbl(&["K1"])),
            UpdateKind::Weak,
        );
        let t2 = t.write(
            &Path::of([field("a"), PathElement::Index(0), field("x")]),
            Tree::leaf(lbl(&["K2"])),
            UpdateKind::Weak,
        );

        let at_index_1 = t2.read(&Path::of([field("a"), PathElement::Index(1), field("x")]));
        assert_eq!(at_index_1.root_element(), &lbl(&["K1"]));

        let at_index_0 = t2.read(&Path::of([field("a"), PathElement::Index(0), field("x")]));
        assert!(lbl(&["K1"]).leq(at_index_0.root_element()));
        assert!(lbl(&["K2"]).leq(at_index_0.root_element()));
    }

    #[test]
    fn missing_index_falls_back_to_any_index() {
        let t = Tree::<Cfg>::bottom().write(
            &Path::of([PathElement::AnyIndex]),
            Tree::leaf(lbl(&["wild"])),
            UpdateKind::Weak,
        );
        let at5 = t.read(&Path::of([PathElement::Index(5)]));
        assert_eq!(at5.root_element(), &lbl(&["wild"]));
    }

    #[test]
    fn collapse_deeper_than_bounds_depth() {
        let deep = Tree::<Cfg>::bottom().write(
            &Path::of([field("a"), field("b"), field("c")]),
            Tree::leaf(lbl(&["deep"])),
            UpdateKind::Strong,
        );
        let shallow = deep.collapse_deeper_than(1);
        assert!(shallow.depth() <= 1);
    }

    #[test]
    fn limit_leaves_respects_the_cap() {
        let mut t = Tree::<Cfg>::bottom();
        for i in 0..10u32 {
            t = t.write(&Path::of([PathElement::Index(i)]), Tree::leaf(lbl(&["x"])), UpdateKind::Strong);
        }
        let limited = t.limit_leaves(3);
        assert!(limited.leaf_count() <= 3 || limited.children.is_empty());
    }

    #[test]
    fn widen_with_terminates_on_repeated_growth() {
        let mut acc = Tree::<Cfg>::bottom();
        for depth in 0..20usize {
            let elements: Vec<PathElement> = (0..=depth % 6).map(|_| field("a")).collect();
            let grown = acc.write(&Path::of(elements), Tree::leaf(lbl(&["g"])), UpdateKind::Weak);
            acc = acc.widen_with(&grown);
        }
        assert!(acc.depth() <= Cfg::max_tree_height_after_widening() + 1);
    }
}
