//! [`KindFrames`]: every frame of one kind, grouped for cheap joining
//! (§3, §4.2). A [`crate::taint::Taint`] value is a map from [`Kind`] to
//! one of these.

use crate::access_path::AccessPath;
use crate::frame::{CallKind, ClassIntervalContext, Frame};
use crate::interning::{MethodId, PositionId};
use std::collections::HashMap;

/// Identifies "the same call" for the purpose of deciding whether two
/// frames should be joined together rather than kept side by side.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
struct CallInfoKey {
    call_kind: CallKind,
    callee: Option<MethodId>,
    call_position: Option<PositionId>,
    callee_port: AccessPath,
}

impl CallInfoKey {
    fn of(frame: &Frame) -> Self {
        CallInfoKey {
            call_kind: frame.call_kind,
            callee: frame.callee,
            call_position: frame.call_position,
            callee_port: frame.callee_port.clone(),
        }
    }
}

/// The interval half of a [`CallInfoKey`]: frames with disjoint class
/// intervals are kept apart so callers can filter by interval at a
/// callsite without a spurious join blurring the distinction.
type IntervalKey = (i32, i32, bool);

fn interval_key(interval: &ClassIntervalContext) -> IntervalKey {
    (interval.lower, interval.upper, interval.preserves_type_context)
}

/// All frames of one kind sharing a (call-info, interval) key are kept
/// joined into a single [`Frame`]; distinct keys are kept apart.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct CallInfoIntervalFrames {
    entries: HashMap<(CallInfoKey, IntervalKey), Frame>,
}

impl CallInfoIntervalFrames {
    fn add(&mut self, frame: Frame) {
        let key = (CallInfoKey::of(&frame), interval_key(&frame.class_interval_context));
        match self.entries.get(&key) {
            Some(existing) => {
                let joined = existing.join(&frame);
                self.entries.insert(key, joined);
            }
            None => {
                self.entries.insert(key, frame);
            }
        }
    }

    fn is_bottom(&self) -> bool {
        self.entries.is_empty()
    }

    fn frames(&self) -> impl Iterator<Item = &Frame> {
        self.entries.values()
    }

    fn join(&self, other: &Self) -> Self {
        let mut result = self.clone();
        for frame in other.frames() {
            result.add(frame.clone());
        }
        result
    }

    fn leq(&self, other: &Self) -> bool {
        self.entries.iter().all(|(key, frame)| match other.entries.get(key) {
            Some(other_frame) => frame.distance >= other_frame.distance,
            None => false,
        })
    }
}

/// Every frame of a single [`Kind`](crate::kind::Kind) currently inferred
/// for one access path (§3).
#[derive(Clone, PartialEq, Debug, Default)]
pub struct KindFrames {
    groups: CallInfoIntervalFrames,
}

impl KindFrames {
    pub fn bottom() -> Self {
        KindFrames::default()
    }

    pub fn is_bottom(&self) -> bool {
        self.groups.is_bottom()
    }

    pub fn leaf(frame: Frame) -> Self {
        let mut k = KindFrames::bottom();
        k.add(frame);
        k
    }

    pub fn add(&mut self, frame: Frame) {
        frame.debug_assert_valid();
        self.groups.add(frame);
    }

    pub fn join(&self, other: &Self) -> Self {
        KindFrames { groups: self.groups.join(&other.groups) }
    }

    pub fn leq(&self, other: &Self) -> bool {
        self.groups.leq(&other.groups)
    }

    pub fn frames(&self) -> impl Iterator<Item = &Frame> {
        self.groups.frames()
    }

    pub fn map(&self, f: impl Fn(&Frame) -> Frame) -> Self {
        let mut out = KindFrames::bottom();
        for frame in self.frames() {
            out.add(f(frame));
        }
        out
    }

    pub fn filter(&self, keep: impl Fn(&Frame) -> bool) -> Self {
        let mut out = KindFrames::bottom();
        for frame in self.frames() {
            if keep(frame) {
                out.add(frame.clone());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access_path::Root;
    use crate::kind::{Kind, NamedKindRole};

    fn declared() -> Frame {
        Frame::declaration(Kind::named("UserInput", NamedKindRole::Source), AccessPath::of_root(Root::Return))
    }

    #[test]
    fn joining_same_call_info_merges_rather_than_duplicates() {
        let mut a = declared();
        a.distance = 3;
        let mut b = declared();
        b.distance = 1;

        let mut kf = KindFrames::bottom();
        kf.add(a);
        kf.add(b);

        assert_eq!(kf.frames().count(), 1);
        assert_eq!(kf.frames().next().unwrap().distance, 1);
    }

    #[test]
    fn distinct_callee_ports_are_kept_apart() {
        let mut kf = KindFrames::bottom();
        kf.add(declared());
        let mut other = declared();
        other.callee_port = AccessPath::of_root(Root::Argument(0));
        kf.add(other);
        assert_eq!(kf.frames().count(), 2);
    }

    #[test]
    fn leq_holds_when_distances_only_grow() {
        let mut small = KindFrames::bottom();
        small.add(declared());
        let mut large = small.clone();
        for frame in large.clone().frames() {
            let mut grown = frame.clone();
            grown.distance += 5;
            large = KindFrames::leaf(grown);
        }
        assert!(large.leq(&small));
        assert!(!small.leq(&large));
    }
}
