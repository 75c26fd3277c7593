//! Taint element kinds (§3): the "alphabet" frames are indexed by.

use crate::interning::FeatureId;
use std::fmt;

/// Whether a [`NamedKind`] names a taint source or a taint sink.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum NamedKindRole {
    Source,
    Sink,
}

/// A user-declared source/sink kind, e.g. `UserInput` or `SqlQuery`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NamedKind {
    name: crate::interning::OriginId,
    role: NamedKindRole,
}

impl NamedKind {
    pub fn new(name: &str, role: NamedKindRole) -> Self {
        NamedKind { name: crate::interning::OriginId::intern(name), role }
    }

    pub fn role(&self) -> NamedKindRole {
        self.role
    }

    pub fn name(&self) -> std::sync::Arc<str> {
        self.name.name()
    }
}

impl fmt::Debug for NamedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({:?})", self.role, self.name.name())
    }
}

/// The reserved name of the artificial-source kind (§4.6 step 1): never
/// declared by a user template, only minted internally at `LoadParam` so
/// `infer_output_taint` can tell, at `return`, which parameter a value
/// derived from.
const ARTIFICIAL_SOURCE_NAME: &str = "%artificial-source%";

/// A local propagation kind: taint that moves from one access path to
/// another within the same call (local-return or local-argument(i)).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum PropagationKind {
    LocalReturn,
    LocalArgument(u32),
}

/// A named, ordered flow-shaping operation (e.g. a sanitizer transform
/// applied along the way). Transform kinds are tracked by id only; the
/// crate that defines what a transform *means* lives outside this core.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TransformId(FeatureId);

impl TransformId {
    pub fn new(name: &str) -> Self {
        TransformId(FeatureId::intern(name))
    }
}

/// The base kind underlying a possibly-transformed [`Kind`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum BaseKind {
    Named(NamedKind),
    Propagation(PropagationKind),
}

/// A [`BaseKind`] wrapped with the local and global transforms that have
/// been applied to it as it propagated through the program (§3).
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct Kind {
    base: BaseKind,
    local_transforms: Vec<TransformId>,
    global_transforms: Vec<TransformId>,
}

impl Kind {
    pub fn base(base: BaseKind) -> Self {
        Kind { base, local_transforms: Vec::new(), global_transforms: Vec::new() }
    }

    pub fn named(name: &str, role: NamedKindRole) -> Self {
        Kind::base(BaseKind::Named(NamedKind::new(name, role)))
    }

    pub fn propagation(kind: PropagationKind) -> Self {
        Kind::base(BaseKind::Propagation(kind))
    }

    pub fn base_kind(&self) -> BaseKind {
        self.base
    }

    pub fn with_local_transform(&self, transform: TransformId) -> Kind {
        let mut local_transforms = self.local_transforms.clone();
        local_transforms.push(transform);
        Kind { base: self.base, local_transforms, global_transforms: self.global_transforms.clone() }
    }

    pub fn with_global_transform(&self, transform: TransformId) -> Kind {
        let mut global_transforms = self.global_transforms.clone();
        global_transforms.push(transform);
        Kind { base: self.base, local_transforms: self.local_transforms.clone(), global_transforms }
    }

    pub fn is_source(&self) -> bool {
        matches!(self.base, BaseKind::Named(n) if n.role() == NamedKindRole::Source)
    }

    pub fn is_sink(&self) -> bool {
        matches!(self.base, BaseKind::Named(n) if n.role() == NamedKindRole::Sink)
    }

    pub fn is_propagation(&self) -> bool {
        matches!(self.base, BaseKind::Propagation(_))
    }

    /// The kind minted at `LoadParam` to seed a parameter register with a
    /// frame naming its own port, so `infer_output_taint` can recover which
    /// parameters a returned value flows from (§4.6 steps 1 and 8).
    pub fn artificial_source() -> Self {
        Kind::named(ARTIFICIAL_SOURCE_NAME, NamedKindRole::Source)
    }

    pub fn is_artificial_source(&self) -> bool {
        matches!(self.base, BaseKind::Named(n) if n.role() == NamedKindRole::Source && &*n.name() == ARTIFICIAL_SOURCE_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_with_different_transforms_are_distinct() {
        let k = Kind::named("UserInput", NamedKindRole::Source);
        let t = k.with_local_transform(TransformId::new("Sanitize"));
        assert_ne!(k, t);
        assert!(k.is_source());
        assert!(!k.is_sink());
    }

    #[test]
    fn propagation_kind_roundtrips() {
        let k = Kind::propagation(PropagationKind::LocalArgument(1));
        assert!(k.is_propagation());
        assert!(!k.is_source());
    }

    #[test]
    fn artificial_source_is_distinct_from_user_declared_sources() {
        let artificial = Kind::artificial_source();
        assert!(artificial.is_artificial_source());
        assert!(artificial.is_source());
        let declared = Kind::named("UserInput", NamedKindRole::Source);
        assert!(!declared.is_artificial_source());
        assert_ne!(artificial, declared);
    }
}
