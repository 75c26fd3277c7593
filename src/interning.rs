//! Process-wide interning factories.
//!
//! Kinds, features, positions, methods, fields, access paths and origins
//! are deduplicated here so the rest of the crate can compare them by a
//! small `Copy` id instead of structural equality — the same trick the
//! `Kind`/classifier tables in this codebase's lineage use `phf`/`Lazy`
//! maps for, generalized to runtime-discovered values via `dashmap`.

use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// A handle into one of the interning tables below. Equality and hashing
/// are plain integer comparisons; the backing string only matters for
/// display and for the first insert.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InternId(u32);

impl fmt::Debug for InternId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A generic append-only interning table: `String -> InternId`, plus the
/// reverse mapping for display. Readers never take a lock beyond the
/// `DashMap`'s internal per-shard locking; writers only ever insert, never
/// remove, so handed-out ids remain valid for the process's lifetime.
struct Factory {
    forward: DashMap<Arc<str>, InternId>,
    backward: DashMap<InternId, Arc<str>>,
    next: AtomicU32,
}

impl Factory {
    fn new() -> Self {
        Self {
            forward: DashMap::new(),
            backward: DashMap::new(),
            next: AtomicU32::new(0),
        }
    }

    fn intern(&self, name: &str) -> InternId {
        if let Some(id) = self.forward.get(name) {
            return *id;
        }
        let name: Arc<str> = Arc::from(name);
        // Two racing inserts of the same key just waste one id; ids are
        // never observed to be dense, only distinct-per-distinct-name.
        let id = InternId(self.next.fetch_add(1, Ordering::Relaxed));
        match self.forward.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => *existing.get(),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(id);
                self.backward.insert(id, name);
                id
            }
        }
    }

    fn resolve(&self, id: InternId) -> Option<Arc<str>> {
        self.backward.get(&id).map(|r| r.clone())
    }

    fn len(&self) -> usize {
        self.forward.len()
    }
}

macro_rules! interned_kind {
    ($name:ident, $factory:ident, $doc:expr) => {
        static $factory: Lazy<Factory> = Lazy::new(Factory::new);

        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(InternId);

        impl $name {
            pub fn intern(text: &str) -> Self {
                $name($factory.intern(text))
            }

            pub fn name(&self) -> Arc<str> {
                $factory
                    .resolve(self.0)
                    .expect("interned handle always resolves")
            }

            #[cfg(test)]
            fn table_len() -> usize {
                $factory.len()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.name())
            }
        }
    };
}

// Each macro expansion gets its own `static FACTORY`, so `KindName` and
// `MethodName` never share an id space even though both wrap `InternId`.
interned_kind!(MethodId, METHOD_FACTORY, "An interned fully-qualified method signature.");
interned_kind!(FieldId, FIELD_FACTORY, "An interned fully-qualified field name.");
interned_kind!(FeatureId, FEATURE_FACTORY, "An interned feature name (e.g. `via-cast`).");
interned_kind!(PositionId, POSITION_FACTORY, "An interned source position descriptor.");
interned_kind!(OriginId, ORIGIN_FACTORY, "An interned crtex/origin canonical name.");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_stable_and_deduplicates() {
        let a = MethodId::intern("Lcom/app/Foo;.bar:(I)V");
        let b = MethodId::intern("Lcom/app/Foo;.bar:(I)V");
        let c = MethodId::intern("Lcom/app/Foo;.baz:(I)V");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.name().as_ref(), "Lcom/app/Foo;.bar:(I)V");
    }

    #[test]
    fn separate_tables_do_not_collide() {
        let before = FeatureId::table_len();
        let _ = FeatureId::intern("via-cast-unique-marker");
        assert_eq!(FeatureId::table_len(), before + 1);
    }
}
