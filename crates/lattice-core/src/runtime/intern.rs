//! intern.rs — interned-string table (§4.5 [EXPANDED]) used to canonicalize
//! global names, struct field names and enum variant names so that
//! environment/registry lookups hash an integer key once a name has been
//! seen, rather than re-hashing the string bytes on every access.
//!
//! A simple bijection `HashMap<Box<str>, u32>` + `Vec<Box<str>>` behind a
//! `parking_lot::RwLock`, shared read-write across a top-level VM and any
//! worker VMs it spawns (the table itself is an implementation detail of
//! name resolution, not user-visible mutable state).

use parking_lot::RwLock;

#[derive(Debug, Default)]
pub struct InternTable {
    inner: RwLock<InternInner>,
}

#[derive(Debug, Default)]
struct InternInner {
    by_name: ahash::AHashMap<Box<str>, u32>,
    by_id: Vec<Box<str>>,
}

/// A canonicalized name handle — cheap to copy and compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(pub u32);

impl InternTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns `name`, returning its stable `Symbol`. Idempotent.
    pub fn intern(&self, name: &str) -> Symbol {
        if let Some(id) = self.inner.read().by_name.get(name) {
            return Symbol(*id);
        }
        let mut guard = self.inner.write();
        if let Some(id) = guard.by_name.get(name) {
            return Symbol(*id);
        }
        let id = guard.by_id.len() as u32;
        let boxed: Box<str> = name.into();
        guard.by_id.push(boxed.clone());
        guard.by_name.insert(boxed, id);
        Symbol(id)
    }

    pub fn resolve(&self, symbol: Symbol) -> Option<Box<str>> {
        self.inner.read().by_id.get(symbol.0 as usize).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_same_name_twice_returns_same_symbol() {
        let table = InternTable::new();
        let a = table.intern("foo");
        let b = table.intern("foo");
        assert_eq!(a, b);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn resolve_roundtrips() {
        let table = InternTable::new();
        let sym = table.intern("bar");
        assert_eq!(table.resolve(sym).as_deref(), Some("bar"));
    }
}
