//! registry.rs — the two process-wide, write-once-then-immutable registries
//! of §4.5: struct field-layout metadata (populated by the compiler before
//! any VM runs) and native functions (populated once at host init).
//!
//! Both key their map by `Symbol` rather than `Arc<str>`, canonicalizing
//! through the same shared `InternTable` as `Environment` — a struct/native
//! lookup hashes an integer once the name has been seen at least once.

use std::sync::Arc;

use crate::error::{LatticeError, Result};
use crate::runtime::intern::{InternTable, Symbol};
use crate::value::{NativeFn, Value};

/// Maps a struct type name to its ordered field-name list (§3: "Struct
/// field count equals the entry count in the corresponding registry entry
/// for its type name").
#[derive(Debug)]
pub struct StructRegistry {
    fields: parking_lot::RwLock<ahash::AHashMap<Symbol, Vec<Arc<str>>>>,
    intern: Arc<InternTable>,
}

impl StructRegistry {
    pub fn new(intern: Arc<InternTable>) -> Self {
        Self { fields: parking_lot::RwLock::new(ahash::AHashMap::new()), intern }
    }

    /// Registers a struct's field layout. Write-once per program run per
    /// §4.5; re-registering the same name is a compiler/host bug.
    pub fn register(&self, type_name: impl Into<Arc<str>>, fields: Vec<Arc<str>>) -> Result<()> {
        let type_name = type_name.into();
        let symbol = self.intern.intern(&type_name);
        let mut guard = self.fields.write();
        if guard.contains_key(&symbol) {
            return Err(LatticeError::internal(format!(
                "struct `{type_name}` registered more than once"
            )));
        }
        guard.insert(symbol, fields);
        Ok(())
    }

    pub fn fields_of(&self, type_name: &str) -> Option<Vec<Arc<str>>> {
        let symbol = self.intern.intern(type_name);
        self.fields.read().get(&symbol).cloned()
    }

    pub fn field_count(&self, type_name: &str) -> Option<usize> {
        let symbol = self.intern.intern(type_name);
        self.fields.read().get(&symbol).map(Vec::len)
    }
}

/// Maps a native function name to its host-provided implementation (§6
/// "Native-function ABI").
pub struct NativeRegistry {
    fns: parking_lot::RwLock<ahash::AHashMap<Symbol, NativeFn>>,
    intern: Arc<InternTable>,
}

impl NativeRegistry {
    pub fn new(intern: Arc<InternTable>) -> Self {
        Self { fns: parking_lot::RwLock::new(ahash::AHashMap::new()), intern }
    }

    pub fn register(&self, name: impl Into<Arc<str>>, f: NativeFn) {
        let name = name.into();
        let symbol = self.intern.intern(&name);
        self.fns.write().insert(symbol, f);
    }

    pub fn lookup(&self, name: &str) -> Option<NativeFn> {
        let symbol = self.intern.intern(name);
        self.fns.read().get(&symbol).cloned()
    }

    /// Wraps a looked-up native as a callable `Value::Closure` so it can be
    /// bound into the environment like any other global.
    pub fn lookup_value(&self, name: &str) -> Option<Value> {
        self.lookup(name).map(|native| {
            Value::Closure(Arc::new(crate::value::ClosureObj {
                param_count: 0,
                param_names: None,
                variadic: true,
                defaults: Vec::new(),
                body: None,
                upvalues: Vec::new(),
                native: Some(native),
                name: Some(Arc::from(name)),
            }))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn struct_registry_rejects_double_registration() {
        let reg = StructRegistry::new(Arc::new(InternTable::new()));
        reg.register("Point", vec![Arc::from("x"), Arc::from("y")]).unwrap();
        assert!(reg.register("Point", vec![Arc::from("x")]).is_err());
    }

    #[test]
    fn native_registry_roundtrips() {
        let reg = NativeRegistry::new(Arc::new(InternTable::new()));
        reg.register("identity", Arc::new(|_vm, args: &[Value]| Ok(args[0].clone())));
        assert!(reg.lookup("identity").is_some());
        assert!(reg.lookup("missing").is_none());
    }
}
