//! environment.rs — the global/scoped name→value mapping described in §4.5:
//! "a stack of scope maps (scope 0 is the globals scope; deeper scopes are
//! entered by the compiler's scope opcodes)".
//!
//! The bytecode's `LoadGlobal`/`StoreGlobal`/`DefineGlobal` family always
//! targets scope 0; deeper scopes exist for the compiler's own bookkeeping
//! (e.g. module bodies) and are not addressed by name-indexed opcodes in
//! this core, so the VM dispatch loop never pushes/pops them itself.
//!
//! Names are canonicalized through the shared `InternTable` before they
//! touch a scope map, so every scope hashes a `Symbol` (a `u32`) rather than
//! re-hashing string bytes on every global access (§4.5 "an interned-string
//! table used to canonicalize names used as hash keys").

use std::sync::Arc;

use ahash::AHashMap;

use crate::error::{FaultKind, LatticeError, Result};
use crate::runtime::intern::{InternTable, Symbol};
use crate::value::Value;

#[derive(Debug, Clone)]
pub struct Environment {
    scopes: Vec<AHashMap<Symbol, Value>>,
    intern: Arc<InternTable>,
}

impl Environment {
    pub fn new(intern: Arc<InternTable>) -> Self {
        Self { scopes: vec![AHashMap::new()], intern }
    }

    pub fn push_scope(&mut self) {
        self.scopes.push(AHashMap::new());
    }

    pub fn pop_scope(&mut self) {
        if self.scopes.len() > 1 {
            self.scopes.pop();
        }
    }

    fn globals(&self) -> &AHashMap<Symbol, Value> {
        &self.scopes[0]
    }

    fn globals_mut(&mut self) -> &mut AHashMap<Symbol, Value> {
        &mut self.scopes[0]
    }

    /// `DefineGlobal`: introduces (or overwrites) a binding in scope 0.
    pub fn define(&mut self, name: Arc<str>, value: Value) {
        let symbol = self.intern.intern(&name);
        self.globals_mut().insert(symbol, value);
    }

    /// `LoadGlobal`.
    pub fn get(&self, name: &str) -> Result<Value> {
        let symbol = self.intern.intern(name);
        self.globals()
            .get(&symbol)
            .cloned()
            .ok_or_else(|| LatticeError::from(FaultKind::UnknownGlobal { name: name.to_string() }))
    }

    /// `StoreGlobal`: assigns to an already-defined binding; unlike
    /// `define`, this is a runtime fault if the name is unbound (assignment
    /// to an undeclared global is never something a well-formed compiler
    /// emits, but a deserialized chunk from elsewhere might).
    pub fn set(&mut self, name: &str, value: Value) -> Result<()> {
        let symbol = self.intern.intern(name);
        match self.globals_mut().get_mut(&symbol) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(LatticeError::from(FaultKind::UnknownGlobal { name: name.to_string() })),
        }
    }

    /// Deep-clones every scope's bindings — the environment a worker VM
    /// receives at spawn time (§4.4.5): semantically equal at the moment of
    /// the clone, independent thereafter. The intern table itself is shared
    /// (it's immutable in spirit: symbols are only ever added, never
    /// reassigned), matching every other worker-shared piece of `Runtime`.
    pub fn deep_clone(&self) -> Result<Environment> {
        let mut scopes = Vec::with_capacity(self.scopes.len());
        for scope in &self.scopes {
            let mut cloned = AHashMap::with_capacity(scope.len());
            for (k, v) in scope {
                cloned.insert(*k, v.deep_clone()?);
            }
            scopes.push(cloned);
        }
        Ok(Environment { scopes, intern: Arc::clone(&self.intern) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> Environment {
        Environment::new(Arc::new(InternTable::new()))
    }

    #[test]
    fn define_then_get_roundtrips() {
        let mut env = env();
        env.define(Arc::from("x"), Value::int(1));
        assert!(matches!(env.get("x"), Ok(Value::Int(1))));
    }

    #[test]
    fn get_unknown_is_a_fault() {
        let env = env();
        assert!(env.get("missing").is_err());
    }

    #[test]
    fn deep_clone_is_independent_of_later_mutation() {
        let mut env = env();
        env.define(Arc::from("counter"), Value::array(vec![Value::int(1)]));
        let cloned = env.deep_clone().unwrap();
        env.set("counter", Value::array(vec![Value::int(1), Value::int(2)])).unwrap();
        assert_eq!(cloned.get("counter").unwrap().to_string(), "[1]");
    }

    #[test]
    fn interning_canonicalizes_the_hash_key_across_separately_built_arc_str_names() {
        let mut e = env();
        // Two distinct `Arc<str>` allocations with the same text must hash
        // to the same scope-map key via the shared intern table.
        e.define(Arc::from("shared"), Value::int(1));
        assert!(matches!(e.get(String::from("shared").as_str()), Ok(Value::Int(1))));
    }
}
