//! runtime — process-wide (but logically per-top-level-VM) shared state
//! (§4.5): the global environment, the struct-metadata registry, the
//! native-function registry, the program-argument vector, and the
//! interned-string table. Constructed before the first VM, torn down after
//! all VMs are freed (ordinary Rust drop order handles that for us once the
//! last `Arc`/owning `Vm` goes away).

pub mod environment;
pub mod intern;
pub mod registry;

use std::sync::Arc;

use crate::error::Result;

pub use environment::Environment;
pub use intern::{InternTable, Symbol};
pub use registry::{NativeRegistry, StructRegistry};

/// Host-provided knobs that don't belong to any one VM instance: the
/// program's argument vector and an optional callback used to redirect the
/// `print` builtin's output (§6, debugger/LSP collaborator interfaces).
#[derive(Clone, Default)]
pub struct RuntimeConfig {
    pub program_args: Vec<String>,
    pub print_capture: Option<Arc<dyn Fn(&str) + Send + Sync>>,
}

impl std::fmt::Debug for RuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeConfig")
            .field("program_args", &self.program_args)
            .field("print_capture", &self.print_capture.is_some())
            .finish()
    }
}

/// Process-wide runtime state shared (in spirit) by every VM descended from
/// one top-level program run. A top-level `Vm` owns a `Runtime`; spawning a
/// worker clones it via [`Runtime::fork_for_worker`] — environment scopes
/// are deep-copied, the two registries and the intern table are shared by
/// `Arc` since they're immutable after program start (§4.4.5, §9 "global
/// mutable state").
#[derive(Debug, Clone)]
pub struct Runtime {
    pub environment: Environment,
    pub struct_registry: Arc<StructRegistry>,
    pub native_registry: Arc<NativeRegistry>,
    pub intern: Arc<InternTable>,
    pub config: Arc<RuntimeConfig>,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Self {
        let intern = Arc::new(InternTable::new());
        Self {
            environment: Environment::new(Arc::clone(&intern)),
            struct_registry: Arc::new(StructRegistry::new(Arc::clone(&intern))),
            native_registry: Arc::new(NativeRegistry::new(Arc::clone(&intern))),
            intern,
            config: Arc::new(config),
        }
    }

    /// Builds the `Runtime` a spawned worker VM receives (§4.4.5): a fresh
    /// but semantically-equal copy of the environment, and shared read-only
    /// pointers to everything else.
    pub fn fork_for_worker(&self) -> Result<Runtime> {
        Ok(Runtime {
            environment: self.environment.deep_clone()?,
            struct_registry: Arc::clone(&self.struct_registry),
            native_registry: Arc::clone(&self.native_registry),
            intern: Arc::clone(&self.intern),
            config: Arc::clone(&self.config),
        })
    }

    pub fn print(&self, s: &str) {
        match &self.config.print_capture {
            Some(cb) => cb(s),
            None => print!("{s}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fork_for_worker_shares_registries_but_not_environment() {
        let rt = Runtime::new(RuntimeConfig::default());
        rt.struct_registry.register("Point", vec![Arc::from("x")]).unwrap();
        let worker = rt.fork_for_worker().unwrap();
        assert!(Arc::ptr_eq(&rt.struct_registry, &worker.struct_registry));
        assert_eq!(worker.struct_registry.field_count("Point"), Some(1));
    }

    #[test]
    fn print_capture_redirects_output() {
        use parking_lot::Mutex;
        let captured = Arc::new(Mutex::new(String::new()));
        let sink = Arc::clone(&captured);
        let rt = Runtime::new(RuntimeConfig {
            program_args: vec![],
            print_capture: Some(Arc::new(move |s: &str| sink.lock().push_str(s))),
        });
        rt.print("hello");
        assert_eq!(captured.lock().as_str(), "hello");
    }
}
