//! lattice-core — le cœur d'exécution du langage Lattice.
//!
//! Couvre exactement le périmètre du runtime (§1–§5 de la spécification) :
//! le modèle de valeurs, le conteneur `Chunk` et son codec binaire `.latc`,
//! la VM à pile, et l'état partagé du `Runtime`. Tout le reste — lexer,
//! parseur, compilateur, débogueur, LSP, builtins — vit ailleurs et ne
//! traverse cette frontière qu'à travers les interfaces nommées au §6.
//!
//! ## Modules
//! - [`value`] : la variante taguée `Value` et ses objets possédés
//!   (`ClosureObj`, `StructObj`, `EnumObj`, `SetObj`, ...).
//! - [`bytecode`] : `Chunk`, le jeu d'instructions `Op`, le codec `.latc`
//!   et un désassembleur texte.
//! - [`runtime`] : l'environnement global, les registres struct/native,
//!   la table d'internement, `RuntimeConfig`.
//! - [`vm`] : la boucle de dispatch, les piles de frames/handlers/defers,
//!   les upvalues, et le support concurrence (§4.4.5, §5).
//! - [`builtins`] : les natives `ref_*`/`channel_*` qui rendent `Value::Ref`
//!   et `Value::Channel` manipulables depuis le bytecode.
//! - [`error`] : la taxonomie d'erreurs à quatre familles du §7 et le
//!   `Result` du crate.
//!
//! ## Features
//! - **tracing** *(activée par défaut)* : instrumentation `tracing` sur
//!   l'entrée/sortie de frame, les fautes levées, les defers exécutés.
//! - **config-toml** : permet à un hôte de charger `VmLimits`/`RuntimeConfig`
//!   depuis un fichier TOML via `serde`+`toml`. Le format `.latc` lui-même
//!   n'emprunte jamais serde/TOML — ce serait contraire au déterminisme du
//!   §4.3.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]

mod util;

pub mod builtins;
pub mod bytecode;
pub mod error;
pub mod runtime;
pub mod value;
pub mod vm;

pub use bytecode::chunk::Chunk;
pub use bytecode::ops::Op;
pub use error::{CompileError, FaultKind, LatticeError, LimitKind, Result};
pub use runtime::{Runtime, RuntimeConfig};
pub use value::Value;
pub use vm::{Vm, VmLimits};

/// Version lisible du crate (utile pour les bannières de log/outils hôtes).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Charge un artefact `.latc` depuis des octets et le prépare à l'exécution
/// (`deserialize` puis `Chunk::verify`) — le chemin qu'un hôte emprunte pour
/// charger un fichier compilé avant de le passer à [`Vm::run`].
pub fn load_chunk(bytes: &[u8]) -> Result<Chunk> {
    let chunk = bytecode::codec::deserialize(bytes)?;
    chunk.verify()?;
    Ok(chunk)
}

/// Sérialise un `Chunk` déjà compilé/vérifié en un artefact `.latc`
/// (§4.3 "Container framing").
pub fn save_chunk(chunk: &Chunk) -> Result<Vec<u8>> {
    bytecode::codec::serialize(chunk)
}

#[cfg(feature = "config-toml")]
/// Charge un `RuntimeConfig` partiel depuis un fichier TOML — les champs
/// absents gardent leur valeur par défaut (§3 [EXPANDED] "Configuration").
pub mod config {
    use serde::Deserialize;

    use crate::runtime::RuntimeConfig;
    use crate::vm::VmLimits;

    /// Miroir sérialisable de [`VmLimits`] — un hôte ne fournit que les
    /// champs qu'il souhaite surcharger, les autres restent `None` et
    /// gardent la valeur par défaut de `VmLimits`.
    #[derive(Debug, Default, Deserialize)]
    pub struct VmLimitsFile {
        pub value_stack: Option<usize>,
        pub frame_stack: Option<usize>,
        pub handler_stack: Option<usize>,
        pub defer_stack: Option<usize>,
        pub max_workers: Option<usize>,
    }

    impl VmLimitsFile {
        pub fn into_limits(self) -> VmLimits {
            let mut b = VmLimits::builder();
            if let Some(v) = self.value_stack {
                b = b.value_stack(v);
            }
            if let Some(v) = self.frame_stack {
                b = b.frame_stack(v);
            }
            if let Some(v) = self.handler_stack {
                b = b.handler_stack(v);
            }
            if let Some(v) = self.defer_stack {
                b = b.defer_stack(v);
            }
            if let Some(v) = self.max_workers {
                b = b.max_workers(v);
            }
            b.build()
        }
    }

    /// Parse une configuration hôte depuis une chaîne TOML.
    pub fn parse_limits_toml(src: &str) -> Result<VmLimits, toml::de::Error> {
        let file: VmLimitsFile = toml::from_str(src)?;
        Ok(file.into_limits())
    }

    /// Construit un `RuntimeConfig` avec les arguments de programme fournis
    /// par l'hôte ; le callback de capture `print` n'a pas de représentation
    /// TOML et reste à la charge de l'appelant.
    pub fn runtime_config_with_args(program_args: Vec<String>) -> RuntimeConfig {
        RuntimeConfig { program_args, print_capture: None }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::bytecode::ops::Op;

    #[test]
    fn load_then_save_chunk_is_byte_identical() {
        let mut c = Chunk::with_name("main");
        let k = c.add_constant(Value::int(42));
        c.append_op(Op::LoadConst(k as u8), 1);
        c.append_op(Op::Return, 1);

        let bytes = save_chunk(&c).unwrap();
        let loaded = load_chunk(&bytes).unwrap();
        let bytes2 = save_chunk(&loaded).unwrap();
        assert_eq!(bytes, bytes2);
    }

    #[test]
    fn load_chunk_rejects_bad_magic() {
        let mut bytes = save_chunk(&Chunk::new()).unwrap();
        bytes[0] = b'X';
        assert!(load_chunk(&bytes).is_err());
    }

    #[test]
    fn end_to_end_arithmetic_then_print() {
        // fn main() { print(1 + 2 * 3) }
        let mut c = Chunk::with_name("main");
        let one = c.add_constant(Value::int(1));
        let two = c.add_constant(Value::int(2));
        let three = c.add_constant(Value::int(3));
        c.append_op(Op::LoadConst(one as u8), 1);
        c.append_op(Op::LoadConst(two as u8), 1);
        c.append_op(Op::LoadConst(three as u8), 1);
        c.append_op(Op::Mul, 1);
        c.append_op(Op::Add, 1);
        c.append_op(Op::Return, 1);

        let rt = Runtime::new(RuntimeConfig::default());
        let mut vm = Vm::new(rt, VmLimits::default());
        let result = vm.run(Arc::new(c)).unwrap();
        assert_eq!(result.to_string(), "7");
    }
}
