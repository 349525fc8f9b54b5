//! chunk.rs — conteneur immuable d'une unité de bytecode compilée : octets
//! d'opcode, table de lignes parallèle, pool de constantes, table de noms de
//! slots locaux pour le débogage, nom de chunk optionnel.
//!
//! Un `Chunk` est produit par le compilateur (hors-périmètre ici) ou par
//! désérialisation (`bytecode::codec`) ; il est immuable une fois prêt à
//! l'exécution. Les méthodes `append_*`/`add_constant` existent pour les
//! tests et pour un éventuel compilateur embarqué qui construirait un chunk
//! programmatiquement.

use std::sync::Arc;

use crate::value::Value;

/// Un chunk de bytecode, avec toutes les tables annexes nécessaires à
/// l'exécution et au débogage.
#[derive(Debug, Clone, Default)]
pub struct Chunk {
    code: Vec<u8>,
    /// Une entrée par octet de `code` : `lines[o]` est la ligne source de
    /// l'instruction dont le premier octet est à l'offset `o`.
    lines: Vec<u32>,
    constants: Vec<Value>,
    /// Un nom optionnel par slot local, dimensionné au plus haut slot utilisé.
    local_names: Vec<Option<Arc<str>>>,
    name: Option<Arc<str>>,
}

impl Chunk {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(name: impl Into<Arc<str>>) -> Self {
        Self { name: Some(name.into()), ..Self::default() }
    }

    /// Construit un chunk directement depuis ses parties déjà validées — le
    /// chemin emprunté par `bytecode::codec::deserialize`.
    pub fn from_raw_parts(
        code: Vec<u8>,
        lines: Vec<u32>,
        constants: Vec<Value>,
        local_names: Vec<Option<Arc<str>>>,
        name: Option<Arc<str>>,
    ) -> Self {
        Self { code, lines, constants, local_names, name }
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn lines(&self) -> &[u32] {
        &self.lines
    }

    pub fn constants(&self) -> &[Value] {
        &self.constants
    }

    pub fn local_names(&self) -> &[Option<Arc<str>>] {
        &self.local_names
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn set_name(&mut self, name: impl Into<Arc<str>>) {
        self.name = Some(name.into());
    }

    /// Ligne source de l'instruction commençant à l'offset `pc`, si présente.
    pub fn line_at(&self, pc: usize) -> Option<u32> {
        self.lines.get(pc).copied()
    }

    /// Ajoute un octet de code, en lockstep avec la table de lignes (§4.2).
    pub fn append_byte(&mut self, byte: u8, line: u32) {
        self.code.push(byte);
        self.lines.push(line);
    }

    /// Ajoute une instruction symbolique complète (encode + ligne répétée
    /// pour chaque octet de l'instruction, narrow ou wide).
    pub fn append_op(&mut self, op: crate::bytecode::ops::Op, line: u32) -> usize {
        let start = self.code.len();
        let mut encoded = Vec::new();
        op.encode(&mut encoded);
        for byte in encoded {
            self.append_byte(byte, line);
        }
        start
    }

    /// Emits a `MakeClosure` header followed by its upvalue-capture
    /// descriptors (`is_local`, `index` pairs), which ride directly in the
    /// code stream rather than as `Op` operands (§4.4.2 closure
    /// construction). `Op::decode` only reports the 3-byte header width;
    /// callers that walk the stream (VM dispatch, `verify`, the
    /// disassembler) must skip `2 * upvalues.len()` extra bytes themselves.
    pub fn append_closure(
        &mut self,
        chunk_const: u16,
        upvalues: &[(bool, u8)],
        line: u32,
    ) -> usize {
        let start = self.append_op(
            crate::bytecode::ops::Op::MakeClosure {
                chunk_const,
                upvalue_count: upvalues.len() as u8,
            },
            line,
        );
        for (is_local, index) in upvalues {
            self.append_byte(u8::from(*is_local), line);
            self.append_byte(*index, line);
        }
        start
    }

    /// Ajoute une constante, avec déduplication pour les scalaires immuables
    /// (Int/Float/Bool/String/Nil/Unit). Une Closure n'est jamais dédupliquée
    /// — chaque site de construction obtient sa propre entrée de pool, même
    /// si la sous-chunk sous-jacente est structurellement identique.
    pub fn add_constant(&mut self, value: Value) -> u32 {
        if Self::is_dedup_eligible(&value) {
            if let Some(idx) = self.constants.iter().position(|c| Self::dedup_eq(c, &value)) {
                return idx as u32;
            }
        }
        self.constants.push(value);
        (self.constants.len() - 1) as u32
    }

    fn is_dedup_eligible(v: &Value) -> bool {
        matches!(
            v,
            Value::Int(_) | Value::Float(_) | Value::Bool(_) | Value::String(_) | Value::Nil | Value::Unit
        )
    }

    fn dedup_eq(a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::Int(x), Value::Int(y)) => x == y,
            (Value::Float(x), Value::Float(y)) => x.to_bits() == y.to_bits(),
            (Value::Bool(x), Value::Bool(y)) => x == y,
            (Value::String(x), Value::String(y)) => x == y,
            (Value::Nil, Value::Nil) | (Value::Unit, Value::Unit) => true,
            _ => false,
        }
    }

    /// Garantit une capacité de table de noms locaux jusqu'à `slot` inclus.
    pub fn ensure_local_slot(&mut self, slot: u32) {
        let needed = slot as usize + 1;
        if self.local_names.len() < needed {
            self.local_names.resize(needed, None);
        }
    }

    pub fn set_local_name(&mut self, slot: u32, name: impl Into<Arc<str>>) {
        self.ensure_local_slot(slot);
        self.local_names[slot as usize] = Some(name.into());
    }

    /// Désassemblage textuel — pure commodité de débogage (§4.2 [EXPANDED]),
    /// sans incidence sur l'exécution ni sur le format binaire.
    pub fn disassemble(&self) -> String {
        crate::bytecode::disasm::disassemble_chunk(self)
    }

    /// Valide la cohérence interne d'un chunk avant sa première exécution :
    /// tout octet de code se décode, toute cible de saut retombe dans les
    /// bornes, tout index de constante référencé existe. Appelé par la VM au
    /// chargement (après compilation directe ou après `codec::deserialize`) ;
    /// un chunk construit à la main par les tests peut s'en dispenser.
    pub fn verify(&self) -> crate::error::Result<()> {
        use crate::bytecode::ops::Op;
        use crate::error::{CompileError, LatticeError};

        #[cfg(feature = "tracing")]
        tracing::debug!(target: "lattice_core::bytecode", chunk = self.name().unwrap_or("<anonymous>"), "verifying chunk");

        let len = self.code.len();
        let mut pc = 0usize;
        while pc < len {
            let (op, width) = Op::decode(&self.code, pc)
                .ok_or_else(|| LatticeError::from(CompileError::MalformedInstruction { pc }))?;
            let mut next_pc = pc + width;

            match op {
                Op::Jump(off) | Op::JumpIfFalse(off) | Op::JumpIfTrue(off) | Op::Loop(off)
                | Op::TrySetup(off) => {
                    let target = next_pc as i64 + off as i64;
                    if target < 0 || target as usize > len {
                        return Err(LatticeError::from(CompileError::JumpOutOfBounds { target, len }));
                    }
                }
                Op::LoadConst(idx) => self.check_const_index(idx as u32)?,
                Op::LoadConstWide(idx) => self.check_const_index(idx as u32)?,
                Op::MakeClosure { chunk_const, upvalue_count } => {
                    self.check_const_index(chunk_const as u32)?;
                    // Upvalue-capture descriptors (is_local, index) ride
                    // immediately after the header, not modeled as `Op`
                    // operands (see `append_closure`).
                    next_pc += 2 * upvalue_count as usize;
                    if next_pc > len {
                        return Err(LatticeError::from(CompileError::MalformedInstruction { pc }));
                    }
                }
                _ => {}
            }

            pc = next_pc;
        }

        for constant in &self.constants {
            if let Value::Closure(c) = constant {
                if let Some(body) = &c.body {
                    body.verify()?;
                }
            }
        }
        Ok(())
    }

    fn check_const_index(&self, index: u32) -> crate::error::Result<()> {
        if index as usize >= self.constants.len() {
            return Err(crate::error::LatticeError::from(crate::error::CompileError::ConstantIndexOutOfRange {
                index,
                pool_len: self.constants.len(),
            }));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::ops::Op;

    #[test]
    fn lines_track_code_lockstep() {
        let mut c = Chunk::new();
        c.append_op(Op::LoadConst(0), 1);
        c.append_op(Op::Return, 2);
        assert_eq!(c.code().len(), c.lines().len());
        assert_eq!(c.line_at(0), Some(1));
        assert_eq!(c.line_at(2), Some(2));
    }

    #[test]
    fn dedups_identical_scalar_constants() {
        let mut c = Chunk::new();
        let a = c.add_constant(Value::int(42));
        let b = c.add_constant(Value::int(42));
        assert_eq!(a, b);
        assert_eq!(c.constants().len(), 1);
    }

    #[test]
    fn does_not_dedup_arrays() {
        let mut c = Chunk::new();
        let a = c.add_constant(Value::array(vec![]));
        let b = c.add_constant(Value::array(vec![]));
        assert_ne!(a, b);
    }

    #[test]
    fn local_name_table_grows_to_slot() {
        let mut c = Chunk::new();
        c.set_local_name(3, "x");
        assert_eq!(c.local_names().len(), 4);
        assert_eq!(c.local_names()[3].as_deref(), Some("x"));
        assert!(c.local_names()[0].is_none());
    }
}
