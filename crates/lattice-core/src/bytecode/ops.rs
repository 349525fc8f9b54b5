//! ops.rs — le jeu d'instructions exécuté par la VM.
//!
//! `Op` est la forme symbolique, pratique à construire en test et à
//! désassembler ; un `Chunk` ne stocke que la forme encodée (octets bruts).
//! `Op::encode` / `Op::decode` sont le pont entre les deux, et sont la seule
//! source de vérité sur l'encodage — le dispatcher de la VM et le
//! désassembleur partagent ce même `decode`.
//!
//! Convention d'opérandes : les index (constante, global, upvalue) ont une
//! forme étroite sur un octet et une forme large sur deux octets petit-boutien,
//! utilisée quand la table dépasse 255 entrées (§4.4.2). Les offsets de saut
//! sont toujours des `i16` relatifs petit-boutiens. Les compteurs de
//! construction de littéraux (tuple/array/map/struct/enum) sont des `u16`.

/// Forme d'opérande attendue après l'octet de code opération — utile au
/// désassembleur pour savoir combien d'octets consommer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    None,
    U8,
    U16,
    I16,
    U16U8,
    U16U16U8,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Op {
    // --- constantes ---
    LoadConst(u8),
    LoadConstWide(u16),
    LoadTrue,
    LoadFalse,
    LoadNil,
    LoadUnit,

    // --- pile ---
    Pop,
    Dup,

    // --- locales ---
    LoadLocal(u8),
    StoreLocal(u8),

    // --- globales ---
    LoadGlobal(u8),
    LoadGlobalWide(u16),
    StoreGlobal(u8),
    StoreGlobalWide(u16),
    DefineGlobal(u8),
    DefineGlobalWide(u16),

    // --- upvalues ---
    LoadUpvalue(u8),
    StoreUpvalue(u8),

    // --- arithmétique / bits ---
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Neg,
    BitAnd,
    BitOr,
    BitXor,
    BitNot,
    Shl,
    Shr,

    // --- logique / comparaison ---
    Not,
    LogicalAnd,
    LogicalOr,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,

    // --- contrôle ---
    Jump(i16),
    JumpIfFalse(i16),
    JumpIfTrue(i16),
    Loop(i16),

    // --- appels ---
    Call(u8),
    Return,

    // --- fermetures ---
    /// Index (large) de la sous-chunk constante, puis nombre de descripteurs
    /// d'upvalue (chacun `is_local: u8, index: u8` suit immédiatement dans le
    /// flux d'octets — non modélisé comme champ de variante car de taille
    /// variable ; `decode` ne consomme que l'en-tête fixe et rapporte sa
    /// largeur, l'appelant lit le reste).
    MakeClosure { chunk_const: u16, upvalue_count: u8 },

    // --- exceptions / defers ---
    TrySetup(i16),
    PopHandler,
    Throw,
    DeferRegister { body_offset: i16, scope_depth: u8 },
    ScopeExit(u8),

    // --- structures de données ---
    StructBuild { type_name_const: u16, field_count: u8 },
    FieldGet(u16),
    FieldSet(u16),
    EnumBuild { enum_name_const: u16, variant_name_const: u16, payload_count: u8 },
    VariantTest(u16),
    TupleBuild(u16),
    ArrayBuild(u16),
    MapBuild(u16),
    RangeBuild,
    IndexGet,
    IndexSet,
    IterOpen,
    IterNext,
}

impl Op {
    /// Le tag d'opcode — stable pour un chunk donné (sert au chargement/dump).
    pub fn tag(&self) -> u8 {
        match self {
            Op::LoadConst(_) => 0x01,
            Op::LoadConstWide(_) => 0x02,
            Op::LoadTrue => 0x03,
            Op::LoadFalse => 0x04,
            Op::LoadNil => 0x05,
            Op::LoadUnit => 0x06,
            Op::Pop => 0x07,
            Op::Dup => 0x08,
            Op::LoadLocal(_) => 0x09,
            Op::StoreLocal(_) => 0x0A,
            Op::LoadGlobal(_) => 0x0B,
            Op::LoadGlobalWide(_) => 0x0C,
            Op::StoreGlobal(_) => 0x0D,
            Op::StoreGlobalWide(_) => 0x0E,
            Op::DefineGlobal(_) => 0x0F,
            Op::DefineGlobalWide(_) => 0x10,
            Op::LoadUpvalue(_) => 0x11,
            Op::StoreUpvalue(_) => 0x12,
            Op::Add => 0x13,
            Op::Sub => 0x14,
            Op::Mul => 0x15,
            Op::Div => 0x16,
            Op::Mod => 0x17,
            Op::Neg => 0x18,
            Op::BitAnd => 0x19,
            Op::BitOr => 0x1A,
            Op::BitXor => 0x1B,
            Op::BitNot => 0x1C,
            Op::Shl => 0x1D,
            Op::Shr => 0x1E,
            Op::Not => 0x1F,
            Op::LogicalAnd => 0x20,
            Op::LogicalOr => 0x21,
            Op::Eq => 0x22,
            Op::Ne => 0x23,
            Op::Lt => 0x24,
            Op::Le => 0x25,
            Op::Gt => 0x26,
            Op::Ge => 0x27,
            Op::Jump(_) => 0x28,
            Op::JumpIfFalse(_) => 0x29,
            Op::JumpIfTrue(_) => 0x2A,
            Op::Loop(_) => 0x2B,
            Op::Call(_) => 0x2C,
            Op::Return => 0x2D,
            Op::MakeClosure { .. } => 0x2E,
            Op::TrySetup(_) => 0x2F,
            Op::PopHandler => 0x30,
            Op::Throw => 0x31,
            Op::DeferRegister { .. } => 0x32,
            Op::ScopeExit(_) => 0x33,
            Op::StructBuild { .. } => 0x34,
            Op::FieldGet(_) => 0x35,
            Op::FieldSet(_) => 0x36,
            Op::EnumBuild { .. } => 0x37,
            Op::VariantTest(_) => 0x38,
            Op::TupleBuild(_) => 0x39,
            Op::ArrayBuild(_) => 0x3A,
            Op::MapBuild(_) => 0x3B,
            Op::RangeBuild => 0x3C,
            Op::IndexGet => 0x3D,
            Op::IndexSet => 0x3E,
            Op::IterOpen => 0x3F,
            Op::IterNext => 0x40,
        }
    }

    pub fn mnemonic(&self) -> &'static str {
        match self {
            Op::LoadConst(_) => "LOAD_CONST",
            Op::LoadConstWide(_) => "LOAD_CONST_W",
            Op::LoadTrue => "LOAD_TRUE",
            Op::LoadFalse => "LOAD_FALSE",
            Op::LoadNil => "LOAD_NIL",
            Op::LoadUnit => "LOAD_UNIT",
            Op::Pop => "POP",
            Op::Dup => "DUP",
            Op::LoadLocal(_) => "LOAD_LOCAL",
            Op::StoreLocal(_) => "STORE_LOCAL",
            Op::LoadGlobal(_) => "LOAD_GLOBAL",
            Op::LoadGlobalWide(_) => "LOAD_GLOBAL_W",
            Op::StoreGlobal(_) => "STORE_GLOBAL",
            Op::StoreGlobalWide(_) => "STORE_GLOBAL_W",
            Op::DefineGlobal(_) => "DEFINE_GLOBAL",
            Op::DefineGlobalWide(_) => "DEFINE_GLOBAL_W",
            Op::LoadUpvalue(_) => "LOAD_UPVALUE",
            Op::StoreUpvalue(_) => "STORE_UPVALUE",
            Op::Add => "ADD",
            Op::Sub => "SUB",
            Op::Mul => "MUL",
            Op::Div => "DIV",
            Op::Mod => "MOD",
            Op::Neg => "NEG",
            Op::BitAnd => "BIT_AND",
            Op::BitOr => "BIT_OR",
            Op::BitXor => "BIT_XOR",
            Op::BitNot => "BIT_NOT",
            Op::Shl => "SHL",
            Op::Shr => "SHR",
            Op::Not => "NOT",
            Op::LogicalAnd => "LOGICAL_AND",
            Op::LogicalOr => "LOGICAL_OR",
            Op::Eq => "EQ",
            Op::Ne => "NE",
            Op::Lt => "LT",
            Op::Le => "LE",
            Op::Gt => "GT",
            Op::Ge => "GE",
            Op::Jump(_) => "JUMP",
            Op::JumpIfFalse(_) => "JUMP_IF_FALSE",
            Op::JumpIfTrue(_) => "JUMP_IF_TRUE",
            Op::Loop(_) => "LOOP",
            Op::Call(_) => "CALL",
            Op::Return => "RETURN",
            Op::MakeClosure { .. } => "MAKE_CLOSURE",
            Op::TrySetup(_) => "TRY_SETUP",
            Op::PopHandler => "POP_HANDLER",
            Op::Throw => "THROW",
            Op::DeferRegister { .. } => "DEFER_REGISTER",
            Op::ScopeExit(_) => "SCOPE_EXIT",
            Op::StructBuild { .. } => "STRUCT_BUILD",
            Op::FieldGet(_) => "FIELD_GET",
            Op::FieldSet(_) => "FIELD_SET",
            Op::EnumBuild { .. } => "ENUM_BUILD",
            Op::VariantTest(_) => "VARIANT_TEST",
            Op::TupleBuild(_) => "TUPLE_BUILD",
            Op::ArrayBuild(_) => "ARRAY_BUILD",
            Op::MapBuild(_) => "MAP_BUILD",
            Op::RangeBuild => "RANGE_BUILD",
            Op::IndexGet => "INDEX_GET",
            Op::IndexSet => "INDEX_SET",
            Op::IterOpen => "ITER_OPEN",
            Op::IterNext => "ITER_NEXT",
        }
    }

    /// Variation nette de la profondeur de pile pour les opcodes dont
    /// l'effet ne dépend pas de l'opérande. `None` pour le reste (Call,
    /// constructeurs de collection, etc. — dépendent d'un compteur runtime).
    pub fn stack_delta(&self) -> Option<i32> {
        use Op::*;
        Some(match self {
            LoadConst(_) | LoadConstWide(_) | LoadTrue | LoadFalse | LoadNil | LoadUnit => 1,
            Dup => 1,
            Pop => -1,
            LoadLocal(_) | LoadGlobal(_) | LoadGlobalWide(_) | LoadUpvalue(_) => 1,
            StoreLocal(_) | StoreUpvalue(_) => 0,
            StoreGlobal(_) | StoreGlobalWide(_) => -1,
            DefineGlobal(_) | DefineGlobalWide(_) => -1,
            Add | Sub | Mul | Div | Mod | BitAnd | BitOr | BitXor | Shl | Shr | LogicalAnd
            | LogicalOr | Eq | Ne | Lt | Le | Gt | Ge => -1,
            Neg | BitNot | Not => 0,
            Jump(_) | Loop(_) => 0,
            JumpIfFalse(_) | JumpIfTrue(_) => -1,
            Return | Throw => 0,
            PopHandler | TrySetup(_) | ScopeExit(_) | DeferRegister { .. } => 0,
            FieldGet(_) => 0,
            FieldSet(_) => -1,
            VariantTest(_) => 0,
            RangeBuild => -2,
            IndexGet => -1,
            IndexSet => -2,
            IterOpen => 0,
            IterNext => 0,
            _ => return None,
        })
    }

    pub fn is_jump(&self) -> bool {
        matches!(self, Op::Jump(_) | Op::JumpIfFalse(_) | Op::JumpIfTrue(_) | Op::Loop(_) | Op::TrySetup(_))
    }

    pub fn is_terminator(&self) -> bool {
        matches!(self, Op::Return | Op::Throw | Op::Jump(_))
    }

    pub fn operand_kind(&self) -> OperandKind {
        use Op::*;
        match self {
            LoadTrue | LoadFalse | LoadNil | LoadUnit | Pop | Dup | Add | Sub | Mul | Div | Mod
            | Neg | BitAnd | BitOr | BitXor | BitNot | Shl | Shr | Not | LogicalAnd | LogicalOr
            | Eq | Ne | Lt | Le | Gt | Ge | Return | PopHandler | Throw | RangeBuild | IndexGet
            | IndexSet | IterOpen | IterNext => OperandKind::None,
            LoadConst(_) | LoadLocal(_) | StoreLocal(_) | LoadGlobal(_) | StoreGlobal(_)
            | DefineGlobal(_) | LoadUpvalue(_) | StoreUpvalue(_) | Call(_) | ScopeExit(_) => {
                OperandKind::U8
            }
            LoadConstWide(_) | LoadGlobalWide(_) | StoreGlobalWide(_) | DefineGlobalWide(_)
            | FieldGet(_) | FieldSet(_) | VariantTest(_) | TupleBuild(_) | ArrayBuild(_)
            | MapBuild(_) => OperandKind::U16,
            Jump(_) | JumpIfFalse(_) | JumpIfTrue(_) | Loop(_) | TrySetup(_) => OperandKind::I16,
            MakeClosure { .. } => OperandKind::U16U8,
            DeferRegister { .. } => OperandKind::I16,
            StructBuild { .. } => OperandKind::U16U8,
            EnumBuild { .. } => OperandKind::U16U16U8,
        }
    }

    /// Écrit le tag et les opérandes encodés petit-boutien dans `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.tag());
        match *self {
            Op::LoadConst(i) | Op::LoadLocal(i) | Op::StoreLocal(i) | Op::LoadGlobal(i)
            | Op::StoreGlobal(i) | Op::DefineGlobal(i) | Op::LoadUpvalue(i) | Op::StoreUpvalue(i)
            | Op::Call(i) | Op::ScopeExit(i) => out.push(i),
            Op::LoadConstWide(i) | Op::LoadGlobalWide(i) | Op::StoreGlobalWide(i)
            | Op::DefineGlobalWide(i) | Op::FieldGet(i) | Op::FieldSet(i) | Op::VariantTest(i)
            | Op::TupleBuild(i) | Op::ArrayBuild(i) | Op::MapBuild(i) => {
                out.extend_from_slice(&i.to_le_bytes());
            }
            Op::Jump(off) | Op::JumpIfFalse(off) | Op::JumpIfTrue(off) | Op::Loop(off)
            | Op::TrySetup(off) => out.extend_from_slice(&off.to_le_bytes()),
            Op::MakeClosure { chunk_const, upvalue_count } => {
                out.extend_from_slice(&chunk_const.to_le_bytes());
                out.push(upvalue_count);
            }
            Op::DeferRegister { body_offset, scope_depth } => {
                out.extend_from_slice(&body_offset.to_le_bytes());
                out.push(scope_depth);
            }
            Op::StructBuild { type_name_const, field_count } => {
                out.extend_from_slice(&type_name_const.to_le_bytes());
                out.push(field_count);
            }
            Op::EnumBuild { enum_name_const, variant_name_const, payload_count } => {
                out.extend_from_slice(&enum_name_const.to_le_bytes());
                out.extend_from_slice(&variant_name_const.to_le_bytes());
                out.push(payload_count);
            }
            _ => {}
        }
    }

    /// Décode l'instruction commençant à `code[pc]`. Rend l'opcode et le
    /// nombre total d'octets consommés (tag compris). `None` si `pc` sort des
    /// bornes ou si le tag est inconnu.
    pub fn decode(code: &[u8], pc: usize) -> Option<(Op, usize)> {
        let tag = *code.get(pc)?;
        let rest = &code[pc + 1..];
        let u8_at = |o: usize| -> Option<u8> { rest.get(o).copied() };
        let u16_at = |o: usize| -> Option<u16> {
            Some(u16::from_le_bytes([*rest.get(o)?, *rest.get(o + 1)?]))
        };
        let i16_at = |o: usize| -> Option<i16> { u16_at(o).map(|v| v as i16) };

        let (op, operand_len) = match tag {
            0x01 => (Op::LoadConst(u8_at(0)?), 1),
            0x02 => (Op::LoadConstWide(u16_at(0)?), 2),
            0x03 => (Op::LoadTrue, 0),
            0x04 => (Op::LoadFalse, 0),
            0x05 => (Op::LoadNil, 0),
            0x06 => (Op::LoadUnit, 0),
            0x07 => (Op::Pop, 0),
            0x08 => (Op::Dup, 0),
            0x09 => (Op::LoadLocal(u8_at(0)?), 1),
            0x0A => (Op::StoreLocal(u8_at(0)?), 1),
            0x0B => (Op::LoadGlobal(u8_at(0)?), 1),
            0x0C => (Op::LoadGlobalWide(u16_at(0)?), 2),
            0x0D => (Op::StoreGlobal(u8_at(0)?), 1),
            0x0E => (Op::StoreGlobalWide(u16_at(0)?), 2),
            0x0F => (Op::DefineGlobal(u8_at(0)?), 1),
            0x10 => (Op::DefineGlobalWide(u16_at(0)?), 2),
            0x11 => (Op::LoadUpvalue(u8_at(0)?), 1),
            0x12 => (Op::StoreUpvalue(u8_at(0)?), 1),
            0x13 => (Op::Add, 0),
            0x14 => (Op::Sub, 0),
            0x15 => (Op::Mul, 0),
            0x16 => (Op::Div, 0),
            0x17 => (Op::Mod, 0),
            0x18 => (Op::Neg, 0),
            0x19 => (Op::BitAnd, 0),
            0x1A => (Op::BitOr, 0),
            0x1B => (Op::BitXor, 0),
            0x1C => (Op::BitNot, 0),
            0x1D => (Op::Shl, 0),
            0x1E => (Op::Shr, 0),
            0x1F => (Op::Not, 0),
            0x20 => (Op::LogicalAnd, 0),
            0x21 => (Op::LogicalOr, 0),
            0x22 => (Op::Eq, 0),
            0x23 => (Op::Ne, 0),
            0x24 => (Op::Lt, 0),
            0x25 => (Op::Le, 0),
            0x26 => (Op::Gt, 0),
            0x27 => (Op::Ge, 0),
            0x28 => (Op::Jump(i16_at(0)?), 2),
            0x29 => (Op::JumpIfFalse(i16_at(0)?), 2),
            0x2A => (Op::JumpIfTrue(i16_at(0)?), 2),
            0x2B => (Op::Loop(i16_at(0)?), 2),
            0x2C => (Op::Call(u8_at(0)?), 1),
            0x2D => (Op::Return, 0),
            0x2E => (
                Op::MakeClosure { chunk_const: u16_at(0)?, upvalue_count: u8_at(2)? },
                3,
            ),
            0x2F => (Op::TrySetup(i16_at(0)?), 2),
            0x30 => (Op::PopHandler, 0),
            0x31 => (Op::Throw, 0),
            0x32 => (
                Op::DeferRegister { body_offset: i16_at(0)?, scope_depth: u8_at(2)? },
                3,
            ),
            0x33 => (Op::ScopeExit(u8_at(0)?), 1),
            0x34 => (
                Op::StructBuild { type_name_const: u16_at(0)?, field_count: u8_at(2)? },
                3,
            ),
            0x35 => (Op::FieldGet(u16_at(0)?), 2),
            0x36 => (Op::FieldSet(u16_at(0)?), 2),
            0x37 => (
                Op::EnumBuild {
                    enum_name_const: u16_at(0)?,
                    variant_name_const: u16_at(2)?,
                    payload_count: u8_at(4)?,
                },
                5,
            ),
            0x38 => (Op::VariantTest(u16_at(0)?), 2),
            0x39 => (Op::TupleBuild(u16_at(0)?), 2),
            0x3A => (Op::ArrayBuild(u16_at(0)?), 2),
            0x3B => (Op::MapBuild(u16_at(0)?), 2),
            0x3C => (Op::RangeBuild, 0),
            0x3D => (Op::IndexGet, 0),
            0x3E => (Op::IndexSet, 0),
            0x3F => (Op::IterOpen, 0),
            0x40 => (Op::IterNext, 0),
            _ => return None,
        };
        Some((op, operand_len + 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(op: Op) {
        let mut buf = Vec::new();
        op.encode(&mut buf);
        let (decoded, len) = Op::decode(&buf, 0).expect("decode");
        assert_eq!(len, buf.len());
        assert_eq!(decoded, op);
    }

    #[test]
    fn narrow_and_wide_roundtrip() {
        roundtrip(Op::LoadConst(9));
        roundtrip(Op::LoadConstWide(4000));
        roundtrip(Op::Jump(-12));
        roundtrip(Op::Call(3));
        roundtrip(Op::MakeClosure { chunk_const: 2, upvalue_count: 3 });
        roundtrip(Op::StructBuild { type_name_const: 1, field_count: 2 });
        roundtrip(Op::EnumBuild { enum_name_const: 1, variant_name_const: 2, payload_count: 1 });
        roundtrip(Op::DeferRegister { body_offset: 10, scope_depth: 2 });
    }

    #[test]
    fn decode_rejects_unknown_tag() {
        assert!(Op::decode(&[0xFF], 0).is_none());
    }

    #[test]
    fn decode_rejects_truncated_operand() {
        assert!(Op::decode(&[0x01], 0).is_none());
    }

    #[test]
    fn mnemonic_is_stable_per_variant() {
        assert_eq!(Op::Add.mnemonic(), "ADD");
        assert_eq!(Op::LoadConst(0).mnemonic(), "LOAD_CONST");
    }
}
