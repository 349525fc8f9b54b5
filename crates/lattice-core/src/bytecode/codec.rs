//! codec.rs — le format binaire déterministe `.latc` (§4.3).
//!
//! Framing du conteneur : 4 octets magiques `LATC`, version u16 petit-boutien
//! (constante courante 1), 2 octets réservés (écrits à zéro, ignorés en
//! lecture même non nuls). Suit la charge utile du chunk racine ; les
//! sous-chunks de fermeture sont sérialisés récursivement sans en-tête
//! (seul l'artefact de plus haut niveau porte le magic/version).
//!
//! Déterminisme : à chunk égal, deux sérialisations produisent des octets
//! identiques — aucun horodatage, aucun remplissage aléatoire, aucun ordre
//! dépendant d'un hachage (§8 propriété 1).

use std::sync::Arc;

use crate::bytecode::chunk::Chunk;
use crate::error::{CompileError, LatticeError, Result};
use crate::util::{BufLE, CursorLE};
use crate::value::{ClosureObj, Value};

pub const MAGIC: [u8; 4] = *b"LATC";
pub const FORMAT_VERSION: u16 = 1;

const TAG_INT: u8 = 0;
const TAG_FLOAT: u8 = 1;
const TAG_BOOL: u8 = 2;
const TAG_STRING: u8 = 3;
const TAG_NIL: u8 = 4;
const TAG_UNIT: u8 = 5;
const TAG_CLOSURE: u8 = 6;

/// Longueur maximale acceptée pour un préfixe de chaîne/nom, avant d'être
/// traitée comme une tentative de corruption plutôt qu'un fichier légitime.
const MAX_NAME_LEN: u32 = 64 * 1024 * 1024;

/// Sérialise `chunk` en un artefact `.latc` complet (magic + version + charge).
pub fn serialize(chunk: &Chunk) -> Result<Vec<u8>> {
    #[cfg(feature = "tracing")]
    tracing::debug!(target: "lattice_core::codec", chunk = chunk.name().unwrap_or("<anonymous>"), "serializing chunk");
    let mut buf = BufLE::with_capacity(chunk.code().len() * 2 + 64);
    buf.buf.extend_from_slice(&MAGIC);
    buf.write_u16(FORMAT_VERSION);
    buf.write_u16(0); // réservé
    write_chunk_payload(chunk, &mut buf)?;
    Ok(buf.into_inner())
}

/// Désérialise un artefact `.latc` complet (en-tête + charge) en un `Chunk`.
pub fn deserialize(bytes: &[u8]) -> Result<Chunk> {
    if bytes.len() < 8 {
        return Err(LatticeError::from(CompileError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "stream shorter than the 8-byte .latc header",
        ))));
    }
    let mut cur = CursorLE::new(bytes);
    let magic: [u8; 4] = cur.read_exact(4).map_err(CompileError::Codec)?.try_into().unwrap();
    if magic != MAGIC {
        return Err(LatticeError::from(CompileError::BadMagic { found: magic }));
    }
    let version = cur.read_u16().map_err(CompileError::Codec)?;
    if version != FORMAT_VERSION {
        return Err(LatticeError::from(CompileError::UnsupportedVersion {
            found: version,
            supported: FORMAT_VERSION,
        }));
    }
    let _reserved = cur.read_u16().map_err(CompileError::Codec)?;

    let chunk = read_chunk_payload(&mut cur)?;

    if cur.remaining() != 0 {
        return Err(LatticeError::from(CompileError::TrailingBytes { extra: cur.remaining() }));
    }
    #[cfg(feature = "tracing")]
    tracing::debug!(target: "lattice_core::codec", chunk = chunk.name().unwrap_or("<anonymous>"), "loaded chunk");
    Ok(chunk)
}

fn write_chunk_payload(chunk: &Chunk, buf: &mut BufLE) -> Result<()> {
    buf.write_u32(chunk.code().len() as u32);
    buf.buf.extend_from_slice(chunk.code());

    buf.write_u32(chunk.lines().len() as u32);
    for line in chunk.lines() {
        buf.write_u32(*line);
    }

    buf.write_u32(chunk.constants().len() as u32);
    for constant in chunk.constants() {
        write_constant(constant, buf)?;
    }

    buf.write_u32(chunk.local_names().len() as u32);
    for slot in chunk.local_names() {
        match slot {
            Some(name) => {
                buf.write_u8(1);
                buf.write_lp_string(name);
            }
            None => buf.write_u8(0),
        }
    }

    match chunk.name() {
        Some(name) => {
            buf.write_u8(1);
            buf.write_lp_string(name);
        }
        None => buf.write_u8(0),
    }
    Ok(())
}

fn read_chunk_payload(cur: &mut CursorLE<'_>) -> Result<Chunk> {
    let code_len = cur.read_u32().map_err(CompileError::Codec)?;
    let code = cur.read_exact(code_len as usize).map_err(CompileError::Codec)?.to_vec();

    let line_count = cur.read_u32().map_err(CompileError::Codec)?;
    if line_count != code_len {
        return Err(LatticeError::from(CompileError::LineTableMismatch {
            code: code_len as usize,
            lines: line_count as usize,
        }));
    }
    let mut lines = Vec::with_capacity(line_count as usize);
    for _ in 0..line_count {
        lines.push(cur.read_u32().map_err(CompileError::Codec)?);
    }

    let const_count = cur.read_u32().map_err(CompileError::Codec)?;
    let mut constants = Vec::with_capacity(const_count as usize);
    for _ in 0..const_count {
        constants.push(read_constant(cur)?);
    }

    let local_cap = cur.read_u32().map_err(CompileError::Codec)?;
    let mut local_names = Vec::with_capacity(local_cap as usize);
    for _ in 0..local_cap {
        let present = cur.read_u8().map_err(CompileError::Codec)?;
        if present != 0 {
            local_names.push(Some(Arc::from(cur.read_lp_string(MAX_NAME_LEN).map_err(CompileError::Codec)?)));
        } else {
            local_names.push(None);
        }
    }

    let has_name = cur.read_u8().map_err(CompileError::Codec)?;
    let name = if has_name != 0 {
        Some(Arc::<str>::from(cur.read_lp_string(MAX_NAME_LEN).map_err(CompileError::Codec)?))
    } else {
        None
    };

    Ok(Chunk::from_raw_parts(code, lines, constants, local_names, name))
}

fn write_constant(value: &Value, buf: &mut BufLE) -> Result<()> {
    match value {
        Value::Int(i) => {
            buf.write_u8(TAG_INT);
            buf.write_i64(*i);
        }
        Value::Float(f) => {
            buf.write_u8(TAG_FLOAT);
            buf.write_u64(f.to_bits());
        }
        Value::Bool(b) => {
            buf.write_u8(TAG_BOOL);
            buf.write_u8(u8::from(*b));
        }
        Value::String(s) => {
            buf.write_u8(TAG_STRING);
            buf.write_lp_string(s);
        }
        Value::Nil => buf.write_u8(TAG_NIL),
        Value::Unit => buf.write_u8(TAG_UNIT),
        Value::Closure(c) => {
            buf.write_u8(TAG_CLOSURE);
            buf.write_u32(c.param_count);
            buf.write_u8(u8::from(c.variadic));
            let body = c.body.as_ref().ok_or_else(|| {
                LatticeError::internal("a native closure cannot appear in a serialized constant pool")
            })?;
            write_chunk_payload(body, buf)?;
        }
        Value::Map(_) => return Err(LatticeError::from(CompileError::MapConstantForbidden)),
        other => {
            return Err(LatticeError::from(CompileError::NonSerializableConstant {
                kind: other.value_kind().name(),
            }));
        }
    }
    Ok(())
}

fn read_constant(cur: &mut CursorLE<'_>) -> Result<Value> {
    let tag = cur.read_u8().map_err(CompileError::Codec)?;
    Ok(match tag {
        TAG_INT => Value::int(cur.read_i64().map_err(CompileError::Codec)?),
        TAG_FLOAT => Value::float(f64::from_bits(cur.read_u64().map_err(CompileError::Codec)?)),
        TAG_BOOL => Value::bool(cur.read_u8().map_err(CompileError::Codec)? != 0),
        TAG_STRING => Value::string(cur.read_lp_string(MAX_NAME_LEN).map_err(CompileError::Codec)?),
        TAG_NIL => Value::Nil,
        TAG_UNIT => Value::Unit,
        TAG_CLOSURE => {
            let param_count = cur.read_u32().map_err(CompileError::Codec)?;
            let variadic = cur.read_u8().map_err(CompileError::Codec)? != 0;
            let body = read_chunk_payload(cur)?;
            Value::Closure(Arc::new(ClosureObj {
                param_count,
                param_names: None,
                variadic,
                defaults: Vec::new(),
                body: Some(Arc::new(body)),
                upvalues: Vec::new(),
                native: None,
                name: None,
            }))
        }
        other => return Err(LatticeError::from(CompileError::UnknownConstantTag { tag: other })),
    })
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::bytecode::ops::Op;

    fn sample_chunk() -> Chunk {
        let mut c = Chunk::with_name("main");
        let k = c.add_constant(Value::int(42));
        c.append_op(Op::LoadConst(k as u8), 1);
        c.append_op(Op::Return, 1);
        c.set_local_name(0, "x");
        c
    }

    #[test]
    fn roundtrip_preserves_code_lines_constants() {
        let chunk = sample_chunk();
        let bytes = serialize(&chunk).unwrap();
        let back = deserialize(&bytes).unwrap();
        assert_eq!(chunk.code(), back.code());
        assert_eq!(chunk.lines(), back.lines());
        assert_eq!(chunk.constants().len(), back.constants().len());
        assert_eq!(chunk.name(), back.name());
        assert_eq!(chunk.local_names().len(), back.local_names().len());
    }

    #[test]
    fn serialization_is_deterministic() {
        let chunk = sample_chunk();
        assert_eq!(serialize(&chunk).unwrap(), serialize(&chunk).unwrap());
    }

    #[test]
    fn recursive_closure_constant_roundtrips() {
        let mut inner = Chunk::with_name("inner");
        inner.append_op(Op::LoadUnit, 1);
        inner.append_op(Op::Return, 1);

        let mut outer = Chunk::with_name("outer");
        outer.add_constant(Value::Closure(Arc::new(ClosureObj {
            param_count: 0,
            param_names: None,
            variadic: false,
            defaults: Vec::new(),
            body: Some(Arc::new(inner)),
            upvalues: Vec::new(),
            native: None,
            name: Some(Arc::from("inner")),
        })));

        let bytes = serialize(&outer).unwrap();
        let back = deserialize(&bytes).unwrap();
        match &back.constants()[0] {
            Value::Closure(c) => {
                let body = c.body.as_ref().unwrap();
                assert_eq!(body.name(), Some("inner"));
                assert_eq!(body.code().len(), 2);
            }
            _ => panic!("expected closure constant"),
        }
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = serialize(&sample_chunk()).unwrap();
        bytes[0] = b'X';
        assert!(deserialize(&bytes).is_err());
    }

    #[test]
    fn rejects_wrong_version() {
        let mut bytes = serialize(&sample_chunk()).unwrap();
        bytes[4] = 0xFF;
        assert!(deserialize(&bytes).is_err());
    }

    #[test]
    fn rejects_every_truncation_point() {
        let bytes = serialize(&sample_chunk()).unwrap();
        for len in 0..bytes.len() {
            assert!(deserialize(&bytes[..len]).is_err(), "truncation at {len} should fail");
        }
    }

    #[test]
    fn rejects_unknown_constant_tag() {
        let mut bytes = serialize(&sample_chunk()).unwrap();
        // Trouve l'octet de tag de la première constante et le corrompt.
        // header(8) + code_len(4) + code(2) + line_count(4) + lines(2*4) = 22
        let const_count_offset = 22;
        let tag_offset = const_count_offset + 4;
        bytes[tag_offset] = 0x7F;
        assert!(deserialize(&bytes).is_err());
    }

    #[test]
    fn rejects_trailing_bytes() {
        let mut bytes = serialize(&sample_chunk()).unwrap();
        bytes.push(0);
        assert!(deserialize(&bytes).is_err());
    }

    #[test]
    fn map_constant_is_rejected_at_serialize_time() {
        let mut c = Chunk::new();
        c.add_constant(Value::Map(Arc::new(parking_lot::RwLock::new(ahash::AHashMap::default()))));
        assert!(serialize(&c).is_err());
    }

    proptest! {
        /// For any scalar constant pool a compiler could plausibly emit,
        /// serialize→deserialize→serialize is the identity on the second
        /// pass (§8 property 1: determinism) and the constants survive
        /// with their exact value (§8 property 2: round-trip fidelity).
        #[test]
        fn scalar_constant_pools_roundtrip(
            ints in prop::collection::vec(any::<i64>(), 0..8),
            bools in prop::collection::vec(any::<bool>(), 0..8),
            strings in prop::collection::vec("[a-zA-Z0-9_ ]{0,24}", 0..8),
            chunk_name in prop::option::of("[a-zA-Z_][a-zA-Z0-9_]{0,16}"),
        ) {
            let mut chunk = match &chunk_name {
                Some(n) => Chunk::with_name(n.as_str()),
                None => Chunk::new(),
            };
            for i in &ints {
                let idx = chunk.add_constant(Value::int(*i));
                chunk.append_op(Op::LoadConst(idx as u8), 1);
                chunk.append_op(Op::Pop, 1);
            }
            for b in &bools {
                let idx = chunk.add_constant(Value::bool(*b));
                chunk.append_op(Op::LoadConst(idx as u8), 2);
                chunk.append_op(Op::Pop, 2);
            }
            for s in &strings {
                let idx = chunk.add_constant(Value::string(s.as_str()));
                chunk.append_op(Op::LoadConst(idx as u8), 3);
                chunk.append_op(Op::Pop, 3);
            }
            chunk.append_op(Op::LoadUnit, 4);
            chunk.append_op(Op::Return, 4);

            let bytes = serialize(&chunk).unwrap();
            let back = deserialize(&bytes).unwrap();
            let bytes_again = serialize(&back).unwrap();

            prop_assert_eq!(&bytes, &bytes_again);
            prop_assert_eq!(chunk.code(), back.code());
            prop_assert_eq!(chunk.lines(), back.lines());
            prop_assert_eq!(chunk.name(), back.name());
            prop_assert_eq!(chunk.constants().len(), back.constants().len());
            for (a, b) in chunk.constants().iter().zip(back.constants()) {
                prop_assert!(a.value_eq(b));
            }
        }

        /// Any byte string that isn't exactly a valid `.latc` artifact must
        /// be rejected, never panic (§8 property 3: robust header/body
        /// validation over untrusted input).
        #[test]
        fn arbitrary_bytes_never_panic_on_deserialize(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
            let _ = deserialize(&bytes);
        }
    }
}
