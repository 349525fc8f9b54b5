//! disasm.rs — désassembleur texte, pure commodité de débogage (§4.2
//! [EXPANDED]). N'influence ni l'exécution ni le format binaire.

use std::fmt::Write as _;

use crate::bytecode::chunk::Chunk;
use crate::bytecode::ops::Op;

pub fn disassemble_chunk(chunk: &Chunk) -> String {
    let mut out = String::new();
    let title = chunk.name().unwrap_or("<anonymous>");
    let _ = writeln!(out, "== {title} ==");

    let code = chunk.code();
    let mut pc = 0usize;
    while pc < code.len() {
        match Op::decode(code, pc) {
            Some((op, width)) => {
                let line = chunk.line_at(pc).unwrap_or(0);
                write_instruction(&mut out, chunk, pc, line, &op);
                pc += width;
                if let Op::MakeClosure { upvalue_count, .. } = op {
                    for i in 0..upvalue_count as usize {
                        let is_local = code.get(pc + 2 * i).copied().unwrap_or(0) != 0;
                        let index = code.get(pc + 2 * i + 1).copied().unwrap_or(0);
                        let _ = writeln!(
                            out,
                            "        | {} {index}",
                            if is_local { "local" } else { "upvalue" }
                        );
                    }
                    pc += 2 * upvalue_count as usize;
                }
            }
            None => {
                let _ = writeln!(out, "{pc:04}    ???  <undecodable byte 0x{:02x}>", code[pc]);
                pc += 1;
            }
        }
    }
    out
}

fn write_instruction(out: &mut String, chunk: &Chunk, pc: usize, line: u32, op: &Op) {
    let _ = write!(out, "{pc:04} {line:>4} {:<16}", op.mnemonic());
    match *op {
        Op::LoadConst(i) => describe_const(out, chunk, i as u32),
        Op::LoadConstWide(i) => describe_const(out, chunk, i as u32),
        Op::LoadLocal(i) | Op::StoreLocal(i) => describe_local(out, chunk, i as u32),
        Op::LoadGlobal(i) | Op::StoreGlobal(i) | Op::DefineGlobal(i) => {
            let _ = write!(out, "#{i}");
        }
        Op::LoadGlobalWide(i) | Op::StoreGlobalWide(i) | Op::DefineGlobalWide(i) => {
            let _ = write!(out, "#{i}");
        }
        Op::LoadUpvalue(i) | Op::StoreUpvalue(i) => {
            let _ = write!(out, "^{i}");
        }
        Op::Jump(off) | Op::JumpIfFalse(off) | Op::JumpIfTrue(off) | Op::Loop(off) | Op::TrySetup(off) => {
            let _ = write!(out, "{off:+} (target unresolved without width)");
        }
        Op::Call(argc) => {
            let _ = write!(out, "argc={argc}");
        }
        Op::MakeClosure { chunk_const, upvalue_count } => {
            let _ = write!(out, "const=#{chunk_const} upvalues={upvalue_count}");
        }
        Op::DeferRegister { body_offset, scope_depth } => {
            let _ = write!(out, "body={body_offset:+} depth={scope_depth}");
        }
        Op::ScopeExit(depth) => {
            let _ = write!(out, "depth={depth}");
        }
        Op::StructBuild { type_name_const, field_count } => {
            let _ = write!(out, "type=#{type_name_const} fields={field_count}");
        }
        Op::FieldGet(i) | Op::FieldSet(i) | Op::VariantTest(i) => describe_const(out, chunk, i as u32),
        Op::EnumBuild { enum_name_const, variant_name_const, payload_count } => {
            let _ = write!(out, "enum=#{enum_name_const} variant=#{variant_name_const} payload={payload_count}");
        }
        Op::TupleBuild(n) | Op::ArrayBuild(n) | Op::MapBuild(n) => {
            let _ = write!(out, "count={n}");
        }
        _ => {}
    }
    out.push('\n');
}

fn describe_const(out: &mut String, chunk: &Chunk, idx: u32) {
    match chunk.constants().get(idx as usize) {
        Some(v) => {
            let _ = write!(out, "#{idx} ({v})");
        }
        None => {
            let _ = write!(out, "#{idx} (<out of range>)");
        }
    }
}

fn describe_local(out: &mut String, chunk: &Chunk, slot: u32) {
    match chunk.local_names().get(slot as usize).and_then(|n| n.as_deref()) {
        Some(name) => {
            let _ = write!(out, "slot {slot} ({name})");
        }
        None => {
            let _ = write!(out, "slot {slot}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn disassembly_contains_mnemonics_and_resolved_constants() {
        let mut c = Chunk::with_name("main");
        let k = c.add_constant(Value::int(7));
        c.append_op(Op::LoadConst(k as u8), 1);
        c.append_op(Op::Return, 1);
        let text = disassemble_chunk(&c);
        assert!(text.contains("LOAD_CONST"));
        assert!(text.contains("(7)"));
        assert!(text.contains("RETURN"));
    }
}
