//! util.rs — petits outils transverses partagés par `bytecode::codec` et
//! `bytecode::disasm` : curseurs little-endian sur slice, buffer d'écriture,
//! échappement de chaînes pour l'affichage, hexdump.
//!
//! Pas de dépendance externe ; pur `std`.

use std::fmt;

/// Curseur de lecture little-endian sur un slice, sans allocation.
pub struct CursorLE<'a> {
    buf: &'a [u8],
    off: usize,
}

impl<'a> CursorLE<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, off: 0 }
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.off)
    }

    #[inline]
    pub fn pos(&self) -> usize {
        self.off
    }

    #[inline]
    pub fn read_exact(&mut self, n: usize) -> Result<&'a [u8], CodecIoError> {
        if self.off + n > self.buf.len() {
            return Err(CodecIoError::Eof { want: n, have: self.remaining() });
        }
        let s = &self.buf[self.off..self.off + n];
        self.off += n;
        Ok(s)
    }

    #[inline]
    pub fn read_u8(&mut self) -> Result<u8, CodecIoError> {
        Ok(self.read_exact(1)?[0])
    }

    #[inline]
    pub fn read_u16(&mut self) -> Result<u16, CodecIoError> {
        Ok(u16::from_le_bytes(self.read_exact(2)?.try_into().unwrap()))
    }

    #[inline]
    pub fn read_u32(&mut self) -> Result<u32, CodecIoError> {
        Ok(u32::from_le_bytes(self.read_exact(4)?.try_into().unwrap()))
    }

    #[inline]
    pub fn read_i64(&mut self) -> Result<i64, CodecIoError> {
        Ok(i64::from_le_bytes(self.read_exact(8)?.try_into().unwrap()))
    }

    #[inline]
    pub fn read_u64(&mut self) -> Result<u64, CodecIoError> {
        Ok(u64::from_le_bytes(self.read_exact(8)?.try_into().unwrap()))
    }

    /// Lit une chaîne préfixée par une longueur u32. Les octets ne sont
    /// jamais validés comme utf8 strict : une séquence invalide est
    /// acceptée via un remplacement avec perte (U+FFFD), pas rejetée — une
    /// valeur `String` de Lattice est une séquence d'octets "utf8 par
    /// convention", jamais par contrainte (§3).
    pub fn read_lp_string(&mut self, max_len: u32) -> Result<String, CodecIoError> {
        let len = self.read_u32()?;
        if len > max_len {
            return Err(CodecIoError::TooLong { len, max: max_len });
        }
        let bytes = self.read_exact(len as usize)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    pub fn read_lp_bytes(&mut self, max_len: u32) -> Result<Vec<u8>, CodecIoError> {
        let len = self.read_u32()?;
        if len > max_len {
            return Err(CodecIoError::TooLong { len, max: max_len });
        }
        Ok(self.read_exact(len as usize)?.to_vec())
    }
}

/// Buffer d'écriture little-endian, simple wrapper sur `Vec<u8>`.
#[derive(Default)]
pub struct BufLE {
    pub buf: Vec<u8>,
}

impl BufLE {
    pub fn with_capacity(n: usize) -> Self {
        Self { buf: Vec::with_capacity(n) }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    #[inline]
    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    #[inline]
    pub fn write_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    #[inline]
    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    #[inline]
    pub fn write_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    #[inline]
    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_lp_string(&mut self, s: &str) {
        self.write_u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
    }

    pub fn write_lp_bytes(&mut self, b: &[u8]) {
        self.write_u32(b.len() as u32);
        self.buf.extend_from_slice(b);
    }
}

#[derive(Debug, Clone, Copy)]
pub enum CodecIoError {
    Eof { want: usize, have: usize },
    TooLong { len: u32, max: u32 },
}

impl fmt::Display for CodecIoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecIoError::Eof { want, have } => write!(f, "unexpected end of data: wanted {want} bytes, had {have}"),
            CodecIoError::TooLong { len, max } => write!(f, "length prefix {len} exceeds limit {max}"),
        }
    }
}

impl std::error::Error for CodecIoError {}

/// Échappe une chaîne pour un affichage `value_repr`/disasm sûr.
pub fn escape_str(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 8);
    for ch in s.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = fmt::Write::write_fmt(&mut out, format_args!("\\u{{{:x}}}", c as u32));
            }
            c => out.push(c),
        }
    }
    out
}

/// Dump hex multi-ligne lisible (adresse + 16 octets + ASCII) — débogage `.latc`.
pub fn hex_dump(bytes: &[u8], start_addr: usize) -> String {
    const W: usize = 16;
    let mut s = String::new();
    for (i, chunk) in bytes.chunks(W).enumerate() {
        let addr = start_addr + i * W;
        let _ = fmt::Write::write_fmt(&mut s, format_args!("{addr:08x}  "));
        for (j, slot) in chunk.iter().enumerate() {
            let _ = fmt::Write::write_fmt(&mut s, format_args!("{slot:02x} "));
            if j == 7 {
                s.push(' ');
            }
        }
        s.push('\n');
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_and_buf_roundtrip() {
        let mut b = BufLE::with_capacity(64);
        b.write_u8(7);
        b.write_u16(0xBEEF);
        b.write_u32(0xDEAD_BEEF);
        b.write_i64(-42);
        b.write_lp_string("hi");

        let bytes = b.into_inner();
        let mut cur = CursorLE::new(&bytes);
        assert_eq!(cur.read_u8().unwrap(), 7);
        assert_eq!(cur.read_u16().unwrap(), 0xBEEF);
        assert_eq!(cur.read_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(cur.read_i64().unwrap(), -42);
        assert_eq!(cur.read_lp_string(16).unwrap(), "hi");
    }

    #[test]
    fn truncated_read_errors() {
        let bytes = [1u8, 2, 3];
        let mut cur = CursorLE::new(&bytes);
        assert!(cur.read_u32().is_err());
    }

    #[test]
    fn read_lp_string_accepts_invalid_utf8_with_lossy_replacement() {
        let mut b = BufLE::with_capacity(16);
        let invalid = [0xFFu8, 0xFE, b'h', b'i'];
        b.write_lp_bytes(&invalid);
        let bytes = b.into_inner();
        let mut cur = CursorLE::new(&bytes);
        // `write_lp_bytes`/`read_lp_string` share the same u32-length-prefix
        // framing, so a raw byte sequence can be read back as a (lossy) string.
        let s = cur.read_lp_string(16).unwrap();
        assert_eq!(s, "\u{FFFD}\u{FFFD}hi");
    }
}
