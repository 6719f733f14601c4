//! Little-endian packing primitives shared by Dirs, Msgs and frames.

use crate::error::{ZxError, ZxResult};

/// Largest packed message accepted from a peer.
pub const MAX_MSG_SIZE: usize = 64 * 1024;

/// Chunk size used when streaming file data.
pub const MSG_SIZE: usize = 16 * 1024;

/// Largest number of attributes accepted in a packed Dir.
pub const MAX_DIR_ATTRS: usize = 1024;

pub fn too_small() -> ZxError {
    ZxError::proto("truncated message")
}

pub fn too_large() -> ZxError {
    ZxError::proto("message size is too large")
}

pub fn put_u8(buf: &mut Vec<u8>, v: u8) {
    buf.push(v);
}

pub fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn put_i64(buf: &mut Vec<u8>, v: i64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

/// Strings are a 2-byte length followed by the bytes.
pub fn put_str(buf: &mut Vec<u8>, s: &str) -> ZxResult<()> {
    let n = u16::try_from(s.len()).map_err(|_| ZxError::proto("string too long"))?;
    put_u16(buf, n);
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

/// Cursor over a received buffer.
#[derive(Debug, Clone, Copy)]
pub struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> &'a [u8] {
        self.buf
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take(&mut self, n: usize) -> ZxResult<&'a [u8]> {
        if self.buf.len() < n {
            return Err(too_small());
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub fn u8(&mut self) -> ZxResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> ZxResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> ZxResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn i64(&mut self) -> ZxResult<i64> {
        let b = self.take(8)?;
        let mut a = [0u8; 8];
        a.copy_from_slice(b);
        Ok(i64::from_le_bytes(a))
    }

    pub fn bytes(&mut self, n: usize) -> ZxResult<&'a [u8]> {
        self.take(n)
    }

    pub fn str(&mut self) -> ZxResult<String> {
        let n = self.u16()? as usize;
        let b = self.take(n)?;
        String::from_utf8(b.to_vec()).map_err(|_| ZxError::proto("bad utf-8 string"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strings_and_ints() {
        let mut b = Vec::new();
        put_str(&mut b, "hola").unwrap();
        put_u32(&mut b, 7);
        put_i64(&mut b, -1);
        assert_eq!(&b[0..2], &[4, 0]);
        let mut r = Reader::new(&b);
        assert_eq!(r.str().unwrap(), "hola");
        assert_eq!(r.u32().unwrap(), 7);
        assert_eq!(r.i64().unwrap(), -1);
        assert!(r.is_empty());
    }

    #[test]
    fn test_truncated() {
        let mut r = Reader::new(&[5, 0, b'a']);
        let err = r.str().unwrap_err();
        assert_eq!(err.to_string(), "truncated message");
    }

    #[test]
    fn test_long_string_rejected() {
        let s = "x".repeat(70_000);
        assert!(put_str(&mut Vec::new(), &s).is_err());
    }
}
