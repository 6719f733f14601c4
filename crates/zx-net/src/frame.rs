//! Wire frames.
//!
//! ```text
//! len:u32le | type:u8 | tag:u32le | payload
//! ```
//!
//! `len` counts everything after itself. The tag holds the call id in its
//! low 28 bits and the [`FIRST`], [`RPC`], [`FLOW`] and [`END`] flags above.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use zx_core::Dir;
use zx_core::ZxResult;
use zx_core::codec::{self, MAX_MSG_SIZE, Reader};

/// Opens a call.
pub const FIRST: u32 = 1 << 31;
/// The caller expects replies.
pub const RPC: u32 = 1 << 30;
/// Flow-control grant; the payload is the number of frames granted.
pub const FLOW: u32 = 1 << 29;
/// Closes the sender's half; the payload is the error text, if any.
pub const END: u32 = 1 << 28;

pub const FLAGS: u32 = FIRST | RPC | FLOW | END;
pub const ID_MASK: u32 = !FLAGS;

/// Bytes after the length: type and tag.
const HDR_SIZE: usize = 5;

const T_RAW: u8 = 0;
const T_BYTES: u8 = 1;
const T_STR: u8 = 2;
const T_ERR: u8 = 3;
const T_DIR: u8 = 4;
const T_MSG: u8 = 5;

/// Typed frame payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Data {
    /// Untyped bytes (auth exchange, flow grants).
    Raw(Vec<u8>),
    /// File data; an empty chunk terminates a sub-stream.
    Bytes(Vec<u8>),
    Str(String),
    /// Error text.
    Err(String),
    Dir(Dir),
    /// A packed request, decoded by the protocol layer.
    Msg(Vec<u8>),
}

impl Data {
    /// The empty-body terminator.
    pub fn empty() -> Self {
        Data::Bytes(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Data::Bytes(b) | Data::Raw(b) if b.is_empty())
    }

    fn type_id(&self) -> u8 {
        match self {
            Data::Raw(_) => T_RAW,
            Data::Bytes(_) => T_BYTES,
            Data::Str(_) => T_STR,
            Data::Err(_) => T_ERR,
            Data::Dir(_) => T_DIR,
            Data::Msg(_) => T_MSG,
        }
    }

    fn pack_into(&self, buf: &mut Vec<u8>) -> ZxResult<()> {
        match self {
            Data::Raw(b) | Data::Bytes(b) | Data::Msg(b) => buf.extend_from_slice(b),
            Data::Str(s) | Data::Err(s) => codec::put_str(buf, s)?,
            Data::Dir(d) => d.pack_into(buf)?,
        }
        Ok(())
    }

    fn unpack(typ: u8, payload: Vec<u8>) -> ZxResult<Data> {
        Ok(match typ {
            T_RAW => Data::Raw(payload),
            T_BYTES => Data::Bytes(payload),
            T_STR | T_ERR => {
                let s = Reader::new(&payload).str()?;
                if typ == T_STR { Data::Str(s) } else { Data::Err(s) }
            }
            T_DIR => Data::Dir(Dir::unpack(&payload)?.0),
            T_MSG => Data::Msg(payload),
            _ => return Err(zx_core::ZxError::proto(format!("unknown frame type {typ}"))),
        })
    }

    /// Short description for traces.
    pub fn describe(&self) -> String {
        match self {
            Data::Raw(b) => format!("raw[{}]", b.len()),
            Data::Bytes(b) => format!("bytes[{}]", b.len()),
            Data::Str(s) => format!("str '{s}'"),
            Data::Err(e) => format!("err '{e}'"),
            Data::Dir(d) => format!("dir <{}>", d.fmt()),
            Data::Msg(b) => format!("msg[{}]", b.len()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: u32,
    pub data: Data,
}

impl Frame {
    pub fn new(tag: u32, data: Data) -> Self {
        Self { tag, data }
    }

    pub fn id(&self) -> u32 {
        self.tag & ID_MASK
    }

    pub fn has(&self, flag: u32) -> bool {
        self.tag & flag != 0
    }

    pub fn pack(&self) -> ZxResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(64);
        codec::put_u32(&mut buf, 0);
        codec::put_u8(&mut buf, self.data.type_id());
        codec::put_u32(&mut buf, self.tag);
        self.data.pack_into(&mut buf)?;
        let n = buf.len() - 4;
        if n > MAX_MSG_SIZE + HDR_SIZE {
            return Err(codec::too_large());
        }
        buf[..4].copy_from_slice(&(n as u32).to_le_bytes());
        Ok(buf)
    }

    pub fn unpack(body: &[u8]) -> ZxResult<Frame> {
        let mut r = Reader::new(body);
        let typ = r.u8()?;
        let tag = r.u32()?;
        let data = Data::unpack(typ, r.remaining().to_vec())?;
        Ok(Frame { tag, data })
    }
}

/// Read one frame; `None` on a clean end of stream between frames.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> ZxResult<Option<Frame>> {
    let mut hdr = [0u8; 4];
    match r.read_exact(&mut hdr).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let n = u32::from_le_bytes(hdr) as usize;
    if n > MAX_MSG_SIZE + HDR_SIZE {
        return Err(codec::too_large());
    }
    if n < HDR_SIZE {
        return Err(codec::too_small());
    }
    let mut body = vec![0u8; n];
    r.read_exact(&mut body).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => codec::too_small(),
        _ => e.into(),
    })?;
    Frame::unpack(&body).map(Some)
}

pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, f: &Frame) -> ZxResult<()> {
    let buf = f.pack()?;
    w.write_all(&buf).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_over_a_pipe() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let frames = vec![
            Frame::new(3 | FIRST | RPC, Data::Msg(vec![66])),
            Frame::new(3, Data::Dir(Dir::from([("path", "/a"), ("type", "d")]))),
            Frame::new(3, Data::Str("main".into())),
            Frame::new(3 | END, Data::Err("x: no such file or directory".into())),
            Frame::new(4 | FLOW, Data::Raw(32u32.to_le_bytes().to_vec())),
            Frame::new(5 | END, Data::empty()),
        ];
        for f in &frames {
            write_frame(&mut a, f).await.unwrap();
        }
        drop(a);
        for f in &frames {
            assert_eq!(read_frame(&mut b).await.unwrap().as_ref(), Some(f));
        }
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }

    #[test]
    fn test_tag_flags() {
        let f = Frame::new(7 | FIRST | END, Data::empty());
        assert_eq!(f.id(), 7);
        assert!(f.has(FIRST) && f.has(END));
        assert!(!f.has(RPC) && !f.has(FLOW));
        assert!(f.data.is_empty());
    }

    #[tokio::test]
    async fn test_size_limits() {
        let big = Frame::new(1, Data::Bytes(vec![0; MAX_MSG_SIZE + 1]));
        assert_eq!(big.pack().unwrap_err().to_string(), "message size is too large");

        let mut hdr = ((MAX_MSG_SIZE + 100) as u32).to_le_bytes().to_vec();
        hdr.extend_from_slice(&[0; 8]);
        let err = read_frame(&mut hdr.as_slice()).await.unwrap_err();
        assert_eq!(err.to_string(), "message size is too large");

        let mut short = 10u32.to_le_bytes().to_vec();
        short.extend_from_slice(&[1, 0, 0]);
        let err = read_frame(&mut short.as_slice()).await.unwrap_err();
        assert_eq!(err.to_string(), "truncated message");
    }
}
