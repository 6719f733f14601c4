//! Requests sent to a zx server.

use std::fmt;

use strum::{Display, EnumIter, IntoEnumIterator};

use zx_core::codec::{self, Reader};
use zx_core::{Dir, ZxError, ZxResult};

/// Request operations, numbered as on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter)]
#[repr(u8)]
pub enum Op {
    #[strum(serialize = "Ttrees")]
    Trees = 66,
    #[strum(serialize = "Tstat")]
    Stat,
    #[strum(serialize = "Tget")]
    Get,
    #[strum(serialize = "Tput")]
    Put,
    #[strum(serialize = "Tmove")]
    Move,
    #[strum(serialize = "Tlink")]
    Link,
    #[strum(serialize = "Tremove")]
    Remove,
    #[strum(serialize = "Tremoveall")]
    RemoveAll,
    #[strum(serialize = "Twstat")]
    Wstat,
    #[strum(serialize = "Tfind")]
    Find,
    #[strum(serialize = "Tfindget")]
    FindGet,
}

impl TryFrom<u8> for Op {
    type Error = ZxError;

    fn try_from(b: u8) -> ZxResult<Op> {
        Op::iter()
            .find(|op| *op as u8 == b)
            .ok_or_else(|| ZxError::proto(format!("unknown msg type {b}")))
    }
}

impl Op {
    fn has_off(self) -> bool {
        matches!(self, Op::Get | Op::Put)
    }

    fn has_dir(self) -> bool {
        matches!(self, Op::Put | Op::Wstat)
    }

    fn has_to(self) -> bool {
        matches!(self, Op::Move | Op::Link)
    }

    fn has_pred(self) -> bool {
        matches!(self, Op::Find | Op::FindGet)
    }

    /// Whether the request changes the tree.
    pub fn is_write(self) -> bool {
        matches!(
            self,
            Op::Put | Op::Move | Op::Link | Op::Remove | Op::RemoveAll | Op::Wstat
        )
    }
}

/// A request. Only the fields used by `op` travel on the wire.
///
/// For [`Op::Link`], `path` is the new name and `to` the existing file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Msg {
    pub op: Op,
    pub fsys: String,
    pub path: String,
    pub off: i64,
    pub count: i64,
    pub d: Dir,
    pub to: String,
    pub pred: String,
    pub spref: String,
    pub dpref: String,
    pub depth: i64,
}

impl Msg {
    pub fn new(op: Op, fsys: &str, path: &str) -> Self {
        Self {
            op,
            fsys: fsys.to_string(),
            path: path.to_string(),
            off: 0,
            count: 0,
            d: Dir::new(),
            to: String::new(),
            pred: String::new(),
            spref: String::new(),
            dpref: String::new(),
            depth: 0,
        }
    }

    pub fn trees() -> Self {
        Self::new(Op::Trees, zx_net::addr::DEFAULT_TREE, "")
    }

    pub fn pack(&self) -> ZxResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(64);
        codec::put_u8(&mut buf, self.op as u8);
        if self.op == Op::Trees {
            return Ok(buf);
        }
        codec::put_str(&mut buf, &self.fsys)?;
        codec::put_str(&mut buf, &self.path)?;
        if self.op.has_off() {
            codec::put_i64(&mut buf, self.off);
        }
        if self.op == Op::Get {
            codec::put_i64(&mut buf, self.count);
        }
        if self.op.has_dir() {
            self.d.pack_into(&mut buf)?;
        }
        if self.op.has_to() {
            codec::put_str(&mut buf, &self.to)?;
        }
        if self.op.has_pred() {
            codec::put_str(&mut buf, &self.pred)?;
            codec::put_str(&mut buf, &self.spref)?;
            codec::put_str(&mut buf, &self.dpref)?;
            codec::put_i64(&mut buf, self.depth);
        }
        Ok(buf)
    }

    pub fn unpack(b: &[u8]) -> ZxResult<Msg> {
        let mut r = Reader::new(b);
        let op = Op::try_from(r.u8()?)?;
        if op == Op::Trees {
            return Ok(Msg::trees());
        }
        let mut m = Msg::new(op, &r.str()?, &r.str()?);
        if op.has_off() {
            m.off = r.i64()?;
        }
        if op == Op::Get {
            m.count = r.i64()?;
        }
        if op.has_dir() {
            m.d = Dir::unpack_from(&mut r)?;
        }
        if op.has_to() {
            m.to = r.str()?;
        }
        if op.has_pred() {
            m.pred = r.str()?;
            m.spref = r.str()?;
            m.dpref = r.str()?;
            m.depth = r.i64()?;
        }
        Ok(m)
    }
}

impl fmt::Display for Msg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.op == Op::Trees {
            return write!(f, "{}", self.op);
        }
        write!(f, "{} '{}' '{}'", self.op, self.fsys, self.path)?;
        if self.op.has_off() {
            write!(f, " off {}", self.off)?;
        }
        if self.op == Op::Get {
            write!(f, " count {}", self.count)?;
        }
        if self.op.has_dir() {
            write!(f, " d <{}>", self.d)?;
        }
        if self.op.has_to() {
            write!(f, " to '{}'", self.to)?;
        }
        if self.op.has_pred() {
            write!(
                f,
                " pred '{}' spref '{}' dpref '{}' depth {}",
                self.pred, self.spref, self.dpref, self.depth
            )?;
        }
        Ok(())
    }
}
