//! Directory entries.
//!
//! A [`Dir`] is a self-describing map from attribute names to values.
//! Lowercase names are reserved system attributes; names starting with an
//! uppercase letter are user attributes carried verbatim.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::codec::{self, Reader};
use crate::error::{ZxError, ZxResult};

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;

/// Preferred print order for standard attributes.
pub const STD_ATTR_ORDER: [&str; 11] = [
    "name", "type", "mode", "size", "mtime", "Uid", "Gid", "Wuid", "path", "addr", "err",
];

const STD_SHORT_ORDER: [&str; 5] = ["type", "mode", "size", "path", "err"];

/// Path of the synthetic control file.
pub const CTL_PATH: &str = "/Ctl";

pub fn is_std_attr(k: &str) -> bool {
    STD_ATTR_ORDER.contains(&k)
}

/// User attributes start with an uppercase letter.
pub fn is_usr_attr(k: &str) -> bool {
    k.chars().next().is_some_and(char::is_uppercase)
}

/// Nanoseconds since the epoch.
pub fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Directory entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Dir(BTreeMap<String, String>);

impl Dir {
    pub fn new() -> Self {
        Self::default()
    }

    /// The `/Ctl` entry every tree exposes at its root.
    pub fn ctl() -> Self {
        Dir::from([
            ("name", "Ctl"),
            ("path", CTL_PATH),
            ("type", "c"),
            ("mode", "0644"),
            ("size", "0"),
            ("mtime", "0"),
        ])
    }

    // ========================================================================
    // Map access
    // ========================================================================

    pub fn get(&self, k: &str) -> Option<&str> {
        self.0.get(k).map(String::as_str)
    }

    /// Value of `k`, or the empty string.
    pub fn attr(&self, k: &str) -> &str {
        self.get(k).unwrap_or("")
    }

    pub fn set(&mut self, k: impl Into<String>, v: impl Into<String>) {
        self.0.insert(k.into(), v.into());
    }

    /// Builder form of [`Dir::set`].
    pub fn with(mut self, k: impl Into<String>, v: impl Into<String>) -> Self {
        self.set(k, v);
        self
    }

    pub fn remove(&mut self, k: &str) -> Option<String> {
        self.0.remove(k)
    }

    pub fn contains(&self, k: &str) -> bool {
        self.0.contains_key(k)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> + Clone {
        self.0.keys().map(String::as_str)
    }

    pub fn retain(&mut self, mut f: impl FnMut(&str, &str) -> bool) {
        self.0.retain(|k, v| f(k, v));
    }

    /// Copy without user attributes.
    pub fn sys_dup(&self) -> Dir {
        Dir(self
            .0
            .iter()
            .filter(|(k, _)| !is_usr_attr(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    /// Copy with only user attributes.
    pub fn usr_attrs(&self) -> Dir {
        Dir(self
            .0
            .iter()
            .filter(|(k, _)| is_usr_attr(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    // ========================================================================
    // Typed attributes
    // ========================================================================

    pub fn path(&self) -> &str {
        self.attr("path")
    }

    pub fn name(&self) -> &str {
        self.attr("name")
    }

    pub fn typ(&self) -> &str {
        self.attr("type")
    }

    pub fn is_dir(&self) -> bool {
        self.typ() == "d"
    }

    pub fn err(&self) -> Option<&str> {
        self.get("err").filter(|e| !e.is_empty())
    }

    /// Unsigned value of `k`; `mode` is octal, everything else decimal.
    pub fn uint(&self, k: &str) -> u64 {
        let v = self.attr(k);
        let radix = if k == "mode" { 8 } else { 10 };
        u64::from_str_radix(v, radix).unwrap_or(0)
    }

    pub fn set_uint(&mut self, k: &str, v: u64) {
        self.set(k, v.to_string());
    }

    /// Permission bits (0777 only).
    pub fn mode(&self) -> u32 {
        (self.uint("mode") & 0o777) as u32
    }

    pub fn set_mode(&mut self, mode: u32) {
        self.set("mode", format!("0{:o}", mode & 0o777));
    }

    pub fn size(&self) -> i64 {
        self.uint("size") as i64
    }

    pub fn set_size(&mut self, size: i64) {
        self.set("size", size.max(0).to_string());
    }

    /// Modification time in nanoseconds since the epoch.
    pub fn mtime(&self) -> i64 {
        self.attr("mtime").parse().unwrap_or(0)
    }

    pub fn set_mtime(&mut self, ns: i64) {
        self.set("mtime", ns.to_string());
    }

    /// Adjust mode bits from the parent directory's mode.
    ///
    /// The mode is masked by the parent. A group read or write bit is set
    /// back when the owner has it and the parent grants it to the group; for
    /// directories the same holds for the group exec bit.
    pub fn inherit(&mut self, parent: u32) {
        let mut mode = self.mode() & parent;
        if mode & 0o440 == 0o400 && parent & 0o040 != 0 {
            mode |= 0o040;
        }
        if mode & 0o220 == 0o200 && parent & 0o020 != 0 {
            mode |= 0o020;
        }
        if self.is_dir() && mode & 0o110 == 0o100 && parent & 0o010 != 0 {
            mode |= 0o010;
        }
        self.set_mode(mode);
    }

    // ========================================================================
    // Addresses
    // ========================================================================

    fn addr_field(&self, i: usize) -> &str {
        self.attr("addr").split('!').nth(i).unwrap_or("")
    }

    /// Protocol in the address (`zx`, `lfs`, ...).
    pub fn proto(&self) -> &str {
        self.addr_field(0)
    }

    /// Server path: the last field of the address, or `path`.
    pub fn spath(&self) -> &str {
        match self.attr("addr").rsplit_once('!') {
            Some((_, p)) => p,
            None => self.path(),
        }
    }

    /// Server address: everything in `addr` before the tree and path.
    pub fn saddr(&self) -> String {
        let addr = self.attr("addr");
        let toks: Vec<&str> = addr.split('!').collect();
        match toks.first() {
            Some(&"zx") if toks.len() >= 5 => toks[1..toks.len() - 2].join("!"),
            Some(&"lfs") if toks.len() >= 3 => toks[1..toks.len() - 1].join("!"),
            _ => addr.to_string(),
        }
    }

    // ========================================================================
    // Packing
    // ========================================================================

    /// Pack as a pair count followed by (name, value) strings.
    pub fn pack_into(&self, buf: &mut Vec<u8>) -> ZxResult<()> {
        codec::put_u32(buf, self.0.len() as u32);
        for (k, v) in &self.0 {
            codec::put_str(buf, k)?;
            codec::put_str(buf, v)?;
        }
        Ok(())
    }

    pub fn pack(&self) -> ZxResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(64);
        self.pack_into(&mut buf)?;
        Ok(buf)
    }

    /// Unpack one Dir from the reader.
    pub fn unpack_from(r: &mut Reader<'_>) -> ZxResult<Dir> {
        let n = r.u32()? as usize;
        if n > codec::MAX_DIR_ATTRS {
            return Err(codec::too_large());
        }
        let mut d = Dir::new();
        for _ in 0..n {
            let k = r.str()?;
            let v = r.str()?;
            d.0.insert(k, v);
        }
        Ok(d)
    }

    /// Unpack a Dir and return the rest of the buffer.
    pub fn unpack(b: &[u8]) -> ZxResult<(Dir, &[u8])> {
        let mut r = Reader::new(b);
        let d = Dir::unpack_from(&mut r)?;
        Ok((d, r.remaining()))
    }

    // ========================================================================
    // Formatting
    // ========================================================================

    /// Attributes in standard order, then the rest sorted.
    pub fn attrs(&self) -> Vec<&str> {
        let mut out: Vec<&str> = STD_ATTR_ORDER
            .iter()
            .copied()
            .filter(|k| self.contains(k))
            .collect();
        out.extend(self.keys().filter(|k| !is_std_attr(k)));
        out
    }

    fn format(&self, attrs: &[&str], quote_all: bool) -> String {
        let mut out = Vec::with_capacity(attrs.len());
        for &a in attrs {
            let v = self.attr(a);
            if quote_all || !is_std_attr(a) {
                out.push(format!("{a}:{v:?}"));
                continue;
            }
            match a {
                "size" => out.push(size_str(v.parse().unwrap_or(0))),
                "mode" => out.push(mode_str(self.mode())),
                "mtime" => out.push(format!("{v:>12}")),
                "name" if !self.path().is_empty() => {}
                "Uid" | "Gid" | "Wuid" => out.push(format!("{v:>6}")),
                "addr" => {}
                "err" if v.is_empty() => {}
                _ => out.push(v.to_string()),
            }
        }
        out.join(" ")
    }

    /// Short listing: type, mode, size, path, err.
    pub fn fmt(&self) -> String {
        self.format(&STD_SHORT_ORDER, false)
    }

    /// Long listing with every attribute.
    pub fn long_fmt(&self) -> String {
        self.format(&self.attrs(), false)
    }

    /// Stable format for tests: all values quoted, no mtime, and `me`
    /// shown as `elf` in user attributes.
    pub fn test_fmt(&self, me: &str) -> String {
        let mut nd = self.clone();
        for k in ["Uid", "Gid", "Wuid"] {
            if nd.attr(k) == me {
                nd.set(k, "elf");
            }
        }
        nd.remove("mtime");
        nd.format(&nd.attrs(), true)
    }

    /// Parse the output of `Display` back into a Dir.
    pub fn parse(s: &str) -> ZxResult<Dir> {
        let mut d = Dir::new();
        let mut rest = s.trim_start();
        while !rest.is_empty() {
            let (name, tail) = rest
                .split_once(':')
                .ok_or_else(|| ZxError::other("missing ':' in dir string"))?;
            let (value, tail) = if let Some(q) = tail.strip_prefix('"') {
                parse_quoted(q)?
            } else {
                let end = tail.find(char::is_whitespace).unwrap_or(tail.len());
                (tail[..end].to_string(), &tail[end..])
            };
            d.set(name.trim(), value);
            rest = tail.trim_start();
        }
        Ok(d)
    }

    /// Whether every attribute in `pat` has the same value here.
    /// The value `*` matches any non-empty value.
    pub fn matches(&self, pat: &Dir) -> bool {
        pat.iter().all(|(k, v)| {
            let dv = self.attr(k);
            if dv.is_empty() {
                return v.is_empty();
            }
            dv == v || v == "*"
        })
    }
}

/// Parse a Rust-escaped string body up to its closing quote.
fn parse_quoted(s: &str) -> ZxResult<(String, &str)> {
    let mut out = String::new();
    let mut chars = s.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return Ok((out, &s[i + 1..])),
            '\\' => {
                let (_, e) = chars
                    .next()
                    .ok_or_else(|| ZxError::other("unterminated escape in dir string"))?;
                match e {
                    'n' => out.push('\n'),
                    't' => out.push('\t'),
                    'r' => out.push('\r'),
                    '0' => out.push('\0'),
                    'u' => {
                        let rest = &s[i + 2..];
                        let close = rest
                            .find('}')
                            .ok_or_else(|| ZxError::other("bad unicode escape in dir string"))?;
                        let code = u32::from_str_radix(&rest[1..close], 16)
                            .ok()
                            .and_then(char::from_u32)
                            .ok_or_else(|| ZxError::other("bad unicode escape in dir string"))?;
                        out.push(code);
                        for _ in 0..close + 1 {
                            chars.next();
                        }
                    }
                    e => out.push(e),
                }
            }
            c => out.push(c),
        }
    }
    Err(ZxError::other("unterminated quote in dir string"))
}

fn size_str(sz: u64) -> String {
    if sz < KIB {
        return format!("{sz:>6}");
    }
    let (div, unit) = if sz >= GIB {
        (GIB, 'G')
    } else if sz >= MIB {
        (MIB, 'M')
    } else {
        (KIB, 'k')
    };
    format!("{:>5.1}{unit}", sz as f64 / div as f64)
}

fn mode_str(mode: u32) -> String {
    const RWX: &[u8; 9] = b"rwxrwxrwx";
    (0..9)
        .map(|i| if mode & (1 << (8 - i)) != 0 { RWX[i] as char } else { '-' })
        .collect()
}

/// Quoted `name:"value"` form, parseable with [`Dir::parse`].
impl fmt::Display for Dir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format(&self.attrs(), true))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Dir {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Dir(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl<const N: usize> From<[(&str, &str); N]> for Dir {
    fn from(attrs: [(&str, &str); N]) -> Self {
        attrs.into_iter().collect()
    }
}

/// Equality ignoring `addr`, which depends on how the entry was reached.
pub fn equal_dirs(a: &Dir, b: &Dir) -> bool {
    let ka = a.keys().filter(|k| *k != "addr");
    let kb = b.keys().filter(|k| *k != "addr");
    ka.clone().count() == kb.count() && ka.into_iter().all(|k| a.get(k) == b.get(k))
}

/// Sort entries by name.
pub fn sort_dirs(ds: &mut [Dir]) {
    ds.sort_by(|a, b| a.name().cmp(b.name()));
}
