//! A tree that reports the calls made through it.
//!
//! [`Trfs`] wraps another tree and emits a trace line when each call starts
//! and another when it ends:
//!
//! ```text
//! ->stat[1] /a
//! <-stat[1] d 0755 3 /a sts ok
//! ->get[2] /a/a1 0 -1
//! <-get[2] 10154 bytes 2 msgs sts ok
//! ```
//!
//! Lines are logged at debug level and, when a sink is set, also sent down
//! an unbounded channel, which is what tests read. A tag prefixes every
//! line so several traced trees can share one sink. [`Call`] parses a line
//! back.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::dir::Dir;
use crate::error::{ZxError, ZxResult};
use crate::fs::{Auther, FindGetter, FindItem, Finder, Fs, Getter, Linker, Mover, Putter, Remover};
use crate::fs::{Rx, Stater, Wstater, chan};
use crate::perm::AuthInfo;

/// Where trace lines go besides the log.
pub type Sink = mpsc::UnboundedSender<String>;

fn sts<T>(res: &ZxResult<T>) -> String {
    match res {
        Ok(_) => "sts ok".to_string(),
        Err(e) => format!("sts {e}"),
    }
}

fn dir_fmt(res: &ZxResult<Dir>) -> String {
    match res {
        Ok(d) => d.fmt(),
        Err(_) => "-".to_string(),
    }
}

/// A tree tracing the calls made to another one.
///
/// Clones and auth views share the call numbering.
#[derive(Clone)]
pub struct Trfs {
    fs: Arc<dyn Fs>,
    tag: String,
    verb: bool,
    seq: Arc<AtomicU64>,
    sink: Option<Sink>,
}

impl fmt::Debug for Trfs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trfs")
            .field("fs", &self.fs.name())
            .field("tag", &self.tag)
            .field("verb", &self.verb)
            .finish()
    }
}

impl Trfs {
    pub fn new(fs: Arc<dyn Fs>) -> Self {
        Self {
            fs,
            tag: String::new(),
            verb: false,
            seq: Arc::new(AtomicU64::new(0)),
            sink: None,
        }
    }

    /// Prefix lines with `tag`. It must not contain `-`.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    pub fn with_sink(mut self, sink: Sink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Also trace every data message.
    pub fn verbose(mut self, on: bool) -> Self {
        self.verb = on;
        self
    }

    /// Number calls from 1 again.
    pub fn restart(&self) {
        self.seq.store(0, Ordering::Relaxed);
    }

    fn next(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn printf(&self, msg: fmt::Arguments<'_>) {
        let line = format!("{}{msg}", self.tag);
        debug!(fs = %self.fs.name(), "{line}");
        if let Some(tx) = &self.sink {
            let _ = tx.send(line);
        }
    }

    fn vprintf(&self, msg: fmt::Arguments<'_>) {
        if self.verb {
            self.printf(msg);
        }
    }

    /// Forward `rx`, tracing its end as call `n` of `op`. `show` gives the
    /// byte count and the verbose text for each item.
    fn traced<T, F>(&self, op: &'static str, n: u64, mut rx: Rx<T>, show: F) -> Rx<T>
    where
        T: Send + 'static,
        F: Fn(&T) -> (usize, String) + Send + 'static,
    {
        let (tx, out) = chan();
        let me = self.clone();
        tokio::spawn(async move {
            let (mut nb, mut nm) = (0usize, 0usize);
            let mut res: ZxResult<()> = Ok(());
            while let Some(it) = rx.recv().await {
                match &it {
                    Ok(v) => {
                        let (sz, s) = show(v);
                        nb += sz;
                        nm += 1;
                        me.vprintf(format_args!("<-{op}[{n}] {s}"));
                    }
                    Err(e) => res = Err(e.clone()),
                }
                if tx.send(it).await.is_err() {
                    res = Err(ZxError::closed("receiver gone"));
                    break;
                }
            }
            me.printf(format_args!("<-{op}[{n}] {nb} bytes {nm} msgs {}", sts(&res)));
        });
        out
    }
}

#[async_trait]
impl Stater for Trfs {
    async fn stat(&self, p: &str) -> ZxResult<Dir> {
        let n = self.next();
        self.printf(format_args!("->stat[{n}] {p}"));
        let res = self.fs.stat(p).await;
        self.printf(format_args!("<-stat[{n}] {} {}", dir_fmt(&res), sts(&res)));
        res
    }
}

impl Getter for Trfs {
    fn get(&self, p: &str, off: i64, count: i64) -> Rx<Vec<u8>> {
        let n = self.next();
        self.printf(format_args!("->get[{n}] {p} {off} {count}"));
        let rx = self.fs.get(p, off, count);
        self.traced("get", n, rx, |b: &Vec<u8>| (b.len(), format!("{} bytes", b.len())))
    }
}

#[async_trait]
impl Putter for Trfs {
    async fn put(&self, p: &str, d: Dir, off: i64, mut data: Rx<Vec<u8>>) -> ZxResult<Dir> {
        let n = self.next();
        self.printf(format_args!("->put[{n}] {p} {d} {off}"));
        let data = if self.verb {
            let (tx, rx) = chan();
            let me = self.clone();
            tokio::spawn(async move {
                while let Some(it) = data.recv().await {
                    if let Ok(b) = &it {
                        me.vprintf(format_args!("->put[{n}] {} bytes", b.len()));
                    }
                    if tx.send(it).await.is_err() {
                        break;
                    }
                }
            });
            rx
        } else {
            data
        };
        let res = self.fs.put(p, d, off, data).await;
        self.printf(format_args!("<-put[{n}] {} {}", dir_fmt(&res), sts(&res)));
        res
    }
}

#[async_trait]
impl Wstater for Trfs {
    async fn wstat(&self, p: &str, d: Dir) -> ZxResult<Dir> {
        let n = self.next();
        self.printf(format_args!("->wstat[{n}] {p} {d}"));
        let res = self.fs.wstat(p, d).await;
        self.printf(format_args!("<-wstat[{n}] {} {}", dir_fmt(&res), sts(&res)));
        res
    }
}

#[async_trait]
impl Remover for Trfs {
    async fn remove(&self, p: &str) -> ZxResult<()> {
        let n = self.next();
        self.printf(format_args!("->remove[{n}] {p}"));
        let res = self.fs.remove(p).await;
        self.printf(format_args!("<-remove[{n}] {}", sts(&res)));
        res
    }

    async fn remove_all(&self, p: &str) -> ZxResult<()> {
        let n = self.next();
        self.printf(format_args!("->removeall[{n}] {p}"));
        let res = self.fs.remove_all(p).await;
        self.printf(format_args!("<-removeall[{n}] {}", sts(&res)));
        res
    }
}

#[async_trait]
impl Mover for Trfs {
    async fn mv(&self, from: &str, to: &str) -> ZxResult<()> {
        let n = self.next();
        self.printf(format_args!("->move[{n}] {from} {to}"));
        let res = self.fs.mv(from, to).await;
        self.printf(format_args!("<-move[{n}] {}", sts(&res)));
        res
    }
}

#[async_trait]
impl Linker for Trfs {
    async fn link(&self, old: &str, new: &str) -> ZxResult<()> {
        let n = self.next();
        self.printf(format_args!("->link[{n}] {old} {new}"));
        let res = self.fs.link(old, new).await;
        self.printf(format_args!("<-link[{n}] {}", sts(&res)));
        res
    }
}

impl Finder for Trfs {
    fn find(&self, p: &str, pred: &str, spref: &str, dpref: &str, depth0: usize) -> Rx<Dir> {
        let n = self.next();
        self.printf(format_args!("->find[{n}] {p} '{pred}' '{spref}' '{dpref}' {depth0}"));
        let rx = self.fs.find(p, pred, spref, dpref, depth0);
        self.traced("find", n, rx, |d: &Dir| (0, d.fmt()))
    }
}

impl FindGetter for Trfs {
    fn find_get(&self, p: &str, pred: &str, spref: &str, dpref: &str, depth0: usize) -> Rx<FindItem> {
        let n = self.next();
        self.printf(format_args!("->findget[{n}] {p} '{pred}' '{spref}' '{dpref}' {depth0}"));
        let rx = self.fs.find_get(p, pred, spref, dpref, depth0);
        self.traced("findget", n, rx, |it: &FindItem| match it {
            FindItem::Dir(d) => (0, d.fmt()),
            FindItem::Bytes(b) => (b.len(), format!("{} bytes", b.len())),
            FindItem::End => (0, "end".to_string()),
        })
    }
}

#[async_trait]
impl Auther for Trfs {
    async fn auth(&self, ai: Option<AuthInfo>) -> ZxResult<Arc<dyn Fs>> {
        let n = self.next();
        let who = ai.as_ref().map_or("none", |ai| ai.uid.as_str()).to_string();
        self.printf(format_args!("->auth[{n}] {who}"));
        let res = self.fs.auth(ai).await;
        self.printf(format_args!("<-auth[{n}] {}", sts(&res)));
        let fs = res?;
        Ok(Arc::new(Trfs { fs, ..self.clone() }))
    }
}

#[async_trait]
impl Fs for Trfs {
    fn name(&self) -> String {
        format!("trfs {}", self.fs.name())
    }

    fn as_stater(&self) -> Option<&dyn Stater> {
        self.fs.as_stater().map(|_| self as &dyn Stater)
    }

    fn as_getter(&self) -> Option<&dyn Getter> {
        self.fs.as_getter().map(|_| self as &dyn Getter)
    }

    fn as_putter(&self) -> Option<&dyn Putter> {
        self.fs.as_putter().map(|_| self as &dyn Putter)
    }

    fn as_wstater(&self) -> Option<&dyn Wstater> {
        self.fs.as_wstater().map(|_| self as &dyn Wstater)
    }

    fn as_remover(&self) -> Option<&dyn Remover> {
        self.fs.as_remover().map(|_| self as &dyn Remover)
    }

    fn as_mover(&self) -> Option<&dyn Mover> {
        self.fs.as_mover().map(|_| self as &dyn Mover)
    }

    fn as_linker(&self) -> Option<&dyn Linker> {
        self.fs.as_linker().map(|_| self as &dyn Linker)
    }

    fn as_finder(&self) -> Option<&dyn Finder> {
        self.fs.as_finder().map(|_| self as &dyn Finder)
    }

    fn as_find_getter(&self) -> Option<&dyn FindGetter> {
        self.fs.as_find_getter().map(|_| self as &dyn FindGetter)
    }

    fn as_auther(&self) -> Option<&dyn Auther> {
        self.fs.as_auther().map(|_| self as &dyn Auther)
    }

    async fn close(&self) -> ZxResult<()> {
        let n = self.next();
        self.printf(format_args!("->close[{n}]"));
        let res = self.fs.close().await;
        self.printf(format_args!("<-close[{n}] {}", sts(&res)));
        res
    }
}

/// A traced call, parsed from one trace line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    /// Tag of the tree that traced it.
    pub tag: String,
    /// `->` for a request, `<-` for a reply.
    pub dir: String,
    pub seq: u64,
    pub op: String,
    pub args: Vec<String>,
}

impl Call {
    pub fn is_reply(&self) -> bool {
        self.dir == "<-"
    }
}

impl FromStr for Call {
    type Err = ZxError;

    fn from_str(s: &str) -> ZxResult<Self> {
        let bad = || ZxError::other(format!("{s}: not a trace line"));
        let dash = s.find('-').ok_or_else(bad)?;
        let (tag, rest) = s.split_at(dash);
        let (dir, rest) = match &rest[1..] {
            r if r.starts_with('>') => ("->", &r[1..]),
            _ => match tag.strip_suffix('<') {
                Some(_) => ("<-", &rest[1..]),
                None => return Err(bad()),
            },
        };
        let tag = if dir == "<-" { &tag[..tag.len() - 1] } else { tag };
        let (op, rest) = rest.split_once('[').ok_or_else(bad)?;
        let (seq, rest) = rest.split_once(']').ok_or_else(bad)?;
        if op.is_empty() {
            return Err(bad());
        }
        Ok(Call {
            tag: tag.to_string(),
            dir: dir.to_string(),
            seq: seq.parse().map_err(|_| bad())?,
            op: op.to_string(),
            args: rest.split_whitespace().map(str::to_string).collect(),
        })
    }
}

impl fmt::Display for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}[{}]", self.tag, self.dir, self.op, self.seq)?;
        for a in &self.args {
            write!(f, " {a}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request() {
        let c: Call = "->get[12] /a/a1 0 -1".parse().unwrap();
        assert_eq!(c.tag, "");
        assert!(!c.is_reply());
        assert_eq!(c.seq, 12);
        assert_eq!(c.op, "get");
        assert_eq!(c.args, ["/a/a1", "0", "-1"]);
        assert_eq!(c.to_string(), "->get[12] /a/a1 0 -1");
    }

    #[test]
    fn test_parse_tagged_reply() {
        let c: Call = "cache<-stat[3] d 0755 3 /a sts ok".parse().unwrap();
        assert_eq!(c.tag, "cache");
        assert!(c.is_reply());
        assert_eq!(c.op, "stat");
        assert_eq!(c.args.last().map(String::as_str), Some("ok"));
        let c: Call = "x->close[1]".parse().unwrap();
        assert!(c.args.is_empty());
        assert_eq!(c.to_string(), "x->close[1]");
    }

    #[test]
    fn test_parse_garbage() {
        for s in ["", "stat", "->stat", "->stat[x]", "<>stat[1]", "->[1]"] {
            assert!(s.parse::<Call>().is_err(), "{s}");
        }
    }
}
