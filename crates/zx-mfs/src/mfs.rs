//! In-memory zx tree.
//!
//! Entries live in a single map keyed by clean path, so the entries below a
//! directory are one contiguous key range. Nothing is persisted.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::ops::Bound;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, trace};

use zx_core::codec::MSG_SIZE;
use zx_core::dir::{CTL_PATH, now_ns, sort_dirs};
use zx_core::fs::{Auther, FindGetter, Finder, Getter, Mover, Putter, Remover, Stater, Wstater};
use zx_core::fs::{FindItem, Fs, Rx, Tx, chan};
use zx_core::perm::{self, AuthInfo};
use zx_core::stats::{Call, IoStats, Op};
use zx_core::{BoolFlag, Dir, Flags, ZxError, ZxResult, find, path};

macro_rules! dprintf {
    ($fs:expr, $($arg:tt)+) => {
        if $fs.inner.debug.get() {
            debug!(fs = %$fs.inner.name, $($arg)+);
        }
    };
}

#[derive(Debug, Clone)]
struct Node {
    d: Dir,
    data: Vec<u8>,
}

type Nodes = BTreeMap<String, Node>;

/// Entries strictly below `p`, in key order.
fn under<'a>(nodes: &'a Nodes, p: &'a str) -> impl Iterator<Item = (&'a String, &'a Node)> + 'a {
    let pref = if p == "/" { "/".to_string() } else { format!("{p}/") };
    nodes
        .range::<str, _>((Bound::Included(pref.as_str()), Bound::Unbounded))
        .take_while(move |(k, _)| k.starts_with(pref.as_str()))
        .filter(|(k, _)| k.as_str() != "/")
}

fn children<'a>(nodes: &'a Nodes, p: &'a str) -> impl Iterator<Item = &'a Node> + 'a {
    under(nodes, p)
        .filter(move |(k, _)| path::parent(k) == p)
        .map(|(_, n)| n)
}

/// Set the user attributes in `ud`; empty values remove them.
fn set_usr(d: &mut Dir, ud: &Dir) {
    for (k, v) in ud.iter() {
        if v.is_empty() {
            d.remove(k);
        } else {
            d.set(k, v);
        }
    }
}

fn int_attr(d: &Dir, k: &str) -> ZxResult<Option<i64>> {
    match d.attr(k) {
        "" => Ok(None),
        v => v
            .parse()
            .map(Some)
            .map_err(|_| ZxError::other(format!("{k}: not a number"))),
    }
}

async fn send<T>(tx: &Tx<T>, v: T) -> ZxResult<()> {
    tx.send(Ok(v))
        .await
        .map_err(|_| ZxError::closed("receiver gone"))
}

async fn drain(data: &mut Rx<Vec<u8>>) {
    while data.recv().await.is_some() {}
}

#[derive(Debug)]
struct Inner {
    name: String,
    owner: String,
    debug: BoolFlag,
    noperm: BoolFlag,
    rdonly: BoolFlag,
    flags: Flags,
    stats: IoStats,
    nodes: RwLock<Nodes>,
}

/// What a put does once its attributes are in place.
enum Prep {
    Done(Dir),
    Write(usize),
}

/// A zx tree kept in memory.
///
/// Clones share the tree. A view made with [`Auther::auth`] checks
/// permissions for its identity unless the `noperm` flag is set.
#[derive(Debug, Clone)]
pub struct Mfs {
    inner: Arc<Inner>,
    ai: Option<AuthInfo>,
}

impl Mfs {
    /// An empty tree owned by the current user.
    pub fn new(name: &str) -> Mfs {
        let owner = whoami::username();
        let mut root = Dir::from([("name", "/"), ("path", "/"), ("type", "d"), ("mode", "0755")]);
        for k in ["Uid", "Gid", "Wuid"] {
            root.set(k, owner.as_str());
        }
        root.set_mtime(now_ns());
        let mut nodes = Nodes::new();
        nodes.insert("/".to_string(), Node { d: root, data: Vec::new() });

        let debug = BoolFlag::default();
        let noperm = BoolFlag::default();
        let rdonly = BoolFlag::default();
        let mut flags = Flags::new();
        flags.add_bool("debug", &debug);
        flags.add_bool("noperm", &noperm);
        flags.add_bool("rdonly", &rdonly);
        flags.add_action("clear");
        info!(fs = name, "memory tree");
        Mfs {
            inner: Arc::new(Inner {
                name: name.to_string(),
                owner,
                debug,
                noperm,
                rdonly,
                flags,
                stats: IoStats::new(),
                nodes: RwLock::new(nodes),
            }),
            ai: None,
        }
    }

    pub fn auth_info(&self) -> Option<&AuthInfo> {
        self.ai.as_ref()
    }

    pub fn set_debug(&self, on: bool) {
        self.inner.debug.set(on);
    }

    pub fn set_rdonly(&self, on: bool) {
        self.inner.rdonly.set(on);
    }

    /// One line per entry, parents first, indented by depth.
    pub fn dump(&self) -> String {
        let nodes = self.inner.nodes.read();
        let mut out = String::new();
        for (p, n) in nodes.iter() {
            let depth = path::elems(p).len();
            let _ = writeln!(out, "{:width$}{}", "", self.out(&nodes, n).fmt(), width = 4 * depth);
        }
        out
    }

    fn ai(&self) -> Option<&AuthInfo> {
        if self.inner.noperm.get() { None } else { self.ai.as_ref() }
    }

    fn uid(&self) -> String {
        match &self.ai {
            Some(ai) => ai.uid.clone(),
            None => self.inner.owner.clone(),
        }
    }

    fn can(&self, d: &Dir, what: u32) -> bool {
        self.ai().is_none() || perm::can(self.ai(), Some(d), what)
    }

    fn check_writable(&self) -> ZxResult<()> {
        if self.inner.rdonly.get() {
            return Err(ZxError::read_only(self.name()));
        }
        Ok(())
    }

    fn addr(&self, p: &str) -> String {
        format!("mfs!{}!{p}", self.inner.name)
    }

    fn ctl_dir(&self) -> Dir {
        let mut d = Dir::ctl();
        for k in ["Uid", "Gid", "Wuid"] {
            d.set(k, self.inner.owner.as_str());
        }
        d.set("addr", self.addr(CTL_PATH));
        d
    }

    fn done<T>(&self, call: Call, what: &str, p: &str, res: ZxResult<T>) -> ZxResult<T> {
        self.inner.stats.end(call, res.is_err());
        match &res {
            Ok(_) => dprintf!(self, "{what} {p}: ok"),
            Err(e) => dprintf!(self, "{what} {p}: {e}"),
        }
        res
    }

    /// The Dir handed out for `n`: sizes are computed, not stored.
    fn out(&self, nodes: &Nodes, n: &Node) -> Dir {
        let mut d = n.d.clone();
        let p = n.d.path();
        if d.is_dir() {
            let mut sz = children(nodes, p).count() as i64;
            if p == "/" {
                sz += 1;
            }
            d.set_size(sz);
        } else {
            d.set_size(n.data.len() as i64);
        }
        d.set("addr", self.addr(p));
        d
    }

    /// Find `p`, checking walk permission on every directory above it.
    fn lookup<'a>(&self, nodes: &'a Nodes, p: &str) -> ZxResult<&'a Node> {
        let els = path::elems(p);
        for i in 0..els.len() {
            let dp = path::elems_path(&els[..i]);
            let Some(dn) = nodes.get(&dp) else {
                return Err(ZxError::not_exist(p));
            };
            if !dn.d.is_dir() {
                return Err(ZxError::not_dir(dp));
            }
            if !self.can(&dn.d, perm::EXEC) {
                return Err(ZxError::perm(p));
            }
        }
        nodes.get(p).ok_or_else(|| ZxError::not_exist(p))
    }

    /// `p`'s parent, checked for making or removing entries in it.
    fn check_parent(&self, nodes: &Nodes, p: &str) -> ZxResult<Dir> {
        let pp = path::parent(p);
        let pd = &self.lookup(nodes, &pp)?.d;
        if !pd.is_dir() {
            return Err(ZxError::not_dir(pp));
        }
        if !self.can(pd, perm::WRITE) {
            return Err(ZxError::perm(pp));
        }
        Ok(pd.clone())
    }

    /// Record a change in the directory `p`.
    fn touch(&self, nodes: &mut Nodes, p: &str) {
        if let Some(n) = nodes.get_mut(p) {
            n.d.set_mtime(now_ns());
            n.d.set("Wuid", self.uid());
        }
    }

    /// A new entry at `p` under the directory `pd`.
    fn new_node(&self, p: &str, d: &Dir, pd: &Dir, mtime: i64) -> Node {
        let is_dir = matches!(d.typ(), "d" | "D");
        let mut nd = d.usr_attrs();
        nd.remove("Wuid");
        nd.set("name", path::base(p));
        nd.set("path", p);
        nd.set("type", if is_dir { "d" } else { "-" });
        let dflt = if is_dir { 0o755 } else { 0o644 };
        nd.set_mode(if d.attr("mode").is_empty() { dflt } else { d.mode() });
        nd.inherit(pd.mode());
        nd.set_mtime(mtime);
        let uid = self.uid();
        if nd.attr("Uid").is_empty() {
            nd.set("Uid", uid.as_str());
        }
        if nd.attr("Gid").is_empty() {
            nd.set("Gid", pd.attr("Gid"));
        }
        nd.set("Wuid", uid);
        Node { d: nd, data: Vec::new() }
    }

    fn attach(&self, nodes: &mut Nodes, p: &str, n: Node) {
        nodes.insert(p.to_string(), n);
        self.touch(nodes, &path::parent(p));
    }

    /// Create the missing directories in `p`.
    fn mkdirs(&self, nodes: &mut Nodes, p: &str) -> ZxResult<()> {
        let els = path::elems(p);
        for i in 1..=els.len() {
            let dp = path::elems_path(&els[..i]);
            match nodes.get(&dp) {
                Some(n) if n.d.is_dir() => continue,
                Some(_) => return Err(ZxError::not_dir(dp)),
                None => {}
            }
            let pd = self.check_parent(nodes, &dp)?;
            let n = self.new_node(&dp, &Dir::from([("type", "d")]), &pd, now_ns());
            self.attach(nodes, &dp, n);
        }
        Ok(())
    }

    fn stat_at(&self, p: &str) -> ZxResult<Dir> {
        let p = path::abs_path(p)?;
        if p == CTL_PATH {
            return Ok(self.ctl_dir());
        }
        let nodes = self.inner.nodes.read();
        let n = self.lookup(&nodes, &p)?;
        Ok(self.out(&nodes, n))
    }

    fn ctl_text(&self) -> String {
        format!("mfs {}:\n{}{}", self.inner.name, self.inner.flags, self.inner.stats)
    }

    fn ctl(&self, cmd: &str) -> ZxResult<()> {
        info!(fs = %self.inner.name, "ctl {cmd}");
        let Some(act) = self.inner.flags.ctl(cmd)? else {
            return Ok(());
        };
        match act.name.as_str() {
            "clear" => {
                self.inner.stats.clear();
                Ok(())
            }
            _ => Err(ZxError::bad_ctl(cmd)),
        }
    }

    async fn get_to(&self, p: &str, off: i64, count: i64, tx: &Tx<Vec<u8>>, call: &mut Call) -> ZxResult<()> {
        let p = path::abs_path(p)?;
        let take = if count < 0 { usize::MAX } else { count as usize };
        let off = off.max(0) as usize;
        if p == CTL_PATH {
            let text = self.ctl_text().into_bytes();
            let start = off.min(text.len());
            let end = start.saturating_add(take).min(text.len());
            call.sent(end - start);
            return send(tx, text[start..end].to_vec()).await;
        }

        // copy out under the lock, send without it
        let (ds, data) = {
            let nodes = self.inner.nodes.read();
            let n = self.lookup(&nodes, &p)?;
            if !self.can(&n.d, perm::READ) {
                return Err(ZxError::perm(&p));
            }
            if n.d.is_dir() {
                let mut ds: Vec<Dir> = children(&nodes, &p).map(|c| self.out(&nodes, c)).collect();
                sort_dirs(&mut ds);
                if p == "/" {
                    ds.insert(0, self.ctl_dir());
                }
                (Some(ds), Vec::new())
            } else {
                let start = off.min(n.data.len());
                let end = start.saturating_add(take).min(n.data.len());
                (None, n.data[start..end].to_vec())
            }
        };
        if let Some(ds) = ds {
            for d in ds.into_iter().skip(off).take(take) {
                let b = d.pack()?;
                call.sent(b.len());
                send(tx, b).await?;
            }
            return Ok(());
        }
        for chunk in data.chunks(MSG_SIZE) {
            call.sent(chunk.len());
            send(tx, chunk.to_vec()).await?;
        }
        Ok(())
    }

    async fn put_ctl(&self, data: &mut Rx<Vec<u8>>) -> ZxResult<Dir> {
        let ctl = self.ctl_dir();
        if !self.can(&ctl, perm::WRITE) {
            return Err(ZxError::perm(CTL_PATH));
        }
        let mut buf = Vec::new();
        while let Some(chunk) = data.recv().await {
            buf.extend_from_slice(&chunk?);
        }
        let text = String::from_utf8(buf).map_err(|_| ZxError::bad_ctl("not text"))?;
        for cmd in text.lines().filter(|l| !l.trim().is_empty()) {
            self.ctl(cmd)?;
        }
        Ok(ctl)
    }

    /// Make or update the entry for a put; the data comes later.
    fn prepare(&self, nodes: &mut Nodes, p: &str, d: &Dir, off: i64, mtime: Option<i64>) -> ZxResult<Prep> {
        let typ = d.typ();
        if matches!(typ, "F" | "D") {
            self.mkdirs(nodes, &path::parent(p))?;
        }
        let old = match self.lookup(nodes, p) {
            Ok(n) => Some(n.d.clone()),
            Err(e) if e.is_not_exist() => None,
            Err(e) => return Err(e),
        };

        if matches!(typ, "d" | "D") {
            match &old {
                Some(od) if od.is_dir() => {}
                Some(_) => return Err(ZxError::exists(p)),
                None => {
                    let pd = self.check_parent(nodes, p)?;
                    let n = self.new_node(p, d, &pd, mtime.unwrap_or_else(now_ns));
                    self.attach(nodes, p, n);
                }
            }
            return Ok(Prep::Done(self.out(nodes, &nodes[p])));
        }

        let create = !typ.is_empty();
        match &old {
            Some(od) if od.is_dir() && create => return Err(ZxError::exists(p)),
            Some(od) if od.is_dir() => return Err(ZxError::is_dir(p)),
            Some(od) => {
                if !self.can(od, perm::WRITE) {
                    return Err(ZxError::perm(p));
                }
                let mut ud = d.usr_attrs();
                ud.remove("Wuid");
                if create && !d.attr("mode").is_empty() {
                    ud.set("mode", d.attr("mode"));
                }
                if self.ai().is_some() && !ud.is_empty() {
                    perm::can_wstat(self.ai(), od, &ud)?;
                }
                let uid = self.uid();
                if let Some(n) = nodes.get_mut(p) {
                    if let Some(mode) = ud.remove("mode").map(|_| d.mode()) {
                        n.d.set_mode(mode);
                    }
                    set_usr(&mut n.d, &ud);
                    n.d.set("Wuid", uid);
                }
            }
            None if !create => return Err(ZxError::not_exist(p)),
            None => {
                let pd = self.check_parent(nodes, p)?;
                let n = self.new_node(p, d, &pd, mtime.unwrap_or_else(now_ns));
                self.attach(nodes, p, n);
            }
        }

        let size = int_attr(d, "size")?;
        let n = nodes.get_mut(p).ok_or_else(|| ZxError::not_exist(p))?;
        if create || size.is_some() {
            n.data.resize(size.unwrap_or(0).max(0) as usize, 0);
        }
        let start = if off < 0 { n.data.len() } else { off as usize };
        Ok(Prep::Write(start))
    }

    async fn put_at(&self, p: &str, d: Dir, off: i64, data: &mut Rx<Vec<u8>>, call: &mut Call) -> ZxResult<Dir> {
        let p = path::abs_path(p)?;
        if p == CTL_PATH {
            return self.put_ctl(data).await;
        }
        self.check_writable()?;
        if p == "/" {
            return Err(ZxError::is_dir("/"));
        }
        let typ = d.typ();
        if !matches!(typ, "" | "-" | "d" | "F" | "D") {
            return Err(ZxError::bad_type(format!("{p}: type '{typ}'")));
        }
        let mtime = int_attr(&d, "mtime")?;
        let prep = {
            let mut nodes = self.inner.nodes.write();
            self.prepare(&mut nodes, &p, &d, off, mtime)?
        };
        let mut at = match prep {
            Prep::Done(d) => {
                drain(data).await;
                return Ok(d);
            }
            Prep::Write(at) => at,
        };

        while let Some(chunk) = data.recv().await {
            let chunk = chunk?;
            let mut nodes = self.inner.nodes.write();
            let n = nodes.get_mut(&p).ok_or_else(|| ZxError::not_exist(&p))?;
            let end = at + chunk.len();
            if n.data.len() < end {
                n.data.resize(end, 0);
            }
            n.data[at..end].copy_from_slice(&chunk);
            at = end;
            call.sent(chunk.len());
            trace!(path = %p, n = chunk.len(), "put chunk");
        }

        let mut nodes = self.inner.nodes.write();
        let uid = self.uid();
        let n = nodes.get_mut(&p).ok_or_else(|| ZxError::not_exist(&p))?;
        n.d.set_mtime(mtime.unwrap_or_else(now_ns));
        n.d.set("Wuid", uid);
        Ok(self.out(&nodes, &nodes[p.as_str()]))
    }

    fn wstat_at(&self, p: &str, d: &Dir) -> ZxResult<Dir> {
        let p = path::abs_path(p)?;
        if p == CTL_PATH {
            return Ok(self.ctl_dir());
        }
        self.check_writable()?;
        let size = int_attr(d, "size")?;
        let mtime = int_attr(d, "mtime")?;
        let mut nodes = self.inner.nodes.write();
        let old = {
            let n = self.lookup(&nodes, &p)?;
            self.out(&nodes, n)
        };
        if self.ai().is_some() {
            perm::can_wstat(self.ai(), &old, d)?;
        }
        let uid = self.ai.as_ref().map(|ai| ai.uid.clone());
        let n = nodes.get_mut(&p).ok_or_else(|| ZxError::not_exist(&p))?;
        if let Some(sz) = size {
            if !old.is_dir() {
                n.data.resize(sz.max(0) as usize, 0);
            }
        }
        if !d.attr("mode").is_empty() {
            n.d.set_mode(d.mode());
        }
        let mut ud = d.usr_attrs();
        ud.remove("Wuid");
        set_usr(&mut n.d, &ud);
        if let Some(uid) = uid {
            n.d.set("Wuid", uid);
        }
        if let Some(t) = mtime {
            n.d.set_mtime(t);
        }
        Ok(self.out(&nodes, &nodes[p.as_str()]))
    }

    fn remove_at(&self, p: &str, all: bool) -> ZxResult<()> {
        let p = path::abs_path(p)?;
        self.check_writable()?;
        if p == "/" || p == CTL_PATH {
            return Err(ZxError::perm(&p));
        }
        let mut nodes = self.inner.nodes.write();
        self.lookup(&nodes, &p)?;
        self.check_parent(&nodes, &p)?;
        let gone: Vec<String> = under(&nodes, &p).map(|(k, _)| k.clone()).collect();
        if !all && !gone.is_empty() {
            return Err(ZxError::not_empty(&p));
        }
        for k in &gone {
            nodes.remove(k);
        }
        nodes.remove(&p);
        self.touch(&mut nodes, &path::parent(&p));
        Ok(())
    }

    fn check_endpoint(p: &str) -> ZxResult<()> {
        if p == "/" || p == CTL_PATH {
            return Err(ZxError::perm(p));
        }
        Ok(())
    }

    fn move_at(&self, from: &str, to: &str) -> ZxResult<()> {
        let from = path::abs_path(from)?;
        let to = path::abs_path(to)?;
        self.check_writable()?;
        Self::check_endpoint(&from)?;
        Self::check_endpoint(&to)?;
        let mut nodes = self.inner.nodes.write();
        if from == to {
            self.lookup(&nodes, &from)?;
            return Ok(());
        }
        if path::has_prefix(&to, &from) {
            return Err(ZxError::other(format!("{from}: inconsistent move")));
        }
        let ftyp = self.lookup(&nodes, &from)?.d.typ().to_string();
        self.check_parent(&nodes, &from)?;
        self.check_parent(&nodes, &to)?;
        match nodes.get(&to) {
            Some(tn) if tn.d.is_dir() => return Err(ZxError::exists(&to)),
            Some(tn) if tn.d.typ() != ftyp => {
                return Err(ZxError::other(format!("{to}: inconsistent move")));
            }
            _ => {}
        }

        nodes.remove(&to);
        let moved: Vec<String> = under(&nodes, &from).map(|(k, _)| k.clone()).collect();
        for k in std::iter::once(from.clone()).chain(moved) {
            let Some(mut n) = nodes.remove(&k) else {
                continue;
            };
            let np = path::join(&to, &path::suffix(&k, &from));
            n.d.set("name", path::base(&np));
            n.d.set("path", np.as_str());
            nodes.insert(np, n);
        }
        self.touch(&mut nodes, &path::parent(&from));
        self.touch(&mut nodes, &path::parent(&to));
        Ok(())
    }

    /// Forward `rx`, recording it as one `op` call.
    fn counted<T: Send + 'static>(&self, op: Op, mut rx: Rx<T>) -> Rx<T> {
        let (tx, out) = chan();
        let fs = self.clone();
        tokio::spawn(async move {
            let mut call = fs.inner.stats.start(op);
            let mut failed = false;
            while let Some(it) = rx.recv().await {
                failed |= it.is_err();
                call.sent(0);
                if tx.send(it).await.is_err() {
                    break;
                }
            }
            fs.inner.stats.end(call, failed);
        });
        out
    }
}

#[async_trait]
impl Stater for Mfs {
    async fn stat(&self, p: &str) -> ZxResult<Dir> {
        dprintf!(self, "stat {p}");
        let call = self.inner.stats.start(Op::Stat);
        let res = self.stat_at(p);
        self.done(call, "stat", p, res)
    }
}

impl Getter for Mfs {
    fn get(&self, p: &str, off: i64, count: i64) -> Rx<Vec<u8>> {
        dprintf!(self, "get {p} {off} {count}");
        let (tx, rx) = chan();
        let fs = self.clone();
        let p = p.to_string();
        tokio::spawn(async move {
            let mut call = fs.inner.stats.start(Op::Get);
            let res = fs.get_to(&p, off, count, &tx, &mut call).await;
            if let Err(e) = &res {
                let _ = tx.send(Err(e.clone())).await;
            }
            let _ = fs.done(call, "get", &p, res);
        });
        rx
    }
}

#[async_trait]
impl Putter for Mfs {
    async fn put(&self, p: &str, d: Dir, off: i64, mut data: Rx<Vec<u8>>) -> ZxResult<Dir> {
        dprintf!(self, "put {p} {d} {off}");
        let mut call = self.inner.stats.start(Op::Put);
        let res = self.put_at(p, d, off, &mut data, &mut call).await;
        if res.is_err() {
            drain(&mut data).await;
        }
        self.done(call, "put", p, res)
    }
}

#[async_trait]
impl Wstater for Mfs {
    async fn wstat(&self, p: &str, d: Dir) -> ZxResult<Dir> {
        dprintf!(self, "wstat {p} {d}");
        let call = self.inner.stats.start(Op::Wstat);
        let res = self.wstat_at(p, &d);
        self.done(call, "wstat", p, res)
    }
}

#[async_trait]
impl Remover for Mfs {
    async fn remove(&self, p: &str) -> ZxResult<()> {
        dprintf!(self, "remove {p}");
        let call = self.inner.stats.start(Op::Remove);
        let res = self.remove_at(p, false);
        self.done(call, "remove", p, res)
    }

    async fn remove_all(&self, p: &str) -> ZxResult<()> {
        dprintf!(self, "removeall {p}");
        let call = self.inner.stats.start(Op::RemoveAll);
        let res = self.remove_at(p, true);
        self.done(call, "removeall", p, res)
    }
}

#[async_trait]
impl Mover for Mfs {
    async fn mv(&self, from: &str, to: &str) -> ZxResult<()> {
        dprintf!(self, "move {from} {to}");
        let call = self.inner.stats.start(Op::Move);
        let res = self.move_at(from, to);
        self.done(call, "move", from, res)
    }
}

impl Finder for Mfs {
    fn find(&self, p: &str, pred: &str, spref: &str, dpref: &str, depth0: usize) -> Rx<Dir> {
        dprintf!(self, "find {p} '{pred}' '{spref}' '{dpref}' {depth0}");
        let rx = find::find(Arc::new(self.clone()), p, pred, spref, dpref, depth0);
        self.counted(Op::Find, rx)
    }
}

impl FindGetter for Mfs {
    fn find_get(&self, p: &str, pred: &str, spref: &str, dpref: &str, depth0: usize) -> Rx<FindItem> {
        dprintf!(self, "findget {p} '{pred}' '{spref}' '{dpref}' {depth0}");
        let rx = find::find_get(Arc::new(self.clone()), p, pred, spref, dpref, depth0);
        self.counted(Op::FindGet, rx)
    }
}

#[async_trait]
impl Auther for Mfs {
    async fn auth(&self, ai: Option<AuthInfo>) -> ZxResult<Arc<dyn Fs>> {
        if let Some(ai) = &ai {
            dprintf!(self, "auth for {} {:?}", ai.uid, ai.gids);
        }
        Ok(Arc::new(Mfs {
            inner: self.inner.clone(),
            ai,
        }))
    }
}

#[async_trait]
impl Fs for Mfs {
    fn name(&self) -> String {
        format!("mfs {}", self.inner.name)
    }

    fn as_stater(&self) -> Option<&dyn Stater> {
        Some(self)
    }

    fn as_getter(&self) -> Option<&dyn Getter> {
        Some(self)
    }

    fn as_putter(&self) -> Option<&dyn Putter> {
        Some(self)
    }

    fn as_wstater(&self) -> Option<&dyn Wstater> {
        Some(self)
    }

    fn as_remover(&self) -> Option<&dyn Remover> {
        Some(self)
    }

    fn as_mover(&self) -> Option<&dyn Mover> {
        Some(self)
    }

    fn as_finder(&self) -> Option<&dyn Finder> {
        Some(self)
    }

    fn as_find_getter(&self) -> Option<&dyn FindGetter> {
        Some(self)
    }

    fn as_auther(&self) -> Option<&dyn Auther> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zx_core::{Cap, util};

    fn setup() -> Arc<dyn Fs> {
        Arc::new(Mfs::new("test"))
    }

    fn file() -> Dir {
        Dir::from([("type", "-"), ("mode", "0644")])
    }

    #[tokio::test]
    async fn test_create_and_read() {
        let fs = setup();
        let d = util::put_all(fs.as_ref(), "/f", file(), b"hello world").await.unwrap();
        assert_eq!(d.size(), 11);
        assert_eq!(d.attr("mode"), "0644");
        assert_eq!(d.attr("addr"), "mfs!test!/f");
        assert_eq!(util::get_all(fs.as_ref(), "/f").await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_partial_read() {
        let fs = setup();
        util::put_all(fs.as_ref(), "/f", file(), b"hello world").await.unwrap();
        let got = util::recv_all(fs.get("/f", 6, 3)).await.unwrap().concat();
        assert_eq!(got, b"wor");
        let got = util::recv_all(fs.get("/f", 20, -1)).await.unwrap().concat();
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn test_append_offset_and_truncate() {
        let fs = setup();
        util::put_all(fs.as_ref(), "/f", file(), b"hello").await.unwrap();
        let d = fs.put("/f", Dir::new(), -1, util::data_rx(b" world")).await.unwrap();
        assert_eq!(d.size(), 11);
        fs.put("/f", Dir::new(), 0, util::data_rx(b"J")).await.unwrap();
        assert_eq!(util::get_all(fs.as_ref(), "/f").await.unwrap(), b"Jello world");
        let d = fs.put("/f", Dir::new(), 13, util::data_rx(b"!")).await.unwrap();
        assert_eq!(d.size(), 14);
        assert_eq!(&util::get_all(fs.as_ref(), "/f").await.unwrap()[11..], b"\0\0!");

        let d = fs.wstat("/f", Dir::from([("size", "5")])).await.unwrap();
        assert_eq!(d.size(), 5);
        assert_eq!(util::get_all(fs.as_ref(), "/f").await.unwrap(), b"Jello");
        let d = util::put_all(fs.as_ref(), "/f", file(), b"new").await.unwrap();
        assert_eq!(d.size(), 3);

        let err = fs.put("/nf", Dir::new(), 0, util::data_rx(b"x")).await.unwrap_err();
        assert!(err.is_not_exist());
    }

    #[tokio::test]
    async fn test_mkdir_and_list() {
        let fs = setup();
        util::mkdir(fs.as_ref(), "/d", Dir::new()).await.unwrap();
        let d = util::mkdir(fs.as_ref(), "/d", Dir::new()).await.unwrap();
        assert_eq!(d.attr("mode"), "0755");
        util::put_all(fs.as_ref(), "/d/x", file(), b"x").await.unwrap();
        util::put_all(fs.as_ref(), "/d-x", file(), b"x").await.unwrap();
        fs.wstat("/d/x", Dir::from([("Color", "red")])).await.unwrap();

        let ds = util::get_dir(fs.as_ref(), "/").await.unwrap();
        let names: Vec<&str> = ds.iter().map(|d| d.name()).collect();
        assert_eq!(names, ["Ctl", "d", "d-x"]);
        assert_eq!(fs.stat("/").await.unwrap().size(), 3);
        let ds = util::get_dir(fs.as_ref(), "/d").await.unwrap();
        assert_eq!(ds.len(), 1);
        assert_eq!(ds[0].attr("Color"), "red");
        assert_eq!(fs.stat("/d").await.unwrap().size(), 1);

        let err = util::put_all(fs.as_ref(), "/d", file(), b"x").await.unwrap_err();
        assert!(err.is_exists());
        let err = util::mkdir(fs.as_ref(), "/d/x", Dir::new()).await.unwrap_err();
        assert!(err.is_exists());
        let err = util::mkdir(fs.as_ref(), "/no/x", Dir::new()).await.unwrap_err();
        assert!(err.is_not_exist());
        let err = fs.put("/q", Dir::from([("type", "l")]), 0, util::data_rx(b"")).await.unwrap_err();
        assert!(err.to_string().contains("type 'l'"));
    }

    #[tokio::test]
    async fn test_put_makes_missing_dirs() {
        let fs = setup();
        let d = util::put_all(fs.as_ref(), "/x/y/z", Dir::from([("type", "F")]), b"deep").await.unwrap();
        assert_eq!(d.typ(), "-");
        assert!(fs.stat("/x/y").await.unwrap().is_dir());
        assert!(util::mkdir(fs.as_ref(), "/p/q", Dir::new()).await.unwrap_err().is_not_exist());
        let d = fs.put("/p/q", Dir::from([("type", "D")]), 0, util::data_rx(b"")).await.unwrap();
        assert!(d.is_dir());
        let err = util::put_all(fs.as_ref(), "/x/y/z/w", Dir::from([("type", "F")]), b"").await.unwrap_err();
        assert!(err.to_string().contains("not a directory"), "{err}");
    }

    #[tokio::test]
    async fn test_new_entries_inherit_parent_mode() {
        let fs = setup();
        util::mkdir(fs.as_ref(), "/priv", Dir::from([("mode", "0700")])).await.unwrap();
        let d = util::mkdir(fs.as_ref(), "/priv/x", Dir::from([("mode", "0777")])).await.unwrap();
        assert_eq!(d.attr("mode"), "0700");
        let d = util::put_all(fs.as_ref(), "/priv/f", Dir::from([("type", "-"), ("mode", "0666")]), b"")
            .await
            .unwrap();
        assert_eq!(d.attr("mode"), "0600");
        util::mkdir(fs.as_ref(), "/grp", Dir::from([("mode", "0770")])).await.unwrap();
        let d = util::put_all(fs.as_ref(), "/grp/f", Dir::from([("type", "-")]), b"").await.unwrap();
        assert_eq!(d.attr("mode"), "0660");
    }

    #[tokio::test]
    async fn test_rename() {
        let fs = setup();
        util::mkdir_all(fs.as_ref(), "/a/b", Dir::new()).await.unwrap();
        util::put_all(fs.as_ref(), "/a/b/f", file(), b"data").await.unwrap();
        util::put_all(fs.as_ref(), "/a-b", file(), b"side").await.unwrap();
        util::mkdir(fs.as_ref(), "/c", Dir::new()).await.unwrap();

        fs.mv("/a", "/c/a").await.unwrap();
        assert!(fs.stat("/a").await.unwrap_err().is_not_exist());
        let d = fs.stat("/c/a/b/f").await.unwrap();
        assert_eq!(d.name(), "f");
        assert_eq!(d.path(), "/c/a/b/f");
        assert_eq!(util::get_all(fs.as_ref(), "/c/a/b/f").await.unwrap(), b"data");
        assert_eq!(util::get_all(fs.as_ref(), "/a-b").await.unwrap(), b"side");

        util::put_all(fs.as_ref(), "/g", file(), b"g").await.unwrap();
        fs.mv("/g", "/a-b").await.unwrap();
        assert_eq!(util::get_all(fs.as_ref(), "/a-b").await.unwrap(), b"g");
        assert!(fs.mv("/a-b", "/c").await.unwrap_err().is_exists());
        assert!(fs.mv("/c", "/a-b").await.unwrap_err().to_string().contains("inconsistent move"));
        assert!(fs.mv("/c", "/c/a/x").await.unwrap_err().to_string().contains("inconsistent move"));
    }

    #[tokio::test]
    async fn test_move_to_itself() {
        let fs = setup();
        util::put_all(fs.as_ref(), "/f", file(), b"x").await.unwrap();
        fs.mv("/f", "/f").await.unwrap();
        fs.mv("/f", "//f/").await.unwrap();
        assert!(fs.mv("/nf", "/nf").await.unwrap_err().is_not_exist());
        assert!(fs.mv("/", "/").await.unwrap_err().is_perm());
    }

    #[tokio::test]
    async fn test_remove() {
        let fs = setup();
        util::mkdir_all(fs.as_ref(), "/d/e", Dir::new()).await.unwrap();
        util::put_all(fs.as_ref(), "/d/e/f", file(), b"x").await.unwrap();
        util::put_all(fs.as_ref(), "/d-f", file(), b"x").await.unwrap();
        assert!(fs.remove("/d").await.unwrap_err().is_not_empty());
        fs.remove("/d/e/f").await.unwrap();
        fs.remove("/d/e").await.unwrap();
        util::mkdir(fs.as_ref(), "/d/e", Dir::new()).await.unwrap();
        fs.remove_all("/d").await.unwrap();
        assert!(fs.stat("/d/e").await.unwrap_err().is_not_exist());
        assert!(fs.stat("/d-f").await.is_ok());
        assert!(fs.remove("/").await.unwrap_err().is_perm());
        assert!(fs.remove("/Ctl").await.unwrap_err().is_perm());
        assert!(fs.remove("/nope").await.unwrap_err().is_not_exist());
    }

    #[tokio::test]
    async fn test_ctl() {
        let mfs = Mfs::new("ctl");
        let fs = &mfs as &dyn Fs;
        fs.stat("/").await.unwrap();
        let text = String::from_utf8(util::get_all(fs, "/Ctl").await.unwrap()).unwrap();
        assert!(text.starts_with("mfs ctl:"), "{text}");
        assert!(text.contains("stat"));

        util::put_all(fs, "/Ctl", Dir::new(), b"rdonly\n").await.unwrap();
        let err = util::put_all(fs, "/f", file(), b"x").await.unwrap_err();
        assert!(err.is_read_only());
        util::put_all(fs, "/Ctl", Dir::new(), b"nordonly\nclear\n").await.unwrap();
        util::put_all(fs, "/f", file(), b"x").await.unwrap();
        assert!(util::put_all(fs, "/Ctl", Dir::new(), b"bogus").await.is_err());
        assert_eq!(fs.stat("/Ctl").await.unwrap().attr("addr"), "mfs!ctl!/Ctl");
    }

    #[tokio::test]
    async fn test_auth_view() {
        let mfs = Mfs::new("auth");
        let fs = &mfs as &dyn Fs;
        let owner = fs.stat("/").await.unwrap().attr("Uid").to_string();
        util::mkdir(fs, "/priv", Dir::from([("mode", "0700")])).await.unwrap();
        util::put_all(fs, "/priv/f", Dir::from([("type", "-")]), b"secret").await.unwrap();
        util::put_all(fs, "/pub", Dir::from([("type", "-"), ("mode", "0644")]), b"open").await.unwrap();

        let nemo = fs.auth(Some(AuthInfo::new("nemo"))).await.unwrap();
        assert!(nemo.stat("/priv/f").await.unwrap_err().is_perm());
        assert_eq!(util::get_all(nemo.as_ref(), "/pub").await.unwrap(), b"open");
        assert!(util::put_all(nemo.as_ref(), "/pub", Dir::new(), b"x").await.unwrap_err().is_perm());
        assert!(nemo.remove("/pub").await.unwrap_err().is_perm());
        assert!(nemo.wstat("/pub", Dir::from([("mode", "0777")])).await.unwrap_err().is_perm());

        util::put_all(fs, "/Ctl", Dir::new(), b"noperm").await.unwrap();
        assert_eq!(util::get_all(nemo.as_ref(), "/priv/f").await.unwrap(), b"secret");
        util::put_all(fs, "/Ctl", Dir::new(), b"nonoperm").await.unwrap();

        let me = fs.auth(Some(AuthInfo::new(owner.as_str()))).await.unwrap();
        let d = util::put_all(me.as_ref(), "/priv/g", Dir::from([("type", "-")]), b"x").await.unwrap();
        assert_eq!(d.attr("Wuid"), owner);
        assert_eq!(d.attr("Uid"), owner);
    }

    #[tokio::test]
    async fn test_find_and_caps() {
        let fs = setup();
        util::mkdir_all(fs.as_ref(), "/a/b", Dir::new()).await.unwrap();
        util::put_all(fs.as_ref(), "/a/b/f", file(), b"x").await.unwrap();
        let ds = util::find_all(fs.as_ref(), "/", "type=-", "", "", 0).await.unwrap();
        let paths: Vec<&str> = ds.iter().map(|d| d.path()).collect();
        assert_eq!(paths, ["/a/b/f"]);
        assert!(!fs.caps().contains(Cap::Link));
        assert!(fs.caps().contains(Cap::Move));
        assert!(fs.link("/a/b/f", "/g").await.is_err());
    }

    #[tokio::test]
    async fn test_dump() {
        let mfs = Mfs::new("dump");
        util::put_all(&mfs, "/x/y", Dir::from([("type", "F")]), b"abc").await.unwrap();
        let text = mfs.dump();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3, "{text}");
        assert!(lines[1].starts_with("    ") && lines[1].contains("/x"));
        assert!(lines[2].starts_with("        ") && lines[2].contains("/x/y"));
    }
}
