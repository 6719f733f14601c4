//! Write-back cache over a zx tree.
//!
//! Entries are fetched on demand and kept in memory. Changes are applied to
//! the cached entries and written back by the syncer, on `sync`, or right
//! away when `writesync` is set. Entry locks are never held across calls to
//! the wrapped tree.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use zx_core::dir::{CTL_PATH, now_ns};
use zx_core::fs::{Auther, FindGetter, Finder, Getter, Linker, Mover, Putter, Remover, Stater, Wstater};
use zx_core::fs::{FindItem, Fs, Rx, Tx, chan, rx_from};
use zx_core::perm::{self, AuthInfo};
use zx_core::stats::{Call, IoStats, Op};
use zx_core::{BoolFlag, Dir, Flags, ZxError, ZxResult, find, path, util};

use crate::buffer::Buffer;
use crate::entry::{Entry, State};

/// How long fetched metadata is trusted.
pub const CACHE_TOUT: Duration = Duration::from_secs(60);

/// How often dirty entries are written back.
pub const SYNC_IVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub rdonly: bool,
    pub tout: Duration,
    pub sync_ival: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            rdonly: false,
            tout: CACHE_TOUT,
            sync_ival: SYNC_IVAL,
        }
    }
}

macro_rules! dprintf {
    ($fs:expr, $($arg:tt)+) => {
        if $fs.inner.debug.get() {
            debug!(fs = %$fs.inner.tag, $($arg)+);
        }
    };
}

#[derive(Debug)]
struct Inner {
    fs: Arc<dyn Fs>,
    tag: String,
    root: Arc<Entry>,
    ctl: Dir,
    tout: Duration,
    debug: BoolFlag,
    verb: BoolFlag,
    writesync: BoolFlag,
    stat_through: BoolFlag,
    perms: BoolFlag,
    rdonly: BoolFlag,
    flags: Flags,
    stats: IoStats,
    syncing: tokio::sync::Mutex<()>,
    stop: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// A caching view of another zx tree.
///
/// Clones share the cache. A view made with [`Auther::auth`] checks
/// permissions for its identity against the cached entries.
#[derive(Debug, Clone)]
pub struct Cache {
    inner: Arc<Inner>,
    ai: Option<AuthInfo>,
}

async fn send<T>(tx: &Tx<T>, v: T) -> ZxResult<()> {
    tx.send(Ok(v))
        .await
        .map_err(|_| ZxError::closed("receiver gone"))
}

async fn drain(data: &mut Rx<Vec<u8>>) {
    while data.recv().await.is_some() {}
}

fn int_attr(d: &Dir, k: &str) -> ZxResult<i64> {
    d.attr(k)
        .parse()
        .map_err(|_| ZxError::other(format!("{k}: not a number")))
}

/// The Dir sent with a write-back put.
fn put_dir(d: &Dir) -> Dir {
    let mut pd = d.usr_attrs();
    pd.remove("Wuid");
    for k in ["type", "mode", "mtime"] {
        pd.set(k, d.attr(k));
    }
    if !d.is_dir() {
        pd.set("size", d.attr("size"));
    }
    pd
}

fn body(d: &Dir, buf: Buffer) -> Rx<Vec<u8>> {
    if d.is_dir() {
        return rx_from(Vec::<Vec<u8>>::new());
    }
    let (tx, rx) = chan();
    tokio::spawn(async move {
        if let Err(e) = buf.send_to(0, -1, &tx).await {
            trace!("write-back body: {e}");
        }
    });
    rx
}

fn inval_tree(e: &Arc<Entry>) {
    let kids: Vec<Arc<Entry>> = {
        let mut n = e.lock();
        n.inval();
        n.children.values().cloned().collect()
    };
    for c in &kids {
        inval_tree(c);
    }
}

impl Cache {
    /// Cache `fs`. The wrapped tree must answer stat and get.
    pub async fn new(fs: Arc<dyn Fs>, cfg: CacheConfig) -> ZxResult<Cache> {
        let mut rd = fs.stat("/").await?;
        if !rd.is_dir() {
            return Err(ZxError::not_dir("/"));
        }
        rd.set("path", "/");
        let ctl = match fs.stat(CTL_PATH).await {
            Ok(d) => d,
            Err(e) => {
                debug!("no {CTL_PATH} in {}: {e}", fs.name());
                let owner = whoami::username();
                let mut d = Dir::ctl();
                for k in ["Uid", "Gid", "Wuid"] {
                    d.set(k, owner.as_str());
                }
                d
            }
        };
        let debug = BoolFlag::default();
        let verb = BoolFlag::default();
        let writesync = BoolFlag::default();
        let stat_through = BoolFlag::default();
        let perms = BoolFlag::new(true);
        let rdonly = BoolFlag::new(cfg.rdonly);
        let mut flags = Flags::new();
        flags.add_bool("debug", &debug);
        flags.add_bool("verbdebug", &verb);
        flags.add_bool("writesync", &writesync);
        flags.add_bool("stat-through", &stat_through);
        flags.add_bool_ro("perms", &perms);
        flags.add_bool_ro("rdonly", &rdonly);
        flags.add_action("sync");
        flags.add_action("inval");
        flags.add_action("clear");
        let inner = Arc::new(Inner {
            tag: format!("cache {}", fs.name()),
            fs,
            root: Entry::new(rd, State::New),
            ctl,
            tout: cfg.tout,
            debug,
            verb,
            writesync,
            stat_through,
            perms,
            rdonly,
            flags,
            stats: IoStats::new(),
            syncing: tokio::sync::Mutex::new(()),
            stop: CancellationToken::new(),
        });
        start_syncer(&inner, cfg.sync_ival);
        info!(fs = %inner.tag, rdonly = cfg.rdonly, "cache");
        Ok(Cache { inner, ai: None })
    }

    pub fn auth_info(&self) -> Option<&AuthInfo> {
        self.ai.as_ref()
    }

    pub fn set_debug(&self, on: bool) {
        self.inner.debug.set(on);
    }

    /// The cached tree, one entry per line with its state.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        self.inner.root.dump(0, &mut out);
        out
    }

    /// Mark every cached entry stale.
    pub fn inval(&self) {
        dprintf!(self, "inval");
        inval_tree(&self.inner.root);
    }

    /// Write back every pending change.
    pub async fn sync(&self) -> ZxResult<()> {
        let _g = self.inner.syncing.lock().await;
        dprintf!(self, "sync");
        self.sync_tree(self.inner.root.clone()).await
    }

    fn sync_tree(&self, e: Arc<Entry>) -> BoxFuture<'_, ZxResult<()>> {
        async move {
            self.flush(&e).await?;
            let kids: Vec<Arc<Entry>> = e.lock().children.values().cloned().collect();
            let (dirs, files): (Vec<_>, Vec<_>) = kids.into_iter().partition(|c| c.dir().is_dir());
            let mut first_err = None;
            for res in join_all(files.iter().map(|c| self.flush(c))).await {
                if let Err(err) = res {
                    first_err.get_or_insert(err);
                }
            }
            for c in dirs {
                if let Err(err) = self.sync_tree(c).await {
                    first_err.get_or_insert(err);
                }
            }
            e.lock().prune();
            first_err.map_or(Ok(()), Err)
        }
        .boxed()
    }

    /// Write back the pending change of one entry, if any.
    async fn flush(&self, e: &Arc<Entry>) -> ZxResult<()> {
        let (state, generation, d, wd, buf) = {
            let n = e.lock();
            (n.state, n.generation, n.d.clone(), n.wd.clone(), n.data.clone())
        };
        if !state.is_dirty() {
            return Ok(());
        }
        let p = e.path();
        dprintf!(self, "flush {p} {state}");
        let fs = self.inner.fs.as_ref();
        let res = match state {
            State::Del => {
                let res = if d.is_dir() { fs.remove_all(p).await } else { fs.remove(p).await };
                match res {
                    Ok(()) => Ok(None),
                    Err(err) if err.is_not_exist() => Ok(None),
                    Err(err) => Err(err),
                }
            }
            State::Data => fs.put(p, put_dir(&d), 0, body(&d, buf)).await.map(Some),
            _ => fs.wstat(p, wd).await.map(Some),
        };
        match res {
            Ok(nd) => {
                e.lock().synced(generation, nd);
                Ok(())
            }
            Err(err) => {
                warn!(fs = %self.inner.tag, path = %p, "write back: {err}");
                Err(err)
            }
        }
    }

    /// Write back the removal of `name` in `pe` before something new takes
    /// its place.
    async fn flush_removed(&self, pe: &Arc<Entry>, name: &str) -> ZxResult<()> {
        let old = pe.lock().children.get(name).cloned();
        let Some(old) = old else {
            return Ok(());
        };
        if old.state() != State::Del {
            return Ok(());
        }
        self.flush(&old).await?;
        pe.lock().prune();
        Ok(())
    }

    async fn write_through(&self) -> ZxResult<()> {
        if self.inner.writesync.get() {
            self.sync().await?;
        }
        Ok(())
    }

    fn ai(&self) -> Option<&AuthInfo> {
        if self.inner.perms.get() { self.ai.as_ref() } else { None }
    }

    fn can(&self, d: &Dir, what: u32) -> bool {
        perm::can(self.ai(), Some(d), what)
    }

    fn check_writable(&self) -> ZxResult<()> {
        if self.inner.rdonly.get() {
            return Err(ZxError::read_only(self.name()));
        }
        Ok(())
    }

    fn done<T>(&self, call: Call, what: &str, p: &str, res: ZxResult<T>) -> ZxResult<T> {
        self.inner.stats.end(call, res.is_err());
        match &res {
            Ok(_) => dprintf!(self, "{what} {p}: ok"),
            Err(e) => dprintf!(self, "{what} {p}: {e}"),
        }
        res
    }

    async fn refresh_meta(&self, e: &Arc<Entry>) -> ZxResult<()> {
        if e.lock().meta_ok(self.inner.tout, self.inner.stat_through.get()) {
            return Ok(());
        }
        if self.inner.verb.get() {
            trace!(fs = %self.inner.tag, path = %e.path(), "fetch meta");
        }
        let d = self.inner.fs.stat(e.path()).await?;
        e.lock().got_meta(d);
        Ok(())
    }

    async fn refresh_data(&self, e: &Arc<Entry>) -> ZxResult<()> {
        let (ok, is_dir) = {
            let n = e.lock();
            (n.data_ok(self.inner.stat_through.get()), n.d.is_dir())
        };
        if ok {
            return Ok(());
        }
        if self.inner.verb.get() {
            trace!(fs = %self.inner.tag, path = %e.path(), "fetch data");
        }
        if is_dir {
            let ds = util::get_dir(self.inner.fs.as_ref(), e.path()).await?;
            e.lock().got_dir(ds);
        } else {
            let data = util::get_all(self.inner.fs.as_ref(), e.path()).await?;
            e.lock().got_data(&data);
        }
        Ok(())
    }

    /// Refetch a listing when some listed entry is stale, so all of them are
    /// refreshed at once.
    async fn refresh_listing(&self, e: &Arc<Entry>) -> ZxResult<()> {
        let (tout, st) = (self.inner.tout, self.inner.stat_through.get());
        let stale = e.lock().live().iter().any(|c| !c.lock().meta_ok(tout, st));
        if stale {
            e.lock().inval_data();
        }
        self.refresh_data(e).await
    }

    /// Look up `name` in the directory `dir`, checking walk permission.
    async fn step(&self, dir: &Arc<Entry>, name: &str) -> ZxResult<Option<Arc<Entry>>> {
        let d = dir.dir();
        if !d.is_dir() {
            return Err(ZxError::not_dir(dir.path()));
        }
        if !self.can(&d, perm::EXEC) {
            return Err(ZxError::perm(dir.path()));
        }
        self.refresh_data(dir).await?;
        let child = dir.lock().child(name);
        let Some(c) = child else {
            return Ok(None);
        };
        match self.refresh_meta(&c).await {
            Ok(()) => Ok(Some(c)),
            Err(e) if e.is_not_exist() => {
                dir.lock().forget(name, &c);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// The entry for `p`, fetching what is stale along the way.
    async fn walk(&self, p: &str) -> ZxResult<Arc<Entry>> {
        let mut e = self.inner.root.clone();
        self.refresh_meta(&e).await?;
        for name in path::elems(p) {
            let Some(c) = self.step(&e, &name).await? else {
                return Err(ZxError::not_exist(path::join(e.path(), &name)));
            };
            e = c;
        }
        Ok(e)
    }

    /// The directory holding `p`, checked for writing, and `p`'s name.
    async fn walk_parent(&self, p: &str) -> ZxResult<(Arc<Entry>, String)> {
        let pe = self.walk(&path::parent(p)).await?;
        let pd = pe.dir();
        if !pd.is_dir() {
            return Err(ZxError::not_dir(pd.path()));
        }
        if !self.can(&pd, perm::WRITE) {
            return Err(ZxError::perm(pd.path()));
        }
        Ok((pe, path::base(p)))
    }

    async fn ctl_text(&self) -> String {
        let mut text = format!("{}:\n{}{}", self.inner.tag, self.inner.flags, self.inner.stats);
        if let Ok(rctl) = util::get_all(self.inner.fs.as_ref(), CTL_PATH).await {
            text.push_str(&String::from_utf8_lossy(&rctl));
        }
        text
    }

    async fn ctl(&self, cmd: &str) -> ZxResult<()> {
        info!(fs = %self.inner.tag, "ctl {cmd}");
        if let Some(rest) = cmd.strip_prefix("pass ") {
            util::put_all(self.inner.fs.as_ref(), CTL_PATH, Dir::new(), rest.as_bytes()).await?;
            return Ok(());
        }
        let Some(act) = self.inner.flags.ctl(cmd)? else {
            return Ok(());
        };
        match act.name.as_str() {
            "clear" => {
                self.inner.stats.clear();
                Ok(())
            }
            "sync" => self.sync().await,
            "inval" => {
                self.inval();
                Ok(())
            }
            _ => Err(ZxError::bad_ctl(cmd)),
        }
    }

    async fn put_ctl(&self, data: &mut Rx<Vec<u8>>) -> ZxResult<Dir> {
        if !self.can(&self.inner.ctl, perm::WRITE) {
            return Err(ZxError::perm(CTL_PATH));
        }
        let mut buf = Vec::new();
        while let Some(chunk) = data.recv().await {
            buf.extend_from_slice(&chunk?);
        }
        let text = String::from_utf8(buf).map_err(|_| ZxError::bad_ctl("not text"))?;
        for cmd in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            self.ctl(cmd).await?;
        }
        Ok(self.inner.ctl.clone())
    }

    async fn get_to(&self, p: &str, off: i64, count: i64, tx: &Tx<Vec<u8>>, call: &mut Call) -> ZxResult<()> {
        let p = path::abs_path(p)?;
        if p == CTL_PATH {
            let text = self.ctl_text().await.into_bytes();
            let start = (off.max(0) as usize).min(text.len());
            let end = if count < 0 {
                text.len()
            } else {
                (start + count as usize).min(text.len())
            };
            call.sent(end - start);
            return send(tx, text[start..end].to_vec()).await;
        }
        let e = self.walk(&p).await?;
        let d = e.dir();
        if !self.can(&d, perm::READ) {
            return Err(ZxError::perm(&p));
        }
        if d.is_dir() {
            self.refresh_listing(&e).await?;
            let kids = e.lock().live();
            let mut ds: Vec<Dir> = kids.iter().map(|c| c.dir()).collect();
            if p == "/" {
                ds.insert(0, self.inner.ctl.clone());
            }
            let take = if count < 0 { usize::MAX } else { count as usize };
            for d in ds.into_iter().skip(off.max(0) as usize).take(take) {
                let b = d.pack()?;
                call.sent(b.len());
                send(tx, b).await?;
            }
            return Ok(());
        }
        self.refresh_data(&e).await?;
        let buf = e.lock().data.clone();
        let n = buf.send_to(off, count, tx).await?;
        call.sent(n);
        Ok(())
    }

    /// Add a new entry for `p` under `pe`, with attributes from `d` and
    /// the parent.
    fn create(&self, pe: &Arc<Entry>, p: &str, d: &Dir, mtime: i64) -> ZxResult<Arc<Entry>> {
        let mut pn = pe.lock();
        if pn.child(&path::base(p)).is_some() {
            return Err(ZxError::exists(p));
        }
        let is_dir = d.is_dir();
        let mut nd = d.usr_attrs();
        nd.remove("Wuid");
        nd.set("type", d.typ());
        nd.set("path", p);
        let mode = match d.attr("mode") {
            "" if is_dir => 0o755,
            "" => 0o644,
            _ => d.mode(),
        };
        nd.set_mode(mode);
        nd.inherit(pn.d.mode());
        nd.set_size(0);
        nd.set_mtime(mtime);
        if let Some(ai) = &self.ai {
            if nd.attr("Uid").is_empty() {
                nd.set("Uid", ai.uid.as_str());
            }
        }
        for k in ["Uid", "Gid"] {
            if nd.attr(k).is_empty() {
                nd.set(k, pn.d.attr(k));
            }
        }
        let wuid = match &self.ai {
            Some(ai) => ai.uid.clone(),
            None => nd.attr("Uid").to_string(),
        };
        nd.set("Wuid", wuid);
        let e = Entry::new(nd, State::Data);
        e.lock().dirty_data();
        pn.add(e.clone());
        Ok(e)
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
        let typ = d.typ().to_string();
        if !matches!(typ.as_str(), "" | "-" | "d") {
            return Err(ZxError::bad_type(format!("{p}: type '{typ}'")));
        }
        let mtime = if d.attr("mtime").is_empty() { now_ns() } else { int_attr(&d, "mtime")? };
        let (pe, name) = self.walk_parent(&p).await?;
        self.flush_removed(&pe, &name).await?;
        let old = self.step(&pe, &name).await?;

        if typ == "d" {
            drain(data).await;
            let e = match old {
                Some(e) if e.dir().is_dir() => return Ok(e.dir()),
                Some(_) => return Err(ZxError::exists(&p)),
                None => self.create(&pe, &p, &d, mtime)?,
            };
            self.write_through().await?;
            return Ok(e.dir());
        }

        let create = !typ.is_empty();
        let e = match old {
            Some(e) => {
                let od = e.dir();
                if od.is_dir() {
                    return Err(if create { ZxError::exists(&p) } else { ZxError::is_dir(&p) });
                }
                if !self.can(&od, perm::WRITE) {
                    return Err(ZxError::perm(&p));
                }
                let mut ud = d.usr_attrs();
                ud.remove("Wuid");
                if !d.attr("mode").is_empty() {
                    ud.set("mode", d.attr("mode"));
                }
                if self.ai().is_some() && !ud.is_empty() {
                    perm::can_wstat(self.ai(), &od, &ud)?;
                }
                self.refresh_data(&e).await?;
                e.lock().wstat(&ud)?;
                e
            }
            None if !create => return Err(ZxError::not_exist(&p)),
            None => self.create(&pe, &p, &d, mtime)?,
        };

        let buf = {
            let n = e.lock();
            if create || !d.attr("size").is_empty() {
                let sz = if d.attr("size").is_empty() { 0 } else { int_attr(&d, "size")? };
                n.data.truncate(sz.max(0) as usize);
            }
            n.data.clone()
        };
        let got = buf.recv_from(off, data).await?;
        call.sent(got);
        if self.inner.verb.get() {
            trace!(fs = %self.inner.tag, path = %p, n = got, "put data");
        }
        let nd = {
            let mut n = e.lock();
            let len = n.data.len() as i64;
            n.d.set_size(len);
            n.d.set_mtime(mtime);
            n.wd.set_mtime(mtime);
            if let Some(ai) = &self.ai {
                n.d.set("Wuid", ai.uid.as_str());
            }
            n.dirty_data();
            n.d.clone()
        };
        self.write_through().await?;
        Ok(nd)
    }

    async fn wstat_at(&self, p: &str, nd: &Dir) -> ZxResult<Dir> {
        let p = path::abs_path(p)?;
        if p == CTL_PATH {
            return Ok(self.inner.ctl.clone());
        }
        self.check_writable()?;
        let e = self.walk(&p).await?;
        let od = e.dir();
        if self.ai().is_some() {
            perm::can_wstat(self.ai(), &od, nd)?;
        }
        let size = nd.attr("size");
        if !od.is_dir() && !size.is_empty() && size != od.attr("size") {
            self.refresh_data(&e).await?;
        }
        let d = {
            let mut n = e.lock();
            if n.wstat(nd)? {
                if let Some(ai) = &self.ai {
                    n.d.set("Wuid", ai.uid.as_str());
                }
            }
            n.d.clone()
        };
        self.write_through().await?;
        Ok(d)
    }

    fn check_endpoint(p: &str) -> ZxResult<()> {
        if p == "/" || p == CTL_PATH {
            return Err(ZxError::perm(p));
        }
        Ok(())
    }

    async fn remove_at(&self, p: &str, all: bool) -> ZxResult<()> {
        let p = path::abs_path(p)?;
        self.check_writable()?;
        Self::check_endpoint(&p)?;
        let (pe, name) = self.walk_parent(&p).await?;
        let Some(e) = self.step(&pe, &name).await? else {
            return Err(ZxError::not_exist(&p));
        };
        if e.dir().is_dir() && !all {
            self.refresh_data(&e).await?;
            if !e.lock().live().is_empty() {
                return Err(ZxError::not_empty(&p));
            }
        }
        e.lock().remove();
        pe.lock().resize();
        self.write_through().await
    }

    async fn move_at(&self, from: &str, to: &str) -> ZxResult<()> {
        let from = path::abs_path(from)?;
        let to = path::abs_path(to)?;
        self.check_writable()?;
        Self::check_endpoint(&from)?;
        Self::check_endpoint(&to)?;
        if from == to {
            self.walk(&from).await?;
            return Ok(());
        }
        if path::has_prefix(&to, &from) {
            return Err(ZxError::other(format!("{from}: inconsistent move")));
        }
        let (fpe, fname) = self.walk_parent(&from).await?;
        if self.step(&fpe, &fname).await?.is_none() {
            return Err(ZxError::not_exist(&from));
        }
        let (tpe, tname) = self.walk_parent(&to).await?;

        self.sync().await?;
        self.inner.fs.mv(&from, &to).await?;

        let mut parents = vec![(fpe, fname), (tpe, tname)];
        parents.sort_by(|a, b| path::path_cmp(a.0.path(), b.0.path()));
        for (pe, name) in parents {
            let mut n = pe.lock();
            if let Some(c) = n.children.get(&name).cloned() {
                n.forget(&name, &c);
            }
            n.inval();
        }
        Ok(())
    }

    async fn link_at(&self, old: &str, new: &str) -> ZxResult<()> {
        let old = path::abs_path(old)?;
        let new = path::abs_path(new)?;
        self.check_writable()?;
        Self::check_endpoint(&old)?;
        Self::check_endpoint(&new)?;
        if path::has_prefix(&new, &old) {
            return Err(ZxError::other(format!("{new}: inconsistent link")));
        }
        self.walk(&old).await?;
        let (npe, _) = self.walk_parent(&new).await?;

        self.sync().await?;
        self.inner.fs.link(&old, &new).await?;
        npe.lock().inval();
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

fn start_syncer(inner: &Arc<Inner>, ival: Duration) {
    let Ok(rt) = tokio::runtime::Handle::try_current() else {
        debug!(fs = %inner.tag, "no runtime; changes written on sync only");
        return;
    };
    let weak = Arc::downgrade(inner);
    let stop = inner.stop.clone();
    rt.spawn(async move {
        let mut tick = tokio::time::interval(ival);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tick.tick() => {}
            }
            let Some(inner) = weak.upgrade() else {
                break;
            };
            let fs = Cache { inner, ai: None };
            if let Err(e) = fs.sync().await {
                warn!(fs = %fs.inner.tag, "sync: {e}");
            }
        }
    });
}

#[async_trait]
impl Stater for Cache {
    async fn stat(&self, p: &str) -> ZxResult<Dir> {
        dprintf!(self, "stat {p}");
        let call = self.inner.stats.start(Op::Stat);
        let res = async {
            let p = path::abs_path(p)?;
            if p == CTL_PATH {
                return Ok(self.inner.ctl.clone());
            }
            Ok(self.walk(&p).await?.dir())
        }
        .await;
        self.done(call, "stat", p, res)
    }
}

impl Getter for Cache {
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
impl Putter for Cache {
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
impl Wstater for Cache {
    async fn wstat(&self, p: &str, d: Dir) -> ZxResult<Dir> {
        dprintf!(self, "wstat {p} {d}");
        let call = self.inner.stats.start(Op::Wstat);
        let res = self.wstat_at(p, &d).await;
        self.done(call, "wstat", p, res)
    }
}

#[async_trait]
impl Remover for Cache {
    async fn remove(&self, p: &str) -> ZxResult<()> {
        dprintf!(self, "remove {p}");
        let call = self.inner.stats.start(Op::Remove);
        let res = self.remove_at(p, false).await;
        self.done(call, "remove", p, res)
    }

    async fn remove_all(&self, p: &str) -> ZxResult<()> {
        dprintf!(self, "removeall {p}");
        let call = self.inner.stats.start(Op::RemoveAll);
        let res = self.remove_at(p, true).await;
        self.done(call, "removeall", p, res)
    }
}

#[async_trait]
impl Mover for Cache {
    async fn mv(&self, from: &str, to: &str) -> ZxResult<()> {
        dprintf!(self, "move {from} {to}");
        let call = self.inner.stats.start(Op::Move);
        let res = self.move_at(from, to).await;
        self.done(call, "move", from, res)
    }
}

#[async_trait]
impl Linker for Cache {
    async fn link(&self, old: &str, new: &str) -> ZxResult<()> {
        dprintf!(self, "link {old} {new}");
        let call = self.inner.stats.start(Op::Link);
        let res = self.link_at(old, new).await;
        self.done(call, "link", new, res)
    }
}

impl Finder for Cache {
    fn find(&self, p: &str, pred: &str, spref: &str, dpref: &str, depth0: usize) -> Rx<Dir> {
        dprintf!(self, "find {p} '{pred}' '{spref}' '{dpref}' {depth0}");
        let rx = find::find(Arc::new(self.clone()), p, pred, spref, dpref, depth0);
        self.counted(Op::Find, rx)
    }
}

impl FindGetter for Cache {
    fn find_get(&self, p: &str, pred: &str, spref: &str, dpref: &str, depth0: usize) -> Rx<FindItem> {
        dprintf!(self, "findget {p} '{pred}' '{spref}' '{dpref}' {depth0}");
        let rx = find::find_get(Arc::new(self.clone()), p, pred, spref, dpref, depth0);
        self.counted(Op::FindGet, rx)
    }
}

#[async_trait]
impl Auther for Cache {
    async fn auth(&self, ai: Option<AuthInfo>) -> ZxResult<Arc<dyn Fs>> {
        if let Some(ai) = &ai {
            dprintf!(self, "auth for {} {:?}", ai.uid, ai.gids);
        }
        Ok(Arc::new(Cache {
            inner: self.inner.clone(),
            ai,
        }))
    }
}

#[async_trait]
impl Fs for Cache {
    fn name(&self) -> String {
        self.inner.tag.clone()
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

    fn as_linker(&self) -> Option<&dyn Linker> {
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

    async fn close(&self) -> ZxResult<()> {
        self.inner.stop.cancel();
        let synced = self.sync().await;
        self.inner.fs.close().await?;
        synced
    }
}
