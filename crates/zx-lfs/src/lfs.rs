//! Host-backed zx tree.
//!
//! All operations are relative to `root`; `/a/b` names `<root>/a/b`. Paths
//! are cleaned before use, so `..` cannot climb out of the root, and host
//! symbolic links are listed but never followed out of it.

use std::fs::Permissions;
use std::io::SeekFrom;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use filetime::FileTime;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use zx_core::codec::MSG_SIZE;
use zx_core::dir::CTL_PATH;
use zx_core::fs::{Auther, FindGetter, Finder, Getter, Linker, Mover, Putter, Remover, Stater, Wstater};
use zx_core::fs::{FindItem, Fs, Rx, Tx, chan};
use zx_core::perm::{self, AuthInfo};
use zx_core::stats::{Call, IoStats, Op};
use zx_core::{BoolFlag, Dir, Flags, ZxError, ZxResult, find, path};

use crate::host::{self, Names};
use crate::sidecar::{SIDECAR, Sidecars};

/// How often dirty attribute files are written.
pub const SYNC_IVAL: Duration = Duration::from_secs(15);

macro_rules! dprintf {
    ($fs:expr, $($arg:tt)+) => {
        if $fs.inner.debug.get() {
            debug!(fs = %$fs.inner.root.display(), $($arg)+);
        }
    };
}

#[derive(Debug)]
struct Inner {
    root: PathBuf,
    owner: String,
    debug: BoolFlag,
    verb: BoolFlag,
    rdonly: BoolFlag,
    flags: Flags,
    stats: IoStats,
    attrs: Sidecars,
    names: Names,
    stop: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.stop.cancel();
        if let Err(e) = self.attrs.flush() {
            warn!(root = %self.root.display(), "flushing attributes: {e}");
        }
    }
}

/// A zx tree backed by a host directory.
///
/// Clones share the tree. A view made with [`Auther::auth`] checks
/// permissions for its identity; without one no checks apply.
#[derive(Debug, Clone)]
pub struct Lfs {
    inner: Arc<Inner>,
    ai: Option<AuthInfo>,
}

fn ioerr(p: &str) -> impl Fn(std::io::Error) -> ZxError + '_ {
    move |e| ZxError::from_io(p, e)
}

fn is_sidecar(p: &str) -> bool {
    path::base(p) == SIDECAR
}

async fn send<T>(tx: &Tx<T>, v: T) -> ZxResult<()> {
    tx.send(Ok(v))
        .await
        .map_err(|_| ZxError::closed("receiver gone"))
}

async fn drain(data: &mut Rx<Vec<u8>>) {
    while data.recv().await.is_some() {}
}

fn set_mtime(p: &str, host: &Path, ns: i64) -> ZxResult<()> {
    let ft = FileTime::from_unix_time(ns.div_euclid(1_000_000_000), ns.rem_euclid(1_000_000_000) as u32);
    filetime::set_file_times(host, ft, ft).map_err(ioerr(p))
}

async fn chmod(p: &str, host: &Path, mode: u32) -> ZxResult<()> {
    tokio::fs::set_permissions(host, Permissions::from_mode(mode & 0o777))
        .await
        .map_err(ioerr(p))
}

/// Mode for a new entry of type `typ` made under `pd`.
fn new_mode(typ: &str, d: &Dir, pd: &Dir, dflt: u32) -> u32 {
    let mut nd = Dir::from([("type", typ)]);
    nd.set_mode(if d.attr("mode").is_empty() { dflt } else { d.mode() });
    nd.inherit(pd.mode());
    nd.mode()
}

fn int_attr(d: &Dir, k: &str) -> ZxResult<i64> {
    d.attr(k)
        .parse()
        .map_err(|_| ZxError::other(format!("{k}: not a number")))
}

impl Lfs {
    /// Serve the host directory `root`.
    ///
    /// Attribute files are written every [`SYNC_IVAL`] when a tokio runtime
    /// is running, and always on [`Lfs::sync`] and close.
    pub fn new(root: impl AsRef<Path>, rdonly: bool) -> ZxResult<Lfs> {
        let root = root.as_ref();
        let root = std::fs::canonicalize(root).map_err(ioerr(&root.to_string_lossy()))?;
        if !root.is_dir() {
            return Err(ZxError::not_dir(root.display().to_string()));
        }
        let debug = BoolFlag::default();
        let verb = BoolFlag::default();
        let rdonly = BoolFlag::new(rdonly);
        let mut flags = Flags::new();
        flags.add_bool("debug", &debug);
        flags.add_bool("verbdebug", &verb);
        flags.add_bool("rdonly", &rdonly);
        flags.add_action("clear");
        flags.add_action("sync");
        let inner = Arc::new(Inner {
            root,
            owner: whoami::username(),
            debug,
            verb,
            rdonly,
            flags,
            stats: IoStats::new(),
            attrs: Sidecars::new(),
            names: Names::default(),
            stop: CancellationToken::new(),
        });
        start_syncer(&inner);
        info!(root = %inner.root.display(), rdonly = inner.rdonly.get(), "host tree");
        Ok(Lfs { inner, ai: None })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn auth_info(&self) -> Option<&AuthInfo> {
        self.ai.as_ref()
    }

    pub fn set_debug(&self, on: bool) {
        self.inner.debug.set(on);
    }

    /// Write dirty attribute files.
    pub fn sync(&self) -> ZxResult<()> {
        self.inner.attrs.flush()
    }

    /// Map a tree path to its host path.
    fn resolve(&self, p: &str) -> ZxResult<(String, PathBuf)> {
        let p = path::abs_path(p)?;
        let rel = p.trim_start_matches('/');
        if rel.is_empty() {
            return Ok((p, self.inner.root.clone()));
        }
        let host = self.inner.root.join(rel);
        if !host.starts_with(&self.inner.root) || !self.inside(&host) {
            return Err(ZxError::perm(format!("{p}: path escapes root")));
        }
        Ok((p, host))
    }

    /// Whether the directories above `host` stay under the root once host
    /// symbolic links are followed. The final element is never followed.
    fn inside(&self, host: &Path) -> bool {
        for dir in host.ancestors().skip(1) {
            match std::fs::canonicalize(dir) {
                Ok(real) => return real.starts_with(&self.inner.root),
                Err(_) if dir == self.inner.root.as_path() => return true,
                Err(_) => continue,
            }
        }
        true
    }

    fn check_writable(&self) -> ZxResult<()> {
        if self.inner.rdonly.get() {
            return Err(ZxError::read_only(self.name()));
        }
        Ok(())
    }

    /// Where the attributes for `p` are kept: its parent's sidecar, or
    /// the root's own one under `/`.
    fn slot(&self, p: &str, host: &Path) -> (PathBuf, String) {
        if p == "/" {
            return (self.inner.root.clone(), "/".to_string());
        }
        let dir = host
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.inner.root.clone());
        (dir, path::base(p))
    }

    fn addr(&self, p: &str) -> String {
        format!("lfs!{}!{p}", self.inner.root.display())
    }

    fn ctl_dir(&self) -> Dir {
        let mut d = Dir::ctl();
        for k in ["Uid", "Gid", "Wuid"] {
            d.set(k, self.inner.owner.as_str());
        }
        d.set("addr", self.addr(CTL_PATH));
        d
    }

    fn can(&self, d: &Dir, what: u32) -> bool {
        self.ai.is_none() || perm::can(self.ai.as_ref(), Some(d), what)
    }

    fn done<T>(&self, call: Call, what: &str, p: &str, res: ZxResult<T>) -> ZxResult<T> {
        self.inner.stats.end(call, res.is_err());
        match &res {
            Ok(_) => dprintf!(self, "{what} {p}: ok"),
            Err(e) => dprintf!(self, "{what} {p}: {e}"),
        }
        res
    }

    /// Add host-independent attributes to a Dir made from host metadata.
    async fn complete(&self, p: &str, host: &Path, mut d: Dir, ud: &Dir) -> Dir {
        if d.is_dir() {
            let mut n = host::dir_size(host).await;
            if p == "/" {
                n += 1;
            }
            d.set_size(n);
        }
        for (k, v) in ud.iter() {
            d.set(k, v);
        }
        d.set("addr", self.addr(p));
        d
    }

    async fn stat_at(&self, p: &str, host: &Path) -> ZxResult<Dir> {
        if p == CTL_PATH {
            return Ok(self.ctl_dir());
        }
        if is_sidecar(p) {
            return Err(ZxError::not_exist(p));
        }
        let md = tokio::fs::symlink_metadata(host).await.map_err(ioerr(p))?;
        let d = host::meta_dir(p, &md, &self.inner.names);
        let (dir, name) = self.slot(p, host);
        let ud = self.inner.attrs.get(&dir, &name);
        Ok(self.complete(p, host, d, &ud).await)
    }

    /// Check walk permission on every directory above `p`.
    async fn check_walk(&self, p: &str) -> ZxResult<()> {
        if self.ai.is_none() {
            return Ok(());
        }
        let els = path::elems(p);
        for i in 0..els.len() {
            let dp = path::elems_path(&els[..i]);
            let (dp, dhost) = self.resolve(&dp)?;
            let d = self.stat_at(&dp, &dhost).await?;
            if !d.is_dir() {
                return Err(ZxError::not_dir(dp));
            }
            if !self.can(&d, perm::EXEC) {
                return Err(ZxError::perm(p));
            }
        }
        Ok(())
    }

    /// Stat `p`'s parent and check that entries can be made or removed in it.
    async fn check_parent(&self, p: &str) -> ZxResult<Dir> {
        let (pp, phost) = self.resolve(&path::parent(p))?;
        let pd = self.stat_at(&pp, &phost).await?;
        if !pd.is_dir() {
            return Err(ZxError::not_dir(pp));
        }
        if !self.can(&pd, perm::WRITE) {
            return Err(ZxError::perm(pp));
        }
        Ok(pd)
    }

    /// Entries of the directory `p`, sorted by name, with `/Ctl` first at
    /// the root.
    async fn list(&self, p: &str, host: &Path) -> ZxResult<Vec<Dir>> {
        let mut rd = tokio::fs::read_dir(host).await.map_err(ioerr(p))?;
        let uds = self.inner.attrs.all(host);
        let mut ds = Vec::new();
        while let Some(ent) = rd.next_entry().await.map_err(ioerr(p))? {
            let name = ent.file_name().to_string_lossy().into_owned();
            if name == SIDECAR {
                continue;
            }
            let cp = path::join(p, &name);
            let md = match ent.metadata().await {
                Ok(md) => md,
                Err(e) => {
                    trace!(path = %cp, "gone while listing: {e}");
                    continue;
                }
            };
            let d = host::meta_dir(&cp, &md, &self.inner.names);
            let ud = uds.get(&name).cloned().unwrap_or_default();
            ds.push(self.complete(&cp, &ent.path(), d, &ud).await);
        }
        zx_core::dir::sort_dirs(&mut ds);
        if p == "/" {
            ds.insert(0, self.ctl_dir());
        }
        Ok(ds)
    }

    fn ctl_text(&self) -> String {
        format!(
            "lfs {}:\n{}{}",
            self.inner.root.display(),
            self.inner.flags,
            self.inner.stats
        )
    }

    fn ctl(&self, cmd: &str) -> ZxResult<()> {
        info!(fs = %self.inner.root.display(), "ctl {cmd}");
        let Some(act) = self.inner.flags.ctl(cmd)? else {
            return Ok(());
        };
        match act.name.as_str() {
            "clear" => {
                self.inner.stats.clear();
                Ok(())
            }
            "sync" => self.sync(),
            _ => Err(ZxError::bad_ctl(cmd)),
        }
    }

    async fn get_to(&self, p: &str, off: i64, count: i64, tx: &Tx<Vec<u8>>, call: &mut Call) -> ZxResult<()> {
        let (p, host) = self.resolve(p)?;
        if p == CTL_PATH {
            let text = self.ctl_text().into_bytes();
            let start = (off.max(0) as usize).min(text.len());
            let end = if count < 0 {
                text.len()
            } else {
                (start + count as usize).min(text.len())
            };
            call.sent(end - start);
            return send(tx, text[start..end].to_vec()).await;
        }
        self.check_walk(&p).await?;
        let d = self.stat_at(&p, &host).await?;
        if !self.can(&d, perm::READ) {
            return Err(ZxError::perm(&p));
        }
        if d.typ() == "l" {
            return Err(ZxError::perm(format!("{p}: symbolic link")));
        }
        if d.is_dir() {
            let ds = self.list(&p, &host).await?;
            let take = if count < 0 { usize::MAX } else { count as usize };
            for d in ds.into_iter().skip(off.max(0) as usize).take(take) {
                let b = d.pack()?;
                call.sent(b.len());
                send(tx, b).await?;
            }
            return Ok(());
        }

        let mut f = tokio::fs::File::open(&host).await.map_err(ioerr(&p))?;
        if off > 0 {
            f.seek(SeekFrom::Start(off as u64)).await.map_err(ioerr(&p))?;
        }
        let mut left = if count < 0 { u64::MAX } else { count as u64 };
        let mut buf = vec![0u8; MSG_SIZE];
        while left > 0 {
            let want = left.min(MSG_SIZE as u64) as usize;
            let n = f.read(&mut buf[..want]).await.map_err(ioerr(&p))?;
            if n == 0 {
                break;
            }
            left -= n as u64;
            call.sent(n);
            if self.inner.verb.get() {
                trace!(path = %p, n, "get chunk");
            }
            send(tx, buf[..n].to_vec()).await?;
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

    /// Attributes recorded for a new entry: the caller's user attributes,
    /// plus ownership when there is an identity.
    fn new_attrs(&self, d: &Dir, parent: &Dir) -> Dir {
        let mut ud = d.usr_attrs();
        ud.remove("Wuid");
        if let Some(ai) = &self.ai {
            if ud.attr("Uid").is_empty() {
                ud.set("Uid", ai.uid.as_str());
            }
            if ud.attr("Gid").is_empty() {
                ud.set("Gid", parent.attr("Gid"));
            }
            ud.set("Wuid", ai.uid.as_str());
        }
        ud
    }

    async fn mkdir_at(&self, p: &str, host: &Path, d: &Dir) -> ZxResult<()> {
        let pd = self.check_parent(p).await?;
        let mode = new_mode("d", d, &pd, 0o755);
        tokio::fs::create_dir(host).await.map_err(ioerr(p))?;
        chmod(p, host, mode).await?;
        let (dir, name) = self.slot(p, host);
        self.inner.attrs.set(&dir, &name, &self.new_attrs(d, &pd));
        Ok(())
    }

    /// Create the missing directories in `p`.
    async fn mkdirs(&self, p: &str) -> ZxResult<()> {
        let els = path::elems(p);
        for i in 1..=els.len() {
            let (dp, dhost) = self.resolve(&path::elems_path(&els[..i]))?;
            match self.stat_at(&dp, &dhost).await {
                Ok(d) if d.is_dir() => {}
                Ok(_) => return Err(ZxError::not_dir(dp)),
                Err(e) if e.is_not_exist() => self.mkdir_at(&dp, &dhost, &Dir::new()).await?,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn put_at(&self, p: &str, d: Dir, off: i64, data: &mut Rx<Vec<u8>>, call: &mut Call) -> ZxResult<Dir> {
        let (p, host) = self.resolve(p)?;
        if p == CTL_PATH {
            return self.put_ctl(data).await;
        }
        self.check_writable()?;
        if p == "/" {
            return Err(ZxError::is_dir("/"));
        }
        if is_sidecar(&p) {
            return Err(ZxError::perm(&p));
        }
        let typ = d.typ().to_string();
        if !matches!(typ.as_str(), "" | "-" | "d" | "F" | "D") {
            return Err(ZxError::bad_type(format!("{p}: type '{typ}'")));
        }
        if matches!(typ.as_str(), "F" | "D") {
            self.mkdirs(&path::parent(&p)).await?;
        }
        self.check_walk(&p).await?;
        let old = match self.stat_at(&p, &host).await {
            Ok(od) => Some(od),
            Err(e) if e.is_not_exist() => None,
            Err(e) => return Err(e),
        };

        if matches!(typ.as_str(), "d" | "D") {
            drain(data).await;
            match &old {
                Some(od) if od.is_dir() => return Ok(od.clone()),
                Some(_) => return Err(ZxError::exists(&p)),
                None => self.mkdir_at(&p, &host, &d).await?,
            }
            if !d.attr("mtime").is_empty() {
                set_mtime(&p, &host, int_attr(&d, "mtime")?)?;
            }
            return self.stat_at(&p, &host).await;
        }

        let create = !typ.is_empty();
        let mut mode = None;
        let mut ud = match &old {
            Some(od) if od.is_dir() && create => return Err(ZxError::exists(&p)),
            Some(od) if od.is_dir() => return Err(ZxError::is_dir(&p)),
            Some(od) if od.typ() == "l" => return Err(ZxError::perm(format!("{p}: symbolic link"))),
            Some(od) => {
                if !self.can(od, perm::WRITE) {
                    return Err(ZxError::perm(&p));
                }
                let mut ud = d.usr_attrs();
                ud.remove("Wuid");
                if self.ai.is_some() && !ud.is_empty() {
                    perm::can_wstat(self.ai.as_ref(), od, &ud)?;
                }
                if let Some(ai) = &self.ai {
                    ud.set("Wuid", ai.uid.as_str());
                }
                ud
            }
            None if !create => return Err(ZxError::not_exist(&p)),
            None => {
                let pd = self.check_parent(&p).await?;
                mode = Some(new_mode("-", &d, &pd, 0o644));
                self.new_attrs(&d, &pd)
            }
        };
        if create && old.is_some() && !d.attr("mode").is_empty() {
            mode = Some(d.mode());
        }

        let mut f = tokio::fs::OpenOptions::new()
            .write(true)
            .create(create)
            .open(&host)
            .await
            .map_err(ioerr(&p))?;
        if create || !d.attr("size").is_empty() {
            let sz = if d.attr("size").is_empty() { 0 } else { int_attr(&d, "size")? };
            f.set_len(sz.max(0) as u64).await.map_err(ioerr(&p))?;
        }
        if let Some(mode) = mode {
            chmod(&p, &host, mode).await?;
        }
        if off < 0 {
            f.seek(SeekFrom::End(0)).await.map_err(ioerr(&p))?;
        } else if off > 0 {
            f.seek(SeekFrom::Start(off as u64)).await.map_err(ioerr(&p))?;
        }
        while let Some(chunk) = data.recv().await {
            let chunk = chunk?;
            f.write_all(&chunk).await.map_err(ioerr(&p))?;
            call.sent(chunk.len());
            if self.inner.verb.get() {
                trace!(path = %p, n = chunk.len(), "put chunk");
            }
        }
        f.flush().await.map_err(ioerr(&p))?;
        drop(f);

        if !d.attr("mtime").is_empty() {
            set_mtime(&p, &host, int_attr(&d, "mtime")?)?;
        }
        ud.remove("size");
        let (dir, name) = self.slot(&p, &host);
        self.inner.attrs.set(&dir, &name, &ud);
        self.stat_at(&p, &host).await
    }

    async fn wstat_at(&self, p: &str, d: &Dir) -> ZxResult<Dir> {
        let (p, host) = self.resolve(p)?;
        if p == CTL_PATH {
            return Ok(self.ctl_dir());
        }
        self.check_writable()?;
        if is_sidecar(&p) {
            return Err(ZxError::perm(&p));
        }
        self.check_walk(&p).await?;
        let old = self.stat_at(&p, &host).await?;
        if old.typ() == "l" {
            return Err(ZxError::perm(format!("{p}: symbolic link")));
        }
        if self.ai.is_some() {
            perm::can_wstat(self.ai.as_ref(), &old, d)?;
        }
        let size = d.attr("size");
        if !size.is_empty() && !old.is_dir() && size != old.attr("size") {
            let sz = int_attr(d, "size")?;
            let f = tokio::fs::OpenOptions::new()
                .write(true)
                .open(&host)
                .await
                .map_err(ioerr(&p))?;
            f.set_len(sz.max(0) as u64).await.map_err(ioerr(&p))?;
        }
        if !d.attr("mode").is_empty() {
            chmod(&p, &host, d.mode()).await?;
        }
        let mut ud = d.usr_attrs();
        ud.remove("Wuid");
        if let Some(ai) = &self.ai {
            ud.set("Wuid", ai.uid.as_str());
        }
        let (dir, name) = self.slot(&p, &host);
        self.inner.attrs.set(&dir, &name, &ud);
        if !d.attr("mtime").is_empty() {
            set_mtime(&p, &host, int_attr(d, "mtime")?)?;
        }
        self.stat_at(&p, &host).await
    }

    async fn remove_at(&self, p: &str, all: bool) -> ZxResult<()> {
        let (p, host) = self.resolve(p)?;
        self.check_writable()?;
        if p == "/" || p == CTL_PATH || is_sidecar(&p) {
            return Err(ZxError::perm(&p));
        }
        self.check_walk(&p).await?;
        let d = self.stat_at(&p, &host).await?;
        self.check_parent(&p).await?;
        if !d.is_dir() {
            tokio::fs::remove_file(&host).await.map_err(ioerr(&p))?;
        } else if all {
            tokio::fs::remove_dir_all(&host).await.map_err(ioerr(&p))?;
        } else {
            match tokio::fs::remove_dir(&host).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::DirectoryNotEmpty => {
                    if host::dir_size(&host).await > 0 {
                        return Err(ZxError::not_empty(&p));
                    }
                    tokio::fs::remove_file(host.join(SIDECAR)).await.map_err(ioerr(&p))?;
                    tokio::fs::remove_dir(&host).await.map_err(ioerr(&p))?;
                }
                Err(e) => return Err(ZxError::from_io(&p, e)),
            }
        }
        self.inner.attrs.forget_under(&host);
        let (dir, name) = self.slot(&p, &host);
        self.inner.attrs.take(&dir, &name);
        Ok(())
    }

    fn check_endpoint(p: &str) -> ZxResult<()> {
        if p == "/" || p == CTL_PATH || is_sidecar(p) {
            return Err(ZxError::perm(p));
        }
        Ok(())
    }

    async fn move_at(&self, from: &str, to: &str) -> ZxResult<()> {
        let (from, fhost) = self.resolve(from)?;
        let (to, thost) = self.resolve(to)?;
        self.check_writable()?;
        Self::check_endpoint(&from)?;
        Self::check_endpoint(&to)?;
        if from == to {
            self.check_walk(&from).await?;
            self.stat_at(&from, &fhost).await?;
            return Ok(());
        }
        if path::has_prefix(&to, &from) {
            return Err(ZxError::other(format!("{from}: inconsistent move")));
        }
        self.check_walk(&from).await?;
        self.check_walk(&to).await?;
        self.stat_at(&from, &fhost).await?;
        self.check_parent(&from).await?;
        self.check_parent(&to).await?;

        // the moved directory carries its attribute files along
        self.inner.attrs.flush_under(&fhost)?;
        self.inner.attrs.forget_under(&fhost);
        self.inner.attrs.forget_under(&thost);
        let (fdir, fname) = self.slot(&from, &fhost);
        let (tdir, tname) = self.slot(&to, &thost);
        let ud = self.inner.attrs.take(&fdir, &fname);
        if let Err(e) = tokio::fs::rename(&fhost, &thost).await {
            self.inner.attrs.set(&fdir, &fname, &ud);
            return Err(ZxError::from_io(&from, e));
        }
        self.inner.attrs.take(&tdir, &tname);
        self.inner.attrs.set(&tdir, &tname, &ud);
        Ok(())
    }

    async fn link_at(&self, old: &str, new: &str) -> ZxResult<()> {
        let (old, ohost) = self.resolve(old)?;
        let (new, nhost) = self.resolve(new)?;
        self.check_writable()?;
        Self::check_endpoint(&old)?;
        Self::check_endpoint(&new)?;
        if path::has_prefix(&new, &old) {
            return Err(ZxError::other(format!("{new}: inconsistent link")));
        }
        self.check_walk(&old).await?;
        self.check_walk(&new).await?;
        self.stat_at(&old, &ohost).await?;
        self.check_parent(&new).await?;
        tokio::fs::hard_link(&ohost, &nhost).await.map_err(ioerr(&new))
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

fn start_syncer(inner: &Arc<Inner>) {
    let Ok(rt) = tokio::runtime::Handle::try_current() else {
        debug!(root = %inner.root.display(), "no runtime; attributes written on sync only");
        return;
    };
    let weak = Arc::downgrade(inner);
    let stop = inner.stop.clone();
    rt.spawn(async move {
        let mut tick = tokio::time::interval(SYNC_IVAL);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tick.tick() => {}
            }
            let Some(inner) = weak.upgrade() else {
                break;
            };
            if let Err(e) = inner.attrs.flush() {
                warn!(root = %inner.root.display(), "attribute sync: {e}");
            }
        }
    });
}

#[async_trait]
impl Stater for Lfs {
    async fn stat(&self, p: &str) -> ZxResult<Dir> {
        dprintf!(self, "stat {p}");
        let call = self.inner.stats.start(Op::Stat);
        let res = async {
            let (p, host) = self.resolve(p)?;
            self.check_walk(&p).await?;
            self.stat_at(&p, &host).await
        }
        .await;
        self.done(call, "stat", p, res)
    }
}

impl Getter for Lfs {
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
impl Putter for Lfs {
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
impl Wstater for Lfs {
    async fn wstat(&self, p: &str, d: Dir) -> ZxResult<Dir> {
        dprintf!(self, "wstat {p} {d}");
        let call = self.inner.stats.start(Op::Wstat);
        let res = self.wstat_at(p, &d).await;
        self.done(call, "wstat", p, res)
    }
}

#[async_trait]
impl Remover for Lfs {
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
impl Mover for Lfs {
    async fn mv(&self, from: &str, to: &str) -> ZxResult<()> {
        dprintf!(self, "move {from} {to}");
        let call = self.inner.stats.start(Op::Move);
        let res = self.move_at(from, to).await;
        self.done(call, "move", from, res)
    }
}

#[async_trait]
impl Linker for Lfs {
    async fn link(&self, old: &str, new: &str) -> ZxResult<()> {
        dprintf!(self, "link {old} {new}");
        let call = self.inner.stats.start(Op::Link);
        let res = self.link_at(old, new).await;
        self.done(call, "link", new, res)
    }
}

impl Finder for Lfs {
    fn find(&self, p: &str, pred: &str, spref: &str, dpref: &str, depth0: usize) -> Rx<Dir> {
        dprintf!(self, "find {p} '{pred}' '{spref}' '{dpref}' {depth0}");
        let rx = find::find(Arc::new(self.clone()), p, pred, spref, dpref, depth0);
        self.counted(Op::Find, rx)
    }
}

impl FindGetter for Lfs {
    fn find_get(&self, p: &str, pred: &str, spref: &str, dpref: &str, depth0: usize) -> Rx<FindItem> {
        dprintf!(self, "findget {p} '{pred}' '{spref}' '{dpref}' {depth0}");
        let rx = find::find_get(Arc::new(self.clone()), p, pred, spref, dpref, depth0);
        self.counted(Op::FindGet, rx)
    }
}

#[async_trait]
impl Auther for Lfs {
    async fn auth(&self, ai: Option<AuthInfo>) -> ZxResult<Arc<dyn Fs>> {
        if let Some(ai) = &ai {
            dprintf!(self, "auth for {} {:?}", ai.uid, ai.gids);
        }
        Ok(Arc::new(Lfs {
            inner: self.inner.clone(),
            ai,
        }))
    }
}

#[async_trait]
impl Fs for Lfs {
    fn name(&self) -> String {
        format!("lfs {}", self.inner.root.display())
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
        self.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use zx_core::util;

    fn setup() -> (Arc<dyn Fs>, TempDir) {
        let tmp = TempDir::new().unwrap();
        std::fs::set_permissions(tmp.path(), Permissions::from_mode(0o755)).unwrap();
        let fs = Lfs::new(tmp.path(), false).unwrap();
        (Arc::new(fs), tmp)
    }

    fn file() -> Dir {
        Dir::from([("type", "-"), ("mode", "0644")])
    }

    #[tokio::test]
    async fn test_create_and_read() {
        let (fs, _tmp) = setup();
        let d = util::put_all(fs.as_ref(), "/f", file(), b"hello world").await.unwrap();
        assert_eq!(d.size(), 11);
        assert_eq!(d.attr("mode"), "0644");
        assert_eq!(util::get_all(fs.as_ref(), "/f").await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_partial_read() {
        let (fs, _tmp) = setup();
        util::put_all(fs.as_ref(), "/f", file(), b"hello world").await.unwrap();
        let got = util::recv_all(fs.get("/f", 6, 3)).await.unwrap().concat();
        assert_eq!(got, b"wor");
        let got = util::recv_all(fs.get("/f", 20, -1)).await.unwrap().concat();
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn test_append_and_update() {
        let (fs, _tmp) = setup();
        util::put_all(fs.as_ref(), "/f", file(), b"hello").await.unwrap();
        let d = fs
            .put("/f", Dir::new(), -1, util::data_rx(b" world"))
            .await
            .unwrap();
        assert_eq!(d.size(), 11);
        let d = fs.put("/f", Dir::new(), 0, util::data_rx(b"J")).await.unwrap();
        assert_eq!(d.size(), 11);
        assert_eq!(util::get_all(fs.as_ref(), "/f").await.unwrap(), b"Jello world");
        let err = fs.put("/nf", Dir::new(), 0, util::data_rx(b"x")).await.unwrap_err();
        assert!(err.is_not_exist());
    }

    #[tokio::test]
    async fn test_mkdir_and_list() {
        let (fs, _tmp) = setup();
        util::mkdir(fs.as_ref(), "/d", Dir::new()).await.unwrap();
        let d = util::mkdir(fs.as_ref(), "/d", Dir::new()).await.unwrap();
        assert_eq!(d.attr("mode"), "0755");
        util::put_all(fs.as_ref(), "/d/x", file(), b"x").await.unwrap();
        fs.wstat("/d/x", Dir::from([("Color", "red")])).await.unwrap();

        let ds = util::get_dir(fs.as_ref(), "/").await.unwrap();
        let names: Vec<&str> = ds.iter().map(|d| d.name()).collect();
        assert_eq!(names, ["Ctl", "d"]);
        let ds = util::get_dir(fs.as_ref(), "/d").await.unwrap();
        assert_eq!(ds.len(), 1);
        assert_eq!(ds[0].attr("Color"), "red");
        assert_eq!(ds[0].path(), "/d/x");
        assert_eq!(fs.stat("/d").await.unwrap().size(), 1);
        assert_eq!(fs.stat("/").await.unwrap().size(), 2);
    }

    #[tokio::test]
    async fn test_put_types() {
        let (fs, _tmp) = setup();
        let err = util::mkdir(fs.as_ref(), "/", Dir::new()).await.unwrap_err();
        assert!(matches!(err, ZxError::IsDir(_)));
        let err = util::put_all(fs.as_ref(), "/x", Dir::from([("type", "l")]), b"")
            .await
            .unwrap_err();
        assert!(matches!(err, ZxError::BadType(_)));
        util::put_all(fs.as_ref(), "/a/b/c", Dir::from([("type", "F")]), b"deep")
            .await
            .unwrap();
        assert!(fs.stat("/a/b").await.unwrap().is_dir());
        let err = util::put_all(fs.as_ref(), "/a/b", file(), b"").await.unwrap_err();
        assert!(err.is_exists());
        let err = util::mkdir(fs.as_ref(), "/a/b/c", Dir::new()).await.unwrap_err();
        assert!(err.is_exists());
    }

    #[tokio::test]
    async fn test_read_only() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("f"), b"x").unwrap();
        let fs: Arc<dyn Fs> = Arc::new(Lfs::new(tmp.path(), true).unwrap());
        let err = util::put_all(fs.as_ref(), "/g", file(), b"x").await.unwrap_err();
        assert!(err.is_read_only());
        assert!(fs.remove("/f").await.unwrap_err().is_read_only());
        assert_eq!(util::get_all(fs.as_ref(), "/f").await.unwrap(), b"x");
    }

    #[tokio::test]
    async fn test_path_escape_blocked() {
        let (fs, tmp) = setup();
        util::put_all(fs.as_ref(), "/../../f", file(), b"x").await.unwrap();
        assert!(tmp.path().join("f").exists());
        assert!(fs.stat("rel").await.is_err());
    }

    #[tokio::test]
    async fn test_symlink_escape_blocked() {
        let (fs, tmp) = setup();
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("secret"), b"secret").unwrap();
        std::os::unix::fs::symlink(outside.path(), tmp.path().join("out")).unwrap();
        std::os::unix::fs::symlink(outside.path().join("secret"), tmp.path().join("s")).unwrap();

        assert_eq!(fs.stat("/out").await.unwrap().typ(), "l");
        assert!(fs.stat("/out/secret").await.unwrap_err().is_perm());
        assert!(util::get_all(fs.as_ref(), "/out/secret").await.unwrap_err().is_perm());
        assert!(util::get_all(fs.as_ref(), "/s").await.unwrap_err().is_perm());
        let err = util::put_all(fs.as_ref(), "/out/new", file(), b"x").await.unwrap_err();
        assert!(err.is_perm());
        let err = util::put_all(fs.as_ref(), "/s", Dir::new(), b"x").await.unwrap_err();
        assert!(err.is_perm());
        assert!(fs.wstat("/s", Dir::from([("mode", "0777")])).await.unwrap_err().is_perm());
        assert!(!outside.path().join("new").exists());
        assert_eq!(std::fs::read(outside.path().join("secret")).unwrap(), b"secret");

        // links that stay inside the tree can be walked
        util::mkdir(fs.as_ref(), "/d", Dir::new()).await.unwrap();
        util::put_all(fs.as_ref(), "/d/f", file(), b"in").await.unwrap();
        std::os::unix::fs::symlink("d", tmp.path().join("dl")).unwrap();
        assert_eq!(util::get_all(fs.as_ref(), "/dl/f").await.unwrap(), b"in");
        fs.remove("/s").await.unwrap();
        assert!(outside.path().join("secret").exists());
    }

    #[tokio::test]
    async fn test_new_entries_inherit_parent_mode() {
        let (fs, _tmp) = setup();
        util::mkdir(fs.as_ref(), "/priv", Dir::from([("mode", "0700")])).await.unwrap();
        let d = util::mkdir(fs.as_ref(), "/priv/x", Dir::from([("mode", "0777")])).await.unwrap();
        assert_eq!(d.attr("mode"), "0700");
        let d = util::put_all(fs.as_ref(), "/priv/f", Dir::from([("type", "-"), ("mode", "0666")]), b"x")
            .await
            .unwrap();
        assert_eq!(d.attr("mode"), "0600");

        util::mkdir(fs.as_ref(), "/grp", Dir::from([("mode", "0770")])).await.unwrap();
        let d = util::mkdir(fs.as_ref(), "/grp/x", Dir::from([("mode", "0700")])).await.unwrap();
        assert_eq!(d.attr("mode"), "0770");
        let d = util::put_all(fs.as_ref(), "/grp/f", file(), b"x").await.unwrap();
        assert_eq!(d.attr("mode"), "0660");
        let d = util::put_all(fs.as_ref(), "/grp/F/f", Dir::from([("type", "F")]), b"x")
            .await
            .unwrap();
        assert_eq!(d.attr("mode"), "0660");
        assert_eq!(fs.stat("/grp/F").await.unwrap().attr("mode"), "0770");

        // an explicit mode on an existing file is taken as given
        let d = util::put_all(fs.as_ref(), "/grp/f", Dir::from([("type", "-"), ("mode", "0604")]), b"y")
            .await
            .unwrap();
        assert_eq!(d.attr("mode"), "0604");
    }

    #[tokio::test]
    async fn test_move_to_itself() {
        let (fs, _tmp) = setup();
        util::put_all(fs.as_ref(), "/f", file(), b"x").await.unwrap();
        fs.mv("/f", "/f").await.unwrap();
        fs.mv("/f", "//f/").await.unwrap();
        assert_eq!(util::get_all(fs.as_ref(), "/f").await.unwrap(), b"x");
        assert!(fs.mv("/nf", "/nf").await.unwrap_err().is_not_exist());
        assert!(fs.mv("/", "/").await.unwrap_err().is_perm());
    }

    #[tokio::test]
    async fn test_sidecar_hidden() {
        let (fs, _tmp) = setup();
        assert!(fs.stat("/.zx").await.unwrap_err().is_not_exist());
        let err = util::put_all(fs.as_ref(), "/.zx", file(), b"x").await.unwrap_err();
        assert!(err.is_perm());
    }

    #[tokio::test]
    async fn test_rename_carries_attrs() {
        let (fs, _tmp) = setup();
        util::put_all(fs.as_ref(), "/f", file(), b"x").await.unwrap();
        fs.wstat("/f", Dir::from([("Color", "red")])).await.unwrap();
        fs.mv("/f", "/g").await.unwrap();
        assert!(fs.stat("/f").await.unwrap_err().is_not_exist());
        assert_eq!(fs.stat("/g").await.unwrap().attr("Color"), "red");

        util::mkdir(fs.as_ref(), "/d", Dir::new()).await.unwrap();
        fs.mv("/g", "/d/g").await.unwrap();
        fs.mv("/d", "/e").await.unwrap();
        assert_eq!(fs.stat("/e/g").await.unwrap().attr("Color"), "red");
        let err = fs.mv("/e", "/e/x").await.unwrap_err();
        assert!(err.to_string().contains("inconsistent move"));
        assert!(fs.mv("/Ctl", "/x").await.unwrap_err().is_perm());
    }

    #[tokio::test]
    async fn test_truncate() {
        let (fs, _tmp) = setup();
        util::put_all(fs.as_ref(), "/f", file(), b"hello world").await.unwrap();
        let d = fs.wstat("/f", Dir::from([("size", "5")])).await.unwrap();
        assert_eq!(d.size(), 5);
        assert_eq!(util::get_all(fs.as_ref(), "/f").await.unwrap(), b"hello");
        let d = fs
            .wstat("/f", Dir::from([("mode", "0600"), ("mtime", "5000000000")]))
            .await
            .unwrap();
        assert_eq!(d.attr("mode"), "0600");
        assert_eq!(d.mtime(), 5_000_000_000);
    }

    #[tokio::test]
    async fn test_hard_link() {
        let (fs, _tmp) = setup();
        util::put_all(fs.as_ref(), "/f", file(), b"shared").await.unwrap();
        fs.link("/f", "/g").await.unwrap();
        fs.put("/g", Dir::new(), -1, util::data_rx(b"!")).await.unwrap();
        assert_eq!(util::get_all(fs.as_ref(), "/f").await.unwrap(), b"shared!");
        util::mkdir(fs.as_ref(), "/d", Dir::new()).await.unwrap();
        let err = fs.link("/d", "/d/x").await.unwrap_err();
        assert!(err.to_string().contains("inconsistent link"));
    }

    #[tokio::test]
    async fn test_remove() {
        let (fs, tmp) = setup();
        util::mkdir(fs.as_ref(), "/d", Dir::new()).await.unwrap();
        util::put_all(fs.as_ref(), "/d/f", file(), b"x").await.unwrap();
        fs.wstat("/d/f", Dir::from([("Color", "red")])).await.unwrap();
        fs.close().await.unwrap();
        assert!(tmp.path().join("d").join(SIDECAR).exists());
        assert!(fs.remove("/d").await.unwrap_err().is_not_empty());

        // only the attribute file is left
        std::fs::remove_file(tmp.path().join("d/f")).unwrap();
        fs.remove("/d").await.unwrap();
        assert!(!tmp.path().join("d").exists());

        assert!(fs.remove("/").await.unwrap_err().is_perm());
        assert!(fs.remove("/Ctl").await.unwrap_err().is_perm());
        assert!(fs.remove("/nope").await.unwrap_err().is_not_exist());
        util::mkdir_all(fs.as_ref(), "/x/y/z", Dir::new()).await.unwrap();
        fs.remove_all("/x").await.unwrap();
        assert!(fs.stat("/x").await.unwrap_err().is_not_exist());
    }

    #[tokio::test]
    async fn test_ctl() {
        let (fs, _tmp) = setup();
        fs.stat("/").await.unwrap();
        let ctl = String::from_utf8(util::get_all(fs.as_ref(), "/Ctl").await.unwrap()).unwrap();
        assert!(ctl.starts_with("lfs "));
        assert!(ctl.contains("debug off"));
        assert!(ctl.contains("stat"));

        util::put_all(fs.as_ref(), "/Ctl", Dir::new(), b"debug on\nclear").await.unwrap();
        let ctl = String::from_utf8(util::get_all(fs.as_ref(), "/Ctl").await.unwrap()).unwrap();
        assert!(ctl.contains("debug on"));

        util::put_all(fs.as_ref(), "/Ctl", Dir::new(), b"rdonly").await.unwrap();
        let err = util::put_all(fs.as_ref(), "/f", file(), b"x").await.unwrap_err();
        assert!(err.is_read_only());
        let err = util::put_all(fs.as_ref(), "/Ctl", Dir::new(), b"bogus").await.unwrap_err();
        assert!(matches!(err, ZxError::BadCtl(_)));
    }

    #[tokio::test]
    async fn test_auth_view() {
        let (fs, _tmp) = setup();
        util::mkdir(fs.as_ref(), "/priv", Dir::from([("mode", "0700")])).await.unwrap();
        util::put_all(fs.as_ref(), "/priv/f", file(), b"secret").await.unwrap();
        util::put_all(fs.as_ref(), "/pub", file(), b"hi").await.unwrap();
        let owner = fs.stat("/priv").await.unwrap().attr("Uid").to_string();

        let nemo = fs.auth(Some(AuthInfo::new("nemo"))).await.unwrap();
        assert!(nemo.stat("/priv/f").await.unwrap_err().is_perm());
        assert_eq!(util::get_all(nemo.as_ref(), "/pub").await.unwrap(), b"hi");
        let err = util::put_all(nemo.as_ref(), "/pub", Dir::new(), b"x").await.unwrap_err();
        assert!(err.is_perm());
        let err = nemo.wstat("/pub", Dir::from([("mode", "0777")])).await.unwrap_err();
        assert!(err.is_perm());

        let me = fs.auth(Some(AuthInfo::new(owner.as_str()))).await.unwrap();
        assert_eq!(util::get_all(me.as_ref(), "/priv/f").await.unwrap(), b"secret");
        let d = me.wstat("/pub", Dir::from([("Color", "red")])).await.unwrap();
        assert_eq!(d.attr("Wuid"), owner);
    }
}
