//! Filesystem capability traits.
//!
//! A file tree implements any subset of the small capability traits below
//! and exposes them through the umbrella [`Fs`] trait. Callers query support
//! at run time with [`Fs::caps`] or the `as_*` accessors; the inherent
//! methods on `dyn Fs` fail with a "not implemented" error when a capability
//! is missing.
//!
//! Streams are bounded channels of `ZxResult` items. The producer ends a
//! stream successfully by dropping its sender, or with an error by sending a
//! single `Err` item. Dropping the receiver cancels the producer.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};
use tokio::sync::mpsc;

use crate::dir::Dir;
use crate::error::{ZxError, ZxResult};
use crate::perm::AuthInfo;

/// Buffered items per stream.
pub const STREAM_BUF: usize = 32;

pub type Tx<T> = mpsc::Sender<ZxResult<T>>;
pub type Rx<T> = mpsc::Receiver<ZxResult<T>>;

/// A new bounded stream.
pub fn chan<T>() -> (Tx<T>, Rx<T>) {
    mpsc::channel(STREAM_BUF)
}

/// A stream that fails right away.
pub fn err_rx<T>(e: ZxError) -> Rx<T> {
    let (tx, rx) = mpsc::channel(1);
    let _ = tx.try_send(Err(e));
    rx
}

/// A stream with the given items.
pub fn rx_from<T, I>(items: I) -> Rx<T>
where
    I: IntoIterator<Item = T>,
    I::IntoIter: ExactSizeIterator,
{
    let items = items.into_iter();
    let (tx, rx) = mpsc::channel(items.len().max(1));
    for it in items {
        let _ = tx.try_send(Ok(it));
    }
    rx
}

/// One item of a find-get stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FindItem {
    /// A matching entry. Files are followed by their data and [`FindItem::End`].
    Dir(Dir),
    Bytes(Vec<u8>),
    /// End of the data for the previous file.
    End,
}

/// Filesystem capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum Cap {
    Stat,
    Get,
    Put,
    Wstat,
    Remove,
    Move,
    Link,
    Find,
    FindGet,
    Auth,
}

impl Cap {
    fn bit(self) -> u16 {
        1 << (self as u16)
    }
}

/// Set of capabilities.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct CapSet(u16);

impl CapSet {
    pub fn empty() -> Self {
        Self(0)
    }

    pub fn all() -> Self {
        Cap::iter().collect()
    }

    pub fn insert(&mut self, c: Cap) {
        self.0 |= c.bit();
    }

    pub fn contains(&self, c: Cap) -> bool {
        self.0 & c.bit() != 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Cap> + '_ {
        Cap::iter().filter(|c| self.contains(*c))
    }
}

impl FromIterator<Cap> for CapSet {
    fn from_iter<I: IntoIterator<Item = Cap>>(iter: I) -> Self {
        let mut s = CapSet::empty();
        for c in iter {
            s.insert(c);
        }
        s
    }
}

impl fmt::Debug for CapSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

fn unsupported(what: &str) -> ZxError {
    ZxError::bug(what)
}

// ============================================================================
// Capabilities
// ============================================================================

#[async_trait]
pub trait Stater: Send + Sync {
    async fn stat(&self, path: &str) -> ZxResult<Dir>;
}

pub trait Getter: Send + Sync {
    /// Read `count` bytes at `off` (`count < 0` reads to the end).
    ///
    /// Directories yield one packed Dir per item and count entries instead
    /// of bytes.
    fn get(&self, path: &str, off: i64, count: i64) -> Rx<Vec<u8>>;
}

#[async_trait]
pub trait Putter: Send + Sync {
    /// Create or update `path` with the data from `data`.
    ///
    /// A `type` in `d` creates (or replaces) an entry of that type; without
    /// it the file must exist. `off < 0` appends. The data stream is drained
    /// even when the put fails.
    async fn put(&self, path: &str, d: Dir, off: i64, data: Rx<Vec<u8>>) -> ZxResult<Dir>;
}

#[async_trait]
pub trait Wstater: Send + Sync {
    async fn wstat(&self, path: &str, d: Dir) -> ZxResult<Dir>;
}

#[async_trait]
pub trait Remover: Send + Sync {
    async fn remove(&self, path: &str) -> ZxResult<()>;
    async fn remove_all(&self, path: &str) -> ZxResult<()>;
}

#[async_trait]
pub trait Mover: Send + Sync {
    async fn mv(&self, from: &str, to: &str) -> ZxResult<()>;
}

#[async_trait]
pub trait Linker: Send + Sync {
    async fn link(&self, old: &str, new: &str) -> ZxResult<()>;
}

pub trait Finder: Send + Sync {
    /// Stream entries under `path` matching `pred`, with paths rewritten
    /// from `spref` to `dpref`. `depth0` is the depth of `path`.
    fn find(&self, path: &str, pred: &str, spref: &str, dpref: &str, depth0: usize) -> Rx<Dir>;
}

pub trait FindGetter: Send + Sync {
    fn find_get(
        &self,
        path: &str,
        pred: &str,
        spref: &str,
        dpref: &str,
        depth0: usize,
    ) -> Rx<FindItem>;
}

#[async_trait]
pub trait Auther: Send + Sync {
    /// A view of this tree that checks permissions for `ai`.
    async fn auth(&self, ai: Option<AuthInfo>) -> ZxResult<Arc<dyn Fs>>;
}

// ============================================================================
// Umbrella
// ============================================================================

/// A file tree.
#[async_trait]
pub trait Fs: Send + Sync {
    /// Name used in diagnostics and `/Ctl` output.
    fn name(&self) -> String;

    fn as_stater(&self) -> Option<&dyn Stater> {
        None
    }

    fn as_getter(&self) -> Option<&dyn Getter> {
        None
    }

    fn as_putter(&self) -> Option<&dyn Putter> {
        None
    }

    fn as_wstater(&self) -> Option<&dyn Wstater> {
        None
    }

    fn as_remover(&self) -> Option<&dyn Remover> {
        None
    }

    fn as_mover(&self) -> Option<&dyn Mover> {
        None
    }

    fn as_linker(&self) -> Option<&dyn Linker> {
        None
    }

    fn as_finder(&self) -> Option<&dyn Finder> {
        None
    }

    fn as_find_getter(&self) -> Option<&dyn FindGetter> {
        None
    }

    fn as_auther(&self) -> Option<&dyn Auther> {
        None
    }

    /// Supported capabilities.
    fn caps(&self) -> CapSet {
        let checks = [
            (Cap::Stat, self.as_stater().is_some()),
            (Cap::Get, self.as_getter().is_some()),
            (Cap::Put, self.as_putter().is_some()),
            (Cap::Wstat, self.as_wstater().is_some()),
            (Cap::Remove, self.as_remover().is_some()),
            (Cap::Move, self.as_mover().is_some()),
            (Cap::Link, self.as_linker().is_some()),
            (Cap::Find, self.as_finder().is_some()),
            (Cap::FindGet, self.as_find_getter().is_some()),
            (Cap::Auth, self.as_auther().is_some()),
        ];
        checks.into_iter().filter(|(_, ok)| *ok).map(|(c, _)| c).collect()
    }

    /// Flush pending state and release resources.
    async fn close(&self) -> ZxResult<()> {
        Ok(())
    }
}

impl dyn Fs + '_ {
    pub async fn stat(&self, path: &str) -> ZxResult<Dir> {
        match self.as_stater() {
            Some(s) => s.stat(path).await,
            None => Err(unsupported("stat")),
        }
    }

    pub fn get(&self, path: &str, off: i64, count: i64) -> Rx<Vec<u8>> {
        match self.as_getter() {
            Some(g) => g.get(path, off, count),
            None => err_rx(unsupported("get")),
        }
    }

    pub async fn put(&self, path: &str, d: Dir, off: i64, data: Rx<Vec<u8>>) -> ZxResult<Dir> {
        match self.as_putter() {
            Some(p) => p.put(path, d, off, data).await,
            None => Err(unsupported("put")),
        }
    }

    pub async fn wstat(&self, path: &str, d: Dir) -> ZxResult<Dir> {
        match self.as_wstater() {
            Some(w) => w.wstat(path, d).await,
            None => Err(unsupported("wstat")),
        }
    }

    pub async fn remove(&self, path: &str) -> ZxResult<()> {
        match self.as_remover() {
            Some(r) => r.remove(path).await,
            None => Err(unsupported("remove")),
        }
    }

    pub async fn remove_all(&self, path: &str) -> ZxResult<()> {
        match self.as_remover() {
            Some(r) => r.remove_all(path).await,
            None => Err(unsupported("removeall")),
        }
    }

    pub async fn mv(&self, from: &str, to: &str) -> ZxResult<()> {
        match self.as_mover() {
            Some(m) => m.mv(from, to).await,
            None => Err(unsupported("move")),
        }
    }

    pub async fn link(&self, old: &str, new: &str) -> ZxResult<()> {
        match self.as_linker() {
            Some(l) => l.link(old, new).await,
            None => Err(unsupported("link")),
        }
    }

    pub fn find(&self, path: &str, pred: &str, spref: &str, dpref: &str, depth0: usize) -> Rx<Dir> {
        match self.as_finder() {
            Some(f) => f.find(path, pred, spref, dpref, depth0),
            None => err_rx(unsupported("find")),
        }
    }

    pub fn find_get(
        &self,
        path: &str,
        pred: &str,
        spref: &str,
        dpref: &str,
        depth0: usize,
    ) -> Rx<FindItem> {
        match self.as_find_getter() {
            Some(f) => f.find_get(path, pred, spref, dpref, depth0),
            None => err_rx(unsupported("findget")),
        }
    }

    pub async fn auth(&self, ai: Option<AuthInfo>) -> ZxResult<Arc<dyn Fs>> {
        match self.as_auther() {
            Some(a) => a.auth(ai).await,
            None => Err(unsupported("auth")),
        }
    }
}

impl fmt::Debug for dyn Fs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fs")
            .field("name", &self.name())
            .field("caps", &self.caps())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StatOnly;

    #[async_trait]
    impl Stater for StatOnly {
        async fn stat(&self, path: &str) -> ZxResult<Dir> {
            Ok(Dir::from([("path", path), ("type", "d")]))
        }
    }

    impl Fs for StatOnly {
        fn name(&self) -> String {
            "statonly".to_string()
        }

        fn as_stater(&self) -> Option<&dyn Stater> {
            Some(self)
        }
    }

    #[tokio::test]
    async fn test_missing_caps_fail() {
        let fs: Arc<dyn Fs> = Arc::new(StatOnly);
        assert!(fs.caps().contains(Cap::Stat));
        assert!(!fs.caps().contains(Cap::Get));
        assert_eq!(fs.stat("/x").await.unwrap().path(), "/x");
        let err = fs.remove("/x").await.unwrap_err();
        assert!(matches!(err, ZxError::Bug(_)));
        let mut rx = fs.get("/x", 0, -1);
        assert!(rx.recv().await.unwrap().is_err());
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_capset() {
        let s: CapSet = [Cap::Get, Cap::Find].into_iter().collect();
        assert!(s.contains(Cap::Find));
        assert!(!s.contains(Cap::Put));
        assert_eq!(format!("{s:?}"), "{Get, Find}");
        assert_eq!(Cap::FindGet.to_string(), "findget");
        assert_eq!(CapSet::all().iter().count(), 10);
    }
}
