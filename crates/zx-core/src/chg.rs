//! Changes between trees, and the comparator that computes them.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use strum::Display;

use crate::dir::{Dir, equal_dirs, now_ns};
use crate::error::{ZxError, ZxResult};
use crate::fs::{Fs, Rx, Tx, chan};
use crate::util;

/// Kind of change made to a tree with respect to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ChgKind {
    None,
    /// The entry was added.
    Add,
    /// File data changed.
    Data,
    /// Only metadata changed.
    Meta,
    /// The entry was removed.
    Del,
    /// A file became a directory or the other way around.
    DirFile,
    /// The entry could not be read.
    #[strum(serialize = "error")]
    Err,
}

/// A change to apply at `d`'s path.
#[derive(Debug, Clone)]
pub struct Chg {
    pub kind: ChgKind,
    pub d: Dir,
    /// When the change was observed, in ns since the epoch.
    pub time: i64,
    pub err: Option<ZxError>,
}

impl Chg {
    pub fn new(kind: ChgKind, d: Dir) -> Self {
        Self {
            kind,
            d,
            time: now_ns(),
            err: None,
        }
    }

    pub fn failed(d: Dir, err: ZxError) -> Self {
        Self {
            err: Some(err),
            ..Self::new(ChgKind::Err, d)
        }
    }
}

impl fmt::Display for Chg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.kind, &self.err) {
            (ChgKind::None, _) => f.write_str("none"),
            (ChgKind::Err, Some(e)) => write!(f, "error {} {e}", self.d.path()),
            (k, _) => write!(f, "{k} {}", self.d),
        }
    }
}

async fn emit(tx: &Tx<Chg>, c: Chg) -> ZxResult<()> {
    tx.send(Ok(c))
        .await
        .map_err(|_| ZxError::closed("diff: receiver gone"))
}

/// Report `d` and everything under it as `kind`, parents first.
fn diff_rec<'a>(kind: ChgKind, d: Dir, fs: &'a dyn Fs, tx: &'a Tx<Chg>) -> BoxFuture<'a, ZxResult<()>> {
    Box::pin(async move {
        let mut children = Vec::new();
        let chg = if d.is_dir() {
            match util::get_dir(fs, d.path()).await {
                Ok(ds) => {
                    children = ds;
                    Chg::new(kind, d)
                }
                Err(e) => Chg::failed(d, e),
            }
        } else {
            Chg::new(kind, d)
        };
        emit(tx, chg).await?;
        for cd in children {
            diff_rec(kind, cd, fs, tx).await?;
        }
        Ok(())
    })
}

fn diff_at<'a>(
    d1: Dir,
    d2: Dir,
    fs1: &'a dyn Fs,
    fs2: &'a dyn Fs,
    tx: &'a Tx<Chg>,
) -> BoxFuture<'a, ZxResult<()>> {
    Box::pin(async move {
        if d1.typ() != d2.typ() {
            return emit(tx, Chg::new(ChgKind::DirFile, d2)).await;
        }
        let meta_changed = !equal_dirs(&d1, &d2);
        let data_changed = meta_changed
            && (d1.attr("mtime") != d2.attr("mtime") || d1.attr("size") != d2.attr("size"));
        if !d1.is_dir() {
            let kind = if data_changed {
                ChgKind::Data
            } else if meta_changed {
                ChgKind::Meta
            } else {
                return Ok(());
            };
            return emit(tx, Chg::new(kind, d2)).await;
        }
        let listed = match util::get_dir(fs1, d1.path()).await {
            Ok(ds1) => util::get_dir(fs2, d2.path()).await.map(|ds2| (ds1, ds2)),
            Err(e) => Err(e),
        };
        let (ds1, ds2) = match listed {
            Ok(l) => l,
            Err(e) => return emit(tx, Chg::failed(d1, e)).await,
        };
        let mut it1 = ds1.into_iter().peekable();
        let mut it2 = ds2.into_iter().peekable();
        loop {
            let order = match (it1.peek(), it2.peek()) {
                (Some(c1), Some(c2)) => c1.name().cmp(c2.name()),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => return Ok(()),
            };
            match order {
                Ordering::Less => {
                    let c1 = it1.next().unwrap_or_default();
                    diff_rec(ChgKind::Del, c1, fs1, tx).await?;
                }
                Ordering::Greater => {
                    let c2 = it2.next().unwrap_or_default();
                    diff_rec(ChgKind::Add, c2, fs2, tx).await?;
                }
                Ordering::Equal => {
                    let c1 = it1.next().unwrap_or_default();
                    let c2 = it2.next().unwrap_or_default();
                    diff_at(c1, c2, fs1, fs2, tx).await?;
                }
            }
        }
    })
}

async fn diff_to(fs1: &dyn Fs, fs2: &dyn Fs, path: &str, tx: &Tx<Chg>) -> ZxResult<()> {
    let path = if path.is_empty() { "/" } else { path };
    let d1 = fs1.stat(path).await?;
    let d2 = fs2.stat(path).await?;
    diff_at(d1, d2, fs1, fs2, tx).await
}

/// Stream the changes needed for `fs1` to look like `fs2` under `path`.
pub fn diff(fs1: Arc<dyn Fs>, fs2: Arc<dyn Fs>, path: &str) -> Rx<Chg> {
    let (tx, rx) = chan();
    let path = path.to_string();
    tokio::spawn(async move {
        if let Err(e) = diff_to(fs1.as_ref(), fs2.as_ref(), &path, &tx).await {
            let _ = tx.send(Err(e)).await;
        }
    });
    rx
}

/// Like [`diff`], collecting the changes.
pub async fn diffs(fs1: &dyn Fs, fs2: &dyn Fs, path: &str) -> ZxResult<Vec<Chg>> {
    let (tx, mut rx) = chan();
    let producer = async move { diff_to(fs1, fs2, path, &tx).await };
    let collector = async {
        let mut out = Vec::new();
        while let Some(c) = rx.recv().await {
            out.push(c?);
        }
        Ok::<_, ZxError>(out)
    };
    let (produced, collected) = tokio::join!(producer, collector);
    produced?;
    collected
}
