//! Generic find and find-get over any tree that can stat and get.

use std::sync::Arc;

use tracing::trace;

use crate::dir::Dir;
use crate::error::{ZxError, ZxResult};
use crate::fs::{FindItem, Fs, Rx, Tx, chan};
use crate::path;
use crate::pred::Pred;
use crate::util;

/// Rewrites server paths from `spref` to `dpref`.
#[derive(Debug, Clone)]
pub struct PathRewrite {
    spref: String,
    dpref: String,
}

impl PathRewrite {
    pub fn new(spref: &str, dpref: &str) -> Self {
        let norm = |p: &str| if p.is_empty() { "/".to_string() } else { path::clean(p) };
        Self {
            spref: norm(spref),
            dpref: norm(dpref),
        }
    }

    pub fn is_identity(&self) -> bool {
        self.spref == self.dpref
    }

    pub fn apply(&self, p: &str) -> ZxResult<String> {
        if self.is_identity() {
            return Ok(p.to_string());
        }
        let suff = path::suffix(p, &self.spref);
        if suff.is_empty() {
            return Err(ZxError::not_suffix(format!("{p} not in {}", self.spref)));
        }
        Ok(path::join(&self.dpref, &suff))
    }

    /// Rewrite `d`'s path in place.
    pub fn rewrite(&self, d: &mut Dir) -> ZxResult<()> {
        let p = self.apply(d.path())?;
        d.set("path", p);
        Ok(())
    }
}

/// Walk the tree at `path` depth-first in name order sending entries that
/// match `pred`, as seen by the server (no path rewrite).
///
/// A pruned entry is sent and not descended, with `err="pruned"` when it
/// did not match. A directory that cannot be listed is sent with `err` set.
pub async fn walk(fs: &dyn Fs, path: &str, pred: &Pred, depth0: usize, tx: &Tx<Dir>) -> ZxResult<()> {
    let root = fs.stat(path).await?;
    let mut stack = vec![(root, depth0)];
    while let Some((mut d, lvl)) = stack.pop() {
        let (matched, pruned) = pred
            .eval_at(&d, lvl)
            .map_err(|e| ZxError::other(format!("eval: {e}")))?;
        trace!(path = d.path(), lvl, matched, pruned, "find at");
        if pruned {
            if !matched {
                d.set("err", "pruned");
            }
            send(tx, d).await?;
            continue;
        }
        let mut children = Vec::new();
        if d.is_dir() {
            match util::get_dir(fs, d.path()).await {
                Ok(ds) => children = ds,
                Err(e) => {
                    d.set("err", e.to_string());
                    send(tx, d).await?;
                    continue;
                }
            }
        }
        if matched {
            send(tx, d).await?;
        }
        for cd in children.into_iter().rev() {
            stack.push((cd, lvl + 1));
        }
    }
    Ok(())
}

async fn send<T>(tx: &Tx<T>, v: T) -> ZxResult<()> {
    tx.send(Ok(v))
        .await
        .map_err(|_| ZxError::closed("find: receiver gone"))
}

/// Spawn a find over `fs`.
pub fn find(fs: Arc<dyn Fs>, path: &str, pred: &str, spref: &str, dpref: &str, depth0: usize) -> Rx<Dir> {
    let (tx, rx) = chan();
    let path = path.to_string();
    let pred = pred.to_string();
    let rw = PathRewrite::new(spref, dpref);
    tokio::spawn(async move {
        if let Err(e) = find_to(fs.as_ref(), &path, &pred, &rw, depth0, &tx).await {
            let _ = tx.send(Err(e)).await;
        }
    });
    rx
}

async fn find_to(
    fs: &dyn Fs,
    path: &str,
    pred: &str,
    rw: &PathRewrite,
    depth0: usize,
    tx: &Tx<Dir>,
) -> ZxResult<()> {
    let pred = Pred::new(pred)?;
    let (wtx, mut wrx) = chan();
    let walker = async move { walk(fs, path, &pred, depth0, &wtx).await };
    let forward = async {
        while let Some(d) = wrx.recv().await {
            let mut d = d?;
            rw.rewrite(&mut d)?;
            send(tx, d).await?;
        }
        Ok::<_, ZxError>(())
    };
    let (walked, forwarded) = tokio::join!(walker, forward);
    forwarded?;
    walked
}

/// Spawn a find-get over `fs`: each matching file is followed by its data
/// and an end marker.
pub fn find_get(
    fs: Arc<dyn Fs>,
    path: &str,
    pred: &str,
    spref: &str,
    dpref: &str,
    depth0: usize,
) -> Rx<FindItem> {
    let (tx, rx) = chan();
    let path = path.to_string();
    let pred = pred.to_string();
    let rw = PathRewrite::new(spref, dpref);
    tokio::spawn(async move {
        if let Err(e) = find_get_to(fs.as_ref(), &path, &pred, &rw, depth0, &tx).await {
            let _ = tx.send(Err(e)).await;
        }
    });
    rx
}

async fn find_get_to(
    fs: &dyn Fs,
    path: &str,
    pred: &str,
    rw: &PathRewrite,
    depth0: usize,
    tx: &Tx<FindItem>,
) -> ZxResult<()> {
    let pred = Pred::new(pred)?;
    let (wtx, mut wrx) = chan();
    let walker = async move { walk(fs, path, &pred, depth0, &wtx).await };
    let forward = async {
        while let Some(d) = wrx.recv().await {
            let d = d?;
            let spath = d.path().to_string();
            let with_data = d.err().is_none() && d.typ() == "-";
            let mut nd = d;
            rw.rewrite(&mut nd)?;
            send(tx, FindItem::Dir(nd)).await?;
            if with_data {
                let mut data = fs.get(&spath, 0, -1);
                while let Some(chunk) = data.recv().await {
                    send(tx, FindItem::Bytes(chunk?)).await?;
                }
                send(tx, FindItem::End).await?;
            }
        }
        Ok::<_, ZxError>(())
    };
    let (walked, forwarded) = tokio::join!(walker, forward);
    forwarded?;
    walked
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewrite() {
        let rw = PathRewrite::new("/a", "/x/y");
        assert_eq!(rw.apply("/a/b").unwrap(), "/x/y/b");
        assert_eq!(rw.apply("/a").unwrap(), "/x/y");
        assert!(matches!(rw.apply("/b"), Err(ZxError::NotSuffix(_))));

        let rw = PathRewrite::new("/a/b", "/c");
        assert_eq!(rw.apply("/a/b/c").unwrap(), "/c/c");

        let rw = PathRewrite::new("", "");
        assert!(rw.is_identity());
        assert_eq!(rw.apply("/q").unwrap(), "/q");
    }
}
