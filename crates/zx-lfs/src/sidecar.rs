//! User attributes kept in a `.zx` file inside each directory.
//!
//! The file is a sequence of packed Dirs, each holding a `name` and the user
//! attributes of that entry. Later records for a name replace earlier ones.
//! Files are read on first use, cached, and written back by [`Sidecars::flush`].

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, warn};

use zx_core::{Dir, ZxError, ZxResult};

/// Name of the attribute file.
pub const SIDECAR: &str = ".zx";

#[derive(Debug, Default)]
struct DirAttrs {
    ents: BTreeMap<String, Dir>,
    /// Records found in the file when it was read.
    recs: usize,
    dirty: bool,
}

impl DirAttrs {
    fn load(dir: &Path) -> DirAttrs {
        let fname = dir.join(SIDECAR);
        let data = match std::fs::read(&fname) {
            Ok(data) => data,
            Err(_) => return DirAttrs::default(),
        };
        let mut da = DirAttrs::default();
        let mut b = data.as_slice();
        while !b.is_empty() {
            match Dir::unpack(b) {
                Ok((d, rest)) => {
                    da.recs += 1;
                    let name = d.attr("name").to_string();
                    da.ents.insert(name, d.usr_attrs());
                    b = rest;
                }
                Err(e) => {
                    warn!(file = %fname.display(), "bad attribute file: {e}");
                    da.dirty = true;
                    break;
                }
            }
        }
        da.ents.retain(|_, d| !d.is_empty());
        if da.recs > 2 * da.ents.len() {
            da.dirty = true;
        }
        da
    }

    fn pack(&self) -> ZxResult<Vec<u8>> {
        let mut buf = Vec::new();
        for (name, d) in &self.ents {
            d.clone().with("name", name.as_str()).pack_into(&mut buf)?;
        }
        Ok(buf)
    }

    fn write(&mut self, dir: &Path) -> ZxResult<()> {
        let fname = dir.join(SIDECAR);
        if self.ents.is_empty() {
            match std::fs::remove_file(&fname) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(ZxError::from_io(&fname.to_string_lossy(), e)),
            }
        } else {
            let data = self.pack()?;
            let mut f = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&fname)
                .map_err(|e| ZxError::from_io(&fname.to_string_lossy(), e))?;
            f.write_all(&data)
                .map_err(|e| ZxError::from_io(&fname.to_string_lossy(), e))?;
        }
        self.recs = self.ents.len();
        self.dirty = false;
        Ok(())
    }
}

/// Cached attribute files, keyed by host directory.
#[derive(Debug, Default)]
pub struct Sidecars {
    dirs: Mutex<HashMap<PathBuf, DirAttrs>>,
}

impl Sidecars {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, dir: &Path, f: impl FnOnce(&mut DirAttrs) -> R) -> R {
        let mut dirs = self.dirs.lock();
        let da = dirs
            .entry(dir.to_path_buf())
            .or_insert_with(|| DirAttrs::load(dir));
        f(da)
    }

    /// User attributes for `name` in `dir`.
    pub fn get(&self, dir: &Path, name: &str) -> Dir {
        self.with(dir, |da| da.ents.get(name).cloned().unwrap_or_default())
    }

    /// All attributes recorded in `dir`.
    pub fn all(&self, dir: &Path) -> BTreeMap<String, Dir> {
        self.with(dir, |da| da.ents.clone())
    }

    /// Merge the user attributes of `d` into `name`'s; an empty value
    /// removes the attribute.
    pub fn set(&self, dir: &Path, name: &str, d: &Dir) {
        let ud = d.usr_attrs();
        if ud.is_empty() {
            return;
        }
        self.with(dir, |da| {
            let ent = da.ents.entry(name.to_string()).or_default();
            for (k, v) in ud.iter() {
                if v.is_empty() {
                    ent.remove(k);
                } else {
                    ent.set(k, v);
                }
            }
            if ent.is_empty() {
                da.ents.remove(name);
            }
            da.dirty = true;
        });
    }

    /// Remove and return the attributes for `name`.
    pub fn take(&self, dir: &Path, name: &str) -> Dir {
        self.with(dir, |da| match da.ents.remove(name) {
            Some(d) => {
                da.dirty = true;
                d
            }
            None => Dir::new(),
        })
    }

    /// Drop cached files for `p` and the directories below it, unwritten.
    pub fn forget_under(&self, p: &Path) {
        self.dirs.lock().retain(|dir, _| !dir.starts_with(p));
    }

    /// Write the dirty files for `p` and the directories below it.
    pub fn flush_under(&self, p: &Path) -> ZxResult<()> {
        self.flush_if(|dir| dir.starts_with(p))
    }

    /// Write every dirty file.
    pub fn flush(&self) -> ZxResult<()> {
        self.flush_if(|_| true)
    }

    fn flush_if(&self, want: impl Fn(&Path) -> bool) -> ZxResult<()> {
        let mut dirs = self.dirs.lock();
        let mut first_err = None;
        let mut gone = Vec::new();
        for (dir, da) in dirs.iter_mut() {
            if !da.dirty || !want(dir) {
                continue;
            }
            debug!(dir = %dir.display(), "writing attributes");
            if let Err(e) = da.write(dir) {
                if e.is_not_exist() {
                    gone.push(dir.clone());
                } else {
                    warn!(dir = %dir.display(), "writing attributes: {e}");
                    first_err.get_or_insert(e);
                }
            }
        }
        for dir in gone {
            dirs.remove(&dir);
        }
        first_err.map_or(Ok(()), Err)
    }
}
