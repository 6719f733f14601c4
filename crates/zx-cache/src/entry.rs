//! Cache entries and their state machine.
//!
//! Each entry keeps the last Dir seen for its path (`d`), attributes still
//! to be written back (`wd`), its state, and either the file body or the
//! children by name. Entries have no parent pointers; the cache finds
//! parents by walking from the root.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};
use strum::Display;

use zx_core::dir::CTL_PATH;
use zx_core::{Dir, ZxError, ZxResult, path};

use crate::buffer::Buffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum State {
    /// Known from a listing or a stat; no data yet.
    New,
    /// Attribute changes pending, no data yet.
    NewMeta,
    Clean,
    /// Attribute changes pending.
    Meta,
    /// Data (and maybe attribute) changes pending.
    Data,
    /// Removed here, not yet at the wrapped tree.
    Del,
    /// Absent at the wrapped tree.
    Gone,
}

impl State {
    pub fn is_dirty(self) -> bool {
        matches!(self, State::NewMeta | State::Meta | State::Data | State::Del)
    }
}

/// Attributes a wstat may set in the cache.
fn settable(k: &str) -> bool {
    matches!(k, "mode" | "mtime") || (zx_core::dir::is_usr_attr(k) && k != "Wuid")
}

#[derive(Debug)]
pub struct Node {
    pub d: Dir,
    pub wd: Dir,
    pub state: State,
    pub data: Buffer,
    pub children: BTreeMap<String, Arc<Entry>>,
    pub fetched: Option<Instant>,
    /// Bumped on every local change; a flush only cleans the generation it
    /// wrote.
    pub generation: u64,
}

#[derive(Debug)]
pub struct Entry {
    path: String,
    node: Mutex<Node>,
}

impl Entry {
    pub fn new(mut d: Dir, state: State) -> Arc<Entry> {
        let p = d.path().to_string();
        d.set("name", path::base(&p));
        let fetched = (!state.is_dirty()).then(Instant::now);
        Arc::new(Entry {
            path: p,
            node: Mutex::new(Node {
                d,
                wd: Dir::new(),
                state,
                data: Buffer::new(),
                children: BTreeMap::new(),
                fetched,
                generation: 0,
            }),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn lock(&self) -> MutexGuard<'_, Node> {
        self.node.lock()
    }

    pub fn dir(&self) -> Dir {
        self.node.lock().d.clone()
    }

    pub fn state(&self) -> State {
        self.node.lock().state
    }

    /// Render this entry and those below it, one per line.
    pub fn dump(&self, lvl: usize, out: &mut String) {
        let kids: Vec<Arc<Entry>> = {
            let n = self.lock();
            let _ = writeln!(out, "{:w$}{} {} {}", "", self.path, n.state, n.d.fmt(), w = lvl * 4);
            n.children.values().cloned().collect()
        };
        for c in kids {
            c.dump(lvl + 1, out);
        }
    }
}

impl Node {
    fn is_root(&self) -> bool {
        self.d.path() == "/"
    }

    pub fn meta_ok(&self, tout: Duration, stat_through: bool) -> bool {
        match self.state {
            State::New | State::Clean => {
                !stat_through && self.fetched.is_some_and(|t| t.elapsed() < tout)
            }
            _ => true,
        }
    }

    pub fn data_ok(&self, stat_through: bool) -> bool {
        match self.state {
            State::New | State::NewMeta => false,
            State::Clean | State::Meta => !(stat_through && self.d.is_dir()),
            State::Data | State::Del | State::Gone => true,
        }
    }

    /// Forget the data but keep pending attribute changes. Children of a
    /// directory stay so that unsynced ones survive the next listing.
    pub fn inval_data(&mut self) {
        self.state = match self.state {
            State::Clean => State::New,
            State::Meta => State::NewMeta,
            _ => return,
        };
        if !self.d.is_dir() {
            self.data.clear();
        }
    }

    /// Mark the entry removed here. Its children go with it.
    pub fn remove(&mut self) {
        self.generation += 1;
        self.state = State::Del;
        self.children.clear();
        self.data.clear();
        self.wd = Dir::new();
    }

    pub fn inval(&mut self) {
        self.inval_data();
        if !self.state.is_dirty() {
            self.fetched = None;
        }
    }

    pub fn dirty_meta(&mut self) {
        self.generation += 1;
        self.state = match self.state {
            State::New => State::NewMeta,
            State::Clean => State::Meta,
            s => s,
        };
    }

    pub fn dirty_data(&mut self) {
        self.generation += 1;
        self.state = State::Data;
    }

    /// Adopt attributes fetched from the wrapped tree.
    pub fn got_meta(&mut self, mut d: Dir) {
        let p = self.d.path().to_string();
        d.set("path", p.as_str());
        d.set("name", path::base(&p));
        match self.state {
            State::Del | State::Data => return,
            State::Gone => self.state = State::New,
            _ => {}
        }
        if d.typ() != self.d.typ() {
            self.children.clear();
            self.data.clear();
            self.wd = Dir::new();
            self.state = State::New;
        } else if d.mtime() != self.d.mtime() || d.size() != self.d.size() {
            self.inval_data();
        }
        for (k, v) in self.wd.iter() {
            if v.is_empty() {
                d.remove(k);
            } else {
                d.set(k, v);
            }
        }
        self.d = d;
        self.fetched = Some(Instant::now());
    }

    /// Adopt a file body fetched from the wrapped tree.
    pub fn got_data(&mut self, data: &[u8]) {
        self.state = match self.state {
            State::New => State::Clean,
            State::NewMeta => State::Meta,
            _ => return,
        };
        self.data.set(data);
        self.d.set_size(data.len() as i64);
    }

    /// Merge a listing fetched from the wrapped tree.
    ///
    /// Known children take the fetched attributes; children missing from
    /// the listing are dropped unless they were created here.
    pub fn got_dir(&mut self, ds: Vec<Dir>) {
        let st = match self.state {
            State::New | State::Clean => State::Clean,
            State::NewMeta | State::Meta => State::Meta,
            _ => return,
        };
        let mut seen = BTreeMap::new();
        for mut d in ds {
            let name = d.name().to_string();
            let cp = path::join(self.d.path(), &name);
            if cp == CTL_PATH || name.is_empty() {
                continue;
            }
            d.set("path", cp.as_str());
            let e = match self.children.remove(&name) {
                Some(e) => {
                    e.lock().got_meta(d);
                    e
                }
                None => Entry::new(d, State::New),
            };
            seen.insert(name, e);
        }
        for (name, e) in std::mem::take(&mut self.children) {
            let mut n = e.lock();
            if n.state == State::Data {
                drop(n);
                seen.insert(name, e);
            } else {
                n.state = State::Gone;
            }
        }
        self.children = seen;
        self.state = st;
        self.resize();
    }

    /// Apply a wstat; returns whether anything changed.
    pub fn wstat(&mut self, nd: &Dir) -> ZxResult<bool> {
        let mut meta = false;
        let mut data = false;
        for (k, v) in nd.iter() {
            if k == "size" {
                if self.d.is_dir() || v == self.d.attr("size") {
                    continue;
                }
                let sz: i64 = v.parse().map_err(|_| ZxError::other("size: not a number"))?;
                self.data.truncate(sz.max(0) as usize);
                self.d.set_size(sz);
                data = true;
                continue;
            }
            if !settable(k) || self.d.attr(k) == v {
                continue;
            }
            match k {
                "mode" => {
                    let m = Dir::new().with("mode", v).mode();
                    self.d.set_mode(m);
                    self.wd.set("mode", self.d.attr("mode").to_string());
                }
                "mtime" => {
                    v.parse::<i64>()
                        .map_err(|_| ZxError::other("mtime: not a number"))?;
                    self.d.set(k, v);
                    self.wd.set(k, v);
                }
                _ if v.is_empty() => {
                    self.d.remove(k);
                    self.wd.set(k, "");
                }
                _ => {
                    self.d.set(k, v);
                    self.wd.set(k, v);
                }
            }
            meta = true;
        }
        if data {
            self.dirty_data();
        } else if meta {
            self.dirty_meta();
        }
        Ok(data || meta)
    }

    /// The named child unless it was removed.
    pub fn child(&self, name: &str) -> Option<Arc<Entry>> {
        let e = self.children.get(name)?;
        match e.state() {
            State::Del | State::Gone => None,
            _ => Some(e.clone()),
        }
    }

    /// Live children in name order.
    pub fn live(&self) -> Vec<Arc<Entry>> {
        self.children
            .values()
            .filter(|e| !matches!(e.state(), State::Del | State::Gone))
            .cloned()
            .collect()
    }

    /// Drop `e` if it is still the entry for `name`.
    pub fn forget(&mut self, name: &str, e: &Arc<Entry>) {
        if self.children.get(name).is_some_and(|c| Arc::ptr_eq(c, e)) {
            self.children.remove(name);
            e.lock().state = State::Gone;
            self.resize();
        }
    }

    pub fn add(&mut self, e: Arc<Entry>) {
        self.children.insert(path::base(e.path()), e);
        self.resize();
    }

    /// Drop children already gone at the wrapped tree.
    pub fn prune(&mut self) {
        self.children.retain(|_, e| e.state() != State::Gone);
        self.resize();
    }

    /// Keep a directory's size in step with its known children. `/` also
    /// counts `/Ctl`.
    pub fn resize(&mut self) {
        if !self.d.is_dir() || !matches!(self.state, State::Clean | State::Meta | State::Data) {
            return;
        }
        let n = self.live().len() + usize::from(self.is_root());
        self.d.set_size(n as i64);
    }

    /// Record a successful flush of `generation`, adopting the Dir the
    /// wrapped tree returned.
    pub fn synced(&mut self, generation: u64, nd: Option<Dir>) {
        if self.generation != generation {
            return;
        }
        self.state = match self.state {
            State::Meta | State::Data => State::Clean,
            State::NewMeta => State::New,
            State::Del => State::Gone,
            s => s,
        };
        self.wd = Dir::new();
        if let Some(mut nd) = nd {
            nd.set("path", self.d.path().to_string());
            nd.set("name", self.d.name().to_string());
            self.d = nd;
            self.resize();
        }
        self.fetched = Some(Instant::now());
    }
}
