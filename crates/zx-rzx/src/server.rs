//! Serving local trees to remote clients.
//!
//! The first call on every new connection runs the auth exchange. The
//! server then asks each tree for a view for the authenticated user and
//! handles every further call on that connection, each in its own task,
//! against those views.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use zx_core::fs::{Rx, chan};
use zx_core::{AuthInfo, Dir, FindItem, Fs, ZxError, ZxResult, path};
use zx_net::addr::DEFAULT_TREE;
use zx_net::{AuthConfig, Conn, Data, Listener, Mux, TlsConfig, at_server, is_auth_disabled};

use crate::msg::{Msg, Op};

/// How a server runs.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// Reject every request that changes a tree.
    pub rdonly: bool,
    /// Skip authentication; every client gets the server user's view.
    pub noauth: bool,
    pub auth: AuthConfig,
    pub tls: Option<TlsConfig>,
}

type Trees = IndexMap<String, Arc<dyn Fs>>;

struct Inner {
    addr: String,
    cfg: ServerConfig,
    trees: RwLock<Trees>,
    /// Connection tag to user.
    clients: Mutex<BTreeMap<String, String>>,
    stop: CancellationToken,
}

/// A zx server. Cloning gives another handle to the same server.
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server").field("addr", &self.inner.addr).finish()
    }
}

impl Server {
    /// A server that handles muxes given to [`Server::serve_mux`].
    pub fn new(addr: impl Into<String>, cfg: ServerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                addr: addr.into(),
                cfg,
                trees: RwLock::new(IndexMap::new()),
                clients: Mutex::new(BTreeMap::new()),
                stop: CancellationToken::new(),
            }),
        }
    }

    /// Listen on `addr` and serve every connection accepted there.
    pub async fn listen(addr: &str, cfg: ServerConfig) -> ZxResult<Self> {
        let mut l = zx_net::serve(addr, cfg.tls.clone()).await?;
        let srv = Self::new(l.addr(), cfg);
        let s = srv.clone();
        tokio::spawn(async move { s.accept_loop(&mut l).await });
        Ok(srv)
    }

    async fn accept_loop(&self, l: &mut Listener) {
        loop {
            let mux = tokio::select! {
                _ = self.inner.stop.cancelled() => break,
                m = l.accept() => m,
            };
            let Some(mux) = mux else { break };
            self.serve_mux(mux);
        }
        l.close();
        info!(addr = %self.inner.addr, "server exiting");
    }

    /// Address the server listens on.
    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    /// Serve `fs` as tree `name`.
    pub fn serve(&self, name: &str, fs: Arc<dyn Fs>) -> ZxResult<()> {
        let mut trees = self.inner.trees.write();
        if trees.contains_key(name) {
            return Err(ZxError::exists(format!("{}: {name} already served", self.inner.addr)));
        }
        info!(addr = %self.inner.addr, tree = name, fs = %fs.name(), "serving");
        trees.insert(name.to_string(), fs);
        Ok(())
    }

    pub fn trees(&self) -> Vec<String> {
        self.inner.trees.read().keys().cloned().collect()
    }

    /// `user tag` lines for connected clients, sorted.
    pub fn clients(&self) -> Vec<String> {
        let clients = self.inner.clients.lock();
        let mut out: Vec<String> = clients.iter().map(|(tag, uid)| format!("{uid} {tag}")).collect();
        out.sort();
        out
    }

    /// Server state as `name value` lines.
    pub fn status(&self) -> String {
        let mut s = String::new();
        let _ = writeln!(s, "server addr {}", self.inner.addr);
        let _ = writeln!(s, "server rdonly {}", on_off(self.inner.cfg.rdonly));
        let _ = writeln!(s, "server noauth {}", on_off(self.inner.cfg.noauth));
        let clients = self.clients();
        if clients.is_empty() {
            let _ = writeln!(s, "user none");
        }
        for c in clients {
            let _ = writeln!(s, "user {c}");
        }
        s
    }

    /// Handle the calls on an accepted connection.
    pub fn serve_mux(&self, mux: Mux) {
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.client(mux).await });
    }

    /// Stop accepting connections.
    pub fn close(&self) {
        self.inner.stop.cancel();
    }

    /// Wait until the server is closed.
    pub async fn wait(&self) {
        self.inner.stop.cancelled().await;
    }
}

fn on_off(b: bool) -> &'static str {
    if b { "on" } else { "off" }
}

/// Data forwarded from a put call into the tree.
fn put_data(mut rx: zx_core::Rx<Data>) -> (Rx<Vec<u8>>, tokio::task::JoinHandle<()>) {
    let (tx, drx) = chan();
    let fwd = tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            let item = match item {
                Ok(Data::Bytes(b)) => Ok(b),
                Ok(d) => Err(ZxError::proto(format!("put: unexpected {}", d.describe()))),
                Err(e) => Err(e),
            };
            let last = item.is_err();
            if tx.send(item).await.is_err() || last {
                return;
            }
        }
    });
    (drx, fwd)
}

impl Inner {
    async fn client(self: Arc<Self>, mux: Mux) {
        let tag = mux.name().to_string();
        debug!(client = %tag, "new client");
        let Some(ai) = self.auth(&mux).await else {
            return;
        };
        info!(client = %tag, uid = %ai.uid, "client authenticated");
        self.clients.lock().insert(tag.clone(), ai.uid.clone());
        let views = Arc::new(self.views(&ai).await);
        let hup = mux.hup();
        loop {
            let c = tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = hup.cancelled() => break,
                c = mux.accept() => c,
            };
            let Some(c) = c else { break };
            let (me, views, mux) = (self.clone(), views.clone(), mux.clone());
            tokio::spawn(async move { me.req(&views, &mux, c).await });
        }
        self.clients.lock().remove(&tag);
        debug!(client = %tag, "gone client");
    }

    /// Run auth on calls until one succeeds.
    async fn auth(&self, mux: &Mux) -> Option<AuthInfo> {
        while let Some(mut c) = mux.accept().await {
            if self.cfg.noauth {
                let mut cfg = self.cfg.auth.clone();
                cfg.enabled = false;
                match at_server(&mut c, &cfg).await {
                    Ok(_) => {}
                    Err(e) if is_auth_disabled(&e) => {}
                    Err(e) => {
                        warn!(addr = %self.addr, client = %mux.name(), error = %e, "auth");
                        continue;
                    }
                }
                return Some(AuthInfo::new(cfg.user.clone()));
            }
            match at_server(&mut c, &self.cfg.auth).await {
                Ok(ai) => return Some(ai),
                Err(e) => warn!(addr = %self.addr, client = %mux.name(), error = %e, "auth"),
            }
        }
        None
    }

    /// Per-user views of the served trees.
    async fn views(&self, ai: &AuthInfo) -> Trees {
        let trees: Vec<(String, Arc<dyn Fs>)> = self
            .trees
            .read()
            .iter()
            .map(|(n, fs)| (n.clone(), fs.clone()))
            .collect();
        let mut out = IndexMap::new();
        for (name, fs) in trees {
            if fs.as_auther().is_none() {
                out.insert(name, fs);
                continue;
            }
            match fs.auth(Some(ai.clone())).await {
                Ok(v) => {
                    out.insert(name, v);
                }
                Err(e) => warn!(addr = %self.addr, uid = %ai.uid, tree = %name, error = %e, "fs auth"),
            }
        }
        out
    }

    fn mkaddr(&self, d: &mut Dir, fsys: &str) {
        let old = d.attr("addr");
        let spath = match old.rfind('!') {
            Some(i) => old[i + 1..].to_string(),
            None => old.to_string(),
        };
        let spath = if spath.is_empty() { d.path().to_string() } else { spath };
        d.set("addr", format!("zx!{}!{fsys}!{spath}", self.addr));
    }

    fn check_write(&self, op: Op) -> ZxResult<()> {
        if op.is_write() && self.cfg.rdonly {
            return Err(ZxError::read_only(self.addr.as_str()));
        }
        Ok(())
    }

    /// Run one call. A request that does not decode means the peer
    /// speaks something else, and the whole connection goes.
    async fn req(&self, trees: &Trees, mux: &Mux, mut c: Conn) {
        let res = match c.recv().await {
            Some(Ok(Data::Msg(b))) => match Msg::unpack(&b) {
                Ok(m) => self.handle(trees, &m, &mut c).await,
                Err(e) => {
                    warn!(addr = %self.addr, client = %mux.name(), error = %e, "bad request, closing connection");
                    c.fail(e).await;
                    mux.close();
                    return;
                }
            },
            Some(Ok(d)) => Err(ZxError::proto(format!("unexpected {}", d.describe()))),
            Some(Err(e)) => Err(e),
            None => Ok(()),
        };
        if let Err(e) = res {
            debug!(tag = %c.tag, error = %e, "call failed");
            c.fail(e).await;
        }
    }

    async fn handle(&self, trees: &Trees, m: &Msg, c: &mut Conn) -> ZxResult<()> {
        debug!(tag = %c.tag, msg = %m, "<-");
        if m.op == Op::Trees {
            for t in trees.keys() {
                c.send(Data::Str(t.clone())).await?;
            }
            return Ok(());
        }
        let fs = match trees.get(&m.fsys) {
            Some(fs) => fs.clone(),
            None if m.fsys == DEFAULT_TREE => match trees.first() {
                Some((_, fs)) => fs.clone(),
                None => return Err(ZxError::other(format!("no fsys '{}'", m.fsys))),
            },
            None => return Err(ZxError::other(format!("no fsys '{}'", m.fsys))),
        };
        self.check_write(m.op)?;
        match m.op {
            Op::Trees => Ok(()),
            Op::Stat => {
                let mut d = fs.stat(&m.path).await?;
                self.mkaddr(&mut d, &m.fsys);
                c.send(Data::Dir(d)).await
            }
            Op::Get => self.get(fs.as_ref(), m, c).await,
            Op::Put => self.put(fs.as_ref(), m, c).await,
            Op::Wstat => {
                let mut d = fs.wstat(&m.path, m.d.clone()).await?;
                self.mkaddr(&mut d, &m.fsys);
                c.send(Data::Dir(d)).await
            }
            Op::Move => fs.mv(&m.path, &m.to).await,
            Op::Link => fs.link(&m.to, &m.path).await,
            Op::Remove | Op::RemoveAll => {
                if path::clean(&m.path) == "/" || m.path.is_empty() {
                    return Err(ZxError::perm(format!("{}: won't remove /", self.addr)));
                }
                if m.op == Op::Remove {
                    fs.remove(&m.path).await
                } else {
                    fs.remove_all(&m.path).await
                }
            }
            Op::Find => {
                let depth = m.depth.max(0) as usize;
                let mut rx = fs.find(&m.path, &m.pred, &m.spref, &m.dpref, depth);
                while let Some(d) = rx.recv().await {
                    let mut d = d?;
                    self.mkaddr(&mut d, &m.fsys);
                    c.send(Data::Dir(d)).await?;
                }
                Ok(())
            }
            Op::FindGet => {
                let depth = m.depth.max(0) as usize;
                let mut rx = fs.find_get(&m.path, &m.pred, &m.spref, &m.dpref, depth);
                while let Some(it) = rx.recv().await {
                    let data = match it? {
                        FindItem::Dir(mut d) => {
                            self.mkaddr(&mut d, &m.fsys);
                            Data::Dir(d)
                        }
                        FindItem::Bytes(b) if b.is_empty() => continue,
                        FindItem::Bytes(b) => Data::Bytes(b),
                        FindItem::End => Data::empty(),
                    };
                    c.send(data).await?;
                }
                Ok(())
            }
        }
    }

    async fn get(&self, fs: &dyn Fs, m: &Msg, c: &Conn) -> ZxResult<()> {
        let d = fs.stat(&m.path).await?;
        let is_dir = d.is_dir();
        let mut rx = fs.get(&m.path, m.off, m.count);
        while let Some(chunk) = rx.recv().await {
            let mut chunk = chunk?;
            if chunk.is_empty() {
                continue;
            }
            if is_dir {
                if let Ok((mut cd, _)) = Dir::unpack(&chunk) {
                    self.mkaddr(&mut cd, &m.fsys);
                    chunk = cd.pack()?;
                }
            }
            c.send(Data::Bytes(chunk)).await?;
        }
        Ok(())
    }

    async fn put(&self, fs: &dyn Fs, m: &Msg, c: &mut Conn) -> ZxResult<()> {
        let (data, fwd) = if m.d.is_dir() {
            (zx_core::fs::rx_from(Vec::new()), None)
        } else {
            let (_, inp) = mpsc::channel(1);
            let rx = std::mem::replace(&mut c.rx, inp);
            let (data, fwd) = put_data(rx);
            (data, Some(fwd))
        };
        let res = fs.put(&m.path, m.d.clone(), m.off, data).await;
        if let Some(fwd) = fwd {
            match res {
                Ok(_) => {
                    let _ = fwd.await;
                }
                Err(_) => fwd.abort(),
            }
        }
        let mut d = res?;
        self.mkaddr(&mut d, &m.fsys);
        c.send(Data::Dir(d)).await
    }
}
