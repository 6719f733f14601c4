//! Client side of a remote tree.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use zx_core::fs::{Rx, chan};
use zx_core::{
    AuthInfo, Dir, FindGetter, FindItem, Finder, Fs, Getter, Linker, Mover, Putter, Remover,
    Stater, Wstater, ZxError, ZxResult,
};
use zx_net::addr::{DEFAULT_TREE, fill_addr};
use zx_net::{AuthConfig, Conn, Data, Mux, TlsConfig, at_client, is_auth_disabled};

use crate::msg::{Msg, Op};

fn bad_msg(d: &Data) -> ZxError {
    ZxError::proto(format!("bad message type {}", d.describe()))
}

/// How to dial a server.
#[derive(Debug, Clone, Default)]
pub struct DialOpts {
    pub auth: AuthConfig,
    pub tls: Option<TlsConfig>,
}

/// A remote tree on a zx server.
///
/// Clones and the clients returned by [`Client::fsys`] share the connection.
#[derive(Clone)]
pub struct Client {
    mux: Mux,
    addr: String,
    fsys: String,
    trees: Arc<BTreeSet<String>>,
    ai: Option<AuthInfo>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("addr", &self.addr)
            .field("fsys", &self.fsys)
            .finish()
    }
}

/// Split `net!host!port!tree` into the transport address and the tree.
fn split_addr(addr: &str) -> (String, String) {
    let addr = fill_addr(addr);
    let toks: Vec<&str> = addr.splitn(5, '!').collect();
    let tree = toks.get(3).copied().filter(|t| !t.is_empty()).unwrap_or(DEFAULT_TREE);
    (toks[..toks.len().min(3)].join("!"), tree.to_string())
}

impl Client {
    /// Dial `addr`, completed with [`fill_addr`], and return its tree.
    pub async fn dial(addr: &str, opts: &DialOpts) -> ZxResult<Client> {
        let (taddr, fsys) = split_addr(addr);
        let mux = zx_net::dial(&taddr, opts.tls.as_ref()).await?;
        match Self::start(mux.clone(), &taddr, &fsys, opts).await {
            Ok(c) => Ok(c),
            Err(e) => {
                mux.close();
                Err(e)
            }
        }
    }

    /// Run the client side of the protocol over an existing mux.
    pub async fn start(mux: Mux, addr: &str, fsys: &str, opts: &DialOpts) -> ZxResult<Client> {
        let mut call = mux.rpc()?;
        let ai = match at_client(&mut call, &opts.auth).await {
            Ok(ai) => Some(ai),
            Err(e) if is_auth_disabled(&e) => {
                warn!(addr, error = %e, "dial");
                None
            }
            Err(e) => return Err(ZxError::auth(format!("{addr}: {e}"))),
        };
        drop(call);
        let mut c = Client {
            mux,
            addr: addr.to_string(),
            fsys: fsys.to_string(),
            trees: Arc::new(BTreeSet::new()),
            ai,
        };
        c.trees = Arc::new(c.get_trees().await?);
        if !c.trees.contains(fsys) {
            return Err(ZxError::other(format!("no fsys '{fsys}' found in server")));
        }
        debug!(addr, fsys, "dialled");
        Ok(c)
    }

    async fn get_trees(&self) -> ZxResult<BTreeSet<String>> {
        let mut c = self.call(Msg::trees()).await?;
        let mut trees = BTreeSet::new();
        while let Some(it) = c.recv().await {
            match it? {
                Data::Str(s) => {
                    trees.insert(s);
                }
                d => return Err(bad_msg(&d)),
            }
        }
        trees.insert(DEFAULT_TREE.to_string());
        Ok(trees)
    }

    /// Another tree on the same connection.
    pub fn fsys(&self, name: &str) -> ZxResult<Client> {
        if name != DEFAULT_TREE && !self.trees.contains(name) {
            return Err(ZxError::other(format!("no fsys '{name}'")));
        }
        let mut c = self.clone();
        c.fsys = name.to_string();
        Ok(c)
    }

    /// Tree names served, sorted.
    pub fn trees(&self) -> Vec<String> {
        self.trees.iter().cloned().collect()
    }

    /// Transport address.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn tree(&self) -> &str {
        &self.fsys
    }

    /// Who we authenticated as, if auth ran.
    pub fn auth_info(&self) -> Option<&AuthInfo> {
        self.ai.as_ref()
    }

    /// Fires when the connection goes away.
    pub fn hup(&self) -> CancellationToken {
        self.mux.hup()
    }

    pub fn is_closed(&self) -> bool {
        self.mux.is_closed()
    }

    /// Stat `/`; on timeout the connection is closed.
    pub async fn ping(&self, timeout: Duration) -> ZxResult<()> {
        match tokio::time::timeout(timeout, self.stat_msg("/")).await {
            Ok(r) => r.map(|_| ()),
            Err(_) => {
                warn!(addr = %self.addr, "ping timed out");
                self.mux.close();
                Err(ZxError::timeout(format!("{}: ping timed out", self.addr)))
            }
        }
    }

    /// Tear down the connection.
    pub fn close(&self) {
        self.mux.close();
    }

    fn msg(&self, op: Op, path: &str) -> Msg {
        Msg::new(op, &self.fsys, path)
    }

    /// Start a call with `m`. The outbound half stays open.
    async fn open(&self, m: Msg) -> ZxResult<Conn> {
        trace!(addr = %self.addr, msg = %m, "->");
        let c = self.mux.rpc()?;
        c.send(Data::Msg(m.pack()?)).await?;
        Ok(c)
    }

    /// Start a call with `m` and close the outbound half.
    async fn call(&self, m: Msg) -> ZxResult<Rx<Data>> {
        let Conn { rx, .. } = self.open(m).await?;
        Ok(rx)
    }

    async fn dir_call(&self, m: Msg) -> ZxResult<Dir> {
        let mut rx = self.call(m).await?;
        match rx.recv().await {
            Some(Ok(Data::Dir(d))) => {
                trace!(addr = %self.addr, dir = %d.long_fmt(), "<-");
                Ok(d)
            }
            Some(Ok(d)) => Err(bad_msg(&d)),
            Some(Err(e)) => Err(e),
            None => Err(ZxError::proto("no reply")),
        }
    }

    async fn err_call(&self, m: Msg) -> ZxResult<()> {
        let mut rx = self.call(m).await?;
        while let Some(it) = rx.recv().await {
            it?;
        }
        Ok(())
    }

    async fn stat_msg(&self, path: &str) -> ZxResult<Dir> {
        self.dir_call(self.msg(Op::Stat, path)).await
    }

    /// Forward the replies of a call to a new stream, converting each item.
    fn stream<T, F>(&self, m: Msg, conv: F) -> Rx<T>
    where
        T: Send + 'static,
        F: Fn(Data) -> ZxResult<T> + Send + 'static,
    {
        let (tx, rx) = chan();
        let me = self.clone();
        tokio::spawn(async move {
            let mut inp = match me.call(m).await {
                Ok(inp) => inp,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };
            while let Some(it) = inp.recv().await {
                let it = it.and_then(&conv);
                let last = it.is_err();
                if tx.send(it).await.is_err() || last {
                    // dropping inp tells the server to stop
                    return;
                }
            }
        });
        rx
    }
}

#[async_trait]
impl Stater for Client {
    async fn stat(&self, path: &str) -> ZxResult<Dir> {
        self.stat_msg(path).await
    }
}

impl Getter for Client {
    fn get(&self, path: &str, off: i64, count: i64) -> Rx<Vec<u8>> {
        let mut m = self.msg(Op::Get, path);
        m.off = off;
        m.count = count;
        self.stream(m, |d| match d {
            Data::Bytes(b) => Ok(b),
            d => Err(bad_msg(&d)),
        })
    }
}

#[async_trait]
impl Putter for Client {
    async fn put(&self, path: &str, d: Dir, off: i64, mut data: Rx<Vec<u8>>) -> ZxResult<Dir> {
        let is_dir = d.is_dir();
        let mut m = self.msg(Op::Put, path);
        m.d = d;
        m.off = off;
        let Conn { tag, mut rx, tx } = match self.open(m).await {
            Ok(c) => c,
            Err(e) => {
                while data.recv().await.is_some() {}
                return Err(e);
            }
        };
        if is_dir {
            while data.recv().await.is_some() {}
        } else {
            while let Some(chunk) = data.recv().await {
                match chunk {
                    Ok(b) if b.is_empty() => {}
                    Ok(b) => {
                        if tx.send(Ok(Data::Bytes(b))).await.is_err() {
                            // the server gave up; its error is in the reply
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(tag = %tag, error = %e, "put data failed");
                        let _ = tx.send(Err(e.clone())).await;
                        return Err(e);
                    }
                }
            }
        }
        drop(tx);
        match rx.recv().await {
            Some(Ok(Data::Dir(d))) => Ok(d),
            Some(Ok(d)) => Err(bad_msg(&d)),
            Some(Err(e)) => Err(e),
            None => Err(ZxError::proto("no reply")),
        }
    }
}

#[async_trait]
impl Wstater for Client {
    async fn wstat(&self, path: &str, d: Dir) -> ZxResult<Dir> {
        let mut m = self.msg(Op::Wstat, path);
        m.d = d;
        self.dir_call(m).await
    }
}

#[async_trait]
impl Remover for Client {
    async fn remove(&self, path: &str) -> ZxResult<()> {
        self.err_call(self.msg(Op::Remove, path)).await
    }

    async fn remove_all(&self, path: &str) -> ZxResult<()> {
        self.err_call(self.msg(Op::RemoveAll, path)).await
    }
}

#[async_trait]
impl Mover for Client {
    async fn mv(&self, from: &str, to: &str) -> ZxResult<()> {
        let mut m = self.msg(Op::Move, from);
        m.to = to.to_string();
        self.err_call(m).await
    }
}

#[async_trait]
impl Linker for Client {
    async fn link(&self, old: &str, new: &str) -> ZxResult<()> {
        let mut m = self.msg(Op::Link, new);
        m.to = old.to_string();
        self.err_call(m).await
    }
}

impl Client {
    fn find_msg(&self, op: Op, path: &str, pred: &str, spref: &str, dpref: &str, depth0: usize) -> Msg {
        let mut m = self.msg(op, path);
        m.pred = pred.to_string();
        m.spref = spref.to_string();
        m.dpref = dpref.to_string();
        m.depth = depth0 as i64;
        m
    }
}

impl Finder for Client {
    fn find(&self, path: &str, pred: &str, spref: &str, dpref: &str, depth0: usize) -> Rx<Dir> {
        let m = self.find_msg(Op::Find, path, pred, spref, dpref, depth0);
        self.stream(m, |d| match d {
            Data::Dir(d) => Ok(d),
            d => Err(bad_msg(&d)),
        })
    }
}

impl FindGetter for Client {
    fn find_get(
        &self,
        path: &str,
        pred: &str,
        spref: &str,
        dpref: &str,
        depth0: usize,
    ) -> Rx<FindItem> {
        let m = self.find_msg(Op::FindGet, path, pred, spref, dpref, depth0);
        self.stream(m, |d| match d {
            Data::Dir(d) => Ok(FindItem::Dir(d)),
            Data::Bytes(b) if b.is_empty() => Ok(FindItem::End),
            Data::Bytes(b) => Ok(FindItem::Bytes(b)),
            d => Err(bad_msg(&d)),
        })
    }
}

#[async_trait]
impl Fs for Client {
    fn name(&self) -> String {
        format!("rzx!{}!{}", self.addr, self.fsys)
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

    async fn close(&self) -> ZxResult<()> {
        Client::close(self);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_addr() {
        assert_eq!(split_addr("h"), ("tcp!h!zx".to_string(), "main".to_string()));
        assert_eq!(
            split_addr("unix!local!9898!other"),
            ("unix!local!9898".to_string(), "other".to_string())
        );
        assert_eq!(
            split_addr("tcp!h!zx!t!/a/b"),
            ("tcp!h!zx".to_string(), "t".to_string())
        );
    }
}
