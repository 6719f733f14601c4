//! Cache of live connections.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::debug;

use zx_core::{ZxError, ZxResult};
use zx_net::addr::fill_addr;

use crate::client::{Client, DialOpts};

type Slot = Arc<OnceCell<Client>>;

/// Dials servers, reusing connections already up.
///
/// Connections are keyed by transport address; trees on the same server
/// share one. Concurrent dials of one address make a single connection, and
/// a connection is forgotten once it hangs up.
#[derive(Debug, Clone, Default)]
pub struct Dialer {
    opts: DialOpts,
    conns: Arc<Mutex<HashMap<String, Slot>>>,
}

impl Dialer {
    pub fn new(opts: DialOpts) -> Self {
        Self {
            opts,
            conns: Arc::default(),
        }
    }

    /// The tree at `addr`, completed with [`fill_addr`].
    pub async fn dial(&self, addr: &str) -> ZxResult<Client> {
        let full = fill_addr(addr);
        let toks: Vec<&str> = full.splitn(5, '!').collect();
        let key = toks[..toks.len().min(3)].join("!");
        let tree = toks.get(3).copied().unwrap_or(zx_net::addr::DEFAULT_TREE);

        let slot = self.slot(&key);
        let res = slot
            .get_or_try_init(|| async {
                let c = Client::dial(&format!("{key}!{tree}"), &self.opts).await?;
                self.watch(&key, &slot, &c);
                Ok::<_, ZxError>(c)
            })
            .await;
        match res {
            Ok(c) if !c.is_closed() => c.fsys(tree),
            Ok(_) => {
                // hung up before the watcher ran
                self.forget(&key, &slot);
                Box::pin(self.dial(addr)).await
            }
            Err(e) => {
                self.forget(&key, &slot);
                Err(e)
            }
        }
    }

    fn slot(&self, key: &str) -> Slot {
        self.conns
            .lock()
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    fn forget(&self, key: &str, slot: &Slot) {
        let mut conns = self.conns.lock();
        if conns.get(key).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            conns.remove(key);
        }
    }

    fn watch(&self, key: &str, slot: &Slot, c: &Client) {
        let (me, key, slot, hup) = (self.clone(), key.to_string(), slot.clone(), c.hup());
        tokio::spawn(async move {
            hup.cancelled().await;
            debug!(addr = %key, "hangup; forgetting connection");
            me.forget(&key, &slot);
        });
    }

    /// Addresses with a live or pending connection.
    pub fn addrs(&self) -> Vec<String> {
        let mut out: Vec<String> = self.conns.lock().keys().cloned().collect();
        out.sort();
        out
    }

    /// Close every cached connection.
    pub fn close_all(&self) {
        let slots: Vec<Slot> = self.conns.lock().drain().map(|(_, s)| s).collect();
        for s in slots {
            if let Some(c) = s.get() {
                c.close();
            }
        }
    }
}
