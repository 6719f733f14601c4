//! # zx-server
//!
//! The pieces behind the `zxserve` binary: settings from the command line
//! and config file, and [`start`], which opens every configured tree
//! (optionally behind a write-back cache) and serves them on one address.

pub mod config;
pub mod constants;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use zx_cache::{Cache, CacheConfig};
use zx_core::Fs;
use zx_lfs::Lfs;
use zx_net::{AuthConfig, TlsConfig};
use zx_rzx::{Server, ServerConfig};

pub use config::{Args, FileConfig, Settings, TreeConfig};

/// A server and the trees it exports.
pub struct Running {
    pub server: Server,
    trees: Vec<Arc<dyn Fs>>,
}

impl Running {
    /// Stop serving and close every tree. Caches flush on close.
    pub async fn shutdown(self) -> Result<()> {
        debug!(status = %self.server.status(), "shutting down");
        self.server.close();
        let mut first = None;
        for fs in self.trees {
            if let Err(e) = fs.close().await {
                warn!(fs = %fs.name(), error = %e, "close failed");
                first.get_or_insert(e);
            }
        }
        match first {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

async fn open_tree(s: &Settings, t: &TreeConfig) -> Result<Arc<dyn Fs>> {
    let rdonly = s.rdonly || t.rdonly;
    let lfs: Arc<dyn Fs> = Arc::new(
        Lfs::new(&t.path, rdonly).with_context(|| format!("tree {}", t.name))?,
    );
    if !s.cache {
        return Ok(lfs);
    }
    let cfg = CacheConfig {
        rdonly,
        ..CacheConfig::default()
    };
    let cache = Cache::new(lfs, cfg).await.with_context(|| format!("tree {}: cache", t.name))?;
    Ok(Arc::new(cache))
}

/// Open the trees and start listening.
pub async fn start(s: &Settings) -> Result<Running> {
    let auth = if s.noauth {
        AuthConfig::disabled()
    } else {
        AuthConfig::load(&s.domain).context("loading server keys")?
    };
    let tls = match &s.tls {
        Some(f) => Some(TlsConfig::load(&f.cert, &f.key).context("loading tls certificate")?),
        None => None,
    };

    let mut trees = Vec::with_capacity(s.trees.len());
    for t in &s.trees {
        trees.push((t.name.as_str(), open_tree(s, t).await?));
    }

    let cfg = ServerConfig {
        rdonly: s.rdonly,
        noauth: s.noauth,
        auth,
        tls,
    };
    let server = Server::listen(&s.addr, cfg)
        .await
        .with_context(|| format!("listening on {}", s.addr))?;
    for (name, fs) in &trees {
        server.serve(name, fs.clone())?;
    }
    info!(addr = %server.addr(), trees = ?server.trees(), cache = s.cache, "zxserve ready");
    Ok(Running {
        server,
        trees: trees.into_iter().map(|(_, fs)| fs).collect(),
    })
}
