//! Dialling and listening on `net!host!port` addresses.
//!
//! Supported networks: `tcp`, `tls` (tcp with mandatory TLS), `unix`,
//! `fifo` and `*`, which prefers a unix socket for local hosts. In-process
//! pipes come from [`crate::mux::pipe_pair`].

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use zx_core::{ZxError, ZxResult};

use crate::addr::{self, Addr};
use crate::mux::Mux;
use crate::tls::TlsConfig;

/// Limit on connecting plus the TLS handshake.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

const KEEPALIVE_SECS: u32 = 2;

/// Accepted transports not yet picked up.
const BACKLOG: usize = 16;

fn net_err(addr: &str, e: std::io::Error) -> ZxError {
    ZxError::from_io(addr, e)
}

fn keep_alive(s: &TcpStream) {
    use nix::sys::socket::{setsockopt, sockopt};
    let mut res = setsockopt(s, sockopt::KeepAlive, &true);
    #[cfg(target_os = "linux")]
    {
        res = res
            .and_then(|_| setsockopt(s, sockopt::TcpKeepIdle, &KEEPALIVE_SECS))
            .and_then(|_| setsockopt(s, sockopt::TcpKeepInterval, &KEEPALIVE_SECS));
    }
    if let Err(e) = res {
        debug!(error = %e, "keep-alive not set");
    }
}

/// Dial `addr` and start a mux over it. TLS is used for `tcp` when `tls` is
/// given and always for `tls`.
pub async fn dial(addr: &str, tls: Option<&TlsConfig>) -> ZxResult<Mux> {
    let a = Addr::parse(addr)?;
    debug!(addr = %a.dial_addr(), "dial");
    match a.net.as_str() {
        "tcp" => dial_tcp(&a, tls).await,
        "tls" => match tls {
            Some(t) => dial_tcp(&a, Some(t)).await,
            None => Err(ZxError::other(format!("{}: TLS not configured", a.dial_addr()))),
        },
        "unix" => dial_unix(&a).await,
        "fifo" => dial_fifo(&a).await,
        "*" | "" => {
            if addr::is_local(&a.host) {
                match dial_unix(&a).await {
                    Ok(m) => return Ok(m),
                    Err(e) => debug!(addr = %a.dial_addr(), error = %e, "no unix socket"),
                }
            }
            dial_tcp(&a, tls).await
        }
        "pipe" => Err(ZxError::other(format!("{}: pipes are in-process only", a.dial_addr()))),
        net => Err(ZxError::other(format!("{net}: unknown network"))),
    }
}

async fn dial_tcp(a: &Addr, tls: Option<&TlsConfig>) -> ZxResult<Mux> {
    let port = addr::port_number(&a.port)?;
    let name = a.dial_addr();
    let conn = async {
        let s = TcpStream::connect((a.sock_host(), port))
            .await
            .map_err(|e| net_err(&name, e))?;
        keep_alive(&s);
        let _ = s.set_nodelay(true);
        match tls {
            Some(t) => Ok(Mux::new(name.clone(), t.connect(a.sock_host(), s).await?, true)),
            None => Ok(Mux::new(name.clone(), s, true)),
        }
    };
    match tokio::time::timeout(DIAL_TIMEOUT, conn).await {
        Ok(r) => r,
        Err(_) => Err(ZxError::timeout(format!("{name}: dial timed out"))),
    }
}

async fn dial_unix(a: &Addr) -> ZxResult<Mux> {
    let path = addr::unix_path(&a.port);
    let s = UnixStream::connect(&path).await.map_err(|e| net_err(&path, e))?;
    Ok(Mux::new(format!("unix!{}", a.port), s, true))
}

#[cfg(target_os = "linux")]
async fn dial_fifo(a: &Addr) -> ZxResult<Mux> {
    crate::fifo::dial(&crate::fifo::fifo_dir(), &a.port).await
}

#[cfg(not(target_os = "linux"))]
async fn dial_fifo(a: &Addr) -> ZxResult<Mux> {
    Err(ZxError::other(format!("{}: fifo transport unsupported", a.dial_addr())))
}

/// A live listener yielding one mux per accepted transport.
#[derive(Debug)]
pub struct Listener {
    addr: String,
    rx: mpsc::Receiver<Mux>,
    stop: CancellationToken,
}

impl Listener {
    /// The address actually listened on (ports resolved).
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Next accepted transport; `None` once closed.
    pub async fn accept(&mut self) -> Option<Mux> {
        tokio::select! {
            m = self.rx.recv() => m,
            _ = self.stop.cancelled() => None,
        }
    }

    /// Stop accepting. Muxes already handed out stay up.
    pub fn close(&self) {
        self.stop.cancel();
    }

    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Listen on `addr`. TLS is applied to tcp connections when `tls` can serve.
pub async fn serve(addr: &str, tls: Option<TlsConfig>) -> ZxResult<Listener> {
    let a = Addr::parse(addr)?;
    let (tx, rx) = mpsc::channel(BACKLOG);
    let stop = CancellationToken::new();
    let tls = tls.filter(TlsConfig::can_serve);
    let bound = match a.net.as_str() {
        "tcp" | "*" => serve_tcp(&a, tls, tx, stop.clone()).await?,
        "tls" => match tls {
            Some(t) => serve_tcp(&a, Some(t), tx, stop.clone()).await?,
            None => return Err(ZxError::other(format!("{}: TLS not configured", a.dial_addr()))),
        },
        "unix" => serve_unix(&a, tx, stop.clone())?,
        #[cfg(target_os = "linux")]
        "fifo" => {
            let p = crate::fifo::serve(&crate::fifo::fifo_dir(), &a.port, tx, stop.clone())?;
            format!("fifo!{}!{}", a.host, p.display())
        }
        net => return Err(ZxError::other(format!("{net}: cannot listen"))),
    };
    info!(addr = %bound, "listening");
    Ok(Listener { addr: bound, rx, stop })
}

async fn serve_tcp(
    a: &Addr,
    tls: Option<TlsConfig>,
    tx: mpsc::Sender<Mux>,
    stop: CancellationToken,
) -> ZxResult<String> {
    let port = addr::port_number(&a.port)?;
    let host = match a.host.as_str() {
        "*" => "0.0.0.0",
        _ => a.sock_host(),
    };
    let l = TcpListener::bind((host, port))
        .await
        .map_err(|e| net_err(&a.dial_addr(), e))?;
    let local = l.local_addr().map_err(|e| net_err(&a.dial_addr(), e))?;
    tokio::spawn(async move {
        loop {
            let (s, peer) = tokio::select! {
                _ = stop.cancelled() => break,
                r = l.accept() => match r {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(error = %e, "tcp accept failed");
                        continue;
                    }
                },
            };
            keep_alive(&s);
            let _ = s.set_nodelay(true);
            let tx = tx.clone();
            let tls = tls.clone();
            tokio::spawn(async move {
                let name = peer_name("tcp", peer);
                let m = match tls {
                    Some(t) => match t.accept(s).await {
                        Ok(s) => Mux::new(name, s, false),
                        Err(e) => {
                            warn!(peer = %name, error = %e, "tls handshake failed");
                            return;
                        }
                    },
                    None => Mux::new(name, s, false),
                };
                let _ = tx.send(m).await;
            });
        }
        debug!(addr = %local, "tcp listener done");
    });
    Ok(format!("tcp!{}!{}", local.ip(), local.port()))
}

fn peer_name(net: &str, peer: SocketAddr) -> String {
    format!("{net}!{}!{}", peer.ip(), peer.port())
}

fn serve_unix(a: &Addr, tx: mpsc::Sender<Mux>, stop: CancellationToken) -> ZxResult<String> {
    let path = addr::unix_path(&a.port);
    let _ = std::fs::remove_file(&path);
    let l = UnixListener::bind(&path).map_err(|e| net_err(&path, e))?;
    let bound = format!("unix!{}!{}", a.host, a.port);
    tokio::spawn(async move {
        let mut n = 0u64;
        loop {
            let s = tokio::select! {
                _ = stop.cancelled() => break,
                r = l.accept() => match r {
                    Ok((s, _)) => s,
                    Err(e) => {
                        warn!(error = %e, "unix accept failed");
                        continue;
                    }
                },
            };
            n += 1;
            let m = Mux::new(format!("unix!{path}!{n}"), s, false);
            if tx.send(m).await.is_err() {
                break;
            }
        }
        let _ = std::fs::remove_file(&path);
        debug!(path, "unix listener done");
    });
    Ok(bound)
}
