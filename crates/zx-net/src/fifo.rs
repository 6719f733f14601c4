//! Named-pipe transport between processes on one machine.
//!
//! The server listens on the fifo `<dir>/<svc>`. A client creates a pair of
//! fifos `<base>.in` and `<base>.out`, opens its ends and writes `<base>` as
//! a line to the server fifo; the server opens the other ends and removes
//! both files.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use nix::sys::stat::Mode;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::pipe;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use zx_core::{ZxError, ZxResult};

use crate::mux::Mux;

pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

static NEXT: AtomicU32 = AtomicU32::new(0);

/// Default directory for service fifos.
pub fn fifo_dir() -> PathBuf {
    std::env::temp_dir().join(format!("zx.fifo.{}", whoami::username()))
}

fn io_err(p: &Path, e: std::io::Error) -> ZxError {
    ZxError::from_io(&p.display().to_string(), e)
}

fn mkfifo(p: &Path) -> ZxResult<()> {
    let _ = std::fs::remove_file(p);
    nix::unistd::mkfifo(p, Mode::S_IRUSR | Mode::S_IWUSR)
        .map_err(|e| io_err(p, std::io::Error::from(e)))
}

fn with_ext(base: &Path, ext: &str) -> PathBuf {
    let mut s = base.as_os_str().to_owned();
    s.push(ext);
    PathBuf::from(s)
}

/// Connect to `svc` served from `dir`.
pub async fn dial(dir: &Path, svc: &str) -> ZxResult<Mux> {
    let srv = dir.join(svc);
    match tokio::time::timeout(DIAL_TIMEOUT, dial_fifo(dir, &srv)).await {
        Ok(r) => r,
        Err(_) => Err(ZxError::timeout(format!("{}: dial timed out", srv.display()))),
    }
}

async fn dial_fifo(dir: &Path, srv: &Path) -> ZxResult<Mux> {
    let n = NEXT.fetch_add(1, Ordering::Relaxed);
    let base = dir.join(format!("c.{}.{n}", std::process::id()));
    let (inp, out) = (with_ext(&base, ".in"), with_ext(&base, ".out"));
    mkfifo(&inp)?;
    mkfifo(&out)?;
    let res = async {
        // holding .in open for reading too keeps the server from seeing EOF
        // before we write anything
        let tx = pipe::OpenOptions::new()
            .read_write(true)
            .open_sender(&inp)
            .map_err(|e| io_err(&inp, e))?;
        let rx = pipe::OpenOptions::new()
            .open_receiver(&out)
            .map_err(|e| io_err(&out, e))?;
        let mut ctl = pipe::OpenOptions::new()
            .open_sender(srv)
            .map_err(|e| io_err(srv, e))?;
        ctl.write_all(format!("{}\n", base.display()).as_bytes())
            .await
            .map_err(|e| io_err(srv, e))?;
        debug!(fifo = %base.display(), "fifo dialled");
        Ok(Mux::from_split(format!("fifo!{}", base.display()), rx, tx, true))
    }
    .await;
    if res.is_err() {
        let _ = std::fs::remove_file(&inp);
        let _ = std::fs::remove_file(&out);
    }
    res
}

/// Listen on `<dir>/<svc>`, sending a mux per client until `stop` fires.
pub fn serve(dir: &Path, svc: &str, tx: mpsc::Sender<Mux>, stop: CancellationToken) -> ZxResult<PathBuf> {
    std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
    let path = dir.join(svc);
    mkfifo(&path)?;
    // opened read-write so the listener never sees EOF between clients
    let rx = pipe::OpenOptions::new()
        .read_write(true)
        .open_receiver(&path)
        .map_err(|e| io_err(&path, e))?;
    tokio::spawn(accept_loop(path.clone(), rx, tx, stop));
    Ok(path)
}

async fn accept_loop(path: PathBuf, rx: pipe::Receiver, tx: mpsc::Sender<Mux>, stop: CancellationToken) {
    let mut lines = BufReader::new(rx).lines();
    loop {
        let line = tokio::select! {
            _ = stop.cancelled() => break,
            l = lines.next_line() => l,
        };
        let base = match line {
            Ok(Some(l)) if !l.is_empty() => PathBuf::from(l),
            Ok(Some(_)) => continue,
            Ok(None) => break,
            Err(e) => {
                warn!(fifo = %path.display(), error = %e, "fifo listen failed");
                break;
            }
        };
        match accept_one(&base) {
            Ok(m) => {
                if tx.send(m).await.is_err() {
                    break;
                }
            }
            Err(e) => warn!(fifo = %base.display(), error = %e, "fifo accept failed"),
        }
    }
    let _ = std::fs::remove_file(&path);
    debug!(fifo = %path.display(), "fifo listener done");
}

fn accept_one(base: &Path) -> ZxResult<Mux> {
    let (inp, out) = (with_ext(base, ".in"), with_ext(base, ".out"));
    let rx = pipe::OpenOptions::new()
        .open_receiver(&inp)
        .map_err(|e| io_err(&inp, e));
    let tx = pipe::OpenOptions::new()
        .open_sender(&out)
        .map_err(|e| io_err(&out, e));
    let _ = std::fs::remove_file(&inp);
    let _ = std::fs::remove_file(&out);
    Ok(Mux::from_split(format!("fifo!{}", base.display()), rx?, tx?, false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Data;

    #[tokio::test]
    async fn test_fifo_call() {
        let tmp = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(1);
        let stop = CancellationToken::new();
        let path = serve(tmp.path(), "t", tx, stop.clone()).unwrap();
        assert!(path.exists());

        tokio::spawn(async move {
            let m = rx.recv().await.unwrap();
            let mut c = m.accept().await.unwrap();
            let d = c.recv().await.unwrap().unwrap();
            c.send(d).await.unwrap();
            // keep the mux alive until the reply is read
            let _ = c.recv().await;
        });

        let m = dial(tmp.path(), "t").await.unwrap();
        let mut c = m.rpc().unwrap();
        c.send(Data::Str("hi".into())).await.unwrap();
        assert_eq!(c.recv().await.unwrap().unwrap(), Data::Str("hi".into()));
        m.close();
        stop.cancel();
    }

    #[tokio::test]
    async fn test_dial_without_server() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(dial(tmp.path(), "none").await.is_err());
    }
}
