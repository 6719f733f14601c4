//! Many logical calls over one transport.
//!
//! Each call is a [`Conn`]: a stream of inbound [`Data`] and a sender for
//! outbound data. The dialling side numbers its calls with odd ids and the
//! accepting side with even ones, so both can open calls at any time.
//!
//! A sender may have at most `window` frames in flight per call. The
//! receiving mux grants `window/2` more every time the application has
//! consumed that many, so a slow reader on one call never blocks the rest.
//!
//! Dropping a call's sender ends that half cleanly; sending an `Err` ends it
//! with the error. An error end aborts the call on both sides.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use zx_core::fs::{Rx, STREAM_BUF, Tx};
use zx_core::{ZxError, ZxResult};

use crate::frame::{self, Data, END, FIRST, FLOW, Frame, ID_MASK, RPC};

/// Default number of unacknowledged frames per call.
pub const WINDOW: u32 = 64;

/// Buffered, not yet accepted calls.
const ACCEPT_BUF: usize = 16;

/// One logical call.
#[derive(Debug)]
pub struct Conn {
    /// Mux name and call id, for diagnostics.
    pub tag: String,
    pub rx: Rx<Data>,
    pub tx: Tx<Data>,
}

impl Conn {
    /// Receive the next item; `None` once the peer ended its half cleanly.
    pub async fn recv(&mut self) -> Option<ZxResult<Data>> {
        self.rx.recv().await
    }

    pub async fn send(&self, d: Data) -> ZxResult<()> {
        self.tx
            .send(Ok(d))
            .await
            .map_err(|_| ZxError::closed(format!("{}: call closed", self.tag)))
    }

    /// End the outbound half with an error, aborting the call.
    pub async fn fail(&self, e: ZxError) {
        let _ = self.tx.send(Err(e)).await;
    }
}

struct Call {
    /// Frames waiting for the application; `None` once the peer ended.
    in_tx: Option<mpsc::Sender<ZxResult<Data>>>,
    credit: Arc<Semaphore>,
    /// Stops the outbound half.
    cancel: CancellationToken,
    out_open: bool,
}

struct Inner {
    name: String,
    caller: bool,
    window: u32,
    next: AtomicU32,
    calls: Mutex<HashMap<u32, Call>>,
    wtx: mpsc::UnboundedSender<Frame>,
    accept_tx: Mutex<Option<mpsc::Sender<Conn>>>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<Conn>>,
    hup: CancellationToken,
    err: Mutex<Option<String>>,
}

/// A multiplexed transport. Cloning gives another handle to the same mux.
#[derive(Clone)]
pub struct Mux {
    inner: Arc<Inner>,
}

impl fmt::Debug for Mux {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mux")
            .field("name", &self.inner.name)
            .field("caller", &self.inner.caller)
            .finish()
    }
}

impl Mux {
    /// Start a mux over a duplex stream. Must run inside a tokio runtime.
    pub fn new<S>(name: impl Into<String>, io: S, caller: bool) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (r, w) = tokio::io::split(io);
        Self::from_split(name, r, w, caller)
    }

    /// Start a mux over separate read and write halves.
    pub fn from_split<R, W>(name: impl Into<String>, r: R, w: W, caller: bool) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::with_window(name, r, w, caller, WINDOW)
    }

    pub fn with_window<R, W>(name: impl Into<String>, r: R, w: W, caller: bool, window: u32) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (wtx, wrx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BUF);
        let inner = Arc::new(Inner {
            name: name.into(),
            caller,
            window: window.max(2),
            next: AtomicU32::new(if caller { 1 } else { 2 }),
            calls: Mutex::new(HashMap::new()),
            wtx,
            accept_tx: Mutex::new(Some(accept_tx)),
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            hup: CancellationToken::new(),
            err: Mutex::new(None),
        });
        tokio::spawn(write_loop(inner.clone(), w, wrx));
        tokio::spawn(read_loop(inner.clone(), r));
        debug!(mux = %inner.name, caller, "mux started");
        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Open a call to the peer.
    pub fn rpc(&self) -> ZxResult<Conn> {
        let inner = &self.inner;
        if inner.hup.is_cancelled() {
            return Err(self.closed_err());
        }
        let mut calls = inner.calls.lock();
        let id = loop {
            let id = inner.next.fetch_add(2, Ordering::Relaxed) & ID_MASK;
            if id != 0 && !calls.contains_key(&id) {
                break id;
            }
        };
        Ok(inner.open(&mut calls, id, FIRST | RPC))
    }

    /// Wait for the next call opened by the peer; `None` once the mux is closed.
    pub async fn accept(&self) -> Option<Conn> {
        let mut rx = self.inner.accept_rx.lock().await;
        tokio::select! {
            c = rx.recv() => c,
            _ = self.inner.hup.cancelled() => None,
        }
    }

    /// Fires when the transport goes away or the mux is closed.
    pub fn hup(&self) -> CancellationToken {
        self.inner.hup.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.hup.is_cancelled()
    }

    /// The reason the mux closed, if it did.
    pub fn err(&self) -> Option<String> {
        self.inner.err.lock().clone()
    }

    fn closed_err(&self) -> ZxError {
        let why = self.err().unwrap_or_else(|| "mux closed".to_string());
        ZxError::closed(format!("{}: {why}", self.inner.name))
    }

    /// Tear down every call and the transport.
    pub fn close(&self) {
        self.inner.shutdown("mux closed by user".to_string());
    }
}

impl Inner {
    /// Register call `id` and start its outbound half. `flags` go on the
    /// first outbound frame.
    fn open(self: &Arc<Self>, calls: &mut HashMap<u32, Call>, id: u32, flags: u32) -> Conn {
        let cap = self.window as usize + 2;
        let (in_tx, in_rx) = mpsc::channel(cap);
        let (user_in_tx, user_in_rx) = mpsc::channel(1);
        let (out_tx, out_rx) = mpsc::channel(STREAM_BUF);
        let credit = Arc::new(Semaphore::new(self.window as usize));
        let cancel = self.hup.child_token();
        calls.insert(
            id,
            Call {
                in_tx: Some(in_tx),
                credit: credit.clone(),
                cancel: cancel.clone(),
                out_open: true,
            },
        );
        tokio::spawn(deliver(self.clone(), id, in_rx, user_in_tx));
        tokio::spawn(send_call(self.clone(), id, out_rx, credit, cancel, flags));
        trace!(mux = %self.name, id, "new call");
        Conn {
            tag: format!("{}!{id:x}", self.name),
            rx: user_in_rx,
            tx: out_tx,
        }
    }

    fn post(&self, f: Frame) -> bool {
        self.wtx.send(f).is_ok()
    }

    fn reap(calls: &mut HashMap<u32, Call>, id: u32) {
        if matches!(calls.get(&id), Some(c) if c.in_tx.is_none() && !c.out_open) {
            calls.remove(&id);
        }
    }

    fn out_done(&self, id: u32) {
        let mut calls = self.calls.lock();
        if let Some(c) = calls.get_mut(&id) {
            c.out_open = false;
        }
        Self::reap(&mut calls, id);
    }

    /// Abort a call locally and tell the peer.
    fn abort(&self, id: u32, why: &str) {
        let found = {
            let mut calls = self.calls.lock();
            match calls.remove(&id) {
                Some(c) => {
                    c.cancel.cancel();
                    true
                }
                None => false,
            }
        };
        if found {
            trace!(mux = %self.name, id, why, "abort call");
            self.post(Frame::new(id | END, Data::Err(why.to_string())));
        }
    }

    fn grant(&self, id: u32, n: u32) {
        self.post(Frame::new(id | FLOW, Data::Raw(n.to_le_bytes().to_vec())));
    }

    async fn handle(self: &Arc<Self>, f: Frame) -> ZxResult<()> {
        let id = f.id();
        trace!(mux = %self.name, tag = %format!("{:x}", f.tag), data = %f.data.describe(), "<-");
        if let Some(conn) = self.new_call(&f) {
            let accept = self.accept_tx.lock().clone();
            let delivered = match accept {
                Some(tx) => tx.send(conn).await.is_ok(),
                None => false,
            };
            if !delivered {
                self.abort(id, "mux not accepting calls");
                return Ok(());
            }
        }
        if let Some(why) = self.dispatch(f)? {
            self.abort(id, why);
        }
        Ok(())
    }

    /// Register a call opened by the peer.
    fn new_call(self: &Arc<Self>, f: &Frame) -> Option<Conn> {
        let mut calls = self.calls.lock();
        if calls.contains_key(&f.id()) || !f.has(FIRST) || f.has(FLOW) {
            return None;
        }
        Some(self.open(&mut calls, f.id(), 0))
    }

    /// Route a frame to its call. Returns why the call must be aborted, if so.
    fn dispatch(&self, f: Frame) -> ZxResult<Option<&'static str>> {
        let id = f.id();
        let mut calls = self.calls.lock();
        let Some(call) = calls.get_mut(&id) else {
            trace!(mux = %self.name, id, "discard");
            return Ok(None);
        };
        if f.has(FLOW) {
            let n = match &f.data {
                Data::Raw(b) if b.len() == 4 => u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
                _ => return Err(ZxError::proto("bad flow grant")),
            };
            call.credit.add_permits(n as usize);
            return Ok(None);
        }
        if f.has(END) {
            let in_tx = call.in_tx.take();
            if let Data::Err(e) = f.data {
                // the peer gave up on the call
                call.cancel.cancel();
                call.out_open = false;
                if let Some(tx) = in_tx {
                    let _ = tx.try_send(Err(ZxError::from_wire(&e)));
                }
            }
            Self::reap(&mut calls, id);
            return Ok(None);
        }
        let Some(tx) = &call.in_tx else {
            return Ok(None);
        };
        Ok(match tx.try_send(Ok(f.data)) {
            Ok(()) => None,
            Err(mpsc::error::TrySendError::Full(_)) => Some("flow control violated"),
            Err(mpsc::error::TrySendError::Closed(_)) => Some("call closed by receiver"),
        })
    }

    fn shutdown(&self, why: String) {
        {
            let mut err = self.err.lock();
            if err.is_some() {
                return;
            }
            *err = Some(why.clone());
        }
        debug!(mux = %self.name, why, "mux closing");
        self.accept_tx.lock().take();
        let calls: Vec<Call> = self.calls.lock().drain().map(|(_, c)| c).collect();
        for c in calls {
            c.cancel.cancel();
            c.credit.close();
            if let Some(tx) = c.in_tx {
                let _ = tx.try_send(Err(ZxError::closed(format!("{}: {why}", self.name))));
            }
        }
        self.hup.cancel();
    }
}

/// Hand inbound frames to the application, granting credit as they go.
async fn deliver(
    inner: Arc<Inner>,
    id: u32,
    mut in_rx: mpsc::Receiver<ZxResult<Data>>,
    user: mpsc::Sender<ZxResult<Data>>,
) {
    let half = inner.window / 2;
    let mut n = 0;
    while let Some(item) = in_rx.recv().await {
        let last = item.is_err();
        if user.send(item).await.is_err() {
            inner.abort(id, "call closed by receiver");
            return;
        }
        if last {
            return;
        }
        n += 1;
        if n == half {
            inner.grant(id, half);
            n = 0;
        }
    }
}

/// Send the application's outbound frames for one call.
async fn send_call(
    inner: Arc<Inner>,
    id: u32,
    mut out: mpsc::Receiver<ZxResult<Data>>,
    credit: Arc<Semaphore>,
    cancel: CancellationToken,
    mut flags: u32,
) {
    let end = loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => break None,
            item = out.recv() => item,
        };
        let data = match item {
            None => break Some(Data::empty()),
            Some(Err(e)) => break Some(Data::Err(e.to_wire())),
            Some(Ok(data)) => data,
        };
        let permit = tokio::select! {
            _ = cancel.cancelled() => break None,
            p = credit.acquire() => p,
        };
        match permit {
            Ok(p) => p.forget(),
            Err(_) => break None,
        }
        if !inner.post(Frame::new(id | flags, data)) {
            break None;
        }
        flags = 0;
    };
    if let Some(data) = end {
        inner.post(Frame::new(id | flags | END, data));
    }
    inner.out_done(id);
}

async fn write_loop<W>(inner: Arc<Inner>, w: W, mut wrx: mpsc::UnboundedReceiver<Frame>)
where
    W: AsyncWrite + Unpin,
{
    let mut w = BufWriter::new(w);
    let res: ZxResult<()> = async {
        loop {
            let f = tokio::select! {
                f = wrx.recv() => f,
                _ = inner.hup.cancelled() => None,
            };
            let Some(f) = f else { break };
            frame::write_frame(&mut w, &f).await?;
            if wrx.is_empty() {
                w.flush().await?;
            }
        }
        Ok(())
    }
    .await;
    // drain what is already queued, such as abort notices
    while let Ok(f) = wrx.try_recv() {
        if frame::write_frame(&mut w, &f).await.is_err() {
            break;
        }
    }
    let _ = w.flush().await;
    let _ = w.shutdown().await;
    if let Err(e) = res {
        warn!(mux = %inner.name, error = %e, "mux write failed");
        inner.shutdown(e.to_string());
    }
}

async fn read_loop<R>(inner: Arc<Inner>, mut r: R)
where
    R: AsyncRead + Unpin,
{
    let why = loop {
        let f = tokio::select! {
            f = frame::read_frame(&mut r) => f,
            _ = inner.hup.cancelled() => return,
        };
        match f {
            Ok(Some(f)) => {
                if let Err(e) = inner.handle(f).await {
                    break e.to_string();
                }
            }
            Ok(None) => break "hangup".to_string(),
            Err(e) => break e.to_string(),
        }
    };
    debug!(mux = %inner.name, why, "mux input done");
    inner.shutdown(why);
}

/// Two connected muxes in this process.
pub fn pipe_pair() -> (Mux, Mux) {
    let (a, b) = tokio::io::duplex(frame_buf());
    (Mux::new("pipe1", a, false), Mux::new("pipe2", b, true))
}

fn frame_buf() -> usize {
    2 * zx_core::codec::MAX_MSG_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn echo_server(m: Mux) {
        while let Some(mut c) = m.accept().await {
            tokio::spawn(async move {
                while let Some(item) = c.recv().await {
                    match item {
                        Ok(d) => {
                            if c.send(d).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            c.fail(e).await;
                            return;
                        }
                    }
                }
            });
        }
    }

    #[tokio::test]
    async fn test_rpc_echo() {
        let (srv, cli) = pipe_pair();
        tokio::spawn(echo_server(srv));
        let mut c = cli.rpc().unwrap();
        c.send(Data::Str("hi".into())).await.unwrap();
        c.send(Data::Bytes(b"there".to_vec())).await.unwrap();
        drop(c.tx);
        assert_eq!(c.rx.recv().await.unwrap().unwrap(), Data::Str("hi".into()));
        assert_eq!(
            c.rx.recv().await.unwrap().unwrap(),
            Data::Bytes(b"there".to_vec())
        );
        assert!(c.rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_error_end_reaches_peer() {
        let (srv, cli) = pipe_pair();
        tokio::spawn(async move {
            let c = srv.accept().await.unwrap();
            c.fail(ZxError::not_exist("/x")).await;
        });
        let mut c = cli.rpc().unwrap();
        c.send(Data::empty()).await.unwrap();
        let err = c.recv().await.unwrap().unwrap_err();
        assert!(err.is_not_exist());
        assert_eq!(err.to_string(), "/x: no such file or directory");
        assert!(c.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_many_frames_need_credit() {
        let (srv, cli) = pipe_pair();
        tokio::spawn(echo_server(srv));
        let c = cli.rpc().unwrap();
        let Conn { tx, mut rx, .. } = c;
        let n = 10 * WINDOW as usize;
        let writer = tokio::spawn(async move {
            for i in 0..n {
                tx.send(Ok(Data::Bytes(vec![i as u8; 100]))).await.unwrap();
            }
        });
        let mut got = 0;
        while let Some(d) = rx.recv().await {
            let Data::Bytes(b) = d.unwrap() else { panic!("bad data") };
            assert_eq!(b[0], got as u8);
            got += 1;
        }
        writer.await.unwrap();
        assert_eq!(got, n);
    }

    #[tokio::test]
    async fn test_dropped_receiver_stops_sender() {
        let (srv, cli) = pipe_pair();
        let done = tokio::spawn(async move {
            let mut c = srv.accept().await.unwrap();
            let _ = c.recv().await;
            let mut sent = 0;
            loop {
                if c.send(Data::Bytes(vec![0; 1024])).await.is_err() {
                    return sent;
                }
                sent += 1;
            }
        });
        let mut c = cli.rpc().unwrap();
        c.send(Data::empty()).await.unwrap();
        for _ in 0..3 {
            c.recv().await.unwrap().unwrap();
        }
        drop(c);
        let sent = tokio::time::timeout(Duration::from_secs(5), done)
            .await
            .unwrap()
            .unwrap();
        assert!(sent >= 3);
    }

    #[tokio::test]
    async fn test_close_ends_calls_and_fires_hup() {
        let (srv, cli) = pipe_pair();
        let hup = srv.hup();
        let mut c = cli.rpc().unwrap();
        c.send(Data::empty()).await.unwrap();
        let _accepted = srv.accept().await.unwrap();
        cli.close();
        assert!(c.recv().await.unwrap().is_err());
        tokio::time::timeout(Duration::from_secs(5), hup.cancelled())
            .await
            .unwrap();
        assert!(srv.rpc().is_err());
        assert!(srv.accept().await.is_none());
    }

    #[tokio::test]
    async fn test_both_sides_open_calls() {
        let (a, b) = pipe_pair();
        tokio::spawn(echo_server(a.clone()));
        tokio::spawn(echo_server(b.clone()));
        for m in [&a, &b] {
            let mut c = m.rpc().unwrap();
            c.send(Data::Str(m.name().to_string())).await.unwrap();
            assert_eq!(
                c.recv().await.unwrap().unwrap(),
                Data::Str(m.name().to_string())
            );
        }
    }
}
