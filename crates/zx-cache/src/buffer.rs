//! Chunked in-memory file bodies.
//!
//! A [`Buffer`] is a shared handle: clones see the same bytes. Callers copy
//! the handle out of a cache entry and stream through it without holding
//! the entry lock.

use std::sync::Arc;

use parking_lot::RwLock;

use zx_core::codec::MSG_SIZE;
use zx_core::fs::{Rx, Tx};
use zx_core::{ZxError, ZxResult};

/// Bytes per chunk.
pub const CHUNK: usize = 16 * 1024;

/// Chunks past `len` are zero, so growing never exposes stale bytes.
#[derive(Debug, Default)]
struct Chunks {
    chunks: Vec<Vec<u8>>,
    len: usize,
}

impl Chunks {
    fn grow(&mut self, len: usize) {
        let need = len.div_ceil(CHUNK);
        while self.chunks.len() < need {
            self.chunks.push(vec![0; CHUNK]);
        }
    }

    fn read_at(&self, buf: &mut [u8], off: usize) -> usize {
        if off >= self.len {
            return 0;
        }
        let n = buf.len().min(self.len - off);
        let mut done = 0;
        while done < n {
            let pos = off + done;
            let (ci, co) = (pos / CHUNK, pos % CHUNK);
            let m = (CHUNK - co).min(n - done);
            buf[done..done + m].copy_from_slice(&self.chunks[ci][co..co + m]);
            done += m;
        }
        n
    }

    fn write_at(&mut self, data: &[u8], off: usize) {
        let end = off + data.len();
        self.grow(end);
        let mut done = 0;
        while done < data.len() {
            let pos = off + done;
            let (ci, co) = (pos / CHUNK, pos % CHUNK);
            let m = (CHUNK - co).min(data.len() - done);
            self.chunks[ci][co..co + m].copy_from_slice(&data[done..done + m]);
            done += m;
        }
        self.len = self.len.max(end);
    }

    fn truncate(&mut self, len: usize) {
        if len >= self.len {
            self.grow(len);
            self.len = len;
            return;
        }
        self.chunks.truncate(len.div_ceil(CHUNK));
        let co = len % CHUNK;
        if co != 0 {
            if let Some(last) = self.chunks.last_mut() {
                last[co..].fill(0);
            }
        }
        self.len = len;
    }
}

#[derive(Debug, Clone, Default)]
pub struct Buffer(Arc<RwLock<Chunks>>);

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.read().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy bytes at `off` into `buf`; returns how many were copied.
    pub fn read_at(&self, buf: &mut [u8], off: usize) -> usize {
        self.0.read().read_at(buf, off)
    }

    /// Write `data` at `off`, growing the buffer as needed. A gap past the
    /// end reads as zeros.
    pub fn write_at(&self, data: &[u8], off: usize) {
        self.0.write().write_at(data, off)
    }

    /// Shrink or zero-extend to `len` bytes.
    pub fn truncate(&self, len: usize) {
        self.0.write().truncate(len)
    }

    pub fn clear(&self) {
        self.truncate(0)
    }

    /// Replace the contents with `data`.
    pub fn set(&self, data: &[u8]) {
        let mut c = self.0.write();
        c.truncate(0);
        c.write_at(data, 0);
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let c = self.0.read();
        let mut v = vec![0; c.len];
        c.read_at(&mut v, 0);
        v
    }

    /// Send `count` bytes from `off` (all of them if `count` is negative) in
    /// messages of at most [`MSG_SIZE`] bytes.
    pub async fn send_to(&self, off: i64, count: i64, tx: &Tx<Vec<u8>>) -> ZxResult<usize> {
        let mut off = off.max(0) as usize;
        let mut left = if count < 0 { usize::MAX } else { count as usize };
        let mut total = 0;
        while left > 0 {
            let mut msg = vec![0; MSG_SIZE.min(left)];
            let n = self.read_at(&mut msg, off);
            if n == 0 {
                break;
            }
            msg.truncate(n);
            tx.send(Ok(msg))
                .await
                .map_err(|_| ZxError::closed("receiver gone"))?;
            off += n;
            left -= n;
            total += n;
        }
        Ok(total)
    }

    /// Write everything received on `rx` starting at `off`, or at the end
    /// when `off` is negative.
    pub async fn recv_from(&self, off: i64, rx: &mut Rx<Vec<u8>>) -> ZxResult<usize> {
        let mut off = if off < 0 { self.len() } else { off as usize };
        let mut total = 0;
        while let Some(msg) = rx.recv().await {
            let msg = msg?;
            self.write_at(&msg, off);
            off += msg.len();
            total += msg.len();
        }
        Ok(total)
    }
}
