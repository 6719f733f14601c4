//! Helpers built on the capability traits.

use crate::codec::MSG_SIZE;
use crate::dir::Dir;
use crate::error::{ZxError, ZxResult};
use crate::fs::{Fs, Rx, rx_from};
use crate::path;

/// Collect every item of a stream, failing on the first error item.
pub async fn recv_all<T>(mut rx: Rx<T>) -> ZxResult<Vec<T>> {
    let mut out = Vec::new();
    while let Some(it) = rx.recv().await {
        out.push(it?);
    }
    Ok(out)
}

/// A data stream carrying `data` in message-sized chunks.
pub fn data_rx(data: &[u8]) -> Rx<Vec<u8>> {
    let chunks: Vec<Vec<u8>> = data.chunks(MSG_SIZE).map(<[u8]>::to_vec).collect();
    rx_from(chunks)
}

/// Read the whole file at `path`.
pub async fn get_all(fs: &dyn Fs, path: &str) -> ZxResult<Vec<u8>> {
    let mut rx = fs.get(path, 0, -1);
    let mut out = Vec::new();
    while let Some(chunk) = rx.recv().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(out)
}

/// Create or replace `path` with `data`. Directories take no data.
pub async fn put_all(fs: &dyn Fs, path: &str, d: Dir, data: &[u8]) -> ZxResult<Dir> {
    let rx = if d.is_dir() { rx_from(Vec::new()) } else { data_rx(data) };
    fs.put(path, d, 0, rx).await
}

/// Decode the packed Dirs in a directory read.
pub fn unpack_dirs(chunks: Vec<Vec<u8>>) -> ZxResult<Vec<Dir>> {
    let mut ds = Vec::new();
    for chunk in chunks {
        let mut b = chunk.as_slice();
        while !b.is_empty() {
            let (d, rest) = Dir::unpack(b)?;
            ds.push(d);
            b = rest;
        }
    }
    Ok(ds)
}

/// List the directory at `path`.
pub async fn get_dir(fs: &dyn Fs, path: &str) -> ZxResult<Vec<Dir>> {
    unpack_dirs(recv_all(fs.get(path, 0, -1)).await?)
}

/// Create the directory `path`. It is not an error if it exists already.
pub async fn mkdir(fs: &dyn Fs, path: &str, d: Dir) -> ZxResult<Dir> {
    fs.put(path, d.with("type", "d"), 0, rx_from(Vec::new())).await
}

/// Create `path` and any missing parents.
pub async fn mkdir_all(fs: &dyn Fs, p: &str, d: Dir) -> ZxResult<Dir> {
    let p = path::abs_path(p)?;
    let els = path::elems(&p);
    let mut last = fs.stat("/").await?;
    for i in 1..=els.len() {
        let sub = path::elems_path(&els[..i]);
        last = match fs.stat(&sub).await {
            Ok(sd) if sd.is_dir() => sd,
            Ok(_) => return Err(ZxError::not_dir(sub)),
            Err(e) if e.is_not_exist() => mkdir(fs, &sub, d.clone()).await?,
            Err(e) => return Err(e),
        };
    }
    Ok(last)
}

/// Run a find and collect its results.
pub async fn find_all(
    fs: &dyn Fs,
    path: &str,
    pred: &str,
    spref: &str,
    dpref: &str,
    depth0: usize,
) -> ZxResult<Vec<Dir>> {
    recv_all(fs.find(path, pred, spref, dpref, depth0)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recv_all_stops_at_error() {
        let (tx, rx) = crate::fs::chan::<u32>();
        tx.send(Ok(1)).await.unwrap();
        tx.send(Err(ZxError::other("boom"))).await.unwrap();
        drop(tx);
        assert_eq!(recv_all(rx).await.unwrap_err().to_string(), "boom");
    }

    #[tokio::test]
    async fn test_data_rx_chunks() {
        let data = vec![7u8; MSG_SIZE * 2 + 3];
        let chunks = recv_all(data_rx(&data)).await.unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].len(), 3);
    }

    #[test]
    fn test_unpack_dirs() {
        let a = Dir::from([("name", "a")]);
        let b = Dir::from([("name", "b")]);
        let mut both = a.pack().unwrap();
        both.extend(b.pack().unwrap());
        let ds = unpack_dirs(vec![both, a.pack().unwrap()]).unwrap();
        assert_eq!(ds, vec![a.clone(), b, a]);
    }
}
