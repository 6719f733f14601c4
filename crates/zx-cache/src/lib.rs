//! # zx-cache
//!
//! A write-back cache over any zx tree.
//!
//! [`Cache`] keeps the entries it has seen in memory and answers from them
//! while they are fresh. Changes are made to the cached entries first and
//! written back later by a background syncer, on `sync`, or at once with the
//! `writesync` flag. Writing `inval` to `/Ctl` forgets what was fetched.
//!
//! ```no_run
//! # async fn demo() -> zx_core::ZxResult<()> {
//! use std::sync::Arc;
//! use zx_cache::{Cache, CacheConfig};
//! use zx_core::{Fs, util};
//!
//! let lfs: Arc<dyn Fs> = Arc::new(zx_lfs::Lfs::new("/tmp", false)?);
//! let fs = Cache::new(lfs, CacheConfig::default()).await?;
//! util::put_all(&fs, "/hello", zx_core::Dir::from([("type", "-")]), b"hi").await?;
//! fs.sync().await?;
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod cache;
mod entry;

pub use buffer::Buffer;
pub use cache::{CACHE_TOUT, Cache, CacheConfig, SYNC_IVAL};
pub use entry::State;
