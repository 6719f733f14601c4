//! # zx-mfs
//!
//! zx trees kept in memory.
//!
//! [`Mfs`] holds every entry in one map keyed by path. It answers the same
//! operations as a host tree, except links, and is handy as a scratch tree
//! and as a second backend in tests.
//!
//! ```
//! # async fn demo() -> zx_core::ZxResult<()> {
//! use zx_core::{Dir, Fs, util};
//!
//! let fs = zx_mfs::Mfs::new("scratch");
//! let fs = &fs as &dyn Fs;
//! util::put_all(fs, "/notes", Dir::from([("type", "-")]), b"hi").await?;
//! assert_eq!(fs.stat("/notes").await?.size(), 2);
//! # Ok(())
//! # }
//! ```

pub mod mfs;

pub use mfs::Mfs;
