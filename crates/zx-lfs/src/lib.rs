//! # zx-lfs
//!
//! zx trees backed by host directories.
//!
//! [`Lfs`] maps a host directory onto the zx operations. Host metadata
//! becomes the system attributes of each Dir; user attributes are kept in a
//! `.zx` file inside each directory, hidden from listings. `/Ctl` is
//! synthesized at the root.
//!
//! ```no_run
//! # async fn demo() -> zx_core::ZxResult<()> {
//! use std::sync::Arc;
//! use zx_core::{Fs, util};
//!
//! let fs: Arc<dyn Fs> = Arc::new(zx_lfs::Lfs::new("/tmp", false)?);
//! let d = fs.stat("/").await?;
//! println!("{}", d.long_fmt());
//! let _ = util::get_dir(fs.as_ref(), "/").await?;
//! # Ok(())
//! # }
//! ```

mod host;
pub mod lfs;
mod sidecar;

pub use lfs::{Lfs, SYNC_IVAL};
pub use sidecar::SIDECAR;
