//! # zx-core
//!
//! Directory model, predicates and filesystem capabilities for zx.
//!
//! Key components:
//!
//! - [`Dir`] - Self-describing directory entry (attribute map)
//! - [`Pred`] - Compiled find predicate
//! - [`Fs`] - Umbrella trait over the capability traits
//! - [`ZxError`] - Error type whose messages survive the wire
//! - [`trfs::Trfs`] - Wrapper tracing every call made to a tree
//!
//! ## Design Decisions
//!
//! - **Attribute maps, not structs**: entries carry arbitrary attributes;
//!   uppercase names are user attributes passed through untouched.
//! - **Capabilities queried at run time**: a tree implements the subset of
//!   operations it supports and reports them through [`Fs::caps`].
//! - **Channels for streams**: bulk results travel over bounded channels of
//!   `ZxResult` items, so dropping the receiver cancels the producer.
//! - **No parent pointers**: paths are the only links between entries.

pub mod chg;
pub mod codec;
pub mod dir;
mod error;
pub mod find;
pub mod flags;
pub mod fs;
#[cfg(feature = "testing")]
pub mod fstest;
pub mod path;
pub mod perm;
pub mod pred;
pub mod stats;
pub mod trfs;
pub mod util;

pub use chg::{Chg, ChgKind};
pub use dir::{Dir, equal_dirs};
pub use error::*;
pub use flags::{BoolFlag, FlagAction, Flags, IntFlag, StrFlag};
pub use fs::{
    Auther, Cap, CapSet, FindGetter, FindItem, Finder, Fs, Getter, Linker, Mover, Putter,
    Remover, Rx, Stater, Tx, Wstater,
};
pub use perm::AuthInfo;
pub use pred::Pred;
pub use stats::{IoStats, Op};
