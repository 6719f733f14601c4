//! # zx-rzx
//!
//! Remote access to zx trees.
//!
//! A [`Server`] exports named trees over any zx-net transport. A [`Client`]
//! is an [`zx_core::Fs`] for one tree on a server; each operation is one
//! call on the shared connection, encoded as a [`Msg`]. [`Dialer`] caches
//! connections by address.
//!
//! Directory entries returned by a server carry
//! `addr = zx!<server>!<tree>!<server path>`.

pub mod client;
pub mod dialer;
pub mod msg;
pub mod server;

pub use client::{Client, DialOpts};
pub use dialer::Dialer;
pub use msg::{Msg, Op};
pub use server::{Server, ServerConfig};
