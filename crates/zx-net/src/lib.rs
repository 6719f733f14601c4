//! # zx-net
//!
//! Transports for zx: framing, call multiplexing, addresses, TLS and the
//! challenge-response authentication run on each fresh connection.
//!
//! A transport carries length-prefixed [`Frame`]s. A [`Mux`] turns one
//! transport into many concurrent [`Conn`]s, each a pair of typed channels
//! with per-call flow control. [`dial`] and [`serve`] open transports for
//! `tcp`, `tls`, `unix` and `fifo` addresses; [`pipe_pair`] connects two
//! muxes in process.

pub mod addr;
pub mod auth;
#[cfg(target_os = "linux")]
pub mod fifo;
pub mod frame;
pub mod mux;
pub mod tls;
pub mod transport;

pub use addr::{Addr, fill_addr};
pub use auth::{AuthConfig, at_client, at_server, is_auth_disabled};
pub use frame::{Data, Frame};
pub use mux::{Conn, Mux, pipe_pair};
pub use tls::TlsConfig;
pub use transport::{Listener, dial, serve};
