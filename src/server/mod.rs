//! The two-process pool split.
//!
//! Request-handler processes are many; the pool must be one. A dedicated
//! pool-server process owns the [`crate::pool::StandardPool`] and exposes
//! it on a Unix socket; [`PoolClient`] gives every other process the same
//! [`crate::pool::Pool`] interface by forwarding commands and receiving
//! session streams as passed file descriptors.

pub mod protocol;

mod client;
#[allow(clippy::module_inception)]
mod server;

pub use client::PoolClient;
pub use server::PoolServer;
