//! appool - application pool for long-lived web workers.
//!
//! Spawning an application instance is expensive compared to serving one
//! request, so requests are multiplexed onto a bounded pool of long-lived
//! worker processes. The pool enforces a global worker cap, a per-app cap
//! and an idle-eviction policy, honours filesystem restart triggers, and
//! survives worker crashes by retrying internally.
//!
//! The usual deployment splits the pool into its own process:
//! [`server::PoolServer`] owns a [`pool::StandardPool`], and request
//! handlers talk to it through [`server::PoolClient`], which implements
//! the same [`pool::Pool`] contract.
//!
//! ```no_run
//! use appool::pool::{GetOptions, Pool};
//! use appool::server::PoolClient;
//! use appool::session::encode_cgi_headers;
//!
//! # fn demo() -> appool::Result<()> {
//! let pool = PoolClient::connect("/run/appool/pool.sock")?;
//! let mut session = pool.get(&GetOptions::new("/srv/myapp"))?;
//! session.send_headers(&encode_cgi_headers(&[
//!     ("REQUEST_METHOD", "GET"),
//!     ("REQUEST_URI", "/"),
//! ]))?;
//! session.shutdown_writer()?;
//! // Read the response from session.stream(), then drop the session to
//! // release the worker.
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod error;
pub mod ipc;
pub mod logging;
pub mod paths;
pub mod pool;
pub mod server;
pub mod session;
pub mod spawn;
pub mod version;
pub mod worker;

pub use error::{Error, Result};
