//! # xread-server
//!
//! Serves block reads of files under a root directory to remote clients.
//!
//! ## Threads
//!
//! | Thread              | Count        | Owns                                      |
//! |---------------------|--------------|-------------------------------------------|
//! | `xread-acceptor`    | 1            | listener; hands sessions to portals       |
//! | `xread-portal-{i}`  | `portals`    | transport, connections, requests, pool    |
//! | `xread-fwd-{i}`     | `portals`    | status pipe read end of portal `i`        |
//! | backend workers     | backend-defined | reads in flight                       |
//!
//! ## Request lifecycle
//!
//! A request message becomes a [`request::RequestRecord`] in its portal's
//! arena. Reads get a pool buffer and go to the [`FileBackend`]; the
//! completion comes back through the status pipe, the forwarder and the
//! portal inbox. The response is queued on the transport with the buffer
//! as payload, and the record is released only when the transport hands
//! the buffer back.
//!
//! [`FileBackend`]: xread_core::io_backend::FileBackend

pub mod acceptor;
pub mod config;
pub mod connection;
pub mod forwarder;
pub mod logging;
pub mod portal;
pub mod request;
pub mod resolver;
pub mod server;
pub mod stats;

pub use config::{ConfigError, ServerConfig};
pub use server::Server;
pub use stats::StatsSnapshot;
