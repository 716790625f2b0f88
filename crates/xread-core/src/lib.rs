//! # xread-core — protocol and trait definitions for xread
//!
//! xread is a remote block-read service. A client submits asynchronous
//! reads of named objects, a server executes them against a local file
//! backend and answers out of order as reads complete.
//!
//! This crate holds everything both sides agree on, and the trait
//! boundaries the server is built against:
//!
//! | Module       | Contents                                              |
//! |--------------|-------------------------------------------------------|
//! | `wire`       | `WireMessage` codec, `Opcode`, parsed `Request`       |
//! | `error`      | `XreadError` taxonomy with errno mapping              |
//! | `buffer`     | `IoBuffer`, an aligned owned I/O buffer               |
//! | `io_backend` | `FileBackend`, `ReadOp`, `IoStatus`, `StatusSink`     |
//! | `transport`  | `PortalTransport` and its event vocabulary            |
//!
//! ## Design principle
//!
//! Every component of the server depends on traits from this crate, never
//! on concrete types. Default implementations live in `xread-module`.

pub mod wire;
pub mod error;
pub mod buffer;
pub mod io_backend;
pub mod transport;

pub use error::{ProtocolError, Result, XreadError};
