//! # xread-client
//!
//! Batched, asynchronous block reads against an xread server.
//!
//! ```no_run
//! use xread_client::{Client, ClientConfig, ReadOp};
//!
//! # fn main() -> xread_client::Result<()> {
//! let client = Client::connect("127.0.0.1:21321", ClientConfig::default())?;
//!
//! let batch = client.submit_batch(vec![
//!     ReadOp::new("volume-0", 0, 4096),
//!     ReadOp::new("volume-0", 4096, 4096),
//! ])?;
//! client.wait_batch(&batch, None)?;
//! for handle in batch {
//!     let bytes = client.data(&handle).unwrap_or_default();
//!     println!("{} bytes", bytes.len());
//!     client.reclaim(handle)?;
//! }
//! println!("{}", client.stats_string());
//! # Ok(())
//! # }
//! ```
//!
//! | Call            | Blocks | Notes                                     |
//! |-----------------|--------|-------------------------------------------|
//! | `submit`        | no     | validates, then queues to the I/O thread  |
//! | `submit_batch`  | no     | all-or-nothing validation, one countdown  |
//! | `wait`          | yes    | one handle                                |
//! | `wait_batch`    | yes    | whole batch, first failure delivered      |
//! | `result`/`data` | no     | `InProgress` / `None` until complete      |
//! | `reclaim`       | no     | consumes the handle                       |

mod client;
mod config;
mod notifier;
mod request;
mod stats;

pub use client::Client;
pub use config::ClientConfig;
pub use notifier::Countdown;
pub use request::{AioHandle, Completion, ReadOp};
pub use stats::{ClientStats, ClientStatsSnapshot};

pub use xread_core::error::{Result, XreadError};
