//! # xread-module — default implementations
//!
//! This crate provides the default implementation behind every xread-core
//! seam, plus the small OS primitives the reactors are built from.
//! Each impl prioritizes correctness and simplicity over performance.
//!
//! ## Default stack
//!
//! | Seam              | Default impl          | Alternative            |
//! |-------------------|-----------------------|------------------------|
//! | FileBackend       | PreadPool             | UringBackend           |
//! | StatusSink        | StatusWriter (pipe)   | —                      |
//! | PortalTransport   | TcpPortalTransport    | —                      |
//! | buffers           | SlabPool + Fallback   | —                      |
//!
//! ## Primitives
//!
//! | Type        | Wraps                                   |
//! |-------------|-----------------------------------------|
//! | EventFd     | eventfd(2), cross-thread wake           |
//! | Poller      | epoll(7), level-triggered               |
//! | TimerFd     | timerfd(2), periodic ticks in a loop    |
//! | StatusPipe  | pipe2(2) carrying 16-byte `IoStatus`    |

pub mod eventfd;
pub mod poller;
pub mod timer;
pub mod status_pipe;
pub mod pool;
pub mod pread_pool;
pub mod uring_backend;
pub mod frame;
pub mod tcp;
pub mod affinity;

pub(crate) fn last_errno() -> i32 {
    nix::errno::Errno::last() as i32
}
