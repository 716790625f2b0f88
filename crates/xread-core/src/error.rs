//! xread error types.
//!
//! Every variant maps onto a POSIX errno via [`XreadError::errno`]. The errno
//! is what travels in a response's `errval` field and what the client
//! reports from `result()`.

use nix::errno::Errno;

/// Failure decoding or interpreting a wire message.
///
/// A protocol error never tears down a connection. The server answers it
/// with an `ErrorRsp` and keeps reading.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// Truncated or structurally invalid header.
    #[error("malformed message: {0}")]
    Malformed(&'static str),
    /// Opcode byte outside the known set.
    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),
    /// Known opcode that is not valid in this direction (e.g. a response
    /// opcode arriving at the server).
    #[error("unexpected opcode {0:?}")]
    UnexpectedOpcode(crate::wire::Opcode),
    /// Header or field longer than the protocol bound.
    #[error("oversized {what}: {len} bytes (max {max})")]
    Oversized {
        what: &'static str,
        len: usize,
        max: usize,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum XreadError {
    /// Bad size, offset, filename or handle. Rejected before any network
    /// activity.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// Buffer pool and fallback allocator both failed.
    #[error("resource exhausted")]
    ResourceExhausted,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// The file backend reported an errno.
    #[error("backend error: {}", errno_text(.0))]
    Backend(i32),
    /// The connection was torn down. Permanent for that client.
    #[error("disconnected")]
    Disconnected,
    #[error("timed out")]
    TimedOut,
    /// The operation has not completed yet.
    #[error("operation in progress")]
    InProgress,
    /// Requested operation is not supported (e.g. cancel).
    #[error("operation not supported")]
    Unsupported,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl XreadError {
    /// POSIX errno equivalent of this error.
    pub fn errno(&self) -> i32 {
        match self {
            Self::InvalidArgument(_) => libc::EINVAL,
            Self::ResourceExhausted => libc::ENOMEM,
            Self::Protocol(ProtocolError::UnknownOpcode(_))
            | Self::Protocol(ProtocolError::UnexpectedOpcode(_)) => libc::EIO,
            Self::Protocol(_) => libc::EBADMSG,
            Self::Backend(code) => *code,
            Self::Disconnected => libc::ENOTCONN,
            Self::TimedOut => libc::ETIMEDOUT,
            Self::InProgress => libc::EINPROGRESS,
            Self::Unsupported => libc::ENOSYS,
            Self::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// Rebuild an error from an errno carried in a response.
    pub fn from_errno(code: i32) -> Self {
        match code {
            libc::ENOMEM => Self::ResourceExhausted,
            libc::ENOTCONN => Self::Disconnected,
            libc::EBADMSG => Self::Protocol(ProtocolError::Malformed("rejected by peer")),
            c => Self::Backend(c),
        }
    }

    /// The last OS error on this thread, as a backend error.
    pub fn last_os() -> Self {
        Self::Backend(Errno::last() as i32)
    }
}

pub type Result<T> = std::result::Result<T, XreadError>;

fn errno_text(code: &i32) -> &'static str {
    Errno::from_raw(*code).desc()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Opcode;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(XreadError::InvalidArgument("size").errno(), libc::EINVAL);
        assert_eq!(XreadError::ResourceExhausted.errno(), libc::ENOMEM);
        assert_eq!(
            XreadError::from(ProtocolError::Malformed("short")).errno(),
            libc::EBADMSG
        );
        assert_eq!(
            XreadError::from(ProtocolError::UnexpectedOpcode(Opcode::ReadRsp)).errno(),
            libc::EIO
        );
        assert_eq!(XreadError::Backend(libc::ENOENT).errno(), libc::ENOENT);
        assert_eq!(XreadError::Unsupported.errno(), libc::ENOSYS);
    }

    #[test]
    fn test_from_errno() {
        assert!(matches!(XreadError::from_errno(libc::ENOMEM), XreadError::ResourceExhausted));
        assert!(matches!(XreadError::from_errno(libc::ENOENT), XreadError::Backend(libc::ENOENT)));
        assert_eq!(XreadError::from_errno(libc::EIO).errno(), libc::EIO);
    }

    #[test]
    fn test_backend_display_uses_errno_text() {
        let msg = XreadError::Backend(libc::ENOENT).to_string();
        assert!(msg.starts_with("backend error: "));
        assert!(msg.len() > "backend error: ".len());
    }
}
