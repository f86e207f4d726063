//! # loom-ipc
//!
//! Wire protocol shared by the in-process daemon, the controller and
//! `loomctl`.
//!
//! Every message is a frame: a 4-byte big-endian length followed by that many
//! bytes of UTF-8 text. The length counts the payload only. Message text is a
//! space-separated command line (`add 3 /tmp/fix.filter`) or a free-form
//! reply (`OK` on success).

pub mod command;
pub mod frame;

#[cfg(feature = "tokio")]
pub mod client;

pub use command::{ControlCommand, DaemonCommand, Hello};
pub use frame::{read_frame, write_frame};

#[cfg(feature = "tokio")]
pub use frame::{read_frame_async, write_frame_async};

/// Largest payload a peer will accept (64 KiB).
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Reply text for a successful command.
pub const OK: &str = "OK";

#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame of {0} bytes exceeds the {max} byte limit", max = MAX_FRAME_LEN)]
    FrameTooLarge(usize),
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,
    #[error("no command specified")]
    Empty,
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("format error: {0}")]
    Format(&'static str),
    #[error("invalid number: {0}")]
    InvalidNumber(String),
}

/// Returns true when a reply means success.
pub fn is_ok(reply: &str) -> bool {
    reply.trim() == OK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_ok() {
        assert!(is_ok("OK"));
        assert!(is_ok("OK\n"));
        assert!(!is_ok("failed to add the filter"));
        assert!(!is_ok(""));
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(IpcError::Empty.to_string(), "no command specified");
        assert!(IpcError::FrameTooLarge(70_000)
            .to_string()
            .contains("65536"));
    }
}
