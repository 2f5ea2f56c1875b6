//! Core types, constants and the error model shared by every crate in the
//! remote plugin proxy.
//!
//! This crate provides the fundamental building blocks that
//! `rplugin-ipc`, `rplugin-client` and `rplugin-server` all depend on.

use std::time::Duration;

/// Sample rate in Hz.
pub type SampleRate = u32;

/// Number of audio frames (samples per channel) in one process block.
pub type Frames = usize;

/// Number of audio channels.
pub type ChannelCount = usize;

/// Bytes per sample in the shared audio region (32-bit float).
pub const SAMPLE_BYTES: usize = 4;

/// Capacity in bytes of the ring buffer's backing byte array.
pub const RING_CAPACITY: usize = 2048;

/// Length in bytes of the per-file transport suffix (last 6 characters of a
/// temporary filename).
pub const SUFFIX_LEN: usize = 6;

/// Length in bytes of the full transport identifier handed to the helper
/// (four concatenated suffixes: request/response/control/audio).
pub const TRANSPORT_ID_LEN: usize = SUFFIX_LEN * 4;

/// Deadline for a semaphore wait on either side of the ring channel.
/// Once exceeded the peer is presumed dead and the instance is invalidated.
pub const SEMAPHORE_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for the client's initial connection attempt on the request pipe.
/// Exceeding this surfaces a failed helper spawn as a timeout rather than a
/// hang.
pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(40);

/// Number of consecutive missed watchdog ticks (one per second) before the
/// watchdog force-terminates the audio-dispatch thread.
pub const WATCHDOG_MISSED_TICKS: u32 = 20;

/// Deadline the destructor waits, non-blocking, for the child helper process
/// to be reaped after requesting termination.
pub const REAP_TIMEOUT: Duration = Duration::from_secs(3);

/// Fixed length of the server-to-UI parameter change notification ring.
/// Overflow silently drops the oldest pending entry.
pub const PARAM_NOTIFY_CAPACITY: usize = 200;

/// Debug verbosity requested of the remote plugin via `SetDebugLevel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i32)]
pub enum DebugLevel {
    None = 0,
    Setup = 1,
    Events = 2,
    Data = 3,
}

impl DebugLevel {
    #[must_use]
    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => Self::Setup,
            2 => Self::Events,
            3 => Self::Data,
            _ => Self::None,
        }
    }
}

/// The three error kinds described by the proxy's error handling design.
///
/// Only [`Error::ConnectionLost`] is meant to escape a public API method —
/// protocol violations and plugin rejections are logged at the point they
/// occur and never constructed as a value a caller has to handle. The
/// variants still exist on this type so internal code has one vocabulary to
/// reach for when deciding how to log something.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The peer died, a pipe returned EOF, a semaphore wait timed out, or a
    /// blob failed to decompress. Fatal for the instance: every further
    /// client call becomes a no-op returning a safe default.
    #[error("connection lost")]
    ConnectionLost,

    /// An opcode arrived on the wrong channel, or a payload's declared
    /// length didn't match what was available. This is a programming bug in
    /// one of the endpoints, not an expected runtime condition. Callers
    /// should log and discard the offending message; the channel itself
    /// keeps running.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The hosted plugin refused an operation (unsupported opcode from its
    /// own perspective, rejected MIDI event, etc). Observable only via log
    /// output; the calling endpoint still returns a normal value to its own
    /// caller.
    #[error("plugin rejected operation: {0}")]
    PluginRejection(String),

    /// Lower-level I/O failure not otherwise classified above.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for the one variant that invalidates an instance.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::ConnectionLost | Self::Io(_))
    }
}

/// Result type alias used throughout the proxy.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_level_round_trips_known_values() {
        assert_eq!(DebugLevel::from_i32(0), DebugLevel::None);
        assert_eq!(DebugLevel::from_i32(1), DebugLevel::Setup);
        assert_eq!(DebugLevel::from_i32(2), DebugLevel::Events);
        assert_eq!(DebugLevel::from_i32(3), DebugLevel::Data);
    }

    #[test]
    fn debug_level_defaults_unknown_values_to_none() {
        assert_eq!(DebugLevel::from_i32(99), DebugLevel::None);
        assert_eq!(DebugLevel::from_i32(-1), DebugLevel::None);
    }

    #[test]
    fn only_connection_lost_and_io_are_fatal() {
        assert!(Error::ConnectionLost.is_fatal());
        assert!(!Error::ProtocolViolation("x".into()).is_fatal());
        assert!(!Error::PluginRejection("x".into()).is_fatal());
    }

    #[test]
    fn transport_id_len_is_four_suffixes() {
        assert_eq!(TRANSPORT_ID_LEN, 24);
    }
}
