//! Application-wide constants.
//!
//! Centralizes magic numbers so the concurrency and resource-model policies
//! described alongside each component live in one place.
//!
//! # Categories
//!
//! - **Dimensions**: default terminal geometry
//! - **Polling**: readiness-loop and tailer intervals
//! - **Termination**: graceful-kill timing
//! - **WebSocket**: keepalive cadence

use std::time::Duration;

// ============================================================================
// Dimensions
// ============================================================================

/// Default terminal width in columns for a session that does not specify one.
pub const DEFAULT_COLS: u16 = 120;

/// Default terminal height in rows for a session that does not specify one.
pub const DEFAULT_ROWS: u16 = 30;

/// Default `TERM` environment value presented to spawned children.
pub const DEFAULT_TERM: &str = "xterm-256color";

// ============================================================================
// Polling & Tailing
// ============================================================================

/// Interval between readiness-poll reconciliation passes in the I/O multiplexer.
///
/// Bounds how quickly a loop notices shutdown or liveness changes when no fd
/// is otherwise ready.
pub const IO_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Polling fallback interval for the cast tailer when file-change notifications
/// are unavailable or have not fired.
pub const TAIL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Minimum interval between liveness checks performed by the buffer manager
/// for sessions with active subscribers.
pub const LIVENESS_CHECK_INTERVAL: Duration = Duration::from_secs(5);

// ============================================================================
// Termination
// ============================================================================

/// How long `terminateGracefully` waits for SIGTERM to take effect before
/// escalating to SIGKILL.
pub const TERMINATE_GRACE_PERIOD: Duration = Duration::from_secs(3);

/// Interval between liveness polls during the grace period.
pub const TERMINATE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Time allowed for a SIGKILL to take effect before giving up.
pub const TERMINATE_KILL_LINGER: Duration = Duration::from_millis(100);

/// Time a client write to the control FIFO waits for a reader before failing.
pub const CONTROL_FIFO_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

// ============================================================================
// WebSocket
// ============================================================================

/// How often the `/buffers` WebSocket sends a ping frame.
pub const WS_PING_INTERVAL: Duration = Duration::from_secs(10);

/// How long the server waits for a pong before closing an unresponsive socket.
pub const WS_PONG_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Back-pressure
// ============================================================================

/// Bounded channel depth for raw (byte-slice) subscriptions.
pub const RAW_SUBSCRIPTION_DEPTH: usize = 64;

/// Bounded channel depth for buffer-snapshot subscriptions.
///
/// Snapshots coalesce under back-pressure, so this can stay small.
pub const BUFFER_SUBSCRIPTION_DEPTH: usize = 10;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dimensions_are_positive() {
        assert!(DEFAULT_COLS > 0);
        assert!(DEFAULT_ROWS > 0);
    }

    #[test]
    fn termination_timing_is_internally_consistent() {
        // The grace period must be an exact multiple of the poll interval so
        // the terminator's poll loop (§4.7) lands on a clean boundary.
        assert_eq!(
            TERMINATE_GRACE_PERIOD.as_millis() % TERMINATE_POLL_INTERVAL.as_millis(),
            0
        );
    }

    #[test]
    fn ws_pong_timeout_is_a_multiple_of_ping_interval() {
        assert_eq!(WS_PONG_TIMEOUT.as_secs() % WS_PING_INTERVAL.as_secs(), 0);
    }
}
