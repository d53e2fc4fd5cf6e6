//! Typed error kinds shared across every component in this crate.
//!
//! Every fallible public function returns [`Result<T>`], a thin alias over
//! `std::result::Result<T, Error>`. `anyhow` is reserved for the daemon entry
//! point (`main.rs`) and for tests, where a catch-all error type is idiomatic
//! and callers have no need to match on a specific kind.

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// The closed set of error kinds a caller may need to match on.
///
/// Each variant optionally carries the short (8-character) session id it
/// relates to and, where applicable, the underlying cause. Wrapping a lower
/// layer's error always preserves the original kind rather than collapsing
/// everything into `Internal`.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// No session exists with the given id, name, or prefix.
    #[error("session not found{}", fmt_session(.session_id))]
    SessionNotFound {
        /// Short session id, if known.
        session_id: Option<String>,
    },

    /// A session with this name or id already exists.
    #[error("session already exists{}", fmt_session(.session_id))]
    SessionAlreadyExists {
        /// Short session id, if known.
        session_id: Option<String>,
    },

    /// The PTY or child process could not be started.
    #[error("session start failed{}: {source}", fmt_session(.session_id))]
    SessionStartFailed {
        /// Short session id, if known.
        session_id: Option<String>,
        /// Underlying cause.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// An operation that requires a live process was attempted on an exited session.
    #[error("session not running{}", fmt_session(.session_id))]
    SessionNotRunning {
        /// Short session id, if known.
        session_id: Option<String>,
    },

    /// The recorded PID does not correspond to a live process.
    #[error("process not found{}", fmt_session(.session_id))]
    ProcessNotFound {
        /// Short session id, if known.
        session_id: Option<String>,
    },

    /// Sending a signal to the child process failed.
    #[error("process signal failed{}: {source}", fmt_session(.session_id))]
    ProcessSignalFailed {
        /// Short session id, if known.
        session_id: Option<String>,
        /// Underlying cause.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Graceful (SIGTERM-then-SIGKILL) termination did not complete cleanly.
    #[error("process terminate failed{}: {source}", fmt_session(.session_id))]
    ProcessTerminateFailed {
        /// Short session id, if known.
        session_id: Option<String>,
        /// Underlying cause.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The session's stdin FIFO does not exist.
    #[error("stdin fifo not found{}", fmt_session(.session_id))]
    StdinNotFound {
        /// Short session id, if known.
        session_id: Option<String>,
    },

    /// Writing to the stdin FIFO failed.
    #[error("stdin write failed{}: {source}", fmt_session(.session_id))]
    StdinWriteFailed {
        /// Short session id, if known.
        session_id: Option<String>,
        /// Underlying cause.
        #[source]
        source: std::io::Error,
    },

    /// Reading the cast stream failed.
    #[error("stream read failed{}: {source}", fmt_session(.session_id))]
    StreamReadFailed {
        /// Short session id, if known.
        session_id: Option<String>,
        /// Underlying cause.
        #[source]
        source: std::io::Error,
    },

    /// Appending to the cast stream failed.
    #[error("stream write failed{}: {source}", fmt_session(.session_id))]
    StreamWriteFailed {
        /// Short session id, if known.
        session_id: Option<String>,
        /// Underlying cause.
        #[source]
        source: std::io::Error,
    },

    /// Allocating the PTY pair failed.
    #[error("pty creation failed{}: {source}", fmt_session(.session_id))]
    PTYCreationFailed {
        /// Short session id, if known.
        session_id: Option<String>,
        /// Underlying cause.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Applying termios settings to the PTY master failed.
    #[error("pty config failed{}: {source}", fmt_session(.session_id))]
    PTYConfigFailed {
        /// Short session id, if known.
        session_id: Option<String>,
        /// Underlying cause.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Updating the PTY window size failed.
    #[error("pty resize failed{}: {source}", fmt_session(.session_id))]
    PTYResizeFailed {
        /// Short session id, if known.
        session_id: Option<String>,
        /// Underlying cause.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The session's control directory is missing.
    #[error("control path not found{}", fmt_session(.session_id))]
    ControlPathNotFound {
        /// Short session id, if known.
        session_id: Option<String>,
    },

    /// A `session.json` or control-fifo line could not be parsed.
    #[error("control file corrupted{}: {source}", fmt_session(.session_id))]
    ControlFileCorrupted {
        /// Short session id, if known.
        session_id: Option<String>,
        /// Underlying cause.
        #[source]
        source: serde_json::Error,
    },

    /// A control command named a key this server does not recognize.
    #[error("unknown key: {key}")]
    UnknownKey {
        /// The offending key.
        key: String,
    },

    /// A request value failed structural validation.
    #[error("invalid input: {message}")]
    InvalidInput {
        /// Human-readable explanation.
        message: String,
    },

    /// A request argument was syntactically valid but out of the accepted range.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Human-readable explanation.
        message: String,
    },

    /// The caller lacks permission for the requested operation.
    #[error("permission denied{}", fmt_session(.session_id))]
    PermissionDenied {
        /// Short session id, if known.
        session_id: Option<String>,
    },

    /// An operation did not complete within its allotted time.
    #[error("timeout{}", fmt_session(.session_id))]
    Timeout {
        /// Short session id, if known.
        session_id: Option<String>,
    },

    /// A catch-all for failures that do not fit another kind.
    #[error("internal error: {message}")]
    Internal {
        /// Human-readable explanation.
        message: String,
    },
}

fn fmt_session(session_id: &Option<String>) -> String {
    match session_id {
        Some(id) => format!(" ({})", short_id(id)),
        None => String::new(),
    }
}

/// Truncates a session id to its 8-character short form for log/error display.
#[must_use]
pub fn short_id(id: &str) -> &str {
    &id[..id.len().min(8)]
}

impl Error {
    /// Attaches (or overwrites) the session id carried by this error, where applicable.
    #[must_use]
    pub fn with_session(mut self, id: &str) -> Self {
        let short = short_id(id).to_string();
        match &mut self {
            Error::SessionNotFound { session_id }
            | Error::SessionAlreadyExists { session_id }
            | Error::SessionStartFailed { session_id, .. }
            | Error::SessionNotRunning { session_id }
            | Error::ProcessNotFound { session_id }
            | Error::ProcessSignalFailed { session_id, .. }
            | Error::ProcessTerminateFailed { session_id, .. }
            | Error::StdinNotFound { session_id }
            | Error::StdinWriteFailed { session_id, .. }
            | Error::StreamReadFailed { session_id, .. }
            | Error::StreamWriteFailed { session_id, .. }
            | Error::PTYCreationFailed { session_id, .. }
            | Error::PTYConfigFailed { session_id, .. }
            | Error::PTYResizeFailed { session_id, .. }
            | Error::ControlPathNotFound { session_id }
            | Error::ControlFileCorrupted { session_id, .. }
            | Error::PermissionDenied { session_id }
            | Error::Timeout { session_id } => *session_id = Some(short),
            Error::UnknownKey { .. }
            | Error::InvalidInput { .. }
            | Error::InvalidArgument { .. }
            | Error::Internal { .. } => {}
        }
        self
    }

    /// The kind name, for logging without the full `Display` message.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Error::SessionNotFound { .. } => "SessionNotFound",
            Error::SessionAlreadyExists { .. } => "SessionAlreadyExists",
            Error::SessionStartFailed { .. } => "SessionStartFailed",
            Error::SessionNotRunning { .. } => "SessionNotRunning",
            Error::ProcessNotFound { .. } => "ProcessNotFound",
            Error::ProcessSignalFailed { .. } => "ProcessSignalFailed",
            Error::ProcessTerminateFailed { .. } => "ProcessTerminateFailed",
            Error::StdinNotFound { .. } => "StdinNotFound",
            Error::StdinWriteFailed { .. } => "StdinWriteFailed",
            Error::StreamReadFailed { .. } => "StreamReadFailed",
            Error::StreamWriteFailed { .. } => "StreamWriteFailed",
            Error::PTYCreationFailed { .. } => "PTYCreationFailed",
            Error::PTYConfigFailed { .. } => "PTYConfigFailed",
            Error::PTYResizeFailed { .. } => "PTYResizeFailed",
            Error::ControlPathNotFound { .. } => "ControlPathNotFound",
            Error::ControlFileCorrupted { .. } => "ControlFileCorrupted",
            Error::UnknownKey { .. } => "UnknownKey",
            Error::InvalidInput { .. } => "InvalidInput",
            Error::InvalidArgument { .. } => "InvalidArgument",
            Error::PermissionDenied { .. } => "PermissionDenied",
            Error::Timeout { .. } => "Timeout",
            Error::Internal { .. } => "Internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_id_truncates() {
        assert_eq!(short_id("0123456789abcdef"), "01234567");
        assert_eq!(short_id("abc"), "abc");
    }

    #[test]
    fn with_session_sets_id_on_matching_variants() {
        let err = Error::SessionNotFound { session_id: None }.with_session("0123456789abcdef");
        assert_eq!(err.to_string(), "session not found (01234567)");
    }

    #[test]
    fn with_session_is_noop_on_sessionless_variants() {
        let err = Error::InvalidArgument {
            message: "cols must be positive".into(),
        }
        .with_session("0123456789abcdef");
        assert_eq!(err.to_string(), "invalid argument: cols must be positive");
    }

    #[test]
    fn kind_name_matches_variant() {
        let err = Error::Timeout { session_id: None };
        assert_eq!(err.kind_name(), "Timeout");
    }
}
