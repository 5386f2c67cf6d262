//! Error taxonomy for the engine.
//!
//! All errors carry string payloads and are `Clone`, so a single failure can
//! be handed to a group iterator and to the member's own waiter.

use std::io;

use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// A node could not be started. Fatal: no data flows.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LaunchError {
    #[error("{0}: command not found")]
    NotFound(String),
    #[error("{0}: permission denied")]
    PermissionDenied(String),
    #[error("{identity}: setup failed: {message}")]
    Setup { identity: String, message: String },
    #[error("{identity}: {message}")]
    Spawn { identity: String, message: String },
    #[error("{path}: {message}")]
    Redirect { path: String, message: String },
}

/// The pipeline graph is malformed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("pipeline has no nodes")]
    Empty,
    #[error("node {index} ({identity}) declares its own stdin but is fed by a pipe")]
    ConflictingStdin { index: usize, identity: String },
    #[error("node {index} ({identity}) declares its own stdout but feeds a pipe")]
    ConflictingStdout { index: usize, identity: String },
    #[error("pipeline stdin is bound twice")]
    DuplicateSource,
    #[error("pipeline stdout is bound twice")]
    DuplicateSink,
    #[error("node {index} ({identity}) pipes its stderr but has no next node")]
    DanglingStderrPipe { index: usize, identity: String },
}

/// Failure of a stream operation on an edge.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// The consumer end is gone.
    #[error("broken pipe")]
    BrokenPipe,
    /// The producer already closed this end.
    #[error("stream closed")]
    Closed,
    /// Teardown is in progress.
    #[error("cancelled")]
    Cancelled,
    #[error("io error: {0}")]
    Io(String),
}

impl StreamError {
    /// True if this error, or an I/O error wrapping it, means the consumer went away.
    pub fn is_broken_pipe(err: &anyhow::Error) -> bool {
        if let Some(stream) = err.downcast_ref::<StreamError>() {
            return *stream == StreamError::BrokenPipe;
        }
        if let Some(io) = err.downcast_ref::<io::Error>() {
            return io.kind() == io::ErrorKind::BrokenPipe;
        }
        false
    }
}

impl From<io::Error> for StreamError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::BrokenPipe => StreamError::BrokenPipe,
            _ => StreamError::Io(err.to_string()),
        }
    }
}

impl From<StreamError> for io::Error {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::BrokenPipe => io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader closed"),
            StreamError::Closed => io::Error::new(io::ErrorKind::NotConnected, "stream closed"),
            StreamError::Cancelled => io::Error::new(io::ErrorKind::Interrupted, "cancelled"),
            StreamError::Io(message) => io::Error::other(message),
        }
    }
}

/// Top-level engine error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("{identity}: exited with status {status}")]
    ExitStatus { identity: String, status: i32 },
    #[error("stream error: {0}")]
    Stream(StreamError),
    #[error("cancelled")]
    Cancelled,
    /// A group member's factory or pipeline panicked.
    #[error("group member {index} panicked: {message}")]
    Panicked { index: usize, message: String },
}

impl From<StreamError> for EngineError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::Cancelled => EngineError::Cancelled,
            other => EngineError::Stream(other),
        }
    }
}

impl From<io::Error> for EngineError {
    fn from(err: io::Error) -> Self {
        EngineError::Stream(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broken_pipe_round_trips_through_io() {
        let io: io::Error = StreamError::BrokenPipe.into();
        assert_eq!(io.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(StreamError::from(io), StreamError::BrokenPipe);
    }

    #[test]
    fn broken_pipe_detected_in_anyhow() {
        let err = anyhow::Error::new(StreamError::BrokenPipe);
        assert!(StreamError::is_broken_pipe(&err));

        let err = anyhow::Error::new(io::Error::new(io::ErrorKind::BrokenPipe, "x"));
        assert!(StreamError::is_broken_pipe(&err));

        let err = anyhow::anyhow!("something else");
        assert!(!StreamError::is_broken_pipe(&err));
    }

    #[test]
    fn cancelled_stream_maps_to_engine_cancelled() {
        assert_eq!(EngineError::from(StreamError::Cancelled), EngineError::Cancelled);
    }

    #[test]
    fn exit_status_message_names_command() {
        let err = EngineError::ExitStatus {
            identity: "grep foo".into(),
            status: 1,
        };
        assert_eq!(err.to_string(), "grep foo: exited with status 1");
    }
}
