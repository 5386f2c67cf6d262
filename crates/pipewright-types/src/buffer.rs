//! Buffering policy for pipeline edges.

use serde::{Deserialize, Serialize};

/// Default byte capacity (matches the Linux kernel pipe default).
pub const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

/// Default capacity for line-buffered edges.
pub const DEFAULT_LINE_CAPACITY: usize = 1024;

/// How an edge buffers data between its producer and consumer.
///
/// The policy is chosen when the graph is built and stays fixed for the
/// lifetime of the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum BufferPolicy {
    /// Hold at most `capacity` unread bytes.
    Bytes { capacity: usize },
    /// Hold at most `capacity` complete, unread lines. A partial line stays
    /// with the producer until its newline arrives (or the stream closes).
    Lines { capacity: usize },
    /// Forward every write as its own chunk, one chunk in flight at a time.
    Unbuffered,
}

impl BufferPolicy {
    /// Byte-capacity policy. A capacity of zero is raised to one.
    pub fn bytes(capacity: usize) -> Self {
        BufferPolicy::Bytes {
            capacity: capacity.max(1),
        }
    }

    /// Line-capacity policy. A capacity of zero is raised to one.
    pub fn lines(capacity: usize) -> Self {
        BufferPolicy::Lines {
            capacity: capacity.max(1),
        }
    }

    /// Build a policy from a configured mode and the configured capacities.
    pub fn from_mode(mode: BufferMode, pipe_capacity: usize, line_capacity: usize) -> Self {
        match mode {
            BufferMode::Bytes => Self::bytes(pipe_capacity),
            BufferMode::Lines => Self::lines(line_capacity),
            BufferMode::Unbuffered => BufferPolicy::Unbuffered,
        }
    }

    /// Capacity in this policy's unit (bytes, lines, or chunks).
    pub fn capacity(&self) -> usize {
        match *self {
            BufferPolicy::Bytes { capacity } | BufferPolicy::Lines { capacity } => capacity,
            BufferPolicy::Unbuffered => 1,
        }
    }

    /// The unit `capacity` is counted in.
    pub fn unit(&self) -> &'static str {
        match self {
            BufferPolicy::Bytes { .. } => "bytes",
            BufferPolicy::Lines { .. } => "lines",
            BufferPolicy::Unbuffered => "chunks",
        }
    }
}

impl Default for BufferPolicy {
    fn default() -> Self {
        BufferPolicy::Bytes {
            capacity: DEFAULT_PIPE_CAPACITY,
        }
    }
}

/// Buffering mode as written in configuration files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferMode {
    #[default]
    Bytes,
    Lines,
    Unbuffered,
}
