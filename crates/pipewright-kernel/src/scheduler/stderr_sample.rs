//! Bounded tail of a node's stderr, kept for its report.
//!
//! Every node's stderr passes through a pump task on its way to the real
//! sink. The pump tees each chunk into a `StderrSample`, which keeps only the
//! most recent bytes:
//!
//! ```text
//!   node stderr ──▶ pump ──┬──▶ sink (terminal, file, pipeline stderr)
//!                          └──▶ StderrSample (last N bytes, oldest evicted)
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Ring of the last `limit` stderr bytes.
#[derive(Debug)]
pub struct StderrSample {
    bytes: VecDeque<u8>,
    limit: usize,
    /// Bytes evicted so far.
    dropped: usize,
}

impl StderrSample {
    pub fn new(limit: usize) -> Self {
        Self {
            bytes: VecDeque::with_capacity(limit.min(4096)),
            limit,
            dropped: 0,
        }
    }

    /// Append a chunk, evicting the oldest bytes past the limit.
    pub fn push(&mut self, chunk: &[u8]) {
        if self.limit == 0 {
            self.dropped += chunk.len();
            return;
        }
        let chunk = if chunk.len() > self.limit {
            self.dropped += chunk.len() - self.limit;
            &chunk[chunk.len() - self.limit..]
        } else {
            chunk
        };
        let overflow = (self.bytes.len() + chunk.len()).saturating_sub(self.limit);
        if overflow > 0 {
            self.bytes.drain(..overflow);
            self.dropped += overflow;
        }
        self.bytes.extend(chunk);
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Number of bytes evicted from the front.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// The retained tail as text, or `None` if nothing was written.
    pub fn text(&self) -> Option<String> {
        if self.bytes.is_empty() {
            return None;
        }
        let (front, back) = self.bytes.as_slices();
        let mut raw = Vec::with_capacity(self.bytes.len());
        raw.extend_from_slice(front);
        raw.extend_from_slice(back);
        Some(String::from_utf8_lossy(&raw).into_owned())
    }
}

/// Sample shared between a pump task and the pipeline supervisor.
pub type SharedSample = Arc<Mutex<StderrSample>>;

pub fn shared_sample(limit: usize) -> SharedSample {
    Arc::new(Mutex::new(StderrSample::new(limit)))
}
