//! Bounded stream with backpressure for pipeline edges.
//!
//! A stream carries opaque byte chunks (or, in line mode, whole lines) from
//! one or more producers to a single consumer. Writers suspend while the
//! buffer is at capacity; nothing is ever queued past it.
//!
//! ```text
//!   StreamWriter ─┐
//!   StreamWriter ─┼──▶ [VecDeque<chunk>, fill ≤ capacity] ──▶ StreamReader
//!   (clones)     ─┘    ├── writers suspend while full
//!                      ├── reader suspends while empty
//!                      ├── last writer closed → end of data
//!                      └── reader closed/dropped → writers get BrokenPipe
//! ```
//!
//! The lock is a `std::sync::Mutex`: critical sections are queue operations
//! and waker bookkeeping, and Drop stays synchronous. Wakers are registered
//! under the lock so no wakeup is lost between a check and a park.

use std::collections::VecDeque;
use std::future::{Future, poll_fn};
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};

use futures::Stream;
use pipewright_types::BufferPolicy;
use tokio::io::{AsyncRead, AsyncWrite, BufReader, Lines, ReadBuf};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::error::StreamError;

/// Line mode hands over a partial line once this many bytes are held back
/// without a newline.
pub const MAX_PARTIAL_LINE: usize = 64 * 1024;

/// Line mode: `pending` holds something deliverable.
fn line_ready(pending: &[u8]) -> bool {
    pending.len() >= MAX_PARTIAL_LINE || pending.contains(&b'\n')
}

struct StreamState {
    policy: BufferPolicy,
    chunks: VecDeque<Vec<u8>>,
    /// Bytes of the front chunk already handed out through `AsyncRead`.
    offset: usize,
    /// Unread units (bytes, lines, or chunks depending on policy).
    fill: usize,
    /// Live producer ends.
    writers: usize,
    reader_closed: bool,
    reader_waker: Option<Waker>,
    writer_wakers: Vec<Waker>,
}

impl StreamState {
    fn room(&self) -> usize {
        self.policy.capacity().saturating_sub(self.fill)
    }

    fn push(&mut self, chunk: Vec<u8>, units: usize) {
        self.fill += units;
        self.chunks.push_back(chunk);
        if let Some(waker) = self.reader_waker.take() {
            waker.wake();
        }
    }

    /// Move complete lines out of `pending` while there is room. An
    /// overlong run without a newline goes out in `MAX_PARTIAL_LINE` pieces.
    fn push_lines(&mut self, pending: &mut Vec<u8>) {
        while self.room() > 0 {
            let end = match pending.iter().take(MAX_PARTIAL_LINE).position(|b| *b == b'\n') {
                Some(newline) => newline + 1,
                None if pending.len() >= MAX_PARTIAL_LINE => MAX_PARTIAL_LINE,
                None => break,
            };
            let line: Vec<u8> = pending.drain(..end).collect();
            self.push(line, 1);
        }
    }

    fn pop(&mut self) -> Option<Vec<u8>> {
        let mut chunk = self.chunks.pop_front()?;
        if self.offset > 0 {
            chunk.drain(..self.offset);
            self.offset = 0;
        }
        let units = match self.policy {
            BufferPolicy::Bytes { .. } => chunk.len(),
            _ => 1,
        };
        self.fill -= units;
        self.wake_writers();
        Some(chunk)
    }

    /// Copy as much of the front chunk as fits into `buf`.
    fn copy_into(&mut self, buf: &mut ReadBuf<'_>) -> bool {
        let Some(front) = self.chunks.front() else {
            return false;
        };
        let rest = &front[self.offset..];
        let n = rest.len().min(buf.remaining());
        buf.put_slice(&rest[..n]);
        self.offset += n;

        let exhausted = self.offset == front.len();
        if let BufferPolicy::Bytes { .. } = self.policy {
            self.fill -= n;
        } else if exhausted {
            self.fill -= 1;
        }
        if exhausted {
            self.chunks.pop_front();
            self.offset = 0;
        }
        self.wake_writers();
        true
    }

    fn park_writer(&mut self, waker: &Waker) {
        if !self.writer_wakers.iter().any(|w| w.will_wake(waker)) {
            self.writer_wakers.push(waker.clone());
        }
    }

    fn wake_writers(&mut self) {
        for waker in self.writer_wakers.drain(..) {
            waker.wake();
        }
    }

    fn release_writer(&mut self) {
        self.writers = self.writers.saturating_sub(1);
        if self.writers == 0
            && let Some(waker) = self.reader_waker.take()
        {
            waker.wake();
        }
    }

    fn close_reader(&mut self) {
        self.reader_closed = true;
        self.chunks.clear();
        self.offset = 0;
        self.fill = 0;
        self.wake_writers();
    }
}

struct Shared {
    state: Mutex<StreamState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Cancellation binding for one stream endpoint.
struct CancelBinding {
    token: CancellationToken,
    fired: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl CancelBinding {
    fn new(token: CancellationToken) -> Self {
        Self {
            fired: Box::pin(token.clone().cancelled_owned()),
            token,
        }
    }

    fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Register for wakeup on cancellation; true if already fired.
    fn poll_fired(&mut self, cx: &mut Context<'_>) -> bool {
        self.token.is_cancelled() || self.fired.as_mut().poll(cx).is_ready()
    }
}

fn is_cancelled(binding: &Option<CancelBinding>) -> bool {
    binding.as_ref().is_some_and(CancelBinding::is_cancelled)
}

fn poll_fired(binding: &mut Option<CancelBinding>, cx: &mut Context<'_>) -> bool {
    binding.as_mut().is_some_and(|b| b.poll_fired(cx))
}

/// Create a stream with the given buffering policy.
pub fn stream(policy: BufferPolicy) -> (StreamWriter, StreamReader) {
    let shared = Arc::new(Shared {
        state: Mutex::new(StreamState {
            policy,
            chunks: VecDeque::new(),
            offset: 0,
            fill: 0,
            writers: 1,
            reader_closed: false,
            reader_waker: None,
            writer_wakers: Vec::new(),
        }),
    });

    (
        StreamWriter {
            shared: shared.clone(),
            pending: Vec::new(),
            closed: false,
            cancel: None,
        },
        StreamReader {
            shared,
            closed: false,
            cancel: None,
        },
    )
}

/// A stream whose only producer is already closed: reads see end of data.
pub fn empty_stream(policy: BufferPolicy) -> StreamReader {
    let (_, reader) = stream(policy);
    reader
}

/// Producer end. Clone it to add producers.
pub struct StreamWriter {
    shared: Arc<Shared>,
    /// Line mode: bytes after the last complete line, plus any complete
    /// lines that did not fit yet.
    pending: Vec<u8>,
    closed: bool,
    cancel: Option<CancelBinding>,
}

impl StreamWriter {
    /// Bind this end to a cancellation token.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(CancelBinding::new(token));
        self
    }

    /// Write all of `data`, suspending while the stream is full.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), StreamError> {
        let mut written = 0;
        while written < data.len() {
            let rest = &data[written..];
            let n = poll_fn(|cx| self.poll_write_chunk(cx, rest)).await?;
            written += n;
        }
        poll_fn(|cx| self.poll_flush_lines(cx)).await
    }

    /// Write a string followed by a newline.
    pub async fn write_line(&mut self, line: &str) -> Result<(), StreamError> {
        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(b'\n');
        self.write(&data).await
    }

    /// Close this producer end. Idempotent.
    ///
    /// In line mode a trailing partial line is delivered as the final line.
    /// Once every producer has closed, the reader sees end of data.
    pub async fn close(&mut self) -> Result<(), StreamError> {
        poll_fn(|cx| self.poll_close(cx)).await
    }

    /// True if this end has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// True if the consumer end has gone away.
    pub fn is_broken(&self) -> bool {
        self.shared.lock().reader_closed
    }

    pub fn policy(&self) -> BufferPolicy {
        self.shared.lock().policy
    }

    pub fn capacity(&self) -> usize {
        self.shared.lock().policy.capacity()
    }

    /// Unread units currently buffered.
    pub fn fill(&self) -> usize {
        self.shared.lock().fill
    }

    fn suspend(&mut self, cx: &mut Context<'_>) -> Poll<Result<usize, StreamError>> {
        if poll_fired(&mut self.cancel, cx) {
            Poll::Ready(Err(StreamError::Cancelled))
        } else {
            Poll::Pending
        }
    }

    fn poll_write_chunk(
        &mut self,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, StreamError>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if self.closed {
            return Poll::Ready(Err(StreamError::Closed));
        }
        if is_cancelled(&self.cancel) {
            return Poll::Ready(Err(StreamError::Cancelled));
        }

        let mut state = self.shared.lock();
        if state.reader_closed {
            return Poll::Ready(Err(StreamError::BrokenPipe));
        }

        let accepted = match state.policy {
            BufferPolicy::Bytes { .. } => match state.room() {
                0 => None,
                room => {
                    let n = buf.len().min(room);
                    state.push(buf[..n].to_vec(), n);
                    Some(n)
                }
            },
            BufferPolicy::Unbuffered => {
                if state.room() > 0 {
                    state.push(buf.to_vec(), 1);
                    Some(buf.len())
                } else {
                    None
                }
            }
            BufferPolicy::Lines { .. } => {
                state.push_lines(&mut self.pending);
                if line_ready(&self.pending) {
                    None
                } else {
                    let n = buf.len().min(MAX_PARTIAL_LINE - self.pending.len());
                    self.pending.extend_from_slice(&buf[..n]);
                    state.push_lines(&mut self.pending);
                    Some(n)
                }
            }
        };

        match accepted {
            Some(n) => Poll::Ready(Ok(n)),
            None => {
                state.park_writer(cx.waker());
                drop(state);
                self.suspend(cx)
            }
        }
    }

    /// Line mode: wait until every complete line has been handed over.
    fn poll_flush_lines(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), StreamError>> {
        if !line_ready(&self.pending) {
            return Poll::Ready(Ok(()));
        }
        let mut state = self.shared.lock();
        if state.reader_closed {
            self.pending.clear();
            return Poll::Ready(Err(StreamError::BrokenPipe));
        }
        state.push_lines(&mut self.pending);
        if !line_ready(&self.pending) {
            return Poll::Ready(Ok(()));
        }
        state.park_writer(cx.waker());
        drop(state);
        self.suspend(cx).map_ok(|_| ())
    }

    fn poll_close(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), StreamError>> {
        if self.closed {
            return Poll::Ready(Ok(()));
        }

        let mut state = self.shared.lock();
        if state.reader_closed {
            self.pending.clear();
        }
        state.push_lines(&mut self.pending);
        if !self.pending.is_empty() && !line_ready(&self.pending) && state.room() > 0 {
            let tail = std::mem::take(&mut self.pending);
            state.push(tail, 1);
        }

        if self.pending.is_empty() {
            self.closed = true;
            state.release_writer();
            return Poll::Ready(Ok(()));
        }

        state.park_writer(cx.waker());
        drop(state);
        if poll_fired(&mut self.cancel, cx) {
            // Give up on the held-back lines; the consumer is being torn down.
            self.pending.clear();
            self.closed = true;
            self.shared.lock().release_writer();
            return Poll::Ready(Err(StreamError::Cancelled));
        }
        Poll::Pending
    }
}

impl Clone for StreamWriter {
    fn clone(&self) -> Self {
        let mut state = self.shared.lock();
        // Cloning after the stream ended must not revive it.
        let closed = state.writers == 0;
        if !closed {
            state.writers += 1;
        }
        Self {
            shared: self.shared.clone(),
            pending: Vec::new(),
            closed,
            cancel: self
                .cancel
                .as_ref()
                .map(|b| CancelBinding::new(b.token.clone())),
        }
    }
}

impl AsyncWrite for StreamWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.get_mut().poll_write_chunk(cx, buf).map_err(Into::into)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().poll_flush_lines(cx).map_err(Into::into)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().poll_close(cx).map_err(Into::into)
    }
}

impl Drop for StreamWriter {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let mut state = self.shared.lock();
        // Dropping without close delivers whatever is left, ignoring capacity.
        if !state.reader_closed && !self.pending.is_empty() {
            let tail = std::mem::take(&mut self.pending);
            state.push(tail, 1);
        }
        state.release_writer();
    }
}

/// Consumer end.
pub struct StreamReader {
    shared: Arc<Shared>,
    closed: bool,
    cancel: Option<CancelBinding>,
}

impl StreamReader {
    /// Bind this end to a cancellation token.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(CancelBinding::new(token));
        self
    }

    /// Next chunk (a whole line in line mode), or `None` at end of data.
    pub async fn read(&mut self) -> Result<Option<Vec<u8>>, StreamError> {
        poll_fn(|cx| self.poll_chunk(cx)).await
    }

    /// Read everything until end of data.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>, StreamError> {
        let mut out = Vec::new();
        while let Some(chunk) = self.read().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Stop consuming. Buffered data is dropped and producers see BrokenPipe.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.shared.lock().close_reader();
        }
    }

    /// Handle that closes this consumer end from elsewhere.
    pub fn closer(&self) -> StreamCloser {
        StreamCloser {
            shared: self.shared.clone(),
        }
    }

    /// Iterate complete lines.
    pub fn lines(self) -> Lines<BufReader<StreamReader>> {
        use tokio::io::AsyncBufReadExt;
        BufReader::new(self).lines()
    }

    /// View the stream as a `futures::Stream` of chunks.
    pub fn into_chunks(self) -> impl Stream<Item = Result<Vec<u8>, StreamError>> + Send {
        futures::stream::unfold(self, |mut reader| async move {
            match reader.read().await {
                Ok(Some(chunk)) => Some((Ok(chunk), reader)),
                Ok(None) => None,
                Err(e) => {
                    reader.close();
                    Some((Err(e), reader))
                }
            }
        })
    }

    pub fn policy(&self) -> BufferPolicy {
        self.shared.lock().policy
    }

    pub fn capacity(&self) -> usize {
        self.shared.lock().policy.capacity()
    }

    /// Unread units currently buffered.
    pub fn fill(&self) -> usize {
        self.shared.lock().fill
    }

    fn poll_chunk(&mut self, cx: &mut Context<'_>) -> Poll<Result<Option<Vec<u8>>, StreamError>> {
        if self.closed {
            return Poll::Ready(Ok(None));
        }
        if is_cancelled(&self.cancel) {
            return Poll::Ready(Err(StreamError::Cancelled));
        }

        let mut state = self.shared.lock();
        if let Some(chunk) = state.pop() {
            return Poll::Ready(Ok(Some(chunk)));
        }
        if state.writers == 0 || state.reader_closed {
            return Poll::Ready(Ok(None));
        }
        state.reader_waker = Some(cx.waker().clone());
        drop(state);

        if poll_fired(&mut self.cancel, cx) {
            Poll::Ready(Err(StreamError::Cancelled))
        } else {
            Poll::Pending
        }
    }
}

impl AsyncRead for StreamReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.closed || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        if is_cancelled(&this.cancel) {
            return Poll::Ready(Err(StreamError::Cancelled.into()));
        }

        let mut state = this.shared.lock();
        if state.copy_into(buf) || state.writers == 0 || state.reader_closed {
            return Poll::Ready(Ok(()));
        }
        state.reader_waker = Some(cx.waker().clone());
        drop(state);

        if poll_fired(&mut this.cancel, cx) {
            Poll::Ready(Err(StreamError::Cancelled.into()))
        } else {
            Poll::Pending
        }
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        self.close();
    }
}

/// Closes a stream's consumer end without owning the reader.
#[derive(Clone)]
pub struct StreamCloser {
    shared: Arc<Shared>,
}

impl StreamCloser {
    pub fn close(&self) {
        self.shared.lock().close_reader();
    }
}

impl std::fmt::Debug for StreamWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamWriter")
            .field("closed", &self.closed)
            .finish()
    }
}

impl std::fmt::Debug for StreamReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamReader")
            .field("closed", &self.closed)
            .finish()
    }
}

impl std::fmt::Debug for StreamCloser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamCloser").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use futures::StreamExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_basic_write_read() {
        let (mut writer, mut reader) = stream(BufferPolicy::bytes(1024));

        writer.write(b"hello").await.unwrap();
        writer.close().await.unwrap();

        assert_eq!(reader.read().await.unwrap(), Some(b"hello".to_vec()));
        assert_eq!(reader.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut writer, mut reader) = stream(BufferPolicy::bytes(16));
        writer.close().await.unwrap();
        writer.close().await.unwrap();
        assert!(writer.is_closed());
        assert_eq!(reader.read().await.unwrap(), None);
        assert_eq!(reader.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let (mut writer, _reader) = stream(BufferPolicy::bytes(16));
        writer.close().await.unwrap();
        assert_eq!(writer.write(b"x").await, Err(StreamError::Closed));
    }

    #[tokio::test]
    async fn test_large_data_through_small_buffer() {
        let (mut writer, mut reader) = stream(BufferPolicy::bytes(32));

        let data: Vec<u8> = (0..10_000).map(|i| (i % 256) as u8).collect();
        let expected = data.clone();

        let write_task = tokio::spawn(async move {
            writer.write(&data).await.unwrap();
        });

        let output = reader.read_to_end().await.unwrap();

        write_task.await.unwrap();
        assert_eq!(output, expected);
    }

    #[tokio::test]
    async fn test_byte_backpressure_never_exceeds_capacity() {
        let (mut writer, mut reader) = stream(BufferPolicy::bytes(8));

        let write_task = tokio::spawn(async move {
            writer.write(&[7u8; 64]).await.unwrap();
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(reader.fill(), 8);
        assert!(!write_task.is_finished(), "writer should be suspended");

        let mut total = 0;
        while let Some(chunk) = reader.read().await.unwrap() {
            assert!(reader.fill() <= 8);
            total += chunk.len();
        }
        assert_eq!(total, 64);
        write_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_line_mode_delivers_one_line_per_read() {
        let (mut writer, mut reader) = stream(BufferPolicy::lines(4));

        writer.write(b"a\nb").await.unwrap();
        writer.write(b"c\nd").await.unwrap();
        writer.close().await.unwrap();

        assert_eq!(reader.read().await.unwrap(), Some(b"a\n".to_vec()));
        assert_eq!(reader.read().await.unwrap(), Some(b"bc\n".to_vec()));
        assert_eq!(reader.read().await.unwrap(), Some(b"d".to_vec()));
        assert_eq!(reader.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_line_mode_holds_partial_line() {
        let (mut writer, reader) = stream(BufferPolicy::lines(4));
        writer.write(b"no newline yet").await.unwrap();
        assert_eq!(reader.fill(), 0);
        writer.write(b"\n").await.unwrap();
        assert_eq!(reader.fill(), 1);
    }

    #[tokio::test]
    async fn test_line_mode_bounds_a_line_without_newline() {
        let (mut writer, mut reader) = stream(BufferPolicy::lines(2));

        let write_task = tokio::spawn(async move {
            writer.write(&vec![b'x'; MAX_PARTIAL_LINE * 4]).await.unwrap();
            writer.close().await.unwrap();
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(reader.fill(), 2);
        assert!(!write_task.is_finished());

        let mut pieces = Vec::new();
        while let Some(piece) = reader.read().await.unwrap() {
            pieces.push(piece.len());
        }
        assert_eq!(pieces, vec![MAX_PARTIAL_LINE; 4]);
        write_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_line_backpressure_counts_lines() {
        let (mut writer, mut reader) = stream(BufferPolicy::lines(2));

        let write_task = tokio::spawn(async move {
            for i in 0..10 {
                writer.write_line(&format!("line {i}")).await.unwrap();
            }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(reader.fill(), 2);
        assert!(!write_task.is_finished());

        let mut lines = Vec::new();
        while let Some(line) = reader.read().await.unwrap() {
            assert!(reader.fill() <= 2);
            lines.push(String::from_utf8(line).unwrap());
        }
        assert_eq!(lines.len(), 10);
        assert_eq!(lines[9], "line 9\n");
        write_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_unbuffered_forwards_each_write() {
        let (mut writer, mut reader) = stream(BufferPolicy::Unbuffered);

        let write_task = tokio::spawn(async move {
            writer.write(b"one").await.unwrap();
            writer.write(b"two").await.unwrap();
        });

        assert_eq!(reader.read().await.unwrap(), Some(b"one".to_vec()));
        assert_eq!(reader.read().await.unwrap(), Some(b"two".to_vec()));
        assert_eq!(reader.read().await.unwrap(), None);
        write_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_broken_pipe_on_reader_drop() {
        let (mut writer, reader) = stream(BufferPolicy::bytes(1024));
        drop(reader);

        assert_eq!(writer.write(b"data").await, Err(StreamError::BrokenPipe));
        assert!(writer.is_broken());
    }

    #[tokio::test]
    async fn test_reader_drop_while_writer_blocked() {
        let (mut writer, reader) = stream(BufferPolicy::bytes(8));

        let write_task = tokio::spawn(async move { writer.write(&[0u8; 1024]).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(reader);

        let result = tokio::time::timeout(Duration::from_secs(2), write_task).await;
        let result = result.expect("writer hung after reader dropped").unwrap();
        assert_eq!(result, Err(StreamError::BrokenPipe));
    }

    #[tokio::test]
    async fn test_closer_breaks_pipe_for_producer() {
        let (mut writer, reader) = stream(BufferPolicy::bytes(8));
        let closer = reader.closer();

        let write_task = tokio::spawn(async move { writer.write(&[0u8; 64]).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        closer.close();

        let result = tokio::time::timeout(Duration::from_secs(2), write_task).await;
        assert_eq!(result.unwrap().unwrap(), Err(StreamError::BrokenPipe));
        drop(reader);
    }

    #[tokio::test]
    async fn test_end_of_data_waits_for_every_producer() {
        let (mut first, mut reader) = stream(BufferPolicy::bytes(64));
        let mut second = first.clone();

        first.write(b"a").await.unwrap();
        first.close().await.unwrap();
        second.write(b"b").await.unwrap();

        let read_task = tokio::spawn(async move { reader.read_to_end().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!read_task.is_finished(), "second producer still open");

        drop(second);
        let data = read_task.await.unwrap().unwrap();
        assert_eq!(data, b"ab");
    }

    #[tokio::test]
    async fn test_cancel_wakes_suspended_read() {
        let token = CancellationToken::new();
        let (_writer, reader) = stream(BufferPolicy::bytes(8));
        let mut reader = reader.with_cancel(token.clone());

        let read_task = tokio::spawn(async move { reader.read().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();

        let result = tokio::time::timeout(Duration::from_secs(2), read_task).await;
        assert_eq!(result.unwrap().unwrap(), Err(StreamError::Cancelled));
    }

    #[tokio::test]
    async fn test_cancel_wakes_suspended_write() {
        let token = CancellationToken::new();
        let (writer, _reader) = stream(BufferPolicy::bytes(4));
        let mut writer = writer.with_cancel(token.clone());

        let write_task = tokio::spawn(async move { writer.write(&[1u8; 32]).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();

        let result = tokio::time::timeout(Duration::from_secs(2), write_task).await;
        assert_eq!(result.unwrap().unwrap(), Err(StreamError::Cancelled));
    }

    #[tokio::test]
    async fn test_async_traits_work_with_tokio_io() {
        let (mut writer, mut reader) = stream(BufferPolicy::bytes(16));

        let write_task = tokio::spawn(async move {
            writer.write_all(b"async write through a small buffer").await.unwrap();
            writer.shutdown().await.unwrap();
        });

        let mut buf = Vec::new();
        AsyncReadExt::read_to_end(&mut reader, &mut buf).await.unwrap();
        write_task.await.unwrap();
        assert_eq!(buf, b"async write through a small buffer");
    }

    #[tokio::test]
    async fn test_lines_iterator() {
        let (mut writer, reader) = stream(BufferPolicy::lines(8));
        writer.write(b"x\ny\nz").await.unwrap();
        writer.close().await.unwrap();

        let mut lines = reader.lines();
        let mut seen = Vec::new();
        while let Some(line) = lines.next_line().await.unwrap() {
            seen.push(line);
        }
        assert_eq!(seen, vec!["x", "y", "z"]);
    }

    #[tokio::test]
    async fn test_into_chunks_stream() {
        let (mut writer, reader) = stream(BufferPolicy::lines(8));
        writer.write(b"1\n2\n").await.unwrap();
        drop(writer);

        let chunks: Vec<_> = reader.into_chunks().collect().await;
        let chunks: Vec<Vec<u8>> = chunks.into_iter().map(Result::unwrap).collect();
        assert_eq!(chunks, vec![b"1\n".to_vec(), b"2\n".to_vec()]);
    }

    #[tokio::test]
    async fn test_empty_stream_is_end_of_data() {
        let mut reader = empty_stream(BufferPolicy::default());
        assert_eq!(reader.read().await.unwrap(), None);
    }

    /// Small buffer plus many producers and odd write sizes.
    #[tokio::test]
    async fn test_concurrent_stress_no_hang() {
        let result = tokio::time::timeout(Duration::from_secs(5), async {
            let (writer, mut reader) = stream(BufferPolicy::bytes(64));

            let mut tasks = Vec::new();
            for _ in 0..4 {
                let mut writer = writer.clone();
                tasks.push(tokio::spawn(async move {
                    let chunk = vec![0xABu8; 37];
                    for _ in 0..500 {
                        writer.write(&chunk).await.unwrap();
                    }
                }));
            }
            drop(writer);

            let mut total = 0usize;
            while let Some(chunk) = reader.read().await.unwrap() {
                total += chunk.len();
            }
            for task in tasks {
                task.await.unwrap();
            }
            assert_eq!(total, 4 * 37 * 500);
        })
        .await;

        assert!(result.is_ok(), "stream stress test timed out");
    }
}
