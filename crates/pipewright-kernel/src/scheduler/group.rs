//! Parallel groups: bounded fan-out of whole pipelines.
//!
//! A group admits at most `limit` members at a time. `submit` waits for a
//! free slot before it returns, so a caller producing work faster than the
//! group completes it is slowed down instead of piling up tasks.
//!
//! ```text
//!   submit ──▶ [semaphore: limit] ──▶ member task ──▶ results queue ──▶ iterate
//!                                          │
//!                                          └──▶ MemberHandle::wait
//! ```
//!
//! Members keep running when a sibling fails unless the group is fail-fast,
//! in which case the first failure cancels every outstanding member.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use futures::Stream;
use pipewright_types::PipelineResult;
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use super::pipeline::Pipeline;
use super::stream::{StreamReader, StreamWriter, stream};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};

/// Order in which `iterate` yields member results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationOrder {
    #[default]
    Completion,
    Submission,
}

/// Group counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupStats {
    pub active: usize,
    /// Highest `active` ever observed.
    pub peak: usize,
    pub submitted: usize,
    pub completed: usize,
    pub failed: usize,
}

impl GroupStats {
    /// Every submitted member finished and none failed.
    pub fn ok(&self) -> bool {
        self.failed == 0 && self.completed == self.submitted
    }
}

/// One member's result.
#[derive(Debug, Clone)]
pub struct MemberOutcome {
    /// Submission index, starting at 0.
    pub index: usize,
    pub result: EngineResult<PipelineResult>,
}

impl MemberOutcome {
    pub fn ok(&self) -> bool {
        matches!(&self.result, Ok(result) if result.ok())
    }
}

/// Handle to a submitted member.
#[derive(Debug)]
pub struct MemberHandle {
    index: usize,
    cancel: CancellationToken,
    done: oneshot::Receiver<MemberOutcome>,
}

impl MemberHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Cancel this member only.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn wait(self) -> MemberOutcome {
        match self.done.await {
            Ok(outcome) => outcome,
            Err(_) => MemberOutcome {
                index: self.index,
                result: Err(EngineError::Cancelled),
            },
        }
    }
}

/// A bounded set of concurrently running pipelines.
#[derive(Debug)]
pub struct ParallelGroup {
    limit: usize,
    fail_fast: bool,
    order: IterationOrder,
    config: Arc<EngineConfig>,
    permits: Arc<Semaphore>,
    stats: Arc<Mutex<GroupStats>>,
    cancel: CancellationToken,
    results_tx: mpsc::UnboundedSender<MemberOutcome>,
    results_rx: mpsc::UnboundedReceiver<MemberOutcome>,
    received: usize,
    tasks: Vec<JoinHandle<()>>,
}

impl Default for ParallelGroup {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl ParallelGroup {
    /// Group admitting at most `limit` members at once (minimum 1).
    pub fn new(limit: usize) -> Self {
        let mut group = Self::default();
        group.limit = limit.max(1);
        group.permits = Arc::new(Semaphore::new(group.limit));
        group
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        let limit = config.group_limit();
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        Self {
            limit,
            fail_fast: config.fail_fast,
            order: IterationOrder::Completion,
            config: Arc::new(config.clone()),
            permits: Arc::new(Semaphore::new(limit)),
            stats: Arc::new(Mutex::new(GroupStats::default())),
            cancel: CancellationToken::new(),
            results_tx,
            results_rx,
            received: 0,
            tasks: Vec::new(),
        }
    }

    /// Cancel every outstanding member on the first failure.
    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn order(mut self, order: IterationOrder) -> Self {
        self.order = order;
        self
    }

    /// Cancelling `parent` cancels the whole group.
    pub fn cancel_on(mut self, parent: &CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn stats(&self) -> GroupStats {
        *lock(&self.stats)
    }

    /// Cancel every outstanding member.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the pipeline built by `factory` once a slot is free.
    ///
    /// Waits while `limit` members are active. The factory is called inside
    /// the member task, after admission.
    #[tracing::instrument(level = "debug", skip(self, factory), fields(limit = self.limit))]
    pub async fn submit<F>(&mut self, factory: F) -> MemberHandle
    where
        F: FnOnce() -> Pipeline + Send + 'static,
    {
        // The semaphore is never closed; without a permit the member runs
        // unbounded rather than not at all.
        let permit = self.permits.clone().acquire_owned().await.ok();

        let index = {
            let mut stats = lock(&self.stats);
            let index = stats.submitted;
            stats.submitted += 1;
            stats.active += 1;
            stats.peak = stats.peak.max(stats.active);
            index
        };
        tracing::debug!(index, "member admitted");

        let token = self.cancel.child_token();
        let (done_tx, done_rx) = oneshot::channel();
        let member = Member {
            index,
            token: token.clone(),
            group: self.cancel.clone(),
            fail_fast: self.fail_fast,
            config: self.config.clone(),
            stats: self.stats.clone(),
            results: self.results_tx.clone(),
        };

        self.tasks.push(tokio::spawn(async move {
            let _permit = permit;
            let outcome = member.run(factory).await;
            let _ = done_tx.send(outcome);
        }));

        MemberHandle {
            index,
            cancel: token,
            done: done_rx,
        }
    }

    /// One member per item.
    pub async fn fork<I, T, F>(&mut self, items: I, factory: F) -> Vec<MemberHandle>
    where
        I: IntoIterator<Item = T>,
        T: Send + 'static,
        F: Fn(T) -> Pipeline + Send + Sync + 'static,
    {
        let factory = Arc::new(factory);
        let mut handles = Vec::new();
        for item in items {
            let factory = factory.clone();
            handles.push(self.submit(move || factory(item)).await);
        }
        handles
    }

    /// Split `source` line by line, round-robin, across `workers` members.
    ///
    /// Each worker is fed through its own bounded stream, so a slow worker
    /// holds back the source. Workers beyond the group limit could never be
    /// admitted while the others wait for input, so `workers` is clamped to
    /// the limit.
    pub async fn demux<F>(&mut self, source: StreamReader, workers: usize, factory: F) -> Vec<MemberHandle>
    where
        F: Fn(usize) -> Pipeline + Send + Sync + 'static,
    {
        let workers = workers.clamp(1, self.limit);
        let policy = self.config.default_policy();

        let mut writers = Vec::with_capacity(workers);
        let mut readers = Vec::with_capacity(workers);
        for _ in 0..workers {
            let (writer, reader) = stream(policy);
            writers.push(writer);
            readers.push(reader);
        }
        self.tasks.push(tokio::spawn(distribute(source, writers)));

        let factory = Arc::new(factory);
        let mut handles = Vec::with_capacity(workers);
        for (worker, reader) in readers.into_iter().enumerate() {
            let factory = factory.clone();
            handles.push(self.submit(move || factory(worker).feed(reader)).await);
        }
        handles
    }

    /// The next finished member, in completion order. `None` once every
    /// submitted member has been returned.
    pub async fn next_completed(&mut self) -> Option<MemberOutcome> {
        if self.received >= self.stats().submitted {
            return None;
        }
        let outcome = self.results_rx.recv().await?;
        self.received += 1;
        Some(outcome)
    }

    /// Wait for every member; aggregate counters only.
    pub async fn wait_all(mut self) -> GroupStats {
        while self.next_completed().await.is_some() {}
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        let stats = self.stats();
        tracing::debug!(
            submitted = stats.submitted,
            failed = stats.failed,
            peak = stats.peak,
            "group drained"
        );
        stats
    }

    /// Lazy, single-pass sequence of member results in the group's order.
    pub fn iterate(self) -> impl Stream<Item = MemberOutcome> + Send {
        let order = self.order;
        futures::stream::unfold(
            (self, BTreeMap::new(), 0usize),
            move |(mut group, mut parked, mut next): (ParallelGroup, BTreeMap<usize, MemberOutcome>, usize)| async move {
                match order {
                    IterationOrder::Completion => {
                        let outcome = group.next_completed().await?;
                        Some((outcome, (group, parked, next)))
                    }
                    IterationOrder::Submission => loop {
                        if let Some(outcome) = parked.remove(&next) {
                            next += 1;
                            return Some((outcome, (group, parked, next)));
                        }
                        let outcome = group.next_completed().await?;
                        parked.insert(outcome.index, outcome);
                    },
                }
            },
        )
    }
}

fn lock(stats: &Mutex<GroupStats>) -> std::sync::MutexGuard<'_, GroupStats> {
    stats.lock().unwrap_or_else(|e| e.into_inner())
}

/// Everything a member task needs, moved into it.
struct Member {
    index: usize,
    token: CancellationToken,
    group: CancellationToken,
    fail_fast: bool,
    config: Arc<EngineConfig>,
    stats: Arc<Mutex<GroupStats>>,
    results: mpsc::UnboundedSender<MemberOutcome>,
}

impl Member {
    async fn run<F>(self, factory: F) -> MemberOutcome
    where
        F: FnOnce() -> Pipeline + Send + 'static,
    {
        let result = if self.token.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            let config = self.config.clone();
            let token = self.token.clone();
            // Own task, so a panicking factory still reaches the bookkeeping below.
            let task = tokio::spawn(async move {
                factory().with_config(config).cancel_on(token).run().await
            });
            match task.await {
                Ok(result) => result,
                Err(e) => {
                    let message = panic_message(e);
                    tracing::warn!(index = self.index, "member panicked: {}", message);
                    Err(EngineError::Panicked {
                        index: self.index,
                        message,
                    })
                }
            }
        };
        let outcome = MemberOutcome {
            index: self.index,
            result,
        };
        let failed = !outcome.ok();

        {
            let mut stats = lock(&self.stats);
            stats.active -= 1;
            stats.completed += 1;
            if failed {
                stats.failed += 1;
            }
        }

        if failed && self.fail_fast && !self.group.is_cancelled() {
            tracing::debug!(index = self.index, "member failed, cancelling the group");
            self.group.cancel();
        }

        let _ = self.results.send(outcome.clone());
        outcome
    }
}

fn panic_message(err: JoinError) -> String {
    match err.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string()),
        Err(err) => err.to_string(),
    }
}

/// Feed `source` lines to `writers` in turn. A worker that stops reading is
/// skipped from then on.
async fn distribute(source: StreamReader, mut writers: Vec<StreamWriter>) {
    let mut lines = source.lines();
    let mut next = 0;
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("demux source failed: {}", e);
                break;
            }
        };

        let mut delivered = false;
        while !writers.is_empty() {
            next %= writers.len();
            if writers[next].write_line(&line).await.is_ok() {
                next += 1;
                delivered = true;
                break;
            }
            tracing::debug!(worker = next, "demux worker stopped reading");
            writers.remove(next);
        }
        if !delivered {
            break;
        }
    }

    for writer in &mut writers {
        let _ = writer.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::FunctionNode;
    use crate::functions::builtin::{Emit, Exit, Sleep};
    use crate::node::{Node, Sink};
    use futures::StreamExt;
    use std::time::Duration;

    fn exit(status: i32) -> Pipeline {
        Pipeline::from(Node::function(FunctionNode::new(Exit)).arg(status.to_string()))
    }

    #[tokio::test]
    async fn wait_all_aggregates() {
        let mut group = ParallelGroup::new(2);
        for status in [0, 0, 3] {
            group.submit(move || exit(status)).await;
        }
        let stats = group.wait_all().await;
        assert_eq!(stats.submitted, 3);
        assert_eq!(stats.completed, 3);
        assert_eq!(stats.failed, 1);
        assert!(!stats.ok());
    }

    #[tokio::test]
    async fn submission_order_iteration() {
        let mut group = ParallelGroup::new(4).order(IterationOrder::Submission);
        for (i, delay) in ["0.15", "0.05", "0.1", "0"].into_iter().enumerate() {
            group
                .submit(move || {
                    let sleep = Node::function(FunctionNode::new(Sleep)).arg(delay);
                    let emit = Node::function(FunctionNode::new(Emit)).arg(i.to_string());
                    Pipeline::from(sleep).pipe(emit).stdout(Sink::Null)
                })
                .await;
        }
        let order: Vec<usize> = group.iterate().map(|o| o.index).collect().await;
        assert_eq!(order, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn fail_fast_cancels_siblings() {
        let mut group = ParallelGroup::new(3).fail_fast(true);
        let slow = group
            .submit(|| Pipeline::from(Node::function(FunctionNode::new(Sleep)).arg("30")))
            .await;
        group.submit(|| exit(1)).await;

        let outcome = tokio::time::timeout(Duration::from_secs(5), slow.wait())
            .await
            .expect("sibling should be cancelled");
        let result = outcome.result.unwrap();
        assert!(result.cancelled);
    }

    #[tokio::test]
    async fn member_handle_reports_its_own_result() {
        let mut group = ParallelGroup::new(1);
        let handle = group.submit(|| exit(5)).await;
        let outcome = handle.wait().await;
        assert_eq!(outcome.index, 0);
        assert_eq!(outcome.result.unwrap().status, 5);
    }

    #[tokio::test]
    async fn panicking_factory_is_a_failed_member() {
        let mut group = ParallelGroup::new(2);
        let broken = group.submit(|| -> Pipeline { panic!("no pipeline today") }).await;
        group.submit(|| exit(0)).await;

        let outcome = broken.wait().await;
        assert!(matches!(
            outcome.result,
            Err(EngineError::Panicked { index: 0, ref message }) if message.contains("no pipeline today")
        ));

        let stats = tokio::time::timeout(Duration::from_secs(5), group.wait_all())
            .await
            .expect("a panicking member must not hang the group");
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.active, 0);
    }
}
