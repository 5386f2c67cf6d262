//! Pipeline graph and executor.
//!
//! A `Pipeline` is a chain of nodes plus the redirections at its ends. Running
//! it creates one bounded stream per edge, launches every node from source to
//! sink, then supervises them until all have exited:
//!
//! ```text
//!   BUILT ──▶ LAUNCHING ──▶ RUNNING ──▶ DRAINING ──▶ DONE
//!                │                          │
//!                └──── launch error ────────┴──▶ FAILED
//!                      (launched nodes killed     (failure or
//!                       in reverse order)          cancellation)
//! ```
//!
//! An unsuppressed failure does not stop the other nodes; they drain
//! naturally. Only cancellation tears a running pipeline down.

use std::ops::BitOr;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use pipewright_types::{BufferPolicy, NodeReport, PipelineResult};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::cancel::teardown;
use super::pump::{BoxWriter, spawn_copy, spawn_feed};
use super::stderr_sample::{SharedSample, shared_sample};
use super::stream::{StreamCloser, StreamReader, StreamWriter, stream};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult, GraphError, LaunchError};
use crate::node::{Bindings, Handle, Inlet, Launched, Node, NodeExit, Outlet, Sink, Source, StderrBinding};

/// Lifecycle of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Built,
    Launching,
    Running,
    Draining,
    Done,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Failed)
    }
}

fn transition(state: &watch::Sender<PipelineState>, next: PipelineState) {
    let previous = state.send_replace(next);
    tracing::debug!(from = ?previous, to = ?next, "pipeline state");
}

/// A chain of nodes with its redirections.
#[derive(Debug)]
pub struct Pipeline {
    nodes: Vec<Node>,
    stdin: Option<Source>,
    feed: Option<StreamReader>,
    stdout: Option<Sink>,
    stderr: Sink,
    config: Arc<EngineConfig>,
    parent: Option<CancellationToken>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            stdin: None,
            feed: None,
            stdout: None,
            stderr: Sink::Inherit,
            config: Arc::new(EngineConfig::default()),
            parent: None,
        }
    }

    pub fn from_nodes(nodes: impl IntoIterator<Item = Node>) -> Self {
        let mut pipeline = Self::new();
        pipeline.nodes.extend(nodes);
        pipeline
    }

    /// Append a stage (`|`).
    pub fn pipe(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    /// Head stdin source. Defaults to `Source::Null`.
    pub fn stdin(mut self, source: Source) -> Self {
        self.stdin = Some(source);
        self
    }

    /// Feed the head from another stream.
    pub fn feed(mut self, reader: StreamReader) -> Self {
        self.feed = Some(reader);
        self
    }

    /// Tail stdout sink. Defaults to `Sink::Inherit`.
    pub fn stdout(mut self, sink: Sink) -> Self {
        self.stdout = Some(sink);
        self
    }

    /// Sink for every node's stderr that isn't bound elsewhere.
    pub fn stderr(mut self, sink: Sink) -> Self {
        self.stderr = sink;
        self
    }

    pub fn config(self, config: EngineConfig) -> Self {
        self.with_config(Arc::new(config))
    }

    pub fn with_config(mut self, config: Arc<EngineConfig>) -> Self {
        self.config = config;
        self
    }

    /// Cancelling `token` cancels this pipeline.
    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.parent = Some(token);
        self
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Check that the graph is a well-formed chain.
    pub fn validate(&self) -> Result<(), GraphError> {
        let last = match self.nodes.len() {
            0 => return Err(GraphError::Empty),
            n => n - 1,
        };

        for (index, node) in self.nodes.iter().enumerate() {
            if index > 0 && node.declared_stdin().is_some() {
                return Err(GraphError::ConflictingStdin {
                    index,
                    identity: node.display_name(),
                });
            }
            let pipes_stderr = node.stderr_binding() == StderrBinding::Pipe;
            if pipes_stderr && index == last {
                return Err(GraphError::DanglingStderrPipe {
                    index,
                    identity: node.display_name(),
                });
            }
            // A stderr pipe frees stdout for the node's own redirect.
            let side_stdout = pipes_stderr && node.declared_stdout() != Some(&Sink::Capture);
            if index < last && node.declared_stdout().is_some() && !side_stdout {
                return Err(GraphError::ConflictingStdout {
                    index,
                    identity: node.display_name(),
                });
            }
        }

        let sources = [
            self.stdin.is_some(),
            self.feed.is_some(),
            self.nodes[0].declared_stdin().is_some(),
        ];
        if sources.iter().filter(|bound| **bound).count() > 1 {
            return Err(GraphError::DuplicateSource);
        }
        if self.stdout.is_some() && self.nodes[last].declared_stdout().is_some() {
            return Err(GraphError::DuplicateSink);
        }
        Ok(())
    }

    /// Route the tail's stdout into a capture stream.
    fn capturing(mut self) -> Result<Self, GraphError> {
        let declared = self.nodes.last().and_then(Node::declared_stdout);
        match (&self.stdout, declared) {
            (None, Some(Sink::Capture)) => {}
            (None | Some(Sink::Capture), None) => self.stdout = Some(Sink::Capture),
            _ => return Err(GraphError::DuplicateSink),
        }
        Ok(self)
    }

    /// Launch every node and return the running pipeline.
    #[tracing::instrument(level = "debug", skip(self), fields(nodes = self.nodes.len()))]
    pub async fn spawn(self) -> EngineResult<RunningPipeline> {
        self.validate()?;

        let (state_tx, state_rx) = watch::channel(PipelineState::Built);
        transition(&state_tx, PipelineState::Launching);

        let cancel = match &self.parent {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        let config = self.config.clone();
        let grace = config.kill_grace();

        match launch_all(self, &cancel, &config).await {
            Ok(launch) => {
                transition(&state_tx, PipelineState::Running);
                let LaunchSet {
                    stages,
                    feeders,
                    drains,
                    stdout,
                    stderr,
                } = launch;
                let supervisor = tokio::spawn(supervise(
                    stages,
                    feeders,
                    drains,
                    cancel.clone(),
                    state_tx,
                    grace,
                ));
                Ok(RunningPipeline {
                    state: state_rx,
                    stdout,
                    stderr,
                    cancel,
                    supervisor,
                })
            }
            Err(err) => {
                tracing::warn!("launch failed: {}", err);
                transition(&state_tx, PipelineState::Failed);
                Err(err.into())
            }
        }
    }

    /// Run to completion. Exit failures are reported in the result, not as
    /// errors; launch and graph errors are errors.
    pub async fn run(self) -> EngineResult<PipelineResult> {
        Ok(self.spawn().await?.wait().await)
    }

    /// Last node's raw status.
    pub async fn status(self) -> EngineResult<i32> {
        Ok(self.run().await?.status)
    }

    /// True if no unsuppressed failure occurred.
    pub async fn ok(self) -> EngineResult<bool> {
        Ok(self.run().await?.ok())
    }

    /// Captured stdout. Fails with the stored error if the run failed.
    pub async fn bytes(self) -> EngineResult<Vec<u8>> {
        let running = self.capturing()?.spawn().await?;
        let (result, out) = running.wait_with_output().await;
        check(&result)?;
        Ok(out)
    }

    /// Captured stdout as text (lossy UTF-8).
    pub async fn text(self) -> EngineResult<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Captured stdout split into lines.
    pub async fn lines(self) -> EngineResult<Vec<String>> {
        Ok(self.text().await?.lines().map(str::to_string).collect())
    }

    /// Spawn with captured stdout and hand back a line iterator over it.
    pub async fn stream_lines(
        self,
    ) -> EngineResult<(tokio::io::Lines<tokio::io::BufReader<StreamReader>>, RunningPipeline)> {
        let mut running = self.capturing()?.spawn().await?;
        let stdout = running
            .take_stdout()
            .ok_or(EngineError::Graph(GraphError::DuplicateSink))?;
        Ok((stdout.lines(), running))
    }
}

/// The stored error of a finished run, if any.
pub fn check(result: &PipelineResult) -> EngineResult<()> {
    if result.cancelled {
        return Err(EngineError::Cancelled);
    }
    match &result.failure {
        Some(failure) => Err(EngineError::ExitStatus {
            identity: failure.identity.clone(),
            status: failure.status,
        }),
        None => Ok(()),
    }
}

impl BitOr<Node> for Node {
    type Output = Pipeline;

    fn bitor(self, rhs: Node) -> Pipeline {
        Pipeline::from_nodes([self, rhs])
    }
}

impl BitOr<Node> for Pipeline {
    type Output = Pipeline;

    fn bitor(self, rhs: Node) -> Pipeline {
        self.pipe(rhs)
    }
}

impl From<Node> for Pipeline {
    fn from(node: Node) -> Self {
        Pipeline::from_nodes([node])
    }
}

// ============================================================================
// Launch
// ============================================================================

/// One launched node with what the supervisor needs to manage it.
pub(crate) struct Stage {
    pub(crate) node: Node,
    pub(crate) launched: Launched,
    /// Closes the edge feeding this node.
    pub(crate) input: Option<StreamCloser>,
    pub(crate) sample: Option<SharedSample>,
}

impl Stage {
    pub(crate) fn handle(&self) -> &Handle {
        &self.launched.handle
    }

    /// Close the consumer end of the edge feeding this node, so the
    /// upstream producer sees a broken pipe.
    pub(crate) fn close_input(&self) {
        if let Some(closer) = &self.input {
            closer.close();
        }
        for pump in &self.launched.inbound {
            pump.abort();
        }
    }
}

struct LaunchSet {
    stages: Vec<Stage>,
    /// Graph-level pumps feeding the head.
    feeders: Vec<JoinHandle<()>>,
    /// Graph-level pumps draining into the final sinks.
    drains: Vec<JoinHandle<()>>,
    stdout: Option<StreamReader>,
    stderr: Option<StreamReader>,
}

fn sink_writer(sink: Sink, host: Outlet) -> Result<BoxWriter, LaunchError> {
    use std::fs::OpenOptions;

    Ok(match sink {
        Sink::Inherit => match host {
            Outlet::HostStderr => Box::new(tokio::io::stderr()),
            _ => Box::new(tokio::io::stdout()),
        },
        Sink::Null | Sink::Capture => Box::new(tokio::io::sink()),
        Sink::File { path, append } => {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .append(append)
                .truncate(!append)
                .open(&path)
                .map_err(|e| LaunchError::Redirect {
                    path: path.display().to_string(),
                    message: e.to_string(),
                })?;
            Box::new(tokio::fs::File::from_std(file))
        }
    })
}

fn merge_outlet(stdout: &Outlet) -> Outlet {
    match stdout {
        Outlet::Stream(writer) => Outlet::Stream(writer.clone()),
        Outlet::HostStdout => Outlet::HostStdout,
        Outlet::HostStderr => Outlet::HostStderr,
        Outlet::Null => Outlet::Null,
        Outlet::File { path, .. } => Outlet::File {
            path: path.clone(),
            append: true,
        },
    }
}

/// Stdout of a node whose stderr feeds the next node.
fn side_outlet(declared: Option<&Sink>) -> Outlet {
    match declared {
        Some(Sink::Inherit) => Outlet::HostStdout,
        Some(Sink::File { path, append }) => Outlet::File {
            path: path.clone(),
            append: *append,
        },
        None | Some(Sink::Null | Sink::Capture) => Outlet::Null,
    }
}

async fn launch_all(
    pipeline: Pipeline,
    cancel: &CancellationToken,
    config: &EngineConfig,
) -> Result<LaunchSet, LaunchError> {
    let Pipeline {
        nodes,
        stdin,
        feed,
        stdout,
        stderr,
        ..
    } = pipeline;
    let default_policy = config.default_policy();
    let grace = config.kill_grace();
    let count = nodes.len();
    let last = count - 1;

    let mut feeders = Vec::new();
    let mut drains = Vec::new();

    // Stderr hub: every node bound to the pipeline's stderr writes a clone.
    let (hub, hub_reader) = stream(default_policy);
    let stderr_capture = match stderr {
        Sink::Capture => Some(hub_reader),
        sink => {
            let writer = sink_writer(sink, Outlet::HostStderr)?;
            drains.push(spawn_copy("pipeline".into(), "stderr", hub_reader, writer));
            None
        }
    };

    // Head.
    let head_source = stdin.or_else(|| nodes[0].declared_stdin().cloned());
    let mut head = Some(match (feed, head_source) {
        (Some(reader), _) => Inlet::Stream(reader),
        (None, None | Some(Source::Null)) => Inlet::Null,
        (None, Some(Source::Inherit)) => Inlet::Inherit,
        (None, Some(Source::File(path))) => Inlet::File(path),
        (None, Some(Source::Bytes(data))) => {
            let (writer, reader) = stream(default_policy);
            feeders.push(spawn_feed(nodes[0].display_name(), data, writer));
            Inlet::Stream(reader)
        }
    });

    // Tail.
    let tail_sink = stdout.or_else(|| nodes[last].declared_stdout().cloned());
    let tail_policy = nodes[last].buffer_policy().unwrap_or(default_policy);
    let mut stdout_capture = None;
    let mut tail = Some(match tail_sink {
        None | Some(Sink::Inherit) => Outlet::HostStdout,
        Some(Sink::Null) => Outlet::Null,
        Some(Sink::File { path, append }) => Outlet::File { path, append },
        Some(Sink::Capture) => {
            let (writer, reader) = stream(tail_policy);
            stdout_capture = Some(reader);
            Outlet::Stream(writer)
        }
    });

    // Edges: edge i joins node i to node i + 1.
    let mut writers: Vec<Option<StreamWriter>> = Vec::with_capacity(count);
    let mut readers: Vec<Option<StreamReader>> = Vec::with_capacity(count);
    readers.push(None);
    for node in &nodes[..last] {
        let policy: BufferPolicy = node.buffer_policy().unwrap_or(default_policy);
        let (writer, reader) = stream(policy);
        writers.push(Some(writer));
        readers.push(Some(reader));
    }
    writers.push(None);

    let mut stages: Vec<Stage> = Vec::with_capacity(count);
    for (index, node) in nodes.into_iter().enumerate() {
        let stdin = match readers[index].take() {
            Some(reader) => Inlet::Stream(reader),
            None => head.take().unwrap_or(Inlet::Null),
        };
        let input = match &stdin {
            Inlet::Stream(reader) => Some(reader.closer()),
            _ => None,
        };
        let binding = node.stderr_binding();
        let edge = writers[index].take().map(Outlet::Stream);
        let (stdout, piped_stderr) = if binding == StderrBinding::Pipe {
            (side_outlet(node.declared_stdout()), edge)
        } else {
            let stdout = match edge {
                Some(outlet) => outlet,
                None => tail.take().unwrap_or(Outlet::Null),
            };
            (stdout, None)
        };

        let (stderr, sample) = match binding {
            StderrBinding::Pipeline => (
                Outlet::Stream(hub.clone()),
                Some(shared_sample(config.stderr_sample_bytes)),
            ),
            StderrBinding::Inherit => (Outlet::HostStderr, None),
            StderrBinding::Discard => (Outlet::Null, None),
            StderrBinding::File { path, append } => (Outlet::File { path, append }, None),
            StderrBinding::Stdout => (merge_outlet(&stdout), None),
            StderrBinding::Pipe => (piped_stderr.unwrap_or(Outlet::Null), None),
        };

        let bindings = Bindings {
            stdin,
            stdout,
            stderr,
            sample: sample.clone(),
            cancel: cancel.clone(),
            policy: node.buffer_policy().unwrap_or(default_policy),
        };

        match node.launch(bindings) {
            Ok(launched) => stages.push(Stage {
                node,
                launched,
                input,
                sample,
            }),
            Err(err) => {
                tracing::debug!(index, launched = stages.len(), "tearing down after launch error");
                // Unlaunched edges close as they drop; launched nodes are
                // killed from the sink side back to the source.
                drop(readers);
                drop(writers);
                teardown(&stages, grace).await;
                for stage in &stages {
                    for pump in &stage.launched.outbound {
                        pump.abort();
                    }
                }
                for pump in feeders.iter().chain(drains.iter()) {
                    pump.abort();
                }
                return Err(err);
            }
        }
    }

    Ok(LaunchSet {
        stages,
        feeders,
        drains,
        stdout: stdout_capture,
        stderr: stderr_capture,
    })
}

// ============================================================================
// Supervision
// ============================================================================

fn report(stage: &Stage, exit: NodeExit) -> NodeReport {
    let mut report = NodeReport::new(stage.node.display_name(), exit.status);
    report.signal = exit.signal;
    report.broken_pipe = exit.broken_pipe;
    report.killed = stage.handle().was_killed();
    report.suppressed = !exit.broken_pipe && stage.node.suppression().suppresses(exit.status);
    report.stderr = stage
        .sample
        .as_ref()
        .and_then(|s| s.lock().unwrap_or_else(|e| e.into_inner()).text());
    report
}

#[tracing::instrument(level = "debug", skip_all, fields(nodes = stages.len()))]
async fn supervise(
    mut stages: Vec<Stage>,
    feeders: Vec<JoinHandle<()>>,
    drains: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
    state: watch::Sender<PipelineState>,
    grace: Duration,
) -> PipelineResult {
    transition(&state, PipelineState::Draining);

    let mut exits: Vec<Option<NodeExit>> = vec![None; stages.len()];
    let mut cancelled = false;
    {
        let mut pending: FuturesUnordered<_> = stages
            .iter()
            .enumerate()
            .map(|(index, stage)| async move { (index, stage.handle().wait().await) })
            .collect();

        loop {
            tokio::select! {
                next = pending.next() => {
                    let Some((index, exit)) = next else { break };
                    let stage = &stages[index];
                    // Like an OS pipe: once a consumer is gone, its producer
                    // gets a broken pipe on the next write.
                    stage.close_input();
                    if !exit.broken_pipe && stage.node.suppression().is_fatal(exit.status) {
                        tracing::debug!(
                            index,
                            node = %stage.node.display_name(),
                            status = exit.status,
                            "unsuppressed failure, letting the pipeline drain"
                        );
                    }
                    exits[index] = Some(exit);
                }
                _ = cancel.cancelled(), if !cancelled => {
                    cancelled = true;
                    tracing::debug!("cancellation requested, tearing down");
                    teardown(&stages, grace).await;
                }
            }
        }
    }

    for pump in &feeders {
        pump.abort();
    }
    for stage in &mut stages {
        for pump in stage.launched.outbound.drain(..) {
            if cancelled {
                pump.abort();
            }
            let _ = pump.await;
        }
    }
    for pump in drains {
        if cancelled {
            pump.abort();
        }
        let _ = pump.await;
    }

    let reports = stages
        .iter()
        .zip(exits)
        .map(|(stage, exit)| report(stage, exit.unwrap_or(NodeExit::code(1))))
        .collect();
    let result = PipelineResult::from_reports(reports, cancelled);

    if let Some(failure) = &result.failure {
        tracing::debug!(
            index = failure.index,
            node = %failure.identity,
            status = failure.status,
            "pipeline failed"
        );
    }
    transition(
        &state,
        if result.ok() {
            PipelineState::Done
        } else {
            PipelineState::Failed
        },
    );
    result
}

// ============================================================================
// Running pipeline
// ============================================================================

/// A launched pipeline.
#[derive(Debug)]
pub struct RunningPipeline {
    state: watch::Receiver<PipelineState>,
    stdout: Option<StreamReader>,
    stderr: Option<StreamReader>,
    cancel: CancellationToken,
    supervisor: JoinHandle<PipelineResult>,
}

/// Read a stream to its end, keeping whatever arrived before an error.
async fn collect(mut reader: StreamReader) -> Vec<u8> {
    let mut out = Vec::new();
    while let Ok(Some(chunk)) = reader.read().await {
        out.extend_from_slice(&chunk);
    }
    out
}

fn discard(reader: Option<StreamReader>) -> Option<JoinHandle<()>> {
    reader.map(|reader| {
        tokio::spawn(async move {
            let _ = collect(reader).await;
        })
    })
}

impl RunningPipeline {
    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.state.clone()
    }

    /// Captured stdout, if the tail was bound to `Sink::Capture`.
    pub fn take_stdout(&mut self) -> Option<StreamReader> {
        self.stdout.take()
    }

    /// Captured stderr, if the pipeline's stderr was bound to `Sink::Capture`.
    pub fn take_stderr(&mut self) -> Option<StreamReader> {
        self.stderr.take()
    }

    /// Request teardown.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    async fn join(supervisor: JoinHandle<PipelineResult>) -> PipelineResult {
        match supervisor.await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!("pipeline supervisor failed: {}", e);
                PipelineResult::from_reports(vec![NodeReport::new("pipeline", 1)], false)
            }
        }
    }

    /// Wait for every node. Captured output nobody took is discarded.
    pub async fn wait(mut self) -> PipelineResult {
        let stdout = discard(self.stdout.take());
        let stderr = discard(self.stderr.take());
        let result = Self::join(self.supervisor).await;
        for drain in [stdout, stderr].into_iter().flatten() {
            let _ = drain.await;
        }
        result
    }

    /// Wait for every node while collecting captured stdout.
    pub async fn wait_with_output(mut self) -> (PipelineResult, Vec<u8>) {
        let stdout = self.stdout.take();
        let stderr = discard(self.stderr.take());
        let read = async move {
            match stdout {
                Some(reader) => collect(reader).await,
                None => Vec::new(),
            }
        };
        let (out, result) = tokio::join!(read, Self::join(self.supervisor));
        if let Some(drain) = stderr {
            let _ = drain.await;
        }
        (result, out)
    }
}
