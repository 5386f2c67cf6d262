//! PipelineResult — the structured outcome of one pipeline run.
//!
//! Every node reports its raw exit status. The pipeline's `status` is the
//! last node's raw status; whether the run *succeeded* is decided separately
//! by the nodes' suppression policies, so a caller can tell apart "the last
//! command succeeded but an earlier one failed" from a plain failure.

use serde::{Deserialize, Serialize};

/// Exit status reported for a node terminated by `SIGPIPE` (128 + 13).
pub const BROKEN_PIPE_STATUS: i32 = 141;

/// Per-node outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeReport {
    /// Display identity (`grep -v foo`, `@upper`).
    pub identity: String,
    /// Raw exit status. Signal deaths are reported as 128 + signal.
    pub status: i32,
    /// Terminating signal, for processes killed by a signal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    /// A non-zero status that the node's policy declared non-fatal.
    #[serde(default)]
    pub suppressed: bool,
    /// The node stopped because its consumer went away. Never fatal.
    #[serde(default)]
    pub broken_pipe: bool,
    /// The node was terminated by the engine (cancellation or teardown).
    #[serde(default)]
    pub killed: bool,
    /// Tail of the node's stderr, when it was captured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

impl NodeReport {
    /// Create a report for a node that exited with `status`.
    pub fn new(identity: impl Into<String>, status: i32) -> Self {
        Self {
            identity: identity.into(),
            status,
            signal: None,
            suppressed: false,
            broken_pipe: false,
            killed: false,
            stderr: None,
        }
    }

    /// True if this node fails the pipeline.
    pub fn failed(&self) -> bool {
        self.status != 0 && !self.suppressed && !self.broken_pipe
    }
}

/// The unsuppressed failure that surfaces for a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFailure {
    /// Position of the node in the pipeline (0 = head).
    pub index: usize,
    /// Display identity of the node.
    pub identity: String,
    /// Raw exit status of the node.
    pub status: i32,
}

/// The result of running a pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineResult {
    /// Raw status of the last node (0 for an empty pipeline).
    pub status: i32,
    /// Reports in pipeline order.
    pub nodes: Vec<NodeReport>,
    /// Surfacing unsuppressed failure, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<NodeFailure>,
    /// The run was torn down by cancellation.
    #[serde(default)]
    pub cancelled: bool,
}

impl PipelineResult {
    /// Aggregate node reports into a pipeline result.
    ///
    /// The surfacing failure is the last node when it failed, otherwise the
    /// first failing node in pipeline order.
    pub fn from_reports(nodes: Vec<NodeReport>, cancelled: bool) -> Self {
        let status = nodes.last().map(|n| n.status).unwrap_or(0);

        let failing = match nodes.last() {
            Some(last) if last.failed() => Some(nodes.len() - 1),
            _ => nodes.iter().position(NodeReport::failed),
        };

        let failure = failing.map(|index| NodeFailure {
            index,
            identity: nodes[index].identity.clone(),
            status: nodes[index].status,
        });

        Self {
            status,
            nodes,
            failure,
            cancelled,
        }
    }

    /// True if no node failed and the run was not cancelled.
    pub fn ok(&self) -> bool {
        self.failure.is_none() && !self.cancelled
    }

    /// True if the last node succeeded (or was suppressed) but an earlier
    /// node failed.
    pub fn failed_upstream(&self) -> bool {
        match &self.failure {
            Some(failure) => failure.index + 1 < self.nodes.len(),
            None => false,
        }
    }

    /// Exit code for a host process whose script ended with this pipeline.
    pub fn exit_code(&self) -> i32 {
        if self.ok() { 0 } else { 1 }
    }

    /// The last node's report.
    pub fn last(&self) -> Option<&NodeReport> {
        self.nodes.last()
    }

    /// Nodes whose non-zero status was suppressed.
    pub fn suppressed(&self) -> impl Iterator<Item = &NodeReport> {
        self.nodes.iter().filter(|n| n.suppressed)
    }
}
