//! In-process functions that run as pipeline nodes.
//!
//! A function node is a tokio task instead of an OS process. It receives its
//! stream endpoints through `NodeIo`, reads and writes them like any other
//! stage, and returns an exit status. Backpressure comes from the streams
//! themselves: a write suspends the task while the downstream edge is full.

pub mod builtin;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::scheduler::{StreamReader, StreamWriter};

/// Everything a running function gets to work with.
pub struct NodeIo {
    /// Literal arguments, already formatted.
    pub args: Vec<String>,
    /// Effective environment (host environment plus the node's overrides).
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub stdin: StreamReader,
    pub stdout: StreamWriter,
    pub stderr: StreamWriter,
    /// Fires when the pipeline is being torn down. Stream operations already
    /// observe it; long waits outside streams should select on it.
    pub cancel: CancellationToken,
}

/// An in-process pipeline stage.
#[async_trait]
pub trait NodeFunction: Send + Sync {
    /// Name used in reports and diagnostics.
    fn name(&self) -> &str;

    /// Validate arguments before any data flows. An error here is a launch
    /// error for the whole pipeline.
    fn setup(&self, _args: &[String]) -> Result<(), String> {
        Ok(())
    }

    /// Run to completion and return the exit status.
    ///
    /// An `Err` becomes status 1 with the message written to stderr, unless
    /// it is a broken pipe or a cancellation.
    async fn run(&self, io: NodeIo) -> anyhow::Result<i32>;
}

/// Shared reference to a function, used as a node identity.
#[derive(Clone)]
pub struct FunctionNode {
    func: Arc<dyn NodeFunction>,
}

impl FunctionNode {
    pub fn new(func: impl NodeFunction + 'static) -> Self {
        Self {
            func: Arc::new(func),
        }
    }

    pub fn from_arc(func: Arc<dyn NodeFunction>) -> Self {
        Self { func }
    }

    /// Wrap an async closure as a function node.
    pub fn from_fn<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(NodeIo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<i32>> + Send + 'static,
    {
        Self::new(FnFunction {
            name: name.into(),
            f,
        })
    }

    pub fn name(&self) -> &str {
        self.func.name()
    }

    pub fn function(&self) -> &Arc<dyn NodeFunction> {
        &self.func
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.func, &other.func)
    }
}

impl fmt::Debug for FunctionNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FunctionNode").field(&self.name()).finish()
    }
}

struct FnFunction<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F, Fut> NodeFunction for FnFunction<F>
where
    F: Fn(NodeIo) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<i32>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, io: NodeIo) -> anyhow::Result<i32> {
        (self.f)(io).await
    }
}

/// Functions addressable by name.
#[derive(Default, Clone)]
pub struct FunctionRegistry {
    functions: HashMap<String, FunctionNode>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the builtin functions.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtin::register_builtins(&mut registry);
        registry
    }

    pub fn register(&mut self, func: impl NodeFunction + 'static) {
        let node = FunctionNode::new(func);
        self.functions.insert(node.name().to_string(), node);
    }

    pub fn insert(&mut self, node: FunctionNode) {
        self.functions.insert(node.name().to_string(), node);
    }

    pub fn get(&self, name: &str) -> Option<FunctionNode> {
        self.functions.get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.names())
            .finish()
    }
}
