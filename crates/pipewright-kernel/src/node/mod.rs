//! Nodes: one command or in-process function plus its configuration.
//!
//! Nodes are immutable values. Every configuration method takes `&self` and
//! returns a new node; the original is never touched, so a node can be
//! reused as a template across pipelines:
//!
//! ```text
//!   let grep = Node::command("grep");
//!   let errors = grep.arg("ERROR");      // grep ERROR
//!   let warns = grep.arg("WARN");        // grep WARN, `grep` unchanged
//! ```
//!
//! The configuration lives behind an `Arc` and is cloned only when a shared
//! node is changed (`Arc::make_mut`).

mod argv;
mod handle;
mod launch;
mod resolve;

pub use argv::{Arg, ArgStyle, OptValue, Repeat};
pub use handle::{FunctionHandle, Handle, NodeExit, ProcessHandle};
pub use launch::{Bindings, Inlet, Launched, Outlet};
pub use resolve::{host_path, resolve_command};

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use pipewright_types::{BufferPolicy, StatusMatch, Suppression};

use crate::functions::FunctionNode;

/// What a node runs.
#[derive(Clone, Debug)]
pub enum Identity {
    /// External program, resolved through the search path at launch.
    External(String),
    /// In-process function.
    Function(FunctionNode),
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Identity::External(a), Identity::External(b)) => a == b,
            (Identity::Function(a), Identity::Function(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

/// Where a stream's data comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// The host process's stdin.
    Inherit,
    /// Immediate end of data.
    Null,
    File(PathBuf),
    /// Fixed bytes.
    Bytes(Arc<[u8]>),
}

impl Source {
    pub fn bytes(data: impl Into<Vec<u8>>) -> Self {
        let data: Vec<u8> = data.into();
        Source::Bytes(data.into())
    }
}

/// Where a stream's data goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sink {
    /// The host process's stdout (or stderr for stderr sinks).
    Inherit,
    Null,
    /// `>` (truncate) or `>>` (append).
    File { path: PathBuf, append: bool },
    /// Handed to the caller as a readable stream.
    Capture,
}

impl Sink {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Sink::File {
            path: path.into(),
            append: false,
        }
    }

    pub fn append(path: impl Into<PathBuf>) -> Self {
        Sink::File {
            path: path.into(),
            append: true,
        }
    }
}

/// Where a node's stderr goes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StderrBinding {
    /// The pipeline's stderr sink, with a sample kept for the report.
    #[default]
    Pipeline,
    /// The host process's stderr, bypassing the pipeline.
    Inherit,
    Discard,
    File { path: PathBuf, append: bool },
    /// Merged into the node's stdout (`2>&1`).
    Stdout,
    /// Fed to the next node in place of stdout. Stdout then goes to the
    /// node's own redirect, or is discarded.
    Pipe,
}

#[derive(Clone, Debug)]
struct NodeSpec {
    identity: Identity,
    args: Vec<Arg>,
    style: ArgStyle,
    /// `None` removes the variable.
    env: BTreeMap<String, Option<String>>,
    env_clear: bool,
    cwd: Option<PathBuf>,
    stdin: Option<Source>,
    stdout: Option<Sink>,
    stderr: StderrBinding,
    suppression: Suppression,
    buffer: Option<BufferPolicy>,
}

/// One executable unit of a pipeline.
#[derive(Clone)]
pub struct Node {
    spec: Arc<NodeSpec>,
}

impl Node {
    fn from_identity(identity: Identity) -> Self {
        Self {
            spec: Arc::new(NodeSpec {
                identity,
                args: Vec::new(),
                style: ArgStyle::default(),
                env: BTreeMap::new(),
                env_clear: false,
                cwd: None,
                stdin: None,
                stdout: None,
                stderr: StderrBinding::default(),
                suppression: Suppression::default(),
                buffer: None,
            }),
        }
    }

    /// An external command.
    pub fn command(name: impl Into<String>) -> Self {
        Self::from_identity(Identity::External(name.into()))
    }

    /// An in-process function.
    pub fn function(func: FunctionNode) -> Self {
        Self::from_identity(Identity::Function(func))
    }

    fn with(&self, f: impl FnOnce(&mut NodeSpec)) -> Self {
        let mut next = self.clone();
        f(Arc::make_mut(&mut next.spec));
        next
    }

    // ------------------------------------------------------------------
    // Arguments
    // ------------------------------------------------------------------

    /// Append a positional argument.
    pub fn arg(&self, arg: impl Into<String>) -> Self {
        let arg = arg.into();
        self.with(|s| s.args.push(Arg::Positional(arg)))
    }

    /// Append several positional arguments.
    pub fn args<I, S>(&self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args: Vec<Arg> = args.into_iter().map(|a| Arg::Positional(a.into())).collect();
        self.with(|s| s.args.extend(args))
    }

    /// Set a keyword option. Setting the same name again replaces the value
    /// in place.
    pub fn opt(&self, name: impl Into<String>, value: impl Into<OptValue>) -> Self {
        let name = name.into();
        let value = value.into();
        self.with(|s| {
            let existing = s.args.iter_mut().find_map(|arg| match arg {
                Arg::Option { name: n, value: v } if *n == name => Some(v),
                _ => None,
            });
            match existing {
                Some(slot) => *slot = value,
                None => s.args.push(Arg::Option { name, value }),
            }
        })
    }

    /// Option naming convention for this command.
    pub fn style(&self, style: ArgStyle) -> Self {
        self.with(|s| s.style = style)
    }

    // ------------------------------------------------------------------
    // Environment
    // ------------------------------------------------------------------

    pub fn env(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let (key, value) = (key.into(), value.into());
        self.with(|s| {
            s.env.insert(key, Some(value));
        })
    }

    pub fn env_remove(&self, key: impl Into<String>) -> Self {
        let key = key.into();
        self.with(|s| {
            s.env.insert(key, None);
        })
    }

    /// Start from an empty environment; overrides still apply.
    pub fn env_clear(&self) -> Self {
        self.with(|s| s.env_clear = true)
    }

    pub fn current_dir(&self, dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        self.with(|s| s.cwd = Some(dir))
    }

    // ------------------------------------------------------------------
    // Suppression
    // ------------------------------------------------------------------

    /// Treat the given statuses as success. An empty list catches all.
    pub fn catch<I, M>(&self, statuses: I) -> Self
    where
        I: IntoIterator<Item = M>,
        M: Into<StatusMatch>,
    {
        let policy = Suppression::statuses(statuses);
        self.with(|s| s.suppression = policy)
    }

    pub fn catch_range(&self, range: RangeInclusive<i32>) -> Self {
        let policy = Suppression::range(range);
        self.with(|s| s.suppression = policy)
    }

    pub fn catch_all(&self) -> Self {
        self.with(|s| s.suppression = Suppression::All)
    }

    /// Ignore every status and throw away stderr.
    pub fn reckless(&self) -> Self {
        self.with(|s| s.suppression = Suppression::Reckless)
    }

    /// Back to the default: every non-zero status fails.
    pub fn strict(&self) -> Self {
        self.with(|s| s.suppression = Suppression::Strict)
    }

    pub fn suppression_policy(&self, policy: Suppression) -> Self {
        self.with(|s| s.suppression = policy)
    }

    // ------------------------------------------------------------------
    // Endpoints
    // ------------------------------------------------------------------

    /// Declare this node's stdin. Only valid at the head of a pipeline.
    pub fn stdin(&self, source: Source) -> Self {
        self.with(|s| s.stdin = Some(source))
    }

    /// Declare this node's stdout. Only valid at the tail of a pipeline.
    pub fn stdout(&self, sink: Sink) -> Self {
        self.with(|s| s.stdout = Some(sink))
    }

    /// `> path`
    pub fn redirect(&self, path: impl Into<PathBuf>) -> Self {
        self.stdout(Sink::file(path))
    }

    /// `>> path`
    pub fn append(&self, path: impl Into<PathBuf>) -> Self {
        self.stdout(Sink::append(path))
    }

    pub fn stderr(&self, binding: StderrBinding) -> Self {
        self.with(|s| s.stderr = binding)
    }

    /// Buffering policy of this node's outgoing edge.
    pub fn buffer(&self, policy: BufferPolicy) -> Self {
        self.with(|s| s.buffer = Some(policy))
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn identity(&self) -> &Identity {
        &self.spec.identity
    }

    pub fn is_function(&self) -> bool {
        matches!(self.spec.identity, Identity::Function(_))
    }

    /// Program or function name.
    pub fn name(&self) -> &str {
        match &self.spec.identity {
            Identity::External(name) => name,
            Identity::Function(func) => func.name(),
        }
    }

    /// Logical arguments.
    pub fn logical_args(&self) -> &[Arg] {
        &self.spec.args
    }

    /// Literal argv after formatting (program name excluded).
    pub fn argv(&self) -> Vec<String> {
        self.spec.style.format(&self.spec.args)
    }

    /// Human-readable form used in reports: `grep -v foo`, `@upper`.
    pub fn display_name(&self) -> String {
        let mut out = match &self.spec.identity {
            Identity::External(name) => name.clone(),
            Identity::Function(func) => format!("@{}", func.name()),
        };
        for arg in self.argv() {
            out.push(' ');
            out.push_str(&arg);
        }
        out
    }

    pub fn suppression(&self) -> &Suppression {
        &self.spec.suppression
    }

    pub fn declared_stdin(&self) -> Option<&Source> {
        self.spec.stdin.as_ref()
    }

    pub fn declared_stdout(&self) -> Option<&Sink> {
        self.spec.stdout.as_ref()
    }

    /// Effective stderr binding. Reckless nodes always discard.
    pub fn stderr_binding(&self) -> StderrBinding {
        if self.spec.suppression.discards_stderr() {
            StderrBinding::Discard
        } else {
            self.spec.stderr.clone()
        }
    }

    pub fn buffer_policy(&self) -> Option<BufferPolicy> {
        self.spec.buffer
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.spec.cwd.as_deref()
    }

    pub fn clears_env(&self) -> bool {
        self.spec.env_clear
    }

    /// Overrides in key order; `None` means removed.
    pub fn env_overrides(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.spec
            .env
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_deref()))
    }

    /// Search path for resolving this node: its own `PATH` override, or the
    /// host's.
    pub fn search_path(&self) -> String {
        match self.spec.env.get("PATH") {
            Some(Some(path)) => path.clone(),
            _ => host_path(),
        }
    }

    /// Host environment with this node's overrides applied.
    pub fn effective_env(&self) -> HashMap<String, String> {
        let mut env: HashMap<String, String> = if self.spec.env_clear {
            HashMap::new()
        } else {
            std::env::vars().collect()
        };
        for (key, value) in &self.spec.env {
            match value {
                Some(value) => {
                    env.insert(key.clone(), value.clone());
                }
                None => {
                    env.remove(key);
                }
            }
        }
        env
    }

    /// True if both values are the same node (not merely equal).
    pub fn same(&self, other: &Node) -> bool {
        Arc::ptr_eq(&self.spec, &other.spec)
    }
}

impl PartialEq for Node {
    /// Behavioral equality: same identity and configuration.
    fn eq(&self, other: &Self) -> bool {
        let (a, b) = (&*self.spec, &*other.spec);
        a.identity == b.identity
            && a.args == b.args
            && a.style == b.style
            && a.env == b.env
            && a.env_clear == b.env_clear
            && a.cwd == b.cwd
            && a.stdin == b.stdin
            && a.stdout == b.stdout
            && a.stderr == b.stderr
            && a.suppression == b.suppression
            && a.buffer == b.buffer
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("identity", &self.display_name())
            .field("suppression", &self.spec.suppression)
            .finish()
    }
}

impl From<FunctionNode> for Node {
    fn from(func: FunctionNode) -> Self {
        Node::function(func)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_never_mutates_original() {
        let base = Node::command("grep");
        let errors = base.arg("ERROR");
        let warns = base.arg("WARN");

        assert!(base.argv().is_empty());
        assert_eq!(errors.argv(), ["ERROR"]);
        assert_eq!(warns.argv(), ["WARN"]);
    }

    #[test]
    fn configuration_is_idempotent() {
        let node = Node::command("ls");
        let once = node.opt("color", "never").catch([1]).env("LC_ALL", "C");
        let twice = once.opt("color", "never").catch([1]).env("LC_ALL", "C");
        assert_eq!(once, twice);
        assert_eq!(twice.argv(), ["--color", "never"]);
    }

    #[test]
    fn opt_replaces_in_place() {
        let node = Node::command("grep").opt("m", 1).arg("x").opt("m", 2);
        assert_eq!(node.argv(), ["-m", "2", "x"]);
    }

    #[test]
    fn catch_replaces_policy() {
        let node = Node::command("grep").catch([1]).catch([2]);
        assert!(node.suppression().suppresses(2));
        assert!(!node.suppression().suppresses(1));
        assert_eq!(node.catch(Vec::<i32>::new()).suppression(), &Suppression::All);
        assert_eq!(node.strict().suppression(), &Suppression::Strict);
    }

    #[test]
    fn reckless_discards_stderr() {
        let node = Node::command("make").stderr(StderrBinding::Inherit).reckless();
        assert_eq!(node.stderr_binding(), StderrBinding::Discard);
        assert!(node.suppression().suppresses(2));
    }

    #[test]
    fn display_name_includes_formatted_args() {
        let node = Node::command("grep").opt("v", true).arg("foo");
        assert_eq!(node.display_name(), "grep -v foo");

        let func = FunctionNode::from_fn("upper", |_io| async { Ok(0) });
        assert_eq!(Node::function(func).arg("x").display_name(), "@upper x");
    }

    #[test]
    fn env_overrides_apply_after_clear() {
        let node = Node::command("env").env_clear().env("ONLY", "1");
        let env = node.effective_env();
        assert_eq!(env.len(), 1);
        assert_eq!(env.get("ONLY").map(String::as_str), Some("1"));
    }

    #[test]
    fn env_remove_hides_host_variable() {
        let node = Node::command("env").env_remove("PATH");
        assert!(!node.effective_env().contains_key("PATH"));
    }

    #[test]
    fn path_override_drives_resolution() {
        let node = Node::command("tool").env("PATH", "/opt/tools");
        assert_eq!(node.search_path(), "/opt/tools");
    }

    #[test]
    fn clones_share_until_changed() {
        let node = Node::command("cat");
        let copy = node.clone();
        assert!(node.same(&copy));
        assert!(!node.same(&copy.arg("x")));
    }
}
