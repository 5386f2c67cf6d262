//! pipewright-kernel: the pipeline execution engine.
//!
//! This crate provides:
//!
//! - **Node**: copy-on-write descriptions of external commands and in-process
//!   functions, with argument formatting, redirections and suppression
//! - **Streams**: bounded in-memory edges with backpressure
//! - **Executor**: launches a pipeline source to sink and supervises it to a
//!   `PipelineResult`
//! - **Parallel groups**: bounded fan-out (`fork`, `demux`)
//! - **Cancellation**: downstream-first teardown with kill escalation
//! - **Functions**: the `NodeFunction` trait and a small builtin library
//! - **Config**: `EngineConfig` loaded from the XDG config directory

pub mod config;
pub mod error;
pub mod functions;
pub mod node;
pub mod scheduler;

pub use config::{EngineConfig, host_parallelism};
pub use error::{EngineError, EngineResult, GraphError, LaunchError, StreamError};
pub use functions::{FunctionNode, FunctionRegistry, NodeFunction, NodeIo};
pub use node::{Handle, Node, NodeExit, Sink, Source, StderrBinding};
pub use scheduler::{
    GroupStats, IterationOrder, MemberHandle, MemberOutcome, ParallelGroup, Pipeline,
    PipelineState, RunningPipeline, StreamReader, StreamWriter, stream,
};

// Result and policy types, re-exported so most users need only this crate.
pub use pipewright_types::{
    BufferMode, BufferPolicy, NodeFailure, NodeReport, PipelineResult, StatusMatch, Suppression,
};
