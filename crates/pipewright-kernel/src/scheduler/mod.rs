//! Scheduling: streams between nodes, pipeline execution, parallel groups.

mod cancel;
pub mod group;
pub mod pipeline;
pub(crate) mod pump;
pub mod stderr_sample;
pub mod stream;

pub use group::{GroupStats, IterationOrder, MemberHandle, MemberOutcome, ParallelGroup};
pub use pipeline::{Pipeline, PipelineState, RunningPipeline, check};
pub use stream::{StreamCloser, StreamReader, StreamWriter, empty_stream, stream};
