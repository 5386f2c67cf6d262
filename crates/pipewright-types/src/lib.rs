//! Pure data types for pipewright — results, suppression and buffering policies.
//!
//! This crate is a leaf dependency with no async runtime and no I/O. Front-ends
//! that only render or inspect pipeline outcomes can depend on it without
//! pulling in the engine.

pub mod buffer;
pub mod result;
pub mod suppress;

pub use buffer::*;
pub use result::*;
pub use suppress::*;
