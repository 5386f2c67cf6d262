//! emit — Write each argument as a line.

use async_trait::async_trait;

use crate::functions::{NodeFunction, NodeIo};

/// Source stage with fixed output. Ignores stdin.
pub struct Emit;

#[async_trait]
impl NodeFunction for Emit {
    fn name(&self) -> &str {
        "emit"
    }

    async fn run(&self, mut io: NodeIo) -> anyhow::Result<i32> {
        for line in &io.args {
            io.stdout.write_line(line).await?;
        }
        io.stdout.close().await?;
        Ok(0)
    }
}
