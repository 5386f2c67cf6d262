//! upper — Uppercase every line.

use async_trait::async_trait;

use crate::functions::{NodeFunction, NodeIo};

pub struct Upper;

#[async_trait]
impl NodeFunction for Upper {
    fn name(&self) -> &str {
        "upper"
    }

    async fn run(&self, io: NodeIo) -> anyhow::Result<i32> {
        let mut stdout = io.stdout;
        let mut lines = io.stdin.lines();
        while let Some(line) = lines.next_line().await? {
            stdout.write_line(&line.to_uppercase()).await?;
        }
        stdout.close().await?;
        Ok(0)
    }
}
