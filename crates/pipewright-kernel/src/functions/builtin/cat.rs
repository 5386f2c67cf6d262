//! cat — Copy stdin (or files) to stdout.

use async_trait::async_trait;
use std::path::Path;

use crate::functions::{NodeFunction, NodeIo};

/// Identity stage: forwards its input unchanged.
pub struct Cat;

#[async_trait]
impl NodeFunction for Cat {
    fn name(&self) -> &str {
        "cat"
    }

    async fn run(&self, mut io: NodeIo) -> anyhow::Result<i32> {
        if io.args.is_empty() {
            while let Some(chunk) = io.stdin.read().await? {
                io.stdout.write(&chunk).await?;
            }
            io.stdout.close().await?;
            return Ok(0);
        }

        let mut status = 0;
        for name in &io.args {
            let path = match &io.cwd {
                Some(cwd) => cwd.join(name),
                None => Path::new(name).to_path_buf(),
            };
            match tokio::fs::read(&path).await {
                Ok(data) => io.stdout.write(&data).await?,
                Err(e) => {
                    io.stderr.write_line(&format!("cat: {name}: {e}")).await?;
                    status = 1;
                }
            }
        }
        io.stdout.close().await?;
        Ok(status)
    }
}
