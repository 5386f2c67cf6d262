//! Teardown of launched stages.
//!
//! Every live stage gets `SIGTERM` (or cooperative cancellation for
//! functions) up front, sink first. They then share a single grace period;
//! whatever is still running when it expires gets `SIGKILL`, again sink
//! first. Once a stage is confirmed dead the edge feeding it is closed, so
//! whatever is still upstream sees a broken pipe instead of blocking on a
//! full buffer.

use std::time::Duration;

use futures::future::join_all;
use nix::sys::signal::Signal;
use tokio::time::Instant;

use super::pipeline::Stage;

pub(crate) async fn teardown(stages: &[Stage], grace: Duration) {
    for stage in stages.iter().rev() {
        if stage.handle().try_exit().is_none() {
            stage.handle().kill(Signal::SIGTERM);
        }
    }

    let deadline = Instant::now() + grace;
    join_all(
        stages
            .iter()
            .enumerate()
            .rev()
            .map(|(index, stage)| stop_stage(index, stage, deadline, grace)),
    )
    .await;
}

async fn stop_stage(index: usize, stage: &Stage, deadline: Instant, grace: Duration) {
    let handle = stage.handle();
    let exit = match tokio::time::timeout_at(deadline, handle.wait()).await {
        Ok(exit) => exit,
        Err(_) => {
            tracing::warn!(
                identity = %handle.identity(),
                grace_ms = grace.as_millis() as u64,
                "still running after grace period, sending SIGKILL"
            );
            handle.kill(Signal::SIGKILL);
            handle.wait().await
        }
    };
    tracing::debug!(
        index,
        identity = %handle.identity(),
        status = exit.status,
        "stage stopped"
    );
    stage.close_input();
}
