//! Parallel groups: admission, timing, fan-out helpers.

use std::time::Duration;

use futures::StreamExt;
use pipewright_kernel::functions::builtin::{Cat, Emit, Sleep};
use pipewright_kernel::{
    BufferPolicy, FunctionNode, IterationOrder, Node, ParallelGroup, Pipeline, Sink, stream,
};
use tempfile::tempdir;
use tokio::time::Instant;

fn sleeper(seconds: &str) -> Pipeline {
    Pipeline::from(Node::function(FunctionNode::new(Sleep)).arg(seconds))
}

#[tokio::test]
async fn ten_sleeps_with_limit_three_take_four_rounds() {
    let started = Instant::now();
    let mut group = ParallelGroup::new(3);
    for _ in 0..10 {
        group.submit(|| sleeper("0.3")).await;
    }
    let stats = group.wait_all().await;
    let elapsed = started.elapsed();

    assert!(stats.ok());
    assert_eq!(stats.completed, 10);
    assert_eq!(stats.peak, 3);
    // ceil(10 / 3) = 4 rounds of 300ms.
    assert!(elapsed >= Duration::from_millis(1150), "too fast: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(4), "too slow: {elapsed:?}");
}

#[tokio::test]
async fn admission_never_exceeds_limit() {
    let mut group = ParallelGroup::new(4);
    for _ in 0..20 {
        group.submit(|| sleeper("0.02")).await;
        assert!(group.stats().active <= 4);
    }
    let stats = group.wait_all().await;
    assert!(stats.peak <= 4);
    assert_eq!(stats.submitted, 20);
    assert_eq!(stats.active, 0);
}

#[tokio::test]
async fn exactly_limit_members_yield_limit_results() {
    let mut group = ParallelGroup::new(3);
    for _ in 0..3 {
        group.submit(|| sleeper("0.01")).await;
    }
    let mut results = 0;
    while let Some(outcome) = group.next_completed().await {
        assert!(outcome.ok());
        results += 1;
    }
    assert_eq!(results, 3);
}

#[tokio::test]
async fn completion_order_yields_fastest_first() {
    let mut group = ParallelGroup::new(3).order(IterationOrder::Completion);
    for seconds in ["0.4", "0.2", "0"] {
        group.submit(move || sleeper(seconds)).await;
    }
    let order: Vec<usize> = group.iterate().map(|outcome| outcome.index).collect().await;
    assert_eq!(order, vec![2, 1, 0]);
}

#[tokio::test]
async fn failures_do_not_stop_siblings_by_default() {
    let mut group = ParallelGroup::new(2);
    group
        .submit(|| Pipeline::from(Node::command("sh").arg("-c").arg("exit 1")))
        .await;
    group.submit(|| sleeper("0.1")).await;
    let outcomes: Vec<_> = group
        .order(IterationOrder::Submission)
        .iterate()
        .collect()
        .await;
    assert!(!outcomes[0].ok());
    assert!(outcomes[1].ok());
    assert!(!outcomes[1].result.as_ref().unwrap().cancelled);
}

#[tokio::test]
async fn fork_runs_one_pipeline_per_item() {
    let dir = tempdir().unwrap();
    let out = dir.path().to_path_buf();

    let mut group = ParallelGroup::new(2);
    let handles = group
        .fork(["alpha", "beta", "gamma"], move |item| {
            Pipeline::from(Node::function(FunctionNode::new(Emit)).arg(item))
                .stdout(Sink::file(out.join(item)))
        })
        .await;
    assert_eq!(handles.len(), 3);
    assert!(group.wait_all().await.ok());

    for item in ["alpha", "beta", "gamma"] {
        let written = std::fs::read_to_string(dir.path().join(item)).unwrap();
        assert_eq!(written, format!("{item}\n"));
    }
}

#[tokio::test]
async fn demux_spreads_lines_round_robin() {
    let dir = tempdir().unwrap();
    let out = dir.path().to_path_buf();

    let (mut writer, reader) = stream(BufferPolicy::lines(8));
    let producer = tokio::spawn(async move {
        for n in 0..100 {
            writer.write_line(&n.to_string()).await.unwrap();
        }
        writer.close().await.unwrap();
    });

    let mut group = ParallelGroup::new(4);
    let handles = group
        .demux(reader, 4, move |worker| {
            Pipeline::from(Node::function(FunctionNode::new(Cat)))
                .stdout(Sink::file(out.join(format!("worker-{worker}"))))
        })
        .await;
    assert_eq!(handles.len(), 4);
    assert!(group.wait_all().await.ok());
    producer.await.unwrap();

    let mut total = 0;
    for worker in 0..4 {
        let text = std::fs::read_to_string(dir.path().join(format!("worker-{worker}"))).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 25, "worker {worker}");
        assert_eq!(lines[0], worker.to_string());
        total += lines.len();
    }
    assert_eq!(total, 100);
}

#[tokio::test]
async fn demux_is_clamped_to_the_limit() {
    let (mut writer, reader) = stream(BufferPolicy::lines(4));
    writer.close().await.unwrap();

    let mut group = ParallelGroup::new(2);
    let handles = group
        .demux(reader, 8, |_| Pipeline::from(Node::function(FunctionNode::new(Cat))).stdout(Sink::Null))
        .await;
    assert_eq!(handles.len(), 2);
    assert!(group.wait_all().await.ok());
}

#[tokio::test]
async fn group_cancel_stops_every_member() {
    let mut group = ParallelGroup::new(3);
    for _ in 0..3 {
        group.submit(|| sleeper("30")).await;
    }
    group.cancel();
    let stats = tokio::time::timeout(Duration::from_secs(5), group.wait_all())
        .await
        .expect("cancelled members should stop promptly");
    assert_eq!(stats.completed, 3);
    assert_eq!(stats.failed, 3);
}
