//! End-to-end pipeline behavior: data flow, suppression, failure reporting.
//!
//! Mixes in-process functions with common host commands (`cat`, `grep`,
//! `sh`, `yes`, `head`).

use pipewright_kernel::functions::builtin::{Cat, Emit, Exit, Grep, Head, Sleep, Upper};
use pipewright_kernel::{
    EngineError, FunctionNode, LaunchError, Node, Pipeline, PipelineState, Sink, Source, StderrBinding,
};

fn func(f: impl pipewright_kernel::NodeFunction + 'static) -> Node {
    Node::function(FunctionNode::new(f))
}

fn sh(script: &str) -> Node {
    Node::command("sh").arg("-c").arg(script)
}

// ============================================================================
// Data flow
// ============================================================================

#[tokio::test]
async fn identity_chain_round_trips_input() {
    let input = "alpha\nbeta\n\ngamma without newline";
    let text = (Node::command("cat") | func(Cat) | Node::command("cat"))
        .stdin(Source::bytes(input))
        .text()
        .await
        .unwrap();
    assert_eq!(text, input);
}

#[tokio::test]
async fn emit_piped_into_grep_keeps_matching_line() {
    let emit = func(Emit).args(["a", "b", "c"]);
    let text = (emit | Node::command("grep").arg("b")).text().await.unwrap();
    assert_eq!(text, "b\n");
}

#[tokio::test]
async fn external_into_function() {
    let text = (sh("printf 'one\\ntwo\\n'") | func(Upper)).text().await.unwrap();
    assert_eq!(text, "ONE\nTWO\n");
}

#[tokio::test]
async fn lines_cast_splits_output() {
    let lines = (func(Emit).args(["x", "y", "z"]) | func(Grep).arg("-v").arg("y"))
        .lines()
        .await
        .unwrap();
    assert_eq!(lines, vec!["x", "z"]);
}

#[tokio::test]
async fn large_input_passes_through_small_buffers() {
    use pipewright_kernel::BufferPolicy;

    let input: String = (0..20_000).map(|n| format!("{n}\n")).collect();
    let text = (Node::command("cat").buffer(BufferPolicy::bytes(512)) | func(Cat).buffer(BufferPolicy::lines(4)) | Node::command("cat"))
        .stdin(Source::bytes(input.clone()))
        .text()
        .await
        .unwrap();
    assert_eq!(text.len(), input.len());
    assert_eq!(text, input);
}

// ============================================================================
// Status and suppression
// ============================================================================

#[tokio::test]
async fn caught_status_is_recorded_but_not_fatal() {
    let result = (sh("exit 2").catch([2]) | func(Exit).arg("0")).run().await.unwrap();
    assert_eq!(result.status, 0);
    assert!(result.ok());
    assert!(result.nodes[0].suppressed);
    assert_eq!(result.nodes[0].status, 2);
    assert_eq!(result.suppressed().count(), 1);
}

#[tokio::test]
async fn caught_tail_status_reports_success() {
    let result = Pipeline::from(sh("exit 1").catch([1])).run().await.unwrap();
    assert_eq!(result.status, 1);
    assert!(result.ok());
    assert_eq!(result.exit_code(), 0);
}

#[tokio::test]
async fn uncaught_status_still_fails_when_others_are_caught() {
    let result = Pipeline::from(sh("exit 3").catch([1, 2])).run().await.unwrap();
    assert!(!result.ok());
    assert_eq!(result.failure.as_ref().map(|f| f.status), Some(3));
}

#[tokio::test]
async fn upstream_failure_surfaces_after_drain() {
    let result = (sh("echo partial; exit 3") | Node::command("cat"))
        .stdout(Sink::Null)
        .run()
        .await
        .unwrap();
    assert_eq!(result.status, 0);
    assert!(!result.ok());
    assert!(result.failed_upstream());
    let failure = result.failure.unwrap();
    assert_eq!(failure.index, 0);
    assert_eq!(failure.status, 3);
}

#[tokio::test]
async fn failed_cast_names_the_command() {
    let err = (func(Emit).arg("x") | sh("cat >/dev/null; exit 4")).text().await.unwrap_err();
    match err {
        EngineError::ExitStatus { identity, status } => {
            assert_eq!(status, 4);
            assert!(identity.starts_with("sh -c"), "identity: {identity}");
        }
        other => panic!("expected ExitStatus, got {other:?}"),
    }
}

#[tokio::test]
async fn status_and_ok_casts() {
    assert_eq!(Pipeline::from(sh("exit 7")).status().await.unwrap(), 7);
    assert!(!Pipeline::from(sh("exit 7")).ok().await.unwrap());
    assert!(Pipeline::from(sh("exit 7").catch_all()).ok().await.unwrap());
}

#[tokio::test]
async fn producer_killed_by_closed_consumer_is_benign() {
    let result = (Node::command("yes") | Node::command("head").arg("-n").arg("1"))
        .stdout(Sink::Null)
        .run()
        .await
        .unwrap();
    assert!(result.ok(), "{result:?}");
    assert!(result.nodes[0].broken_pipe);
}

#[tokio::test]
async fn function_producer_stops_when_consumer_quits() {
    let many: Vec<String> = (0..100_000).map(|n| n.to_string()).collect();
    let result = (func(Emit).args(many) | func(Head).arg("-n").arg("2"))
        .stdout(Sink::Null)
        .run()
        .await
        .unwrap();
    assert!(result.ok(), "{result:?}");
    assert!(result.nodes[0].broken_pipe);
    assert_eq!(result.nodes[1].status, 0);
}

// ============================================================================
// Stderr
// ============================================================================

#[tokio::test]
async fn stderr_sample_lands_in_report() {
    let result = Pipeline::from(sh("echo oops >&2; exit 1"))
        .stderr(Sink::Null)
        .run()
        .await
        .unwrap();
    assert_eq!(result.nodes[0].stderr.as_deref(), Some("oops\n"));
}

#[tokio::test]
async fn stderr_can_merge_into_stdout() {
    let text = Pipeline::from(sh("echo out; echo err >&2").stderr(StderrBinding::Stdout))
        .text()
        .await
        .unwrap();
    assert!(text.contains("out\n"), "{text}");
    assert!(text.contains("err\n"), "{text}");
}

#[tokio::test]
async fn stderr_can_feed_the_next_stage() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("stdout.txt");

    let noisy = sh("echo out; echo err >&2")
        .stderr(StderrBinding::Pipe)
        .redirect(out.clone());
    let text = (noisy | func(Upper)).text().await.unwrap();

    assert_eq!(text, "ERR\n");
    assert_eq!(std::fs::read_to_string(&out).unwrap(), "out\n");
}

#[tokio::test]
async fn pipeline_stderr_can_be_captured() {
    let mut running = Pipeline::from(sh("echo warn >&2"))
        .stdout(Sink::Null)
        .stderr(Sink::Capture)
        .spawn()
        .await
        .unwrap();
    let stderr = running.take_stderr().unwrap();
    let (collected, result) = tokio::join!(
        async move {
            let mut stderr = stderr;
            stderr.read_to_end().await.unwrap()
        },
        running.wait()
    );
    assert!(result.ok());
    assert_eq!(collected, b"warn\n");
}

#[tokio::test]
async fn reckless_node_discards_stderr_and_status() {
    let result = Pipeline::from(sh("echo noise >&2; exit 9").reckless())
        .run()
        .await
        .unwrap();
    assert!(result.ok());
    assert_eq!(result.nodes[0].stderr, None);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn failed_run_ends_in_failed_state() {
    let running = Pipeline::from(sh("exit 1")).spawn().await.unwrap();
    let states = running.subscribe();
    let result = running.wait().await;
    assert!(!result.ok());
    assert_eq!(*states.borrow(), PipelineState::Failed);
}

#[tokio::test]
async fn node_is_reusable_across_pipelines() {
    let upper = func(Upper);
    let first = (func(Emit).arg("a") | upper.clone()).text().await.unwrap();
    let second = (func(Emit).arg("b") | upper).text().await.unwrap();
    assert_eq!(first, "A\n");
    assert_eq!(second, "B\n");
}

#[tokio::test]
async fn oversized_sleep_is_rejected_at_launch() {
    let err = Pipeline::from(func(Sleep).arg("1e30")).spawn().await.unwrap_err();
    assert!(
        matches!(&err, EngineError::Launch(LaunchError::Setup { identity, .. }) if identity == "@sleep 1e30"),
        "{err:?}"
    );
}
