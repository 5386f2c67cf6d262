//! Runs the built `pipewright` binary end to end.

use std::path::Path;
use std::process::{Command, Output, Stdio};

use tempfile::TempDir;

/// Run the binary with an empty config directory and no stdin.
fn pipewright(args: &[&str]) -> Output {
    let config = TempDir::new().expect("temp config dir");
    pipewright_in(config.path(), args)
}

fn pipewright_in(config: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_pipewright"))
        .args(args)
        .env("XDG_CONFIG_HOME", config)
        .env_remove("RUST_LOG")
        .stdin(Stdio::null())
        .output()
        .expect("failed to run pipewright")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn external_stages_are_piped() {
    let output = pipewright(&["--", "printf", "a\\nb\\nc\\n", "|", "grep", "b"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert_eq!(stdout(&output), "b\n");
}

#[test]
fn function_stages_are_piped() {
    let output = pipewright(&["--", "@emit", "x", "y", "|", "@upper"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert_eq!(stdout(&output), "X\nY\n");
}

#[test]
fn failure_exits_one_and_names_the_command() {
    let output = pipewright(&["--", "sh", "-c", "exit 3"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(
        stderr(&output).contains("sh -c exit 3 exited with status 3"),
        "stderr: {}",
        stderr(&output)
    );
}

#[test]
fn caught_status_exits_zero() {
    let output = pipewright(&["--catch", "1:3", "--", "sh", "-c", "exit 3", "|", "cat"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
}

#[test]
fn json_report_goes_to_stderr() {
    let output = pipewright(&["--json", "--", "@emit", "hi"]);
    assert!(output.status.success());
    assert_eq!(stdout(&output), "hi\n");
    let report: serde_json::Value = serde_json::from_str(stderr(&output).trim()).expect("JSON report");
    assert_eq!(report["status"], 0);
    assert_eq!(report["nodes"][0]["identity"], "@emit hi");
}

#[test]
fn stdout_file_and_append() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("out.txt");
    let path_str = path.to_str().unwrap();

    let first = pipewright(&["--stdout", path_str, "--", "@emit", "one"]);
    assert!(first.status.success(), "stderr: {}", stderr(&first));
    let second = pipewright(&["--stdout", path_str, "--append", "--", "@emit", "two"]);
    assert!(second.status.success(), "stderr: {}", stderr(&second));

    assert_eq!(std::fs::read_to_string(&path).unwrap(), "one\ntwo\n");
}

#[test]
fn stdin_file_feeds_first_stage() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("in.txt");
    std::fs::write(&path, "keep\ndrop\n").unwrap();

    let output = pipewright(&["--stdin", path.to_str().unwrap(), "--", "@grep", "keep"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert_eq!(stdout(&output), "keep\n");
}

#[test]
fn config_file_is_honored() {
    let config = TempDir::new().unwrap();
    let dir = config.path().join("pipewright");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("engine.toml"), "default_buffer = \"lines\"\nline_capacity = 2\n").unwrap();

    let output = pipewright_in(config.path(), &["--", "seq", "1", "50", "|", "@cat", "|", "wc", "-l"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert_eq!(stdout(&output).trim(), "50");
}

#[test]
fn usage_errors_exit_two() {
    for args in [&["--bogus"][..], &[][..], &["--", "cat", "|"][..]] {
        let output = pipewright(args);
        assert_eq!(output.status.code(), Some(2), "{args:?}");
        assert!(stderr(&output).contains("pipewright:"), "{args:?}");
    }
}

#[test]
fn unknown_command_exits_one() {
    let output = pipewright(&["--", "definitely_not_a_real_command_12345"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("definitely_not_a_real_command_12345"));
}

#[test]
fn unknown_function_exits_one() {
    let output = pipewright(&["--", "@nope"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("unknown function @nope"));
}

#[test]
fn version_and_help() {
    let output = pipewright(&["--version"]);
    assert!(output.status.success());
    assert!(stdout(&output).starts_with("pipewright "));

    let output = pipewright(&["--help"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("Usage:"));
}
