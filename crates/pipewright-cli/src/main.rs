//! pipewright CLI entry point.
//!
//! Usage:
//!   pipewright [OPTIONS] -- STAGE [| STAGE ...]
//!
//! Exit status: 0 on success, 1 when the pipeline fails, 2 on usage errors.

mod args;

use std::env;
use std::process::ExitCode;

use anyhow::{Context, Result};
use pipewright_kernel::{
    EngineConfig, FunctionRegistry, Node, Pipeline, PipelineResult, Sink, Source, Suppression,
};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use args::{Command, Invocation};

const USAGE_ERROR: u8 = 2;

fn main() -> ExitCode {
    // Initialize tracing (respects RUST_LOG env var)
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let argv: Vec<String> = env::args().skip(1).collect();
    let invocation = match args::parse(&argv) {
        Ok(Command::Help) => {
            print_help();
            return ExitCode::SUCCESS;
        }
        Ok(Command::Version) => {
            println!("pipewright {}", env!("CARGO_PKG_VERSION"));
            return ExitCode::SUCCESS;
        }
        Ok(Command::Run(invocation)) => invocation,
        Err(message) => {
            eprintln!("pipewright: {message}");
            eprintln!("Run 'pipewright --help' for usage.");
            return ExitCode::from(USAGE_ERROR);
        }
    };

    match run(invocation) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("pipewright: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn print_help() {
    let functions = FunctionRegistry::with_builtins().names().join(", ");
    println!(
        r#"pipewright v{}

Usage:
  pipewright [OPTIONS] -- STAGE [| STAGE ...]

Stages are separated by a literal '|' argument. A stage starting with '@'
runs an in-process function: {functions}

Options:
  --stdin <file>               Read the first stage's stdin from a file
  --stdout <file>              Write the last stage's stdout to a file
  --append                     Append to the --stdout file instead of truncating
  --catch <stage>:<code>       Treat a status (or LO-HI range) of a stage as success
  --json                       Print the pipeline result as JSON on stderr
  --grace <ms>                 Wait this long after SIGTERM before SIGKILL
  -h, --help                   Show this help
  -V, --version                Show version

Examples:
  pipewright -- printf 'a\nb\n' '|' grep b
  pipewright --catch 1:1 -- grep needle haystack.txt '|' @upper
"#,
        env!("CARGO_PKG_VERSION")
    );
}

/// Turn one stage's words into a node.
fn stage_node(words: &[String], registry: &FunctionRegistry) -> Result<Node> {
    let (head, rest) = words.split_first().context("empty pipeline stage")?;
    let node = match head.strip_prefix('@') {
        Some(name) => {
            let func = registry.get(name).with_context(|| {
                format!(
                    "unknown function @{name} (available: {})",
                    registry.names().join(", ")
                )
            })?;
            Node::function(func)
        }
        None => Node::command(head.as_str()),
    };
    Ok(node.args(rest.iter().cloned()))
}

fn build_pipeline(invocation: &Invocation, config: EngineConfig) -> Result<Pipeline> {
    let registry = FunctionRegistry::with_builtins();
    let mut nodes = invocation
        .stages
        .iter()
        .map(|words| stage_node(words, &registry))
        .collect::<Result<Vec<_>>>()?;

    for (index, node) in nodes.iter_mut().enumerate() {
        let catches: Vec<_> = invocation
            .catches
            .iter()
            .filter(|(stage, _)| *stage == index)
            .map(|(_, status)| *status)
            .collect();
        if !catches.is_empty() {
            *node = node.suppression_policy(Suppression::statuses(catches));
        }
    }

    let stdin = match &invocation.stdin {
        Some(path) => Source::File(path.clone()),
        None => Source::Inherit,
    };
    let stdout = match &invocation.stdout {
        Some(path) if invocation.append => Sink::append(path),
        Some(path) => Sink::file(path),
        None => Sink::Inherit,
    };

    Ok(Pipeline::from_nodes(nodes)
        .stdin(stdin)
        .stdout(stdout)
        .config(config))
}

/// Run the pipeline, cancelling it on Ctrl-C.
async fn execute(pipeline: Pipeline) -> Result<PipelineResult> {
    let running = pipeline.spawn().await?;
    let token = running.cancellation_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::debug!("interrupted, cancelling pipeline");
            token.cancel();
        }
    });

    let result = running.wait().await;
    interrupt.abort();
    Ok(result)
}

fn run(invocation: Invocation) -> Result<ExitCode> {
    let mut config = EngineConfig::load().context("Failed to load engine config")?;
    if let Some(ms) = invocation.grace_ms {
        config.kill_grace_ms = ms;
    }

    let pipeline = build_pipeline(&invocation, config)?;
    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(execute(pipeline))?;

    if invocation.json {
        eprintln!("{}", serde_json::to_string_pretty(&result)?);
    }
    if result.cancelled {
        eprintln!("pipewright: cancelled");
    } else if let Some(failure) = &result.failure {
        eprintln!(
            "pipewright: {} exited with status {}",
            failure.identity, failure.status
        );
    }

    Ok(ExitCode::from(result.exit_code() as u8))
}
