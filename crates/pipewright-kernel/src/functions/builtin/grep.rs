//! grep — Keep lines matching a regular expression.

use async_trait::async_trait;
use regex::{Regex, RegexBuilder};

use crate::functions::{NodeFunction, NodeIo};

/// Line filter. Exits 0 if any line was selected, 1 otherwise.
pub struct Grep;

#[derive(Debug)]
struct GrepOptions {
    pattern: Regex,
    invert: bool,
}

fn parse_args(args: &[String]) -> Result<GrepOptions, String> {
    let mut invert = false;
    let mut ignore_case = false;
    let mut pattern = None;

    for arg in args {
        match arg.as_str() {
            "-v" | "--invert-match" => invert = true,
            "-i" | "--ignore-case" => ignore_case = true,
            flag if flag.starts_with('-') && flag.len() > 1 && pattern.is_none() => {
                return Err(format!("grep: unknown option {flag}"));
            }
            _ if pattern.is_none() => pattern = Some(arg.as_str()),
            _ => return Err("grep: only one pattern is supported".to_string()),
        }
    }

    let pattern = pattern.ok_or_else(|| "grep: missing pattern".to_string())?;
    let pattern = RegexBuilder::new(pattern)
        .case_insensitive(ignore_case)
        .build()
        .map_err(|e| format!("grep: invalid pattern: {e}"))?;

    Ok(GrepOptions { pattern, invert })
}

#[async_trait]
impl NodeFunction for Grep {
    fn name(&self) -> &str {
        "grep"
    }

    fn setup(&self, args: &[String]) -> Result<(), String> {
        parse_args(args).map(|_| ())
    }

    async fn run(&self, io: NodeIo) -> anyhow::Result<i32> {
        let options = parse_args(&io.args).map_err(anyhow::Error::msg)?;
        let mut stdout = io.stdout;
        let mut lines = io.stdin.lines();
        let mut selected = false;

        while let Some(line) = lines.next_line().await? {
            if options.pattern.is_match(&line) != options.invert {
                selected = true;
                stdout.write_line(&line).await?;
            }
        }
        stdout.close().await?;

        Ok(if selected { 0 } else { 1 })
    }
}
