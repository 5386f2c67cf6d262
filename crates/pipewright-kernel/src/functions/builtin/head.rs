//! head — Pass through the first N lines.
//!
//! Stops reading as soon as it has N lines, so `yes | @head 3` ends the
//! upstream producer with a broken pipe instead of draining it.

use async_trait::async_trait;

use crate::functions::{NodeFunction, NodeIo};

pub struct Head;

const DEFAULT_LINES: usize = 10;

fn parse_count(args: &[String]) -> Result<usize, String> {
    let count = match args {
        [] => return Ok(DEFAULT_LINES),
        [flag, n] if flag == "-n" => n.as_str(),
        [n] => n.strip_prefix('-').unwrap_or(n),
        _ => return Err("head: usage: head [-n] COUNT".to_string()),
    };
    count
        .parse()
        .map_err(|_| format!("head: invalid line count: {count}"))
}

#[async_trait]
impl NodeFunction for Head {
    fn name(&self) -> &str {
        "head"
    }

    fn setup(&self, args: &[String]) -> Result<(), String> {
        parse_count(args).map(|_| ())
    }

    async fn run(&self, io: NodeIo) -> anyhow::Result<i32> {
        let count = parse_count(&io.args).map_err(anyhow::Error::msg)?;
        let mut stdout = io.stdout;
        let mut lines = io.stdin.lines();

        for _ in 0..count {
            match lines.next_line().await? {
                Some(line) => stdout.write_line(&line).await?,
                None => break,
            }
        }
        stdout.close().await?;
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_forms() {
        let s = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert_eq!(parse_count(&[]), Ok(10));
        assert_eq!(parse_count(&s(&["3"])), Ok(3));
        assert_eq!(parse_count(&s(&["-3"])), Ok(3));
        assert_eq!(parse_count(&s(&["-n", "7"])), Ok(7));
        assert!(parse_count(&s(&["-n", "x"])).is_err());
    }
}
