//! exit — Finish with a fixed status.

use async_trait::async_trait;

use crate::functions::{NodeFunction, NodeIo};

/// Produces no output and exits with the given status (default 0).
pub struct Exit;

fn parse_status(args: &[String]) -> Result<i32, String> {
    match args {
        [] => Ok(0),
        [code] => code
            .parse::<i32>()
            .map_err(|_| format!("exit: {code}: numeric argument required")),
        _ => Err("exit: too many arguments".to_string()),
    }
}

#[async_trait]
impl NodeFunction for Exit {
    fn name(&self) -> &str {
        "exit"
    }

    fn setup(&self, args: &[String]) -> Result<(), String> {
        parse_status(args).map(|_| ())
    }

    async fn run(&self, io: NodeIo) -> anyhow::Result<i32> {
        parse_status(&io.args).map_err(anyhow::Error::msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_status() {
        assert_eq!(parse_status(&[]), Ok(0));
        assert_eq!(parse_status(&["3".to_string()]), Ok(3));
        assert!(parse_status(&["x".to_string()]).is_err());
    }
}
