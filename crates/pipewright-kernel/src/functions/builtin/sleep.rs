//! sleep — Wait, cooperatively.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::StreamError;
use crate::functions::{NodeFunction, NodeIo};

/// Sleeps for the given seconds (decimals allowed). Cancellation ends the
/// wait early.
pub struct Sleep;

fn parse_seconds(args: &[String]) -> Result<Duration, String> {
    let [arg] = args else {
        return Err("sleep: usage: sleep SECONDS".to_string());
    };
    let seconds: f64 = arg
        .parse()
        .map_err(|_| format!("sleep: invalid time interval '{arg}'"))?;
    Duration::try_from_secs_f64(seconds).map_err(|_| format!("sleep: invalid time interval '{arg}'"))
}

#[async_trait]
impl NodeFunction for Sleep {
    fn name(&self) -> &str {
        "sleep"
    }

    fn setup(&self, args: &[String]) -> Result<(), String> {
        parse_seconds(args).map(|_| ())
    }

    async fn run(&self, io: NodeIo) -> anyhow::Result<i32> {
        let duration = parse_seconds(&io.args).map_err(anyhow::Error::msg)?;
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(0),
            _ = io.cancel.cancelled() => Err(StreamError::Cancelled.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_decimal_seconds() {
        assert_eq!(parse_seconds(&["0.5".to_string()]), Ok(Duration::from_millis(500)));
        assert!(parse_seconds(&["-1".to_string()]).is_err());
        assert!(parse_seconds(&["1e30".to_string()]).is_err());
        assert!(parse_seconds(&["inf".to_string()]).is_err());
        assert!(parse_seconds(&[]).is_err());
    }
}
