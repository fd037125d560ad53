//! Drives ingestion cycles on a fixed interval.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::ingest::IngestError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid interval {0:?}, use a duration such as 30s, 1m or 1h30m")]
pub struct InvalidInterval(pub String);

/// Parse a duration such as `1m`, `1h30m`, `1.5s` or `500ms`.
///
/// Units are `ns`, `us` (or `µs`), `ms`, `s`, `m` and `h`. Every number needs
/// a unit, and the total must be positive.
pub fn parse_interval(text: &str) -> Result<Duration, InvalidInterval> {
    let invalid = || InvalidInterval(text.to_string());

    let mut rest = text.trim();
    if rest.is_empty() {
        return Err(invalid());
    }

    let mut total: u128 = 0;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let (number, tail) = rest.split_at(number_len);

        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_len);

        let unit_nanos: u128 = match unit {
            "ns" => 1,
            "us" | "µs" | "μs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60 * 1_000_000_000,
            "h" => 60 * 60 * 1_000_000_000,
            _ => return Err(invalid()),
        };

        let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
        if (whole.is_empty() && fraction.is_empty()) || fraction.contains('.') {
            return Err(invalid());
        }

        let whole: u128 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| invalid())?
        };
        let mut nanos = whole.checked_mul(unit_nanos).ok_or_else(invalid)?;

        if !fraction.is_empty() {
            let digits = &fraction[..fraction.len().min(18)];
            let value: u128 = digits.parse().map_err(|_| invalid())?;
            nanos += value * unit_nanos / 10u128.pow(digits.len() as u32);
        }

        total = total.checked_add(nanos).ok_or_else(invalid)?;
        rest = tail;
    }

    if total == 0 {
        return Err(invalid());
    }

    let nanos = u64::try_from(total).map_err(|_| invalid())?;
    Ok(Duration::from_nanos(nanos))
}

/// Run `step` now and then once per `interval` until `shutdown` resolves.
///
/// Cycles never overlap: a cycle that outlasts the interval pushes the next
/// one back instead of triggering a burst. Retryable errors are logged and
/// the loop carries on; any other error stops it and is returned.
pub async fn run<F, Fut, T, S>(interval: Duration, mut step: F, shutdown: S) -> Result<(), IngestError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, IngestError>>,
    S: Future<Output = ()>,
{
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    info!(?interval, "starting feed collection");

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                info!("shutdown requested, stopping feed collection");
                return Ok(());
            }
            _ = ticker.tick() => {}
        }

        match step().await {
            Ok(_) => {}
            Err(err) if err.is_retryable() => {
                warn!(error = %err, "cycle failed, feed will be retried on a later tick");
            }
            Err(err) => {
                error!(error = %err, "cycle failed, stopping feed collection");
                return Err(err);
            }
        }
    }
}
