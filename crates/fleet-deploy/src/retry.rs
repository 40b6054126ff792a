//! Bounded retry with fixed backoff for flaky external services

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use async_io::Timer;
use tracing::warn;

/// Run `op` up to `attempts` times, sleeping `delay` between attempts.
///
/// Only errors for which `is_transient` returns true are retried; anything
/// else surfaces immediately. The last error is returned once the attempts
/// are exhausted.
pub async fn with_backoff<T, E, F, Fut>(
    attempts: u32,
    delay: Duration,
    is_transient: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < attempts && is_transient(&err) => {
                warn!(attempt, max_attempts = attempts, %err, "transient failure, retrying");
                Timer::after(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[smol_potat::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = Cell::new(0u32);
        let result: Result<u32, String> =
            with_backoff(3, Duration::from_millis(1), |_| true, || async {
                calls.set(calls.get() + 1);
                if calls.get() < 3 {
                    Err("connection reset".to_string())
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.get(), 3);
    }

    #[smol_potat::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = Cell::new(0u32);
        let result: Result<(), String> =
            with_backoff(3, Duration::from_millis(1), |_| true, || async {
                calls.set(calls.get() + 1);
                Err("still down".to_string())
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.get(), 3);
    }

    #[smol_potat::test]
    async fn test_permanent_errors_are_not_retried() {
        let calls = Cell::new(0u32);
        let result: Result<(), String> =
            with_backoff(3, Duration::from_millis(1), |_| false, || async {
                calls.set(calls.get() + 1);
                Err("bad request".to_string())
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }
}
