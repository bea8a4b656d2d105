use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// Run `f` up to `attempts` times, sleeping `delay` between failures.
///
/// Returns the first success or the last error.
pub async fn retry<T, E, F, Fut>(attempts: u32, delay: Duration, f: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_conditional(attempts, delay, |_| true, f).await
}

/// Like [`retry`], but stops early when `should_retry` rejects an error.
///
/// Used where some failures are known to be transient (a device that has not
/// appeared yet) and others are not (a device of the wrong type).
pub async fn retry_conditional<T, E, F, Fut, P>(
    attempts: u32,
    delay: Duration,
    should_retry: P,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= attempts || !should_retry(&e) => return Err(e),
            Err(e) => {
                debug!(attempt, attempts, error = %e, "retrying after failure");
                attempt += 1;
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn retry_returns_first_success() {
        let calls = &AtomicU32::new(0);
        let result: Result<u32, String> = retry(5, Duration::from_secs(1), move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 { Err(format!("attempt {n}")) } else { Ok(n) }
        })
        .await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_exhausts_budget() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), String> = retry(4, Duration::from_secs(1), move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("nope".to_string())
        })
        .await;
        assert_eq!(result, Err("nope".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_zero_attempts_still_runs_once() {
        let calls = &AtomicU32::new(0);
        let _: Result<(), String> = retry(0, Duration::from_secs(1), move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("nope".to_string())
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_conditional_stops_on_permanent_error() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), String> = retry_conditional(
            10,
            Duration::from_secs(1),
            |e: &String| e.contains("exit code 32"),
            move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n == 1 {
                    Err("mount: resource busy, exit code 32".to_string())
                } else {
                    Err("mount: wrong fs type, exit code 1".to_string())
                }
            },
        )
        .await;
        assert_eq!(result, Err("mount: wrong fs type, exit code 1".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
