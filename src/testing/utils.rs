//! Small async test helpers.

use std::time::{Duration, Instant};

/// Repeat `action` until `predicate` accepts its result or `timeout`
/// elapses. Returns the accepted result, or `None` on timeout.
pub async fn wait_for_result<F, Fut, T, P>(
    mut action: F,
    predicate: P,
    timeout: Duration,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = T>,
    P: Fn(&T) -> bool,
{
    let start = Instant::now();
    let interval = Duration::from_millis(50);

    while start.elapsed() < timeout {
        let result = action().await;
        if predicate(&result) {
            return Some(result);
        }
        tokio::time::sleep(interval).await;
    }
    None
}
