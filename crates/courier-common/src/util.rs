use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Calls `f` up to `times` times until it yields a value, sleeping `delay`
/// between attempts.
pub async fn retry<T, F, Fut>(mut f: F, times: usize, delay: Duration) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    for attempt in 0..times {
        if let Some(value) = f().await {
            return Some(value);
        }
        if attempt + 1 < times {
            tokio::time::sleep(delay).await;
        }
    }
    None
}

/// Normalizes a registry directory path: one leading `/`, no trailing `/`.
pub fn normalize_dir_path(path: &str) -> String {
    let trimmed = path.strip_suffix('/').unwrap_or(path);
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

/// Milliseconds since the unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
