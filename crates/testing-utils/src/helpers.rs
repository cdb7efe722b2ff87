//! Test helper utilities

use std::time::Duration;
use tokio::time::sleep;

pub struct TestEnv;

impl TestEnv {
    /// Wait for a condition to be true with timeout
    pub async fn wait_for<F, Fut>(mut condition: F, timeout: Duration) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        Self::wait_for_with_interval(&mut condition, timeout, Duration::from_millis(10)).await
    }

    /// Wait for a condition with a custom poll interval
    pub async fn wait_for_with_interval<F, Fut>(
        mut condition: F,
        timeout: Duration,
        poll_interval: Duration,
    ) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let start = std::time::Instant::now();

        loop {
            if condition().await {
                return true;
            }
            if start.elapsed() >= timeout {
                return false;
            }
            sleep(poll_interval).await;
        }
    }

    /// 生成带前缀的唯一ID
    pub fn unique_id(prefix: &str) -> String {
        format!("{}-{}", prefix, &uuid::Uuid::new_v4().to_string()[..8])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_wait_for_eventually_true() {
        let counter = AtomicUsize::new(0);
        let ok = TestEnv::wait_for(
            || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move { n >= 3 }
            },
            Duration::from_secs(1),
        )
        .await;
        assert!(ok);
    }

    #[tokio::test]
    async fn test_wait_for_times_out() {
        let ok = TestEnv::wait_for(|| async { false }, Duration::from_millis(30)).await;
        assert!(!ok);
    }

    #[test]
    fn test_unique_id() {
        let a = TestEnv::unique_id("sb");
        let b = TestEnv::unique_id("sb");
        assert!(a.starts_with("sb-"));
        assert_ne!(a, b);
    }
}
