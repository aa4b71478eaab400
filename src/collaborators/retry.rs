use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryPolicy {
    pub(crate) max_retries: usize,
    pub(crate) base_delay: Duration,
    pub(crate) max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub(crate) fn should_retry(&self, attempt: usize, status: StatusCode, body: &str) -> bool {
        attempt < self.max_retries && is_rate_limited(status, body)
    }

    /// Sleeps before the next attempt and returns the delay to use after it.
    pub(crate) async fn wait(
        &self,
        service: &str,
        attempt: usize,
        delay: Duration,
        headers: &HeaderMap,
    ) -> Duration {
        let mut wait = delay;
        if let Some(hint) = retry_after(headers)
            && hint > wait
        {
            wait = hint.min(self.max_delay);
        }
        warn!(
            "{}: rate limited; retrying in {:.1}s (attempt {}/{})",
            service,
            wait.as_secs_f32(),
            attempt + 1,
            self.max_retries
        );
        sleep(wait).await;
        self.next_delay(delay)
    }

    pub(crate) fn next_delay(&self, current: Duration) -> Duration {
        current
            .saturating_mul(2)
            .max(self.base_delay)
            .min(self.max_delay)
    }
}

fn is_rate_limited(status: StatusCode, body: &str) -> bool {
    if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE {
        return true;
    }
    let lower = body.to_lowercase();
    lower.contains("rate limit") || lower.contains("rate_limit") || lower.contains("overloaded")
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get("retry-after")?.to_str().ok()?.trim();
    value.parse::<u64>().ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_up_to_cap() {
        let policy = RetryPolicy::default();
        let mut delay = policy.base_delay;
        let mut seen = Vec::new();
        for _ in 0..6 {
            delay = policy.next_delay(delay);
            seen.push(delay.as_secs());
        }
        assert_eq!(seen, vec![4, 8, 16, 30, 30, 30]);
    }

    #[test]
    fn only_rate_limits_are_retried() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(0, StatusCode::TOO_MANY_REQUESTS, ""));
        assert!(policy.should_retry(1, StatusCode::BAD_REQUEST, "Rate limit exceeded"));
        assert!(!policy.should_retry(0, StatusCode::UNAUTHORIZED, "bad key"));
        assert!(!policy.should_retry(4, StatusCode::TOO_MANY_REQUESTS, ""));
    }

    #[test]
    fn retry_after_header_is_parsed() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", "7".parse().expect("header"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(7)));
    }
}
