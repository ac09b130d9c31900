//! Client-side request window.
//!
//! ProjectX allows a fixed number of requests per sliding window. The
//! window tracks recent request times and makes callers wait once only a
//! small headroom is left, so bursts from several actors never hit 429.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;

pub struct RequestWindow {
    max_requests: u32,
    window: Duration,
    /// Requests kept in reserve; acquisition waits once only this many remain
    headroom: u32,
    timestamps: Mutex<VecDeque<Instant>>,
}

impl RequestWindow {
    pub fn new(max_requests: u32, window: Duration, headroom: u32) -> Self {
        Self {
            max_requests,
            window,
            headroom: headroom.min(max_requests.saturating_sub(1)),
            timestamps: Mutex::new(VecDeque::with_capacity(max_requests as usize)),
        }
    }

    fn prune(&self, timestamps: &mut VecDeque<Instant>, now: Instant) {
        while timestamps
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= self.window)
        {
            timestamps.pop_front();
        }
    }

    /// Requests left in the current window.
    pub async fn remaining(&self) -> u32 {
        let mut timestamps = self.timestamps.lock().await;
        self.prune(&mut timestamps, Instant::now());
        self.max_requests.saturating_sub(timestamps.len() as u32)
    }

    /// Wait until a request may be sent, then record it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut timestamps = self.timestamps.lock().await;
                let now = Instant::now();
                self.prune(&mut timestamps, now);

                let remaining = self.max_requests.saturating_sub(timestamps.len() as u32);
                if remaining > self.headroom {
                    timestamps.push_back(now);
                    return;
                }
                match timestamps.front() {
                    Some(oldest) => (*oldest + self.window).saturating_duration_since(now),
                    None => Duration::ZERO,
                }
            };
            warn!(wait_ms = wait.as_millis() as u64, "Request window nearly exhausted, pausing");
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_pauses_when_headroom_reached() {
        let window = RequestWindow::new(10, Duration::from_secs(60), 5);

        for _ in 0..5 {
            window.acquire().await;
        }
        assert_eq!(window.remaining().await, 5);

        let start = Instant::now();
        window.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(60));
        assert_eq!(window.remaining().await, 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_slides() {
        let window = RequestWindow::new(3, Duration::from_secs(10), 0);
        window.acquire().await;
        tokio::time::advance(Duration::from_secs(5)).await;
        window.acquire().await;
        window.acquire().await;
        assert_eq!(window.remaining().await, 0);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(window.remaining().await, 1);
    }
}
