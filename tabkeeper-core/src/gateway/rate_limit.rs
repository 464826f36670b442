//! Fixed-window rate limiter keyed by caller identity.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Clone)]
pub struct FixedWindowLimiter {
    windows: Arc<Mutex<HashMap<String, Window>>>,
    max_requests: u32,
    window_ms: i64,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started_at: i64,
    count: u32,
}

/// Request refused until the current window elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limited {
    pub retry_after_ms: i64,
}

impl FixedWindowLimiter {
    pub fn new(max_requests: u32, window_ms: i64) -> Self {
        Self {
            windows: Arc::new(Mutex::new(HashMap::new())),
            max_requests,
            window_ms,
        }
    }

    /// Count a request from `key` at `now_ms`.
    ///
    /// Returns the request's position in the current window. Once a window
    /// has elapsed it is replaced entirely, so the next request counts as 1.
    /// Rejected requests are not counted.
    pub fn check(&self, key: &str, now_ms: i64) -> Result<u32, Limited> {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());

        let window = windows.entry(key.to_string()).or_insert(Window {
            started_at: now_ms,
            count: 0,
        });

        if now_ms - window.started_at >= self.window_ms {
            *window = Window {
                started_at: now_ms,
                count: 0,
            };
        }

        if window.count >= self.max_requests {
            return Err(Limited {
                retry_after_ms: (window.started_at + self.window_ms - now_ms).max(0),
            });
        }

        window.count += 1;
        Ok(window.count)
    }

    /// Drop windows that have fully elapsed. Returns how many were removed.
    pub fn sweep(&self, now_ms: i64) -> usize {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let before = windows.len();
        windows.retain(|_, w| now_ms - w.started_at < self.window_ms);
        before - windows.len()
    }

    pub fn tracked(&self) -> usize {
        self.windows.lock().map(|w| w.len()).unwrap_or(0)
    }
}
