//! Sliding 60-second-window rate limiter (C3).

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60);

struct Window {
    timestamps: VecDeque<Instant>,
    cap: usize,
}

impl Window {
    fn new(cap: usize) -> Self {
        Window {
            timestamps: VecDeque::new(),
            cap,
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&front) = self.timestamps.front() {
            if now.duration_since(front) > WINDOW {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    fn at_cap(&self) -> bool {
        self.cap > 0 && self.timestamps.len() >= self.cap
    }

    fn retry_after(&self, now: Instant) -> u64 {
        match self.timestamps.front() {
            Some(&oldest) => WINDOW.saturating_sub(now.duration_since(oldest)).as_secs().max(1),
            None => 1,
        }
    }
}

struct PerTool {
    global: Window,
    by_tool: std::collections::HashMap<String, Window>,
    per_tool_cap: usize,
}

pub struct RateLimiter {
    inner: Mutex<PerTool>,
}

pub struct RateDecision {
    pub allowed: bool,
    pub retry_after_sec: u64,
}

impl RateLimiter {
    pub fn new(global_per_minute: usize, per_tool_per_minute: usize) -> Self {
        RateLimiter {
            inner: Mutex::new(PerTool {
                global: Window::new(global_per_minute),
                by_tool: std::collections::HashMap::new(),
                per_tool_cap: per_tool_per_minute,
            }),
        }
    }

    pub fn check(&self, tool: &str) -> RateDecision {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        inner.global.prune(now);
        let per_tool_cap = inner.per_tool_cap;
        let tool_window = inner
            .by_tool
            .entry(tool.to_string())
            .or_insert_with(|| Window::new(per_tool_cap));
        tool_window.prune(now);

        if inner.global.at_cap() {
            return RateDecision {
                allowed: false,
                retry_after_sec: inner.global.retry_after(now),
            };
        }
        let tool_window = inner.by_tool.get(tool).unwrap();
        if tool_window.at_cap() {
            return RateDecision {
                allowed: false,
                retry_after_sec: tool_window.retry_after(now),
            };
        }

        inner.global.timestamps.push_back(now);
        inner.by_tool.get_mut(tool).unwrap().timestamps.push_back(now);
        RateDecision {
            allowed: true,
            retry_after_sec: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_per_tool_cap_then_denies() {
        let limiter = RateLimiter::new(100, 2);
        assert!(limiter.check("t1").allowed);
        assert!(limiter.check("t1").allowed);
        let denied = limiter.check("t1");
        assert!(!denied.allowed);
        assert!(denied.retry_after_sec >= 1);
    }

    #[test]
    fn global_cap_applies_across_tools() {
        let limiter = RateLimiter::new(1, 100);
        assert!(limiter.check("a").allowed);
        assert!(!limiter.check("b").allowed);
    }

    #[test]
    fn separate_tools_have_independent_windows() {
        let limiter = RateLimiter::new(100, 1);
        assert!(limiter.check("a").allowed);
        assert!(limiter.check("b").allowed);
    }
}
