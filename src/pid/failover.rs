//! Ordered dispatcher URL list with per-URL retry and wrap-around.

#[derive(Debug, Clone)]
pub struct FailoverCursor {
    urls: Vec<String>,
    index: usize,
    tries: u32,
    retry: u32,
}

impl FailoverCursor {
    pub fn new(urls: Vec<String>, retry: u32) -> Self {
        Self {
            urls,
            index: 0,
            tries: 1,
            retry: retry.max(1),
        }
    }

    /// URL for the next connection attempt.
    pub fn current(&self) -> &str {
        self.urls.get(self.index).map(String::as_str).unwrap_or_default()
    }

    pub fn primary(&self) -> &str {
        self.urls.first().map(String::as_str).unwrap_or_default()
    }

    pub fn is_primary(&self) -> bool {
        self.index == 0
    }

    /// Record a failed or dropped session: retry the same URL until it has
    /// been tried `retry` times, then move on to the next one (wrapping).
    pub fn on_failure(&mut self) {
        if self.tries < self.retry {
            self.tries += 1;
            return;
        }
        self.tries = 1;
        if !self.urls.is_empty() {
            self.index = (self.index + 1) % self.urls.len();
        }
    }

    /// Jump back to the primary URL with a fresh retry count.
    pub fn on_primary_recovered(&mut self) {
        self.index = 0;
        self.tries = 1;
    }
}

// ─── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn cursor() -> FailoverCursor {
        FailoverCursor::new(vec!["ws://a".to_string(), "ws://b".to_string()], 2)
    }

    #[test]
    fn test_two_failures_move_to_next_url() {
        let mut c = cursor();
        assert_eq!(c.current(), "ws://a");
        c.on_failure();
        assert_eq!(c.current(), "ws://a");
        c.on_failure();
        assert_eq!(c.current(), "ws://b");
        assert!(!c.is_primary());
    }

    #[test]
    fn test_wraps_to_first_url() {
        let mut c = cursor();
        for _ in 0..4 {
            c.on_failure();
        }
        assert_eq!(c.current(), "ws://a");
    }

    #[test]
    fn test_primary_recovered_resets_from_any_position() {
        let mut c = cursor();
        c.on_failure();
        c.on_failure();
        c.on_failure();
        assert_eq!(c.current(), "ws://b");

        c.on_primary_recovered();
        assert_eq!(c.current(), "ws://a");
        assert!(c.is_primary());
        // retry counter restarted too
        c.on_failure();
        assert_eq!(c.current(), "ws://a");
    }
}
