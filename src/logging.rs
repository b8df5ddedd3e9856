use std::collections::HashMap;
use std::hash::Hash as StdHash;
use tokio::time::{Duration, Instant};

fn shorten(value: &str, head: usize, tail: usize) -> String {
    if value.len() <= head + tail {
        return value.to_string();
    }
    format!("{}..{}", &value[..head], &value[value.len() - tail..])
}

/// Short form of a long hex id for log lines.
pub fn redact_hex(value: &str) -> String {
    shorten(value, 8, 8)
}

#[derive(Debug, Clone, Copy)]
struct ThrottleState {
    last: Instant,
    suppressed: u64,
}

/// Rate limit for warnings that repeat on every retry (e.g. an offline source peer).
///
/// Owned by whoever emits the warning; no global state.
#[derive(Debug)]
pub struct WarnThrottle<K> {
    interval: Duration,
    by_key: HashMap<K, ThrottleState>,
}

impl<K: Eq + StdHash> WarnThrottle<K> {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            by_key: HashMap::new(),
        }
    }

    /// `Some(suppressed)` when the caller may log now, with the count of skipped warnings since
    /// the last one; `None` while throttled.
    pub fn allow(&mut self, key: K, now: Instant) -> Option<u64> {
        match self.by_key.get_mut(&key) {
            Some(state) => {
                if now.saturating_duration_since(state.last) < self.interval {
                    state.suppressed = state.suppressed.saturating_add(1);
                    return None;
                }
                let suppressed = state.suppressed;
                state.last = now;
                state.suppressed = 0;
                Some(suppressed)
            }
            None => {
                self.by_key.insert(
                    key,
                    ThrottleState {
                        last: now,
                        suppressed: 0,
                    },
                );
                Some(0)
            }
        }
    }

    pub fn forget(&mut self, key: &K) {
        self.by_key.remove(key);
    }
}
