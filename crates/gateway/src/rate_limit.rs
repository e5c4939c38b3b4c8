use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Sliding-window request limiter, keyed by caller-chosen strings (an IMEI
/// on the telemetry path, a tenant id on command creation). A limit of 0
/// disables the check for that key.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Mutex<HashMap<String, VecDeque<Instant>>>>,
    window: Duration,
    max_keys: usize,
}

impl RateLimiter {
    pub fn new(window: Duration, max_keys: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            window,
            max_keys,
        }
    }

    pub fn allow(&self, key: &str, limit: u32) -> bool {
        if limit == 0 {
            return true;
        }

        let now = Instant::now();
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let hits = inner.entry(key.to_string()).or_default();
        drop_expired(hits, now, self.window);
        if hits.len() >= limit as usize {
            return false;
        }
        hits.push_back(now);

        // Keep the map bounded: devices come and go, keys must not pile up.
        if inner.len() > self.max_keys {
            inner.retain(|_, hits| {
                drop_expired(hits, now, self.window);
                !hits.is_empty()
            });
            let overflow = inner.len().saturating_sub(self.max_keys);
            if overflow > 0 {
                let stale: Vec<String> = inner
                    .keys()
                    .filter(|k| k.as_str() != key)
                    .take(overflow)
                    .cloned()
                    .collect();
                for key in stale {
                    inner.remove(&key);
                }
            }
        }

        true
    }
}

fn drop_expired(hits: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(front) = hits.front() {
        if now.duration_since(*front) > window {
            hits.pop_front();
        } else {
            break;
        }
    }
}
