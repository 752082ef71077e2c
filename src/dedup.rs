use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Debug)]
struct RecentRequest {
    last_seen: Instant,
    in_flight: u32,
}

/// Coalesces identical request bodies arriving within a short window.
/// Entries linger for twice the window after their last sighting so repeats
/// just past the window edge are still recognized as duplicates.
pub struct RequestDeduplicator {
    window: Duration,
    entries: Mutex<HashMap<String, RecentRequest>>,
}

pub fn request_fingerprint(method: &str, path: &str, authorization: &str, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.as_bytes());
    hasher.update([0u8]);
    hasher.update(path.as_bytes());
    hasher.update([0u8]);
    hasher.update(authorization.as_bytes());
    hasher.update([0u8]);
    hasher.update(body);
    hex::encode(hasher.finalize())
}

impl RequestDeduplicator {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Registers an arrival. Returns `(duplicate, in_flight)`:
    /// first sighting → (false, false); a repeat within the window with a
    /// live holder → (true, true); a repeat of a finished request → (true, false).
    pub async fn register(&self, fingerprint: &str) -> (bool, bool) {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match entries.get_mut(fingerprint) {
            Some(entry) if now.duration_since(entry.last_seen) <= self.window => {
                entry.last_seen = now;
                if entry.in_flight > 0 {
                    // Caller is expected to reject; it takes no holder slot.
                    (true, true)
                } else {
                    entry.in_flight += 1;
                    (true, false)
                }
            }
            Some(entry) => {
                entry.last_seen = now;
                entry.in_flight += 1;
                (false, false)
            }
            None => {
                entries.insert(
                    fingerprint.to_string(),
                    RecentRequest {
                        last_seen: now,
                        in_flight: 1,
                    },
                );
                (false, false)
            }
        }
    }

    pub async fn finish(&self, fingerprint: &str) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(fingerprint) {
            entry.in_flight = entry.in_flight.saturating_sub(1);
        }
    }

    /// Drops entries idle past twice the window with no in-flight holders.
    pub async fn sweep(&self) {
        let cutoff = self.window * 2;
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, entry| {
            entry.in_flight > 0 || now.duration_since(entry.last_seen) <= cutoff
        });
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}
