//! Invalid-envelope bookkeeping per peer address

use crate::protocol::ABUSE_CACHE_CAPACITY;
use lru::LruCache;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Bounded LRU map of peer address to invalid request count
#[derive(Debug)]
pub struct AbuseTracker {
    cache: Mutex<LruCache<IpAddr, u64>>,
}

impl AbuseTracker {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Record one hit for `addr` and return its count
    pub fn add(&self, addr: IpAddr) -> u64 {
        let mut cache = self.lock();
        match cache.get_mut(&addr) {
            Some(hits) => {
                *hits += 1;
                *hits
            }
            None => {
                cache.put(addr, 1);
                1
            }
        }
    }

    /// Hits recorded for `addr`, without refreshing its recency
    pub fn hits(&self, addr: IpAddr) -> u64 {
        self.lock().peek(&addr).copied().unwrap_or(0)
    }

    /// Whether `addr` has more than `threshold` hits
    pub fn exceeds(&self, addr: IpAddr, threshold: u64) -> bool {
        self.hits(addr) > threshold
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<IpAddr, u64>> {
        // Counters stay usable even if a holder panicked
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for AbuseTracker {
    fn default() -> Self {
        let capacity = NonZeroUsize::new(ABUSE_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self::new(capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    fn ip(n: u32) -> IpAddr {
        IpAddr::V4(Ipv4Addr::from(0x0a00_0000 + n))
    }

    #[test]
    fn test_add_counts_hits() {
        let tracker = AbuseTracker::default();
        assert_eq!(tracker.hits(ip(1)), 0);
        assert_eq!(tracker.add(ip(1)), 1);
        assert_eq!(tracker.add(ip(1)), 2);
        assert_eq!(tracker.hits(ip(1)), 2);
        assert!(tracker.exceeds(ip(1), 1));
        assert!(!tracker.exceeds(ip(1), 2));
    }

    #[test]
    fn test_129th_address_evicts_least_recent() {
        let tracker = AbuseTracker::default();
        for n in 0..ABUSE_CACHE_CAPACITY as u32 {
            tracker.add(ip(n));
        }
        assert_eq!(tracker.len(), ABUSE_CACHE_CAPACITY);

        // Touch the oldest entry so the second oldest becomes the victim
        tracker.add(ip(0));
        tracker.add(ip(1000));

        assert_eq!(tracker.len(), ABUSE_CACHE_CAPACITY);
        assert_eq!(tracker.hits(ip(0)), 2);
        assert_eq!(tracker.hits(ip(1)), 0);
        assert_eq!(tracker.hits(ip(1000)), 1);
    }

    #[test]
    fn test_active_address_survives_churn() {
        let tracker = AbuseTracker::default();
        for n in 0..1000u32 {
            tracker.add(ip(7));
            tracker.add(ip(10_000 + n));
        }
        assert_eq!(tracker.hits(ip(7)), 1000);
        assert_eq!(tracker.len(), ABUSE_CACHE_CAPACITY);
    }

    #[test]
    fn test_concurrent_adds() {
        let tracker = Arc::new(AbuseTracker::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        tracker.add(ip(42));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(tracker.hits(ip(42)), 800);
    }
}
