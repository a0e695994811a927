//! Token bucket throttling in bytes per second

use super::TunnelError;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::fmt;
use std::num::NonZeroU32;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Byte-rate limiter shared by the directions of one relay
pub struct Throttle {
    limiter: DirectLimiter,
    burst: NonZeroU32,
}

impl Throttle {
    /// Create a throttle of `rate` bytes/s with a burst of `burst` bytes
    ///
    /// A zero burst falls back to the rate.
    pub fn new(rate: u64, burst: u64) -> Result<Self, TunnelError> {
        let invalid = || TunnelError::InvalidThrottle { rate, burst };

        let rate_nz = NonZeroU32::new(clamp(rate)).ok_or_else(invalid)?;
        let burst_nz = NonZeroU32::new(clamp(if burst == 0 { rate } else { burst }))
            .ok_or_else(invalid)?;

        let quota = Quota::per_second(rate_nz).allow_burst(burst_nz);
        Ok(Self {
            limiter: RateLimiter::direct(quota),
            burst: burst_nz,
        })
    }

    /// Burst size in bytes; no single wait may ask for more
    pub fn burst(&self) -> usize {
        self.burst.get() as usize
    }

    /// Wait until `n` bytes may pass
    pub async fn consume(&self, n: usize) {
        let mut remaining = n;
        while remaining > 0 {
            let step = remaining.min(self.burst());
            if let Some(step_nz) = NonZeroU32::new(step as u32) {
                // step never exceeds the burst, so capacity is always sufficient
                let _ = self.limiter.until_n_ready(step_nz).await;
            }
            remaining -= step;
        }
    }
}

impl fmt::Debug for Throttle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Throttle")
            .field("burst", &self.burst)
            .finish_non_exhaustive()
    }
}

fn clamp(v: u64) -> u32 {
    v.min(u32::MAX as u64) as u32
}
