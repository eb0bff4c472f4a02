//! Per-remote-IP token buckets, one registry per `IngressPath`. Buckets are
//! created lazily and never proactively evicted; a long-lived ingress with a
//! huge number of distinct client IPs will grow this map, which is an
//! accepted tradeoff against the added complexity of an eviction sweep.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Instant;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    buckets: Mutex<HashMap<IpAddr, Bucket>>,
}

impl RateLimiter {
    pub fn new(requests_per_second: f64, burst: u32) -> Self {
        RateLimiter {
            capacity: burst.max(1) as f64,
            refill_per_sec: requests_per_second.max(0.0),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true if the request is allowed, consuming one token.
    pub fn allow(&self, remote: IpAddr) -> bool {
        let mut buckets = self.buckets.lock().unwrap();
        let now = Instant::now();
        let bucket = buckets.entry(remote).or_insert_with(|| Bucket { tokens: self.capacity, last_refill: now });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_burst_then_rejects() {
        let limiter = RateLimiter::new(0.0, 2);
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        assert!(limiter.allow(ip));
        assert!(limiter.allow(ip));
        assert!(!limiter.allow(ip));
    }

    #[test]
    fn separate_ips_get_separate_buckets() {
        let limiter = RateLimiter::new(0.0, 1);
        assert!(limiter.allow("10.0.0.1".parse().unwrap()));
        assert!(limiter.allow("10.0.0.2".parse().unwrap()));
    }
}
