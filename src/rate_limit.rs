//! Rate limiting of failed authentication
//!
//! This module keeps brute-force attempts against the long-term credential
//! mechanism in check:
//! - Tracks failed authentications per source IP address
//! - Implements sliding window counting
//! - Blacklists sources that exceed the limit
//! - Exempts whitelisted networks
//! - Collects rate limiting statistics

use crate::config::RateLimitConfig;
use crate::error::{Error, Result};
use ipnetwork::IpNetwork;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Statistics about rate limiting behavior
#[derive(Debug)]
pub struct RateLimitStats {
    /// Total number of IP addresses being tracked
    pub total_tracked_ips: usize,

    /// Number of currently blacklisted IPs
    pub blacklisted_ips: usize,

    /// Total number of failures inside the window
    pub total_failures: u64,
}

/// Rate limiter for failed authentication attempts
pub struct RateLimiter {
    /// Maps IP addresses to their recent failures
    failures: RwLock<HashMap<IpAddr, Vec<Instant>>>,

    /// Maps blacklisted IPs to their expiration time
    blacklist: RwLock<HashMap<IpAddr, Instant>>,

    /// Networks never blacklisted
    whitelist: Vec<IpNetwork>,

    /// Failures allowed within the window
    max_failures: usize,

    /// Time window for counting
    window: Duration,

    /// How long a source stays blacklisted
    blacklist_duration: Duration,
}

impl RateLimiter {
    /// Creates a new rate limiter
    ///
    /// # Arguments
    /// * `max_failures` - Failures within the window that trigger a blacklist
    /// * `window` - Time window for counting
    /// * `blacklist_duration` - How long to blacklist offending sources
    pub fn new(max_failures: usize, window: Duration, blacklist_duration: Duration) -> Self {
        Self {
            failures: RwLock::new(HashMap::new()),
            blacklist: RwLock::new(HashMap::new()),
            whitelist: Vec::new(),
            max_failures,
            window,
            blacklist_duration,
        }
    }

    /// Creates a rate limiter from configuration, parsing the whitelist
    pub fn from_config(config: &RateLimitConfig) -> Result<Self> {
        let whitelist = config
            .whitelist
            .iter()
            .map(|net| {
                net.parse::<IpNetwork>()
                    .map_err(|e| Error::Config(format!("invalid whitelist entry {}: {}", net, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut limiter = Self::new(
            config.max_auth_failures,
            config.window,
            config.blacklist_duration,
        );
        limiter.whitelist = whitelist;
        Ok(limiter)
    }

    fn is_whitelisted(&self, addr: IpAddr) -> bool {
        self.whitelist.iter().any(|net| net.contains(addr))
    }

    /// Records a failed authentication from `addr`
    ///
    /// # Returns
    /// * `true` if the source is now blacklisted
    /// * `false` otherwise
    pub async fn record_failure(&self, addr: IpAddr) -> bool {
        if self.is_whitelisted(addr) {
            return false;
        }

        let mut failures = self.failures.write().await;
        let now = Instant::now();

        let history = failures.entry(addr).or_default();
        history.retain(|&time| now.duration_since(time) <= self.window);
        history.push(now);

        if history.len() < self.max_failures {
            return false;
        }

        log::warn!(
            "Blacklisting {} after {} failed authentications in {:?}",
            addr,
            history.len(),
            self.window
        );
        history.clear();

        let mut blacklist = self.blacklist.write().await;
        blacklist.insert(addr, now + self.blacklist_duration);
        true
    }

    /// Removes expired rate limit data
    pub async fn cleanup(&self) {
        let mut failures = self.failures.write().await;
        let mut blacklist = self.blacklist.write().await;
        let now = Instant::now();

        failures.retain(|_, history| {
            history.retain(|&time| now.duration_since(time) <= self.window);
            !history.is_empty()
        });

        blacklist.retain(|_, expiry| now < *expiry);
    }

    /// Checks if an IP address is blacklisted
    ///
    /// # Arguments
    /// * `addr` - The IP address to check
    pub async fn is_blacklisted(&self, addr: IpAddr) -> bool {
        let blacklist = self.blacklist.read().await;
        match blacklist.get(&addr) {
            Some(expiry) => Instant::now() < *expiry,
            None => false,
        }
    }

    /// Gets current rate limiting statistics
    pub async fn get_stats(&self) -> RateLimitStats {
        let failures = self.failures.read().await;
        let blacklist = self.blacklist.read().await;

        RateLimitStats {
            total_tracked_ips: failures.len(),
            blacklisted_ips: blacklist.len(),
            total_failures: failures.values().map(|v| v.len() as u64).sum(),
        }
    }
}
