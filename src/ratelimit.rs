//! Per-source rate limiting for the receive path.
//!
//! Each source IP gets a sliding one-second window; exceeding the query
//! threshold starts a cooldown during which everything from that source is
//! dropped before parsing. The table is bounded: past the entry cap the
//! oldest tenth (by last-seen) is evicted, and a periodic sweep drops
//! sources idle for over a minute.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use log::debug;

/// Default queries per second tolerated from one source.
pub const DEFAULT_THRESHOLD: u32 = 100;

/// Default cooldown once a source exceeds the threshold.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

/// Most sources tracked at once.
const MAX_ENTRIES: usize = 10_000;

/// How often the idle sweep runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Idle time after which a source is forgotten.
const IDLE_EXPIRY: Duration = Duration::from_secs(60);

const WINDOW: Duration = Duration::from_secs(1);

struct SourceState {
    window_start: Instant,
    count: u32,
    cooldown_until: Option<Instant>,
    last_seen: Instant,
}

pub struct RateLimiter {
    enabled: bool,
    threshold: u32,
    cooldown: Duration,
    entries: HashMap<IpAddr, SourceState>,
    last_sweep: Instant,
}

impl RateLimiter {
    pub fn new(enabled: bool, threshold: u32, cooldown: Duration) -> RateLimiter {
        RateLimiter {
            enabled,
            threshold,
            cooldown,
            entries: HashMap::new(),
            last_sweep: Instant::now(),
        }
    }

    /// True if a packet from `src` may proceed to the codec.
    pub fn admit(&mut self, src: IpAddr) -> bool {
        self.admit_at(src, Instant::now())
    }

    /// [`admit`](RateLimiter::admit) with an explicit clock, for tests.
    pub fn admit_at(&mut self, src: IpAddr, now: Instant) -> bool {
        if !self.enabled {
            return true;
        }

        self.maybe_sweep(now);

        if !self.entries.contains_key(&src) && self.entries.len() >= MAX_ENTRIES {
            self.evict_oldest(now);
        }

        let threshold = self.threshold;
        let cooldown = self.cooldown;
        let state = self.entries.entry(src).or_insert(SourceState {
            window_start: now,
            count: 0,
            cooldown_until: None,
            last_seen: now,
        });
        state.last_seen = now;

        if let Some(until) = state.cooldown_until {
            if now < until {
                return false;
            }
            state.cooldown_until = None;
            state.window_start = now;
            state.count = 0;
        }

        if now.duration_since(state.window_start) >= WINDOW {
            state.window_start = now;
            state.count = 0;
        }

        state.count += 1;
        if state.count > threshold {
            debug!("rate limiting {} for {:?}", src, cooldown);
            state.cooldown_until = Some(now + cooldown);
            return false;
        }
        true
    }

    fn maybe_sweep(&mut self, now: Instant) {
        if now.duration_since(self.last_sweep) < SWEEP_INTERVAL {
            return;
        }
        self.last_sweep = now;
        let before = self.entries.len();
        self.entries
            .retain(|_, state| now.duration_since(state.last_seen) <= IDLE_EXPIRY);
        let dropped = before - self.entries.len();
        if dropped > 0 {
            debug!("rate-limit sweep dropped {} idle sources", dropped);
        }
    }

    /// Drops the oldest tenth of the table by last-seen time.
    fn evict_oldest(&mut self, now: Instant) {
        let mut ages: Vec<(IpAddr, Duration)> = self
            .entries
            .iter()
            .map(|(ip, state)| (*ip, now.duration_since(state.last_seen)))
            .collect();
        ages.sort_by(|a, b| b.1.cmp(&a.1));
        let victims = (self.entries.len() / 10).max(1);
        for (ip, _) in ages.into_iter().take(victims) {
            self.entries.remove(&ip);
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, last))
    }

    #[test]
    fn admits_below_threshold() {
        let mut limiter = RateLimiter::new(true, 100, DEFAULT_COOLDOWN);
        let now = Instant::now();
        for _ in 0..100 {
            assert!(limiter.admit_at(ip(1), now));
        }
    }

    #[test]
    fn storm_triggers_cooldown_and_spares_other_sources() {
        let mut limiter = RateLimiter::new(true, 100, Duration::from_secs(60));
        let now = Instant::now();

        let mut admitted = 0;
        for _ in 0..500 {
            if limiter.admit_at(ip(200), now) {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 100);

        // Still in cooldown well after the window has rolled over.
        assert!(!limiter.admit_at(ip(200), now + Duration::from_secs(5)));

        // Unrelated sources are unaffected.
        assert!(limiter.admit_at(ip(50), now + Duration::from_secs(5)));
    }

    #[test]
    fn cooldown_expires() {
        let mut limiter = RateLimiter::new(true, 2, Duration::from_secs(60));
        let now = Instant::now();
        for _ in 0..3 {
            limiter.admit_at(ip(9), now);
        }
        assert!(!limiter.admit_at(ip(9), now + Duration::from_secs(59)));
        assert!(limiter.admit_at(ip(9), now + Duration::from_secs(61)));
    }

    #[test]
    fn window_slides() {
        let mut limiter = RateLimiter::new(true, 2, Duration::from_secs(60));
        let now = Instant::now();
        assert!(limiter.admit_at(ip(7), now));
        assert!(limiter.admit_at(ip(7), now));
        // Next second: the counter resets instead of tripping the limit.
        let later = now + Duration::from_millis(1100);
        assert!(limiter.admit_at(ip(7), later));
        assert!(limiter.admit_at(ip(7), later));
    }

    #[test]
    fn disabled_limiter_admits_everything() {
        let mut limiter = RateLimiter::new(false, 1, DEFAULT_COOLDOWN);
        let now = Instant::now();
        for _ in 0..1000 {
            assert!(limiter.admit_at(ip(3), now));
        }
        assert_eq!(limiter.tracked(), 0);
    }

    #[test]
    fn sweep_forgets_idle_sources() {
        let mut limiter = RateLimiter::new(true, 100, DEFAULT_COOLDOWN);
        let now = Instant::now();
        limiter.admit_at(ip(1), now);
        limiter.admit_at(ip(2), now);
        assert_eq!(limiter.tracked(), 2);

        // Six minutes later one source comes back; the sweep runs and
        // forgets the one idle past expiry.
        let later = now + Duration::from_secs(360);
        limiter.admit_at(ip(1), later);
        assert_eq!(limiter.tracked(), 1);
    }
}
