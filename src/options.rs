//! Configuration for responders and queriers.
//!
//! Everything is a chained setter on [`Options`]; nothing reads the
//! environment. The defaults are what RFC 6762 deployments want: a one
//! second collection window, automatic interface selection, and the rate
//! limiter on.

use std::time::Duration;

use get_if_addrs::Interface;

use crate::error::Result;
use crate::ifaces::{self, InterfaceFilter};
use crate::ratelimit::{RateLimiter, DEFAULT_COOLDOWN, DEFAULT_THRESHOLD};

#[derive(Clone)]
pub struct Options {
    pub(crate) timeout: Duration,
    pub(crate) interfaces: Option<Vec<String>>,
    pub(crate) interface_filter: Option<InterfaceFilter>,
    pub(crate) rate_limit: bool,
    pub(crate) rate_limit_threshold: u32,
    pub(crate) rate_limit_cooldown: Duration,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            timeout: Duration::from_secs(1),
            interfaces: None,
            interface_filter: None,
            rate_limit: true,
            rate_limit_threshold: DEFAULT_THRESHOLD,
            rate_limit_cooldown: DEFAULT_COOLDOWN,
        }
    }
}

impl Options {
    pub fn new() -> Options {
        Options::default()
    }

    /// Querier collection window. Expiry returns what arrived; it is not
    /// an error.
    pub fn with_timeout(mut self, timeout: Duration) -> Options {
        self.timeout = timeout;
        self
    }

    /// Pin an explicit interface list by name. Takes precedence over
    /// [`with_interface_filter`](Options::with_interface_filter).
    pub fn with_interfaces(mut self, interfaces: Vec<String>) -> Options {
        self.interfaces = Some(interfaces);
        self
    }

    /// Custom interface predicate; ignored when an explicit list is set.
    pub fn with_interface_filter<F>(mut self, filter: F) -> Options
    where
        F: Fn(&Interface) -> bool + Send + Sync + 'static,
    {
        self.interface_filter = Some(std::sync::Arc::new(filter));
        self
    }

    /// Per-source receive rate limiting. On by default; turning it off is
    /// for tests.
    pub fn with_rate_limit(mut self, enabled: bool) -> Options {
        self.rate_limit = enabled;
        self
    }

    /// Queries per second tolerated from one source (default 100).
    pub fn with_rate_limit_threshold(mut self, threshold: u32) -> Options {
        self.rate_limit_threshold = threshold;
        self
    }

    /// Cooldown once a source exceeds the threshold (default 60 s).
    pub fn with_rate_limit_cooldown(mut self, cooldown: Duration) -> Options {
        self.rate_limit_cooldown = cooldown;
        self
    }

    pub(crate) fn limiter(&self) -> RateLimiter {
        RateLimiter::new(
            self.rate_limit,
            self.rate_limit_threshold,
            self.rate_limit_cooldown,
        )
    }

    pub(crate) fn select_interfaces(&self) -> Result<Vec<Interface>> {
        ifaces::select(
            self.interfaces.as_ref().map(|v| v.as_slice()),
            self.interface_filter.as_ref(),
        )
    }
}
