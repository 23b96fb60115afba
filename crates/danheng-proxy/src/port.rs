//! Listening port selection.

use std::net::{IpAddr, TcpListener};
use std::ops::{Range, RangeInclusive};

use rand::Rng;

use crate::error::{ProxyError, Result};

/// Range random ports are drawn from.
pub const EPHEMERAL_PORT_RANGE: Range<u16> = 10000..60000;

/// Number of random candidates tried before giving up.
const MAX_ATTEMPTS: usize = 32;

/// Source of a port for the proxy to listen on.
pub trait PortSource: Send + Sync + std::fmt::Debug {
    /// Returns a port that is currently free on `ip`.
    fn next_port(&self, ip: IpAddr) -> Result<u16>;
}

/// Picks random free ports from a range.
#[derive(Debug, Clone)]
pub struct RandomPortSource {
    range: RangeInclusive<u16>,
}

impl RandomPortSource {
    /// Creates a source drawing from `range`.
    pub fn new(range: Range<u16>) -> Self {
        if range.is_empty() {
            return Self::with_bounds(RangeInclusive::new(1, 0));
        }
        Self::with_bounds(range.start..=range.end - 1)
    }

    /// Creates a source drawing from `range`, both ends included.
    pub fn with_bounds(range: RangeInclusive<u16>) -> Self {
        Self { range }
    }
}

impl Default for RandomPortSource {
    fn default() -> Self {
        Self::new(EPHEMERAL_PORT_RANGE)
    }
}

impl PortSource for RandomPortSource {
    fn next_port(&self, ip: IpAddr) -> Result<u16> {
        if self.range.is_empty() {
            return Err(ProxyError::Port(format!("empty port range {:?}", self.range)));
        }

        let mut rng = rand::thread_rng();
        for _ in 0..MAX_ATTEMPTS {
            let port = rng.gen_range(self.range.clone());
            if is_free(ip, port) {
                return Ok(port);
            }
            tracing::debug!("Port {} is busy, trying another", port);
        }

        Err(ProxyError::Port(format!(
            "no free port in {:?} after {} attempts",
            self.range, MAX_ATTEMPTS
        )))
    }
}

/// Always returns the same port.
#[derive(Debug, Clone, Copy)]
pub struct FixedPortSource(pub u16);

impl PortSource for FixedPortSource {
    fn next_port(&self, _ip: IpAddr) -> Result<u16> {
        Ok(self.0)
    }
}

/// Probes a port by binding it briefly.
fn is_free(ip: IpAddr, port: u16) -> bool {
    TcpListener::bind((ip, port)).is_ok()
}
