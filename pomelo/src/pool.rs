use std::time::Duration;

use pomelo_proto::ServerAddr;
use rand::{seq::SliceRandom as _, Rng as _};

/// The rotation of broker addresses the supervisor cycles through
///
/// Seeds keep their configured order; addresses discovered through
/// `INFO.connect_urls` are appended in shuffled order and deduplicated
/// against everything already known.
#[derive(Debug)]
pub(crate) struct ServerPool {
    addrs: Vec<ServerAddr>,
    cursor: usize,
}

impl ServerPool {
    pub(crate) fn new(seeds: Vec<ServerAddr>) -> Self {
        debug_assert!(!seeds.is_empty());
        Self {
            addrs: seeds,
            cursor: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.addrs.len()
    }

    /// The next address in the rotation
    pub(crate) fn next(&mut self) -> ServerAddr {
        let addr = self.addrs[self.cursor % self.addrs.len()].clone();
        self.cursor = (self.cursor + 1) % self.addrs.len();
        addr
    }

    /// Merge discovered addresses into the rotation
    pub(crate) fn merge_discovered(&mut self, discovered: &[ServerAddr]) {
        let mut fresh = discovered
            .iter()
            .filter(|addr| !self.addrs.contains(addr))
            .cloned()
            .collect::<Vec<_>>();
        fresh.shuffle(&mut rand::thread_rng());
        self.addrs.extend(fresh);
    }
}

/// Randomized exponential backoff for reconnect attempts
#[derive(Debug)]
pub(crate) struct Backoff {
    min: Duration,
    max: Duration,
    jitter: Duration,
    exponent: u32,
}

impl Backoff {
    pub(crate) fn new(min: Duration, max: Duration, jitter: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            jitter,
            exponent: 0,
        }
    }

    /// The delay to sleep before the next attempt
    pub(crate) fn next_delay(&mut self) -> Duration {
        let base = self
            .min
            .saturating_mul(2u32.saturating_pow(self.exponent))
            .min(self.max);
        self.exponent = self.exponent.saturating_add(1);

        let jitter_nanos = u64::try_from(self.jitter.as_nanos()).unwrap_or(u64::MAX);
        let jitter = if jitter_nanos == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(rand::thread_rng().gen_range(0..=jitter_nanos))
        };

        base.saturating_add(jitter).min(self.max.saturating_add(self.jitter))
    }
}
