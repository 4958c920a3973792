use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

const MAX_DOUBLINGS: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// Fraction of the exponential delay added as random jitter, `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(10),
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    fn normalized(self) -> Self {
        let jitter = if self.jitter.is_finite() {
            self.jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            base: self.base,
            cap: self.cap.max(self.base),
            jitter,
        }
    }
}

/// Exponential reconnect delays with jitter.
///
/// Successive delays never shrink and never exceed `cap` until [`reset`]
/// is called.
///
/// [`reset`]: Backoff::reset
#[derive(Debug, Clone)]
pub struct Backoff<R = StdRng> {
    policy: BackoffPolicy,
    attempt: u32,
    last: Duration,
    rng: R,
}

impl Backoff<StdRng> {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self::with_rng(policy, StdRng::from_entropy())
    }

    pub fn seeded(policy: BackoffPolicy, seed: u64) -> Self {
        Self::with_rng(policy, StdRng::seed_from_u64(seed))
    }
}

impl<R: Rng> Backoff<R> {
    pub fn with_rng(policy: BackoffPolicy, rng: R) -> Self {
        Self {
            policy: policy.normalized(),
            attempt: 0,
            last: Duration::ZERO,
            rng,
        }
    }

    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }

    /// Attempts taken since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn next_delay(&mut self) -> Duration {
        let doublings = self.attempt.min(MAX_DOUBLINGS);
        let exponential = self
            .policy
            .base
            .saturating_mul(1u32 << doublings)
            .min(self.policy.cap);
        let span = exponential.mul_f64(self.policy.jitter);
        let jitter = if span.is_zero() {
            Duration::ZERO
        } else {
            span.mul_f64(self.rng.gen::<f64>())
        };
        let delay = exponential
            .saturating_add(jitter)
            .min(self.policy.cap)
            .max(self.last);
        self.last = delay;
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.last = Duration::ZERO;
    }
}
