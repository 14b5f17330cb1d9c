//! Retry delay strategies for use as part of [`crate::worker::Handler::backoff`].
//!
//! A [`Backoff`] maps the attempt that just failed to the delay before the job becomes ready
//! again. The delay curve can be constant, linear, or exponential, optionally capped and jittered.
//! All constructors and configuration functions are `const`.
//!
//! # Example
//!
//! ```
//! # use leasequeue::backoff::{Backoff, Jitter};
//! # use chrono::TimeDelta;
//! let backoff = Backoff::linear(TimeDelta::seconds(20))
//!     .with_max(TimeDelta::seconds(60))
//!     .with_jitter(Jitter::Absolute(TimeDelta::seconds(10)));
//!
//! assert!(backoff.delay(1) >= TimeDelta::seconds(10));
//! assert!(backoff.delay(1) <= TimeDelta::seconds(30));
//! // The cap applies before jitter.
//! assert!(backoff.delay(10) >= TimeDelta::seconds(50));
//! assert!(backoff.delay(10) <= TimeDelta::seconds(70));
//! ```
use chrono::TimeDelta;
use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Curve {
    Constant(TimeDelta),
    Linear(TimeDelta),
    Exponential(TimeDelta),
}

/// A random jitter applied to a computed delay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// Adds a random offset in the range `-delta..=delta`.
    Absolute(TimeDelta),
    /// Adds a random offset of up to the given proportion of the delay, in either direction.
    Relative(f64),
}

impl Jitter {
    fn apply(&self, delay: TimeDelta) -> TimeDelta {
        let bound = match self {
            Self::Absolute(delta) => delta.num_milliseconds().abs(),
            Self::Relative(ratio) => (delay.num_milliseconds() as f64 * ratio).abs().round() as i64,
        };
        if bound == 0 {
            return delay;
        }
        let offset = TimeDelta::milliseconds(rand::thread_rng().gen_range(-bound..=bound));
        delay.checked_add(&offset).unwrap_or(delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    curve: Curve,
    max: Option<TimeDelta>,
    jitter: Option<Jitter>,
}

impl Backoff {
    /// The same delay after every attempt.
    ///
    /// ```
    /// # use leasequeue::backoff::Backoff;
    /// # use chrono::TimeDelta;
    /// let backoff = Backoff::constant(TimeDelta::seconds(10));
    ///
    /// assert_eq!(backoff.delay(1), TimeDelta::seconds(10));
    /// assert_eq!(backoff.delay(7), TimeDelta::seconds(10));
    /// ```
    pub const fn constant(delay: TimeDelta) -> Self {
        Self::new(Curve::Constant(delay))
    }

    /// `step * attempt`.
    ///
    /// ```
    /// # use leasequeue::backoff::Backoff;
    /// # use chrono::TimeDelta;
    /// let backoff = Backoff::linear(TimeDelta::seconds(10)).with_max(TimeDelta::seconds(25));
    ///
    /// assert_eq!(backoff.delay(1), TimeDelta::seconds(10));
    /// assert_eq!(backoff.delay(2), TimeDelta::seconds(20));
    /// assert_eq!(backoff.delay(3), TimeDelta::seconds(25));
    /// ```
    pub const fn linear(step: TimeDelta) -> Self {
        Self::new(Curve::Linear(step))
    }

    /// `initial * 2^(attempt - 1)`. Setting a maximum with [`Backoff::with_max`] is advisable.
    ///
    /// ```
    /// # use leasequeue::backoff::Backoff;
    /// # use chrono::TimeDelta;
    /// let backoff = Backoff::exponential(TimeDelta::seconds(2)).with_max(TimeDelta::seconds(30));
    ///
    /// assert_eq!(backoff.delay(1), TimeDelta::seconds(2));
    /// assert_eq!(backoff.delay(2), TimeDelta::seconds(4));
    /// assert_eq!(backoff.delay(4), TimeDelta::seconds(16));
    /// assert_eq!(backoff.delay(5), TimeDelta::seconds(30));
    /// ```
    pub const fn exponential(initial: TimeDelta) -> Self {
        Self::new(Curve::Exponential(initial))
    }

    const fn new(curve: Curve) -> Self {
        Self {
            curve,
            max: None,
            jitter: None,
        }
    }

    /// Caps the delay before any jitter is applied.
    pub const fn with_max(mut self, max: TimeDelta) -> Self {
        self.max = Some(max);
        self
    }

    pub const fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// The delay to wait after the given attempt failed. Never negative.
    pub fn delay(&self, attempt: u32) -> TimeDelta {
        let attempt = attempt.max(1);
        let delay = match self.curve {
            Curve::Constant(delay) => delay,
            Curve::Linear(step) => {
                let millis = step
                    .num_milliseconds()
                    .saturating_mul(i64::from(attempt));
                TimeDelta::try_milliseconds(millis).unwrap_or(TimeDelta::MAX)
            }
            Curve::Exponential(initial) => {
                let factor = 2_i64.checked_pow(attempt - 1).unwrap_or(i64::MAX);
                let millis = initial.num_milliseconds().saturating_mul(factor);
                TimeDelta::try_milliseconds(millis).unwrap_or(TimeDelta::MAX)
            }
        };
        let delay = match self.max {
            Some(max) => delay.min(max),
            None => delay,
        };
        let delay = match self.jitter {
            Some(jitter) => jitter.apply(delay),
            None => delay,
        };
        delay.max(TimeDelta::zero())
    }
}
