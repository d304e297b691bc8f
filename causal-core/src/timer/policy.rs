//! Timeout policies.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How long a timer waits once armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeoutPolicy {
    /// Always the same delay.
    Fixed(Duration),
    /// A fresh uniformly random delay in `[min, max]` on every arm.
    Uniform {
        /// Lower bound, inclusive.
        min: Duration,
        /// Upper bound, inclusive.
        max: Duration,
    },
}

impl TimeoutPolicy {
    /// Fixed-duration policy.
    pub fn fixed(delay: Duration) -> Self {
        TimeoutPolicy::Fixed(delay)
    }

    /// Randomized-range policy. Bounds are swapped if given in reverse.
    pub fn uniform(min: Duration, max: Duration) -> Self {
        if min <= max {
            TimeoutPolicy::Uniform { min, max }
        } else {
            TimeoutPolicy::Uniform { min: max, max: min }
        }
    }

    /// Draw the delay for the next arm.
    pub fn next_delay(&self) -> Duration {
        match *self {
            TimeoutPolicy::Fixed(delay) => delay,
            TimeoutPolicy::Uniform { min, max } => {
                let lo = min.as_millis() as u64;
                let hi = max.as_millis() as u64;
                if lo >= hi {
                    return min;
                }
                Duration::from_millis(rand::thread_rng().gen_range(lo..=hi))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_is_constant() {
        let policy = TimeoutPolicy::fixed(Duration::from_millis(50));
        for _ in 0..10 {
            assert_eq!(policy.next_delay(), Duration::from_millis(50));
        }
    }

    #[test]
    fn uniform_stays_in_range() {
        let policy = TimeoutPolicy::uniform(Duration::from_millis(300), Duration::from_millis(150));
        for _ in 0..200 {
            let delay = policy.next_delay();
            assert!(delay >= Duration::from_millis(150));
            assert!(delay <= Duration::from_millis(300));
        }
    }
}
