/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use std::{ops::ControlFlow, thread, time::Duration};

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Backoff {
    Fixed,
    Exponential { factor: u32, max: Duration },
}

/// A bounded number of attempts separated by blocking sleeps.
///
/// Every attempt decides for itself whether the loop is done (`ControlFlow::Break`) or should go
/// on (`ControlFlow::Continue`). Used for pid discovery, ssh reconnects, waiting for k6 to finish
/// and for the SIGTERM loop.
#[derive(Debug, PartialEq, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
    pub backoff: Backoff,
    /// Sleep after the final attempt as well, giving its side effect time to land before the
    /// caller inspects the outcome.
    pub trailing_delay: bool,
}
impl RetryPolicy {
    pub fn fixed(max_attempts: u32, interval: Duration) -> Self {
        RetryPolicy {
            max_attempts,
            interval,
            backoff: Backoff::Fixed,
            trailing_delay: false,
        }
    }

    /// `checks` probes spread evenly over `total`, no sleep after the last one. A zero `total`
    /// collapses to a single probe.
    pub fn spread(total: Duration, checks: u32) -> Self {
        if total.is_zero() || checks == 0 {
            return RetryPolicy::fixed(1, Duration::ZERO);
        }
        RetryPolicy::fixed(checks, total / checks)
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_trailing_delay(mut self) -> Self {
        self.trailing_delay = true;
        self
    }

    /// Delay slept after the given (zero based) attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.interval,
            Backoff::Exponential { factor, max } => {
                let mut delay = self.interval;
                for _ in 0..attempt {
                    delay = delay.saturating_mul(factor);
                    if delay >= max {
                        return max;
                    }
                }
                delay.min(max)
            }
        }
    }

    /// Runs `attempt` until it breaks, errors or the budget is spent.
    ///
    /// Returns `Ok(Some(value))` on break and `Ok(None)` when every attempt asked to continue.
    pub fn run<T, E>(
        &self,
        mut attempt: impl FnMut(u32) -> Result<ControlFlow<T>, E>,
    ) -> Result<Option<T>, E> {
        for n in 0..self.max_attempts {
            if let ControlFlow::Break(value) = attempt(n)? {
                return Ok(Some(value));
            }

            let is_last = n + 1 == self.max_attempts;
            if !is_last || self.trailing_delay {
                let delay = self.delay_for(n);
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn stops_at_first_break() {
        let policy = RetryPolicy::fixed(5, Duration::ZERO);
        let mut calls = 0;
        let res: Result<_, ()> = policy.run(|n| {
            calls += 1;
            Ok(if n == 2 {
                ControlFlow::Break(n)
            } else {
                ControlFlow::Continue(())
            })
        });

        assert_eq!(res, Ok(Some(2)));
        assert_eq!(calls, 3);
    }

    #[test]
    fn exhausts_budget_without_break() {
        let policy = RetryPolicy::fixed(5, Duration::ZERO);
        let mut calls = 0;
        let res: Result<Option<()>, ()> = policy.run(|_| {
            calls += 1;
            Ok(ControlFlow::Continue(()))
        });

        assert_eq!(res, Ok(None));
        assert_eq!(calls, 5);
    }

    #[test]
    fn errors_abort_immediately() {
        let policy = RetryPolicy::fixed(5, Duration::ZERO);
        let mut calls = 0;
        let res: Result<Option<()>, &str> = policy.run(|_| {
            calls += 1;
            Err("boom")
        });

        assert_eq!(res, Err("boom"));
        assert_eq!(calls, 1);
    }

    #[test]
    fn spread_divides_total_over_checks() {
        let policy = RetryPolicy::spread(Duration::from_secs(100), 5);
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.interval, Duration::from_secs(20));
        assert!(!policy.trailing_delay);

        let zero = RetryPolicy::spread(Duration::ZERO, 5);
        assert_eq!(zero.max_attempts, 1);
    }

    #[test]
    fn no_sleep_after_last_attempt_unless_asked() {
        let policy = RetryPolicy::fixed(2, Duration::from_millis(30));
        let start = Instant::now();
        let _: Result<Option<()>, ()> = policy.run(|_| Ok(ControlFlow::Continue(())));
        let plain = start.elapsed();
        assert!(plain >= Duration::from_millis(30));

        let start = Instant::now();
        let _: Result<Option<()>, ()> =
            policy.with_trailing_delay().run(|_| Ok(ControlFlow::Continue(())));
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = RetryPolicy::fixed(10, Duration::from_secs(1)).with_backoff(
            Backoff::Exponential {
                factor: 2,
                max: Duration::from_secs(5),
            },
        );

        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(5));
        assert_eq!(policy.delay_for(9), Duration::from_secs(5));
    }
}
