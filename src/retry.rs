use std::time::Duration;

/// How often a stage may fail before giving up, and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt; `None` retries forever.
    pub max_retries: Option<u32>,
    pub backoff: Duration,
}

/// What one attempt decided.
#[derive(Debug)]
pub enum Attempt<T, E> {
    Done(T),
    Retry(E),
}

#[derive(Debug, PartialEq, Eq)]
pub enum Outcome<T, E> {
    Success(T),
    GaveUp { last: E, attempts: u32 },
}

impl RetryPolicy {
    pub const fn bounded(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries: Some(max_retries),
            backoff,
        }
    }

    pub const fn forever(backoff: Duration) -> Self {
        Self {
            max_retries: None,
            backoff,
        }
    }

    /// Whether another attempt is allowed after `failures` failed ones.
    pub fn allows(&self, failures: u32) -> bool {
        self.max_retries.is_none_or(|max| failures <= max)
    }

    /// Runs `op` until it succeeds or the budget is spent.
    ///
    /// `on_retry` sees each retryable failure with its 1-based failure count
    /// before the backoff sleep.
    pub fn run<T, E>(
        &self,
        mut op: impl FnMut(u32) -> Attempt<T, E>,
        mut on_retry: impl FnMut(&E, u32),
    ) -> Outcome<T, E> {
        let mut failures = 0;
        loop {
            match op(failures) {
                Attempt::Done(v) => return Outcome::Success(v),
                Attempt::Retry(e) => {
                    failures += 1;
                    if !self.allows(failures) {
                        return Outcome::GaveUp {
                            last: e,
                            attempts: failures,
                        };
                    }
                    on_retry(&e, failures);
                    if !self.backoff.is_zero() {
                        std::thread::sleep(self.backoff);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_policy_gives_up_after_budget() {
        let policy = RetryPolicy::bounded(3, Duration::ZERO);
        let mut calls = 0;
        let mut seen = Vec::new();
        let out: Outcome<(), &str> = policy.run(
            |_| {
                calls += 1;
                Attempt::Retry("nope")
            },
            |_, n| seen.push(n),
        );
        assert_eq!(calls, 4);
        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(
            out,
            Outcome::GaveUp {
                last: "nope",
                attempts: 4
            }
        );
    }

    #[test]
    fn success_stops_retrying() {
        let policy = RetryPolicy::bounded(10, Duration::ZERO);
        let out: Outcome<u32, ()> = policy.run(
            |failures| {
                if failures < 2 {
                    Attempt::Retry(())
                } else {
                    Attempt::Done(failures)
                }
            },
            |_, _| {},
        );
        assert_eq!(out, Outcome::Success(2));
    }

    #[test]
    fn forever_always_allows() {
        let policy = RetryPolicy::forever(Duration::from_secs(15));
        assert!(policy.allows(u32::MAX));
        assert!(RetryPolicy::bounded(3, Duration::ZERO).allows(3));
        assert!(!RetryPolicy::bounded(3, Duration::ZERO).allows(4));
    }
}
