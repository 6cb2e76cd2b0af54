// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Retry utilities for transient database errors.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::prelude::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};

use crate::error::DbError;

/// Configures a retry operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Retry {
    /// The initial backoff for the exponential backoff retries.
    pub initial_backoff: Duration,
    /// The backoff multiplier.
    pub multiplier: u32,
    /// Clamps the maximum backoff for the retry operation.
    pub clamp_backoff: Duration,
    /// Total attempts, including the first. Zero is treated as one.
    pub max_attempts: u32,
    /// A seed for the random jitter.
    pub seed: u64,
}

impl Retry {
    /// The default retry configuration for backfill batches.
    ///
    /// Uses the given SystemTime to initialize the seed for random jitter.
    pub fn batch_defaults(now: SystemTime, max_attempts: u32) -> Self {
        Retry {
            initial_backoff: Duration::from_millis(50),
            multiplier: 2,
            clamp_backoff: Duration::from_secs(10),
            max_attempts,
            seed: now
                .duration_since(UNIX_EPOCH)
                .map_or(0, |x| u64::from(x.subsec_nanos())),
        }
    }

    /// A configuration that retries without sleeping, for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Retry {
            initial_backoff: Duration::ZERO,
            multiplier: 1,
            clamp_backoff: Duration::ZERO,
            max_attempts,
            seed: 0,
        }
    }

    pub fn into_retry_stream(self) -> RetryStream {
        let rng = SmallRng::seed_from_u64(self.seed);
        let backoff = self.initial_backoff;
        RetryStream {
            cfg: self,
            rng,
            attempt: 0,
            backoff,
        }
    }
}

/// A series of exponential, jittered, clamped sleeps.
#[derive(Debug)]
pub struct RetryStream {
    cfg: Retry,
    rng: SmallRng,
    attempt: u32,
    backoff: Duration,
}

impl RetryStream {
    /// How many times [Self::sleep] has been called.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Whether another attempt is allowed after the current one fails.
    pub fn has_remaining(&self) -> bool {
        self.attempt + 1 < self.cfg.max_attempts.max(1)
    }

    /// The next sleep (without jitter for easy printing in logs).
    pub fn next_sleep(&self) -> Duration {
        self.backoff
    }

    /// Executes the next sleep in the series.
    ///
    /// This isn't cancel-safe, so it consumes and returns self, to prevent
    /// accidental mis-use.
    pub async fn sleep(mut self) -> Self {
        let jitter = self.rng.gen_range(0.9..=1.1);
        let sleep = self.next_sleep().mul_f64(jitter);
        if !sleep.is_zero() {
            tokio::time::sleep(sleep).await;
        }
        self.advance()
    }

    fn advance(mut self) -> Self {
        self.attempt += 1;
        self.backoff = std::cmp::min(self.backoff * self.cfg.multiplier, self.cfg.clamp_backoff);
        self
    }
}

/// Runs `work` until it succeeds, fails with a non-transient error, or runs out
/// of attempts. `on_retry` is called before each retry, e.g. to count it.
pub async fn retry_transient<T, F, Fut>(
    name: &str,
    retry: Retry,
    mut on_retry: impl FnMut(&DbError),
    mut work: F,
) -> Result<T, DbError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DbError>>,
{
    let mut retry = retry.into_retry_stream();
    loop {
        match work().await {
            Ok(x) => {
                if retry.attempt() > 0 {
                    info!(
                        "{} succeeded after {} retries",
                        name,
                        retry.attempt()
                    );
                }
                return Ok(x);
            }
            Err(err) if err.is_transient() && retry.has_remaining() => {
                if retry.attempt() >= 2 {
                    warn!(
                        "{} failed on attempt {}, retrying in {:?}: {}",
                        name,
                        retry.attempt() + 1,
                        retry.next_sleep(),
                        err
                    );
                } else {
                    info!(
                        "{} failed, retrying in {:?}: {}",
                        name,
                        retry.next_sleep(),
                        err
                    );
                }
                on_retry(&err);
                retry = retry.sleep().await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[test]
    fn retry_stream() {
        #[track_caller]
        fn testcase(r: Retry, expected_sleep_ms: Vec<u64>) {
            let mut r = r.into_retry_stream();
            for expected_sleep_ms in expected_sleep_ms {
                let expected = Duration::from_millis(expected_sleep_ms);
                let actual = r.next_sleep();
                assert_eq!(actual, expected);
                r = r.advance();
            }
        }

        testcase(
            Retry {
                initial_backoff: Duration::from_millis(1_200),
                multiplier: 2,
                clamp_backoff: Duration::from_secs(16),
                max_attempts: 10,
                seed: 0,
            },
            vec![1_200, 2_400, 4_800, 9_600, 16_000, 16_000],
        );
        testcase(
            Retry::batch_defaults(SystemTime::UNIX_EPOCH, 3),
            vec![50, 100, 200, 400],
        );
    }

    #[tokio::test]
    async fn retries_transient_errors_up_to_max_attempts() {
        let calls = Cell::new(0);
        let mut retried = 0;
        let res: Result<(), _> = retry_transient(
            "flaky",
            Retry::immediate(3),
            |_| retried += 1,
            || {
                calls.set(calls.get() + 1);
                async { Err(DbError::Unavailable("connection reset".into())) }
            },
        )
        .await;
        assert!(res.is_err());
        assert_eq!(calls.get(), 3);
        assert_eq!(retried, 2);

        calls.set(0);
        let res = retry_transient(
            "flaky",
            Retry::immediate(3),
            |_| {},
            || {
                calls.set(calls.get() + 1);
                let n = calls.get();
                async move {
                    if n < 2 {
                        Err(DbError::Unavailable("connection reset".into()))
                    } else {
                        Ok(n)
                    }
                }
            },
        )
        .await;
        assert_eq!(res.unwrap(), 2);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = Cell::new(0);
        let res: Result<(), _> = retry_transient(
            "broken",
            Retry::immediate(5),
            |_| {},
            || {
                calls.set(calls.get() + 1);
                async { Err(DbError::Other(anyhow::anyhow!("syntax error"))) }
            },
        )
        .await;
        assert!(res.is_err());
        assert_eq!(calls.get(), 1);
    }
}
