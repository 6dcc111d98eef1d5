//! Retry policies and their schedules.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::DlqError;

/// How a dead-lettered task is retried.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Never retried; the entry is exhausted on arrival.
    Never,
    /// Retried on the next processor cycle.
    Immediate,
    /// `failed_at + k * linear_base` for the k-th retry.
    Linear,
    /// `now + min(exponential_base * 2^retry_count, exponential_cap)`.
    #[default]
    Exponential,
}

impl fmt::Display for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RetryPolicy::Never => "never",
            RetryPolicy::Immediate => "immediate",
            RetryPolicy::Linear => "linear",
            RetryPolicy::Exponential => "exponential",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for RetryPolicy {
    type Err = DlqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "never" => Ok(RetryPolicy::Never),
            "immediate" => Ok(RetryPolicy::Immediate),
            "linear" => Ok(RetryPolicy::Linear),
            "exponential" => Ok(RetryPolicy::Exponential),
            other => Err(DlqError::UnknownPolicy(other.to_string())),
        }
    }
}

/// Base intervals used to compute retry times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffSchedule {
    pub linear_base: Duration,
    pub exponential_base: Duration,
    pub exponential_cap: Duration,
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self {
            linear_base: Duration::from_secs(5 * 60),
            exponential_base: Duration::from_secs(60),
            exponential_cap: Duration::from_secs(60 * 60),
        }
    }
}

impl BackoffSchedule {
    /// Computes when the next retry is due.
    ///
    /// `retry_count` is the number of retries already attempted, so the upcoming
    /// retry is number `retry_count + 1`. Returns `None` for `Never`.
    pub fn next_retry_at(
        &self,
        policy: RetryPolicy,
        retry_count: u32,
        failed_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        match policy {
            RetryPolicy::Never => None,
            RetryPolicy::Immediate => Some(now),
            RetryPolicy::Linear => {
                let k = retry_count.saturating_add(1);
                let delay = self
                    .linear_base
                    .checked_mul(k)
                    .unwrap_or(Duration::from_secs(u32::MAX as u64));
                Some(add(failed_at, delay))
            }
            RetryPolicy::Exponential => {
                let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
                let delay = self
                    .exponential_base
                    .checked_mul(factor)
                    .unwrap_or(self.exponential_cap)
                    .min(self.exponential_cap);
                Some(add(now, delay))
            }
        }
    }
}

fn add(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minutes(n: i64) -> chrono::Duration {
        chrono::Duration::minutes(n)
    }

    #[test]
    fn test_never_is_not_scheduled() {
        let now = Utc::now();
        let schedule = BackoffSchedule::default();
        assert_eq!(schedule.next_retry_at(RetryPolicy::Never, 0, now, now), None);
    }

    #[test]
    fn test_immediate() {
        let failed_at = Utc::now() - minutes(30);
        let now = Utc::now();
        let schedule = BackoffSchedule::default();
        assert_eq!(
            schedule.next_retry_at(RetryPolicy::Immediate, 2, failed_at, now),
            Some(now)
        );
    }

    #[test]
    fn test_linear_is_anchored_on_failure_time() {
        let failed_at = Utc::now();
        let later = failed_at + minutes(7);
        let schedule = BackoffSchedule::default();

        let deltas: Vec<chrono::Duration> = (0..3)
            .map(|count| {
                schedule
                    .next_retry_at(RetryPolicy::Linear, count, failed_at, later)
                    .unwrap()
                    - failed_at
            })
            .collect();
        assert_eq!(deltas, vec![minutes(5), minutes(10), minutes(15)]);
    }

    #[test]
    fn test_exponential_doubles_and_caps() {
        let now = Utc::now();
        let schedule = BackoffSchedule::default();

        let deltas: Vec<chrono::Duration> = (0..8)
            .map(|count| {
                schedule
                    .next_retry_at(RetryPolicy::Exponential, count, now, now)
                    .unwrap()
                    - now
            })
            .collect();
        assert_eq!(
            deltas,
            vec![
                minutes(1),
                minutes(2),
                minutes(4),
                minutes(8),
                minutes(16),
                minutes(32),
                minutes(60),
                minutes(60)
            ]
        );

        let huge = schedule
            .next_retry_at(RetryPolicy::Exponential, 200, now, now)
            .unwrap();
        assert_eq!(huge - now, minutes(60));
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!("LINEAR".parse::<RetryPolicy>().unwrap(), RetryPolicy::Linear);
        assert!("sometimes".parse::<RetryPolicy>().is_err());
        assert_eq!(RetryPolicy::default(), RetryPolicy::Exponential);
    }
}
