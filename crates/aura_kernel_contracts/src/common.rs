#![forbid(unsafe_code)]

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SchemaVersion(pub u32);

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct MonotonicTimeNs(pub u64);

impl MonotonicTimeNs {
    pub fn saturating_add(self, d: Duration) -> Self {
        MonotonicTimeNs(self.0.saturating_add(duration_to_ns(d)))
    }

    /// Elapsed time since `earlier`; zero when `earlier` is in the future.
    pub fn saturating_duration_since(self, earlier: MonotonicTimeNs) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }

    pub fn as_secs_f64(self) -> f64 {
        Duration::from_nanos(self.0).as_secs_f64()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReasonCodeId(pub u32);

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ContractViolation {
    #[error("{field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },
    #[error("{field}: expected value within {min}..={max}, got {got}")]
    InvalidRange {
        field: &'static str,
        min: f64,
        max: f64,
        got: f64,
    },
    #[error("{field}: must be finite")]
    NotFinite { field: &'static str },
}

pub trait Validate {
    fn validate(&self) -> Result<(), ContractViolation>;
}

pub fn duration_to_ns(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

/// Converts a seconds value from configuration into a strictly positive duration.
pub fn positive_secs(field: &'static str, secs: f64) -> Result<Duration, ContractViolation> {
    if !secs.is_finite() {
        return Err(ContractViolation::NotFinite { field });
    }
    if secs <= 0.0 {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must be > 0",
        });
    }
    Duration::try_from_secs_f64(secs).map_err(|_| ContractViolation::InvalidValue {
        field,
        reason: "must fit in a duration",
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_common_01_positive_secs_rejects_zero_negative_and_nan() {
        assert!(positive_secs("x", 0.0).is_err());
        assert!(positive_secs("x", -1.0).is_err());
        assert_eq!(
            positive_secs("x", f64::NAN),
            Err(ContractViolation::NotFinite { field: "x" })
        );
        assert_eq!(
            positive_secs("x", 0.25).unwrap(),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn at_common_02_monotonic_time_arithmetic_saturates() {
        let t = MonotonicTimeNs(5);
        assert_eq!(
            t.saturating_duration_since(MonotonicTimeNs(10)),
            Duration::ZERO
        );
        assert_eq!(
            MonotonicTimeNs(u64::MAX).saturating_add(Duration::from_secs(1)),
            MonotonicTimeNs(u64::MAX)
        );
        assert_eq!(
            t.saturating_add(Duration::from_nanos(7)),
            MonotonicTimeNs(12)
        );
    }

    #[test]
    fn at_common_03_violation_messages_name_the_field() {
        let v = ContractViolation::InvalidValue {
            field: "handshake_budgets.degrade_p50",
            reason: "must be > 0",
        };
        assert_eq!(v.to_string(), "handshake_budgets.degrade_p50: must be > 0");
    }
}
