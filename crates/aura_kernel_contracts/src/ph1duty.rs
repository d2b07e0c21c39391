#![forbid(unsafe_code)]

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ph1hs::EngagementState;
use crate::{ContractViolation, SchemaVersion, Validate};

pub const PH1DUTY_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

/// Category of gated work with its own rate-limit bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DutyChannel {
    Vision,
    Audio,
    Inference,
}

impl DutyChannel {
    pub const ALL: [DutyChannel; 3] = [
        DutyChannel::Vision,
        DutyChannel::Audio,
        DutyChannel::Inference,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DutyChannel::Vision => "vision",
            DutyChannel::Audio => "audio",
            DutyChannel::Inference => "inference",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let needle = raw.trim().to_ascii_lowercase();
        DutyChannel::ALL.into_iter().find(|c| c.as_str() == needle)
    }
}

/// Idle/active call frequencies. `0` hz means unlimited (period zero).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DutyCycleConfig {
    pub schema_version: SchemaVersion,
    pub idle_hz: f64,
    pub active_hz: f64,
}

impl DutyCycleConfig {
    pub fn v1(idle_hz: f64, active_hz: f64) -> Result<Self, ContractViolation> {
        let c = Self {
            schema_version: PH1DUTY_CONTRACT_VERSION,
            idle_hz,
            active_hz,
        };
        c.validate()?;
        Ok(c)
    }

    pub fn mvp_v1() -> Self {
        Self {
            schema_version: PH1DUTY_CONTRACT_VERSION,
            idle_hz: 2.0,
            active_hz: 0.0,
        }
    }

    pub fn idle_period(&self) -> Duration {
        period_for_hz(self.idle_hz)
    }

    pub fn active_period(&self) -> Duration {
        period_for_hz(self.active_hz)
    }

    pub fn period_for(&self, engagement: EngagementState) -> Duration {
        match engagement {
            EngagementState::Active => self.active_period(),
            EngagementState::Idle => self.idle_period(),
        }
    }
}

impl Validate for DutyCycleConfig {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != PH1DUTY_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "duty_cycle_config.schema_version",
                reason: "must match PH1DUTY_CONTRACT_VERSION",
            });
        }
        for (field, hz) in [
            ("duty_cycle_config.idle_hz", self.idle_hz),
            ("duty_cycle_config.active_hz", self.active_hz),
        ] {
            if !hz.is_finite() {
                return Err(ContractViolation::NotFinite { field });
            }
            if hz < 0.0 {
                return Err(ContractViolation::InvalidValue {
                    field,
                    reason: "must be >= 0 (0 = unlimited)",
                });
            }
        }
        Ok(())
    }
}

/// `1/hz` for positive frequencies, zero otherwise.
pub fn period_for_hz(hz: f64) -> Duration {
    if hz > 0.0 && hz.is_finite() {
        Duration::try_from_secs_f64(1.0 / hz).unwrap_or(Duration::MAX)
    } else {
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_duty_contract_01_negative_or_nan_hz_fails() {
        assert!(DutyCycleConfig::v1(-1.0, 0.0).is_err());
        assert!(DutyCycleConfig::v1(0.0, -0.5).is_err());
        assert_eq!(
            DutyCycleConfig::v1(f64::NAN, 1.0),
            Err(ContractViolation::NotFinite {
                field: "duty_cycle_config.idle_hz"
            })
        );
    }

    #[test]
    fn at_duty_contract_02_zero_hz_is_unlimited() {
        let c = DutyCycleConfig::v1(2.0, 0.0).unwrap();
        assert_eq!(c.idle_period(), Duration::from_millis(500));
        assert_eq!(c.active_period(), Duration::ZERO);
        assert_eq!(c.period_for(EngagementState::Active), Duration::ZERO);
        assert_eq!(c.period_for(EngagementState::Idle), Duration::from_millis(500));
    }

    #[test]
    fn at_duty_contract_03_channel_names_round_trip() {
        for c in DutyChannel::ALL {
            assert_eq!(DutyChannel::parse(c.as_str()), Some(c));
        }
        assert_eq!(DutyChannel::parse(" Vision "), Some(DutyChannel::Vision));
        assert_eq!(DutyChannel::parse("visoin"), None);
    }
}
