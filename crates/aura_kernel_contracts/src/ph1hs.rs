#![forbid(unsafe_code)]

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::common::positive_secs;
use crate::{ContractViolation, MonotonicTimeNs, ReasonCodeId, SchemaVersion, Validate};

pub const PH1HS_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HandshakeState {
    #[default]
    Unpaired,
    Ready,
    Degraded,
    Reconnecting,
}

impl HandshakeState {
    pub fn as_str(self) -> &'static str {
        match self {
            HandshakeState::Unpaired => "UNPAIRED",
            HandshakeState::Ready => "READY",
            HandshakeState::Degraded => "DEGRADED",
            HandshakeState::Reconnecting => "RECONNECTING",
        }
    }
}

/// Whether the user is interacting with the wearable. Only meaningful while READY.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngagementState {
    #[default]
    Idle,
    Active,
}

impl EngagementState {
    pub fn as_str(self) -> &'static str {
        match self {
            EngagementState::Idle => "IDLE",
            EngagementState::Active => "ACTIVE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerLabel {
    DegradePrimary,
    DegradeGuard,
    ReconnectPrimary,
    ReconnectGuard,
}

impl TimerLabel {
    pub const ALL: [TimerLabel; 4] = [
        TimerLabel::DegradePrimary,
        TimerLabel::DegradeGuard,
        TimerLabel::ReconnectPrimary,
        TimerLabel::ReconnectGuard,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TimerLabel::DegradePrimary => "degrade_primary",
            TimerLabel::DegradeGuard => "degrade_guard",
            TimerLabel::ReconnectPrimary => "reconnect_primary",
            TimerLabel::ReconnectGuard => "reconnect_guard",
        }
    }

    pub fn window(self) -> BudgetWindow {
        match self {
            TimerLabel::DegradePrimary | TimerLabel::DegradeGuard => BudgetWindow::Degrade,
            TimerLabel::ReconnectPrimary | TimerLabel::ReconnectGuard => BudgetWindow::Reconnect,
        }
    }

    pub fn is_guard(self) -> bool {
        matches!(self, TimerLabel::DegradeGuard | TimerLabel::ReconnectGuard)
    }
}

/// One p50/p95 budget window, covered by a primary and a guard timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetWindow {
    Degrade,
    Reconnect,
}

impl BudgetWindow {
    pub fn primary(self) -> TimerLabel {
        match self {
            BudgetWindow::Degrade => TimerLabel::DegradePrimary,
            BudgetWindow::Reconnect => TimerLabel::ReconnectPrimary,
        }
    }

    pub fn guard(self) -> TimerLabel {
        match self {
            BudgetWindow::Degrade => TimerLabel::DegradeGuard,
            BudgetWindow::Reconnect => TimerLabel::ReconnectGuard,
        }
    }

    pub fn other(self) -> BudgetWindow {
        match self {
            BudgetWindow::Degrade => BudgetWindow::Reconnect,
            BudgetWindow::Reconnect => BudgetWindow::Degrade,
        }
    }
}

/// Statistical reaction-time budgets for the handshake lifecycle.
///
/// Immutable once built; `v1` rejects non-positive durations and p50 > p95
/// instead of clamping them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct HandshakeBudgets {
    degrade_p50: Duration,
    degrade_p95: Duration,
    reconnect_p50: Duration,
    reconnect_p95: Duration,
}

impl HandshakeBudgets {
    pub fn v1(
        degrade_p50: Duration,
        degrade_p95: Duration,
        reconnect_p50: Duration,
        reconnect_p95: Duration,
    ) -> Result<Self, ContractViolation> {
        let budgets = Self {
            degrade_p50,
            degrade_p95,
            reconnect_p50,
            reconnect_p95,
        };
        budgets.validate()?;
        Ok(budgets)
    }

    pub fn from_secs_f64(
        degrade_p50: f64,
        degrade_p95: f64,
        reconnect_p50: f64,
        reconnect_p95: f64,
    ) -> Result<Self, ContractViolation> {
        Self::v1(
            positive_secs("handshake_budgets.degrade_p50", degrade_p50)?,
            positive_secs("handshake_budgets.degrade_p95", degrade_p95)?,
            positive_secs("handshake_budgets.reconnect_p50", reconnect_p50)?,
            positive_secs("handshake_budgets.reconnect_p95", reconnect_p95)?,
        )
    }

    pub fn mvp_v1() -> Self {
        Self {
            degrade_p50: Duration::from_millis(1_500),
            degrade_p95: Duration::from_millis(4_000),
            reconnect_p50: Duration::from_millis(2_000),
            reconnect_p95: Duration::from_millis(6_000),
        }
    }

    pub fn degrade_p50(&self) -> Duration {
        self.degrade_p50
    }

    pub fn degrade_p95(&self) -> Duration {
        self.degrade_p95
    }

    pub fn reconnect_p50(&self) -> Duration {
        self.reconnect_p50
    }

    pub fn reconnect_p95(&self) -> Duration {
        self.reconnect_p95
    }

    /// Delay for the timer registered under `label`.
    pub fn delay_for(&self, label: TimerLabel) -> Duration {
        match label {
            TimerLabel::DegradePrimary => self.degrade_p50,
            TimerLabel::DegradeGuard => self.degrade_p95,
            TimerLabel::ReconnectPrimary => self.reconnect_p50,
            TimerLabel::ReconnectGuard => self.reconnect_p95,
        }
    }
}

impl Validate for HandshakeBudgets {
    fn validate(&self) -> Result<(), ContractViolation> {
        for (field, d) in [
            ("handshake_budgets.degrade_p50", self.degrade_p50),
            ("handshake_budgets.degrade_p95", self.degrade_p95),
            ("handshake_budgets.reconnect_p50", self.reconnect_p50),
            ("handshake_budgets.reconnect_p95", self.reconnect_p95),
        ] {
            if d.is_zero() {
                return Err(ContractViolation::InvalidValue {
                    field,
                    reason: "must be > 0",
                });
            }
        }
        if self.degrade_p50 > self.degrade_p95 {
            return Err(ContractViolation::InvalidValue {
                field: "handshake_budgets.degrade_p50",
                reason: "must be <= degrade_p95",
            });
        }
        if self.reconnect_p50 > self.reconnect_p95 {
            return Err(ContractViolation::InvalidValue {
                field: "handshake_budgets.reconnect_p50",
                reason: "must be <= reconnect_p95",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransitionEvent {
    pub schema_version: SchemaVersion,
    pub from: HandshakeState,
    pub to: HandshakeState,
    pub reason_code: ReasonCodeId,
    pub t_event: MonotonicTimeNs,
}

impl TransitionEvent {
    pub fn v1(
        from: HandshakeState,
        to: HandshakeState,
        reason_code: ReasonCodeId,
        t_event: MonotonicTimeNs,
    ) -> Result<Self, ContractViolation> {
        let ev = Self {
            schema_version: PH1HS_CONTRACT_VERSION,
            from,
            to,
            reason_code,
            t_event,
        };
        ev.validate()?;
        Ok(ev)
    }
}

impl Validate for TransitionEvent {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != PH1HS_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "transition_event.schema_version",
                reason: "must match PH1HS_CONTRACT_VERSION",
            });
        }
        if self.from == self.to {
            return Err(ContractViolation::InvalidValue {
                field: "transition_event.to",
                reason: "must differ from transition_event.from",
            });
        }
        if self.reason_code.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "transition_event.reason_code",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

/// Typed engagement broadcast handed to engagement listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EngagementNotice {
    pub schema_version: SchemaVersion,
    pub engagement: EngagementState,
    pub handshake_state: HandshakeState,
    pub t_event: MonotonicTimeNs,
}

impl EngagementNotice {
    pub fn v1(
        engagement: EngagementState,
        handshake_state: HandshakeState,
        t_event: MonotonicTimeNs,
    ) -> Result<Self, ContractViolation> {
        let n = Self {
            schema_version: PH1HS_CONTRACT_VERSION,
            engagement,
            handshake_state,
            t_event,
        };
        n.validate()?;
        Ok(n)
    }
}

impl Validate for EngagementNotice {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != PH1HS_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "engagement_notice.schema_version",
                reason: "must match PH1HS_CONTRACT_VERSION",
            });
        }
        // ACTIVE is only reachable while READY.
        if self.engagement == EngagementState::Active
            && self.handshake_state != HandshakeState::Ready
        {
            return Err(ContractViolation::InvalidValue {
                field: "engagement_notice.engagement",
                reason: "ACTIVE requires handshake_state=READY",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeSnapshot {
    pub schema_version: SchemaVersion,
    pub state: HandshakeState,
    pub engagement: EngagementState,
    pub live_timers: Vec<TimerLabel>,
    pub last_transition_at: Option<MonotonicTimeNs>,
}

impl Validate for HandshakeSnapshot {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != PH1HS_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "handshake_snapshot.schema_version",
                reason: "must match PH1HS_CONTRACT_VERSION",
            });
        }
        if self.engagement == EngagementState::Active && self.state != HandshakeState::Ready {
            return Err(ContractViolation::InvalidValue {
                field: "handshake_snapshot.engagement",
                reason: "ACTIVE requires state=READY",
            });
        }
        if self.state == HandshakeState::Unpaired && !self.live_timers.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "handshake_snapshot.live_timers",
                reason: "must be empty when state=UNPAIRED",
            });
        }
        if self.live_timers.len() > TimerLabel::ALL.len() {
            return Err(ContractViolation::InvalidValue {
                field: "handshake_snapshot.live_timers",
                reason: "must hold at most one timer per label",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_hs_contract_01_budgets_reject_p50_above_p95() {
        let err = HandshakeBudgets::from_secs_f64(3.0, 2.0, 1.0, 2.0).unwrap_err();
        assert_eq!(
            err,
            ContractViolation::InvalidValue {
                field: "handshake_budgets.degrade_p50",
                reason: "must be <= degrade_p95",
            }
        );
        assert!(HandshakeBudgets::from_secs_f64(1.0, 2.0, 3.0, 2.5).is_err());
    }

    #[test]
    fn at_hs_contract_02_budgets_reject_non_positive_durations() {
        assert!(HandshakeBudgets::from_secs_f64(0.0, 2.0, 1.0, 2.0).is_err());
        assert!(HandshakeBudgets::from_secs_f64(1.0, 2.0, -1.0, 2.0).is_err());
        assert!(HandshakeBudgets::v1(
            Duration::ZERO,
            Duration::ZERO,
            Duration::from_secs(1),
            Duration::from_secs(1)
        )
        .is_err());
    }

    #[test]
    fn at_hs_contract_03_equal_p50_and_p95_is_valid() {
        let b = HandshakeBudgets::from_secs_f64(1.0, 1.0, 2.0, 2.0).unwrap();
        assert_eq!(b.delay_for(TimerLabel::DegradeGuard), Duration::from_secs(1));
        assert_eq!(b.delay_for(TimerLabel::ReconnectPrimary), Duration::from_secs(2));
        assert!(HandshakeBudgets::mvp_v1().validate().is_ok());
    }

    #[test]
    fn at_hs_contract_04_active_engagement_requires_ready() {
        assert!(EngagementNotice::v1(
            EngagementState::Active,
            HandshakeState::Degraded,
            MonotonicTimeNs(1)
        )
        .is_err());
        assert!(EngagementNotice::v1(
            EngagementState::Idle,
            HandshakeState::Degraded,
            MonotonicTimeNs(1)
        )
        .is_ok());
    }

    #[test]
    fn at_hs_contract_05_self_transition_is_not_an_event() {
        assert!(TransitionEvent::v1(
            HandshakeState::Ready,
            HandshakeState::Ready,
            ReasonCodeId(1),
            MonotonicTimeNs(0)
        )
        .is_err());
    }

    #[test]
    fn at_hs_contract_06_labels_map_to_windows() {
        for label in TimerLabel::ALL {
            let w = label.window();
            assert!(w.primary() == label || w.guard() == label);
            assert_eq!(label.is_guard(), w.guard() == label);
        }
        assert_eq!(BudgetWindow::Degrade.other(), BudgetWindow::Reconnect);
    }

    #[test]
    fn at_hs_contract_07_states_serialize_in_wire_case() {
        let s = serde_json::to_string(&HandshakeState::Reconnecting).unwrap();
        assert_eq!(s, "\"RECONNECTING\"");
        let l = serde_json::to_string(&TimerLabel::DegradeGuard).unwrap();
        assert_eq!(l, "\"degrade_guard\"");
    }
}
