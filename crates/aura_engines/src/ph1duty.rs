#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use aura_kernel_contracts::ph1duty::{DutyChannel, DutyCycleConfig};
use aura_kernel_contracts::ph1hs::{EngagementNotice, EngagementState};
use aura_kernel_contracts::{ContractViolation, MonotonicTimeNs};
use thiserror::Error;
use tracing::{debug, trace};

use crate::ph1hs::{FsmInstanceId, HandshakeFsm};
use crate::timer::TimerDriver;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DutyCycleError {
    #[error("scheduler is already bound to a different handshake machine")]
    AlreadyBound,
    #[error(transparent)]
    Contract(#[from] ContractViolation),
}

/// One capacity-one bucket per channel; every engagement notice wipes all grants.
#[derive(Clone)]
pub struct DutyCycleScheduler {
    shared: Arc<SchedulerShared>,
}

struct SchedulerShared {
    timer: Arc<dyn TimerDriver>,
    config: DutyCycleConfig,
    default_channel: DutyChannel,
    core: Mutex<SchedulerCore>,
}

struct SchedulerCore {
    bound_to: Option<FsmInstanceId>,
    engagement: EngagementState,
    current_period: Duration,
    last_granted: BTreeMap<DutyChannel, MonotonicTimeNs>,
}

impl DutyCycleScheduler {
    pub fn new(
        timer: Arc<dyn TimerDriver>,
        idle_hz: f64,
        active_hz: f64,
        default_channel: DutyChannel,
    ) -> Result<Self, DutyCycleError> {
        Self::from_config(
            timer,
            DutyCycleConfig::v1(idle_hz, active_hz)?,
            default_channel,
        )
    }

    pub fn from_config(
        timer: Arc<dyn TimerDriver>,
        config: DutyCycleConfig,
        default_channel: DutyChannel,
    ) -> Result<Self, DutyCycleError> {
        aura_kernel_contracts::Validate::validate(&config)?;
        Ok(Self {
            shared: Arc::new(SchedulerShared {
                timer,
                config,
                default_channel,
                core: Mutex::new(SchedulerCore {
                    bound_to: None,
                    engagement: EngagementState::Idle,
                    current_period: config.idle_period(),
                    last_granted: BTreeMap::new(),
                }),
            }),
        })
    }

    /// Subscribes to `fsm`'s engagement broadcasts. Rebinding to the same
    /// machine is a no-op; binding to a second machine fails.
    pub fn bind(&self, fsm: &HandshakeFsm) -> Result<(), DutyCycleError> {
        {
            let mut core = self.shared.lock_core();
            match core.bound_to {
                Some(id) if id == fsm.id() => return Ok(()),
                Some(_) => return Err(DutyCycleError::AlreadyBound),
                None => core.bound_to = Some(fsm.id()),
            }
        }
        let weak = Arc::downgrade(&self.shared);
        fsm.subscribe_engagement(move |notice| {
            if let Some(shared) = weak.upgrade() {
                shared.on_engagement(notice);
            }
        });
        Ok(())
    }

    /// Non-blocking admission poll; `None` uses the default channel.
    pub fn try_acquire(&self, channel: Option<DutyChannel>) -> bool {
        let channel = channel.unwrap_or(self.shared.default_channel);
        let now = self.shared.timer.now();
        let mut core = self.shared.lock_core();
        let admit = core.current_period.is_zero()
            || match core.last_granted.get(&channel) {
                Some(last) => now.saturating_duration_since(*last) >= core.current_period,
                None => true,
            };
        if admit {
            core.last_granted.insert(channel, now);
        }
        trace!(
            channel = channel.as_str(),
            admit,
            period_ms = u64::try_from(core.current_period.as_millis()).unwrap_or(u64::MAX),
            "duty-cycle admission"
        );
        admit
    }

    pub fn try_acquire_default(&self) -> bool {
        self.try_acquire(None)
    }

    pub fn current_period(&self) -> Duration {
        self.shared.lock_core().current_period
    }

    pub fn engagement(&self) -> EngagementState {
        self.shared.lock_core().engagement
    }

    pub fn is_bound(&self) -> bool {
        self.shared.lock_core().bound_to.is_some()
    }

    pub fn last_granted(&self, channel: DutyChannel) -> Option<MonotonicTimeNs> {
        self.shared.lock_core().last_granted.get(&channel).copied()
    }

    pub fn default_channel(&self) -> DutyChannel {
        self.shared.default_channel
    }

    pub fn config(&self) -> DutyCycleConfig {
        self.shared.config
    }
}

impl fmt::Debug for DutyCycleScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.shared.lock_core();
        f.debug_struct("DutyCycleScheduler")
            .field("engagement", &core.engagement)
            .field("current_period", &core.current_period)
            .field("bound_to", &core.bound_to)
            .finish()
    }
}

impl SchedulerShared {
    fn lock_core(&self) -> MutexGuard<'_, SchedulerCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_engagement(&self, notice: &EngagementNotice) {
        let mut core = self.lock_core();
        let period = self.config.period_for(notice.engagement);
        if period != core.current_period || notice.engagement != core.engagement {
            debug!(
                engagement = notice.engagement.as_str(),
                period_ms = u64::try_from(period.as_millis()).unwrap_or(u64::MAX),
                "duty-cycle period changed"
            );
        }
        core.engagement = notice.engagement;
        core.current_period = period;
        core.last_granted.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::SimulatedTimerDriver;
    use aura_kernel_contracts::ph1hs::{HandshakeBudgets, HandshakeState};

    fn setup(
        idle_hz: f64,
        active_hz: f64,
    ) -> (Arc<SimulatedTimerDriver>, HandshakeFsm, DutyCycleScheduler) {
        let driver = Arc::new(SimulatedTimerDriver::new());
        let budgets = HandshakeBudgets::from_secs_f64(60.0, 120.0, 60.0, 120.0).unwrap();
        let fsm = HandshakeFsm::new(driver.clone(), budgets);
        let scheduler =
            DutyCycleScheduler::new(driver.clone(), idle_hz, active_hz, DutyChannel::Vision)
                .unwrap();
        scheduler.bind(&fsm).unwrap();
        fsm.pair().unwrap();
        (driver, fsm, scheduler)
    }

    #[test]
    fn at_duty_01_idle_rate_admits_once_per_period() {
        let (driver, _fsm, scheduler) = setup(2.0, 0.0);
        assert!(scheduler.try_acquire(None));
        driver.advance(Duration::from_millis(300));
        assert!(!scheduler.try_acquire(None));
        driver.advance(Duration::from_millis(200));
        assert!(scheduler.try_acquire(None));
        assert!(!scheduler.try_acquire(None));
    }

    #[test]
    fn at_duty_02_active_unlimited_admits_every_call() {
        let (driver, fsm, scheduler) = setup(2.0, 0.0);
        fsm.mark_user_active();
        assert_eq!(scheduler.current_period(), Duration::ZERO);
        for _ in 0..10 {
            assert!(scheduler.try_acquire(None));
            driver.advance(Duration::from_millis(10));
        }
        assert!(scheduler.try_acquire(None));
    }

    #[test]
    fn at_duty_03_engagement_change_clears_bookkeeping() {
        let (driver, fsm, scheduler) = setup(2.0, 0.0);
        assert!(scheduler.try_acquire(None));
        driver.advance(Duration::from_millis(100));
        fsm.mark_user_active();
        fsm.mark_user_idle();
        assert_eq!(scheduler.last_granted(DutyChannel::Vision), None);
        assert!(scheduler.try_acquire(None));
        assert!(!scheduler.try_acquire(None));
    }

    #[test]
    fn at_duty_04_channels_are_independent() {
        let (_driver, _fsm, scheduler) = setup(2.0, 0.0);
        assert!(scheduler.try_acquire(Some(DutyChannel::Vision)));
        assert!(scheduler.try_acquire(Some(DutyChannel::Inference)));
        assert!(!scheduler.try_acquire(Some(DutyChannel::Vision)));
        assert!(!scheduler.try_acquire(Some(DutyChannel::Inference)));
        assert!(scheduler.try_acquire(Some(DutyChannel::Audio)));
    }

    #[test]
    fn at_duty_05_bind_is_idempotent_for_the_same_machine_only() {
        let (driver, fsm, scheduler) = setup(2.0, 0.0);
        assert!(scheduler.bind(&fsm).is_ok());
        assert!(scheduler.bind(&fsm.clone()).is_ok());
        let other = HandshakeFsm::new(driver, HandshakeBudgets::mvp_v1());
        assert_eq!(scheduler.bind(&other), Err(DutyCycleError::AlreadyBound));

        assert!(scheduler.try_acquire(None));
        fsm.mark_user_active();
        assert_eq!(scheduler.engagement(), EngagementState::Active);
    }

    #[test]
    fn at_duty_06_bind_picks_up_current_engagement_immediately() {
        let driver = Arc::new(SimulatedTimerDriver::new());
        let fsm = HandshakeFsm::new(driver.clone(), HandshakeBudgets::mvp_v1());
        fsm.pair().unwrap();
        fsm.mark_user_active();

        let scheduler =
            DutyCycleScheduler::new(driver, 1.0, 10.0, DutyChannel::Vision).unwrap();
        assert_eq!(scheduler.current_period(), Duration::from_secs(1));
        scheduler.bind(&fsm).unwrap();
        assert!(scheduler.is_bound());
        assert_eq!(scheduler.engagement(), EngagementState::Active);
        assert_eq!(scheduler.current_period(), Duration::from_millis(100));
    }

    #[test]
    fn at_duty_07_negative_frequency_fails_construction() {
        let driver = Arc::new(SimulatedTimerDriver::new());
        assert!(matches!(
            DutyCycleScheduler::new(driver.clone(), -2.0, 0.0, DutyChannel::Vision),
            Err(DutyCycleError::Contract(_))
        ));
        assert!(
            DutyCycleScheduler::new(driver, 0.0, f64::INFINITY, DutyChannel::Vision).is_err()
        );
    }

    #[test]
    fn at_duty_08_leaving_ready_falls_back_to_idle_period() {
        let (driver, fsm, scheduler) = setup(2.0, 0.0);
        fsm.mark_user_active();
        assert_eq!(scheduler.current_period(), Duration::ZERO);
        driver.advance(Duration::from_secs(60));
        assert_eq!(fsm.state(), HandshakeState::Degraded);
        assert_eq!(scheduler.engagement(), EngagementState::Idle);
        assert_eq!(scheduler.current_period(), Duration::from_millis(500));
    }
}
