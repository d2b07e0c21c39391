#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use aura_kernel_contracts::ph1hs::{
    BudgetWindow, EngagementNotice, EngagementState, HandshakeBudgets, HandshakeSnapshot,
    HandshakeState, TimerLabel, TransitionEvent, PH1HS_CONTRACT_VERSION,
};
use aura_kernel_contracts::{MonotonicTimeNs, ReasonCodeId};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::timer::{TimerDriver, TimerError, TimerHandle};

pub mod reason_codes {
    use aura_kernel_contracts::ReasonCodeId;

    // PH1.HS reason-code namespace.
    pub const HS_PAIRED: ReasonCodeId = ReasonCodeId(0x4853_0001);
    pub const HS_HEARTBEAT_RESTORED: ReasonCodeId = ReasonCodeId(0x4853_0002);
    pub const HS_DEGRADE_PRIMARY: ReasonCodeId = ReasonCodeId(0x4853_0003);
    pub const HS_DEGRADE_GUARD: ReasonCodeId = ReasonCodeId(0x4853_0004);
    pub const HS_RECONNECT_PRIMARY: ReasonCodeId = ReasonCodeId(0x4853_0005);
    pub const HS_RECONNECT_GUARD: ReasonCodeId = ReasonCodeId(0x4853_0006);
    pub const HS_RECONNECTED: ReasonCodeId = ReasonCodeId(0x4853_0007);
    pub const HS_RESET: ReasonCodeId = ReasonCodeId(0x4853_0008);
    pub const HS_RECONNECT_UNARMED: ReasonCodeId = ReasonCodeId(0x4853_0009);
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error("illegal handshake transition: {operation} from {}", from.as_str())]
    IllegalTransition {
        operation: &'static str,
        from: HandshakeState,
    },
    #[error(transparent)]
    Timer(#[from] TimerError),
}

pub type TransitionListener = dyn Fn(&TransitionEvent) + Send + Sync;
pub type EngagementListener = dyn Fn(&EngagementNotice) + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FsmInstanceId(u64);

static NEXT_FSM_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Cloneable handle; clones share one machine.
#[derive(Clone)]
pub struct HandshakeFsm {
    shared: Arc<FsmShared>,
}

struct FsmShared {
    id: FsmInstanceId,
    timer: Arc<dyn TimerDriver>,
    budgets: HandshakeBudgets,
    core: Mutex<FsmCore>,
    transition_listeners: Mutex<Vec<Arc<TransitionListener>>>,
    engagement_listeners: Mutex<Vec<Arc<EngagementListener>>>,
}

struct LiveTimer {
    seq: u64,
    handle: TimerHandle,
}

struct FsmCore {
    state: HandshakeState,
    // Last explicit engagement call; only effective while READY.
    engagement_intent: EngagementState,
    live_timers: BTreeMap<TimerLabel, LiveTimer>,
    next_arm_seq: u64,
    last_transition_at: Option<MonotonicTimeNs>,
}

enum Notice {
    Transition(TransitionEvent),
    Engagement(EngagementNotice),
}

impl HandshakeFsm {
    pub fn new(timer: Arc<dyn TimerDriver>, budgets: HandshakeBudgets) -> Self {
        let id = FsmInstanceId(NEXT_FSM_INSTANCE_ID.fetch_add(1, Ordering::Relaxed));
        Self {
            shared: Arc::new(FsmShared {
                id,
                timer,
                budgets,
                core: Mutex::new(FsmCore {
                    state: HandshakeState::Unpaired,
                    engagement_intent: EngagementState::Idle,
                    live_timers: BTreeMap::new(),
                    next_arm_seq: 1,
                    last_transition_at: None,
                }),
                transition_listeners: Mutex::new(Vec::new()),
                engagement_listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> FsmInstanceId {
        self.shared.id
    }

    pub fn budgets(&self) -> HandshakeBudgets {
        self.shared.budgets
    }

    pub fn state(&self) -> HandshakeState {
        self.shared.lock_core().state
    }

    pub fn engagement_state(&self) -> EngagementState {
        self.shared.lock_core().effective_engagement()
    }

    pub fn live_timer_labels(&self) -> Vec<TimerLabel> {
        self.shared.lock_core().live_timers.keys().copied().collect()
    }

    pub fn snapshot(&self) -> HandshakeSnapshot {
        let core = self.shared.lock_core();
        HandshakeSnapshot {
            schema_version: PH1HS_CONTRACT_VERSION,
            state: core.state,
            engagement: core.effective_engagement(),
            live_timers: core.live_timers.keys().copied().collect(),
            last_transition_at: core.last_transition_at,
        }
    }

    /// UNPAIRED -> READY. Fails from any other state with no side effects.
    pub fn pair(&self) -> Result<(), HandshakeError> {
        let notices = {
            let mut core = self.shared.lock_core();
            if core.state != HandshakeState::Unpaired {
                return Err(HandshakeError::IllegalTransition {
                    operation: "pair",
                    from: core.state,
                });
            }
            self.shared.arm_window(&mut core, BudgetWindow::Degrade)?;
            info!(fsm = self.shared.id.0, "wearable paired");
            self.shared
                .transition(&mut core, HandshakeState::Ready, reason_codes::HS_PAIRED)
        };
        self.shared.dispatch(notices);
        Ok(())
    }

    /// Restarts the degrade window while READY and restores READY from DEGRADED.
    /// No-op while UNPAIRED or RECONNECTING. Returns the resulting state.
    pub fn heartbeat(&self) -> Result<HandshakeState, HandshakeError> {
        let (state, notices) = {
            let mut core = self.shared.lock_core();
            match core.state {
                HandshakeState::Ready => {
                    self.shared.arm_window(&mut core, BudgetWindow::Degrade)?;
                    (HandshakeState::Ready, Vec::new())
                }
                HandshakeState::Degraded => {
                    self.shared.arm_window(&mut core, BudgetWindow::Degrade)?;
                    let notices = self.shared.transition(
                        &mut core,
                        HandshakeState::Ready,
                        reason_codes::HS_HEARTBEAT_RESTORED,
                    );
                    (HandshakeState::Ready, notices)
                }
                HandshakeState::Unpaired | HandshakeState::Reconnecting => {
                    debug!(
                        fsm = self.shared.id.0,
                        state = core.state.as_str(),
                        "heartbeat ignored"
                    );
                    (core.state, Vec::new())
                }
            }
        };
        self.shared.dispatch(notices);
        Ok(state)
    }

    /// RECONNECTING -> READY. Fails from any other state with no side effects.
    pub fn reconnected(&self) -> Result<(), HandshakeError> {
        let notices = {
            let mut core = self.shared.lock_core();
            if core.state != HandshakeState::Reconnecting {
                return Err(HandshakeError::IllegalTransition {
                    operation: "reconnected",
                    from: core.state,
                });
            }
            self.shared.arm_window(&mut core, BudgetWindow::Degrade)?;
            info!(fsm = self.shared.id.0, "wearable reconnected");
            self.shared.transition(
                &mut core,
                HandshakeState::Ready,
                reason_codes::HS_RECONNECTED,
            )
        };
        self.shared.dispatch(notices);
        Ok(())
    }

    /// Cancels every named timer and returns to UNPAIRED. Always safe.
    pub fn reset(&self) {
        let notices = {
            let mut core = self.shared.lock_core();
            core.cancel_all();
            core.engagement_intent = EngagementState::Idle;
            if core.state == HandshakeState::Unpaired {
                Vec::new()
            } else {
                info!(fsm = self.shared.id.0, from = core.state.as_str(), "handshake reset");
                self.shared
                    .transition(&mut core, HandshakeState::Unpaired, reason_codes::HS_RESET)
            }
        };
        self.shared.dispatch(notices);
    }

    pub fn mark_user_active(&self) {
        self.set_engagement(EngagementState::Active);
    }

    pub fn mark_user_idle(&self) {
        self.set_engagement(EngagementState::Idle);
    }

    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&TransitionEvent) + Send + Sync + 'static,
    {
        lock_recover(&self.shared.transition_listeners).push(Arc::new(listener));
    }

    /// Registers an engagement listener and immediately calls it with the
    /// current engagement value.
    pub fn subscribe_engagement<F>(&self, listener: F)
    where
        F: Fn(&EngagementNotice) + Send + Sync + 'static,
    {
        let listener: Arc<EngagementListener> = Arc::new(listener);
        let current = {
            let core = self.shared.lock_core();
            lock_recover(&self.shared.engagement_listeners).push(listener.clone());
            core.engagement_notice(self.shared.timer.now())
        };
        listener(&current);
    }

    fn set_engagement(&self, engagement: EngagementState) {
        let notices = {
            let mut core = self.shared.lock_core();
            if core.engagement_intent == engagement {
                return;
            }
            core.engagement_intent = engagement;
            if core.state == HandshakeState::Ready {
                debug!(
                    fsm = self.shared.id.0,
                    engagement = engagement.as_str(),
                    "engagement changed"
                );
                vec![Notice::Engagement(
                    core.engagement_notice(self.shared.timer.now()),
                )]
            } else {
                Vec::new()
            }
        };
        self.shared.dispatch(notices);
    }
}

impl fmt::Debug for HandshakeFsm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeFsm")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

impl FsmShared {
    fn lock_core(&self) -> MutexGuard<'_, FsmCore> {
        lock_recover(&self.core)
    }

    /// Schedules both timers of `window`, then cancels the other window and
    /// any prior timers under the same labels. On failure nothing changes.
    fn arm_window(
        self: &Arc<Self>,
        core: &mut FsmCore,
        window: BudgetWindow,
    ) -> Result<(), TimerError> {
        let primary = self.schedule(core, window.primary())?;
        let guard = match self.schedule(core, window.guard()) {
            Ok(guard) => guard,
            Err(err) => {
                primary.handle.cancel();
                return Err(err);
            }
        };
        core.cancel_window(window.other());
        for (label, live) in [(window.primary(), primary), (window.guard(), guard)] {
            if let Some(prior) = core.live_timers.insert(label, live) {
                prior.handle.cancel();
            }
        }
        debug!(fsm = self.id.0, window = ?window, "budget window armed");
        Ok(())
    }

    fn schedule(
        self: &Arc<Self>,
        core: &mut FsmCore,
        label: TimerLabel,
    ) -> Result<LiveTimer, TimerError> {
        let seq = core.next_arm_seq;
        core.next_arm_seq = core.next_arm_seq.saturating_add(1);
        let weak = Arc::downgrade(self);
        let handle = self.timer.call_later(
            self.budgets.delay_for(label),
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.on_timer_fired(label, seq);
                }
            }),
        )?;
        Ok(LiveTimer { seq, handle })
    }

    // Applies only for the live arm of `label` and only from its source state.
    fn on_timer_fired(self: &Arc<Self>, label: TimerLabel, seq: u64) {
        let notices = {
            let mut core = self.lock_core();
            let is_live = core
                .live_timers
                .get(&label)
                .is_some_and(|live| live.seq == seq);
            if !is_live {
                warn!(
                    fsm = self.id.0,
                    timer = label.as_str(),
                    "stale timer firing discarded"
                );
                return;
            }
            core.live_timers.remove(&label);
            let (source, target, reason_code) = match label {
                TimerLabel::DegradePrimary => (
                    HandshakeState::Ready,
                    HandshakeState::Degraded,
                    reason_codes::HS_DEGRADE_PRIMARY,
                ),
                TimerLabel::DegradeGuard => (
                    HandshakeState::Ready,
                    HandshakeState::Degraded,
                    reason_codes::HS_DEGRADE_GUARD,
                ),
                TimerLabel::ReconnectPrimary => (
                    HandshakeState::Degraded,
                    HandshakeState::Reconnecting,
                    reason_codes::HS_RECONNECT_PRIMARY,
                ),
                TimerLabel::ReconnectGuard => (
                    HandshakeState::Degraded,
                    HandshakeState::Reconnecting,
                    reason_codes::HS_RECONNECT_GUARD,
                ),
            };
            if core.state != source {
                debug!(
                    fsm = self.id.0,
                    timer = label.as_str(),
                    state = core.state.as_str(),
                    "timer fired outside its source state"
                );
                return;
            }
            match target {
                HandshakeState::Degraded => {
                    match self.arm_window(&mut core, BudgetWindow::Reconnect) {
                        Ok(()) => self.transition(&mut core, target, reason_code),
                        Err(err) => {
                            // Without reconnect timers DEGRADED could never end.
                            error!(fsm = self.id.0, %err, "failed to arm reconnect window");
                            core.cancel_all();
                            let mut notices = self.transition(&mut core, target, reason_code);
                            notices.extend(self.transition(
                                &mut core,
                                HandshakeState::Reconnecting,
                                reason_codes::HS_RECONNECT_UNARMED,
                            ));
                            notices
                        }
                    }
                }
                _ => {
                    core.cancel_all();
                    self.transition(&mut core, target, reason_code)
                }
            }
        };
        self.dispatch(notices);
    }

    fn transition(
        &self,
        core: &mut FsmCore,
        to: HandshakeState,
        reason_code: ReasonCodeId,
    ) -> Vec<Notice> {
        let now = self.timer.now();
        let from = core.state;
        core.state = to;
        core.last_transition_at = Some(now);
        if to != HandshakeState::Ready {
            core.engagement_intent = EngagementState::Idle;
        }
        debug!(
            fsm = self.id.0,
            from = from.as_str(),
            to = to.as_str(),
            reason_code = reason_code.0,
            "handshake transition"
        );
        vec![
            Notice::Transition(TransitionEvent {
                schema_version: PH1HS_CONTRACT_VERSION,
                from,
                to,
                reason_code,
                t_event: now,
            }),
            Notice::Engagement(core.engagement_notice(now)),
        ]
    }

    // Runs listeners without the core lock so they may call back into the machine.
    fn dispatch(&self, notices: Vec<Notice>) {
        for notice in notices {
            match notice {
                Notice::Transition(ev) => {
                    let listeners = lock_recover(&self.transition_listeners).clone();
                    for listener in listeners {
                        listener(&ev);
                    }
                }
                Notice::Engagement(n) => {
                    let listeners = lock_recover(&self.engagement_listeners).clone();
                    for listener in listeners {
                        listener(&n);
                    }
                }
            }
        }
    }
}

impl FsmCore {
    fn effective_engagement(&self) -> EngagementState {
        if self.state == HandshakeState::Ready {
            self.engagement_intent
        } else {
            EngagementState::Idle
        }
    }

    fn engagement_notice(&self, now: MonotonicTimeNs) -> EngagementNotice {
        EngagementNotice {
            schema_version: PH1HS_CONTRACT_VERSION,
            engagement: self.effective_engagement(),
            handshake_state: self.state,
            t_event: now,
        }
    }

    fn cancel_window(&mut self, window: BudgetWindow) {
        for label in [window.primary(), window.guard()] {
            if let Some(live) = self.live_timers.remove(&label) {
                live.handle.cancel();
            }
        }
    }

    fn cancel_all(&mut self) {
        for (_, live) in std::mem::take(&mut self.live_timers) {
            live.handle.cancel();
        }
    }
}

fn lock_recover<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
