#![forbid(unsafe_code)]

use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use aura_engines::timer::{check_delay, TimerId};
use aura_engines::{
    ConfigurationError, DutyCycleError, DutyCycleScheduler, HandshakeError, HandshakeFsm,
    TimerCallback, TimerDriver, TimerError, TimerHandle, UxBudgetsConfig,
};
use aura_kernel_contracts::common::duration_to_ns;
use aura_kernel_contracts::ph1duty::{DutyChannel, DutyCycleConfig};
use aura_kernel_contracts::ph1hs::{
    EngagementNotice, EngagementState, HandshakeBudgets, HandshakeSnapshot, HandshakeState,
    TransitionEvent,
};
use aura_kernel_contracts::{ContractViolation, MonotonicTimeNs};
use aura_os::ph1skill::{AdmissionCounters, ChannelCounts, GateDecision, SkillGate};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const DEFAULT_UX_BUDGETS_PATH: &str = "ux_budgets.yaml";
const EVENT_BUFFER: usize = 64;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("connection runtime has shut down")]
    Closed,
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    DutyCycle(#[from] DutyCycleError),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("{var}: {source}")]
    Env {
        var: &'static str,
        #[source]
        source: ContractViolation,
    },
    #[error("{var}: not a number: {raw:?}")]
    EnvNumber { var: &'static str, raw: String },
}

/// Startup settings read from the process environment.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeSettings {
    pub ux_budgets_path: PathBuf,
    pub duty: DutyCycleConfig,
}

impl RuntimeSettings {
    pub fn from_env() -> Result<Self, RuntimeError> {
        Self::from_env_var_map(|key| env::var(key).ok())
    }

    pub fn from_env_var_map<F>(mut env_getter: F) -> Result<Self, RuntimeError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let ux_budgets_path = env_getter("AURA_UX_BUDGETS_PATH")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_UX_BUDGETS_PATH.to_string());
        let preset = DutyCycleConfig::mvp_v1();
        let idle_hz = parse_hz("AURA_IDLE_HZ", env_getter("AURA_IDLE_HZ"), preset.idle_hz)?;
        let active_hz = parse_hz(
            "AURA_ACTIVE_HZ",
            env_getter("AURA_ACTIVE_HZ"),
            preset.active_hz,
        )?;
        let duty = DutyCycleConfig::v1(idle_hz, active_hz).map_err(|source| RuntimeError::Env {
            var: "AURA_IDLE_HZ/AURA_ACTIVE_HZ",
            source,
        })?;
        Ok(Self {
            ux_budgets_path: PathBuf::from(ux_budgets_path),
            duty,
        })
    }

    pub fn load_budgets(&self) -> Result<HandshakeBudgets, RuntimeError> {
        Ok(UxBudgetsConfig::load(&self.ux_budgets_path)?.handshake)
    }
}

fn parse_hz(var: &'static str, raw: Option<String>, default: f64) -> Result<f64, RuntimeError> {
    match raw.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
        None => Ok(default),
        Some(v) => v
            .parse::<f64>()
            .map_err(|_| RuntimeError::EnvNumber { var, raw: v.clone() }),
    }
}

enum RuntimeMessage {
    Request(Request),
    TimerFired {
        handle: TimerHandle,
        callback: TimerCallback,
    },
}

enum Request {
    Pair(oneshot::Sender<Result<(), HandshakeError>>),
    Heartbeat(oneshot::Sender<Result<HandshakeState, HandshakeError>>),
    Reconnected(oneshot::Sender<Result<(), HandshakeError>>),
    Reset(oneshot::Sender<()>),
    SetEngagement(EngagementState, oneshot::Sender<()>),
    Admit(DutyChannel, oneshot::Sender<GateDecision>),
    Status(oneshot::Sender<ConnectionStatus>),
    Shutdown,
}

/// Timer driver backed by the tokio clock. Each timer is a task that sleeps
/// until its deadline and then posts the callback to the actor, which runs
/// it only if the handle can still be claimed. Cancelling wakes the task so
/// it exits and drops the callback right away.
pub struct TokioTimerDriver {
    epoch: Instant,
    next_id: AtomicU64,
    tx: mpsc::WeakUnboundedSender<RuntimeMessage>,
}

impl TokioTimerDriver {
    fn new(tx: mpsc::WeakUnboundedSender<RuntimeMessage>) -> Self {
        Self {
            epoch: Instant::now(),
            next_id: AtomicU64::new(1),
            tx,
        }
    }
}

impl TimerDriver for TokioTimerDriver {
    fn now(&self) -> MonotonicTimeNs {
        MonotonicTimeNs(duration_to_ns(self.epoch.elapsed()))
    }

    fn call_later(
        &self,
        delay: Duration,
        callback: TimerCallback,
    ) -> Result<TimerHandle, TimerError> {
        check_delay(delay)?;
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| TimerError::DriverClosed)?;
        if self.tx.upgrade().is_none() {
            return Err(TimerError::DriverClosed);
        }
        let id = TimerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let cancelled = Arc::new(Notify::new());
        let wake = cancelled.clone();
        let handle = TimerHandle::new(id, self.now().saturating_add(delay))
            .with_cancel_hook(move || wake.notify_one());
        let deadline = Instant::now() + delay;
        let weak = self.tx.clone();
        let fired = handle.clone();
        runtime.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                _ = cancelled.notified() => return,
            }
            if !fired.is_pending() {
                return;
            }
            if let Some(tx) = weak.upgrade() {
                let _ = tx.send(RuntimeMessage::TimerFired {
                    handle: fired,
                    callback,
                });
            }
        });
        Ok(handle)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub snapshot: HandshakeSnapshot,
    pub current_period_ms: u64,
    pub scheduler_engagement: EngagementState,
    pub admissions: ChannelCounts,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuntimeEvent {
    Transition(TransitionEvent),
    Engagement(EngagementNotice),
}

/// Cloneable async front end to a [`ConnectionRuntime`].
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    tx: mpsc::UnboundedSender<RuntimeMessage>,
    events: broadcast::Sender<RuntimeEvent>,
}

impl ConnectionHandle {
    pub async fn pair(&self) -> Result<(), RuntimeError> {
        Ok(self.call(Request::Pair).await??)
    }

    pub async fn heartbeat(&self) -> Result<HandshakeState, RuntimeError> {
        Ok(self.call(Request::Heartbeat).await??)
    }

    pub async fn reconnected(&self) -> Result<(), RuntimeError> {
        Ok(self.call(Request::Reconnected).await??)
    }

    pub async fn reset(&self) -> Result<(), RuntimeError> {
        self.call(Request::Reset).await
    }

    pub async fn mark_user_active(&self) -> Result<(), RuntimeError> {
        self.call(|reply| Request::SetEngagement(EngagementState::Active, reply))
            .await
    }

    pub async fn mark_user_idle(&self) -> Result<(), RuntimeError> {
        self.call(|reply| Request::SetEngagement(EngagementState::Idle, reply))
            .await
    }

    /// Gate decision for one unit of work on `channel`.
    pub async fn admit(&self, channel: DutyChannel) -> Result<GateDecision, RuntimeError> {
        self.call(|reply| Request::Admit(channel, reply)).await
    }

    pub async fn status(&self) -> Result<ConnectionStatus, RuntimeError> {
        self.call(Request::Status).await
    }

    /// Transition and engagement broadcasts from the point of subscription on.
    pub fn events(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.events.subscribe()
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(RuntimeMessage::Request(Request::Shutdown));
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Request,
    ) -> Result<T, RuntimeError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RuntimeMessage::Request(make(reply)))
            .map_err(|_| RuntimeError::Closed)?;
        rx.await.map_err(|_| RuntimeError::Closed)
    }
}

pub struct ConnectionRuntime {
    fsm: HandshakeFsm,
    gate: SkillGate,
    counters: Arc<AdmissionCounters>,
    rx: mpsc::UnboundedReceiver<RuntimeMessage>,
}

impl ConnectionRuntime {
    /// Builds the machine and scheduler and spawns the actor on the current
    /// tokio runtime. The actor stops on `shutdown` or once every handle is
    /// dropped.
    pub fn spawn(
        budgets: HandshakeBudgets,
        duty: DutyCycleConfig,
    ) -> Result<(ConnectionHandle, JoinHandle<()>), RuntimeError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let driver: Arc<dyn TimerDriver> = Arc::new(TokioTimerDriver::new(tx.downgrade()));
        let fsm = HandshakeFsm::new(driver.clone(), budgets);
        let scheduler = DutyCycleScheduler::from_config(driver, duty, DutyChannel::Vision)?;
        let counters = Arc::new(AdmissionCounters::new());
        let gate = SkillGate::new(fsm.clone(), scheduler)?.with_metrics(counters.clone());

        let sink = events.clone();
        fsm.subscribe(move |ev| {
            let _ = sink.send(RuntimeEvent::Transition(*ev));
        });
        let sink = events.clone();
        fsm.subscribe_engagement(move |notice| {
            let _ = sink.send(RuntimeEvent::Engagement(*notice));
        });

        let runtime = ConnectionRuntime {
            fsm,
            gate,
            counters,
            rx,
        };
        info!(
            idle_hz = duty.idle_hz,
            active_hz = duty.active_hz,
            "connection runtime started"
        );
        let join = tokio::spawn(runtime.run());
        Ok((ConnectionHandle { tx, events }, join))
    }

    async fn run(mut self) {
        while let Some(message) = self.rx.recv().await {
            match message {
                RuntimeMessage::TimerFired { handle, callback } => {
                    if handle.try_begin_fire() {
                        callback();
                    } else {
                        debug!(timer_id = handle.id().0, "cancelled timer dropped");
                    }
                }
                RuntimeMessage::Request(Request::Shutdown) => break,
                RuntimeMessage::Request(request) => self.handle(request),
            }
        }
        self.fsm.reset();
        info!("connection runtime stopped");
    }

    fn handle(&self, request: Request) {
        // A dropped reply receiver only means the caller stopped waiting.
        match request {
            Request::Pair(reply) => {
                let _ = reply.send(self.fsm.pair());
            }
            Request::Heartbeat(reply) => {
                let _ = reply.send(self.fsm.heartbeat());
            }
            Request::Reconnected(reply) => {
                let _ = reply.send(self.fsm.reconnected());
            }
            Request::Reset(reply) => {
                self.fsm.reset();
                let _ = reply.send(());
            }
            Request::SetEngagement(engagement, reply) => {
                match engagement {
                    EngagementState::Active => self.fsm.mark_user_active(),
                    EngagementState::Idle => self.fsm.mark_user_idle(),
                }
                let _ = reply.send(());
            }
            Request::Admit(channel, reply) => {
                let _ = reply.send(self.gate.admit(channel));
            }
            Request::Status(reply) => {
                let _ = reply.send(self.status());
            }
            Request::Shutdown => warn!("shutdown handled outside the dispatch loop"),
        }
    }

    fn status(&self) -> ConnectionStatus {
        let scheduler = self.gate.scheduler();
        ConnectionStatus {
            snapshot: self.fsm.snapshot(),
            current_period_ms: u64::try_from(scheduler.current_period().as_millis())
                .unwrap_or(u64::MAX),
            scheduler_engagement: scheduler.engagement(),
            admissions: self.counters.total(),
        }
    }
}

/// Installs the fmt subscriber with `RUST_LOG` filtering (default `aura=info`).
pub fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("aura=info"));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
        .with(filter)
        .try_init();
}
