#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use aura_engines::{DutyCycleError, DutyCycleScheduler, HandshakeFsm};
use aura_kernel_contracts::ph1duty::DutyChannel;
use aura_kernel_contracts::ph1hs::HandshakeState;
use aura_kernel_contracts::ph1skill::{CameraClip, ClipDuration, SkillId};
use aura_kernel_contracts::ReasonCodeId;
use serde::Serialize;
use tracing::{debug, trace};

pub mod reason_codes {
    use aura_kernel_contracts::ReasonCodeId;

    // PH1.SKILL gate reason-code namespace.
    pub const SKILL_ADMITTED: ReasonCodeId = ReasonCodeId(0x534B_0001);
    pub const SKILL_DENIED_NOT_READY: ReasonCodeId = ReasonCodeId(0x534B_0002);
    pub const SKILL_DENIED_THROTTLED: ReasonCodeId = ReasonCodeId(0x534B_0003);
}

pub trait CameraProvider {
    fn camera(&self, duration: ClipDuration) -> CameraClip;
}

pub trait InferenceBackend {
    type Features: ?Sized;
    type Output;

    fn infer(&self, model_id: &SkillId, features: &Self::Features) -> Self::Output;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateDecision {
    Admitted,
    NotReady(HandshakeState),
    Throttled,
}

impl GateDecision {
    pub fn is_admitted(self) -> bool {
        matches!(self, GateDecision::Admitted)
    }

    pub fn reason_code(self) -> ReasonCodeId {
        match self {
            GateDecision::Admitted => reason_codes::SKILL_ADMITTED,
            GateDecision::NotReady(_) => reason_codes::SKILL_DENIED_NOT_READY,
            GateDecision::Throttled => reason_codes::SKILL_DENIED_THROTTLED,
        }
    }
}

/// Optional observer of gate decisions. Must not block.
pub trait GateMetricsSink: Send + Sync {
    fn record(&self, channel: DutyChannel, decision: GateDecision);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChannelCounts {
    pub admitted: u64,
    pub denied_not_ready: u64,
    pub denied_throttled: u64,
}

impl ChannelCounts {
    pub fn requests(&self) -> u64 {
        self.admitted + self.denied_not_ready + self.denied_throttled
    }
}

/// In-memory [`GateMetricsSink`] keeping per-channel totals.
#[derive(Debug, Default)]
pub struct AdmissionCounters {
    counts: Mutex<BTreeMap<DutyChannel, ChannelCounts>>,
}

impl AdmissionCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counts(&self, channel: DutyChannel) -> ChannelCounts {
        self.snapshot().get(&channel).copied().unwrap_or_default()
    }

    pub fn snapshot(&self) -> BTreeMap<DutyChannel, ChannelCounts> {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn total(&self) -> ChannelCounts {
        self.snapshot()
            .values()
            .fold(ChannelCounts::default(), |acc, c| ChannelCounts {
                admitted: acc.admitted + c.admitted,
                denied_not_ready: acc.denied_not_ready + c.denied_not_ready,
                denied_throttled: acc.denied_throttled + c.denied_throttled,
            })
    }
}

impl GateMetricsSink for AdmissionCounters {
    fn record(&self, channel: DutyChannel, decision: GateDecision) {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = counts.entry(channel).or_default();
        match decision {
            GateDecision::Admitted => entry.admitted += 1,
            GateDecision::NotReady(_) => entry.denied_not_ready += 1,
            GateDecision::Throttled => entry.denied_throttled += 1,
        }
    }
}

#[derive(Clone)]
pub struct SkillGate {
    fsm: HandshakeFsm,
    scheduler: DutyCycleScheduler,
    metrics: Option<Arc<dyn GateMetricsSink>>,
}

impl SkillGate {
    /// Binds `scheduler` to `fsm` (a no-op if already bound to it).
    pub fn new(
        fsm: HandshakeFsm,
        scheduler: DutyCycleScheduler,
    ) -> Result<Self, DutyCycleError> {
        scheduler.bind(&fsm)?;
        Ok(Self {
            fsm,
            scheduler,
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, sink: Arc<dyn GateMetricsSink>) -> Self {
        self.metrics = Some(sink);
        self
    }

    pub fn fsm(&self) -> &HandshakeFsm {
        &self.fsm
    }

    pub fn scheduler(&self) -> &DutyCycleScheduler {
        &self.scheduler
    }

    /// READY is checked first so a disconnected caller never spends a slot.
    pub fn admit(&self, channel: DutyChannel) -> GateDecision {
        let state = self.fsm.state();
        let decision = if state != HandshakeState::Ready {
            GateDecision::NotReady(state)
        } else if self.scheduler.try_acquire(Some(channel)) {
            GateDecision::Admitted
        } else {
            GateDecision::Throttled
        };
        trace!(
            channel = channel.as_str(),
            reason_code = decision.reason_code().0,
            "gate decision"
        );
        if let Some(sink) = &self.metrics {
            sink.record(channel, decision);
        }
        decision
    }

    pub fn capture_clip<P>(
        &self,
        provider: &P,
        duration: Option<ClipDuration>,
    ) -> Option<CameraClip>
    where
        P: CameraProvider + ?Sized,
    {
        if !self.admit(DutyChannel::Vision).is_admitted() {
            return None;
        }
        let duration = duration.unwrap_or_default();
        let clip = provider.camera(duration);
        debug!(
            frames = clip.len(),
            seconds = duration.as_secs_f64(),
            "clip captured"
        );
        Some(clip)
    }

    /// Runs `backend` with `skill` as the model id. `channel` defaults to vision.
    pub fn run_inference<B>(
        &self,
        backend: &B,
        skill: &SkillId,
        features: &B::Features,
        channel: Option<DutyChannel>,
    ) -> Option<B::Output>
    where
        B: InferenceBackend + ?Sized,
    {
        let channel = channel.unwrap_or(DutyChannel::Vision);
        if !self.admit(channel).is_admitted() {
            return None;
        }
        debug!(skill = skill.as_str(), channel = channel.as_str(), "inference admitted");
        Some(backend.infer(skill, features))
    }
}

impl fmt::Debug for SkillGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SkillGate")
            .field("fsm", &self.fsm)
            .field("scheduler", &self.scheduler)
            .field("metrics", &self.metrics.is_some())
            .finish()
    }
}
