#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use aura_engines::{
    DutyCycleError, DutyCycleScheduler, HandshakeError, HandshakeFsm, SimulatedTimerDriver,
    TimerDriver,
};
use aura_kernel_contracts::ph1duty::{DutyChannel, DutyCycleConfig};
use aura_kernel_contracts::ph1hs::{EngagementState, HandshakeBudgets};
use aura_kernel_contracts::ph1skill::SkillId;
use aura_kernel_contracts::{ContractViolation, MonotonicTimeNs};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::ph1skill::{AdmissionCounters, InferenceBackend, SkillGate};

pub const SIM_SKILL_ID: &str = "duty_sim";

#[derive(Debug, Error)]
pub enum DutySimError {
    #[error("invalid timeline segment {segment:?}: {reason}")]
    InvalidTimeline {
        segment: String,
        reason: &'static str,
    },
    #[error("tick must be > 0")]
    ZeroTick,
    #[error(transparent)]
    Contract(#[from] ContractViolation),
    #[error(transparent)]
    DutyCycle(#[from] DutyCycleError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineSegment {
    pub duration_ms: u64,
    pub engagement: EngagementState,
}

impl TimelineSegment {
    pub fn new(duration: Duration, engagement: EngagementState) -> Self {
        Self {
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            engagement,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

/// Parses `10:idle,5:active,...` (seconds, fractional allowed).
pub fn parse_timeline(raw: &str) -> Result<Vec<TimelineSegment>, DutySimError> {
    let mut segments = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let invalid = |reason| DutySimError::InvalidTimeline {
            segment: part.to_string(),
            reason,
        };
        let (secs, engagement) = part
            .split_once(':')
            .ok_or_else(|| invalid("expected <seconds>:<idle|active>"))?;
        let secs: f64 = secs
            .trim()
            .parse()
            .map_err(|_| invalid("seconds must be a number"))?;
        let duration = aura_kernel_contracts::common::positive_secs("timeline.seconds", secs)?;
        let engagement = match engagement.trim().to_ascii_lowercase().as_str() {
            "idle" => EngagementState::Idle,
            "active" => EngagementState::Active,
            _ => return Err(invalid("engagement must be idle or active")),
        };
        segments.push(TimelineSegment::new(duration, engagement));
    }
    if segments.is_empty() {
        return Err(DutySimError::InvalidTimeline {
            segment: raw.to_string(),
            reason: "timeline must have at least one segment",
        });
    }
    Ok(segments)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DutySimConfig {
    pub idle_hz: f64,
    pub active_hz: f64,
    pub tick_ms: u64,
    pub timeline: Vec<TimelineSegment>,
}

impl DutySimConfig {
    /// 10s idle, 5s active, twice over, one request every 100ms.
    pub fn mvp_v1() -> Self {
        let preset = DutyCycleConfig::mvp_v1();
        let idle = TimelineSegment::new(Duration::from_secs(10), EngagementState::Idle);
        let active = TimelineSegment::new(Duration::from_secs(5), EngagementState::Active);
        Self {
            idle_hz: preset.idle_hz,
            active_hz: preset.active_hz,
            tick_ms: 100,
            timeline: vec![idle, active, idle, active],
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DutySimReport {
    pub requests: u64,
    pub admitted: u64,
    pub admitted_idle: u64,
    pub admitted_active: u64,
    pub denied_throttled: u64,
    pub denied_not_ready: u64,
    /// Longest wait from a first denied idle request to the next admission.
    pub max_idle_admission_latency_ms: u64,
}

impl DutySimReport {
    pub fn admitted_ratio(&self) -> f64 {
        if self.requests == 0 {
            return 0.0;
        }
        self.admitted as f64 / self.requests as f64
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

struct NullBackend;

impl InferenceBackend for NullBackend {
    type Features = [f32];
    type Output = ();

    fn infer(&self, _model_id: &SkillId, _features: &[f32]) {}
}

pub fn run(config: &DutySimConfig) -> Result<DutySimReport, DutySimError> {
    if config.tick_ms == 0 {
        return Err(DutySimError::ZeroTick);
    }
    let tick = Duration::from_millis(config.tick_ms);
    let driver = Arc::new(SimulatedTimerDriver::new());
    let fsm = HandshakeFsm::new(driver.clone(), HandshakeBudgets::mvp_v1());
    let scheduler = DutyCycleScheduler::new(
        driver.clone(),
        config.idle_hz,
        config.active_hz,
        DutyChannel::Inference,
    )?;
    let counters = Arc::new(AdmissionCounters::new());
    let gate = SkillGate::new(fsm.clone(), scheduler)?.with_metrics(counters.clone());
    let skill = SkillId::new(SIM_SKILL_ID)?;
    let features = [0.0f32; 4];

    fsm.pair()?;
    let mut report = DutySimReport::default();
    for segment in &config.timeline {
        match segment.engagement {
            EngagementState::Active => fsm.mark_user_active(),
            EngagementState::Idle => fsm.mark_user_idle(),
        }
        debug!(
            engagement = segment.engagement.as_str(),
            duration_ms = segment.duration_ms,
            "timeline segment"
        );
        let segment_end = driver.now().saturating_add(segment.duration());
        let mut waiting_since: Option<MonotonicTimeNs> = None;
        while driver.now() < segment_end {
            // Keeps the link READY; a heartbeat in READY broadcasts nothing.
            fsm.heartbeat()?;
            let now = driver.now();
            report.requests += 1;
            let admitted = gate
                .run_inference(&NullBackend, &skill, &features[..], Some(DutyChannel::Inference))
                .is_some();
            if admitted {
                report.admitted += 1;
                match segment.engagement {
                    EngagementState::Idle => report.admitted_idle += 1,
                    EngagementState::Active => report.admitted_active += 1,
                }
            }
            if segment.engagement == EngagementState::Idle {
                match (admitted, waiting_since) {
                    (true, Some(since)) => {
                        note_latency(&mut report, now.saturating_duration_since(since));
                        waiting_since = None;
                    }
                    (false, None) => waiting_since = Some(now),
                    _ => {}
                }
            }
            driver.advance(tick);
        }
        if let Some(since) = waiting_since {
            note_latency(&mut report, segment_end.saturating_duration_since(since));
        }
    }

    let totals = counters.total();
    report.denied_throttled = totals.denied_throttled;
    report.denied_not_ready = totals.denied_not_ready;
    info!(
        requests = report.requests,
        admitted = report.admitted,
        max_idle_admission_latency_ms = report.max_idle_admission_latency_ms,
        "duty-cycle simulation finished"
    );
    Ok(report)
}

fn note_latency(report: &mut DutySimReport, waited: Duration) {
    let ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX);
    report.max_idle_admission_latency_ms = report.max_idle_admission_latency_ms.max(ms);
}
