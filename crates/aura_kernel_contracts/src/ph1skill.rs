#![forbid(unsafe_code)]

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::common::positive_secs;
use crate::{ContractViolation, MonotonicTimeNs, SchemaVersion, Validate};

pub const PH1SKILL_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

pub const MAX_CLIP_SECONDS: f64 = 30.0;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SkillId(String);

impl SkillId {
    pub fn new(id: impl Into<String>) -> Result<Self, ContractViolation> {
        let id = Self(id.into());
        id.validate()?;
        Ok(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for SkillId {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0.trim().is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "skill_id",
                reason: "must not be empty",
            });
        }
        if self.0.len() > 64 {
            return Err(ContractViolation::InvalidValue {
                field: "skill_id",
                reason: "must be <= 64 chars",
            });
        }
        if !self
            .0
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':'))
        {
            return Err(ContractViolation::InvalidValue {
                field: "skill_id",
                reason: "must contain only [A-Za-z0-9_.:-]",
            });
        }
        Ok(())
    }
}

/// Requested clip length, bounded to `(0, MAX_CLIP_SECONDS]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ClipDuration(Duration);

impl ClipDuration {
    pub fn from_secs_f64(secs: f64) -> Result<Self, ContractViolation> {
        let d = positive_secs("clip_duration", secs)?;
        if secs > MAX_CLIP_SECONDS {
            return Err(ContractViolation::InvalidRange {
                field: "clip_duration",
                min: 0.0,
                max: MAX_CLIP_SECONDS,
                got: secs,
            });
        }
        Ok(Self(d))
    }

    pub fn as_duration(self) -> Duration {
        self.0
    }

    pub fn as_secs_f64(self) -> f64 {
        self.0.as_secs_f64()
    }
}

impl Default for ClipDuration {
    fn default() -> Self {
        Self(Duration::from_secs(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraFrame {
    pub captured_at: MonotonicTimeNs,
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraClip {
    pub schema_version: SchemaVersion,
    pub frames: Vec<CameraFrame>,
}

impl CameraClip {
    pub fn v1(frames: Vec<CameraFrame>) -> Result<Self, ContractViolation> {
        let clip = Self {
            schema_version: PH1SKILL_CONTRACT_VERSION,
            frames,
        };
        clip.validate()?;
        Ok(clip)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl Validate for CameraClip {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != PH1SKILL_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "camera_clip.schema_version",
                reason: "must match PH1SKILL_CONTRACT_VERSION",
            });
        }
        if self
            .frames
            .windows(2)
            .any(|w| w[1].captured_at < w[0].captured_at)
        {
            return Err(ContractViolation::InvalidValue {
                field: "camera_clip.frames",
                reason: "must be ordered by captured_at",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(t: u64) -> CameraFrame {
        CameraFrame {
            captured_at: MonotonicTimeNs(t),
            width: 2,
            height: 2,
            data: vec![0; 4],
        }
    }

    #[test]
    fn at_skill_contract_01_skill_id_is_a_bounded_token() {
        assert!(SkillId::new("scene_describe").is_ok());
        assert!(SkillId::new("vlm:caption-v2").is_ok());
        assert!(SkillId::new("").is_err());
        assert!(SkillId::new("has space").is_err());
        assert!(SkillId::new("x".repeat(65)).is_err());
    }

    #[test]
    fn at_skill_contract_02_clip_duration_is_bounded() {
        assert!(ClipDuration::from_secs_f64(0.0).is_err());
        assert!(ClipDuration::from_secs_f64(31.0).is_err());
        assert_eq!(
            ClipDuration::from_secs_f64(2.5).unwrap().as_duration(),
            Duration::from_millis(2_500)
        );
        assert_eq!(ClipDuration::default().as_secs_f64(), 1.0);
    }

    #[test]
    fn at_skill_contract_03_clip_frames_must_be_time_ordered() {
        assert!(CameraClip::v1(vec![frame(1), frame(2)]).is_ok());
        assert!(CameraClip::v1(vec![frame(2), frame(1)]).is_err());
        assert!(CameraClip::v1(Vec::new()).unwrap().is_empty());
    }
}
