#![forbid(unsafe_code)]

pub mod common;
pub mod ph1duty;
pub mod ph1hs;
pub mod ph1skill;

pub use common::{ContractViolation, MonotonicTimeNs, ReasonCodeId, SchemaVersion, Validate};
