#![forbid(unsafe_code)]

pub mod duty_sim;
pub mod ph1skill;
