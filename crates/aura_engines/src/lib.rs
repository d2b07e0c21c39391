#![forbid(unsafe_code)]

pub mod ph1duty;
pub mod ph1hs;
pub mod timer;
pub mod ux_budgets;

pub use ph1duty::{DutyCycleError, DutyCycleScheduler};
pub use ph1hs::{HandshakeError, HandshakeFsm};
pub use timer::{SimulatedTimerDriver, TimerCallback, TimerDriver, TimerError, TimerHandle};
pub use ux_budgets::{ConfigurationError, GestureDetectionCaps, UxBudgetsConfig};
