pub mod args;
pub mod buffer;
pub mod error;
pub mod events;
pub mod filter;
pub mod metrics;
pub mod runner;
pub mod scheduler;
pub mod settings;
pub mod statemachine;
pub mod telemetry;
pub mod watch;

pub use crate::error::{Error, Result};
pub use crate::scheduler::DrainScheduler;
