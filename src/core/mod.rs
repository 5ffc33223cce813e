pub mod config;
pub mod domain;
pub mod error;
pub mod fsm;
pub mod ports;
pub mod stats;

pub use config::*;
pub use domain::*;
pub use error::{Error, Result};
pub use fsm::StageMachine;
pub use stats::StageStats;
