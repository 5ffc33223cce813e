//! Driven adapters: storage, clock, report output and the simulated plant.

pub mod clock;
pub mod memory;
pub mod persistence;
pub mod reporting;
pub mod simulator;
