pub mod outbound;

pub use outbound::{
    clock::SystemClock,
    memory::MemoryStore,
    persistence::SqliteStore,
    reporting::{JsonReportTrigger, NoopReportTrigger},
    simulator::{SimulatedZoneSource, SimulationProfile},
};
