//! Test-loop observers: statistics, console output, metrics files and
//! artifact persistence.

mod chain;
mod console;
mod csv;
mod stats;
mod write;

pub use chain::{HookChain, Reduced, TestLoopHook};
pub use console::ConsoleLogHook;
pub use csv::{read_entity_ids, MetricsCsvHook};
pub use stats::ProbabilityStatsHook;
pub use write::ArtifactWriteHook;
