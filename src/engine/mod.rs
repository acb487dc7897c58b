pub mod eligibility;
pub mod offer;
pub mod orders;
pub mod pool;
pub mod presence;
pub mod queue;
pub mod sweeper;
pub mod watcher;
