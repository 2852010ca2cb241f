//! Concurrent refinement: turning logged dirty cards into remembered set entries.

/// Zones, thresholds and the refinement thread pool.
pub mod controller;
/// The hot card cache.
pub mod hot_card_cache;
pub mod notifier;
/// Cleaning and refining single cards.
pub mod rem_set;
pub mod stats;
mod thread;

pub use self::controller::{ConcurrentRefine, Thresholds, ZonePolicy, Zones};
pub use self::hot_card_cache::HotCardCache;
pub use self::notifier::PrimaryNotifier;
pub use self::rem_set::CardRefiner;
pub use self::stats::RefinementStats;
