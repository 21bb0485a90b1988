// =============================================================================
// Watchlist — filtering, scoring and refresh orchestration
// =============================================================================

pub mod filters;
pub mod manager;
pub mod scoring;

pub use manager::{WatchlistError, WatchlistManager};
