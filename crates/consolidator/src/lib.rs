//! Consolidator: idle and daily memory consolidation passes (§4.7).

pub mod consolidator;
pub mod prompts;

pub use consolidator::{Consolidator, DailyStats, IdleStats};
