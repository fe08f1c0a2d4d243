//! Sizing batches: a hard memory budget per batch, and a learned preferred
//! batch length.

mod memory;
mod predictive;

pub use memory::{budget_bytes, estimate_item_bytes, MemoryAwareBatcher, ITEM_OVERHEAD_BYTES};
pub use predictive::{BatchObservation, OptimizerStats, PredictiveBatchOptimizer, PredictiveConfig};
