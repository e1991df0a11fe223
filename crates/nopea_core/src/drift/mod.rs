pub mod engine;
pub mod normalize;

pub use engine::{classify, three_way, DriftEngine, DriftKind, ReconcileOutcome};
pub use normalize::{hash, normalize, normalized_hash};
