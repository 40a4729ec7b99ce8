//! Cross-project learning of recurring issue patterns.

pub mod fixes;
pub mod learner;
pub mod signature;

pub use fixes::{FixCatalog, FALLBACK_FIX};
pub use learner::{LearnerWriter, LearningEntry, PatternLearner, PrunePolicy, Suggestion};
pub use signature::issue_signature;
