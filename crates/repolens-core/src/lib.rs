//! repolens core library: project fingerprinting, similarity search and a
//! persisted learning store for code-analysis results.
//!
//! A finalized metric report flows through [`fingerprint`] extraction, is
//! recorded by [`history`] together with its fingerprint and the
//! [`learning`] updates in one SQLite transaction, and is then published to
//! the [`index`] for similarity queries. [`engine::Analyzer`] ties the
//! pieces together.

pub mod config;
pub mod engine;
pub mod errors;
pub mod fingerprint;
pub mod history;
pub mod index;
pub mod learning;
pub mod logging;
pub mod models;
pub mod store;

pub use config::EngineConfig;
pub use engine::{AnalysisOutcome, Analyzer, SimilarProject};
pub use errors::{ErrorKind, ErrorPayload, RepolensError, RepolensResult};
pub use fingerprint::extractor::FeatureExtractor;
pub use fingerprint::tokenizer::{IdentifierTokenizer, Tokenizer};
pub use fingerprint::Fingerprint;
pub use history::{AnalysisTicket, HistoryManager, MetricName, RunDelta, TrendPoint};
pub use index::linear::LinearIndex;
pub use index::{SimilarityHit, SimilarityIndex};
pub use learning::{FixCatalog, LearningEntry, PatternLearner, PrunePolicy, Suggestion};
pub use logging::init_logging;
pub use models::{AnalysisRun, Issue, MetricReport, Project, ProjectState, RunSummary};
