//! Near-neighbor search over run fingerprints.
//!
//! Callers only see the [`SimilarityIndex`] trait; [`linear::LinearIndex`] is
//! the exact scan used today.

pub mod linear;
pub mod scoring;

use serde::Serialize;

use crate::errors::RepolensResult;
use crate::fingerprint::stats::PopulationStats;
use crate::fingerprint::Fingerprint;

/// One ranked candidate returned by [`SimilarityIndex::query`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SimilarityHit {
    pub project_path: String,
    pub run_id: i64,
    pub score: f64,
}

/// Insert/query seam over fingerprint storage.
pub trait SimilarityIndex: Send + Sync {
    /// Add or replace a project's candidate. Older run ids never replace
    /// newer ones.
    fn insert(&self, project: &str, run_id: i64, fingerprint: Fingerprint) -> RepolensResult<()>;

    /// Top-`k` candidates by descending score, never including
    /// `exclude_project`.
    fn query(
        &self,
        fingerprint: &Fingerprint,
        k: usize,
        exclude_project: Option<&str>,
    ) -> RepolensResult<Vec<SimilarityHit>>;

    /// Replace the population statistics used to scale vectors.
    fn set_population(&self, stats: PopulationStats);

    /// The run id and fingerprint currently held for `project`.
    fn candidate(&self, project: &str) -> Option<(i64, Fingerprint)>;

    fn remove(&self, project: &str) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn dimension(&self) -> usize;

    fn schema_version(&self) -> u32;
}
