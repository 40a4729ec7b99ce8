//! Exact linear-scan similarity index.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rayon::prelude::*;
use tracing::debug;

use crate::config::{normalize_weights, MIN_PARALLEL_CANDIDATES};
use crate::errors::{RepolensError, RepolensResult};
use crate::fingerprint::stats::PopulationStats;
use crate::fingerprint::{Fingerprint, FEATURE_DIMENSION, FEATURE_SCHEMA_VERSION};
use crate::index::scoring::{blended_score, cosine, token_cosine};
use crate::index::{SimilarityHit, SimilarityIndex};

struct IndexEntry {
    project: String,
    run_id: i64,
    fingerprint: Fingerprint,
}

struct IndexState {
    entries: HashMap<String, Arc<IndexEntry>>,
    population: Arc<PopulationStats>,
}

/// Holds the latest fingerprint of every project and scores all of them per
/// query.
///
/// Entries are immutable `Arc` snapshots swapped under a write lock, so a
/// concurrent query observes either the previous entry or the new one.
pub struct LinearIndex {
    dimension: usize,
    schema_version: u32,
    vector_weight: f64,
    token_weight: f64,
    state: RwLock<IndexState>,
}

impl LinearIndex {
    pub fn new(vector_weight: f64, token_weight: f64) -> Self {
        Self::with_schema(FEATURE_DIMENSION, FEATURE_SCHEMA_VERSION, vector_weight, token_weight)
    }

    pub fn with_schema(
        dimension: usize,
        schema_version: u32,
        vector_weight: f64,
        token_weight: f64,
    ) -> Self {
        let (vector_weight, token_weight) = normalize_weights(vector_weight, token_weight);
        Self {
            dimension,
            schema_version,
            vector_weight,
            token_weight,
            state: RwLock::new(IndexState {
                entries: HashMap::new(),
                population: Arc::new(PopulationStats::new(dimension)),
            }),
        }
    }

    pub fn weights(&self) -> (f64, f64) {
        (self.vector_weight, self.token_weight)
    }

    fn check_schema(&self, fingerprint: &Fingerprint) -> RepolensResult<()> {
        if fingerprint.schema_version != self.schema_version
            || fingerprint.dimension() != self.dimension
        {
            return Err(RepolensError::schema_mismatch(
                format!("v{}/{}d", self.schema_version, self.dimension),
                format!("v{}/{}d", fingerprint.schema_version, fingerprint.dimension()),
            ));
        }
        Ok(())
    }

    fn score(
        &self,
        population: &PopulationStats,
        scaled_query: &[f64],
        query: &Fingerprint,
        entry: &IndexEntry,
    ) -> SimilarityHit {
        let scaled = population.scale_vector(&entry.fingerprint.vector);
        let structural = cosine(scaled_query, &scaled);
        let topical = token_cosine(&query.tokens, &entry.fingerprint.tokens);
        SimilarityHit {
            project_path: entry.project.clone(),
            run_id: entry.run_id,
            score: blended_score(structural, topical, self.vector_weight, self.token_weight),
        }
    }
}

/// Score descending, then most recent run, then path for a total order.
fn rank_order(a: &SimilarityHit, b: &SimilarityHit) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| b.run_id.cmp(&a.run_id))
        .then_with(|| a.project_path.cmp(&b.project_path))
}

impl SimilarityIndex for LinearIndex {
    fn insert(&self, project: &str, run_id: i64, fingerprint: Fingerprint) -> RepolensResult<()> {
        self.check_schema(&fingerprint)?;
        let entry = Arc::new(IndexEntry {
            project: project.to_string(),
            run_id,
            fingerprint,
        });
        let mut state = self.state.write();
        match state.entries.get(project) {
            Some(existing) if existing.run_id > run_id => {
                debug!(project, run_id, kept = existing.run_id, "ignoring stale fingerprint");
            }
            _ => {
                state.entries.insert(project.to_string(), entry);
            }
        }
        Ok(())
    }

    fn query(
        &self,
        fingerprint: &Fingerprint,
        k: usize,
        exclude_project: Option<&str>,
    ) -> RepolensResult<Vec<SimilarityHit>> {
        self.check_schema(fingerprint)?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let (candidates, population) = {
            let state = self.state.read();
            let candidates: Vec<Arc<IndexEntry>> = state
                .entries
                .values()
                .filter(|entry| Some(entry.project.as_str()) != exclude_project)
                .cloned()
                .collect();
            (candidates, Arc::clone(&state.population))
        };

        let scaled_query = population.scale_vector(&fingerprint.vector);
        let mut hits: Vec<SimilarityHit> = if candidates.len() >= MIN_PARALLEL_CANDIDATES {
            candidates
                .par_iter()
                .map(|entry| self.score(&population, &scaled_query, fingerprint, entry))
                .collect()
        } else {
            candidates
                .iter()
                .map(|entry| self.score(&population, &scaled_query, fingerprint, entry))
                .collect()
        };

        hits.sort_by(rank_order);
        hits.truncate(k);
        Ok(hits)
    }

    fn set_population(&self, stats: PopulationStats) {
        if stats.dimension() != self.dimension {
            return;
        }
        self.state.write().population = Arc::new(stats);
    }

    fn candidate(&self, project: &str) -> Option<(i64, Fingerprint)> {
        let state = self.state.read();
        state
            .entries
            .get(project)
            .map(|entry| (entry.run_id, entry.fingerprint.clone()))
    }

    fn remove(&self, project: &str) -> bool {
        self.state.write().entries.remove(project).is_some()
    }

    fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn schema_version(&self) -> u32 {
        self.schema_version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::extractor::FeatureExtractor;
    use crate::models::MetricReport;
    use std::collections::BTreeMap;

    fn fingerprint(loc: u64, cx: f64, maint: f64, lang: &str, share: f64) -> Fingerprint {
        let report = MetricReport::new(10, loc, cx, maint).with_language(lang, share);
        FeatureExtractor::default().extract(&report).unwrap()
    }

    fn populated_index(fps: &[(&str, i64, &Fingerprint)]) -> LinearIndex {
        let index = LinearIndex::new(0.6, 0.4);
        let mut stats = PopulationStats::new(FEATURE_DIMENSION);
        for (project, run_id, fp) in fps {
            stats.observe(&fp.vector);
            index.insert(project, *run_id, (*fp).clone()).unwrap();
        }
        index.set_population(stats);
        index
    }

    #[test]
    fn test_structurally_close_projects_rank_higher() {
        let a = fingerprint(1000, 2.0, 90.0, "py", 0.9);
        let b = fingerprint(1200, 2.1, 88.0, "py", 0.92);
        let c = fingerprint(1000, 40.0, 20.0, "js", 1.0);
        let index = populated_index(&[("/a", 1, &a), ("/b", 2, &b), ("/c", 3, &c)]);

        let hits = index.query(&a, 10, Some("/a")).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].project_path, "/b");
        assert_eq!(hits[1].project_path, "/c");
        assert!(hits[0].score > hits[1].score);
    }

    #[test]
    fn test_query_respects_k_and_exclusion() {
        let fps: Vec<Fingerprint> = (0..6)
            .map(|i| fingerprint(500 + i * 100, 1.0 + i as f64, 80.0, "rust", 1.0))
            .collect();
        let entries: Vec<(String, i64, &Fingerprint)> = fps
            .iter()
            .enumerate()
            .map(|(i, fp)| (format!("/p{i}"), i as i64 + 1, fp))
            .collect();
        let refs: Vec<(&str, i64, &Fingerprint)> =
            entries.iter().map(|(p, r, f)| (p.as_str(), *r, *f)).collect();
        let index = populated_index(&refs);

        let hits = index.query(&fps[0], 3, Some("/p0")).unwrap();
        assert_eq!(hits.len(), 3);
        assert!(hits.iter().all(|h| h.project_path != "/p0"));
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
        assert!(index.query(&fps[0], 0, None).unwrap().is_empty());
    }

    #[test]
    fn test_only_latest_run_is_a_candidate() {
        let old = fingerprint(1000, 2.0, 90.0, "py", 1.0);
        let new = fingerprint(1000, 30.0, 20.0, "js", 1.0);
        let index = LinearIndex::new(0.6, 0.4);
        index.insert("/x", 5, new.clone()).unwrap();
        index.insert("/x", 3, old.clone()).unwrap();
        assert_eq!(index.len(), 1);
        let hits = index.query(&new, 5, None).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].run_id, 5);
        assert_eq!(index.candidate("/x"), Some((5, new)));
        assert_eq!(index.candidate("/y"), None);
    }

    #[test]
    fn test_ties_prefer_most_recent_run() {
        let fp = fingerprint(1000, 2.0, 90.0, "py", 1.0);
        let index = LinearIndex::new(0.6, 0.4);
        index.insert("/older", 1, fp.clone()).unwrap();
        index.insert("/newer", 7, fp.clone()).unwrap();
        let hits = index.query(&fp, 2, None).unwrap();
        assert_eq!(hits[0].project_path, "/newer");
        assert_eq!(hits[1].project_path, "/older");
    }

    #[test]
    fn test_schema_mismatch_is_rejected() {
        let index = LinearIndex::new(0.6, 0.4);
        let short = Fingerprint {
            schema_version: FEATURE_SCHEMA_VERSION,
            vector: vec![1.0, 2.0],
            tokens: BTreeMap::new(),
        };
        assert!(matches!(
            index.insert("/p", 1, short.clone()),
            Err(RepolensError::SchemaMismatch { .. })
        ));
        assert!(matches!(
            index.query(&short, 5, None),
            Err(RepolensError::SchemaMismatch { .. })
        ));
        let mut future = fingerprint(10, 1.0, 1.0, "go", 1.0);
        future.schema_version = FEATURE_SCHEMA_VERSION + 1;
        assert!(index.insert("/p", 1, future).is_err());
    }

    #[test]
    fn test_topical_overlap_lifts_score() {
        let mut a = fingerprint(1000, 5.0, 60.0, "go", 1.0);
        let mut b = a.clone();
        let c = a.clone();
        a.tokens.insert("scheduler".into(), 1.0);
        b.tokens.insert("scheduler".into(), 1.0);
        let index = LinearIndex::new(0.6, 0.4);
        index.insert("/b", 1, b).unwrap();
        index.insert("/c", 2, c).unwrap();
        let hits = index.query(&a, 2, None).unwrap();
        assert_eq!(hits[0].project_path, "/b");
        assert!((hits[0].score - 1.0).abs() < 1e-9);
        assert!((hits[1].score - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_parallel_scan_matches_threshold_behaviour() {
        let base = fingerprint(800, 3.0, 70.0, "java", 1.0);
        let index = LinearIndex::new(0.6, 0.4);
        for i in 0..(MIN_PARALLEL_CANDIDATES + 10) {
            let fp = fingerprint(800 + i as u64, 3.0 + i as f64 * 0.01, 70.0, "java", 1.0);
            index.insert(&format!("/bulk/{i}"), i as i64, fp).unwrap();
        }
        let hits = index.query(&base, 25, None).unwrap();
        assert_eq!(hits.len(), 25);
        assert!(hits.windows(2).all(|w| rank_order(&w[0], &w[1]) != Ordering::Greater));
        assert!(index.remove("/bulk/0"));
        assert!(!index.remove("/bulk/0"));
    }
}
