//! Engine configuration, environment overrides and shared guardrails.

use std::path::PathBuf;

// Guardrails
pub const MAX_SIMILAR_RESULTS: usize = 100;
pub const MAX_VOCABULARY: usize = 4096;
pub const MAX_SAMPLE_CAPACITY: usize = 64;
pub const MIN_PARALLEL_CANDIDATES: usize = 256;
pub const BUSY_TIMEOUT_MS: u64 = 5000;

pub const DEFAULT_VECTOR_WEIGHT: f64 = 0.6;
pub const DEFAULT_TOKEN_WEIGHT: f64 = 0.4;
pub const DEFAULT_TOP_K: usize = 10;
pub const DEFAULT_SUGGESTION_THRESHOLD: u64 = 3;
pub const DEFAULT_SAMPLE_CAPACITY: usize = 5;
pub const DEFAULT_VOCABULARY_CAP: usize = 256;

pub fn clamp_limit(value: usize, maximum: usize) -> usize {
    value.clamp(1, maximum)
}

/// Runtime settings for an [`crate::engine::Analyzer`].
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub db_path: PathBuf,
    pub vector_weight: f64,
    pub token_weight: f64,
    pub top_k: usize,
    pub suggestion_threshold: u64,
    pub sample_capacity: usize,
    pub vocabulary_cap: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("~/.repolens/analysis.db"),
            vector_weight: DEFAULT_VECTOR_WEIGHT,
            token_weight: DEFAULT_TOKEN_WEIGHT,
            top_k: DEFAULT_TOP_K,
            suggestion_threshold: DEFAULT_SUGGESTION_THRESHOLD,
            sample_capacity: DEFAULT_SAMPLE_CAPACITY,
            vocabulary_cap: DEFAULT_VOCABULARY_CAP,
        }
    }
}

impl EngineConfig {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Self::default()
        }
    }

    /// Defaults overridden by `REPOLENS_*` environment variables. Unparseable
    /// values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(path) = env_string("REPOLENS_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        if let Some(w) = env_parse::<f64>("REPOLENS_VECTOR_WEIGHT") {
            config.vector_weight = w;
        }
        if let Some(w) = env_parse::<f64>("REPOLENS_TOKEN_WEIGHT") {
            config.token_weight = w;
        }
        if let Some(k) = env_parse::<usize>("REPOLENS_TOP_K") {
            config.top_k = k;
        }
        if let Some(t) = env_parse::<u64>("REPOLENS_SUGGESTION_THRESHOLD") {
            config.suggestion_threshold = t;
        }
        if let Some(c) = env_parse::<usize>("REPOLENS_SAMPLE_CAPACITY") {
            config.sample_capacity = c;
        }
        if let Some(c) = env_parse::<usize>("REPOLENS_VOCAB_CAP") {
            config.vocabulary_cap = c;
        }
        config.sanitized()
    }

    pub fn with_weights(mut self, vector_weight: f64, token_weight: f64) -> Self {
        self.vector_weight = vector_weight;
        self.token_weight = token_weight;
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_suggestion_threshold(mut self, threshold: u64) -> Self {
        self.suggestion_threshold = threshold;
        self
    }

    pub fn with_sample_capacity(mut self, capacity: usize) -> Self {
        self.sample_capacity = capacity;
        self
    }

    pub fn with_vocabulary_cap(mut self, cap: usize) -> Self {
        self.vocabulary_cap = cap;
        self
    }

    /// Clamp every knob into its supported range and renormalize the blend
    /// weights so they sum to 1.
    pub fn sanitized(mut self) -> Self {
        let (vw, tw) = normalize_weights(self.vector_weight, self.token_weight);
        self.vector_weight = vw;
        self.token_weight = tw;
        self.top_k = clamp_limit(self.top_k, MAX_SIMILAR_RESULTS);
        self.suggestion_threshold = self.suggestion_threshold.max(1);
        self.sample_capacity = clamp_limit(self.sample_capacity, MAX_SAMPLE_CAPACITY);
        self.vocabulary_cap = clamp_limit(self.vocabulary_cap, MAX_VOCABULARY);
        self
    }
}

pub fn normalize_weights(vector_weight: f64, token_weight: f64) -> (f64, f64) {
    let vw = if vector_weight.is_finite() { vector_weight.max(0.0) } else { 0.0 };
    let tw = if token_weight.is_finite() { token_weight.max(0.0) } else { 0.0 };
    let total = vw + tw;
    if total <= f64::EPSILON {
        return (DEFAULT_VECTOR_WEIGHT, DEFAULT_TOKEN_WEIGHT);
    }
    (vw / total, tw / total)
}

fn env_string(key: &str) -> Option<String> {
    match std::env::var(key) {
        Ok(val) => {
            let v = val.trim().to_string();
            if v.is_empty() {
                None
            } else {
                Some(v)
            }
        }
        Err(_) => None,
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.parse::<T>().ok())
}
