//! Running population statistics used to scale feature vectors.

use serde::{Deserialize, Serialize};

/// Per-dimension running mean and M2 (Welford's online algorithm).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PopulationStats {
    pub count: u64,
    pub mean: Vec<f64>,
    pub m2: Vec<f64>,
}

impl PopulationStats {
    pub fn new(dimension: usize) -> Self {
        Self {
            count: 0,
            mean: vec![0.0; dimension],
            m2: vec![0.0; dimension],
        }
    }

    pub fn dimension(&self) -> usize {
        self.mean.len()
    }

    /// Fold one vector into the running statistics. Vectors of the wrong
    /// dimension are ignored.
    pub fn observe(&mut self, vector: &[f64]) {
        if vector.len() != self.dimension() {
            return;
        }
        self.count += 1;
        let n = self.count as f64;
        for (i, &x) in vector.iter().enumerate() {
            let delta = x - self.mean[i];
            self.mean[i] += delta / n;
            self.m2[i] += delta * (x - self.mean[i]);
        }
    }

    /// Population variance of dimension `i`.
    pub fn variance(&self, i: usize) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        (self.m2[i] / self.count as f64).max(0.0)
    }

    /// Root-mean-square magnitude of dimension `i`: `sqrt(variance + mean²)`.
    pub fn scale(&self, i: usize) -> f64 {
        (self.variance(i) + self.mean[i] * self.mean[i]).sqrt()
    }

    /// Divide every component by its population scale. Components whose
    /// scale is zero pass through unchanged.
    pub fn scale_vector(&self, vector: &[f64]) -> Vec<f64> {
        if self.count == 0 || vector.len() != self.dimension() {
            return vector.to_vec();
        }
        vector
            .iter()
            .enumerate()
            .map(|(i, &x)| {
                let s = self.scale(i);
                if s > f64::EPSILON {
                    x / s
                } else {
                    x
                }
            })
            .collect()
    }
}
