// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Accuracy statistics across runs and rounds.
//!
//! Repeat runs over one file use the population standard deviation; sampling
//! rounds are treated as a sample and use the `n - 1` denominator. Both are
//! 0.0 when fewer than two observations exist.

use rand::prelude::*;
use serde::{Deserialize, Serialize};

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn sum_sq_dev(values: &[f64]) -> f64 {
    let m = mean(values);
    values.iter().map(|v| (v - m).powi(2)).sum()
}

/// Standard deviation with denominator `n`
pub fn population_std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    (sum_sq_dev(values) / values.len() as f64).sqrt()
}

/// Standard deviation with denominator `n - 1`
pub fn sample_std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    (sum_sq_dev(values) / (values.len() - 1) as f64).sqrt()
}

/// Bootstrap confidence interval result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapCI {
    /// Original sample statistic
    pub observed: f64,
    /// Lower bound of confidence interval
    pub lower: f64,
    /// Upper bound of confidence interval
    pub upper: f64,
    /// Confidence level (e.g., 0.95 for 95% CI)
    pub confidence_level: f64,
    /// Number of bootstrap resamples used
    pub n_bootstrap: usize,
}

/// Percentile bootstrap for the mean of a small set of round accuracies
pub struct Bootstrap {
    /// Number of bootstrap resamples (default: 10,000)
    n_resamples: usize,
    /// Random seed for reproducibility
    seed: Option<u64>,
}

impl Default for Bootstrap {
    fn default() -> Self {
        Self {
            n_resamples: 10_000,
            seed: None,
        }
    }
}

impl Bootstrap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resamples(mut self, n: usize) -> Self {
        self.n_resamples = n.max(1);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Percentile confidence interval for the mean
    pub fn mean_ci(&self, data: &[f64], confidence: f64) -> BootstrapCI {
        if data.is_empty() {
            return BootstrapCI {
                observed: 0.0,
                lower: 0.0,
                upper: 0.0,
                confidence_level: confidence,
                n_bootstrap: 0,
            };
        }

        let observed = mean(data);
        let n = data.len();

        let mut rng = match self.seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };

        let mut bootstrap_stats: Vec<f64> = Vec::with_capacity(self.n_resamples);
        let mut resample = vec![0.0; n];
        for _ in 0..self.n_resamples {
            // Resample with replacement
            for elem in resample.iter_mut() {
                *elem = data[rng.gen_range(0..n)];
            }
            bootstrap_stats.push(mean(&resample));
        }
        bootstrap_stats.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let alpha = 1.0 - confidence;
        let len = bootstrap_stats.len();
        let lower_idx = ((alpha / 2.0) * len as f64).floor() as usize;
        let upper_idx = (((1.0 - alpha / 2.0) * len as f64).ceil() as usize).saturating_sub(1);

        BootstrapCI {
            observed,
            lower: bootstrap_stats[lower_idx.min(len - 1)],
            upper: bootstrap_stats[upper_idx.min(len - 1)],
            confidence_level: confidence,
            n_bootstrap: len,
        }
    }
}
