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

//! Sampling orchestrator.
//!
//! Each round draws an independent uniform sample without replacement from
//! the corpus, runs it through the dataset runner and records one accuracy.
//! The summary is computed only after every round has finished; any failed
//! round aborts the orchestration.

use crate::runner::{DatasetRunner, FileReport};
use crate::shuffle::derive_seed;
use crate::statistics::{mean, sample_std_dev, Bootstrap, BootstrapCI};
use crate::EvalError;
use mcqbench_core::{BenchConfig, Question, RoundStatistic, SummaryStatistic};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

/// Indices of the questions drawn for one round, ascending
pub fn draw_sample(
    corpus_len: usize,
    sample_n: usize,
    seed: u64,
    round_index: usize,
) -> Result<Vec<usize>, EvalError> {
    if sample_n > corpus_len {
        return Err(EvalError::SamplingExhaustion {
            requested: sample_n,
            available: corpus_len,
        });
    }

    let mut rng = StdRng::seed_from_u64(derive_seed(seed, &[round_index as u64]));
    let mut indices = rand::seq::index::sample(&mut rng, corpus_len, sample_n).into_vec();
    indices.sort_unstable();
    Ok(indices)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundReport {
    pub statistic: RoundStatistic,
    /// Corpus ids of the sampled questions
    pub question_ids: Vec<usize>,
    pub report: FileReport,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingReport {
    pub rounds: Vec<RoundReport>,
    pub summary: SummaryStatistic,
    /// Percentile bootstrap interval of the mean round accuracy
    pub confidence_interval: BootstrapCI,
}

impl SamplingReport {
    pub fn round_statistics(&self) -> Vec<RoundStatistic> {
        self.rounds.iter().map(|r| r.statistic.clone()).collect()
    }
}

pub struct SamplingOrchestrator {
    runner: DatasetRunner,
    sample_n: usize,
    rounds: usize,
    seed: u64,
    confidence: f64,
}

impl SamplingOrchestrator {
    pub fn new(runner: DatasetRunner, sample_n: usize, rounds: usize, seed: u64) -> Self {
        Self {
            runner,
            sample_n,
            rounds,
            seed,
            confidence: 0.95,
        }
    }

    pub fn from_config(config: &BenchConfig, runner: DatasetRunner) -> Result<Self, EvalError> {
        let sampling = config.sampling.as_ref().ok_or_else(|| {
            EvalError::Configuration("sampling workflow requires a [sampling] section".to_string())
        })?;
        Ok(Self::new(
            runner,
            sampling.sample_n,
            sampling.rounds,
            sampling.seed,
        ))
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub async fn run(
        &self,
        corpus: &[Question],
        prompt_lang: &str,
    ) -> Result<SamplingReport, EvalError> {
        if self.sample_n == 0 {
            return Err(EvalError::Configuration(
                "sample_n must be at least 1".to_string(),
            ));
        }
        if self.rounds == 0 {
            return Err(EvalError::Configuration(
                "rounds must be at least 1".to_string(),
            ));
        }

        let mut rounds = Vec::with_capacity(self.rounds);
        for round_index in 0..self.rounds {
            let indices = draw_sample(corpus.len(), self.sample_n, self.seed, round_index)?;
            let questions: Vec<Question> = indices.iter().map(|&i| corpus[i].clone()).collect();
            let question_ids = questions.iter().map(|q| q.id).collect();

            let name = format!("round_{}", round_index);
            tracing::info!(
                "Starting {} with {} of {} questions",
                name,
                self.sample_n,
                corpus.len()
            );
            let report = self
                .runner
                .run_questions(&name, questions, prompt_lang)
                .await?;
            if !report.is_complete() {
                return Err(EvalError::Cancelled {
                    completed: report.runs.iter().map(|r| r.results.len()).sum(),
                    total: self.sample_n * self.runner.repeat_runs(),
                });
            }

            let statistic = RoundStatistic {
                round_index,
                accuracy: report.mean_accuracy,
                n_questions: self.sample_n,
            };
            tracing::info!("{}: accuracy {:.4}", name, statistic.accuracy);
            rounds.push(RoundReport {
                statistic,
                question_ids,
                report,
            });
        }

        let accuracies: Vec<f64> = rounds.iter().map(|r| r.statistic.accuracy).collect();
        let summary = SummaryStatistic {
            mean_accuracy: mean(&accuracies),
            stddev_accuracy: sample_std_dev(&accuracies),
            n_rounds: rounds.len(),
        };
        let confidence_interval = Bootstrap::new()
            .with_seed(derive_seed(self.seed, &[u64::MAX]))
            .mean_ci(&accuracies, self.confidence);

        tracing::info!(
            "Sampling finished: {:.4} ± {:.4} over {} rounds ({:.0}% CI {:.4}-{:.4})",
            summary.mean_accuracy,
            summary.stddev_accuracy,
            summary.n_rounds,
            self.confidence * 100.0,
            confidence_interval.lower,
            confidence_interval.upper
        );

        Ok(SamplingReport {
            rounds,
            summary,
            confidence_interval,
        })
    }
}
