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

//! # mcqbench Evaluation Engine
//!
//! Turns multiple-choice questions into a bounded, rate-limited, retried
//! stream of chat-completion requests, grades the replies and aggregates
//! accuracy across repeated runs and sampling rounds.
//!
//! ## Example
//!
//! ```rust,ignore
//! use mcqbench_core::{BenchConfig, RateLimiter};
//! use mcqbench_evals::{DatasetRunner, OpenAIClient, QuestionEvaluator};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = BenchConfig::load(Some("config.toml".as_ref())).unwrap();
//!     let client = Arc::new(OpenAIClient::from_config(&config).unwrap());
//!     let limiter = Arc::new(RateLimiter::from_rate(config.llm_api.rate_limit()));
//!     let evaluator = QuestionEvaluator::from_config(&config, client, limiter).unwrap();
//!     let runner = DatasetRunner::from_config(&config, Arc::new(evaluator));
//!     let report = runner.run_file("datasets/mmlu.csv".as_ref(), "en").await.unwrap();
//!     println!("{:.4} ± {:.4}", report.mean_accuracy, report.std_accuracy);
//! }
//! ```

use mcqbench_core::{ConfigError, DatasetError};
use thiserror::Error;

pub mod analysis;
pub mod evaluator;
pub mod extract;
pub mod llm_client;
pub mod retry;
pub mod runner;
pub mod sampling;
pub mod shuffle;
pub mod statistics;

pub use analysis::LabelDistribution;
pub use evaluator::QuestionEvaluator;
pub use extract::{
    build_extractor, AnswerExtractor, BoxExtractor, ExtractorError, PatternExtractor,
    DEFAULT_PATTERNS,
};
pub use llm_client::{ChatMessage, ModelClient, ModelResponse, OpenAIClient, RequestError, Role};
pub use retry::{RetryController, RetryOutcome};
pub use runner::{DatasetReport, DatasetRunner, FileReport, RunReport};
pub use sampling::{draw_sample, RoundReport, SamplingOrchestrator, SamplingReport};
pub use shuffle::{
    derive_seed, shuffle, unshuffle, PresentedQuestion, ShuffleError, ShuffleMapper,
    ShuffleMapping,
};
pub use statistics::{mean, population_std_dev, sample_std_dev, Bootstrap, BootstrapCI};

/// Errors that abort a file, dataset or sampling orchestration
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error("cannot sample {requested} questions from a corpus of {available}")]
    SamplingExhaustion { requested: usize, available: usize },

    #[error("evaluation cancelled after {completed}/{total} questions")]
    Cancelled { completed: usize, total: usize },

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ConfigError> for EvalError {
    fn from(err: ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

impl From<ExtractorError> for EvalError {
    fn from(err: ExtractorError) -> Self {
        Self::Configuration(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EvalError>;
