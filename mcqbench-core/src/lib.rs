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

//! mcqbench Core
//!
//! Question model, benchmark configuration, dataset loading and the
//! resilience primitives shared by the evaluation engine.

pub mod config;
pub mod dataset;
pub mod question;
pub mod resilience;

pub use config::{
    BenchConfig, ConfigError, EvaluationConfig, EvaluationMethod, LlmApiConfig, ModelConfig,
    OutputConfig, SamplingConfig, StrategyConfig, SystemPrompt, DEFAULT_PROMPT_LANGUAGE,
};
pub use dataset::{find_evaluation_files, load_corpus, load_questions, DatasetError};
pub use question::{
    AnswerOption, AttemptStatus, EvaluationAttempt, FileAccuracy, GradedResult, Question,
    RoundStatistic, SummaryStatistic, TokenUsage, OPTION_LABELS, UNANSWERABLE_MARKER,
};
pub use resilience::{RateLimiter, RetryPolicy};
