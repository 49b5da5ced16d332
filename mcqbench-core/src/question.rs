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

//! Multiple-choice question model and the graded outcomes derived from it.
//!
//! Everything here is immutable once constructed: questions are loaded once per
//! dataset file, graded results are produced exactly once per (question, run).

use serde::{Deserialize, Serialize};
use std::ops::AddAssign;

/// Option labels in storage order.
pub const OPTION_LABELS: [char; 4] = ['A', 'B', 'C', 'D'];

/// Raw model text recorded for a question whose request never succeeded.
pub const UNANSWERABLE_MARKER: &str = "<unanswerable>";

/// One labelled answer option.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerOption {
    pub label: char,
    pub text: String,
}

impl AnswerOption {
    pub fn new(label: char, text: impl Into<String>) -> Self {
        Self {
            label,
            text: text.into(),
        }
    }
}

/// A multiple-choice question as stored in a dataset file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    /// Position of the row inside its dataset (or corpus)
    pub id: usize,

    /// Question stem
    pub prompt_text: String,

    /// Options in storage order
    pub options: Vec<AnswerOption>,

    /// Label of the correct option in storage order
    pub correct_label: char,
}

impl Question {
    pub fn new(
        id: usize,
        prompt_text: impl Into<String>,
        options: Vec<AnswerOption>,
        correct_label: char,
    ) -> Self {
        Self {
            id,
            prompt_text: prompt_text.into(),
            options,
            correct_label,
        }
    }

    /// Labels in storage order
    pub fn labels(&self) -> Vec<char> {
        self.options.iter().map(|o| o.label).collect()
    }

    pub fn option_text(&self, label: char) -> Option<&str> {
        self.options
            .iter()
            .find(|o| o.label == label)
            .map(|o| o.text.as_str())
    }

    /// Same question under a different id (used when re-indexing sampled subsets)
    pub fn with_id(mut self, id: usize) -> Self {
        self.id = id;
        self
    }
}

/// Token usage reported by the endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(rhs.prompt_tokens);
        self.completion_tokens = self.completion_tokens.saturating_add(rhs.completion_tokens);
        self.total_tokens = self.total_tokens.saturating_add(rhs.total_tokens);
    }
}

/// Outcome class of a single physical request attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Success,
    Retriable,
    Fatal,
}

/// Transient record of one network call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationAttempt {
    /// Zero-based attempt number
    pub attempt: u32,
    pub elapsed_ms: u64,
    pub status: AttemptStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Graded answer for one (question, run) pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradedResult {
    pub question_id: usize,
    pub run_index: usize,

    /// Prompt exactly as presented to the model (after shuffling)
    pub presented_prompt: String,

    /// Predicted label in the original label space
    pub predicted_label: Option<char>,

    /// Label the model actually picked, before un-shuffling
    pub presented_predicted_label: Option<char>,

    pub correct_label: char,

    /// Where the correct option was shown to the model
    pub presented_correct_label: char,

    pub is_correct: bool,

    /// Untouched model output, or [`UNANSWERABLE_MARKER`]
    pub raw_model_text: String,

    /// Physical attempts spent on this question
    pub attempts: u32,

    pub latency_ms: u64,

    #[serde(default)]
    pub usage: TokenUsage,

    /// Set when the request failed permanently
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl GradedResult {
    /// True when the model never returned a usable response
    pub fn is_unanswerable(&self) -> bool {
        self.error.is_some()
    }
}

/// Accuracy of one pass over one dataset file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileAccuracy {
    pub file_path: String,
    pub accuracy: f64,
    pub n_questions: usize,
    pub n_correct: usize,
    pub n_unanswered: usize,
}

impl FileAccuracy {
    /// Fold graded results into an accuracy figure. An empty pass scores 0.0.
    pub fn from_results(file_path: impl Into<String>, results: &[GradedResult]) -> Self {
        let n_questions = results.len();
        let n_correct = results.iter().filter(|r| r.is_correct).count();
        let n_unanswered = results.iter().filter(|r| r.is_unanswerable()).count();
        let accuracy = if n_questions > 0 {
            n_correct as f64 / n_questions as f64
        } else {
            0.0
        };

        Self {
            file_path: file_path.into(),
            accuracy,
            n_questions,
            n_correct,
            n_unanswered,
        }
    }
}

/// Accuracy of one sampling round
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundStatistic {
    pub round_index: usize,
    pub accuracy: f64,
    pub n_questions: usize,
}

/// Cross-round aggregate, computed once every round has finished
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryStatistic {
    pub mean_accuracy: f64,
    pub stddev_accuracy: f64,
    pub n_rounds: usize,
}
