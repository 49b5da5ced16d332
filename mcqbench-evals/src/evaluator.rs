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

//! Per-question pipeline: present, ask, extract, un-shuffle, grade.

use crate::extract::{build_extractor, AnswerExtractor};
use crate::llm_client::{ChatMessage, ModelClient};
use crate::retry::RetryController;
use crate::shuffle::{unshuffle, ShuffleMapper};
use crate::EvalError;
use mcqbench_core::{
    BenchConfig, EvaluationMethod, GradedResult, ModelConfig, Question, RateLimiter,
    SystemPrompt, TokenUsage, UNANSWERABLE_MARKER,
};
use std::sync::Arc;
use tokio::time::Instant;

/// Stateless evaluator shared by every task of one invocation
pub struct QuestionEvaluator {
    client: Arc<dyn ModelClient>,
    retry: RetryController,
    extractor: Arc<dyn AnswerExtractor>,
    shuffler: ShuffleMapper,
    params: ModelConfig,
    system_prompt: Option<SystemPrompt>,
}

impl QuestionEvaluator {
    pub fn new(
        client: Arc<dyn ModelClient>,
        retry: RetryController,
        extractor: Arc<dyn AnswerExtractor>,
        params: ModelConfig,
    ) -> Self {
        Self {
            client,
            retry,
            extractor,
            shuffler: ShuffleMapper::disabled(),
            params,
            system_prompt: None,
        }
    }

    pub fn with_shuffler(mut self, shuffler: ShuffleMapper) -> Self {
        self.shuffler = shuffler;
        self
    }

    pub fn with_system_prompt(mut self, system_prompt: Option<SystemPrompt>) -> Self {
        self.system_prompt = system_prompt;
        self
    }

    /// Wire up the evaluator described by `config`.
    ///
    /// The system prompt is only sent in box mode.
    pub fn from_config(
        config: &BenchConfig,
        client: Arc<dyn ModelClient>,
        limiter: Arc<RateLimiter>,
    ) -> Result<Self, EvalError> {
        let eval = &config.evaluation;
        let extractor = build_extractor(eval.evaluation_method, &eval.strategy_config)?;
        let retry = RetryController::from_config(&config.llm_api, limiter);
        let system_prompt = match eval.evaluation_method {
            EvaluationMethod::Box => eval.system_prompt.clone(),
            _ => None,
        };

        Ok(Self::new(client, retry, extractor, config.model.clone())
            .with_shuffler(ShuffleMapper::new(eval.shuffle_options, config.shuffle_seed()))
            .with_system_prompt(system_prompt))
    }

    pub fn extractor_name(&self) -> &str {
        self.extractor.name()
    }

    fn messages(&self, user_prompt: String, prompt_lang: &str) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(2);
        if let Some(prompt) = &self.system_prompt {
            messages.push(ChatMessage::system(prompt.for_language(prompt_lang)));
        }
        messages.push(ChatMessage::user(user_prompt));
        messages
    }

    /// Grade one question for one run. Never fails: request failures become
    /// unanswerable results.
    pub async fn evaluate(
        &self,
        question: &Question,
        run_index: usize,
        prompt_lang: &str,
    ) -> GradedResult {
        let started = Instant::now();

        let presented = match self.shuffler.present(question, run_index) {
            Ok(presented) => presented,
            Err(e) => {
                tracing::error!("Question {} cannot be presented: {}", question.id, e);
                return unanswerable(
                    question,
                    run_index,
                    String::new(),
                    question.correct_label,
                    e.to_string(),
                    0,
                    0,
                );
            }
        };

        let user_prompt = presented.render();
        let messages = self.messages(user_prompt.clone(), prompt_lang);
        let outcome = self
            .retry
            .call(|| self.client.complete(&messages, &self.params))
            .await;
        let attempts = outcome.attempt_count();
        let latency_ms = started.elapsed().as_millis() as u64;

        match outcome.result {
            Ok(response) => {
                let presented_predicted = self
                    .extractor
                    .extract(&response.content, &presented.labels());
                let predicted =
                    presented_predicted.and_then(|label| unshuffle(&presented.mapping, label));
                GradedResult {
                    question_id: question.id,
                    run_index,
                    presented_prompt: user_prompt,
                    predicted_label: predicted,
                    presented_predicted_label: presented_predicted,
                    correct_label: question.correct_label,
                    presented_correct_label: presented.correct_label,
                    is_correct: predicted == Some(question.correct_label),
                    raw_model_text: response.content,
                    attempts,
                    latency_ms,
                    usage: response.usage,
                    error: None,
                }
            }
            Err(e) => {
                tracing::error!(
                    "Question {} (run {}) unanswerable after {} attempts: {}",
                    question.id,
                    run_index,
                    attempts,
                    e
                );
                unanswerable(
                    question,
                    run_index,
                    user_prompt,
                    presented.correct_label,
                    e.to_string(),
                    attempts,
                    latency_ms,
                )
            }
        }
    }
}

/// Result for a question that never got a usable response
pub(crate) fn unanswerable(
    question: &Question,
    run_index: usize,
    presented_prompt: String,
    presented_correct_label: char,
    error: String,
    attempts: u32,
    latency_ms: u64,
) -> GradedResult {
    GradedResult {
        question_id: question.id,
        run_index,
        presented_prompt,
        predicted_label: None,
        presented_predicted_label: None,
        correct_label: question.correct_label,
        presented_correct_label,
        is_correct: false,
        raw_model_text: UNANSWERABLE_MARKER.to_string(),
        attempts,
        latency_ms,
        usage: TokenUsage::default(),
        error: Some(error),
    }
}
