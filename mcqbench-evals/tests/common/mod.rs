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

#![allow(dead_code)]

use async_trait::async_trait;
use mcqbench_core::{AnswerOption, BenchConfig, ModelConfig, Question, TokenUsage, OPTION_LABELS};
use mcqbench_evals::{ChatMessage, ModelClient, ModelResponse, RequestError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Deterministic stand-in for the model endpoint.
///
/// Prompts containing "easy" are answered with the position of the option
/// whose text is "right"; every other prompt gets a wrong position.
pub struct StubClient {
    calls: AtomicUsize,
    transient_failures: usize,
    seen: Mutex<HashMap<String, usize>>,
    fixed_label: Option<char>,
    keyword: &'static str,
}

impl StubClient {
    pub fn new() -> Self {
        Self::flaky(0)
    }

    /// Fails each distinct prompt with a 503 this many times before answering
    pub fn flaky(transient_failures: usize) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            transient_failures,
            seen: Mutex::new(HashMap::new()),
            fixed_label: None,
            keyword: "boxed",
        }
    }

    /// Picks `label` whatever the question
    pub fn always(label: char) -> Self {
        Self {
            fixed_label: Some(label),
            ..Self::new()
        }
    }

    /// Answers as `\box{X}` instead of `\boxed{X}`
    pub fn with_box_keyword(mut self) -> Self {
        self.keyword = "box";
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelClient for StubClient {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        _params: &ModelConfig,
    ) -> Result<ModelResponse, RequestError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let prompt = messages[messages.len() - 1].content.clone();

        let failures = {
            let mut seen = self.seen.lock();
            let count = seen.entry(prompt.clone()).or_insert(0);
            *count += 1;
            *count
        };
        if failures <= self.transient_failures {
            return Err(RequestError::from_status(503, "warming up"));
        }

        let wanted = if prompt.contains("easy") { ": right" } else { ": wrong" };
        let label = self.fixed_label.unwrap_or_else(|| {
            prompt
                .lines()
                .find(|line| line.ends_with(wanted))
                .and_then(|line| line.chars().next())
                .unwrap_or('A')
        });

        Ok(ModelResponse {
            content: format!("Let me think.\n\\{}{{{}}}", self.keyword, label),
            usage: TokenUsage {
                prompt_tokens: 20,
                completion_tokens: 5,
                total_tokens: 25,
            },
            model: "stub".to_string(),
        })
    }

    fn model_name(&self) -> &str {
        "stub"
    }
}

pub fn question(id: usize, easy: bool, correct: char) -> Question {
    Question::new(
        id,
        format!("Question {} ({})", id, if easy { "easy" } else { "hard" }),
        OPTION_LABELS
            .iter()
            .map(|&l| AnswerOption::new(l, if l == correct { "right" } else { "wrong" }))
            .collect(),
        correct,
    )
}

pub fn csv_rows(questions: &[Question]) -> String {
    let mut out = String::from("question,A,B,C,D,answer\n");
    for q in questions {
        let options: Vec<&str> = q.options.iter().map(|o| o.text.as_str()).collect();
        out.push_str(&format!(
            "{},{},{},{},{},{}\n",
            q.prompt_text, options[0], options[1], options[2], options[3], q.correct_label
        ));
    }
    out
}

pub fn config() -> BenchConfig {
    let mut config = BenchConfig::default();
    config.model.name = "stub".to_string();
    config.evaluation.shuffle_options = true;
    config.evaluation.seed = Some(1234);
    config.evaluation.concurrency = 4;
    config
}
