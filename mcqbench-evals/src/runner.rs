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

//! Dataset runner.
//!
//! Fans the question evaluator out over every question of a file for each
//! repeat run. In-flight evaluations are bounded by a semaphore independent
//! from the rate limiter, and results are collected in question order no
//! matter which task finishes first.

use crate::analysis::LabelDistribution;
use crate::evaluator::{unanswerable, QuestionEvaluator};
use crate::statistics::{mean, population_std_dev};
use crate::EvalError;
use futures::future::join_all;
use mcqbench_core::{
    find_evaluation_files, load_questions, BenchConfig, FileAccuracy, GradedResult, Question,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// One pass over one file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_index: usize,
    pub accuracy: FileAccuracy,
    pub distribution: LabelDistribution,
    /// False when the pass was cut short by cancellation
    pub complete: bool,
    /// Graded results in question order
    pub results: Vec<GradedResult>,
}

/// Every pass over one file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileReport {
    pub file_path: String,
    pub n_questions: usize,
    /// Passes that graded at least one question
    pub runs: Vec<RunReport>,
    /// Mean over complete passes; over the partial ones only when none completed
    pub mean_accuracy: f64,
    /// Population standard deviation across the same passes as the mean
    pub std_accuracy: f64,
    /// False when any of the requested passes was cut short or never started
    pub complete: bool,
}

impl FileReport {
    /// Aggregate `runs`; `requested` is the number of passes that were asked for
    pub fn from_runs(
        file_path: String,
        n_questions: usize,
        runs: Vec<RunReport>,
        requested: usize,
    ) -> Self {
        let complete = runs.len() == requested && runs.iter().all(|r| r.complete);
        let mut measured: Vec<f64> = runs
            .iter()
            .filter(|r| r.complete)
            .map(|r| r.accuracy.accuracy)
            .collect();
        if measured.is_empty() {
            measured = runs.iter().map(|r| r.accuracy.accuracy).collect();
        }
        Self {
            file_path,
            n_questions,
            mean_accuracy: mean(&measured),
            std_accuracy: population_std_dev(&measured),
            complete,
            runs,
        }
    }

    pub fn run_accuracies(&self) -> Vec<f64> {
        self.runs.iter().map(|r| r.accuracy.accuracy).collect()
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }
}

/// Every file under one dataset path
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetReport {
    pub dataset_path: String,
    pub prompt_language: String,
    pub files: Vec<FileReport>,
    /// Mean of the per-file mean accuracies
    pub average_accuracy: f64,
    /// Mean of the per-file standard deviations
    pub average_std: f64,
}

impl DatasetReport {
    fn from_files(dataset_path: String, prompt_language: String, files: Vec<FileReport>) -> Self {
        let means: Vec<f64> = files.iter().map(|f| f.mean_accuracy).collect();
        let stds: Vec<f64> = files.iter().map(|f| f.std_accuracy).collect();
        Self {
            dataset_path,
            prompt_language,
            average_accuracy: mean(&means),
            average_std: mean(&stds),
            files,
        }
    }
}

#[derive(Clone)]
pub struct DatasetRunner {
    evaluator: Arc<QuestionEvaluator>,
    concurrency: usize,
    repeat_runs: usize,
    allow_partial: bool,
    cancel: CancellationToken,
}

impl DatasetRunner {
    pub fn new(evaluator: Arc<QuestionEvaluator>, concurrency: usize) -> Self {
        Self {
            evaluator,
            concurrency: concurrency.max(1),
            repeat_runs: 1,
            allow_partial: false,
            cancel: CancellationToken::new(),
        }
    }

    pub fn from_config(config: &BenchConfig, evaluator: Arc<QuestionEvaluator>) -> Self {
        Self::new(evaluator, config.evaluation.concurrency)
            .with_repeat_runs(config.evaluation.repeat_runs)
            .with_allow_partial(config.evaluation.allow_partial)
    }

    pub fn with_repeat_runs(mut self, repeat_runs: usize) -> Self {
        self.repeat_runs = repeat_runs.max(1);
        self
    }

    pub fn with_allow_partial(mut self, allow_partial: bool) -> Self {
        self.allow_partial = allow_partial;
        self
    }

    /// Token whose cancellation abandons in-flight evaluations
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn repeat_runs(&self) -> usize {
        self.repeat_runs
    }

    /// One pass over `questions`
    pub async fn run_pass(
        &self,
        label: &str,
        questions: Arc<Vec<Question>>,
        run_index: usize,
        prompt_lang: &str,
    ) -> Result<RunReport, EvalError> {
        let total = questions.len();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let prompt_lang: Arc<str> = Arc::from(prompt_lang);
        let mut tasks = Vec::with_capacity(total);

        for index in 0..total {
            let questions = Arc::clone(&questions);
            let semaphore = Arc::clone(&semaphore);
            let evaluator = Arc::clone(&self.evaluator);
            let cancel = self.cancel.clone();
            let prompt_lang = Arc::clone(&prompt_lang);

            tasks.push(tokio::spawn(async move {
                let _permit = tokio::select! {
                    permit = semaphore.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return None,
                    },
                    _ = cancel.cancelled() => return None,
                };
                let question = &questions[index];
                tokio::select! {
                    result = evaluator.evaluate(question, run_index, &prompt_lang) => Some(result),
                    _ = cancel.cancelled() => None,
                }
            }));
        }

        let mut results = Vec::with_capacity(total);
        for (question, joined) in questions.iter().zip(join_all(tasks).await) {
            match joined {
                Ok(Some(result)) => results.push(result),
                Ok(None) => {}
                Err(e) => {
                    tracing::error!("Evaluation task for question {} failed: {}", question.id, e);
                    results.push(unanswerable(
                        question,
                        run_index,
                        String::new(),
                        question.correct_label,
                        format!("evaluation task failed: {}", e),
                        0,
                        0,
                    ));
                }
            }
        }

        let complete = results.len() == total;
        if !complete {
            tracing::warn!(
                "{} run {} cancelled after {}/{} questions",
                label,
                run_index,
                results.len(),
                total
            );
            if !self.allow_partial {
                return Err(EvalError::Cancelled {
                    completed: results.len(),
                    total,
                });
            }
        }

        let accuracy = FileAccuracy::from_results(label, &results);
        tracing::info!(
            "{} run {}: accuracy {:.4} ({}/{}, {} unanswered)",
            label,
            run_index,
            accuracy.accuracy,
            accuracy.n_correct,
            accuracy.n_questions,
            accuracy.n_unanswered
        );

        Ok(RunReport {
            run_index,
            distribution: LabelDistribution::from_results(&results),
            accuracy,
            complete,
            results,
        })
    }

    /// Every repeat run over an in-memory question set
    pub async fn run_questions(
        &self,
        label: &str,
        questions: Vec<Question>,
        prompt_lang: &str,
    ) -> Result<FileReport, EvalError> {
        let n_questions = questions.len();
        let questions = Arc::new(questions);
        let mut runs = Vec::with_capacity(self.repeat_runs);

        for run_index in 0..self.repeat_runs {
            let report = self
                .run_pass(label, Arc::clone(&questions), run_index, prompt_lang)
                .await?;
            let complete = report.complete;
            // a pass cancelled before any answer measured nothing
            if complete || !report.results.is_empty() {
                runs.push(report);
            }
            if !complete {
                break;
            }
        }

        let report = FileReport::from_runs(label.to_string(), n_questions, runs, self.repeat_runs);
        tracing::info!(
            "{}: mean accuracy {:.4} ± {:.4} over {} run(s)",
            label,
            report.mean_accuracy,
            report.std_accuracy,
            report.runs.len()
        );
        Ok(report)
    }

    /// Load one dataset file and run it. Loading errors surface before any request.
    pub async fn run_file(&self, path: &Path, prompt_lang: &str) -> Result<FileReport, EvalError> {
        let questions = load_questions(path)?;
        self.run_questions(&path.display().to_string(), questions, prompt_lang)
            .await
    }

    /// Every evaluation file under `root`, in sorted order
    pub async fn run_dataset(
        &self,
        root: &Path,
        prompt_lang: &str,
    ) -> Result<DatasetReport, EvalError> {
        let files = find_evaluation_files(root)?;
        tracing::info!("Evaluating {} file(s) under {}", files.len(), root.display());

        let mut reports = Vec::with_capacity(files.len());
        for file in &files {
            let report = self.run_file(file, prompt_lang).await?;
            let complete = report.is_complete();
            if !report.runs.is_empty() {
                reports.push(report);
            }
            if !complete {
                break;
            }
        }

        Ok(DatasetReport::from_files(
            root.display().to_string(),
            prompt_lang.to_string(),
            reports,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::BoxExtractor;
    use crate::llm_client::{ChatMessage, ModelClient, ModelResponse, RequestError};
    use crate::retry::RetryController;
    use async_trait::async_trait;
    use mcqbench_core::{
        AnswerOption, ModelConfig, RateLimiter, RetryPolicy, TokenUsage, OPTION_LABELS,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Always answers A; later questions finish first; tracks peak concurrency
    struct SlowClient {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
    }

    impl SlowClient {
        fn new() -> Self {
            Self {
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ModelClient for SlowClient {
        async fn complete(
            &self,
            messages: &[ChatMessage],
            _params: &ModelConfig,
        ) -> Result<ModelResponse, RequestError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);

            // "Q<n>" prompts; higher n sleeps less
            let n: u64 = messages[0].content[1..]
                .lines()
                .next()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(1000 - n * 10)).await;

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(ModelResponse {
                content: "\\box{A}".to_string(),
                usage: TokenUsage::default(),
                model: "slow".to_string(),
            })
        }

        fn model_name(&self) -> &str {
            "slow"
        }
    }

    fn questions(n: usize) -> Vec<Question> {
        (0..n)
            .map(|i| {
                let correct = if i % 2 == 0 { 'A' } else { 'B' };
                Question::new(
                    i,
                    format!("Q{}", i),
                    OPTION_LABELS
                        .iter()
                        .map(|&l| AnswerOption::new(l, l.to_string()))
                        .collect(),
                    correct,
                )
            })
            .collect()
    }

    fn runner(client: Arc<SlowClient>, concurrency: usize) -> DatasetRunner {
        let retry = RetryController::new(
            RetryPolicy::none(),
            Duration::from_secs(30),
            Arc::new(RateLimiter::unlimited()),
        );
        let evaluator = QuestionEvaluator::new(
            client,
            retry,
            Arc::new(BoxExtractor::new().unwrap()),
            ModelConfig::default(),
        );
        DatasetRunner::new(Arc::new(evaluator), concurrency)
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_in_question_order_with_bounded_concurrency() {
        let client = Arc::new(SlowClient::new());
        let runner = runner(client.clone(), 4);

        let report = runner
            .run_pass("mem", Arc::new(questions(20)), 0, "zh")
            .await
            .unwrap();

        let ids: Vec<usize> = report.results.iter().map(|r| r.question_id).collect();
        assert_eq!(ids, (0..20).collect::<Vec<_>>());
        assert!(report.complete);
        assert_eq!(report.accuracy.n_correct, 10);
        assert_eq!(report.accuracy.accuracy, 0.5);
        assert!(client.peak.load(Ordering::SeqCst) <= 4);
        assert_eq!(client.peak.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeat_runs_aggregate() {
        let client = Arc::new(SlowClient::new());
        let runner = runner(client.clone(), 8).with_repeat_runs(3);

        let report = runner
            .run_questions("mem", questions(10), "zh")
            .await
            .unwrap();

        assert_eq!(report.runs.len(), 3);
        assert_eq!(client.calls.load(Ordering::SeqCst), 30);
        assert_eq!(report.run_accuracies(), vec![0.5, 0.5, 0.5]);
        assert_eq!(report.mean_accuracy, 0.5);
        assert_eq!(report.std_accuracy, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_file_scores_zero() {
        let runner = runner(Arc::new(SlowClient::new()), 2);
        let report = runner.run_questions("empty", Vec::new(), "zh").await.unwrap();
        assert_eq!(report.mean_accuracy, 0.0);
        assert!(report.is_complete());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_without_partial_is_error() {
        let runner = runner(Arc::new(SlowClient::new()), 2);
        let token = runner.cancellation_token();
        token.cancel();

        let err = runner
            .run_pass("mem", Arc::new(questions(5)), 0, "zh")
            .await
            .unwrap_err();
        assert!(matches!(err, EvalError::Cancelled { completed: 0, total: 5 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_keeps_completed_results() {
        let client = Arc::new(SlowClient::new());
        let runner = runner(client, 1).with_allow_partial(true).with_repeat_runs(2);
        let token = runner.cancellation_token();

        // each call takes 810-1000 ms; cancel while the second is in flight
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            token.cancel();
        });

        let report = runner
            .run_questions("mem", questions(6), "zh")
            .await
            .unwrap();

        assert_eq!(report.runs.len(), 1);
        let run = &report.runs[0];
        assert!(!run.complete);
        assert_eq!(run.results.len(), 1);
        assert_eq!(run.accuracy.n_questions, 1);
        assert!(run.results[0].error.is_none());
        assert!(!report.is_complete());
        assert_eq!(report.mean_accuracy, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pass_cancelled_before_any_answer_is_not_averaged() {
        let client = Arc::new(SlowClient::new());
        let runner = runner(client, 10).with_allow_partial(true).with_repeat_runs(2);
        let token = runner.cancellation_token();

        // the first pass finishes at 1000 ms; the second never returns an answer
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            token.cancel();
        });

        let report = runner
            .run_questions("mem", questions(10), "zh")
            .await
            .unwrap();

        assert_eq!(report.runs.len(), 1);
        assert!(report.runs[0].complete);
        assert!(!report.is_complete());
        assert_eq!(report.mean_accuracy, 0.5);
        assert_eq!(report.std_accuracy, 0.0);
    }

    #[test]
    fn test_partial_pass_does_not_dilute_complete_ones() {
        let graded = |n: usize, correct: usize| -> Vec<GradedResult> {
            let q = questions(n);
            (0..n)
                .map(|i| {
                    let mut r = unanswerable(&q[i], 0, String::new(), 'A', "x".into(), 1, 0);
                    r.error = None;
                    r.is_correct = i < correct;
                    r
                })
                .collect()
        };
        let run = |k: usize, results: Vec<GradedResult>, complete: bool| RunReport {
            run_index: k,
            accuracy: FileAccuracy::from_results("f", &results),
            distribution: LabelDistribution::from_results(&results),
            complete,
            results,
        };

        let report = FileReport::from_runs(
            "f".to_string(),
            10,
            vec![run(0, graded(10, 8), true), run(1, graded(2, 0), false)],
            2,
        );
        assert_eq!(report.mean_accuracy, 0.8);
        assert_eq!(report.run_accuracies(), vec![0.8, 0.0]);
        assert!(!report.is_complete());
    }
}
