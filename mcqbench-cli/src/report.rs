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

//! Result files written after a run or a sampling workflow.
//!
//! Layout under `results_dir`:
//! - `results_<ts>.json` and `results_<ts>.csv` for dataset runs
//! - `details/eval_results_<ts>_run<k>.jsonl`, one line per file per run
//! - `sampling_<ts>.json` plus `sampling_<ts>/summary.csv` and per-round
//!   detail lines under `sampling_<ts>/details/`

use anyhow::{Context, Result};
use clap::ValueEnum;
use mcqbench_core::{BenchConfig, GradedResult, SummaryStatistic, TokenUsage};
use mcqbench_evals::{BootstrapCI, DatasetReport, FileReport, LabelDistribution, SamplingReport};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExportFormat {
    Json,
    Csv,
}

/// Timestamp used in every file name of one invocation
pub fn timestamp() -> String {
    chrono::Local::now().format("%Y%m%d_%H%M%S").to_string()
}

#[derive(Serialize)]
struct RunSummary<'a> {
    run_index: usize,
    accuracy: f64,
    n_correct: usize,
    n_unanswered: usize,
    complete: bool,
    usage: TokenUsage,
    distribution: &'a LabelDistribution,
}

fn total_usage(results: &[GradedResult]) -> TokenUsage {
    let mut usage = TokenUsage::default();
    for result in results {
        usage += result.usage;
    }
    usage
}

#[derive(Serialize)]
struct FileSummary<'a> {
    file_path: &'a str,
    n_questions: usize,
    mean_accuracy: f64,
    std_accuracy: f64,
    complete: bool,
    individual_runs: Vec<f64>,
    runs: Vec<RunSummary<'a>>,
}

impl<'a> FileSummary<'a> {
    fn new(file: &'a FileReport) -> Self {
        Self {
            file_path: &file.file_path,
            n_questions: file.n_questions,
            mean_accuracy: file.mean_accuracy,
            std_accuracy: file.std_accuracy,
            complete: file.is_complete(),
            individual_runs: file.run_accuracies(),
            runs: file
                .runs
                .iter()
                .map(|run| RunSummary {
                    run_index: run.run_index,
                    accuracy: run.accuracy.accuracy,
                    n_correct: run.accuracy.n_correct,
                    n_unanswered: run.accuracy.n_unanswered,
                    complete: run.complete,
                    usage: total_usage(&run.results),
                    distribution: &run.distribution,
                })
                .collect(),
        }
    }
}

#[derive(Serialize)]
struct DatasetSummary<'a> {
    dataset_path: &'a str,
    prompt_language: &'a str,
    average_accuracy: f64,
    average_std: f64,
    files: Vec<FileSummary<'a>>,
}

#[derive(Serialize)]
struct ResultsDocument<'a> {
    timestamp: &'a str,
    config: BenchConfig,
    duration_seconds: f64,
    datasets: Vec<DatasetSummary<'a>>,
}

#[derive(Serialize)]
struct DetailLine<'a> {
    file_path: &'a str,
    run_index: usize,
    accuracy: f64,
    complete: bool,
    results: &'a [GradedResult],
}

fn create(path: &Path) -> Result<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    Ok(BufWriter::new(file))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut writer = create(path)?;
    serde_json::to_writer_pretty(&mut writer, value)
        .with_context(|| format!("failed to serialize {}", path.display()))?;
    writer.flush()?;
    Ok(())
}

/// `results_<ts>.json`: redacted config, per dataset and per file statistics
pub fn write_results_json(
    dir: &Path,
    timestamp: &str,
    config: &BenchConfig,
    datasets: &[DatasetReport],
    duration_seconds: f64,
) -> Result<PathBuf> {
    let document = ResultsDocument {
        timestamp,
        config: config.redacted(),
        duration_seconds,
        datasets: datasets
            .iter()
            .map(|d| DatasetSummary {
                dataset_path: &d.dataset_path,
                prompt_language: &d.prompt_language,
                average_accuracy: d.average_accuracy,
                average_std: d.average_std,
                files: d.files.iter().map(FileSummary::new).collect(),
            })
            .collect(),
    };

    let path = dir.join(format!("results_{}.json", timestamp));
    write_json(&path, &document)?;
    Ok(path)
}

/// `results_<ts>.csv`: one row per evaluated file
pub fn write_results_csv(dir: &Path, timestamp: &str, datasets: &[DatasetReport]) -> Result<PathBuf> {
    let path = dir.join(format!("results_{}.csv", timestamp));
    let mut writer = csv::Writer::from_writer(create(&path)?);
    writer.write_record([
        "dataset",
        "file",
        "n_questions",
        "mean_accuracy",
        "std_accuracy",
        "runs",
    ])?;

    for dataset in datasets {
        for file in &dataset.files {
            let runs = file
                .run_accuracies()
                .iter()
                .map(|a| format!("{:.4}", a))
                .collect::<Vec<_>>()
                .join(";");
            writer.write_record([
                dataset.dataset_path.clone(),
                file.file_path.clone(),
                file.n_questions.to_string(),
                format!("{:.4}", file.mean_accuracy),
                format!("{:.4}", file.std_accuracy),
                runs,
            ])?;
        }
    }
    writer.flush()?;
    Ok(path)
}

fn write_detail_lines<'a>(
    path: &Path,
    files: impl Iterator<Item = &'a FileReport>,
    run_index: usize,
) -> Result<()> {
    let mut writer = create(path)?;
    for file in files {
        let Some(run) = file.runs.iter().find(|r| r.run_index == run_index) else {
            continue;
        };
        let line = DetailLine {
            file_path: &file.file_path,
            run_index,
            accuracy: run.accuracy.accuracy,
            complete: run.complete,
            results: &run.results,
        };
        serde_json::to_writer(&mut writer, &line)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

/// `details/eval_results_<ts>_run<k>.jsonl` for every run index present
pub fn write_details(dir: &Path, timestamp: &str, datasets: &[DatasetReport]) -> Result<Vec<PathBuf>> {
    let run_count = datasets
        .iter()
        .flat_map(|d| &d.files)
        .map(|f| f.runs.len())
        .max()
        .unwrap_or(0);

    let mut paths = Vec::with_capacity(run_count);
    for run_index in 0..run_count {
        let path = dir
            .join("details")
            .join(format!("eval_results_{}_run{}.jsonl", timestamp, run_index));
        write_detail_lines(&path, datasets.iter().flat_map(|d| &d.files), run_index)?;
        paths.push(path);
    }
    Ok(paths)
}

#[derive(Serialize)]
struct RoundSummary<'a> {
    round_index: usize,
    accuracy: f64,
    n_questions: usize,
    question_ids: &'a [usize],
    individual_runs: Vec<f64>,
    distributions: Vec<&'a LabelDistribution>,
}

#[derive(Serialize)]
struct SamplingDocument<'a> {
    timestamp: &'a str,
    config: BenchConfig,
    duration_seconds: f64,
    corpus_size: usize,
    summary: &'a SummaryStatistic,
    confidence_interval: &'a BootstrapCI,
    rounds: Vec<RoundSummary<'a>>,
}

/// Files written by a sampling workflow
#[derive(Debug)]
pub struct SamplingOutputs {
    pub json: PathBuf,
    pub summary_csv: PathBuf,
    pub details: Vec<PathBuf>,
}

pub fn write_sampling(
    dir: &Path,
    timestamp: &str,
    config: &BenchConfig,
    corpus_size: usize,
    report: &SamplingReport,
    duration_seconds: f64,
) -> Result<SamplingOutputs> {
    let document = SamplingDocument {
        timestamp,
        config: config.redacted(),
        duration_seconds,
        corpus_size,
        summary: &report.summary,
        confidence_interval: &report.confidence_interval,
        rounds: report
            .rounds
            .iter()
            .map(|round| RoundSummary {
                round_index: round.statistic.round_index,
                accuracy: round.statistic.accuracy,
                n_questions: round.statistic.n_questions,
                question_ids: &round.question_ids,
                individual_runs: round.report.run_accuracies(),
                distributions: round.report.runs.iter().map(|r| &r.distribution).collect(),
            })
            .collect(),
    };
    let json = dir.join(format!("sampling_{}.json", timestamp));
    write_json(&json, &document)?;

    let round_dir = dir.join(format!("sampling_{}", timestamp));
    let summary_csv = round_dir.join("summary.csv");
    let mut writer = csv::Writer::from_writer(create(&summary_csv)?);
    writer.write_record(["round", "accuracy", "n_questions"])?;
    for stat in report.round_statistics() {
        writer.write_record([
            stat.round_index.to_string(),
            format!("{:.4}", stat.accuracy),
            stat.n_questions.to_string(),
        ])?;
    }
    writer.flush()?;

    let mut details = Vec::with_capacity(report.rounds.len());
    for round in &report.rounds {
        let path = round_dir
            .join("details")
            .join(format!("round{}.jsonl", round.statistic.round_index));
        let mut writer = create(&path)?;
        for run in &round.report.runs {
            let line = DetailLine {
                file_path: &round.report.file_path,
                run_index: run.run_index,
                accuracy: run.accuracy.accuracy,
                complete: run.complete,
                results: &run.results,
            };
            serde_json::to_writer(&mut writer, &line)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        details.push(path);
    }

    Ok(SamplingOutputs {
        json,
        summary_csv,
        details,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcqbench_core::{FileAccuracy, RoundStatistic};
    use mcqbench_evals::RunReport;
    use tempfile::TempDir;

    fn result(question_id: usize, run_index: usize, is_correct: bool) -> GradedResult {
        GradedResult {
            question_id,
            run_index,
            presented_prompt: format!("Question {}\nA: x\nB: y\nC: z\nD: w", question_id),
            predicted_label: Some(if is_correct { 'A' } else { 'B' }),
            presented_predicted_label: Some(if is_correct { 'A' } else { 'B' }),
            correct_label: 'A',
            presented_correct_label: 'A',
            is_correct,
            raw_model_text: "\\boxed{A}".to_string(),
            attempts: 1,
            latency_ms: 12,
            usage: TokenUsage {
                prompt_tokens: 40,
                completion_tokens: 10,
                total_tokens: 50,
            },
            error: None,
        }
    }

    fn file_report(path: &str, outcomes: &[&[bool]]) -> FileReport {
        let runs: Vec<RunReport> = outcomes
            .iter()
            .enumerate()
            .map(|(k, run)| {
                let results: Vec<GradedResult> = run
                    .iter()
                    .enumerate()
                    .map(|(i, &ok)| result(i, k, ok))
                    .collect();
                RunReport {
                    run_index: k,
                    accuracy: FileAccuracy::from_results(path, &results),
                    distribution: LabelDistribution::from_results(&results),
                    complete: true,
                    results,
                }
            })
            .collect();
        FileReport::from_runs(path.to_string(), outcomes[0].len(), runs, outcomes.len())
    }

    fn dataset() -> DatasetReport {
        let files = vec![
            file_report("data/a.csv", &[&[true, true], &[true, false]]),
            file_report("data/b.csv", &[&[false, false], &[true, false]]),
        ];
        DatasetReport {
            dataset_path: "data".to_string(),
            prompt_language: "en".to_string(),
            average_accuracy: 0.5,
            average_std: 0.25,
            files,
        }
    }

    fn config() -> BenchConfig {
        let mut config = BenchConfig::default();
        config.model.name = "test-model".to_string();
        config.llm_api.api_key = Some("sk-secret".to_string());
        config
    }

    #[test]
    fn test_results_json_redacts_key() {
        let dir = TempDir::new().unwrap();
        let path = write_results_json(dir.path(), "20250101_000000", &config(), &[dataset()], 1.5)
            .unwrap();

        assert!(path.ends_with("results_20250101_000000.json"));
        let text = fs::read_to_string(&path).unwrap();
        assert!(!text.contains("sk-secret"));

        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["config"]["llm_api"]["api_key"], "***");
        let file = &value["datasets"][0]["files"][0];
        assert_eq!(file["file_path"], "data/a.csv");
        assert_eq!(file["mean_accuracy"], 0.75);
        assert_eq!(file["individual_runs"], serde_json::json!([1.0, 0.5]));
        assert_eq!(file["runs"][0]["usage"]["prompt_tokens"], 80);
        assert_eq!(file["runs"][0]["usage"]["total_tokens"], 100);
        assert_eq!(value["datasets"][0]["average_accuracy"], 0.5);
    }

    #[test]
    fn test_results_csv_has_row_per_file() {
        let dir = TempDir::new().unwrap();
        let path = write_results_csv(dir.path(), "ts", &[dataset()]).unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[0][1], "data/a.csv");
        assert_eq!(&rows[0][3], "0.7500");
        assert_eq!(&rows[1][5], "0.0000;0.5000");
    }

    #[test]
    fn test_details_one_file_per_run() {
        let dir = TempDir::new().unwrap();
        let paths = write_details(dir.path(), "ts", &[dataset()]).unwrap();

        assert_eq!(paths.len(), 2);
        assert!(paths[1].ends_with("details/eval_results_ts_run1.jsonl"));

        let text = fs::read_to_string(&paths[1]).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["file_path"], "data/a.csv");
        assert_eq!(lines[0]["run_index"], 1);
        assert_eq!(lines[0]["results"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_sampling_outputs() {
        let dir = TempDir::new().unwrap();
        let rounds = vec![
            mcqbench_evals::RoundReport {
                statistic: RoundStatistic {
                    round_index: 0,
                    accuracy: 1.0,
                    n_questions: 2,
                },
                question_ids: vec![3, 9],
                report: file_report("round_0", &[&[true, true]]),
            },
            mcqbench_evals::RoundReport {
                statistic: RoundStatistic {
                    round_index: 1,
                    accuracy: 0.5,
                    n_questions: 2,
                },
                question_ids: vec![1, 4],
                report: file_report("round_1", &[&[true, false]]),
            },
        ];
        let report = SamplingReport {
            rounds,
            summary: SummaryStatistic {
                mean_accuracy: 0.75,
                stddev_accuracy: 0.353_553_390_593_273_8,
                n_rounds: 2,
            },
            confidence_interval: BootstrapCI {
                observed: 0.75,
                lower: 0.5,
                upper: 1.0,
                confidence_level: 0.95,
                n_bootstrap: 1000,
            },
        };

        let outputs = write_sampling(dir.path(), "ts", &config(), 10, &report, 2.0).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&outputs.json).unwrap()).unwrap();
        assert_eq!(value["summary"]["n_rounds"], 2);
        assert_eq!(value["corpus_size"], 10);
        assert_eq!(value["rounds"][0]["question_ids"], serde_json::json!([3, 9]));

        let mut reader = csv::Reader::from_path(&outputs.summary_csv).unwrap();
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[1][1], "0.5000");

        assert_eq!(outputs.details.len(), 2);
        assert!(outputs.details.iter().all(|p| p.exists()));
    }
}
