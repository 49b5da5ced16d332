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

//! mcqbench CLI
//!
//! Runs multiple-choice evaluations against an OpenAI-compatible endpoint.

mod logging;
mod report;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use mcqbench_core::{
    find_evaluation_files, load_corpus, BenchConfig, EvaluationMethod, OutputConfig, RateLimiter,
    SamplingConfig,
};
use mcqbench_evals::{
    DatasetReport, DatasetRunner, LabelDistribution, OpenAIClient, QuestionEvaluator,
    SamplingOrchestrator,
};
use report::ExportFormat;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_CONFIG_TEMPLATE: &str = r#"# mcqbench configuration

[llm_api]
base_url = "http://localhost:8000/v1"
# api_key = "sk-..."        # or MCQBENCH_API_KEY / OPENAI_API_KEY
api_rate_limit = -1         # requests per second, negative = unlimited
max_retries = 3
timeout = 600               # seconds per attempt
disable_ssl_verify = false
retry_initial_delay_ms = 500
retry_max_delay_ms = 30000
retry_multiplier = 2.0

[model]
name = "gpt-4o-mini"
temperature = 0.0
top_p = 0.9
max_tokens = 4096
frequency_penalty = 0.0
presence_penalty = 0.0
extra_body = {}

[evaluation]
dataset_paths = ["datasets/"]
evaluation_method = "box"   # box | pattern | custom_regex
system_prompt = "Think step by step, then put the letter of your final answer in \\box{}."
# system_prompt = { en = "...", zh = "..." }
datasets_prompt_map = {}    # dataset path -> prompt language, default "zh"
strategy_config = { patterns = [] }
repeat_runs = 1
shuffle_options = false
concurrency = 16
# seed = 42
allow_partial = false

# [sampling]
# corpus_paths = ["corpus/"]
# sample_n = 50
# rounds = 5
# seed = 42

[output]
results_dir = "results"
logs_dir = "logs"
"#;

#[derive(Parser)]
#[command(name = "mcqbench")]
#[command(author, version, about = "Multiple-choice LLM evaluation", long_about = None)]
struct Cli {
    /// Verbose mode
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate every file under every dataset path
    Run {
        /// Path to configuration file (TOML)
        #[arg(short, long, default_value = "config.toml", env = "MCQBENCH_CONFIG")]
        config: PathBuf,

        /// Result formats to write
        #[arg(long, value_enum, num_args = 1.., default_values = ["json", "csv"])]
        export: Vec<ExportFormat>,

        /// Report passes cut short by Ctrl-C instead of failing
        #[arg(long)]
        allow_partial: bool,

        /// Dataset paths (override config file)
        #[arg(long)]
        dataset: Vec<PathBuf>,
    },

    /// Repeated random-subset evaluation over a corpus
    Sample {
        /// Path to configuration file (TOML)
        #[arg(short, long, default_value = "config.toml", env = "MCQBENCH_CONFIG")]
        config: PathBuf,

        /// Number of rounds
        #[arg(long)]
        rounds: Option<usize>,

        /// Questions per round
        #[arg(long)]
        sample_n: Option<usize>,

        /// Sampling seed
        #[arg(long)]
        seed: Option<u64>,

        /// Corpus paths (override config file)
        #[arg(long)]
        corpus: Vec<PathBuf>,

        /// Confidence level of the bootstrap interval
        #[arg(long, default_value_t = 0.95, value_parser = parse_confidence)]
        confidence: f64,
    },

    /// Write a commented default configuration
    Init {
        /// Output path
        #[arg(short, long, default_value = "config.toml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// List answer extraction methods
    Strategies,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            export,
            allow_partial,
            dataset,
        } => {
            let timestamp = report::timestamp();
            start_logging(&config, &timestamp, cli.verbose)?;
            let mut config = load_config(&config)?;
            if allow_partial {
                config.evaluation.allow_partial = true;
            }
            if !dataset.is_empty() {
                config.evaluation.dataset_paths = dataset;
            }
            run_evaluation(config, &export, &timestamp).await
        }
        Commands::Sample {
            config,
            rounds,
            sample_n,
            seed,
            corpus,
            confidence,
        } => {
            let timestamp = report::timestamp();
            start_logging(&config, &timestamp, cli.verbose)?;
            let mut config = load_config(&config)?;
            let sampling = config.sampling.get_or_insert_with(SamplingConfig::default);
            if let Some(rounds) = rounds {
                sampling.rounds = rounds;
            }
            if let Some(sample_n) = sample_n {
                sampling.sample_n = sample_n;
            }
            if let Some(seed) = seed {
                sampling.seed = seed;
            }
            if !corpus.is_empty() {
                sampling.corpus_paths = corpus;
            }
            if sampling.corpus_paths.is_empty() {
                sampling.corpus_paths = config.evaluation.dataset_paths.clone();
            }
            config.validate()?;
            run_sampling(config, confidence, &timestamp).await
        }
        Commands::Init { output, force } => init_config(&output, force),
        Commands::Strategies => {
            list_strategies();
            Ok(())
        }
    }
}

/// Log directory named by the config file, or the default when it cannot be read
fn logs_dir_for(config_path: &Path) -> PathBuf {
    BenchConfig::from_file(config_path)
        .map(|config| config.output.logs_dir)
        .unwrap_or_else(|_| OutputConfig::default().logs_dir)
}

/// Installed before the configuration is loaded
fn start_logging(config_path: &Path, timestamp: &str, verbose: bool) -> Result<()> {
    let log_file = logging::init(&logs_dir_for(config_path), timestamp, verbose)?;
    info!("Logs are being written to: {}", log_file.display());
    Ok(())
}

fn parse_confidence(value: &str) -> Result<f64, String> {
    let confidence: f64 = value
        .parse()
        .map_err(|_| format!("`{}` is not a number", value))?;
    if confidence > 0.0 && confidence < 1.0 {
        Ok(confidence)
    } else {
        Err(format!("confidence must lie strictly between 0 and 1, got {}", confidence))
    }
}

/// "most chosen position X (yy.y%)" for a run that parsed any answer
fn position_bias(distribution: &LabelDistribution) -> Option<String> {
    let label = distribution.most_predicted()?;
    Some(format!(
        "most chosen position {} ({:.1}%)",
        label,
        distribution.predicted_share(label) * 100.0
    ))
}

fn load_config(path: &Path) -> Result<BenchConfig> {
    BenchConfig::load(Some(path))
        .with_context(|| format!("invalid configuration in {}", path.display()))
}

/// Token cancelled on the first Ctrl-C
fn cancel_on_interrupt() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, abandoning in-flight requests");
            trigger.cancel();
        }
    });
    token
}

fn build_runner(config: &BenchConfig, cancel: CancellationToken) -> Result<DatasetRunner> {
    let client =
        Arc::new(OpenAIClient::from_config(config).context("failed to build model client")?);
    // one limiter per invocation, shared by every request it makes
    let limiter = Arc::new(RateLimiter::from_rate(config.llm_api.rate_limit()));
    match limiter.shape() {
        Some((capacity, window)) => {
            info!("Rate limit: {} request(s) per {:?}", capacity, window)
        }
        None => info!("Rate limit: unlimited"),
    }
    let retry = config.llm_api.retry_policy();
    debug!(
        "Up to {} attempt(s) per request, {:?} of backoff at most",
        retry.max_attempts,
        retry.total_backoff()
    );
    let evaluator = QuestionEvaluator::from_config(config, client, limiter)?;

    info!(
        "Model {} via {} ({} extraction, concurrency {})",
        config.model.name,
        config.llm_api.base_url,
        evaluator.extractor_name(),
        config.evaluation.concurrency
    );
    Ok(DatasetRunner::from_config(config, Arc::new(evaluator)).with_cancellation(cancel))
}

async fn run_evaluation(config: BenchConfig, export: &[ExportFormat], timestamp: &str) -> Result<()> {
    let started = Instant::now();
    let cancel = cancel_on_interrupt();
    let runner = build_runner(&config, cancel.clone())?;

    let mut datasets: Vec<DatasetReport> = Vec::new();
    for path in &config.evaluation.dataset_paths {
        let lang = config.evaluation.prompt_language(path).to_string();
        info!("Dataset {} (prompt language {})", path.display(), lang);

        let report = runner
            .run_dataset(path, &lang)
            .await
            .with_context(|| format!("evaluation of {} failed", path.display()))?;
        let complete = !cancel.is_cancelled() && report.files.iter().all(|f| f.is_complete());

        for file in &report.files {
            println!(
                "  {}: {:.2}% ± {:.2}% over {} run(s)",
                file.file_path,
                file.mean_accuracy * 100.0,
                file.std_accuracy * 100.0,
                file.runs.len()
            );
            let last_run = file.runs.last();
            if let Some(bias) = last_run.and_then(|run| position_bias(&run.distribution)) {
                println!("    {}", bias);
            }
        }
        println!(
            "{}: {:.2}% ± {:.2}%",
            report.dataset_path,
            report.average_accuracy * 100.0,
            report.average_std * 100.0
        );

        datasets.push(report);
        if !complete {
            warn!("Run interrupted, reporting partial results");
            break;
        }
    }

    let duration = started.elapsed().as_secs_f64();
    let results_dir = &config.output.results_dir;
    if export.contains(&ExportFormat::Json) {
        let path = report::write_results_json(results_dir, timestamp, &config, &datasets, duration)?;
        println!("Results written to {}", path.display());
    }
    if export.contains(&ExportFormat::Csv) {
        let path = report::write_results_csv(results_dir, timestamp, &datasets)?;
        println!("Results written to {}", path.display());
    }
    let details = report::write_details(results_dir, timestamp, &datasets)?;
    info!("Wrote {} detail file(s)", details.len());

    Ok(())
}

async fn run_sampling(config: BenchConfig, confidence: f64, timestamp: &str) -> Result<()> {
    let Some(sampling) = config.sampling.clone() else {
        bail!("sampling requires a [sampling] section or --sample-n/--rounds");
    };

    let mut files = Vec::new();
    for root in &sampling.corpus_paths {
        files.extend(find_evaluation_files(root)?);
    }
    let corpus = load_corpus(&files).context("failed to load sampling corpus")?;
    info!("Corpus: {} question(s) from {} file(s)", corpus.len(), files.len());

    let lang = sampling
        .corpus_paths
        .first()
        .map(|p| config.evaluation.prompt_language(p).to_string())
        .unwrap_or_else(|| mcqbench_core::DEFAULT_PROMPT_LANGUAGE.to_string());

    let started = Instant::now();
    let runner = build_runner(&config, cancel_on_interrupt())?;
    let orchestrator =
        SamplingOrchestrator::from_config(&config, runner)?.with_confidence(confidence);
    let report = orchestrator.run(&corpus, &lang).await?;

    for round in &report.rounds {
        println!(
            "  round {}: {:.2}%",
            round.statistic.round_index,
            round.statistic.accuracy * 100.0
        );
    }
    println!(
        "Mean accuracy {:.2}% ± {:.2}% over {} rounds ({:.0}% CI {:.2}%-{:.2}%)",
        report.summary.mean_accuracy * 100.0,
        report.summary.stddev_accuracy * 100.0,
        report.summary.n_rounds,
        report.confidence_interval.confidence_level * 100.0,
        report.confidence_interval.lower * 100.0,
        report.confidence_interval.upper * 100.0
    );

    let outputs = report::write_sampling(
        &config.output.results_dir,
        timestamp,
        &config,
        corpus.len(),
        &report,
        started.elapsed().as_secs_f64(),
    )?;
    println!("Results written to {}", outputs.json.display());
    println!("Round summary written to {}", outputs.summary_csv.display());
    Ok(())
}

fn init_config(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", output.display());
    }
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(output, DEFAULT_CONFIG_TEMPLATE)
        .with_context(|| format!("failed to write {}", output.display()))?;
    println!("Wrote default configuration to {}", output.display());
    Ok(())
}

fn strategy_description(method: EvaluationMethod) -> &'static str {
    match method {
        EvaluationMethod::Box => "single \\box{X} or \\boxed{X} span in the reply",
        EvaluationMethod::Pattern => "built-in answer phrases in English and Chinese",
        EvaluationMethod::CustomRegex => "user patterns from evaluation.strategy_config.patterns",
    }
}

fn list_strategies() {
    println!("Answer extraction methods:");
    for method in EvaluationMethod::ALL {
        println!("  {:<14} {}", method.as_str(), strategy_description(method));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_template_is_valid() {
        let config = BenchConfig::from_toml_str(DEFAULT_CONFIG_TEMPLATE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.evaluation.evaluation_method, EvaluationMethod::Box);
        assert!(config.sampling.is_none());
        assert!(config.llm_api.api_key.is_none());
    }

    #[test]
    fn test_init_refuses_to_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        init_config(&path, false).unwrap();
        assert!(BenchConfig::from_file(&path).is_ok());

        assert!(init_config(&path, false).is_err());
        init_config(&path, true).unwrap();
    }

    #[test]
    fn test_cli_parses_export_formats() {
        let cli = Cli::try_parse_from(["mcqbench", "run", "--export", "csv"]).unwrap();
        match cli.command {
            Commands::Run { export, .. } => assert_eq!(export, vec![ExportFormat::Csv]),
            _ => panic!("expected run"),
        }

        let cli = Cli::try_parse_from(["mcqbench", "run"]).unwrap();
        match cli.command {
            Commands::Run { export, .. } => {
                assert_eq!(export, vec![ExportFormat::Json, ExportFormat::Csv])
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_sample_confidence_bounds() {
        let cli = Cli::try_parse_from(["mcqbench", "sample", "--confidence", "0.9"]).unwrap();
        match cli.command {
            Commands::Sample { confidence, .. } => assert_eq!(confidence, 0.9),
            _ => panic!("expected sample"),
        }

        let cli = Cli::try_parse_from(["mcqbench", "sample"]).unwrap();
        match cli.command {
            Commands::Sample { confidence, .. } => assert_eq!(confidence, 0.95),
            _ => panic!("expected sample"),
        }

        assert!(Cli::try_parse_from(["mcqbench", "sample", "--confidence", "1.5"]).is_err());
        assert!(Cli::try_parse_from(["mcqbench", "sample", "--confidence", "0"]).is_err());
    }

    #[test]
    fn test_logs_dir_read_before_full_load() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing.toml");
        assert_eq!(logs_dir_for(&missing), OutputConfig::default().logs_dir);

        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[output]\nlogs_dir = \"custom_logs\"\n").unwrap();
        assert_eq!(logs_dir_for(&path), PathBuf::from("custom_logs"));
    }

    #[test]
    fn test_position_bias_summary() {
        let mut distribution = LabelDistribution::default();
        assert_eq!(position_bias(&distribution), None);

        distribution.predicted.insert("A".to_string(), 3);
        distribution.predicted.insert("C".to_string(), 1);
        assert_eq!(
            position_bias(&distribution).as_deref(),
            Some("most chosen position A (75.0%)")
        );
    }
}
