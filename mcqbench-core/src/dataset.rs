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

//! Dataset discovery and loading.
//!
//! Supported formats: `.csv`, `.tsv`, `.json` (array of objects) and `.jsonl`.
//! Every row must provide `question`, `A`, `B`, `C`, `D` and `answer`; a
//! missing column fails the whole file before any request is made.

use crate::question::{AnswerOption, Question, OPTION_LABELS};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

pub const SUPPORTED_EXTENSIONS: [&str; 4] = ["csv", "tsv", "json", "jsonl"];

const QUESTION_COLUMN: &str = "question";
const ANSWER_COLUMN: &str = "answer";

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("failed to read dataset {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse dataset {}: {reason}", .path.display())]
    Parse { path: PathBuf, reason: String },

    #[error("dataset {} is missing required column `{column}`", .path.display())]
    MissingColumn { path: PathBuf, column: String },

    #[error("dataset {} row {row}: answer `{value}` is not one of A, B, C, D", .path.display())]
    InvalidAnswer {
        path: PathBuf,
        row: usize,
        value: String,
    },

    #[error("unsupported dataset format `{extension}` for {}", .path.display())]
    UnsupportedFormat { path: PathBuf, extension: String },

    #[error("no evaluation files found under {}", .root.display())]
    NoEvaluationFiles { root: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Delimited(u8),
    Json,
    JsonLines,
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default()
}

fn format_of(path: &Path) -> Result<Format, DatasetError> {
    match extension_of(path).as_str() {
        "csv" => Ok(Format::Delimited(b',')),
        "tsv" => Ok(Format::Delimited(b'\t')),
        "json" => Ok(Format::Json),
        "jsonl" => Ok(Format::JsonLines),
        other => Err(DatasetError::UnsupportedFormat {
            path: path.to_path_buf(),
            extension: other.to_string(),
        }),
    }
}

pub fn is_supported(path: &Path) -> bool {
    SUPPORTED_EXTENSIONS.contains(&extension_of(path).as_str())
}

fn required_columns() -> impl Iterator<Item = String> {
    std::iter::once(QUESTION_COLUMN.to_string())
        .chain(OPTION_LABELS.iter().map(|l| l.to_string()))
        .chain(std::iter::once(ANSWER_COLUMN.to_string()))
}

/// Load every question of one dataset file, ids numbered from zero
pub fn load_questions(path: impl AsRef<Path>) -> Result<Vec<Question>, DatasetError> {
    let path = path.as_ref();
    let questions = match format_of(path)? {
        Format::Delimited(delimiter) => load_delimited(path, delimiter)?,
        Format::Json => {
            let rows: Vec<Map<String, Value>> =
                serde_json::from_str(&read_to_string(path)?).map_err(|e| DatasetError::Parse {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                })?;
            rows_to_questions(path, rows)?
        }
        Format::JsonLines => {
            let content = read_to_string(path)?;
            let mut rows = Vec::new();
            for (line_no, line) in content.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let row: Map<String, Value> =
                    serde_json::from_str(line).map_err(|e| DatasetError::Parse {
                        path: path.to_path_buf(),
                        reason: format!("line {}: {}", line_no + 1, e),
                    })?;
                rows.push(row);
            }
            rows_to_questions(path, rows)?
        }
    };

    tracing::info!(
        "Loaded {} questions from {}",
        questions.len(),
        path.display()
    );
    Ok(questions)
}

fn read_to_string(path: &Path) -> Result<String, DatasetError> {
    std::fs::read_to_string(path).map_err(|source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn load_delimited(path: &Path, delimiter: u8) -> Result<Vec<Question>, DatasetError> {
    let parse_err = |e: csv::Error| DatasetError::Parse {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_path(path)
        .map_err(|e| match e.into_kind() {
            csv::ErrorKind::Io(source) => DatasetError::Io {
                path: path.to_path_buf(),
                source,
            },
            other => DatasetError::Parse {
                path: path.to_path_buf(),
                reason: format!("{:?}", other),
            },
        })?;

    let headers = reader.headers().map_err(parse_err)?.clone();
    let mut columns = Vec::new();
    for column in required_columns() {
        let idx = headers
            .iter()
            .position(|h| h.trim() == column)
            .ok_or_else(|| DatasetError::MissingColumn {
                path: path.to_path_buf(),
                column: column.clone(),
            })?;
        columns.push(idx);
    }

    let mut questions = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record.map_err(parse_err)?;
        let field = |i: usize| record.get(columns[i]).unwrap_or("").to_string();
        let options = OPTION_LABELS
            .iter()
            .enumerate()
            .map(|(i, &label)| AnswerOption::new(label, field(i + 1)))
            .collect();
        let answer = parse_answer(path, row + 1, &field(5))?;
        questions.push(Question::new(row, field(0), options, answer));
    }
    Ok(questions)
}

fn rows_to_questions(
    path: &Path,
    rows: Vec<Map<String, Value>>,
) -> Result<Vec<Question>, DatasetError> {
    let mut questions = Vec::with_capacity(rows.len());
    for (row, fields) in rows.into_iter().enumerate() {
        let cell = |column: &str| -> Result<String, DatasetError> {
            match fields.get(column) {
                Some(value) => Ok(value_to_text(value)),
                None => Err(DatasetError::MissingColumn {
                    path: path.to_path_buf(),
                    column: column.to_string(),
                }),
            }
        };

        let prompt = cell(QUESTION_COLUMN)?;
        let mut options = Vec::with_capacity(OPTION_LABELS.len());
        for label in OPTION_LABELS {
            options.push(AnswerOption::new(label, cell(&label.to_string())?));
        }
        let answer = parse_answer(path, row + 1, &cell(ANSWER_COLUMN)?)?;
        questions.push(Question::new(row, prompt, options, answer));
    }
    Ok(questions)
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn parse_answer(path: &Path, row: usize, raw: &str) -> Result<char, DatasetError> {
    let normalized = raw.trim().to_uppercase();
    let mut chars = normalized.chars();
    match (chars.next(), chars.next()) {
        (Some(label), None) if OPTION_LABELS.contains(&label) => Ok(label),
        _ => Err(DatasetError::InvalidAnswer {
            path: path.to_path_buf(),
            row,
            value: raw.to_string(),
        }),
    }
}

/// Recursively collect supported dataset files under `root`, sorted.
///
/// Hidden directories and `.lock` files are skipped; other unsupported files
/// are skipped with a warning. A plain file path is returned as-is.
pub fn find_evaluation_files(root: impl AsRef<Path>) -> Result<Vec<PathBuf>, DatasetError> {
    let root = root.as_ref();
    if root.is_file() {
        format_of(root)?;
        return Ok(vec![root.to_path_buf()]);
    }

    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_hidden_dir(e));

    for entry in walker {
        let entry = entry.map_err(|e| DatasetError::Io {
            path: e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf()),
            source: e.into(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        if extension_of(path) == "lock" {
            continue;
        }
        if is_supported(path) {
            files.push(path.to_path_buf());
        } else {
            tracing::warn!("Skipping unsupported file {}", path.display());
        }
    }

    if files.is_empty() {
        return Err(DatasetError::NoEvaluationFiles {
            root: root.to_path_buf(),
        });
    }

    files.sort();
    Ok(files)
}

fn is_hidden_dir(entry: &walkdir::DirEntry) -> bool {
    entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .map(|name| name.starts_with('.'))
            .unwrap_or(false)
}

/// Concatenate every file under `paths` into one corpus with stable ids
pub fn load_corpus(paths: &[PathBuf]) -> Result<Vec<Question>, DatasetError> {
    let mut corpus = Vec::new();
    for root in paths {
        for file in find_evaluation_files(root)? {
            for question in load_questions(&file)? {
                let id = corpus.len();
                corpus.push(question.with_id(id));
            }
        }
    }
    Ok(corpus)
}
