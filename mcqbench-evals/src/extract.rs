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

//! Answer extraction policies.
//!
//! An extractor turns free-form model output into one of the presented option
//! labels, or `None` when the output is empty, ambiguous or unparseable.
//! Extraction never fails; a `None` is scored as incorrect.

use mcqbench_core::{EvaluationMethod, StrategyConfig};
use regex::Regex;
use std::sync::Arc;
use thiserror::Error;

/// Default pattern list, tried in order
pub const DEFAULT_PATTERNS: &[&str] = &[
    r"correct answer is:\n\n\n([A-D]).",
    r"correct answer is:\n\n([A-D]).",
    r"correct answer is:\n([A-D]).",
    r"(?i:answer is):?\s*\**\(?([A-D])\b",
    r"正確的答案應該是:.*?\b([A-D])\b",
    r"正确的答案应该是:.*?\b([A-D])\b",
    r"正確的選項應為:.*?\b([A-D])\b",
    r"正确的选项应为:.*?\b([A-D])\b",
    r"正確的答案是（([A-D])）",
    r"正确的答案是（([A-D])）",
    r"答案應該是:\s?選?項?\s?([A-D])",
    r"答案应该是:\s?选?项?\s?([A-D])",
    r"答案是:\s?選?項?\s?([A-D])",
    r"答案是:\s?选?项?\s?([A-D])",
    r"答案應為:\s?選?項?\s?([A-D])",
    r"答案应为:\s?选?项?\s?([A-D])",
    r"答案為:\s?([A-D])",
    r"答案应为：\s?([A-D])",
    r"答案為：\s?([A-D])",
    r"正確答案為 \*\*([A-D])",
    r"正確答案為\(([A-D])\)",
    r"答案是 \*\*([A-D])",
    r"答案 ([A-D]) 正確",
    r"選項 ([A-D]) 正確",
    r"所以答案為([A-D])",
    r"答案：\(([A-D])\)",
    r"答案:\s?([A-D])",
    r"答案：\s?([A-D])",
    r"答案([A-D]) ",
    r"^選項([A-D])",
    r"^选项([A-D])",
    r"^選([A-D])",
    r"^选([A-D])",
    r"\b([A-D])\b",
];

const BOX_PATTERN: &str = r"\\{1,2}box(?:ed)?\{([^{}]*)\}";

#[derive(Debug, Error)]
pub enum ExtractorError {
    #[error("invalid answer pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("custom_regex requires at least one pattern in strategy_config.patterns")]
    MissingPatterns,
}

/// Trait implemented by every extraction policy
pub trait AnswerExtractor: Send + Sync {
    /// Policy name as used in configuration
    fn name(&self) -> &str;

    /// Extract a presented label from `raw_text`
    fn extract(&self, raw_text: &str, valid_labels: &[char]) -> Option<char>;
}

fn as_label(captured: &str, valid_labels: &[char]) -> Option<char> {
    let mut chars = captured.trim().chars();
    match (chars.next(), chars.next()) {
        (Some(label), None) if valid_labels.contains(&label) => Some(label),
        _ => None,
    }
}

/// `\box{X}` / `\boxed{X}` extraction; exactly one span must be present
pub struct BoxExtractor {
    pattern: Regex,
}

impl BoxExtractor {
    pub fn new() -> Result<Self, ExtractorError> {
        let pattern = Regex::new(BOX_PATTERN).map_err(|source| ExtractorError::InvalidPattern {
            pattern: BOX_PATTERN.to_string(),
            source,
        })?;
        Ok(Self { pattern })
    }
}

impl AnswerExtractor for BoxExtractor {
    fn name(&self) -> &str {
        "box"
    }

    fn extract(&self, raw_text: &str, valid_labels: &[char]) -> Option<char> {
        let mut spans = self.pattern.captures_iter(raw_text);
        let only = spans.next()?;
        if spans.next().is_some() {
            return None;
        }
        as_label(only.get(1)?.as_str(), valid_labels)
    }
}

/// Ordered regular expressions; the first capture that is a valid label wins
pub struct PatternExtractor {
    name: &'static str,
    patterns: Vec<Regex>,
}

impl PatternExtractor {
    /// Extractor over [`DEFAULT_PATTERNS`]
    pub fn with_defaults() -> Self {
        Self {
            name: "pattern",
            patterns: DEFAULT_PATTERNS
                .iter()
                .filter_map(|p| Regex::new(p).ok())
                .collect(),
        }
    }

    pub fn from_patterns(patterns: &[String]) -> Result<Self, ExtractorError> {
        let patterns = patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|source| ExtractorError::InvalidPattern {
                    pattern: p.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            name: "pattern",
            patterns,
        })
    }

    fn named(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }
}

impl AnswerExtractor for PatternExtractor {
    fn name(&self) -> &str {
        self.name
    }

    fn extract(&self, raw_text: &str, valid_labels: &[char]) -> Option<char> {
        if raw_text.trim().is_empty() {
            return None;
        }
        self.patterns.iter().find_map(|pattern| {
            pattern
                .captures_iter(raw_text)
                .filter_map(|caps| caps.get(1))
                .find_map(|group| as_label(group.as_str(), valid_labels))
        })
    }
}

/// Build the extractor selected by `method`
pub fn build_extractor(
    method: EvaluationMethod,
    strategy: &StrategyConfig,
) -> Result<Arc<dyn AnswerExtractor>, ExtractorError> {
    let extractor: Arc<dyn AnswerExtractor> = match method {
        EvaluationMethod::Box => Arc::new(BoxExtractor::new()?),
        EvaluationMethod::Pattern if strategy.patterns.is_empty() => {
            Arc::new(PatternExtractor::with_defaults())
        }
        EvaluationMethod::Pattern => Arc::new(PatternExtractor::from_patterns(&strategy.patterns)?),
        EvaluationMethod::CustomRegex => {
            if strategy.patterns.is_empty() {
                return Err(ExtractorError::MissingPatterns);
            }
            Arc::new(PatternExtractor::from_patterns(&strategy.patterns)?.named("custom_regex"))
        }
    };
    Ok(extractor)
}
