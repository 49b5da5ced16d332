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

//! Label distribution of one run
//!
//! Counts are kept in presented (position) space so a model that favours a
//! position shows up even when options are shuffled. Without shuffling the
//! presented and original labels coincide.

use mcqbench_core::{GradedResult, OPTION_LABELS};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const N: usize = OPTION_LABELS.len();

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LabelDistribution {
    /// How often each position was chosen
    pub predicted: BTreeMap<String, usize>,
    /// How often each position held the correct option
    pub correct: BTreeMap<String, usize>,
    /// Responses with no extractable label
    pub unparsed: usize,
    /// Requests that never succeeded
    pub unanswered: usize,
    /// `confusion[correct][predicted]` over positions A-D
    pub confusion: [[usize; N]; N],
}

fn index_of(label: char) -> Option<usize> {
    OPTION_LABELS.iter().position(|&l| l == label)
}

impl LabelDistribution {
    pub fn from_results(results: &[GradedResult]) -> Self {
        let mut dist = Self::default();
        for label in OPTION_LABELS {
            dist.predicted.insert(label.to_string(), 0);
            dist.correct.insert(label.to_string(), 0);
        }

        for result in results {
            *dist
                .correct
                .entry(result.presented_correct_label.to_string())
                .or_default() += 1;

            match result.presented_predicted_label {
                Some(label) => {
                    *dist.predicted.entry(label.to_string()).or_default() += 1;
                    if let (Some(row), Some(col)) =
                        (index_of(result.presented_correct_label), index_of(label))
                    {
                        dist.confusion[row][col] += 1;
                    }
                }
                None if result.is_unanswerable() => dist.unanswered += 1,
                None => dist.unparsed += 1,
            }
        }
        dist
    }

    /// Share of parsed answers that picked `label`
    pub fn predicted_share(&self, label: char) -> f64 {
        let parsed: usize = self.predicted.values().sum();
        if parsed == 0 {
            return 0.0;
        }
        self.predicted.get(&label.to_string()).copied().unwrap_or(0) as f64 / parsed as f64
    }

    /// Position picked most often, if any answer was parsed
    pub fn most_predicted(&self) -> Option<char> {
        self.predicted
            .iter()
            .filter(|(_, count)| **count > 0)
            .max_by_key(|(_, count)| **count)
            .and_then(|(label, _)| label.chars().next())
    }
}
