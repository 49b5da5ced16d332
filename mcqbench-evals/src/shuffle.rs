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

//! Answer-option shuffling.
//!
//! Every (question, run) pair gets its own permutation drawn from an RNG
//! derived from `(seed, run_index, question_id)`, so results do not depend on
//! scheduling order and no permutation state is shared between tasks.

use mcqbench_core::{AnswerOption, Question, OPTION_LABELS};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ShuffleError {
    #[error("question {question_id} has {found} options, expected {expected}")]
    OptionCount {
        question_id: usize,
        found: usize,
        expected: usize,
    },

    #[error("question {question_id}: correct label {label} is not one of its options")]
    UnknownCorrectLabel { question_id: usize, label: char },
}

/// Bijection between original and presented labels
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShuffleMapping {
    /// `(presented, original)` in presented order
    pairs: Vec<(char, char)>,
}

impl ShuffleMapping {
    /// Original label shown under `presented`
    pub fn original_of(&self, presented: char) -> Option<char> {
        self.pairs
            .iter()
            .find(|(p, _)| *p == presented)
            .map(|(_, o)| *o)
    }

    /// Presented label of option `original`
    pub fn presented_of(&self, original: char) -> Option<char> {
        self.pairs
            .iter()
            .find(|(_, o)| *o == original)
            .map(|(p, _)| *p)
    }

    pub fn is_identity(&self) -> bool {
        self.pairs.iter().all(|(p, o)| p == o)
    }

    pub fn pairs(&self) -> &[(char, char)] {
        &self.pairs
    }
}

/// A question as shown to the model for one run
#[derive(Debug, Clone)]
pub struct PresentedQuestion {
    pub question_id: usize,
    pub prompt_text: String,
    /// Options under their presented labels, in presented order
    pub options: Vec<AnswerOption>,
    pub mapping: ShuffleMapping,
    /// Presented label of the correct option
    pub correct_label: char,
}

impl PresentedQuestion {
    /// Question stem followed by one `"<label>: <text>"` line per option
    pub fn render(&self) -> String {
        let mut text = self.prompt_text.clone();
        for option in &self.options {
            text.push('\n');
            text.push(option.label);
            text.push_str(": ");
            text.push_str(&option.text);
        }
        text
    }

    pub fn labels(&self) -> Vec<char> {
        self.options.iter().map(|o| o.label).collect()
    }
}

fn check_shape(question: &Question) -> Result<(), ShuffleError> {
    if question.options.len() != OPTION_LABELS.len() {
        return Err(ShuffleError::OptionCount {
            question_id: question.id,
            found: question.options.len(),
            expected: OPTION_LABELS.len(),
        });
    }
    if question.option_text(question.correct_label).is_none() {
        return Err(ShuffleError::UnknownCorrectLabel {
            question_id: question.id,
            label: question.correct_label,
        });
    }
    Ok(())
}

fn present(question: &Question, order: Vec<&AnswerOption>) -> PresentedQuestion {
    let mut options = Vec::with_capacity(order.len());
    let mut pairs = Vec::with_capacity(order.len());
    let mut correct_label = question.correct_label;

    for (&label, option) in OPTION_LABELS.iter().zip(order) {
        if option.label == question.correct_label {
            correct_label = label;
        }
        pairs.push((label, option.label));
        options.push(AnswerOption::new(label, option.text.clone()));
    }

    PresentedQuestion {
        question_id: question.id,
        prompt_text: question.prompt_text.clone(),
        options,
        mapping: ShuffleMapping { pairs },
        correct_label,
    }
}

/// Present options in storage order
pub fn identity(question: &Question) -> Result<PresentedQuestion, ShuffleError> {
    check_shape(question)?;
    Ok(present(question, question.options.iter().collect()))
}

/// Present options in a random order drawn from `rng`
pub fn shuffle<R: Rng + ?Sized>(
    question: &Question,
    rng: &mut R,
) -> Result<PresentedQuestion, ShuffleError> {
    check_shape(question)?;
    let mut order: Vec<&AnswerOption> = question.options.iter().collect();
    order.shuffle(rng);
    Ok(present(question, order))
}

/// Map a presented label back to the original label space
pub fn unshuffle(mapping: &ShuffleMapping, presented_label: char) -> Option<char> {
    mapping.original_of(presented_label)
}

fn mix(mut z: u64) -> u64 {
    // splitmix64 finalizer
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Derive an independent seed from a base seed and a path of indices
pub fn derive_seed(seed: u64, parts: &[u64]) -> u64 {
    parts.iter().fold(mix(seed), |acc, &part| mix(acc ^ part))
}

/// Per-(run, question) presenter
#[derive(Debug, Clone, Copy)]
pub struct ShuffleMapper {
    enabled: bool,
    seed: Option<u64>,
}

impl ShuffleMapper {
    pub fn new(enabled: bool, seed: Option<u64>) -> Self {
        Self { enabled, seed }
    }

    pub fn disabled() -> Self {
        Self::new(false, None)
    }

    /// RNG for one (run, question) pair; entropy-seeded when no seed is configured
    pub fn rng_for(&self, run_index: usize, question_id: usize) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(derive_seed(
                seed,
                &[run_index as u64, question_id as u64],
            )),
            None => StdRng::from_entropy(),
        }
    }

    pub fn present(
        &self,
        question: &Question,
        run_index: usize,
    ) -> Result<PresentedQuestion, ShuffleError> {
        if self.enabled {
            shuffle(question, &mut self.rng_for(run_index, question.id))
        } else {
            identity(question)
        }
    }
}
