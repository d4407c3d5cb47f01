//! Discussion stage classification for governance announcements.
//!
//! Texts from governance mailing lists are assigned one of a fixed label
//! set. The default model is a weighted keyword scorer; other models plug in
//! through [`StageClassifier`].

use serde::{Deserialize, Serialize};

pub const STAGE_LABELS: [&str; 7] = [
    "cip-discuss",
    "cip-vote",
    "cip-announce",
    "tokenomics",
    "tokenomics-announce",
    "sv-announce",
    "other",
];

const FALLBACK_STAGE: &str = "other";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageClassification {
    pub stage: String,
    /// Share of the matched weight that went to `stage`, in `[0, 1]`
    pub confidence: f64,
}

impl StageClassification {
    fn fallback() -> Self {
        Self {
            stage: FALLBACK_STAGE.to_string(),
            confidence: 0.0,
        }
    }
}

pub trait StageClassifier: Send + Sync {
    fn classify(&self, text: &str) -> StageClassification;
}

/// Keyword weights per label, in `STAGE_LABELS` order
const KEYWORDS: [(&str, &[(&str, f64)]); 6] = [
    (
        "cip-discuss",
        &[
            ("discussion", 2.0),
            ("discuss", 2.0),
            ("feedback", 1.5),
            ("draft", 1.5),
            ("proposal", 1.0),
            ("cip", 1.0),
            ("comments", 1.0),
        ],
    ),
    (
        "cip-vote",
        &[
            ("vote", 2.0),
            ("voting", 2.0),
            ("ballot", 2.0),
            ("vote request", 2.5),
            ("cip", 1.0),
            ("deadline", 1.0),
        ],
    ),
    (
        "cip-announce",
        &[
            ("approved", 2.0),
            ("accepted", 1.5),
            ("passed", 1.5),
            ("announce", 1.0),
            ("cip", 1.0),
        ],
    ),
    (
        "tokenomics",
        &[
            ("tokenomics", 2.5),
            ("reward", 1.5),
            ("rewards", 1.5),
            ("fee", 1.0),
            ("fees", 1.0),
            ("mint", 1.5),
            ("inflation", 1.5),
            ("amulet", 1.0),
            ("canton coin", 1.5),
        ],
    ),
    (
        "tokenomics-announce",
        &[
            ("tokenomics", 1.5),
            ("announce", 1.5),
            ("announcement", 1.5),
            ("effective", 1.0),
            ("reward", 1.0),
            ("fee schedule", 2.0),
        ],
    ),
    (
        "sv-announce",
        &[
            ("super validator", 2.5),
            ("sv", 1.5),
            ("onboard", 2.0),
            ("onboarding", 2.0),
            ("offboard", 2.0),
            ("node operator", 1.5),
            ("weight", 1.0),
        ],
    ),
];

#[derive(Debug, Default, Clone, Copy)]
pub struct KeywordStageClassifier;

impl KeywordStageClassifier {
    pub fn new() -> Self {
        Self
    }
}

impl StageClassifier for KeywordStageClassifier {
    fn classify(&self, text: &str) -> StageClassification {
        let text = text.trim();
        if text.is_empty() {
            return StageClassification::fallback();
        }
        let normalized = normalize(text);

        let scores: Vec<(&str, f64)> = KEYWORDS
            .iter()
            .map(|(label, words)| {
                let score = words
                    .iter()
                    .map(|(word, weight)| occurrences(&normalized, word) as f64 * weight)
                    .sum();
                (*label, score)
            })
            .collect();

        let total: f64 = scores.iter().map(|(_, s)| s).sum();
        if total <= 0.0 {
            return StageClassification::fallback();
        }

        // Ties keep the earlier label.
        let (stage, best) = scores
            .iter()
            .fold((FALLBACK_STAGE, 0.0), |acc, &(label, score)| {
                if score > acc.1 {
                    (label, score)
                } else {
                    acc
                }
            });

        StageClassification {
            stage: stage.to_string(),
            confidence: best / total,
        }
    }
}

/// Classify with the default keyword model
pub fn classify_stage(text: &str) -> StageClassification {
    KeywordStageClassifier.classify(text)
}

/// Lower-case and collapse everything that is not alphanumeric to single
/// spaces, padded so whole-word matches can use `" word "`.
fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push(' ');
    let mut last_space = true;
    for c in text.chars() {
        if c.is_alphanumeric() {
            out.extend(c.to_lowercase());
            last_space = false;
        } else if !last_space {
            out.push(' ');
            last_space = true;
        }
    }
    if !last_space {
        out.push(' ');
    }
    out
}

fn occurrences(normalized: &str, phrase: &str) -> usize {
    let needle = format!(" {} ", phrase);
    let mut count = 0;
    let mut start = 0;
    while let Some(pos) = normalized[start..].find(&needle) {
        count += 1;
        // Step past the word but keep its trailing space for the next match.
        start += pos + needle.len() - 1;
    }
    count
}
