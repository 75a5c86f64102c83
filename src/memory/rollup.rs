//! Long-term rollups: summaries of recent exchanges that stay recallable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Keywords that mark an exchange as operationally significant.
const IMPORTANCE_KEYWORDS: [&str; 13] = [
    "error",
    "bug",
    "fix",
    "solution",
    "problem",
    "deploy",
    "production",
    "critical",
    "important",
    "api",
    "database",
    "configuration",
    "setup",
];

/// One long-term memory record, produced every rollup interval.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryRollup {
    /// Original user queries joined with `" | "`.
    pub query: String,
    /// Model-generated 2–3 sentence summary of the window.
    pub summary: String,
    /// The last model answer in the window, served verbatim on a
    /// cached-answer hit.
    pub answer: String,
    pub topics: Vec<String>,
    /// Importance in [0.5, 1.0].
    pub importance: f32,
    /// Reads served from this rollup.
    pub interactions: u64,
    pub last_accessed: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl MemoryRollup {
    #[must_use]
    pub fn new(query: String, summary: String, answer: String, topics: Vec<String>) -> Self {
        let importance = importance_score(&summary, &topics);
        let now = Utc::now();
        Self {
            query,
            summary,
            answer,
            topics,
            importance,
            interactions: 0,
            last_accessed: now,
            created_at: now,
        }
    }

    /// Text that gets embedded for recall: queries + summary + topics.
    #[must_use]
    pub fn embeddable_text(&self) -> String {
        format!("{} {} {}", self.query, self.summary, self.topics.join(", "))
    }
}

/// Importance scoring: start at 0.5; reward long summaries, topical
/// breadth, and operational keywords; clamp to [0.5, 1.0].
#[must_use]
pub fn importance_score(summary: &str, topics: &[String]) -> f32 {
    let mut score = 0.5f32;
    if summary.len() > 500 {
        score += 0.2;
    } else if summary.len() > 200 {
        score += 0.1;
    }
    score += (topics.len() as f32 * 0.05).min(0.2);

    let haystack = format!("{} {}", summary.to_lowercase(), topics.join(" ").to_lowercase());
    let mut keyword_bonus = 0.0f32;
    for keyword in IMPORTANCE_KEYWORDS {
        if haystack.contains(keyword) {
            keyword_bonus += 0.05;
        }
    }
    score += keyword_bonus.min(0.15);
    score.clamp(0.5, 1.0)
}
