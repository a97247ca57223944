//! Context compaction: fit the most relevant memories into a token budget.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{MemoryId, MemoryRecord};

/// First line of every non-empty digest.
pub const DIGEST_HEADER: &str = "Historical Context:";

/// Estimates how many model tokens a piece of text costs. Must be deterministic.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

impl<F> TokenCounter for F
where
    F: Fn(&str) -> usize + Send + Sync,
{
    fn count(&self, text: &str) -> usize {
        self(text)
    }
}

/// ⌈chars / chars_per_token⌉.
#[derive(Debug, Clone, Copy)]
pub struct CharEstimate {
    pub chars_per_token: usize,
}

impl Default for CharEstimate {
    fn default() -> Self {
        Self { chars_per_token: 4 }
    }
}

impl TokenCounter for CharEstimate {
    fn count(&self, text: &str) -> usize {
        text.chars().count().div_ceil(self.chars_per_token.max(1))
    }
}

/// Weights of the relevance score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub recency: f64,
    pub tags: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            recency: 1.0,
            tags: 5.0,
        }
    }
}

/// Rendered result of a compaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Digest {
    pub text: String,
    pub tokens: usize,
    /// Selected records, in digest order.
    pub records: Vec<MemoryId>,
}

impl Digest {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Digest line for one record: `- [type] <content json> #tag ...`.
pub fn render_line(record: &MemoryRecord) -> String {
    let mut line = format!("- [{}] {}", record.kind, record.content);
    for tag in &record.tags {
        line.push_str(" #");
        line.push_str(tag);
    }
    line
}

/// Select and render records.
///
/// Records are scored `recency * rank + tags * matching_tags`, where rank is
/// the dense rank of the creation time (oldest = 1). Records are taken in
/// score order until the next one would push the whole digest over `budget`.
pub(crate) fn compact(
    records: &[MemoryRecord],
    budget: usize,
    focus_tags: &[String],
    weights: ScoreWeights,
    counter: &dyn TokenCounter,
) -> Digest {
    if budget == 0 || records.is_empty() {
        return Digest::default();
    }

    let timestamps: BTreeSet<DateTime<Utc>> = records.iter().map(|r| r.created_at).collect();
    let focus: BTreeSet<String> = focus_tags.iter().map(|t| t.to_lowercase()).collect();

    let mut scored: Vec<(usize, f64)> = records
        .iter()
        .enumerate()
        .map(|(index, record)| {
            let rank = timestamps.range(..=record.created_at).count() as f64;
            let matching = record
                .tags
                .iter()
                .map(|t| t.to_lowercase())
                .collect::<BTreeSet<_>>()
                .intersection(&focus)
                .count() as f64;
            (index, weights.recency * rank + weights.tags * matching)
        })
        .collect();

    // Highest score first; ties go to the record that was stored later.
    scored.sort_by(|(ia, sa), (ib, sb)| {
        sb.total_cmp(sa)
            .then_with(|| records[*ib].created_at.cmp(&records[*ia].created_at))
            .then_with(|| ia.cmp(ib))
    });

    let mut digest = Digest::default();
    for (index, _) in scored {
        let record = &records[index];
        let candidate = if digest.text.is_empty() {
            format!("{DIGEST_HEADER}\n{}", render_line(record))
        } else {
            format!("{}\n{}", digest.text, render_line(record))
        };
        let tokens = counter.count(&candidate);
        if tokens > budget {
            break;
        }
        digest.text = candidate;
        digest.tokens = tokens;
        digest.records.push(record.id);
    }

    tracing::debug!(
        budget,
        selected = digest.records.len(),
        candidates = records.len(),
        tokens = digest.tokens,
        "memories compacted"
    );
    digest
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn record(secs: i64, tags: &[&str]) -> MemoryRecord {
        MemoryRecord {
            id: MemoryId::new(),
            user_id: "u".into(),
            kind: "note".into(),
            content: json!({"t": secs}),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            created_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
        }
    }

    fn lines(count: usize) -> impl Fn(&str) -> usize {
        move |text: &str| text.lines().count() * count
    }

    #[test]
    fn zero_budget_is_empty() {
        let records = vec![record(1, &[])];
        let digest = compact(&records, 0, &[], ScoreWeights::default(), &CharEstimate::default());
        assert!(digest.is_empty());
        assert!(digest.text.is_empty());
    }

    #[test]
    fn never_exceeds_budget() {
        let records: Vec<_> = (0..30).map(|i| record(i, &["x"])).collect();
        let counter = CharEstimate::default();
        for budget in [1, 5, 17, 40, 100, 250, 1_000] {
            let digest = compact(&records, budget, &[], ScoreWeights::default(), &counter);
            assert!(digest.tokens <= budget);
            assert_eq!(counter.count(&digest.text), digest.tokens);
        }
    }

    #[test]
    fn deterministic() {
        let records: Vec<_> = (0..10).map(|i| record(i % 3, &["a", "b"])).collect();
        let focus = vec!["a".to_string()];
        let counter = CharEstimate::default();
        let first = compact(&records, 60, &focus, ScoreWeights::default(), &counter);
        let second = compact(&records, 60, &focus, ScoreWeights::default(), &counter);
        assert_eq!(first, second);
    }

    #[test]
    fn newest_records_win_without_focus() {
        let records = vec![record(3, &[]), record(2, &[]), record(1, &[])];
        // Header plus two records.
        let digest = compact(&records, 3, &[], ScoreWeights::default(), &lines(1));
        assert_eq!(digest.records, vec![records[0].id, records[1].id]);
        assert!(digest.text.starts_with(DIGEST_HEADER));
    }

    #[test]
    fn more_matching_tags_wins_at_equal_recency() {
        let one = record(5, &["exam"]);
        let two = record(5, &["exam", "Biology"]);
        let records = vec![one.clone(), two.clone()];
        let focus = vec!["exam".to_string(), "biology".to_string()];

        // Room for the header and exactly one record.
        let digest = compact(&records, 2, &focus, ScoreWeights::default(), &lines(1));
        assert_eq!(digest.records, vec![two.id]);
    }

    #[test]
    fn higher_score_is_never_skipped_for_lower() {
        let long = MemoryRecord {
            content: json!({"text": "x".repeat(400)}),
            ..record(10, &[])
        };
        let short = record(1, &[]);
        let records = vec![long, short];

        let digest = compact(&records, 50, &[], ScoreWeights::default(), &CharEstimate::default());
        assert!(digest.is_empty());
    }

    #[test]
    fn render_line_format() {
        let r = record(0, &["a", "b"]);
        assert_eq!(render_line(&r), r#"- [note] {"t":0} #a #b"#);
    }
}
