// src/ingest/report.rs
use indexmap::IndexMap;
use serde::Serialize;

/// Per-source lifecycle. Every source ends in one of the terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceState {
    Pending,
    Fetching,
    FetchFailed,
    Fetched,
    Transforming,
    TransformFailed,
    Transformed,
    Storing,
    StoreFailed,
    Stored,
}

impl SourceState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::FetchFailed | Self::TransformFailed | Self::StoreFailed | Self::Stored
        )
    }

    pub fn is_failure(self) -> bool {
        matches!(
            self,
            Self::FetchFailed | Self::TransformFailed | Self::StoreFailed
        )
    }

    /// Legal forward transitions of the pipeline.
    pub fn can_advance_to(self, next: Self) -> bool {
        use SourceState::*;
        matches!(
            (self, next),
            (Pending, Fetching)
                | (Fetching, FetchFailed | Fetched)
                | (Fetched, Transforming)
                | (Transforming, TransformFailed | Transformed)
                | (Transformed, Storing)
                | (Storing, StoreFailed | Stored)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SourceReport {
    pub rows: u64,
    pub state: SourceState,
}

impl SourceReport {
    pub fn stored(rows: u64) -> Self {
        Self {
            rows,
            state: SourceState::Stored,
        }
    }

    /// Failures always report zero rows, even if some chunks were committed.
    pub fn failed(state: SourceState) -> Self {
        debug_assert!(state.is_failure());
        Self { rows: 0, state }
    }
}

/// Outcome of one run keyed by source label, in completion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ProcessingReport {
    entries: IndexMap<String, SourceReport>,
}

impl ProcessingReport {
    pub fn record(&mut self, label: impl Into<String>, report: SourceReport) {
        let label = label.into();
        if self.entries.contains_key(&label) {
            tracing::warn!(source = %label, "duplicate source label, later result wins");
        }
        self.entries.insert(label, report);
    }

    pub fn contains(&self, label: &str) -> bool {
        self.entries.contains_key(label)
    }

    pub fn get(&self, label: &str) -> Option<&SourceReport> {
        self.entries.get(label)
    }

    /// Rows stored for `label`; 0 for failed or unknown sources.
    pub fn row_count(&self, label: &str) -> u64 {
        self.entries.get(label).map(|r| r.rows).unwrap_or(0)
    }

    /// Plain `label -> rows` view.
    pub fn row_counts(&self) -> IndexMap<String, u64> {
        self.entries
            .iter()
            .map(|(k, v)| (k.clone(), v.rows))
            .collect()
    }

    pub fn total_rows(&self) -> u64 {
        self.entries.values().map(|r| r.rows).sum()
    }

    pub fn failures(&self) -> usize {
        self.entries.values().filter(|r| r.state.is_failure()).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &SourceReport)> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_follow_the_pipeline() {
        use SourceState::*;
        assert!(Pending.can_advance_to(Fetching));
        assert!(Fetching.can_advance_to(FetchFailed));
        assert!(Storing.can_advance_to(Stored));
        assert!(!Fetched.can_advance_to(Storing));
        assert!(!Stored.can_advance_to(Fetching));
        assert!(Stored.is_terminal() && !Stored.is_failure());
        assert!(TransformFailed.is_terminal() && TransformFailed.is_failure());
        assert!(!Transformed.is_terminal());
    }

    #[test]
    fn report_keeps_completion_order_and_zero_on_failure() {
        let mut r = ProcessingReport::default();
        r.record("b", SourceReport::stored(10));
        r.record("a", SourceReport::failed(SourceState::FetchFailed));
        let keys: Vec<_> = r.row_counts().into_keys().collect();
        assert_eq!(keys, vec!["b", "a"]);
        assert_eq!(r.row_count("a"), 0);
        assert_eq!(r.row_count("missing"), 0);
        assert_eq!(r.total_rows(), 10);
        assert_eq!(r.failures(), 1);
    }

    #[test]
    fn serializes_with_state() {
        let mut r = ProcessingReport::default();
        r.record("posts", SourceReport::stored(3));
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v, serde_json::json!({"posts": {"rows": 3, "state": "STORED"}}));
    }
}
