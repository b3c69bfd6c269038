//! Append-only list of business insights rendered as a memo.

pub const INSIGHTS_MEMO_URI: &str = "memo://insights";

const EMPTY_MEMO: &str = "No business insights have been discovered yet.";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InsightLedger {
    entries: Vec<String>,
}

impl InsightLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, insight: impl Into<String>) {
        self.entries.push(insight.into());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn render(&self) -> String {
        if self.entries.is_empty() {
            return EMPTY_MEMO.to_string();
        }
        let bullets = self
            .entries
            .iter()
            .map(|insight| format!("- {insight}"))
            .collect::<Vec<_>>()
            .join("\n");
        let mut memo = format!("Business Intelligence Memo\n\nKey Insights Discovered:\n\n{bullets}");
        if self.entries.len() > 1 {
            memo.push_str(&format!(
                "\nSummary:\nAnalysis has revealed {} key business insights that suggest \
                 opportunities for strategic optimization and growth.",
                self.entries.len()
            ));
        }
        memo
    }
}
