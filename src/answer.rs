use crate::store::Row;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerStatus {
    Success,
    /// The query ran but nothing matched.
    Empty,
    Failed,
}

/// States of one request; the trace lists them in the order visited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Drafting,
    Guarding,
    Retry,
    Executing,
    Summarizing,
    Done,
    Failed,
}

/// A guard rejection recorded on the way to the final statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    pub sql: String,
    pub rule: String,
    pub message: String,
}

/// Everything the caller gets back for one question.
#[derive(Debug, Clone, Serialize)]
pub struct QueryAnswer {
    pub request_id: String,
    pub question: String,
    /// The statement that was executed, if any.
    pub sql: Option<String>,
    pub status: AnswerStatus,
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    pub narrative: String,
    pub suggestions: Vec<String>,
    pub caveat: Option<String>,
    pub attempts: Vec<Attempt>,
    pub trace: Vec<PipelineState>,
    pub elapsed_ms: u64,
}

impl QueryAnswer {
    pub fn drafts(&self) -> usize {
        self.trace.iter().filter(|s| **s == PipelineState::Drafting).count()
    }

    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
