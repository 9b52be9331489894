//! Query Generator
//!
//! Turns a prompt payload into exactly one candidate SQL string. The text the
//! model returns is not trusted; it is only cleaned up here and checked by the
//! guard afterwards.

use crate::error::{PipelineError, Result};
use crate::llm::{CompletionRequest, CompletionService};
use crate::prompts::PromptPayload;
use lazy_static::lazy_static;
use regex::Regex;
use std::sync::Arc;
use tracing::debug;

lazy_static! {
    static ref FENCED_BLOCK: Regex = Regex::new(r"(?s)```[A-Za-z]*[ \t]*\r?\n?(.*?)```").unwrap();
    static ref STATEMENT_LINE: Regex = Regex::new(
        r"(?im)^[ \t(]*(SELECT|WITH|INSERT|UPDATE|DELETE|REPLACE|DROP|ALTER|CREATE|PRAGMA|ATTACH|DETACH|VACUUM)\b"
    )
    .unwrap();
    static ref INLINE_SELECT: Regex = Regex::new(r"(?i)\bSELECT\b").unwrap();
    static ref BLANK_LINE: Regex = Regex::new(r"\n[ \t]*\r?\n").unwrap();
}

/// Words a continuation paragraph of a statement may start with.
const CONTINUATION_WORDS: &[&str] = &[
    "SELECT", "FROM", "WHERE", "GROUP", "ORDER", "HAVING", "LIMIT", "OFFSET", "JOIN", "LEFT", "INNER",
    "CROSS", "ON", "AND", "OR", "NOT", "UNION", "INTERSECT", "EXCEPT", "WITH", "AS", "CASE", "WHEN",
    "THEN", "ELSE", "END", "COLLATE",
];

pub struct QueryGenerator {
    llm: Arc<dyn CompletionService>,
    max_tokens: u32,
}

impl QueryGenerator {
    pub fn new(llm: Arc<dyn CompletionService>, max_tokens: u32) -> Self {
        Self { llm, max_tokens }
    }

    pub async fn generate(&self, payload: &PromptPayload) -> Result<String> {
        let request = CompletionRequest {
            system: Some(payload.system.clone()),
            user: payload.user.clone(),
            max_tokens: self.max_tokens,
        };

        let text = self.llm.complete(&request).await?;
        debug!("Model returned {} characters", text.len());

        extract_sql(&text).ok_or_else(|| {
            PipelineError::Generation("The model response did not contain a SQL statement".to_string())
        })
    }
}

/// Pulls the statement out of a model response.
///
/// Handles markdown fences, `SQLQuery:` markers and narration before or
/// after the statement. Returns `None` when no statement is present.
pub fn extract_sql(response: &str) -> Option<String> {
    let mut text = response.trim();

    if let Some(captures) = FENCED_BLOCK.captures(text) {
        if let Some(body) = captures.get(1) {
            text = body.as_str().trim();
        }
    }

    if let Some(start) = text.find("SQLQuery:") {
        text = text[start + "SQLQuery:".len()..].trim();
    }
    let end = text
        .find("SQLResult:")
        .or_else(|| text.find("Answer:"))
        .unwrap_or(text.len());
    text = text[..end].trim();

    // stray fence markers left by a truncated answer
    let cleaned = text.replace("```sql", "").replace("```", "");
    let text = cleaned.trim();

    let start = STATEMENT_LINE
        .find(text)
        .map(|m| m.start())
        .or_else(|| INLINE_SELECT.find(text).map(|m| m.start()))?;
    let statement = drop_trailing_prose(&text[start..]);

    let statement = statement.trim();
    if statement.is_empty() {
        None
    } else {
        Some(statement.to_string())
    }
}

/// Keeps blank-line separated paragraphs while they still read like SQL.
fn drop_trailing_prose(text: &str) -> &str {
    BLANK_LINE
        .find_iter(text)
        .find(|separator| !looks_like_sql(&text[separator.end()..]))
        .map(|separator| &text[..separator.start()])
        .unwrap_or(text)
}

fn looks_like_sql(paragraph: &str) -> bool {
    let trimmed = paragraph.trim_start();
    if trimmed.starts_with(['(', ')', ',', ';']) {
        return true;
    }
    let first = trimmed
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .next()
        .unwrap_or("")
        .to_ascii_uppercase();
    CONTINUATION_WORDS.contains(&first.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    #[test]
    fn test_plain_sql() {
        assert_eq!(extract_sql("SELECT 1").as_deref(), Some("SELECT 1"));
    }

    #[test]
    fn test_fenced_sql() {
        let response = "Here you go:\n```sql\nSELECT acronym\nFROM projects\nLIMIT 5\n```\nThis lists five projects.";
        assert_eq!(
            extract_sql(response).as_deref(),
            Some("SELECT acronym\nFROM projects\nLIMIT 5")
        );
    }

    #[test]
    fn test_sqlquery_marker() {
        let response = "SQLQuery: SELECT * FROM projects LIMIT 5\nSQLResult: ...\nAnswer: five";
        assert_eq!(extract_sql(response).as_deref(), Some("SELECT * FROM projects LIMIT 5"));
    }

    #[test]
    fn test_leading_and_trailing_narration() {
        let response = "Sure! The query is below.\n\nSELECT acronym\nFROM projects\n\nWHERE category = 'Cross cutting'\n\nThis returns cross cutting projects.";
        assert_eq!(
            extract_sql(response).as_deref(),
            Some("SELECT acronym\nFROM projects\n\nWHERE category = 'Cross cutting'")
        );
    }

    #[test]
    fn test_inline_select_after_prose() {
        let response = "The answer is SELECT COUNT(*) FROM projects";
        assert_eq!(extract_sql(response).as_deref(), Some("SELECT COUNT(*) FROM projects"));
    }

    #[test]
    fn test_write_statements_are_passed_through_for_the_guard() {
        let response = "DELETE FROM projects";
        assert_eq!(extract_sql(response).as_deref(), Some("DELETE FROM projects"));
    }

    #[test]
    fn test_no_statement() {
        assert_eq!(extract_sql("I cannot answer that question."), None);
        assert_eq!(extract_sql("```\n```"), None);
        assert_eq!(extract_sql(""), None);
    }

    struct Fixed(&'static str);

    #[async_trait]
    impl CompletionService for Fixed {
        async fn complete(&self, _request: &CompletionRequest) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    #[tokio::test]
    async fn test_generate_cleans_response() {
        let generator = QueryGenerator::new(Arc::new(Fixed("```sql\nSELECT 1\n```")), 64);
        let payload = PromptPayload {
            system: "s".to_string(),
            user: "u".to_string(),
        };
        assert_eq!(generator.generate(&payload).await.unwrap(), "SELECT 1");
    }

    #[tokio::test]
    async fn test_generate_without_statement_is_generation_error() {
        let generator = QueryGenerator::new(Arc::new(Fixed("Sorry, no idea.")), 64);
        let payload = PromptPayload {
            system: "s".to_string(),
            user: "u".to_string(),
        };
        let err = generator.generate(&payload).await.unwrap_err();
        assert!(matches!(err, PipelineError::Generation(_)));
    }
}
