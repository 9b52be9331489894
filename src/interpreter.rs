//! Result Interpreter
//!
//! Turns rows into a short narrative, and turns an empty or failed answer
//! into suggestions grounded in values that actually exist in the store.

use crate::guard::analysis::{MultiValueFilter, StatementAnalysis};
use crate::llm::{CompletionRequest, CompletionService};
use crate::prompts::PromptBuilder;
use crate::schema::{descriptor, ColumnKind, LIST_DELIMITER, PARTICIPANTS, PROJECTS};
use crate::store::{QueryRows, SqliteStore};
use itertools::{Itertools, MinMaxResult};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use strsim::jaro_winkler;
use tracing::{debug, warn};

/// Similarity above which a stored value counts as a likely intended term.
const NEARBY_THRESHOLD: f64 = 0.85;
const MAX_NEARBY: usize = 3;
const MAX_FACT_COLUMNS: usize = 6;

lazy_static! {
    static ref YEAR: Regex = Regex::new(r"\b(19|20)\d{2}\b").unwrap();
}

const GEO_WORDS: &[&str] = &["country", "countries", "city", "cities", "region", "nuts", "where", "located"];
const DATE_WORDS: &[&str] = &["start", "started", "starting", "end", "ending", "date", "year", "active", "since"];

/// Fallback narrative when the summary call fails.
pub fn fallback_narrative(row_count: usize) -> String {
    format!("Table showing {} results for your query.", row_count)
}

/// Caveat attached to aggregates over multi-valued columns.
pub fn approximation_caveat(analysis: &StatementAnalysis) -> Option<String> {
    let multi_valued = descriptor().multi_valued_columns();
    if !analysis.is_approximate(&multi_valued) {
        return None;
    }
    let columns = multi_valued
        .iter()
        .filter(|(table, column)| analysis.columns.contains(&format!("{}.{}", table, column)))
        .map(|(_, column)| *column)
        .join(", ");
    Some(format!(
        "Approximate figures: {} hold lists of values, so a project matching several terms is counted once per term and totals across terms overlap.",
        columns
    ))
}

/// Deterministic observations about a result, fed to the summary prompt.
pub fn row_facts(result: &QueryRows) -> Vec<String> {
    let mut facts = vec![format!("{} rows returned", result.len())];

    for column in result.columns.iter().filter(|c| !c.ends_with("_id")) {
        if facts.len() > MAX_FACT_COLUMNS {
            break;
        }
        let values: Vec<f64> = result
            .rows
            .iter()
            .filter_map(|row| row.get(column))
            .filter(|v| !v.is_null())
            .map(|v| v.as_f64())
            .collect::<Option<Vec<f64>>>()
            .unwrap_or_default();

        let currency = is_currency(column);
        let show = |v: f64| {
            if currency {
                format!("{:.2}M euros", v / 1_000_000.0)
            } else if v.fract() == 0.0 {
                format!("{}", v as i64)
            } else {
                format!("{:.2}", v)
            }
        };

        match values.iter().minmax_by(|a, b| a.total_cmp(b)) {
            MinMaxResult::NoElements => {}
            MinMaxResult::OneElement(v) => facts.push(format!("{}: {}", column, show(*v))),
            MinMaxResult::MinMax(min, max) => {
                facts.push(format!("{} ranges from {} to {}", column, show(*min), show(*max)))
            }
        }
    }

    facts
}

fn is_currency(column: &str) -> bool {
    matches!(descriptor().kind_of(column), Some(ColumnKind::Currency))
        || column.ends_with("_euro")
        || column.ends_with("_euros")
}

/// Splits a `;`-joined cell into trimmed values.
pub fn split_multi_value(cell: &str) -> impl Iterator<Item = &str> {
    cell.split(LIST_DELIMITER).map(str::trim).filter(|v| !v.is_empty())
}

/// Individual values across cells, most frequent first.
pub fn value_frequencies(cells: &[String]) -> Vec<(String, usize)> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for cell in cells {
        for value in split_multi_value(cell) {
            *counts.entry(value).or_insert(0) += 1;
        }
    }
    counts
        .into_iter()
        .map(|(value, count)| (value.to_string(), count))
        .sorted_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)))
        .collect()
}

/// Stored values close to a searched term, best first.
pub fn nearby_values<'a>(term: &str, values: &'a [(String, usize)]) -> Vec<&'a str> {
    let needle = term.to_lowercase();
    values
        .iter()
        .map(|(value, _)| {
            let candidate = value.to_lowercase();
            let score = if candidate.contains(&needle) || needle.contains(&candidate) {
                1.0
            } else {
                jaro_winkler(&needle, &candidate)
            };
            (value.as_str(), score)
        })
        .filter(|(_, score)| *score >= NEARBY_THRESHOLD)
        .sorted_by(|a, b| b.1.total_cmp(&a.1))
        .take(MAX_NEARBY)
        .map(|(value, _)| value)
        .collect()
}

pub struct ResultInterpreter {
    llm: Arc<dyn CompletionService>,
    prompts: Arc<PromptBuilder>,
    store: SqliteStore,
    top_n: usize,
    max_tokens: u32,
}

impl ResultInterpreter {
    pub fn new(
        llm: Arc<dyn CompletionService>,
        prompts: Arc<PromptBuilder>,
        store: SqliteStore,
        top_n: usize,
        max_tokens: u32,
    ) -> Self {
        Self {
            llm,
            prompts,
            store,
            top_n,
            max_tokens,
        }
    }

    /// One or two sentences about a non-empty result; never fails.
    pub async fn summarize(&self, question: &str, sql: &str, result: &QueryRows) -> String {
        let facts = row_facts(result);
        let payload = self
            .prompts
            .build_summary(question, sql, &result.rows, &result.columns, result.len(), &facts);
        let request = CompletionRequest {
            system: Some(payload.system),
            user: payload.user,
            max_tokens: self.max_tokens,
        };

        match self.llm.complete(&request).await {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => fallback_narrative(result.len()),
            Err(e) => {
                warn!("Summary unavailable, using fallback: {}", e);
                fallback_narrative(result.len())
            }
        }
    }

    /// Suggestions for an empty or failed answer. Always at least one.
    pub async fn diagnose(&self, question: &str, analysis: Option<&StatementAnalysis>) -> Vec<String> {
        let mut suggestions = Vec::new();
        let question_lower = question.to_lowercase();

        if let Some(analysis) = analysis {
            for filter in &analysis.multi_value_filters {
                suggestions.extend(self.multi_value_hints(filter).await);
            }
        }

        let references = |table: &str| analysis.map(|a| a.references_table(table)).unwrap_or(false);
        let touches_kind = |pred: fn(ColumnKind) -> bool| {
            analysis
                .map(|a| {
                    a.column_names()
                        .any(|c| descriptor().kind_of(c).map(pred).unwrap_or(false))
                })
                .unwrap_or(false)
        };

        let geographic = references(PARTICIPANTS)
            || touches_kind(|k| matches!(k, ColumnKind::Location | ColumnKind::Region { .. }))
            || mentions_any(&question_lower, GEO_WORDS);
        if geographic {
            match self.store.top_countries(self.top_n).await {
                Ok(countries) if !countries.is_empty() => {
                    let listed = countries
                        .iter()
                        .map(|(country, count)| format!("{} ({})", country, count))
                        .join(", ");
                    suggestions.push(format!("Top countries with participants: {}", listed));
                }
                Ok(_) => {}
                Err(e) => warn!("Country diagnostics failed: {}", e),
            }
        }

        let dated = analysis
            .map(|a| {
                descriptor()
                    .date_columns()
                    .iter()
                    .any(|(table, column)| a.columns.contains(&format!("{}.{}", table, column)))
            })
            .unwrap_or(false)
            || YEAR.is_match(&question_lower)
            || mentions_any(&question_lower, DATE_WORDS);
        if dated {
            match self.store.date_bounds().await {
                Ok(Some((first, last))) => suggestions.push(format!(
                    "Projects in the database start from {} and end by {}; dates outside that range match nothing.",
                    first.format("%Y-%m-%d"),
                    last.format("%Y-%m-%d")
                )),
                Ok(None) => {}
                Err(e) => warn!("Date diagnostics failed: {}", e),
            }
        }

        let filtered_multi_value = analysis.map(|a| !a.multi_value_filters.is_empty()).unwrap_or(false);
        if references(PROJECTS) && !filtered_multi_value {
            if let Some(hint) = self.common_values_hint("climate_risks").await {
                suggestions.push(hint);
            }
        }

        if suggestions.is_empty() {
            suggestions.extend(default_suggestions(analysis));
        }

        debug!("Produced {} suggestions", suggestions.len());
        suggestions
    }

    async fn multi_value_hints(&self, filter: &MultiValueFilter) -> Vec<String> {
        let mut hints = Vec::new();
        let cells = match self.store.column_values(PROJECTS, &filter.column).await {
            Ok(cells) => cells,
            Err(e) => {
                warn!("Could not read {} for diagnostics: {}", filter.column, e);
                return hints;
            }
        };
        let frequencies = value_frequencies(&cells);

        if let Some(term) = filter.term() {
            let pattern = filter.pattern.as_deref().unwrap_or(&term);
            let nearby = nearby_values(&term, &frequencies);
            let exact = nearby.iter().any(|v| v.eq_ignore_ascii_case(&term));

            if exact {
                hints.push(format!(
                    "'{}' does appear in {}; another filter removed every row, try dropping one.",
                    term, filter.column
                ));
            } else if nearby.is_empty() {
                hints.push(format!("No rows matched {} LIKE '{}'.", filter.column, pattern));
            } else {
                hints.push(format!(
                    "No rows matched {} LIKE '{}'. Did you mean one of: {}?",
                    filter.column,
                    pattern,
                    nearby.join(", ")
                ));
            }
        }

        if !frequencies.is_empty() {
            hints.push(format!(
                "Most common {} values: {}",
                filter.column,
                frequencies
                    .iter()
                    .take(self.top_n)
                    .map(|(value, count)| format!("{} ({})", value, count))
                    .join(", ")
            ));
        }

        hints
    }

    async fn common_values_hint(&self, column: &str) -> Option<String> {
        let cells = self.store.column_values(PROJECTS, column).await.ok()?;
        let frequencies = value_frequencies(&cells);
        if frequencies.is_empty() {
            return None;
        }
        Some(format!(
            "Values of {} in the data: {}",
            column,
            frequencies.iter().take(self.top_n).map(|(value, _)| value.as_str()).join(", ")
        ))
    }
}

fn mentions_any(text: &str, words: &[&str]) -> bool {
    text.split(|c: char| !c.is_alphanumeric())
        .any(|word| words.contains(&word))
}

fn default_suggestions(analysis: Option<&StatementAnalysis>) -> Vec<String> {
    let mut out = vec!["Try fewer filters or a broader search term.".to_string()];
    let on_participants = analysis.map(|a| a.references_table(PARTICIPANTS)).unwrap_or(false);
    out.push(if on_participants {
        "Participants hold one row per organisation with totals across all of its projects; ask about organisations, countries or funding."
            .to_string()
    } else {
        "Projects can be searched by climate risk, theme, region, funding programme, dates or budget.".to_string()
    });
    out
}
