//! Prompts - SQL drafting, corrective re-prompts and result summaries
//!
//! Everything here is a pure function of its inputs so the same question
//! always yields a byte-identical payload.

use crate::guard::Rejection;
use crate::schema::SchemaDescriptor;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Rows of a result shown to the summary prompt.
pub const SUMMARY_SAMPLE_ROWS: usize = 5;

pub const SQL_SYSTEM_PREAMBLE: &str =
    "You convert natural language questions about EU Adaptation Mission projects into SQLite queries.";

/// Ordered drafting rules, rendered as `RULE n - ...`.
pub const RULES: &[(&str, &str)] = &[
    (
        "MULTI-VALUE COLUMNS",
        r#"climate_risks, main_themes and regions hold semicolon-separated lists.
Match them with LIKE and wildcards, case-insensitively:
  WHERE climate_risks LIKE '%Drought%' COLLATE NOCASE
  WHERE main_themes LIKE '%Water management%' COLLATE NOCASE
Never compare them with =, != or IN; an equality test will not match.
To count projects per term, count the projects that mention the term:
  SELECT COUNT(*) FROM projects WHERE climate_risks LIKE '%Flooding%' COLLATE NOCASE"#,
    ),
    (
        "MONETARY VALUES",
        r#"All amounts are in euros, not thousands.
For millions use ROUND(value / 1000000.0, 2) AS value_millions.
Round every numeric output to 2 decimals and use clear aliases."#,
    ),
    (
        "DATES",
        r#"Dates are stored as YYYY-MM-DD text.
Year filter: WHERE strftime('%Y', project_start_date) = '2021'
Range filter: WHERE project_start_date BETWEEN '2021-01-01' AND '2022-12-31'
Active projects: WHERE project_start_date <= date('now') AND project_end_date >= date('now')"#,
    ),
    (
        "GEOGRAPHY",
        r#"NUTS columns contain "-" for non-EU countries; exclude it with WHERE nuts_1_name != '-'.
Countries are plain names such as 'Spain', 'Italy', 'Greece'."#,
    ),
    (
        "READ ONLY",
        "Write exactly one SELECT statement (a WITH clause is allowed). Never modify data or schema.",
    ),
    (
        "JOINING TABLES",
        r#"Join only when the question combines coordinator and project information, and only with
  LEFT JOIN participants pt ON p.coordinator_org = pt.legal_name
Never join on the coordinator display column. Do not join when one table answers the question."#,
    ),
    (
        "URL COLUMNS",
        "project_url, participant_code, hrp_result_url and website are URLs. Do not select them unless asked.",
    ),
    (
        "ROW LIMITS",
        r#"Listings that are not aggregated need a LIMIT; default to LIMIT 20.
Top-N questions need ORDER BY. Include a context column (acronym for projects, legal_name for participants)."#,
    ),
    (
        "NULLS",
        "topic_code, hrp_result_url and website may be NULL; add IS NOT NULL when it matters.",
    ),
    (
        "OUTPUT FORMAT",
        "Return only the SQL query. No explanation, no markdown code fences.",
    ),
];

/// Worked examples: simple filter, aggregation, multi-value LIKE, join,
/// multi-value plus join.
pub const EXAMPLES: &[(&str, &str)] = &[
    (
        "List research organisations (REC) with the most participations",
        r#"SELECT legal_name, country_territory, participations,
       ROUND(net_eu_contribution_euro, 2) AS contribution_euro
FROM participants
WHERE participant_type = 'REC'
ORDER BY participations DESC, net_eu_contribution_euro DESC
LIMIT 20"#,
    ),
    (
        "Which countries have the most participants?",
        r#"SELECT country_territory,
       COUNT(*) AS participant_count,
       ROUND(SUM(net_eu_contribution_euro) / 1000000.0, 2) AS total_funding_millions
FROM participants
WHERE country_territory IS NOT NULL
GROUP BY country_territory
ORDER BY participant_count DESC
LIMIT 10"#,
    ),
    (
        "List all projects addressing drought",
        r#"SELECT acronym, title, coordinator,
       ROUND(total_budget_euro / 1000000.0, 2) AS budget_millions,
       project_start_date
FROM projects
WHERE climate_risks LIKE '%Drought%' COLLATE NOCASE
ORDER BY total_budget_euro DESC
LIMIT 20"#,
    ),
    (
        "Projects coordinated by universities",
        r#"SELECT p.acronym, p.title, p.coordinator,
       ROUND(p.total_budget_euro / 1000000.0, 2) AS budget_millions
FROM projects p
LEFT JOIN participants pt ON p.coordinator_org = pt.legal_name
WHERE pt.participant_type = 'HES'
ORDER BY p.total_budget_euro DESC
LIMIT 20"#,
    ),
    (
        "Show projects in Spain with their coordinator details",
        r#"SELECT p.acronym, p.title, p.coordinator, pt.participant_type, pt.city,
       ROUND(p.total_budget_euro / 1000000.0, 2) AS budget_millions
FROM projects p
LEFT JOIN participants pt ON p.coordinator_org = pt.legal_name
WHERE p.regions LIKE '%Spain%' COLLATE NOCASE
ORDER BY p.total_budget_euro DESC
LIMIT 20"#,
    ),
    (
        "How many projects address water management?",
        r#"SELECT COUNT(*) AS project_count,
       ROUND(SUM(total_budget_euro) / 1000000.0, 2) AS total_budget_millions
FROM projects
WHERE main_themes LIKE '%Water management%' COLLATE NOCASE"#,
    ),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptPayload {
    pub system: String,
    pub user: String,
}

pub struct PromptBuilder {
    system: String,
}

impl PromptBuilder {
    pub fn new(descriptor: &SchemaDescriptor) -> Self {
        Self {
            system: build_system_prompt(descriptor),
        }
    }

    pub fn system(&self) -> &str {
        &self.system
    }

    pub fn build(&self, question: &str) -> PromptPayload {
        PromptPayload {
            system: self.system.clone(),
            user: format!("Question: {}\n\nSQL:", question.trim()),
        }
    }

    /// Same system text; the user turn carries the refused draft and why.
    pub fn build_retry(&self, question: &str, previous_sql: &str, rejection: &Rejection) -> PromptPayload {
        let token = rejection
            .token
            .as_deref()
            .map(|t| format!("\nOffending token: {}", t))
            .unwrap_or_default();

        PromptPayload {
            system: self.system.clone(),
            user: format!(
                r#"Question: {question}

Your previous query was rejected.

Previous SQL:
{previous_sql}

Rejected by rule: {rule}{token}
Reason: {message}

Write a corrected query that follows every rule. Return only the SQL.

SQL:"#,
                question = question.trim(),
                previous_sql = previous_sql.trim(),
                rule = rejection.rule.id(),
                token = token,
                message = rejection.message,
            ),
        }
    }

    /// Summary prompt over the first rows of a non-empty result.
    pub fn build_summary(
        &self,
        question: &str,
        sql: &str,
        sample: &[HashMap<String, Value>],
        columns: &[String],
        total_rows: usize,
        facts: &[String],
    ) -> PromptPayload {
        let sample_rows: Vec<Value> = sample
            .iter()
            .take(SUMMARY_SAMPLE_ROWS)
            .map(|row| {
                // keep column order stable
                let ordered: serde_json::Map<String, Value> = columns
                    .iter()
                    .map(|c| (c.clone(), row.get(c).cloned().unwrap_or(Value::Null)))
                    .collect();
                Value::Object(ordered)
            })
            .collect();

        let facts_text = if facts.is_empty() {
            String::new()
        } else {
            format!("\nFacts:\n- {}\n", facts.join("\n- "))
        };

        PromptPayload {
            system: "You explain query results to EU climate adaptation policy analysts.".to_string(),
            user: format!(
                r#"Given this user question: "{question}"

And this SQL query: {sql}

Sample results (first {n} rows): {sample}
Total rows: {total}
{facts}
Provide a clear, 1-2 sentence description of what this table shows and its key findings.
Be conversational and only state what the data shows."#,
                question = question.trim(),
                sql = sql,
                n = SUMMARY_SAMPLE_ROWS,
                sample = Value::Array(sample_rows),
                total = total_rows,
                facts = facts_text,
            ),
        }
    }
}

fn build_system_prompt(descriptor: &SchemaDescriptor) -> String {
    let mut out = String::new();
    out.push_str(SQL_SYSTEM_PREAMBLE);
    out.push_str("\n\n");
    out.push_str(&descriptor.render());
    out.push_str("\n\n=== RULES ===\n");

    for (i, (title, body)) in RULES.iter().enumerate() {
        out.push_str(&format!("\nRULE {} - {}:\n{}\n", i + 1, title, body));
    }

    out.push_str("\n=== EXAMPLES ===\n");
    for (question, sql) in EXAMPLES {
        out.push_str(&format!("\nQ: \"{}\"\n{}\n", question, sql));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::GuardRule;
    use crate::schema::descriptor;

    #[test]
    fn test_build_is_deterministic() {
        let a = PromptBuilder::new(descriptor()).build("Which countries have the most participants?");
        let b = PromptBuilder::new(descriptor()).build("Which countries have the most participants?");
        assert_eq!(a, b);
    }

    #[test]
    fn test_system_prompt_contents() {
        let builder = PromptBuilder::new(descriptor());
        let system = builder.system();
        assert!(system.contains("TABLE: projects"));
        assert!(system.contains("RULE 1 - MULTI-VALUE COLUMNS"));
        assert!(system.contains(&format!("RULE {} - OUTPUT FORMAT", RULES.len())));
        assert!(system.contains("COLLATE NOCASE"));
        assert!(system.contains("p.coordinator_org = pt.legal_name"));
        assert_eq!(system.matches("\nQ: \"").count(), EXAMPLES.len());
    }

    #[test]
    fn test_examples_pass_the_guard() {
        use crate::guard::SqlGuard;
        use crate::schema::LiveSchema;

        let guard = SqlGuard::new(descriptor(), LiveSchema::from_descriptor(descriptor()), 200);
        for (question, sql) in EXAMPLES {
            let accepted = guard.check(sql).unwrap_or_else(|r| panic!("{}: {}", question, r));
            assert!(!accepted.limit_appended, "{}", question);
        }
    }

    #[test]
    fn test_retry_keeps_system_and_explains_rejection() {
        let builder = PromptBuilder::new(descriptor());
        let rejection = Rejection {
            rule: GuardRule::SchemaConformance,
            token: Some("budget".to_string()),
            message: "unknown column budget in projects".to_string(),
        };
        let first = builder.build("Biggest projects?");
        let retry = builder.build_retry("Biggest projects?", "SELECT budget FROM projects", &rejection);

        assert_eq!(first.system, retry.system);
        assert!(retry.user.contains("SELECT budget FROM projects"));
        assert!(retry.user.contains("Rejected by rule: schema-conformance"));
        assert!(retry.user.contains("Offending token: budget"));
        assert!(retry.user.ends_with("SQL:"));
    }

    #[test]
    fn test_summary_uses_first_rows_only() {
        let builder = PromptBuilder::new(descriptor());
        let columns = vec!["acronym".to_string()];
        let rows: Vec<HashMap<String, Value>> = (0..8)
            .map(|i| HashMap::from([("acronym".to_string(), Value::String(format!("P{}", i)))]))
            .collect();

        let payload = builder.build_summary("q", "SELECT acronym FROM projects", &rows, &columns, 8, &[]);
        assert!(payload.user.contains("P4"));
        assert!(!payload.user.contains("P5"));
        assert!(payload.user.contains("Total rows: 8"));
    }
}
