//! SQL Guard
//!
//! Treats model output as untrusted text. A candidate statement must pass,
//! in order: single statement, read-only verb, syntax, schema conformance,
//! join path and multi-value matching. Unbounded listings get a row limit
//! appended instead of being rejected.

pub mod analysis;
pub mod lexer;

use crate::schema::{ColumnKind, LiveSchema, SchemaDescriptor};
use analysis::{ColumnRef, JoinFact, MultiValueFilter, StatementAnalysis, StatementFacts};
use serde::Serialize;
use sqlparser::ast::{Statement, Visit};
use sqlparser::dialect::SQLiteDialect;
use sqlparser::parser::Parser;
use std::fmt;
use tracing::{debug, warn};

/// Keywords that must never appear outside literals in an accepted statement.
const FORBIDDEN_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "UPSERT", "MERGE", "DROP", "ALTER", "CREATE",
    "TRUNCATE", "RENAME", "ATTACH", "DETACH", "PRAGMA", "VACUUM", "REINDEX", "ANALYZE", "GRANT",
    "REVOKE", "BEGIN", "COMMIT", "ROLLBACK", "SAVEPOINT", "RELEASE", "LOAD_EXTENSION",
];

const READ_VERBS: &[&str] = &["SELECT", "WITH"];

/// Pseudo columns SQLite exposes on every table.
const IMPLICIT_COLUMNS: &[&str] = &["rowid", "oid", "_rowid_"];

/// How many alias renames are followed back to a stored column.
const ALIAS_HOPS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum GuardRule {
    SingleStatement,
    ReadOnly,
    Syntax,
    SchemaConformance,
    JoinPath,
    MultiValueMatch,
}

impl GuardRule {
    pub fn id(&self) -> &'static str {
        match self {
            GuardRule::SingleStatement => "single-statement",
            GuardRule::ReadOnly => "read-only",
            GuardRule::Syntax => "syntax",
            GuardRule::SchemaConformance => "schema-conformance",
            GuardRule::JoinPath => "join-path",
            GuardRule::MultiValueMatch => "multi-value-match",
        }
    }
}

impl fmt::Display for GuardRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Why a candidate was refused, detailed enough to build a corrective prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    pub rule: GuardRule,
    pub token: Option<String>,
    pub message: String,
}

impl Rejection {
    fn new(rule: GuardRule, token: Option<String>, message: impl Into<String>) -> Self {
        Self {
            rule,
            token,
            message: message.into(),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.token {
            Some(token) => write!(f, "[{}] {} (offending token: {})", self.rule, self.message, token),
            None => write!(f, "[{}] {}", self.rule, self.message),
        }
    }
}

/// A statement cleared for execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AcceptedQuery {
    pub sql: String,
    pub limit_appended: bool,
    pub analysis: StatementAnalysis,
}

pub struct SqlGuard {
    descriptor: &'static SchemaDescriptor,
    live: LiveSchema,
    max_rows: u64,
}

type Resolved = Option<(String, String)>;

impl SqlGuard {
    pub fn new(descriptor: &'static SchemaDescriptor, live: LiveSchema, max_rows: u64) -> Self {
        Self {
            descriptor,
            live,
            max_rows,
        }
    }

    pub fn check(&self, candidate: &str) -> Result<AcceptedQuery, Rejection> {
        let statement_text = self.lexical_gates(candidate)?;

        let mut statements = Parser::parse_sql(&SQLiteDialect {}, &statement_text)
            .map_err(|e| Rejection::new(GuardRule::Syntax, None, format!("statement does not parse: {}", e)))?;
        if statements.len() != 1 {
            return Err(Rejection::new(
                GuardRule::SingleStatement,
                None,
                format!("expected one statement, parsed {}", statements.len()),
            ));
        }
        let statement = statements.remove(0);
        let query = match &statement {
            Statement::Query(query) => query,
            other => {
                return Err(Rejection::new(
                    GuardRule::ReadOnly,
                    Some(statement_kind(other)),
                    "only SELECT queries are permitted",
                ))
            }
        };

        let mut facts = StatementFacts::default();
        let _ = statement.visit(&mut facts);
        if facts.select_into {
            return Err(Rejection::new(
                GuardRule::ReadOnly,
                Some("INTO".to_string()),
                "SELECT ... INTO writes a table",
            ));
        }

        let mut analysis = self.schema_gate(&facts)?;
        self.join_gate(&facts, &mut analysis)?;
        self.multi_value_gate(&facts, &mut analysis)?;

        // only aggregates of the outer query bound its row count
        analysis.has_aggregation = facts.has_aggregate_fn || facts.has_group_by;
        analysis.has_limit = query.limit.is_some();

        let limit_appended = !analysis.has_aggregation && !analysis.has_limit;
        let sql = if limit_appended {
            debug!("Appending LIMIT {} to unbounded statement", self.max_rows);
            format!("{}\nLIMIT {}", statement_text, self.max_rows)
        } else {
            statement_text
        };

        Ok(AcceptedQuery {
            sql,
            limit_appended,
            analysis,
        })
    }

    /// Gates 1 and 2 on raw tokens; returns the statement without its
    /// terminator or surrounding comments.
    fn lexical_gates(&self, candidate: &str) -> Result<String, Rejection> {
        let tokens = lexer::tokenize(candidate)
            .map_err(|e| Rejection::new(GuardRule::Syntax, None, e.to_string()))?;

        let statements = lexer::split_statements(&tokens);
        let statement = match statements.as_slice() {
            [] => return Err(Rejection::new(GuardRule::SingleStatement, None, "no statement found")),
            [single] => *single,
            [_, second, ..] => {
                let token = lexer::leading_keyword(second);
                warn!("Rejected stacked statements, second starts with {:?}", token);
                return Err(Rejection::new(
                    GuardRule::SingleStatement,
                    token,
                    format!("found {} statements, exactly one is allowed", statements.len()),
                ));
            }
        };

        let verb = lexer::leading_keyword(statement);
        if !verb.as_deref().map(|v| READ_VERBS.contains(&v)).unwrap_or(false) {
            return Err(Rejection::new(
                GuardRule::ReadOnly,
                verb,
                "statement must start with SELECT or WITH",
            ));
        }

        if let Some(word) = statement
            .iter()
            .filter_map(|t| t.keyword())
            .find(|w| FORBIDDEN_KEYWORDS.contains(&w.as_str()))
        {
            warn!("Rejected statement containing {}", word);
            return Err(Rejection::new(
                GuardRule::ReadOnly,
                Some(word),
                "data or schema modification keywords are not permitted",
            ));
        }

        let (first, last) = match (statement.first(), statement.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return Err(Rejection::new(GuardRule::SingleStatement, None, "no statement found")),
        };
        Ok(candidate[first.start..last.end].to_string())
    }

    fn schema_gate(&self, facts: &StatementFacts) -> Result<StatementAnalysis, Rejection> {
        let mut analysis = StatementAnalysis::default();

        for relation in &facts.relations {
            if self.live.has_table(relation) {
                analysis.tables.insert(relation.clone());
            } else if !facts.cte_names.contains(relation) {
                return Err(Rejection::new(
                    GuardRule::SchemaConformance,
                    Some(relation.clone()),
                    format!("unknown table {}", relation),
                ));
            }
        }

        for column in &facts.column_refs {
            if let Some((table, name)) = self.resolve(column, facts, &analysis)? {
                analysis.columns.insert(format!("{}.{}", table, name));
            }
        }

        Ok(analysis)
    }

    /// Maps a column reference to a live (table, column), `None` for aliases.
    fn resolve(
        &self,
        column: &ColumnRef,
        facts: &StatementFacts,
        analysis: &StatementAnalysis,
    ) -> Result<Resolved, Rejection> {
        let unknown = |message: String| {
            Err(Rejection::new(
                GuardRule::SchemaConformance,
                Some(column.to_string()),
                message,
            ))
        };

        if IMPLICIT_COLUMNS.contains(&column.name.as_str()) {
            return Ok(None);
        }

        match &column.qualifier {
            Some(qualifier) => {
                let table = facts
                    .table_aliases
                    .get(qualifier)
                    .cloned()
                    .or_else(|| analysis.tables.get(qualifier).cloned());

                match table {
                    Some(table) if self.live.has_table(&table) => {
                        if self.live.has_column(&table, &column.name) {
                            Ok(Some((table, column.name.clone())))
                        } else {
                            unknown(format!("table {} has no column {}", table, column.name))
                        }
                    }
                    _ if facts.derived_aliases.contains(qualifier)
                        || facts.cte_names.contains(qualifier)
                        || facts.table_aliases.contains_key(qualifier) =>
                    {
                        if self.is_known_name(&column.name, facts) {
                            Ok(None)
                        } else {
                            unknown(format!("unknown column {}", column))
                        }
                    }
                    _ => unknown(format!("unknown table or alias {}", qualifier)),
                }
            }
            None => {
                if let Some(table) = analysis
                    .tables
                    .iter()
                    .find(|t| self.live.has_column(t, &column.name))
                {
                    return Ok(Some((table.clone(), column.name.clone())));
                }
                let has_derived = !facts.derived_aliases.is_empty() || !facts.cte_names.is_empty();
                if facts.select_aliases.contains(&column.name)
                    || (has_derived && self.is_known_name(&column.name, facts))
                {
                    Ok(None)
                } else {
                    unknown(format!(
                        "unknown column {} in {}",
                        column.name,
                        analysis.tables.iter().cloned().collect::<Vec<_>>().join(", ")
                    ))
                }
            }
        }
    }

    fn is_known_name(&self, name: &str, facts: &StatementFacts) -> bool {
        facts.select_aliases.contains(name)
            || self
                .live
                .table_names()
                .any(|t| self.live.has_column(t, name))
    }

    fn join_gate(&self, facts: &StatementFacts, analysis: &mut StatementAnalysis) -> Result<(), Rejection> {
        let join = &self.descriptor.join;

        for fact in &facts.joins {
            match fact {
                JoinFact::Equality(left, right) => {
                    let resolved_left = self.resolve(left, facts, analysis)?;
                    let resolved_right = self.resolve(right, facts, analysis)?;
                    let sanctioned = match (&resolved_left, &resolved_right) {
                        (Some(l), Some(r)) => {
                            join.matches((l.0.as_str(), l.1.as_str()), (r.0.as_str(), r.1.as_str()))
                        }
                        _ => false,
                    };
                    if !sanctioned {
                        return Err(Rejection::new(
                            GuardRule::JoinPath,
                            Some(format!("{} = {}", left, right)),
                            format!("the only permitted join is ON {}", join.predicate()),
                        ));
                    }
                }
                JoinFact::Unsupported(description) => {
                    return Err(Rejection::new(
                        GuardRule::JoinPath,
                        Some(description.clone()),
                        format!("the only permitted join is ON {}", join.predicate()),
                    ));
                }
            }
        }

        analysis.has_join = !facts.joins.is_empty();
        Ok(())
    }

    /// Like `resolve`, but follows aliases back to the column they rename.
    fn resolve_source(
        &self,
        column: &ColumnRef,
        facts: &StatementFacts,
        analysis: &StatementAnalysis,
    ) -> Result<Resolved, Rejection> {
        let mut current = column.clone();
        for _ in 0..ALIAS_HOPS {
            if let Some(found) = self.resolve(&current, facts, analysis)? {
                return Ok(Some(found));
            }
            match facts.alias_sources.get(&current.name) {
                Some(source) if *source != current => current = source.clone(),
                _ => return Ok(None),
            }
        }
        Ok(None)
    }

    fn multi_value_gate(&self, facts: &StatementFacts, analysis: &mut StatementAnalysis) -> Result<(), Rejection> {
        for column in &facts.equality_columns {
            if let Some((table, name)) = self.resolve_source(column, facts, analysis)? {
                if self.is_multi_valued(&table, &name) {
                    return Err(Rejection::new(
                        GuardRule::MultiValueMatch,
                        Some(name.clone()),
                        format!(
                            "{} holds a ';'-separated list; use LIKE '%term%' COLLATE NOCASE instead of equality",
                            name
                        ),
                    ));
                }
            }
        }

        for like in &facts.like_filters {
            if let Some((table, name)) = self.resolve_source(&like.column, facts, analysis)? {
                if !self.is_multi_valued(&table, &name) {
                    continue;
                }
                if !like.substring {
                    return Err(Rejection::new(
                        GuardRule::MultiValueMatch,
                        Some(like.pattern.clone().unwrap_or_else(|| name.clone())),
                        format!(
                            "{} holds a ';'-separated list; the LIKE pattern must be '%term%' so it matches one entry",
                            name
                        ),
                    ));
                }
                analysis.multi_value_filters.push(MultiValueFilter {
                    column: name,
                    pattern: like.pattern.clone(),
                });
            }
        }

        Ok(())
    }

    fn is_multi_valued(&self, table: &str, column: &str) -> bool {
        matches!(
            self.descriptor.column(table, column).map(|c| c.kind),
            Some(ColumnKind::MultiValued)
        )
    }
}

fn statement_kind(statement: &Statement) -> String {
    statement
        .to_string()
        .split_whitespace()
        .next()
        .unwrap_or("UNKNOWN")
        .to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{descriptor, LiveSchema};

    fn guard() -> SqlGuard {
        SqlGuard::new(descriptor(), LiveSchema::from_descriptor(descriptor()), 200)
    }

    fn rejected(sql: &str) -> Rejection {
        match guard().check(sql) {
            Err(rejection) => rejection,
            Ok(accepted) => panic!("expected rejection for {:?}, accepted {:?}", sql, accepted.sql),
        }
    }

    fn accepted(sql: &str) -> AcceptedQuery {
        match guard().check(sql) {
            Ok(accepted) => accepted,
            Err(rejection) => panic!("expected acceptance for {:?}, got {}", sql, rejection),
        }
    }

    /// `is_single_select(accepted) && !contains_write_verb(accepted)`
    fn is_safe_select(sql: &str) -> bool {
        let tokens = lexer::tokenize(sql).unwrap();
        let statements = lexer::split_statements(&tokens);
        statements.len() == 1
            && lexer::leading_keyword(statements[0]).as_deref() == Some("SELECT")
            && !tokens
                .iter()
                .filter_map(|t| t.keyword())
                .any(|w| FORBIDDEN_KEYWORDS.contains(&w.as_str()))
    }

    #[test]
    fn test_stacked_statements_rejected() {
        let r = rejected("SELECT acronym FROM projects; DROP TABLE projects");
        assert_eq!(r.rule, GuardRule::SingleStatement);
        assert_eq!(r.token.as_deref(), Some("DROP"));
    }

    #[test]
    fn test_trailing_semicolon_and_comment_allowed() {
        let a = accepted("SELECT COUNT(*) FROM projects; -- done");
        assert_eq!(a.sql, "SELECT COUNT(*) FROM projects");
        assert!(!a.limit_appended);
    }

    #[test]
    fn test_write_verbs_rejected() {
        for sql in [
            "DELETE FROM projects",
            "UPDATE participants SET city = 'x'",
            "INSERT INTO projects (acronym) VALUES ('x')",
            "DROP TABLE participants",
            "PRAGMA table_info(projects)",
            "ATTACH DATABASE 'x.db' AS other",
            "WITH doomed AS (SELECT 1) DELETE FROM projects",
            "CREATE TABLE t AS SELECT * FROM projects",
        ] {
            assert_eq!(rejected(sql).rule, GuardRule::ReadOnly, "{}", sql);
        }
    }

    #[test]
    fn test_keywords_inside_literals_are_fine() {
        let a = accepted("SELECT acronym FROM projects WHERE title LIKE '%delete; drop%' LIMIT 5");
        assert!(is_safe_select(&a.sql));
    }

    #[test]
    fn test_unknown_column_rejected() {
        let r = rejected("SELECT budget_millions_total FROM projects");
        assert_eq!(r.rule, GuardRule::SchemaConformance);
        assert_eq!(r.token.as_deref(), Some("budget_millions_total"));
        assert_eq!(r.rule.id(), "schema-conformance");
    }

    #[test]
    fn test_unknown_table_rejected() {
        let r = rejected("SELECT name FROM sqlite_master");
        assert_eq!(r.rule, GuardRule::SchemaConformance);
        assert_eq!(r.token.as_deref(), Some("sqlite_master"));
    }

    #[test]
    fn test_column_from_wrong_table_rejected() {
        let r = rejected("SELECT p.legal_name FROM projects p");
        assert_eq!(r.rule, GuardRule::SchemaConformance);
    }

    #[test]
    fn test_case_insensitive_identifiers() {
        let a = accepted("SELECT ACRONYM FROM Projects WHERE Category = 'Cross cutting'");
        assert!(a.analysis.columns.contains("projects.acronym"));
    }

    #[test]
    fn test_order_by_alias_allowed() {
        let a = accepted(
            "SELECT country_territory, COUNT(*) AS participant_count FROM participants \
             GROUP BY country_territory ORDER BY participant_count DESC LIMIT 10",
        );
        assert!(a.analysis.has_aggregation);
        assert!(!a.limit_appended);
    }

    #[test]
    fn test_sanctioned_join_accepted_either_order() {
        for predicate in ["p.coordinator_org = pt.legal_name", "pt.legal_name = p.coordinator_org"] {
            let sql = format!(
                "SELECT p.acronym, pt.city FROM projects p \
                 LEFT JOIN participants pt ON {} WHERE pt.participant_type = 'HES' LIMIT 20",
                predicate
            );
            let a = accepted(&sql);
            assert!(a.analysis.has_join);
        }
    }

    #[test]
    fn test_other_join_predicate_rejected() {
        let r = rejected(
            "SELECT p.acronym FROM projects p JOIN participants pt ON p.coordinator = pt.legal_name",
        );
        assert_eq!(r.rule, GuardRule::JoinPath);

        let r = rejected("SELECT p.acronym FROM projects p CROSS JOIN participants pt");
        assert_eq!(r.rule, GuardRule::JoinPath);

        let r = rejected("SELECT acronym FROM projects, participants WHERE coordinator_org = legal_name");
        assert_eq!(r.rule, GuardRule::JoinPath);
    }

    #[test]
    fn test_multi_value_equality_rejected() {
        let r = rejected("SELECT acronym FROM projects WHERE climate_risks = 'Drought'");
        assert_eq!(r.rule, GuardRule::MultiValueMatch);
        assert_eq!(r.token.as_deref(), Some("climate_risks"));

        let r = rejected("SELECT acronym FROM projects WHERE main_themes IN ('Governance')");
        assert_eq!(r.rule, GuardRule::MultiValueMatch);
    }

    #[test]
    fn test_multi_value_like_without_wildcards_rejected() {
        let r = rejected("SELECT acronym FROM projects WHERE climate_risks LIKE 'Drought' LIMIT 5");
        assert_eq!(r.rule, GuardRule::MultiValueMatch);
        assert_eq!(r.token.as_deref(), Some("Drought"));

        let r = rejected("SELECT acronym FROM projects WHERE regions NOT LIKE 'Spain%' LIMIT 5");
        assert_eq!(r.rule, GuardRule::MultiValueMatch);

        // single-valued columns may use any pattern
        accepted("SELECT acronym FROM projects WHERE acronym LIKE 'ARC%' LIMIT 5");
    }

    #[test]
    fn test_multi_value_equality_through_alias_rejected() {
        let r = rejected(
            "WITH t AS (SELECT acronym, climate_risks AS cr FROM projects) \
             SELECT acronym FROM t WHERE cr = 'Drought' LIMIT 5",
        );
        assert_eq!(r.rule, GuardRule::MultiValueMatch);
        assert_eq!(r.token.as_deref(), Some("climate_risks"));

        let r = rejected(
            "SELECT d.acronym FROM (SELECT acronym, main_themes AS theme FROM projects) AS d \
             WHERE d.theme IN ('Governance') LIMIT 5",
        );
        assert_eq!(r.rule, GuardRule::MultiValueMatch);

        let r = rejected(
            "WITH t(a, risks) AS (SELECT acronym, climate_risks FROM projects) \
             SELECT a FROM t WHERE risks LIKE 'Drought' LIMIT 5",
        );
        assert_eq!(r.rule, GuardRule::MultiValueMatch);

        let a = accepted(
            "WITH t AS (SELECT acronym, climate_risks AS cr FROM projects) \
             SELECT acronym FROM t WHERE cr LIKE '%drought%' COLLATE NOCASE LIMIT 5",
        );
        assert_eq!(a.analysis.multi_value_filters[0].column, "climate_risks");
    }

    #[test]
    fn test_aggregate_count_alias_is_not_a_list_filter() {
        accepted(
            "SELECT category, COUNT(climate_risks) AS n FROM projects GROUP BY category HAVING n = 2",
        );
    }

    #[test]
    fn test_multi_value_like_recorded() {
        let a = accepted("SELECT acronym FROM projects WHERE climate_risks LIKE '%drought%' COLLATE NOCASE");
        assert_eq!(a.analysis.multi_value_filters.len(), 1);
        assert_eq!(a.analysis.multi_value_filters[0].column, "climate_risks");
        assert_eq!(a.analysis.multi_value_filters[0].term().as_deref(), Some("drought"));
    }

    #[test]
    fn test_limit_appended_for_unbounded_listing() {
        let a = accepted("SELECT acronym FROM projects -- all of them");
        assert!(a.limit_appended);
        assert_eq!(a.sql, "SELECT acronym FROM projects\nLIMIT 200");
        assert!(guard().check(&a.sql).is_ok());
    }

    #[test]
    fn test_limit_appended_when_aggregate_is_nested() {
        let a = accepted(
            "SELECT acronym FROM projects WHERE total_budget_euro > (SELECT AVG(total_budget_euro) FROM projects)",
        );
        assert!(a.limit_appended);
        assert!(!a.analysis.has_aggregation);

        let a = accepted("SELECT acronym, COUNT(*) OVER () AS n FROM projects");
        assert!(a.limit_appended);
        assert!(a.sql.ends_with("\nLIMIT 200"));
    }

    #[test]
    fn test_existing_limit_untouched() {
        let sql = "SELECT acronym FROM projects ORDER BY total_budget_euro DESC LIMIT 5";
        assert_eq!(accepted(sql).sql, sql);
    }

    #[test]
    fn test_unparseable_rejected_as_syntax() {
        assert_eq!(rejected("SELECT acronym FROM projects WHERE").rule, GuardRule::Syntax);
        assert_eq!(rejected("SELECT 'open").rule, GuardRule::Syntax);
    }

    #[test]
    fn test_cte_names_allowed() {
        let a = accepted(
            "WITH big AS (SELECT acronym, total_budget_euro FROM projects WHERE total_budget_euro > 1000000) \
             SELECT big.acronym FROM big LIMIT 10",
        );
        assert!(a.analysis.references_table("projects"));
    }

    #[test]
    fn test_approximate_aggregation_over_multi_value() {
        let a = accepted(
            "SELECT 'Drought' AS risk, AVG(total_budget_euro) AS avg_budget FROM projects \
             WHERE climate_risks LIKE '%Drought%' \
             UNION ALL \
             SELECT 'Flooding', AVG(total_budget_euro) FROM projects WHERE climate_risks LIKE '%Flooding%'",
        );
        assert!(a.analysis.is_approximate(&descriptor().multi_valued_columns()));

        let plain = accepted("SELECT AVG(total_budget_euro) FROM projects");
        assert!(!plain.analysis.is_approximate(&descriptor().multi_valued_columns()));
    }

    #[test]
    fn test_accepted_statements_are_safe_selects() {
        let candidates = [
            "SELECT acronym FROM projects",
            "SELECT COUNT(*) FROM participants WHERE nuts_1_name != '-'",
            "SELECT acronym FROM projects WHERE regions LIKE '%Spain%'; ",
            "SELECT acronym FROM projects; SELECT 1",
            "DELETE FROM projects; SELECT 1",
            "SELECT acronym FROM projects WHERE title = 'x'; UPDATE projects SET title = 'y'",
        ];
        for sql in candidates {
            if let Ok(a) = guard().check(sql) {
                assert!(is_safe_select(&a.sql), "{}", a.sql);
            }
        }
    }
}
