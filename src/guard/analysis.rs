//! Statement analysis
//!
//! Walks a parsed statement once and records the facts the guard gates and
//! the result interpreter need: relations, aliases, column references,
//! join predicates and how multi-valued columns are filtered.

use serde::Serialize;
use sqlparser::ast::{
    BinaryOperator, Expr, Function, FunctionArg, FunctionArgExpr, GroupByExpr, Ident,
    JoinConstraint, JoinOperator, ObjectName, Query, Select, SelectItem, SetExpr, TableFactor,
    TableWithJoins, Value, Visitor,
};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::ops::ControlFlow;

const AGGREGATES: &[&str] = &["count", "sum", "avg", "min", "max", "total", "group_concat"];

/// A column as written in the statement, lower-cased.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnRef {
    pub qualifier: Option<String>,
    pub name: String,
}

impl std::fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.qualifier {
            Some(q) => write!(f, "{}.{}", q, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinFact {
    Equality(ColumnRef, ColumnRef),
    Unsupported(String),
}

/// A `LIKE`/`ILIKE` predicate as written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LikeFact {
    pub column: ColumnRef,
    pub pattern: Option<String>,
    /// Pattern starts and ends with `%`, so it matches a substring.
    pub substring: bool,
}

/// Raw facts gathered by the visitor; resolved against the schema by the guard.
#[derive(Debug, Default)]
pub struct StatementFacts {
    pub relations: Vec<String>,
    pub table_aliases: HashMap<String, String>,
    pub derived_aliases: HashSet<String>,
    pub cte_names: HashSet<String>,
    pub select_aliases: HashSet<String>,
    /// Projection, CTE and derived-table aliases mapped to the column they rename.
    pub alias_sources: HashMap<String, ColumnRef>,
    pub column_refs: Vec<ColumnRef>,
    pub joins: Vec<JoinFact>,
    pub equality_columns: Vec<ColumnRef>,
    pub like_filters: Vec<LikeFact>,
    /// Aggregate outside any subquery or CTE, window functions excluded.
    pub has_aggregate_fn: bool,
    pub has_group_by: bool,
    pub select_into: bool,
    depth: usize,
}

impl StatementFacts {
    fn is_top_level(&self) -> bool {
        self.depth == 1
    }

    /// `t(a, b) AS (SELECT x, y ...)` renames `x` to `a` and `y` to `b`.
    fn collect_column_aliases(&mut self, columns: &[Ident], query: &Query) {
        for alias in columns {
            self.select_aliases.insert(alias.value.to_lowercase());
        }
        let select = match query.body.as_ref() {
            SetExpr::Select(select) => select,
            _ => return,
        };
        for (alias, item) in columns.iter().zip(&select.projection) {
            let expr = match item {
                SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => expr,
                _ => continue,
            };
            if let Some(source) = filtered_column(expr) {
                self.alias_sources.insert(alias.value.to_lowercase(), source);
            }
        }
    }

    fn collect_set_expr(&mut self, body: &SetExpr) {
        match body {
            SetExpr::Select(select) => self.collect_select(select),
            SetExpr::SetOperation { left, right, .. } => {
                self.collect_set_expr(left);
                self.collect_set_expr(right);
            }
            // nested queries are reached by the visitor itself
            _ => {}
        }
    }

    fn collect_select(&mut self, select: &Select) {
        if select.into.is_some() {
            self.select_into = true;
        }

        for item in &select.projection {
            if let SelectItem::ExprWithAlias { expr, alias } = item {
                let alias = alias.value.to_lowercase();
                if let Some(source) = filtered_column(expr) {
                    self.alias_sources.insert(alias.clone(), source);
                }
                self.select_aliases.insert(alias);
            }
        }

        if select.from.len() > 1 {
            self.joins.push(JoinFact::Unsupported("comma-separated FROM list".to_string()));
        }
        for table in &select.from {
            self.collect_table_with_joins(table);
        }

        if self.is_top_level() {
            match &select.group_by {
                GroupByExpr::All => self.has_group_by = true,
                GroupByExpr::Expressions(exprs) => {
                    if !exprs.is_empty() {
                        self.has_group_by = true;
                    }
                }
            }
        }
    }

    fn collect_table_with_joins(&mut self, table: &TableWithJoins) {
        self.collect_factor(&table.relation);
        for join in &table.joins {
            self.collect_factor(&join.relation);
            self.joins.push(join_fact(&join.join_operator));
        }
    }

    fn collect_factor(&mut self, factor: &TableFactor) {
        match factor {
            TableFactor::Table { name, alias, .. } => {
                if let Some(alias) = alias {
                    self.table_aliases
                        .insert(alias.name.value.to_lowercase(), object_name(name));
                }
            }
            TableFactor::Derived { subquery, alias, .. } => {
                if let Some(alias) = alias {
                    self.derived_aliases.insert(alias.name.value.to_lowercase());
                    self.collect_column_aliases(&alias.columns, subquery);
                }
            }
            TableFactor::NestedJoin { table_with_joins, alias, .. } => {
                self.collect_table_with_joins(table_with_joins);
                if let Some(alias) = alias {
                    self.derived_aliases.insert(alias.name.value.to_lowercase());
                }
            }
            _ => {}
        }
    }
}

impl Visitor for StatementFacts {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        self.depth += 1;
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.cte_names.insert(cte.alias.name.value.to_lowercase());
                self.collect_column_aliases(&cte.alias.columns, &cte.query);
            }
        }
        self.collect_set_expr(&query.body);
        ControlFlow::Continue(())
    }

    fn post_visit_query(&mut self, _query: &Query) -> ControlFlow<Self::Break> {
        self.depth = self.depth.saturating_sub(1);
        ControlFlow::Continue(())
    }

    fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<Self::Break> {
        self.relations.push(object_name(relation));
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        match expr {
            Expr::Identifier(_) | Expr::CompoundIdentifier(_) => {
                if let Some(column) = column_ref(expr) {
                    self.column_refs.push(column);
                }
            }
            Expr::Function(func) => {
                if self.is_top_level() && func.over.is_none() && is_aggregate(func) {
                    self.has_aggregate_fn = true;
                }
            }
            Expr::BinaryOp { left, op, right } => {
                if matches!(op, BinaryOperator::Eq | BinaryOperator::NotEq) {
                    for side in [left, right] {
                        if let Some(column) = filtered_column(side) {
                            self.equality_columns.push(column);
                        }
                    }
                }
            }
            Expr::InList { expr, .. } => {
                if let Some(column) = filtered_column(expr) {
                    self.equality_columns.push(column);
                }
            }
            Expr::Like { expr, pattern, .. } | Expr::ILike { expr, pattern, .. } => {
                if let Some(column) = filtered_column(expr) {
                    self.like_filters.push(LikeFact {
                        column,
                        pattern: string_literal(pattern),
                        substring: is_substring_pattern(pattern),
                    });
                }
            }
            _ => {}
        }
        ControlFlow::Continue(())
    }
}

fn join_fact(operator: &JoinOperator) -> JoinFact {
    match operator {
        JoinOperator::Inner(constraint) | JoinOperator::LeftOuter(constraint) => match constraint {
            JoinConstraint::On(expr) => match equality_pair(expr) {
                Some((left, right)) => JoinFact::Equality(left, right),
                None => JoinFact::Unsupported(format!("ON {}", expr)),
            },
            JoinConstraint::Using(_) => JoinFact::Unsupported("JOIN ... USING".to_string()),
            _ => JoinFact::Unsupported("join without ON predicate".to_string()),
        },
        _ => JoinFact::Unsupported("join type other than INNER or LEFT".to_string()),
    }
}

fn equality_pair(expr: &Expr) -> Option<(ColumnRef, ColumnRef)> {
    match expr {
        Expr::Nested(inner) => equality_pair(inner),
        Expr::BinaryOp { left, op: BinaryOperator::Eq, right } => {
            Some((column_ref(left)?, column_ref(right)?))
        }
        _ => None,
    }
}

fn object_name(name: &ObjectName) -> String {
    name.0
        .last()
        .map(|ident| ident.value.to_lowercase())
        .unwrap_or_default()
}

pub fn column_ref(expr: &Expr) -> Option<ColumnRef> {
    match expr {
        Expr::Identifier(ident) => Some(ColumnRef {
            qualifier: None,
            name: ident.value.to_lowercase(),
        }),
        Expr::CompoundIdentifier(parts) if parts.len() >= 2 => Some(ColumnRef {
            qualifier: Some(parts[parts.len() - 2].value.to_lowercase()),
            name: parts[parts.len() - 1].value.to_lowercase(),
        }),
        Expr::Nested(inner) => column_ref(inner),
        Expr::Collate { expr, .. } => column_ref(expr),
        _ => None,
    }
}

/// Column under a filter, looking through single-argument wrappers like
/// `lower(x)`. Aggregates produce a new value and are not looked through.
fn filtered_column(expr: &Expr) -> Option<ColumnRef> {
    if let Some(column) = column_ref(expr) {
        return Some(column);
    }
    match expr {
        Expr::Function(func) if func.args.len() == 1 && !is_aggregate(func) => match &func.args[0] {
            FunctionArg::Unnamed(FunctionArgExpr::Expr(inner)) => filtered_column(inner),
            _ => None,
        },
        _ => None,
    }
}

fn string_literal(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Value(Value::SingleQuotedString(s)) => Some(s.clone()),
        Expr::Nested(inner) => string_literal(inner),
        Expr::Collate { expr, .. } => string_literal(expr),
        _ => None,
    }
}

/// `'%term%'`, or a concatenation like `'%' || x || '%'`.
fn is_substring_pattern(pattern: &Expr) -> bool {
    let leading = edge_literal(pattern, true);
    let trailing = edge_literal(pattern, false);
    matches!(
        (leading, trailing),
        (Some(first), Some(last)) if first.starts_with('%') && last.ends_with('%')
    )
}

fn edge_literal(expr: &Expr, leading: bool) -> Option<String> {
    match expr {
        Expr::BinaryOp { left, op: BinaryOperator::StringConcat, right } => {
            if leading {
                edge_literal(left, leading)
            } else {
                edge_literal(right, leading)
            }
        }
        Expr::Nested(inner) => edge_literal(inner, leading),
        Expr::Collate { expr, .. } => edge_literal(expr, leading),
        _ => string_literal(expr),
    }
}

fn is_aggregate(func: &Function) -> bool {
    let name = object_name(&func.name);
    if !AGGREGATES.contains(&name.as_str()) {
        return false;
    }
    // two-argument min/max are scalar in SQLite
    !(matches!(name.as_str(), "min" | "max") && func.args.len() > 1)
}

/// A `LIKE` filter on a multi-valued column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MultiValueFilter {
    pub column: String,
    pub pattern: Option<String>,
}

impl MultiValueFilter {
    /// Search term with wildcards stripped, e.g. `%drought%` -> `drought`.
    pub fn term(&self) -> Option<String> {
        self.pattern
            .as_ref()
            .map(|p| p.trim_matches(|c| c == '%' || c == '_').trim().to_string())
            .filter(|t| !t.is_empty())
    }
}

/// What an accepted statement touches, resolved against the live schema.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatementAnalysis {
    pub tables: BTreeSet<String>,
    /// Resolved `table.column` references.
    pub columns: BTreeSet<String>,
    pub multi_value_filters: Vec<MultiValueFilter>,
    pub has_aggregation: bool,
    pub has_join: bool,
    pub has_limit: bool,
}

impl StatementAnalysis {
    pub fn references_table(&self, table: &str) -> bool {
        self.tables.contains(&table.to_lowercase())
    }

    /// Referenced column names without their table prefix.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns
            .iter()
            .map(|c| c.split_once('.').map(|(_, col)| col).unwrap_or(c.as_str()))
    }

    /// Aggregates over a statement touching a multi-valued column count a
    /// project once per matching term, so totals across terms can overlap.
    pub fn is_approximate(&self, multi_valued: &[(&str, &str)]) -> bool {
        self.has_aggregation
            && multi_valued
                .iter()
                .any(|(table, column)| self.columns.contains(&format!("{}.{}", table, column)))
    }
}
