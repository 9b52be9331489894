//! Schema Descriptor
//!
//! Static description of the two mission tables (columns, semantic types,
//! multi-valued list columns, NUTS sentinel values, currency units) and the
//! single permitted join path. The descriptor is checked against the live
//! store at startup so the prompt and the guard never drift from the data.

use crate::error::{PipelineError, Result};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

pub const SCHEMA_VERSION: &str = "2025.05";

/// Placeholder stored in NUTS columns for non-EU countries.
pub const NUTS_SENTINEL: &str = "-";

/// Multi-valued columns join their values with `;` plus optional whitespace.
pub const LIST_DELIMITER: char = ';';

pub const PARTICIPANTS: &str = "participants";
pub const PROJECTS: &str = "projects";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SemanticType {
    Integer,
    Real,
    Text,
    Date,
}

impl SemanticType {
    pub fn sql_name(&self) -> &'static str {
        match self {
            SemanticType::Integer => "INTEGER",
            SemanticType::Real => "REAL",
            SemanticType::Text => "TEXT",
            SemanticType::Date => "DATE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Plain,
    /// Amount in euros (base units, not thousands).
    Currency,
    /// Delimiter-joined list, matched by substring.
    MultiValued,
    /// Country or city level location.
    Location,
    /// NUTS region name that may hold a sentinel.
    Region { sentinel: &'static str },
    Url,
    Date,
    /// Closed set of codes with their meaning.
    Category(&'static [(&'static str, &'static str)]),
}

#[derive(Debug, Clone, Copy)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub semantic: SemanticType,
    pub kind: ColumnKind,
    pub note: &'static str,
}

#[derive(Debug, Clone, Copy)]
pub struct TableSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub columns: &'static [ColumnSpec],
}

impl TableSpec {
    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }
}

/// The only sanctioned linkage between the two tables.
#[derive(Debug, Clone, Copy)]
pub struct JoinPath {
    pub from_table: &'static str,
    pub from_column: &'static str,
    pub to_table: &'static str,
    pub to_column: &'static str,
    pub caveat: &'static str,
}

impl JoinPath {
    pub fn predicate(&self) -> String {
        format!(
            "{}.{} = {}.{}",
            self.from_table, self.from_column, self.to_table, self.to_column
        )
    }

    /// True when the two (table, column) pairs are the join endpoints, in either order.
    pub fn matches(&self, a: (&str, &str), b: (&str, &str)) -> bool {
        let from = (self.from_table, self.from_column);
        let to = (self.to_table, self.to_column);
        let eq = |x: (&str, &str), y: (&str, &str)| {
            x.0.eq_ignore_ascii_case(y.0) && x.1.eq_ignore_ascii_case(y.1)
        };
        (eq(a, from) && eq(b, to)) || (eq(a, to) && eq(b, from))
    }
}

#[derive(Debug)]
pub struct SchemaDescriptor {
    pub version: &'static str,
    pub tables: &'static [TableSpec],
    pub join: JoinPath,
    pub notes: &'static [&'static str],
}

const PARTICIPANT_TYPES: &[(&str, &str)] = &[
    ("PUB", "public body"),
    ("PRC", "private company"),
    ("HES", "higher education"),
    ("REC", "research organisation"),
    ("OTH", "other"),
];

const TYPES_OF_ACTION: &[(&str, &str)] = &[
    ("CSA", "coordination and support action"),
    ("IA", "innovation action"),
];

const PARTICIPANT_COLUMNS: &[ColumnSpec] = &[
    ColumnSpec { name: "participant_id", semantic: SemanticType::Integer, kind: ColumnKind::Plain, note: "Unique ID" },
    ColumnSpec { name: "participations", semantic: SemanticType::Integer, kind: ColumnKind::Plain, note: "Number of projects this organisation participates in (at least 1)" },
    ColumnSpec { name: "legal_name", semantic: SemanticType::Text, kind: ColumnKind::Plain, note: "Official organisation name (uppercase)" },
    ColumnSpec { name: "participant_code", semantic: SemanticType::Text, kind: ColumnKind::Url, note: "EU portal URL identifier" },
    ColumnSpec { name: "participant_type", semantic: SemanticType::Text, kind: ColumnKind::Category(PARTICIPANT_TYPES), note: "Organisation type" },
    ColumnSpec { name: "net_eu_contribution_euro", semantic: SemanticType::Real, kind: ColumnKind::Currency, note: "Total EU funding received across all projects" },
    ColumnSpec { name: "funding_programme", semantic: SemanticType::Text, kind: ColumnKind::Plain, note: "'H2020' or 'HORIZON'" },
    ColumnSpec { name: "country_territory", semantic: SemanticType::Text, kind: ColumnKind::Location, note: "Country or territory (e.g. 'Spain', 'Italy', 'Greece')" },
    ColumnSpec { name: "city", semantic: SemanticType::Text, kind: ColumnKind::Location, note: "City name" },
    ColumnSpec { name: "nuts_1_name", semantic: SemanticType::Text, kind: ColumnKind::Region { sentinel: NUTS_SENTINEL }, note: "NUTS level 1 region name" },
    ColumnSpec { name: "nuts_2_name", semantic: SemanticType::Text, kind: ColumnKind::Region { sentinel: NUTS_SENTINEL }, note: "NUTS level 2 region name" },
    ColumnSpec { name: "nuts_3_name", semantic: SemanticType::Text, kind: ColumnKind::Region { sentinel: NUTS_SENTINEL }, note: "NUTS level 3 region name" },
];

const PROJECT_COLUMNS: &[ColumnSpec] = &[
    ColumnSpec { name: "project_id", semantic: SemanticType::Integer, kind: ColumnKind::Plain, note: "Unique ID" },
    ColumnSpec { name: "acronym", semantic: SemanticType::Text, kind: ColumnKind::Plain, note: "Short project name (e.g. 'REGILIENCE', 'TransformAr')" },
    ColumnSpec { name: "title", semantic: SemanticType::Text, kind: ColumnKind::Plain, note: "Full project title" },
    ColumnSpec { name: "project_url", semantic: SemanticType::Text, kind: ColumnKind::Url, note: "CORDIS project page URL" },
    ColumnSpec { name: "project_start_date", semantic: SemanticType::Date, kind: ColumnKind::Date, note: "Start date (YYYY-MM-DD)" },
    ColumnSpec { name: "project_end_date", semantic: SemanticType::Date, kind: ColumnKind::Date, note: "End date (YYYY-MM-DD), never before the start date" },
    ColumnSpec { name: "total_budget_euro", semantic: SemanticType::Real, kind: ColumnKind::Currency, note: "Total project budget" },
    ColumnSpec { name: "eu_contribution_euro", semantic: SemanticType::Real, kind: ColumnKind::Currency, note: "EU contribution, never above the total budget" },
    ColumnSpec { name: "hrp_result_url", semantic: SemanticType::Text, kind: ColumnKind::Url, note: "Horizon Results Platform link (may be NULL)" },
    ColumnSpec { name: "funding_programme", semantic: SemanticType::Text, kind: ColumnKind::Plain, note: "'H2020', 'HORIZON' or 'Horizon Europe'" },
    ColumnSpec { name: "topic_code", semantic: SemanticType::Text, kind: ColumnKind::Plain, note: "Call topic code (e.g. 'LC-GD-1-3-2020', may be NULL)" },
    ColumnSpec { name: "type_of_action", semantic: SemanticType::Text, kind: ColumnKind::Category(TYPES_OF_ACTION), note: "Type of action" },
    ColumnSpec { name: "mission_relevance_flag", semantic: SemanticType::Text, kind: ColumnKind::Plain, note: "Always 'mission funded'" },
    ColumnSpec { name: "category", semantic: SemanticType::Text, kind: ColumnKind::Plain, note: "'Support to regions' or 'Cross cutting'" },
    ColumnSpec { name: "climate_risks", semantic: SemanticType::Text, kind: ColumnKind::MultiValued, note: "Climate risks addressed, e.g. \"Drought; Flooding; Extreme heat; Sea level rise; Wildfires\"" },
    ColumnSpec { name: "main_themes", semantic: SemanticType::Text, kind: ColumnKind::MultiValued, note: "Adaptation themes, e.g. \"Governance; Infrastructure; Water management\"" },
    ColumnSpec { name: "regions", semantic: SemanticType::Text, kind: ColumnKind::MultiValued, note: "Affected regions, e.g. \"Valencia (Spain); Galicia Region (Spain)\"" },
    ColumnSpec { name: "coordinator", semantic: SemanticType::Text, kind: ColumnKind::Plain, note: "Display string \"Organisation, Country\" (do not join on it)" },
    ColumnSpec { name: "coordinator_org", semantic: SemanticType::Text, kind: ColumnKind::Plain, note: "Normalised coordinator organisation name (uppercase, for joining)" },
    ColumnSpec { name: "coordinator_country", semantic: SemanticType::Text, kind: ColumnKind::Location, note: "Coordinator country" },
    ColumnSpec { name: "website", semantic: SemanticType::Text, kind: ColumnKind::Url, note: "Project website (may be NULL)" },
];

const TABLES: &[TableSpec] = &[
    TableSpec {
        name: PARTICIPANTS,
        description: "Organisations participating in EU Adaptation Mission projects. One row per organisation with aggregate figures across all of its projects.",
        columns: PARTICIPANT_COLUMNS,
    },
    TableSpec {
        name: PROJECTS,
        description: "EU-funded adaptation mission projects.",
        columns: PROJECT_COLUMNS,
    },
];

static DESCRIPTOR: SchemaDescriptor = SchemaDescriptor {
    version: SCHEMA_VERSION,
    tables: TABLES,
    join: JoinPath {
        from_table: PROJECTS,
        from_column: "coordinator_org",
        to_table: PARTICIPANTS,
        to_column: "legal_name",
        caveat: "Many projects to one participant. A coordinator may be missing from participants, so the join can match nothing; use LEFT JOIN to keep every project.",
    },
    notes: &[
        "The participants table holds aggregate data per organisation; participations counts its projects.",
        "There is no participant-to-project membership table; the coordinator join is the only link.",
    ],
};

/// The descriptor of the mission dataset.
pub fn descriptor() -> &'static SchemaDescriptor {
    &DESCRIPTOR
}

impl SchemaDescriptor {
    pub fn table(&self, name: &str) -> Option<&TableSpec> {
        self.tables.iter().find(|t| t.name.eq_ignore_ascii_case(name))
    }

    pub fn column(&self, table: &str, column: &str) -> Option<&ColumnSpec> {
        self.table(table).and_then(|t| t.column(column))
    }

    /// Kind of a column looked up by name alone; first table wins.
    pub fn kind_of(&self, column: &str) -> Option<ColumnKind> {
        self.tables
            .iter()
            .find_map(|t| t.column(column))
            .map(|c| c.kind)
    }

    pub fn is_multi_valued(&self, column: &str) -> bool {
        matches!(self.kind_of(column), Some(ColumnKind::MultiValued))
    }

    /// (table, column) pairs of every multi-valued column.
    pub fn multi_valued_columns(&self) -> Vec<(&'static str, &'static str)> {
        self.columns_of_kind(|k| matches!(k, ColumnKind::MultiValued))
    }

    pub fn date_columns(&self) -> Vec<(&'static str, &'static str)> {
        self.columns_of_kind(|k| matches!(k, ColumnKind::Date))
    }

    fn columns_of_kind(&self, pred: impl Fn(ColumnKind) -> bool) -> Vec<(&'static str, &'static str)> {
        let pred = &pred;
        self.tables
            .iter()
            .flat_map(move |t| {
                t.columns
                    .iter()
                    .filter(move |c| pred(c.kind))
                    .map(move |c| (t.name, c.name))
            })
            .collect()
    }

    /// Stable textual form consumed by the prompt builder.
    pub fn render(&self) -> String {
        let mut lines = vec![format!("DATABASE SCHEMA (version {}):", self.version), String::new()];

        for table in self.tables {
            lines.push(format!("TABLE: {}", table.name));
            lines.push(table.description.to_string());
            for column in table.columns {
                lines.push(format!(
                    "- {} ({}): {}",
                    column.name,
                    column.semantic.sql_name(),
                    column.note
                ));
                match column.kind {
                    ColumnKind::Currency => {
                        lines.push("    Unit: euros (base units, not thousands)".to_string());
                    }
                    ColumnKind::MultiValued => lines.push(format!(
                        "    Multi-valued: values joined by \"{} \"; match with LIKE '%term%' COLLATE NOCASE",
                        LIST_DELIMITER
                    )),
                    ColumnKind::Region { sentinel } => lines.push(format!(
                        "    Note: contains \"{}\" for non-EU countries",
                        sentinel
                    )),
                    ColumnKind::Category(values) => {
                        let rendered: Vec<String> = values
                            .iter()
                            .map(|(code, meaning)| format!("'{}' ({})", code, meaning))
                            .collect();
                        lines.push(format!("    Values: {}", rendered.join(", ")));
                    }
                    ColumnKind::Url => lines.push("    URL: do not select unless requested".to_string()),
                    ColumnKind::Plain | ColumnKind::Location | ColumnKind::Date => {}
                }
            }
            lines.push(String::new());
        }

        lines.push("RELATIONSHIP:".to_string());
        lines.push(format!(
            "  JOIN {} ON {}",
            self.join.to_table,
            self.join.predicate()
        ));
        lines.push(format!("  {}", self.join.caveat));
        lines.push(String::new());
        for note in self.notes {
            lines.push(format!("Note: {}", note));
        }

        lines.join("\n")
    }

    /// Fails when a described table or column is missing from the live store.
    pub fn verify_against(&self, live: &LiveSchema) -> Result<()> {
        let mut missing = Vec::new();

        for table in self.tables {
            if !live.has_table(table.name) {
                missing.push(format!("table {}", table.name));
                continue;
            }
            for column in table.columns {
                if !live.has_column(table.name, column.name) {
                    missing.push(format!("column {}.{}", table.name, column.name));
                }
            }
            if let Some(columns) = live.columns(table.name) {
                for extra in columns.iter().filter(|c| table.column(c).is_none()) {
                    warn!("Live column {}.{} is not described", table.name, extra);
                }
            }
        }

        if missing.is_empty() {
            info!("Schema descriptor {} matches live store", self.version);
            Ok(())
        } else {
            Err(PipelineError::SchemaDrift(format!(
                "descriptor {} does not match the store, missing {}",
                self.version,
                missing.join(", ")
            )))
        }
    }
}

/// Table and column names present in the store, lower-cased.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveSchema {
    tables: BTreeMap<String, BTreeSet<String>>,
}

impl LiveSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live schema equal to the descriptor, used when no store is at hand.
    pub fn from_descriptor(descriptor: &SchemaDescriptor) -> Self {
        let mut live = Self::new();
        for table in descriptor.tables {
            live.insert_table(table.name, table.columns.iter().map(|c| c.name.to_string()));
        }
        live
    }

    pub fn insert_table(&mut self, name: &str, columns: impl IntoIterator<Item = String>) {
        self.tables.insert(
            name.to_lowercase(),
            columns.into_iter().map(|c| c.to_lowercase()).collect(),
        );
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.tables.contains_key(&table.to_lowercase())
    }

    pub fn has_column(&self, table: &str, column: &str) -> bool {
        self.columns(table)
            .map(|cols| cols.contains(&column.to_lowercase()))
            .unwrap_or(false)
    }

    pub fn columns(&self, table: &str) -> Option<&BTreeSet<String>> {
        self.tables.get(&table.to_lowercase())
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(|k| k.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_mentions_join_and_sentinel() {
        let text = descriptor().render();
        assert!(text.contains("TABLE: participants"));
        assert!(text.contains("TABLE: projects"));
        assert!(text.contains("projects.coordinator_org = participants.legal_name"));
        assert!(text.contains("contains \"-\" for non-EU countries"));
        assert!(text.contains("'HES' (higher education)"));
        assert_eq!(text, descriptor().render());
    }

    #[test]
    fn test_multi_valued_columns() {
        let cols = descriptor().multi_valued_columns();
        assert_eq!(
            cols,
            vec![(PROJECTS, "climate_risks"), (PROJECTS, "main_themes"), (PROJECTS, "regions")]
        );
        assert!(descriptor().is_multi_valued("CLIMATE_RISKS"));
        assert!(!descriptor().is_multi_valued("coordinator"));
    }

    #[test]
    fn test_join_path_matches_either_order() {
        let join = &descriptor().join;
        assert!(join.matches(("projects", "coordinator_org"), ("participants", "legal_name")));
        assert!(join.matches(("PARTICIPANTS", "LEGAL_NAME"), ("projects", "coordinator_org")));
        assert!(!join.matches(("projects", "coordinator"), ("participants", "legal_name")));
    }

    #[test]
    fn test_verify_detects_missing_column() {
        let mut live = LiveSchema::from_descriptor(descriptor());
        assert!(descriptor().verify_against(&live).is_ok());

        let columns: Vec<String> = PROJECT_COLUMNS
            .iter()
            .filter(|c| c.name != "regions")
            .map(|c| c.name.to_string())
            .collect();
        live.insert_table(PROJECTS, columns);

        match descriptor().verify_against(&live) {
            Err(PipelineError::SchemaDrift(msg)) => assert!(msg.contains("projects.regions")),
            other => panic!("expected drift, got {:?}", other),
        }
    }

    #[test]
    fn test_verify_detects_missing_table() {
        let mut live = LiveSchema::new();
        live.insert_table(PROJECTS, PROJECT_COLUMNS.iter().map(|c| c.name.to_string()));
        assert!(descriptor().verify_against(&live).is_err());
    }
}
