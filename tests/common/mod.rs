#![allow(dead_code)]

use async_trait::async_trait;
use mission_query::config::AppConfig;
use mission_query::error::{PipelineError, Result};
use mission_query::llm::{CompletionRequest, CompletionService};
use rusqlite::Connection;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

pub const PARTICIPANTS_DDL: &str = "CREATE TABLE participants (
    participant_id INTEGER,
    participations INTEGER,
    legal_name TEXT,
    participant_code TEXT,
    participant_type TEXT,
    net_eu_contribution_euro REAL,
    funding_programme TEXT,
    country_territory TEXT,
    city TEXT,
    nuts_1_name TEXT,
    nuts_2_name TEXT,
    nuts_3_name TEXT
)";

pub const PROJECTS_DDL: &str = "CREATE TABLE projects (
    project_id INTEGER,
    acronym TEXT,
    title TEXT,
    project_url TEXT,
    project_start_date DATE,
    project_end_date DATE,
    total_budget_euro REAL,
    eu_contribution_euro REAL,
    hrp_result_url TEXT,
    funding_programme TEXT,
    topic_code TEXT,
    type_of_action TEXT,
    mission_relevance_flag TEXT,
    category TEXT,
    climate_risks TEXT,
    main_themes TEXT,
    regions TEXT,
    coordinator TEXT,
    coordinator_org TEXT,
    coordinator_country TEXT,
    website TEXT
)";

const ROWS: &str = "
INSERT INTO participants VALUES
 (1, 2, 'UNIVERSITAT DE VALENCIA', 'p/1', 'HES', 2500000.0, 'HORIZON', 'Spain', 'Valencia', 'Este', 'Comunitat Valenciana', 'Valencia'),
 (2, 1, 'AYUNTAMIENTO DE MADRID', 'p/2', 'PUB', 800000.0, 'HORIZON', 'Spain', 'Madrid', 'Comunidad de Madrid', 'Comunidad de Madrid', 'Madrid'),
 (3, 1, 'FUNDACION MEDIO AMBIENTE', 'p/3', 'OTH', 150000.0, 'H2020', 'Spain', 'Sevilla', 'Sur', 'Andalucia', 'Sevilla'),
 (4, 1, 'POLITECNICO DI MILANO', 'p/4', 'HES', 1200000.0, 'HORIZON', 'Italy', 'Milano', 'Nord-Ovest', 'Lombardia', 'Milano'),
 (5, 1, 'CONSIGLIO NAZIONALE DELLE RICERCHE', 'p/5', 'REC', 600000.0, 'HORIZON', 'Italy', 'Roma', 'Centro', 'Lazio', 'Roma'),
 (6, 1, 'NORDIC CLIMATE AS', 'p/6', 'PRC', 300000.0, 'HORIZON', 'Norway', 'Oslo', '-', '-', '-');

INSERT INTO projects VALUES
 (1, 'REGILIENCE', 'Regional resilience pathways', 'https://cordis.europa.eu/project/id/1',
  '2022-11-01', '2025-10-31', 5000000.0, 4800000.0, NULL, 'HORIZON', 'HORIZON-MISS-2021-CLIMA-02-01', 'CSA',
  'mission funded', 'Support to regions', 'Drought; Extreme heat', 'Governance; Water management',
  'Valencia (Spain)', 'Universitat de Valencia, Spain', 'UNIVERSITAT DE VALENCIA', 'Spain', 'https://regilience.eu'),
 (2, 'TransformAr', 'Transformational adaptation', 'https://cordis.europa.eu/project/id/2',
  '2021-01-01', '2025-12-31', 12000000.0, 11000000.0, 'https://hrp/2', 'H2020', 'LC-GD-1-3-2020', 'IA',
  'mission funded', 'Cross cutting', 'Flooding; Sea level rise', 'Infrastructure',
  'Galicia Region (Spain)', 'Politecnico di Milano, Italy', 'POLITECNICO DI MILANO', 'Italy', NULL),
 (3, 'ARCADIA', 'Nature based resilience', 'https://cordis.europa.eu/project/id/3',
  '2022-06-01', '2026-05-31', 8000000.0, 7500000.0, NULL, 'HORIZON', NULL, 'IA',
  'mission funded', 'Support to regions', 'Drought; Flooding; Wildfires', 'Ecosystems and nature-based solutions',
  'Puglia (Italy)', 'Unknown Org, Greece', 'UNKNOWN ORG', 'Greece', 'https://arcadia.eu');
";

/// A mission database in a temporary directory.
pub struct Fixture {
    pub dir: TempDir,
    pub path: PathBuf,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_ddl(PARTICIPANTS_DDL, PROJECTS_DDL)
    }

    pub fn with_ddl(participants: &str, projects: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("adaptation_mission.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(participants).unwrap();
        conn.execute_batch(projects).unwrap();
        if participants == PARTICIPANTS_DDL && projects == PROJECTS_DDL {
            conn.execute_batch(ROWS).unwrap();
        }
        Self { dir, path }
    }

    pub fn config(&self) -> AppConfig {
        config_for(&self.path)
    }

    pub fn count(&self, table: &str) -> i64 {
        let conn = Connection::open(&self.path).unwrap();
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
            .unwrap()
    }
}

pub fn config_for(path: &Path) -> AppConfig {
    AppConfig {
        db_path: path.to_path_buf(),
        ..AppConfig::default()
    }
}

/// Completion service that replays queued answers and records every request.
/// Once the script runs out it fails like an unreachable service.
pub struct ScriptedCompletion {
    responses: Mutex<VecDeque<Result<String>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedCompletion {
    pub fn new(responses: &[&str]) -> Arc<Self> {
        Self::with_results(responses.iter().map(|r| Ok(r.to_string())).collect())
    }

    pub fn with_results(responses: Vec<Result<String>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletion {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        self.requests.lock().unwrap().push(request.clone());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(PipelineError::Generation("Completion service unreachable".to_string())))
    }
}
