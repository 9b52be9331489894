//! Pipeline - question in, answer out
//!
//! Drafting -> Guarding -> Executing -> Summarizing -> Done, with a bounded
//! Retry edge from Guarding back to Drafting that feeds the rejection into
//! the next prompt. Generation and execution errors end in Failed.

pub use crate::answer::PipelineState;

use crate::answer::{AnswerStatus, Attempt, QueryAnswer};
use crate::config::AppConfig;
use crate::error::{PipelineError, Result};
use crate::generator::QueryGenerator;
use crate::guard::analysis::StatementAnalysis;
use crate::guard::{AcceptedQuery, Rejection, SqlGuard};
use crate::interpreter::{approximation_caveat, ResultInterpreter};
use crate::llm::CompletionService;
use crate::prompts::PromptBuilder;
use crate::schema::{descriptor, LiveSchema};
use crate::store::{Row, SqliteStore};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const EMPTY_NARRATIVE: &str = "No results found for your query.";

pub struct Pipeline {
    max_retries: u32,
    prompts: Arc<PromptBuilder>,
    generator: QueryGenerator,
    guard: SqlGuard,
    store: SqliteStore,
    interpreter: ResultInterpreter,
}

/// Mutable record of one request while it moves through the states.
struct Run {
    question: String,
    trace: Vec<PipelineState>,
    attempts: Vec<Attempt>,
    sql: Option<String>,
    status: AnswerStatus,
    columns: Vec<String>,
    rows: Vec<Row>,
    narrative: String,
    suggestions: Vec<String>,
    caveat: Option<String>,
}

impl Run {
    fn new(question: &str) -> Self {
        Self {
            question: question.trim().to_string(),
            trace: Vec::new(),
            attempts: Vec::new(),
            sql: None,
            status: AnswerStatus::Failed,
            columns: Vec::new(),
            rows: Vec::new(),
            narrative: String::new(),
            suggestions: Vec::new(),
            caveat: None,
        }
    }

    fn enter(&mut self, state: PipelineState) {
        self.trace.push(state);
    }

    fn fail(&mut self, narrative: String, suggestions: Vec<String>) {
        self.enter(PipelineState::Failed);
        self.status = AnswerStatus::Failed;
        self.narrative = narrative;
        self.suggestions = suggestions;
    }
}

impl Pipeline {
    /// Opens the store, reads its schema and checks it against the descriptor.
    pub fn connect(config: AppConfig, llm: Arc<dyn CompletionService>) -> Result<Self> {
        let store = SqliteStore::new(&config.db_path, config.db_timeout);
        let live = store.introspect()?;
        descriptor().verify_against(&live)?;
        Ok(Self::assemble(config, llm, store, live))
    }

    fn assemble(config: AppConfig, llm: Arc<dyn CompletionService>, store: SqliteStore, live: LiveSchema) -> Self {
        let prompts = Arc::new(PromptBuilder::new(descriptor()));
        let summary_tokens = (config.llm.max_tokens / 2).max(64);

        Self {
            max_retries: config.max_retries,
            generator: QueryGenerator::new(Arc::clone(&llm), config.llm.max_tokens),
            guard: SqlGuard::new(descriptor(), live, config.max_rows),
            interpreter: ResultInterpreter::new(
                llm,
                Arc::clone(&prompts),
                store.clone(),
                config.diagnostics_top_n,
                summary_tokens,
            ),
            prompts,
            store,
        }
    }

    /// Answers one question. Never returns an error; failures are reported
    /// in the answer's status, narrative and suggestions.
    pub async fn ask(&self, question: &str) -> QueryAnswer {
        let request_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        let mut run = Run::new(question);

        let span = info_span!("ask", request_id = %request_id);
        self.drive(&mut run).instrument(span).await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            "Request {} finished as {:?} after {} drafts in {}ms",
            request_id,
            run.status,
            run.trace.iter().filter(|s| **s == PipelineState::Drafting).count(),
            elapsed_ms
        );

        QueryAnswer {
            request_id,
            question: run.question,
            sql: run.sql,
            status: run.status,
            columns: run.columns,
            rows: run.rows,
            narrative: run.narrative,
            suggestions: run.suggestions,
            caveat: run.caveat,
            attempts: run.attempts,
            trace: run.trace,
            elapsed_ms,
        }
    }

    async fn drive(&self, run: &mut Run) {
        if run.question.is_empty() {
            run.fail(
                "Please enter a question.".to_string(),
                vec!["For example: Which countries have the most participants?".to_string()],
            );
            return;
        }
        info!("Question: {}", run.question);

        let accepted = match self.draft(run).await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("No executable statement: {}", e);
                let suggestions = self.interpreter.diagnose(&run.question, None).await;
                run.fail(e.to_string(), suggestions);
                return;
            }
        };

        run.sql = Some(accepted.sql.clone());
        run.caveat = approximation_caveat(&accepted.analysis);
        run.enter(PipelineState::Executing);

        let result = match self.store.execute(&accepted.sql).await {
            Ok(result) => result,
            Err(e) => {
                warn!("Execution failed: {}", e);
                let suggestions = self.diagnose(run, &accepted.analysis).await;
                run.fail(e.to_string(), suggestions);
                return;
            }
        };

        run.enter(PipelineState::Summarizing);
        run.columns = result.columns.clone();
        if result.is_effectively_empty() {
            info!("Query returned no usable rows");
            run.status = AnswerStatus::Empty;
            run.narrative = EMPTY_NARRATIVE.to_string();
            let suggestions = self.diagnose(run, &accepted.analysis).await;
            run.suggestions = suggestions;
        } else {
            let narrative = self
                .interpreter
                .summarize(&run.question, &accepted.sql, &result)
                .await;
            run.narrative = narrative;
            run.status = AnswerStatus::Success;
            run.rows = result.rows;
        }
        run.enter(PipelineState::Done);
    }

    /// Drafting and Guarding with the bounded retry edge.
    async fn draft(&self, run: &mut Run) -> Result<AcceptedQuery> {
        let mut payload = self.prompts.build(&run.question);
        let mut last_rejection: Option<Rejection> = None;

        for attempt in 0..=self.max_retries {
            run.enter(PipelineState::Drafting);
            let candidate = self.generator.generate(&payload).await?;

            run.enter(PipelineState::Guarding);
            match self.guard.check(&candidate) {
                Ok(accepted) => {
                    if accepted.limit_appended {
                        info!("Bounded unaggregated statement with a row limit");
                    }
                    return Ok(accepted);
                }
                Err(rejection) => {
                    warn!(
                        "Draft {} of {} rejected: {}",
                        attempt + 1,
                        self.max_retries + 1,
                        rejection
                    );
                    run.attempts.push(Attempt {
                        sql: candidate.clone(),
                        rule: rejection.rule.id().to_string(),
                        message: rejection.message.clone(),
                    });
                    if attempt < self.max_retries {
                        run.enter(PipelineState::Retry);
                        payload = self.prompts.build_retry(&run.question, &candidate, &rejection);
                    }
                    last_rejection = Some(rejection);
                }
            }
        }

        Err(match last_rejection {
            Some(rejection) => PipelineError::Rejected(rejection),
            None => PipelineError::Generation("No draft was produced".to_string()),
        })
    }

    async fn diagnose(&self, run: &Run, analysis: &StatementAnalysis) -> Vec<String> {
        self.interpreter.diagnose(&run.question, Some(analysis)).await
    }
}
