use mission_query::config::AppConfig;
use mission_query::llm::LlmClient;
use mission_query::schema::descriptor;
use mission_query::store::SqliteStore;
use mission_query::{AnswerStatus, Pipeline, QueryAnswer};

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mission-query")]
#[command(about = "Ask questions about EU Adaptation Mission projects in plain language")]
#[command(version)]
struct Args {
    /// Path to the mission SQLite database (or set MISSION_DB_PATH)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// OpenRouter API key (or set OPENROUTER_API_KEY)
    #[arg(long, global = true)]
    api_key: Option<String>,

    /// Model name (or set LLM_MODEL)
    #[arg(long, global = true)]
    model: Option<String>,

    /// OpenAI-compatible base URL (or set LLM_BASE_URL)
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Re-prompts allowed after a rejected draft (or set MISSION_MAX_RETRIES)
    #[arg(long, global = true)]
    max_retries: Option<u32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a question
    Ask {
        /// The question in natural language
        question: String,

        /// Print the full answer as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the schema description given to the model
    Schema,
    /// Compare the database with the schema description
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = apply_overrides(AppConfig::from_env()?, &args);

    match args.command {
        Commands::Ask { ref question, json } => ask(config, question, json).await,
        Commands::Schema => {
            println!("{}", descriptor().render());
            Ok(())
        }
        Commands::Check => check(config),
    }
}

fn apply_overrides(mut config: AppConfig, args: &Args) -> AppConfig {
    if let Some(ref db) = args.db {
        config.db_path = db.clone();
    }
    if let Some(ref key) = args.api_key {
        config.llm.api_key = Some(key.clone());
    }
    if let Some(ref model) = args.model {
        config.llm.model = model.clone();
    }
    if let Some(ref base_url) = args.base_url {
        config.llm.base_url = base_url.clone();
    }
    if let Some(max_retries) = args.max_retries {
        config.max_retries = max_retries;
    }
    config
}

async fn ask(config: AppConfig, question: &str, json: bool) -> Result<()> {
    let api_key = config.require_api_key()?.to_string();
    let llm = LlmClient::new(&config.llm, api_key)?;

    info!("Using model {} against {}", config.llm.model, config.db_path.display());
    let pipeline = Pipeline::connect(config, Arc::new(llm))?;
    let answer = pipeline.ask(question).await;

    if json {
        println!("{}", answer.to_json()?);
    } else {
        print_answer(&answer);
    }
    Ok(())
}

fn check(config: AppConfig) -> Result<()> {
    let store = SqliteStore::new(&config.db_path, config.db_timeout);
    let live = store.introspect()?;
    descriptor().verify_against(&live)?;
    println!(
        "{} matches schema version {} ({} tables)",
        store.path().display(),
        descriptor().version,
        live.table_names().count()
    );
    Ok(())
}

fn print_answer(answer: &QueryAnswer) {
    println!("\n{}", "=".repeat(80));
    println!(" {}", answer.question);
    println!("{}", "=".repeat(80));

    if let Some(ref sql) = answer.sql {
        println!("\nSQL:\n{}\n", sql);
    }

    match answer.status {
        AnswerStatus::Success => {
            println!("{}\n", answer.narrative);
            println!("{}", answer.columns.join(" | "));
            println!("{}", "-".repeat(80));
            for row in &answer.rows {
                let cells: Vec<String> = answer
                    .columns
                    .iter()
                    .map(|c| display_cell(row.get(c)))
                    .collect();
                println!("{}", cells.join(" | "));
            }
            println!("\n{} rows", answer.rows.len());
        }
        AnswerStatus::Empty | AnswerStatus::Failed => {
            println!("{}", answer.narrative);
            if !answer.suggestions.is_empty() {
                println!("\nSuggestions:");
                for suggestion in &answer.suggestions {
                    println!("  - {}", suggestion);
                }
            }
        }
    }

    if let Some(ref caveat) = answer.caveat {
        println!("\nNote: {}", caveat);
    }
}

fn display_cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => "".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}
