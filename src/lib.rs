pub mod answer;
pub mod config;
pub mod error;
pub mod generator;
pub mod guard;
pub mod interpreter;
pub mod llm;
pub mod pipeline;
pub mod prompts;
pub mod schema;
pub mod store;

pub use answer::{AnswerStatus, QueryAnswer};
pub use config::AppConfig;
pub use error::{PipelineError, Result};
pub use pipeline::Pipeline;
