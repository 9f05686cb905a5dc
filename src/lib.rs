pub mod chunker;
pub mod community;
pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod identifiers;
pub mod llm;
pub mod reasoner;
pub mod retrieval;
pub mod store;
pub mod types;

pub use config::RagConfig;
pub use engine::Engine;
pub use error::{EngineError, EngineResult};
pub use types::Answer;
