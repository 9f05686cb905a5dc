//! Knowledge graph construction. The teacher's `knowledge_graph` (an
//! in-process `petgraph::DiGraph` used only within one query) is replaced by
//! `builder`, which persists entities and relationships to `Store` so the
//! graph survives process restarts and is shared across queries.

mod builder;

pub use builder::{GraphBuildOutcome, GraphBuilder, GraphBuilderParams};
