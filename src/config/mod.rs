// src/config/mod.rs
pub mod pipeline;
pub mod sources;

pub use pipeline::{
    ClassifierConfig, ClassifierKind, DedupConfig, FetchConfig, HealthConfig, OrchestratorConfig,
    PipelineConfig, StoreConfig,
};
pub use sources::{load_sources_default, load_sources_from, Score, SourceSeed};
