//! Shared types, error model, and configuration for docenrich.
//!
//! This crate is the foundation depended on by all other docenrich crates.
//! It provides:
//! - [`DocEnrichError`]: the unified error type
//! - Domain types ([`DocumentRecord`], [`EnrichmentResult`], [`CacheEntry`])
//! - Configuration ([`AppConfig`], runtime configs, config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, CacheBackend, CacheSection, MalformedPolicy, PipelineOptions, PipelineSection,
    RetryConfig, RetrySection, ServiceConfig, ServiceSection, config_dir, config_file_path,
    init_config, load_config, load_config_from, validate_api_key,
};
pub use error::{DocEnrichError, Result, ServiceErrorKind};
pub use types::{
    CacheEntry, DEFAULT_TRANSPARENCY_NOTE, DocumentRecord, EnrichmentResult, MAX_AFFECTED_GROUPS,
    MAX_KEYWORDS, PLACEHOLDER_SUMMARY_PREFIX,
};
