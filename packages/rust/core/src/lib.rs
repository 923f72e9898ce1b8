//! Batch enrichment pipeline for docenrich.
//!
//! This crate ties together the generation service, the enrichment client,
//! work selection, the worker pool and merge/persist into one run over a
//! JSON-lines batch ([`pipeline::BatchPipeline::run`]).

pub mod client;
pub mod merge;
pub mod pipeline;
pub mod pool;
pub mod selector;
pub mod service;
pub mod source;

#[cfg(test)]
mod testing;

pub use client::{ClientCounters, EnrichmentClient};
pub use merge::{MergedRecord, merge, write_batch_atomic};
pub use pipeline::{BatchPipeline, FailureRecord, ProgressReporter, RunReport, SilentProgress};
pub use pool::{Outcome, OutcomeStatus, WorkerPool};
pub use selector::{Selection, WorkItem, select};
pub use service::{CompletionRequest, CompletionResponse, GenerationService, OpenAiCompatibleService};
pub use source::{Batch, BatchEntry, load_batch};
