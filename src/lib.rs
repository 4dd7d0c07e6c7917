#![deny(missing_docs)]

//! Core library for the paperhoard article acquisition and indexing pipeline.

/// Bibliographic search and rate-limited publisher downloads.
pub mod acquisition;
/// Durable blob archive for raw article bytes.
pub mod archive;
/// Structure-aware, token-bounded chunking.
pub mod chunking;
/// Environment-driven configuration management.
pub mod config;
/// Structured document model and PDF conversion.
pub mod document;
/// Embedding client abstraction and adapters.
pub mod embedding;
/// Embedding index over a vector store.
pub mod index;
/// Structured logging and tracing setup.
pub mod logging;
/// Ledger of processed articles.
pub mod metadata;
/// Pipeline counters.
pub mod metrics;
/// Orchestration of the end-to-end pipeline.
pub mod pipeline;
