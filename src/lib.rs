//! # audio-embed — pooled audio embedding extraction
//!
//! Arbitrates concurrent access to an expensive, stateful native inference
//! engine that turns audio files into embedding vectors for similarity and
//! recommendation.
//!
//! ## Architecture
//!
//! - **[`engine`]** — Engine trait, FFI bindings (feature `native`) and a mock engine
//! - **[`pool`]** — Bounded, recyclable worker pool (`create_workers`, `get_embeddings`, `teardown_workers`)
//! - **[`config`]** — JSON configuration loading and validation
//! - **[`scan`]** — Audio file discovery
//! - **[`pipeline`]** — Batch embedding of a file list to JSON lines
//! - **[`cli`]** — Command-line definitions for the `audio-embed` binary

pub mod cli;
pub mod config;
pub mod engine;
pub mod pipeline;
pub mod pool;
pub mod scan;
