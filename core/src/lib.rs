//! Core types, message bus, and metrics pipeline for inferload
//!
//! This crate provides the foundational pieces used throughout the
//! inferload tool, including:
//!
//! - The benchmark data model (conversations, credits, request records)
//! - A typed in-process message bus (pub/sub, push/pull, request/reply,
//!   command channels)
//! - The credit scheduler with its three traffic modes
//! - The async worker pool and record processor pool
//! - Metric extraction, aggregation, and final statistics
//! - The run controller and service lifecycle framework
//!
//! Endpoint codecs live in `inferload-endpoints`, dataset construction in
//! `inferload-dataset`, and artifact writers in `inferload-export`. The
//! traits those crates implement (`InferenceClient`, `RequestCodec`,
//! `Tokenizer`) are defined here to avoid circular dependencies.

#![warn(clippy::all)]

pub mod aggregator;
pub mod bus;
pub mod client;
pub mod clock;
pub mod config;
pub mod context;
pub mod controller;
pub mod dataset;
pub mod error;
pub mod metrics;
pub mod model;
pub mod processor;
pub mod scheduler;
pub mod service;
pub mod stats;
pub mod tokenizer;
pub mod worker;

/// Commonly used types
pub mod prelude {
    pub use crate::error::{Error, ErrorDetails, ErrorKind, Result};
    pub use crate::model::{
        Conversation, ConversationId, Credit, CreditPhase, RawRequestRecord, Role, Turn,
    };
}
