//! Worker pool
//!
//! Workers are the execution units of the pipeline, each running the loop
//! **pull credit -> fetch conversation -> call endpoint -> emit record ->
//! repeat**. Each credit runs as its own task under a per-worker
//! concurrency ceiling; overall request concurrency is governed by the
//! scheduler, the pool only has to be able to hold it.
//!
//! For multi-turn conversations the worker owns the running message
//! history for the lifetime of the credit: after every turn it appends the
//! user turn and the assistant's reply, and it sleeps the configured
//! think-time before every turn but the first.

mod executor;

pub use executor::Worker;
