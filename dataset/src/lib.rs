//! Conversation pool construction for inferload
//!
//! This crate materializes the full conversation set before the first
//! credit is issued, either synthetically (corpus-driven prompts shaped
//! by the length and conversation configuration) or from a JSONL input
//! file, and implements the `DatasetProvider` trait the core dataset
//! service is built on.
//!
//! All randomness is derived from the run seed through hash-based
//! sub-RNGs, so the same seed and configuration always produce the same
//! pool, regardless of how the rest of the run is sized.

#![warn(clippy::all)]

mod distribution;
mod loader;
mod synthetic;

pub use distribution::{SequenceBucket, SequenceDistribution};
pub use loader::load_file;
pub use synthetic::generate;

use std::collections::HashMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;

use inferload_core::config::{CustomDatasetType, UserConfig};
use inferload_core::context::{rng_id, RunContext};
use inferload_core::dataset::{DatasetProvider, SampleStrategy};
use inferload_core::error::Result;
use inferload_core::model::{Conversation, ConversationId};
use inferload_core::tokenizer::Tokenizer;

/// The reference corpus used for synthetic prompt token draws
pub fn synthetic_corpus() -> &'static str {
    synthetic::CORPUS
}

/// The finalized, immutable conversation pool
pub struct ConversationPool {
    conversations: Vec<Arc<Conversation>>,
    by_id: HashMap<ConversationId, usize>,
    order: Vec<usize>,
    cursor: usize,
    strategy: SampleStrategy,
    rng: StdRng,
}

impl ConversationPool {
    /// Finalize a pool with the given sampling strategy
    pub fn new(
        conversations: Vec<Conversation>,
        strategy: SampleStrategy,
        mut rng: StdRng,
    ) -> Self {
        let conversations: Vec<Arc<Conversation>> =
            conversations.into_iter().map(Arc::new).collect();
        let by_id = conversations
            .iter()
            .enumerate()
            .map(|(index, conversation)| (conversation.id.clone(), index))
            .collect();
        let mut order: Vec<usize> = (0..conversations.len()).collect();
        if strategy == SampleStrategy::Shuffle {
            order.shuffle(&mut rng);
        }
        Self {
            conversations,
            by_id,
            order,
            cursor: 0,
            strategy,
            rng,
        }
    }

    /// Conversations in session order, for the `inputs.json` artifact
    pub fn conversations(&self) -> &[Arc<Conversation>] {
        &self.conversations
    }
}

impl DatasetProvider for ConversationPool {
    fn get_by_id(&self, id: &ConversationId) -> Option<Arc<Conversation>> {
        self.by_id
            .get(id)
            .map(|&index| Arc::clone(&self.conversations[index]))
    }

    fn next_id(&mut self) -> Option<ConversationId> {
        if self.conversations.is_empty() {
            return None;
        }
        let index = match self.strategy {
            SampleStrategy::Random => self.rng.gen_range(0..self.conversations.len()),
            SampleStrategy::Sequential | SampleStrategy::Shuffle => {
                let index = self.order[self.cursor % self.order.len()];
                self.cursor += 1;
                index
            }
        };
        Some(self.conversations[index].id.clone())
    }

    fn timed_schedule(&self) -> Vec<(i64, ConversationId)> {
        let mut schedule: Vec<(i64, ConversationId)> = self
            .conversations
            .iter()
            .filter_map(|conversation| {
                conversation
                    .timestamp_ms
                    .map(|ts| (ts, conversation.id.clone()))
            })
            .collect();
        schedule.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        schedule
    }

    fn count(&self) -> usize {
        self.conversations.len()
    }
}

/// Build the pool from the validated run configuration.
///
/// `random_pool` inputs are sampled with replacement; every other source
/// is served round-robin in pool order.
pub fn build_pool(
    config: &UserConfig,
    ctx: &RunContext,
    tokenizer: &dyn Tokenizer,
) -> Result<ConversationPool> {
    let conversations = match &config.input.file {
        Some(path) => loader::load_file(
            path,
            config
                .input
                .custom_dataset_type
                .unwrap_or(CustomDatasetType::SingleTurn),
            ctx,
            tokenizer,
        )?,
        None => synthetic::generate(config, ctx, tokenizer)?,
    };

    let strategy = match config.input.custom_dataset_type {
        Some(CustomDatasetType::RandomPool) => SampleStrategy::Random,
        _ => SampleStrategy::Sequential,
    };
    tracing::info!(
        conversations = conversations.len(),
        strategy = ?strategy,
        "dataset finalized"
    );
    Ok(ConversationPool::new(
        conversations,
        strategy,
        ctx.derive_rng(rng_id::DATASET_SAMPLER),
    ))
}
