//! Synthetic conversation generation
//!
//! Prompts are built to a target token count by drawing token ids from a
//! reference corpus, optionally behind a shared prefix drawn from a
//! fixed-size pool (to exercise server-side KV-cache reuse). All draws
//! come from hash-derived sub-RNGs, so the generated pool is byte
//! identical for a given seed and configuration no matter how many
//! workers or processors the run uses.

use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::{Distribution, Normal};

use inferload_core::config::UserConfig;
use inferload_core::context::{rng_id, RunContext};
use inferload_core::error::{Error, Result};
use inferload_core::model::{Conversation, Role, Turn};
use inferload_core::tokenizer::Tokenizer;

use crate::distribution::{clamp_tokens, SequenceDistribution};

/// Reference text the corpus token ids are drawn from
pub(crate) const CORPUS: &str = "\
the quick brown fox jumps over the lazy dog while seventy two bright red \
balloons drift slowly across a cold autumn sky and somewhere far below a \
small train rattles through open fields carrying timber coal and barrels \
of fresh water toward a harbor town where fishermen mend their nets at \
dawn traders argue about grain prices sailors tell long stories of storms \
they survived and children race wooden hoops down narrow cobblestone \
streets past bakeries full of warm bread quiet libraries dusty workshops \
and gardens heavy with ripe apples pears and late summer roses";

/// Generate the full synthetic conversation pool
pub fn generate(
    config: &UserConfig,
    ctx: &RunContext,
    tokenizer: &dyn Tokenizer,
) -> Result<Vec<Conversation>> {
    let corpus_ids = tokenizer.encode(CORPUS);
    if corpus_ids.is_empty() {
        return Err(Error::Internal("reference corpus tokenized to nothing".into()));
    }

    let mut length_rng = ctx.derive_rng(rng_id::PROMPT_LENGTH);
    let mut content_rng = ctx.derive_rng(rng_id::PROMPT_CONTENT);
    let mut turns_rng = ctx.derive_rng(rng_id::CONVERSATION_TURNS);
    let mut delay_rng = ctx.derive_rng(rng_id::CONVERSATION_DELAY);
    let mut dist_rng = ctx.derive_rng(rng_id::SEQUENCE_DISTRIBUTION);

    let distribution = config
        .lengths
        .sequence_distribution
        .as_deref()
        .map(SequenceDistribution::parse)
        .transpose()?;

    let prefix_pool = build_prefix_pool(config, ctx, tokenizer, &corpus_ids)?;

    let mut conversations = Vec::with_capacity(config.conversation.num);
    for index in 0..config.conversation.num {
        let turn_count = sample_positive(
            &mut turns_rng,
            config.conversation.turn_mean,
            config.conversation.turn_stddev,
        )? as usize;

        let mut turns = Vec::with_capacity(turn_count);
        for turn_index in 0..turn_count {
            // Each conversation draws one (isl, osl); turns share it
            let (isl, osl) = match &distribution {
                Some(distribution) => distribution.sample(&mut dist_rng)?,
                None => (
                    sample_positive(
                        &mut length_rng,
                        config.lengths.isl_mean,
                        config.lengths.isl_stddev,
                    )?,
                    sample_positive(
                        &mut length_rng,
                        config.lengths.osl_mean,
                        config.lengths.osl_stddev,
                    )?,
                ),
            };

            let prefix = prefix_pool
                .as_ref()
                .map(|pool| pool[index % pool.len()].as_str());
            let text = synthesize_prompt(
                tokenizer,
                &corpus_ids,
                &mut content_rng,
                isl as usize,
                prefix,
            );

            let delay_after_ms = (turn_index + 1 < turn_count)
                .then(|| sample_delay(&mut delay_rng, &config.conversation))
                .transpose()?
                .flatten();

            turns.push(Turn {
                role: Role::User,
                text,
                input_ids: None,
                image: None,
                audio: None,
                video: None,
                max_tokens: Some(osl as u32),
                min_tokens: Some(osl as u32),
                ignore_eos: true,
                model: None,
                delay_after_ms,
            });
        }

        conversations.push(Conversation {
            id: format!("session-{index:05}").into(),
            session_num: index,
            turns,
            timestamp_ms: None,
        });
    }

    tracing::debug!(
        conversations = conversations.len(),
        prefixes = prefix_pool.as_ref().map(Vec::len).unwrap_or(0),
        "synthetic dataset generated"
    );
    Ok(conversations)
}

/// Build a prompt of exactly `target_tokens` tokens, prefix included
pub fn synthesize_prompt(
    tokenizer: &dyn Tokenizer,
    corpus_ids: &[u32],
    rng: &mut StdRng,
    target_tokens: usize,
    prefix: Option<&str>,
) -> String {
    let target_tokens = target_tokens.max(1);
    let prefix_ids = prefix.map(|text| tokenizer.encode(text)).unwrap_or_default();

    let remaining = target_tokens.saturating_sub(prefix_ids.len());
    let mut ids = Vec::with_capacity(target_tokens);
    ids.extend(prefix_ids.iter().take(target_tokens));
    for _ in 0..remaining {
        ids.push(corpus_ids[rng.gen_range(0..corpus_ids.len())]);
    }
    tokenizer.decode(&ids)
}

fn build_prefix_pool(
    config: &UserConfig,
    ctx: &RunContext,
    tokenizer: &dyn Tokenizer,
    corpus_ids: &[u32],
) -> Result<Option<Vec<String>>> {
    let pool_size = config.lengths.prompt_prefix_pool_size;
    let prefix_length = config.lengths.prompt_prefix_length;
    if pool_size == 0 || prefix_length == 0 {
        return Ok(None);
    }
    let mut prefix_rng = ctx.derive_rng(rng_id::PROMPT_PREFIX);
    let pool = (0..pool_size)
        .map(|_| synthesize_prompt(tokenizer, corpus_ids, &mut prefix_rng, prefix_length, None))
        .collect();
    Ok(Some(pool))
}

fn sample_positive(rng: &mut StdRng, mean: f64, stddev: f64) -> Result<u64> {
    let normal = Normal::new(mean, stddev)
        .map_err(|e| Error::Config(format!("invalid distribution parameters: {e}")))?;
    Ok(clamp_tokens(normal.sample(rng)))
}

/// Think-time in milliseconds, scaled and clamped non-negative; `None`
/// when delays are not configured
fn sample_delay(
    rng: &mut StdRng,
    config: &inferload_core::config::ConversationConfig,
) -> Result<Option<u64>> {
    if config.turn_delay_mean <= 0.0 && config.turn_delay_stddev <= 0.0 {
        return Ok(None);
    }
    let normal = Normal::new(config.turn_delay_mean, config.turn_delay_stddev)
        .map_err(|e| Error::Config(format!("invalid delay parameters: {e}")))?;
    let delay_ms = (normal.sample(rng) * config.turn_delay_ratio).max(0.0);
    Ok(Some(delay_ms.round() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use inferload_core::tokenizer::HeuristicTokenizer;

    fn test_config() -> UserConfig {
        let mut config = UserConfig::default();
        config.endpoint.model = "test-model".to_string();
        config.conversation.num = 10;
        config.lengths.isl_mean = 32.0;
        config.lengths.osl_mean = 16.0;
        config
    }

    fn tokenizer() -> HeuristicTokenizer {
        HeuristicTokenizer::from_corpus(CORPUS)
    }

    #[test]
    fn test_prompts_hit_target_token_count() {
        let config = test_config();
        let ctx = RunContext::new(Some(42));
        let tok = tokenizer();
        let conversations = generate(&config, &ctx, &tok).unwrap();

        assert_eq!(conversations.len(), 10);
        for conversation in &conversations {
            assert_eq!(conversation.turns.len(), 1);
            let turn = &conversation.turns[0];
            assert_eq!(tok.count(&turn.text), 32);
            assert_eq!(turn.max_tokens, Some(16));
            assert_eq!(turn.min_tokens, Some(16));
            assert!(turn.ignore_eos);
            assert!(turn.delay_after_ms.is_none());
        }
    }

    #[test]
    fn test_same_seed_identical_pool() {
        let config = test_config();
        let tok = tokenizer();
        let a = generate(&config, &RunContext::new(Some(7)), &tok).unwrap();
        let b = generate(&config, &RunContext::new(Some(7)), &tok).unwrap();

        let texts_a: Vec<&str> = a.iter().map(|c| c.turns[0].text.as_str()).collect();
        let texts_b: Vec<&str> = b.iter().map(|c| c.turns[0].text.as_str()).collect();
        assert_eq!(texts_a, texts_b);
    }

    #[test]
    fn test_different_seeds_differ() {
        let config = test_config();
        let tok = tokenizer();
        let a = generate(&config, &RunContext::new(Some(1)), &tok).unwrap();
        let b = generate(&config, &RunContext::new(Some(2)), &tok).unwrap();
        assert_ne!(a[0].turns[0].text, b[0].turns[0].text);
    }

    #[test]
    fn test_prefix_pool_reuse() {
        let mut config = test_config();
        config.lengths.prompt_prefix_pool_size = 2;
        config.lengths.prompt_prefix_length = 8;
        let ctx = RunContext::new(Some(42));
        let tok = tokenizer();
        let conversations = generate(&config, &ctx, &tok).unwrap();

        let prefix_of = |text: &str| {
            text.split_whitespace()
                .take(8)
                .collect::<Vec<_>>()
                .join(" ")
        };
        // Conversations alternate between the two pool prefixes
        let p0 = prefix_of(&conversations[0].turns[0].text);
        let p1 = prefix_of(&conversations[1].turns[0].text);
        let p2 = prefix_of(&conversations[2].turns[0].text);
        assert_ne!(p0, p1);
        assert_eq!(p0, p2);
    }

    #[test]
    fn test_multi_turn_delays_on_all_but_last() {
        let mut config = test_config();
        config.conversation.turn_mean = 3.0;
        config.conversation.turn_delay_mean = 50.0;
        config.conversation.turn_delay_ratio = 2.0;
        let ctx = RunContext::new(Some(42));
        let tok = tokenizer();
        let conversations = generate(&config, &ctx, &tok).unwrap();

        for conversation in &conversations {
            assert_eq!(conversation.turns.len(), 3);
            assert!(conversation.turns[0].delay_after_ms.is_some());
            assert!(conversation.turns[1].delay_after_ms.is_some());
            assert!(conversation.turns[2].delay_after_ms.is_none());
            // ratio scales the mean delay
            assert_eq!(conversation.turns[0].delay_after_ms, Some(100));
        }
    }

    #[test]
    fn test_sequence_distribution_drives_lengths() {
        let mut config = test_config();
        config.lengths.sequence_distribution = Some("8,4:100".to_string());
        let ctx = RunContext::new(Some(42));
        let tok = tokenizer();
        let conversations = generate(&config, &ctx, &tok).unwrap();

        for conversation in &conversations {
            assert_eq!(tok.count(&conversation.turns[0].text), 8);
            assert_eq!(conversation.turns[0].max_tokens, Some(4));
        }
    }
}
