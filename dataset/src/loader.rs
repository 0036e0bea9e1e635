//! JSONL dataset loaders
//!
//! One record per line; a malformed line fails the whole load with its
//! line number. Four formats:
//!
//! - `single_turn`: `{text | texts, image?, audio?, video?, max_tokens?}`
//! - `multi_turn`: `{session_id?, turns: [{...}]}`
//! - `mooncake_trace`: `{timestamp, input_length?, text_input?,
//!   output_length?, hash_ids?}` with millisecond timestamps and optional
//!   512-token-block prefix reuse ids
//! - `random_pool`: same shape as `single_turn`; entries are later
//!   sampled with replacement

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use serde::Deserialize;

use inferload_core::config::CustomDatasetType;
use inferload_core::context::RunContext;
use inferload_core::error::{Error, Result};
use inferload_core::model::{Conversation, Role, Turn};
use inferload_core::tokenizer::Tokenizer;

use crate::synthetic::synthesize_prompt;

/// Tokens covered by one mooncake `hash_id` prefix block
const HASH_BLOCK_TOKENS: usize = 512;

#[derive(Debug, Deserialize)]
struct SingleTurnLine {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    texts: Option<Vec<String>>,
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    audio: Option<String>,
    #[serde(default)]
    video: Option<String>,
    #[serde(default)]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct MultiTurnLine {
    #[serde(default)]
    session_id: Option<String>,
    turns: Vec<MultiTurnEntry>,
}

#[derive(Debug, Deserialize)]
struct MultiTurnEntry {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    texts: Option<Vec<String>>,
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default)]
    delay: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct MooncakeTraceLine {
    timestamp: i64,
    #[serde(default)]
    input_length: Option<usize>,
    #[serde(default)]
    text_input: Option<String>,
    #[serde(default)]
    output_length: Option<u32>,
    #[serde(default)]
    hash_ids: Option<Vec<u64>>,
}

/// Load a JSONL dataset file into conversations
pub fn load_file(
    path: &Path,
    dataset_type: CustomDatasetType,
    ctx: &RunContext,
    tokenizer: &dyn Tokenizer,
) -> Result<Vec<Conversation>> {
    let file = File::open(path)
        .map_err(|e| Error::Dataset(format!("cannot open {}: {e}", path.display())))?;
    let reader = BufReader::new(file);

    let mut conversations = Vec::new();
    for (line_index, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| {
            Error::Dataset(format!("{}:{}: {e}", path.display(), line_index + 1))
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let session_num = conversations.len();
        let conversation = parse_line(&line, dataset_type, session_num, ctx, tokenizer)
            .map_err(|e| Error::Dataset(format!("{}:{}: {e}", path.display(), line_index + 1)))?;
        conversations.push(conversation);
    }

    if conversations.is_empty() {
        return Err(Error::Dataset(format!(
            "{} contains no records",
            path.display()
        )));
    }
    tracing::debug!(
        path = %path.display(),
        conversations = conversations.len(),
        kind = ?dataset_type,
        "dataset file loaded"
    );
    Ok(conversations)
}

fn parse_line(
    line: &str,
    dataset_type: CustomDatasetType,
    session_num: usize,
    ctx: &RunContext,
    tokenizer: &dyn Tokenizer,
) -> std::result::Result<Conversation, String> {
    match dataset_type {
        CustomDatasetType::SingleTurn | CustomDatasetType::RandomPool => {
            parse_single_turn(line, session_num)
        }
        CustomDatasetType::MultiTurn => parse_multi_turn(line, session_num),
        CustomDatasetType::MooncakeTrace => {
            parse_mooncake(line, session_num, ctx, tokenizer)
        }
    }
}

fn parse_single_turn(
    line: &str,
    session_num: usize,
) -> std::result::Result<Conversation, String> {
    let parsed: SingleTurnLine = serde_json::from_str(line).map_err(|e| e.to_string())?;
    let text = merge_texts(parsed.text, parsed.texts)
        .ok_or_else(|| "record has neither 'text' nor 'texts'".to_string())?;

    let mut turn = Turn::user(text);
    turn.image = parsed.image;
    turn.audio = parsed.audio;
    turn.video = parsed.video;
    turn.max_tokens = parsed.max_tokens;

    Ok(Conversation::single_turn(
        format!("session-{session_num:05}"),
        session_num,
        turn,
    ))
}

fn parse_multi_turn(
    line: &str,
    session_num: usize,
) -> std::result::Result<Conversation, String> {
    let parsed: MultiTurnLine = serde_json::from_str(line).map_err(|e| e.to_string())?;
    if parsed.turns.is_empty() {
        return Err("record has an empty 'turns' array".to_string());
    }

    let mut turns = Vec::with_capacity(parsed.turns.len());
    for entry in parsed.turns {
        let text = merge_texts(entry.text, entry.texts)
            .ok_or_else(|| "turn has neither 'text' nor 'texts'".to_string())?;
        let mut turn = Turn::user(text);
        if let Some(role) = entry.role.as_deref() {
            turn.role = match role {
                "user" => Role::User,
                "system" => Role::System,
                "assistant" => Role::Assistant,
                other => return Err(format!("unknown role '{other}'")),
            };
        }
        turn.max_tokens = entry.max_tokens;
        turn.delay_after_ms = entry.delay;
        turns.push(turn);
    }

    Ok(Conversation {
        id: parsed
            .session_id
            .unwrap_or_else(|| format!("session-{session_num:05}"))
            .into(),
        session_num,
        turns,
        timestamp_ms: None,
    })
}

/// Mooncake trace lines synthesize their prompt when only lengths are
/// given: each `hash_id` expands to a deterministic 512-token block (the
/// same id always produces the same block, which is what makes prefix
/// reuse observable server-side), and the remainder up to `input_length`
/// is drawn per line.
fn parse_mooncake(
    line: &str,
    session_num: usize,
    ctx: &RunContext,
    tokenizer: &dyn Tokenizer,
) -> std::result::Result<Conversation, String> {
    let parsed: MooncakeTraceLine = serde_json::from_str(line).map_err(|e| e.to_string())?;

    let corpus_ids = tokenizer.encode(crate::synthetic_corpus());
    let text = match parsed.text_input {
        Some(text) => text,
        None => {
            let input_length = parsed
                .input_length
                .ok_or_else(|| "record has neither 'text_input' nor 'input_length'".to_string())?;
            let mut prefix = String::new();
            for hash_id in parsed.hash_ids.as_deref().unwrap_or_default() {
                let mut block_rng = ctx.derive_rng(&format!("dataset.prompt.block.{hash_id}"));
                let block = synthesize_prompt(
                    tokenizer,
                    &corpus_ids,
                    &mut block_rng,
                    HASH_BLOCK_TOKENS,
                    None,
                );
                if !prefix.is_empty() {
                    prefix.push(' ');
                }
                prefix.push_str(&block);
            }
            let mut line_rng =
                ctx.derive_rng(&format!("dataset.prompt.trace.{session_num}"));
            synthesize_prompt(
                tokenizer,
                &corpus_ids,
                &mut line_rng,
                input_length,
                (!prefix.is_empty()).then_some(prefix.as_str()),
            )
        }
    };

    let mut turn = Turn::user(text);
    turn.input_ids = Some(tokenizer.encode(&turn.text));
    turn.max_tokens = parsed.output_length;
    turn.min_tokens = parsed.output_length;
    turn.ignore_eos = parsed.output_length.is_some();

    Ok(Conversation {
        id: format!("session-{session_num:05}").into(),
        session_num,
        turns: vec![turn],
        timestamp_ms: Some(parsed.timestamp),
    })
}

fn merge_texts(text: Option<String>, texts: Option<Vec<String>>) -> Option<String> {
    match (text, texts) {
        (Some(text), _) => Some(text),
        (None, Some(texts)) if !texts.is_empty() => Some(texts.join(" ")),
        _ => None,
    }
}
