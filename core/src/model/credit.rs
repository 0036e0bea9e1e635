//! Credits: one-shot permissions to run a conversation's requests

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ConversationId;

/// Which bucket a credit's records land in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditPhase {
    /// Records are excluded from profiling statistics
    Warmup,
    /// Records contribute to the final report
    Profiling,
}

impl std::fmt::Display for CreditPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CreditPhase::Warmup => write!(f, "warmup"),
            CreditPhase::Profiling => write!(f, "profiling"),
        }
    }
}

/// Permission to execute the requests of one conversation.
///
/// Issued by the scheduler, consumed by exactly one worker. For multi-turn
/// conversations a single credit covers the whole session; the worker
/// reports one record per turn.
#[derive(Debug, Clone)]
pub struct Credit {
    /// Sequential credit number within the run
    pub credit_num: u64,

    /// Conversation this credit is bound to
    pub conversation_id: ConversationId,

    /// Warmup or profiling
    pub phase: CreditPhase,

    /// When set, the worker aborts the request this long after send
    pub cancel_after: Option<Duration>,

    /// Monotonic time the schedule wanted this credit issued
    pub scheduled_ns: u64,

    /// Monotonic time the scheduler actually issued it
    pub issued_ns: u64,
}

impl Credit {
    /// How far behind schedule this credit was issued
    pub fn issue_delay_ns(&self) -> u64 {
        self.issued_ns.saturating_sub(self.scheduled_ns)
    }
}
