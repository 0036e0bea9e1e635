//! Dataset provider service
//!
//! The conversation pool is materialized before the first credit is
//! issued; at runtime this service answers lookups over the request/reply
//! channel. Pool construction itself lives in `inferload-dataset`; the
//! [`DatasetProvider`] trait is the seam between the two.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::bus::DatasetRequest;
use crate::error::Result;
use crate::model::{Conversation, ConversationId};
use crate::service::{ServiceHarness, ServiceState};

/// Conversation selection policy for `sample`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SampleStrategy {
    /// Independent uniform draws
    Random,
    /// Round-robin in pool order
    #[default]
    Sequential,
    /// A seeded permutation, then round-robin over it
    Shuffle,
}

/// Read access to the finalized conversation pool.
///
/// `next_id` advances the sampler policy cursor and so takes `&mut self`;
/// everything else is read-only over the immutable pool.
pub trait DatasetProvider: Send {
    /// Look up a conversation by id
    fn get_by_id(&self, id: &ConversationId) -> Option<Arc<Conversation>>;

    /// Draw the next conversation id under the sampler policy
    fn next_id(&mut self) -> Option<ConversationId>;

    /// Sorted `(timestamp_ms, id)` pairs for conversations that carry
    /// trace timestamps
    fn timed_schedule(&self) -> Vec<(i64, ConversationId)>;

    /// Number of conversations in the pool
    fn count(&self) -> usize;
}

/// Serves [`DatasetRequest`]s from a provider
pub struct DatasetService {
    provider: Box<dyn DatasetProvider>,
    requests: mpsc::Receiver<DatasetRequest>,
    harness: ServiceHarness,
}

impl DatasetService {
    /// Create the service
    pub fn new(
        provider: Box<dyn DatasetProvider>,
        requests: mpsc::Receiver<DatasetRequest>,
        harness: ServiceHarness,
    ) -> Self {
        Self {
            provider,
            requests,
            harness,
        }
    }

    /// Serve lookups until shutdown
    pub async fn run(mut self) -> Result<()> {
        if !self.harness.startup_handshake().await? {
            return Ok(());
        }
        let heartbeat = self.harness.spawn_heartbeat();
        let shutdown = self.harness.shutdown();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                request = self.requests.recv() => match request {
                    Some(request) => self.serve(request),
                    None => break,
                },
            }
        }

        heartbeat.abort();
        self.harness.publish_state(ServiceState::Stopped);
        Ok(())
    }

    fn serve(&mut self, request: DatasetRequest) {
        match request {
            DatasetRequest::GetById { id, reply } => {
                let _ = reply.send(self.provider.get_by_id(&id));
            }
            DatasetRequest::NextId { reply } => {
                let _ = reply.send(self.provider.next_id());
            }
            DatasetRequest::TimedSchedule { reply } => {
                let _ = reply.send(self.provider.timed_schedule());
            }
            DatasetRequest::Count { reply } => {
                let _ = reply.send(self.provider.count());
            }
        }
    }
}
