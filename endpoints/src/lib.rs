//! Endpoint transport and codecs for inferload
//!
//! This crate implements the client-side traits defined in
//! `inferload-core`:
//!
//! - [`HttpInferenceClient`]: a pooled `reqwest` client that executes and
//!   times requests, streaming or not
//! - An SSE parser for `data:`-framed event streams
//! - Built-in codecs for OpenAI chat, OpenAI completions, OpenAI
//!   embeddings, and rankings endpoints

#![warn(clippy::all)]

mod chat;
mod completions;
mod embeddings;
mod http;
mod rankings;
mod sse;

pub use chat::ChatCodec;
pub use completions::CompletionsCodec;
pub use embeddings::EmbeddingsCodec;
pub use http::{HttpClientConfig, HttpInferenceClient};
pub use rankings::RankingsCodec;
pub use sse::{SseEvent, SseParser};

use std::sync::Arc;

use inferload_core::client::RequestCodec;
use inferload_core::config::EndpointType;

/// The built-in codec for an endpoint type
pub fn codec_for(endpoint_type: EndpointType) -> Arc<dyn RequestCodec> {
    match endpoint_type {
        EndpointType::Chat => Arc::new(ChatCodec),
        EndpointType::Completions => Arc::new(CompletionsCodec),
        EndpointType::Embeddings => Arc::new(EmbeddingsCodec),
        EndpointType::Rankings => Arc::new(RankingsCodec),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_paths() {
        assert_eq!(
            codec_for(EndpointType::Chat).endpoint_path(),
            "/v1/chat/completions"
        );
        assert_eq!(
            codec_for(EndpointType::Completions).endpoint_path(),
            "/v1/completions"
        );
        assert_eq!(
            codec_for(EndpointType::Embeddings).endpoint_path(),
            "/v1/embeddings"
        );
        assert_eq!(codec_for(EndpointType::Rankings).endpoint_path(), "/v1/ranking");
    }

    #[test]
    fn test_streaming_support() {
        assert!(codec_for(EndpointType::Chat).supports_streaming());
        assert!(codec_for(EndpointType::Completions).supports_streaming());
        assert!(!codec_for(EndpointType::Embeddings).supports_streaming());
        assert!(!codec_for(EndpointType::Rankings).supports_streaming());
    }
}
