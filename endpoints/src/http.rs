//! HTTP transport for inference requests
//!
//! One pooled `reqwest` client is shared by all workers; connection reuse
//! matters at benchmark request rates. Every attempt is timed against the
//! shared run clock: `start_ns` immediately before send, `ack_ns` on the
//! first body byte of a streamed response, `end_ns` when the exchange
//! finishes by any path. Failures are classified into the record-level
//! error kinds; this layer never retries.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use inferload_core::client::{InferenceClient, RequestCodec, TurnOutcome, TurnRequest};
use inferload_core::clock::RunClock;
use inferload_core::config::EndpointConfig;
use inferload_core::error::{Error, ErrorDetails, ErrorKind, Result};
use inferload_core::model::{ParsedResponse, ResponseChunk};

use crate::sse::{SseEvent, SseParser};

/// How much of an error body to keep in error details
const ERROR_BODY_LIMIT: usize = 512;

/// Connection pool tuning
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Idle connection timeout
    pub pool_idle_timeout: Duration,
    /// Maximum idle connections per host
    pub pool_max_idle_per_host: usize,
    /// Connection establishment timeout
    pub connect_timeout: Duration,
    /// TCP keepalive interval
    pub tcp_keepalive: Option<Duration>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            pool_idle_timeout: Duration::from_secs(90),
            pool_max_idle_per_host: 64,
            connect_timeout: Duration::from_secs(30),
            tcp_keepalive: Some(Duration::from_secs(60)),
        }
    }
}

/// `reqwest`-backed implementation of [`InferenceClient`]
pub struct HttpInferenceClient {
    client: reqwest::Client,
    base_url: String,
    codec: Arc<dyn RequestCodec>,
    api_key: Option<String>,
    headers: BTreeMap<String, String>,
    clock: Arc<RunClock>,
}

impl HttpInferenceClient {
    /// Build the client from the endpoint configuration
    pub fn new(
        endpoint: &EndpointConfig,
        codec: Arc<dyn RequestCodec>,
        clock: Arc<RunClock>,
    ) -> Result<Self> {
        Self::with_http_config(endpoint, codec, clock, &HttpClientConfig::default())
    }

    /// Build the client with explicit pool tuning
    pub fn with_http_config(
        endpoint: &EndpointConfig,
        codec: Arc<dyn RequestCodec>,
        clock: Arc<RunClock>,
        http: &HttpClientConfig,
    ) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .pool_idle_timeout(http.pool_idle_timeout)
            .pool_max_idle_per_host(http.pool_max_idle_per_host)
            .connect_timeout(http.connect_timeout)
            .timeout(endpoint.request_timeout)
            .user_agent(concat!("inferload/", env!("CARGO_PKG_VERSION")));
        if let Some(keepalive) = http.tcp_keepalive {
            builder = builder.tcp_keepalive(keepalive);
        }
        let client = builder
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: endpoint.url.trim_end_matches('/').to_string(),
            codec,
            api_key: endpoint.api_key.clone(),
            headers: endpoint.headers.clone(),
            clock,
        })
    }

    /// Full URL for this codec's endpoint
    pub fn request_url(&self) -> String {
        format!("{}{}", self.base_url, self.codec.endpoint_path())
    }

    fn error_outcome(&self, start_ns: u64, status: Option<u16>, error: ErrorDetails) -> TurnOutcome {
        TurnOutcome {
            start_ns,
            ack_ns: None,
            end_ns: self.clock.now_ns(),
            status,
            streamed: false,
            response: ParsedResponse::default(),
            error: Some(error),
        }
    }

    async fn consume_stream(
        &self,
        start_ns: u64,
        status: u16,
        response: reqwest::Response,
    ) -> TurnOutcome {
        let mut stream = response.bytes_stream();
        let mut parser = SseParser::new();
        let mut chunks: Vec<ResponseChunk> = Vec::new();
        let mut ack_ns: Option<u64> = None;
        let mut error: Option<ErrorDetails> = None;

        'receive: while let Some(piece) = stream.next().await {
            let received_ns = self.clock.now_ns();
            let bytes = match piece {
                Ok(bytes) => bytes,
                Err(e) => {
                    error = Some(classify_transport(&e));
                    break;
                }
            };
            ack_ns.get_or_insert(received_ns);

            for event in parser.feed(&bytes) {
                match event {
                    SseEvent::Done => break 'receive,
                    SseEvent::Data(data) => {
                        match self.codec.parse_stream_data(&data, received_ns) {
                            Ok(Some(chunk)) => chunks.push(chunk),
                            Ok(None) => {}
                            Err(parse_error) => {
                                error = Some(parse_error);
                                break 'receive;
                            }
                        }
                    }
                }
            }
        }

        TurnOutcome {
            start_ns,
            ack_ns,
            end_ns: self.clock.now_ns(),
            status: Some(status),
            streamed: true,
            response: ParsedResponse { chunks },
            error,
        }
    }

    async fn consume_body(
        &self,
        start_ns: u64,
        status: u16,
        response: reqwest::Response,
    ) -> TurnOutcome {
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                return self.error_outcome(start_ns, Some(status), classify_transport(&e));
            }
        };
        let end_ns = self.clock.now_ns();
        match self.codec.parse_body(&body, end_ns) {
            Ok(parsed) => TurnOutcome {
                start_ns,
                // Non-streaming: the whole body arrives at once
                ack_ns: Some(end_ns),
                end_ns,
                status: Some(status),
                streamed: false,
                response: parsed,
                error: None,
            },
            Err(parse_error) => self.error_outcome(start_ns, Some(status), parse_error),
        }
    }
}

#[async_trait]
impl InferenceClient for HttpInferenceClient {
    async fn send(&self, request: &TurnRequest) -> TurnOutcome {
        let streaming = request.streaming && self.codec.supports_streaming();
        let body = self
            .codec
            .format(&request.turn, &request.history, &request.model, streaming);

        let mut builder = self
            .client
            .post(self.request_url())
            .header("X-Request-ID", &request.x_request_id)
            .header("X-Correlation-ID", &request.x_correlation_id)
            .json(&body);
        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key);
        }
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let start_ns = self.clock.now_ns();
        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => return self.error_outcome(start_ns, None, classify_transport(&e)),
        };

        let status = response.status();
        if !status.is_success() {
            let excerpt: String = response
                .text()
                .await
                .unwrap_or_default()
                .chars()
                .take(ERROR_BODY_LIMIT)
                .collect();
            return self.error_outcome(
                start_ns,
                Some(status.as_u16()),
                ErrorDetails::http(status.as_u16(), excerpt),
            );
        }

        if streaming {
            self.consume_stream(start_ns, status.as_u16(), response).await
        } else {
            self.consume_body(start_ns, status.as_u16(), response).await
        }
    }

    fn prompt_text(&self, request: &TurnRequest) -> String {
        self.codec.prompt_text(&request.turn, &request.history)
    }
}

fn classify_transport(error: &reqwest::Error) -> ErrorDetails {
    if error.is_timeout() {
        ErrorDetails::new(ErrorKind::RequestTimeout, error.to_string())
    } else {
        ErrorDetails::new(ErrorKind::TransportError, error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChatCodec;

    fn endpoint() -> EndpointConfig {
        EndpointConfig {
            model: "test-model".to_string(),
            url: "http://localhost:8000/".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_url_join_strips_trailing_slash() {
        let client = HttpInferenceClient::new(
            &endpoint(),
            Arc::new(ChatCodec),
            Arc::new(RunClock::new()),
        )
        .unwrap();
        assert_eq!(
            client.request_url(),
            "http://localhost:8000/v1/chat/completions"
        );
    }

    #[test]
    fn test_client_builds_with_custom_pool() {
        let http = HttpClientConfig {
            pool_max_idle_per_host: 8,
            ..Default::default()
        };
        let client = HttpInferenceClient::with_http_config(
            &endpoint(),
            Arc::new(ChatCodec),
            Arc::new(RunClock::new()),
            &http,
        );
        assert!(client.is_ok());
    }
}
