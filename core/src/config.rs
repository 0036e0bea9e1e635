//! Benchmark run configuration
//!
//! `UserConfig` is assembled by the CLI layer and validated once, before
//! any service starts. Invalid combinations abort with exit code 1; nothing
//! in the pipeline re-validates at runtime.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Endpoint kinds with built-in codecs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointType {
    /// OpenAI `/v1/chat/completions`
    Chat,
    /// OpenAI `/v1/completions`
    Completions,
    /// OpenAI `/v1/embeddings`
    Embeddings,
    /// Rankings endpoint (`/v1/ranking`)
    Rankings,
}

impl EndpointType {
    /// Whether this endpoint kind can stream responses
    pub fn supports_streaming(&self) -> bool {
        matches!(self, EndpointType::Chat | EndpointType::Completions)
    }
}

impl std::fmt::Display for EndpointType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointType::Chat => write!(f, "chat"),
            EndpointType::Completions => write!(f, "completions"),
            EndpointType::Embeddings => write!(f, "embeddings"),
            EndpointType::Rankings => write!(f, "rankings"),
        }
    }
}

/// Target endpoint and transport options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Model name sent in request payloads
    pub model: String,

    /// Base URL of the inference service
    pub url: String,

    /// Which built-in codec formats and parses requests
    pub endpoint_type: EndpointType,

    /// Request streamed responses
    pub streaming: bool,

    /// Per-request timeout
    pub request_timeout: Duration,

    /// Bearer token for the `Authorization` header
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Extra headers attached to every request
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            url: "http://localhost:8000".to_string(),
            endpoint_type: EndpointType::Chat,
            streaming: true,
            request_timeout: Duration::from_secs(600),
            api_key: None,
            headers: BTreeMap::new(),
        }
    }
}

/// Dataset source kinds for `--input-file`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomDatasetType {
    /// One request per JSONL line
    SingleTurn,
    /// JSONL lines with a `turns` array
    MultiTurn,
    /// Mooncake-style trace with millisecond timestamps
    MooncakeTrace,
    /// Entries sampled with replacement
    RandomPool,
}

/// Input / dataset options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputConfig {
    /// JSONL dataset file; synthetic generation when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,

    /// Format of `file`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_dataset_type: Option<CustomDatasetType>,

    /// Replay the dataset's timestamps instead of generating a schedule
    pub fixed_schedule: bool,

    /// Subtract the first timestamp so the trace starts at zero
    pub fixed_schedule_auto_offset: bool,

    /// Replay only timestamps at or after this offset (milliseconds)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fixed_schedule_start_offset_ms: Option<i64>,

    /// Replay only timestamps at or before this offset (milliseconds)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fixed_schedule_end_offset_ms: Option<i64>,

    /// Root seed for all derived randomness
    #[serde(skip_serializing_if = "Option::is_none")]
    pub random_seed: Option<u64>,
}

/// Inter-arrival distribution for rate mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestRateMode {
    /// Fixed interval `1/rate`
    Constant,
    /// Exponential inter-arrivals `-ln(U)/rate`
    #[default]
    Poisson,
}

/// Load generation options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadConfig {
    /// Maximum outstanding credits. Drives issuance in concurrency mode;
    /// acts as an optional cap in rate mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,

    /// Target request rate (requests/second); concurrency-only when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_rate: Option<f64>,

    /// Inter-arrival distribution for `request_rate`
    pub request_rate_mode: RequestRateMode,

    /// Stop after this many profiling credits
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_count: Option<u64>,

    /// Stop issuing credits after this long
    #[serde(skip_serializing_if = "Option::is_none")]
    pub benchmark_duration: Option<Duration>,

    /// How long in-flight requests may drain after the stop condition
    pub grace_period: Duration,

    /// Credits tagged warmup before profiling begins
    pub warmup_request_count: u64,

    /// Percentage of credits to cancel mid-flight, in (0, 100]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancellation_rate: Option<f64>,

    /// Delay from request start to the cancellation
    pub cancellation_delay: Duration,

    /// Bucket profiling records into wall-clock windows of this length
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slice_duration: Option<Duration>,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            concurrency: None,
            request_rate: None,
            request_rate_mode: RequestRateMode::default(),
            request_count: Some(100),
            benchmark_duration: None,
            grace_period: Duration::from_secs(30),
            warmup_request_count: 0,
            cancellation_rate: None,
            cancellation_delay: Duration::ZERO,
            slice_duration: None,
        }
    }
}

/// Synthetic conversation shape
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    /// Number of conversations to materialize
    pub num: usize,

    /// Mean turns per conversation
    pub turn_mean: f64,

    /// Standard deviation of turns per conversation
    pub turn_stddev: f64,

    /// Mean think-time between turns (milliseconds)
    pub turn_delay_mean: f64,

    /// Standard deviation of think-time (milliseconds)
    pub turn_delay_stddev: f64,

    /// Scale factor applied to sampled delays
    pub turn_delay_ratio: f64,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            num: 100,
            turn_mean: 1.0,
            turn_stddev: 0.0,
            turn_delay_mean: 0.0,
            turn_delay_stddev: 0.0,
            turn_delay_ratio: 1.0,
        }
    }
}

/// Prompt and generation length targets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LengthConfig {
    /// Mean input sequence length (tokens)
    pub isl_mean: f64,

    /// Standard deviation of input sequence length
    pub isl_stddev: f64,

    /// Mean output sequence length (tokens)
    pub osl_mean: f64,

    /// Standard deviation of output sequence length
    pub osl_stddev: f64,

    /// `(isl,osl):prob[:stddev]` buckets, e.g. `"256,128:60;1024,256:40"`;
    /// overrides the mean/stddev fields when present
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence_distribution: Option<String>,

    /// Number of distinct shared prefixes to cycle through
    pub prompt_prefix_pool_size: usize,

    /// Length of each shared prefix (tokens)
    pub prompt_prefix_length: usize,
}

impl Default for LengthConfig {
    fn default() -> Self {
        Self {
            isl_mean: 128.0,
            isl_stddev: 0.0,
            osl_mean: 128.0,
            osl_stddev: 0.0,
            sequence_distribution: None,
            prompt_prefix_pool_size: 0,
            prompt_prefix_length: 0,
        }
    }
}

/// Artifact output options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Directory artifacts are written under
    pub artifact_dir: PathBuf,

    /// Run subdirectory name; derived from the model when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_name: Option<String>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            artifact_dir: PathBuf::from("artifacts"),
            run_name: None,
        }
    }
}

/// Service topology sizing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Upper bound on worker tasks; derived from CPU count when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers_max: Option<usize>,

    /// Record processor tasks
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_processors: Option<usize>,
}

/// One goodput SLO: a record metric that must stay at or below a threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SloPredicate {
    /// Record metric tag, e.g. `time_to_first_token`
    pub tag: String,
    /// Inclusive upper bound in the metric's base unit
    pub threshold: f64,
}

/// Full user-facing run configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserConfig {
    /// Endpoint and transport
    pub endpoint: EndpointConfig,
    /// Dataset input
    pub input: InputConfig,
    /// Load generation
    pub load: LoadConfig,
    /// Synthetic conversation shape
    pub conversation: ConversationConfig,
    /// Prompt and generation lengths
    pub lengths: LengthConfig,
    /// Artifact output
    pub output: OutputConfig,
    /// Service sizing
    pub service: ServiceConfig,
    /// Goodput SLO predicates (empty disables goodput)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub goodput: Vec<SloPredicate>,

    /// Prefer the server's `usage` block over tokenizer counts for output
    /// token metrics. Tokenizer counts win by default.
    #[serde(default)]
    pub prefer_usage_token_counts: bool,
}

/// The traffic mode resolved from a validated configuration
#[derive(Debug, Clone, PartialEq)]
pub enum TrafficMode {
    /// Maintain at most `concurrency` outstanding credits
    Concurrency,
    /// Timed inter-arrivals with an optional concurrency cap
    Rate {
        /// Requests per second
        rate: f64,
        /// Constant or Poisson inter-arrivals
        mode: RequestRateMode,
    },
    /// Replay the dataset's timestamps
    FixedSchedule,
}

impl UserConfig {
    /// Validate the configuration; all services rely on this having passed.
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.model.is_empty() {
            return Err(Error::Config("a model name is required".into()));
        }
        if self.load.concurrency == Some(0) {
            return Err(Error::Config("concurrency must be at least 1".into()));
        }
        if let Some(rate) = self.load.request_rate {
            if rate <= 0.0 {
                return Err(Error::Config("request rate must be positive".into()));
            }
            if self.input.fixed_schedule {
                return Err(Error::Config(
                    "request-rate cannot be combined with fixed-schedule".into(),
                ));
            }
        }
        if self.input.fixed_schedule {
            if self.input.file.is_none() {
                return Err(Error::Config(
                    "fixed-schedule requires an input file with timestamps".into(),
                ));
            }
            if self.load.warmup_request_count > 0 {
                return Err(Error::Config(
                    "warmup requests are not supported in fixed-schedule mode".into(),
                ));
            }
        }
        if let Some(count) = self.load.request_count {
            if count == 0 {
                return Err(Error::Config("request count must be at least 1".into()));
            }
        }
        if let (Some(slice), Some(duration)) =
            (self.load.slice_duration, self.load.benchmark_duration)
        {
            if slice >= duration {
                return Err(Error::Config(
                    "slice-duration must be shorter than benchmark-duration".into(),
                ));
            }
        }
        if self.load.slice_duration.is_some_and(|d| d.is_zero()) {
            return Err(Error::Config("slice-duration must be positive".into()));
        }
        if let Some(rate) = self.load.cancellation_rate {
            if !(0.0..=100.0).contains(&rate) {
                return Err(Error::Config(
                    "request-cancellation-rate must be within [0, 100]".into(),
                ));
            }
        }
        if self.endpoint.streaming && !self.endpoint.endpoint_type.supports_streaming() {
            return Err(Error::Config(format!(
                "endpoint type '{}' does not support streaming",
                self.endpoint.endpoint_type
            )));
        }
        if self.input.custom_dataset_type.is_some() && self.input.file.is_none() {
            return Err(Error::Config(
                "custom-dataset-type requires an input file".into(),
            ));
        }
        for (name, value) in [
            ("conversation-turn-stddev", self.conversation.turn_stddev),
            ("conversation-turn-delay-stddev", self.conversation.turn_delay_stddev),
            ("conversation-turn-delay-ratio", self.conversation.turn_delay_ratio),
            ("isl-stddev", self.lengths.isl_stddev),
            ("osl-stddev", self.lengths.osl_stddev),
        ] {
            if value < 0.0 {
                return Err(Error::Config(format!("{name} must be non-negative")));
            }
        }
        for slo in &self.goodput {
            if slo.threshold < 0.0 {
                return Err(Error::Config(format!(
                    "goodput threshold for '{}' must be non-negative",
                    slo.tag
                )));
            }
        }
        Ok(())
    }

    /// Resolve the traffic mode from the load/input sections
    pub fn traffic_mode(&self) -> TrafficMode {
        if self.input.fixed_schedule {
            TrafficMode::FixedSchedule
        } else if let Some(rate) = self.load.request_rate {
            TrafficMode::Rate {
                rate,
                mode: self.load.request_rate_mode,
            }
        } else {
            TrafficMode::Concurrency
        }
    }

    /// Maximum outstanding credits in concurrency mode
    pub fn concurrency_limit(&self) -> usize {
        self.load.concurrency.unwrap_or(1)
    }

    /// Number of worker tasks to spawn.
    ///
    /// Defaults to `min(concurrency, floor(cpus * 0.75) - 1)` capped at 32;
    /// a user-provided `workers_max` is still capped by concurrency.
    pub fn worker_count(&self, cpus: usize) -> usize {
        let by_cpu = ((cpus as f64 * 0.75).floor() as usize).saturating_sub(1);
        let concurrency = self.load.concurrency.unwrap_or(usize::MAX);
        let default = concurrency.min(by_cpu).clamp(1, 32);
        match self.service.workers_max {
            Some(user) => user.min(concurrency).max(1),
            None => default,
        }
    }

    /// Number of record processor tasks to spawn
    pub fn processor_count(&self) -> usize {
        self.service.record_processors.unwrap_or(2).max(1)
    }

    /// Run subdirectory name under the artifact directory
    pub fn run_name(&self) -> String {
        match &self.output.run_name {
            Some(name) => name.clone(),
            None => self
                .endpoint
                .model
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
                .collect(),
        }
    }

    /// Parse a goodput flag value such as `"time_to_first_token:100 inter_token_latency:3.4"`
    pub fn parse_goodput(spec: &str) -> Result<Vec<SloPredicate>> {
        let mut slos = Vec::new();
        for part in spec.split_whitespace() {
            let (tag, value) = part.split_once(':').ok_or_else(|| {
                Error::Config(format!("goodput entry '{part}' is not of the form tag:value"))
            })?;
            let threshold: f64 = value.parse().map_err(|_| {
                Error::Config(format!("goodput threshold '{value}' is not a number"))
            })?;
            slos.push(SloPredicate {
                tag: tag.to_string(),
                threshold,
            });
        }
        Ok(slos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> UserConfig {
        UserConfig {
            endpoint: EndpointConfig {
                model: "test-model".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn test_rate_with_fixed_schedule_rejected() {
        let mut config = base_config();
        config.load.request_rate = Some(10.0);
        config.input.fixed_schedule = true;
        config.input.file = Some(PathBuf::from("trace.jsonl"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_slice_longer_than_duration_rejected() {
        let mut config = base_config();
        config.load.benchmark_duration = Some(Duration::from_secs(10));
        config.load.slice_duration = Some(Duration::from_secs(10));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_streaming_embeddings_rejected() {
        let mut config = base_config();
        config.endpoint.endpoint_type = EndpointType::Embeddings;
        config.endpoint.streaming = true;
        assert!(config.validate().is_err());

        config.endpoint.streaming = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cancellation_rate_bounds() {
        let mut config = base_config();
        config.load.cancellation_rate = Some(150.0);
        assert!(config.validate().is_err());
        config.load.cancellation_rate = Some(100.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_traffic_mode_resolution() {
        let mut config = base_config();
        assert_eq!(config.traffic_mode(), TrafficMode::Concurrency);

        config.load.request_rate = Some(50.0);
        assert!(matches!(
            config.traffic_mode(),
            TrafficMode::Rate { rate, .. } if rate == 50.0
        ));

        config.load.request_rate = None;
        config.input.fixed_schedule = true;
        assert_eq!(config.traffic_mode(), TrafficMode::FixedSchedule);
    }

    #[test]
    fn test_worker_count_default_formula() {
        let mut config = base_config();
        config.load.concurrency = Some(100);
        // floor(16 * 0.75) - 1 = 11
        assert_eq!(config.worker_count(16), 11);
        // capped at 32 on large machines
        assert_eq!(config.worker_count(128), 32);
        // capped by concurrency
        config.load.concurrency = Some(2);
        assert_eq!(config.worker_count(16), 2);
    }

    #[test]
    fn test_worker_count_user_override_capped() {
        let mut config = base_config();
        config.load.concurrency = Some(4);
        config.service.workers_max = Some(64);
        assert_eq!(config.worker_count(16), 4);
    }

    #[test]
    fn test_concurrency_limit_defaults_to_one() {
        let config = base_config();
        assert_eq!(config.concurrency_limit(), 1);
    }

    #[test]
    fn test_parse_goodput() {
        let slos =
            UserConfig::parse_goodput("time_to_first_token:100 inter_token_latency:3.4").unwrap();
        assert_eq!(slos.len(), 2);
        assert_eq!(slos[0].tag, "time_to_first_token");
        assert_eq!(slos[1].threshold, 3.4);

        assert!(UserConfig::parse_goodput("no-colon").is_err());
        assert!(UserConfig::parse_goodput("ttft:abc").is_err());
    }

    #[test]
    fn test_run_name_sanitizes_model() {
        let mut config = base_config();
        config.endpoint.model = "org/model:v1".to_string();
        assert_eq!(config.run_name(), "org-model-v1");
    }
}
