//! CLI argument parsing

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

use inferload_core::config::{
    CustomDatasetType, EndpointType, RequestRateMode, UserConfig,
};
use inferload_core::error::{Error, Result};

#[derive(Parser)]
#[command(name = "inferload")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Profile an inference endpoint
    Profile(ProfileArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EndpointTypeArg {
    Chat,
    Completions,
    Embeddings,
    Rankings,
}

impl From<EndpointTypeArg> for EndpointType {
    fn from(arg: EndpointTypeArg) -> Self {
        match arg {
            EndpointTypeArg::Chat => EndpointType::Chat,
            EndpointTypeArg::Completions => EndpointType::Completions,
            EndpointTypeArg::Embeddings => EndpointType::Embeddings,
            EndpointTypeArg::Rankings => EndpointType::Rankings,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RateModeArg {
    Constant,
    Poisson,
}

impl From<RateModeArg> for RequestRateMode {
    fn from(arg: RateModeArg) -> Self {
        match arg {
            RateModeArg::Constant => RequestRateMode::Constant,
            RateModeArg::Poisson => RequestRateMode::Poisson,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DatasetTypeArg {
    SingleTurn,
    MultiTurn,
    MooncakeTrace,
    RandomPool,
}

impl From<DatasetTypeArg> for CustomDatasetType {
    fn from(arg: DatasetTypeArg) -> Self {
        match arg {
            DatasetTypeArg::SingleTurn => CustomDatasetType::SingleTurn,
            DatasetTypeArg::MultiTurn => CustomDatasetType::MultiTurn,
            DatasetTypeArg::MooncakeTrace => CustomDatasetType::MooncakeTrace,
            DatasetTypeArg::RandomPool => CustomDatasetType::RandomPool,
        }
    }
}

/// Flags for the `profile` command
#[derive(Debug, Args)]
pub struct ProfileArgs {
    // ------------------------------------------------------------------
    // Endpoint
    // ------------------------------------------------------------------
    /// Model name sent in request payloads
    #[arg(long)]
    pub model: String,

    /// Base URL of the inference service
    #[arg(long, default_value = "http://localhost:8000")]
    pub url: String,

    /// Endpoint flavor
    #[arg(long, value_enum, default_value_t = EndpointTypeArg::Chat)]
    pub endpoint_type: EndpointTypeArg,

    /// Request streamed responses
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
    pub streaming: bool,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = 600.0)]
    pub request_timeout_seconds: f64,

    /// Bearer token for the Authorization header
    #[arg(long)]
    pub api_key: Option<String>,

    /// Extra header attached to every request, as `name:value` (repeatable)
    #[arg(long = "header", value_name = "NAME:VALUE")]
    pub headers: Vec<String>,

    // ------------------------------------------------------------------
    // Input
    // ------------------------------------------------------------------
    /// JSONL dataset file (synthetic generation when omitted)
    #[arg(long)]
    pub input_file: Option<PathBuf>,

    /// Format of --input-file
    #[arg(long, value_enum)]
    pub custom_dataset_type: Option<DatasetTypeArg>,

    /// Replay the dataset's timestamps instead of generating load
    #[arg(long)]
    pub fixed_schedule: bool,

    /// Subtract the first trace timestamp so replay starts immediately
    #[arg(long)]
    pub fixed_schedule_auto_offset: bool,

    /// Replay only timestamps at or after this offset (milliseconds)
    #[arg(long)]
    pub fixed_schedule_start_offset: Option<i64>,

    /// Replay only timestamps at or before this offset (milliseconds)
    #[arg(long)]
    pub fixed_schedule_end_offset: Option<i64>,

    /// Root seed for all derived randomness
    #[arg(long)]
    pub random_seed: Option<u64>,

    // ------------------------------------------------------------------
    // Load
    // ------------------------------------------------------------------
    /// Maximum outstanding requests
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Target request rate in requests/second
    #[arg(long)]
    pub request_rate: Option<f64>,

    /// Inter-arrival distribution for --request-rate
    #[arg(long, value_enum, default_value_t = RateModeArg::Poisson)]
    pub request_rate_mode: RateModeArg,

    /// Stop after this many profiling requests
    #[arg(long)]
    pub request_count: Option<u64>,

    /// Stop issuing requests after this many seconds
    #[arg(long)]
    pub benchmark_duration: Option<f64>,

    /// Seconds in-flight requests may drain after the stop condition
    #[arg(long, default_value_t = 30.0)]
    pub benchmark_grace_period: f64,

    /// Requests tagged warmup before profiling begins
    #[arg(long, default_value_t = 0)]
    pub warmup_request_count: u64,

    /// Percentage of requests to cancel mid-flight, in (0, 100]
    #[arg(long)]
    pub request_cancellation_rate: Option<f64>,

    /// Seconds from request start to the injected cancellation
    #[arg(long, default_value_t = 0.0)]
    pub request_cancellation_delay: f64,

    /// Bucket profiling records into windows of this many seconds
    #[arg(long)]
    pub slice_duration: Option<f64>,

    // ------------------------------------------------------------------
    // Conversation
    // ------------------------------------------------------------------
    /// Number of synthetic conversations to materialize
    #[arg(long, default_value_t = 100)]
    pub conversation_num: usize,

    /// Mean turns per conversation
    #[arg(long, default_value_t = 1.0)]
    pub conversation_turn_mean: f64,

    /// Standard deviation of turns per conversation
    #[arg(long, default_value_t = 0.0)]
    pub conversation_turn_stddev: f64,

    /// Mean think-time between turns (milliseconds)
    #[arg(long, default_value_t = 0.0)]
    pub conversation_turn_delay_mean: f64,

    /// Standard deviation of think-time (milliseconds)
    #[arg(long, default_value_t = 0.0)]
    pub conversation_turn_delay_stddev: f64,

    /// Scale factor applied to sampled think-times
    #[arg(long, default_value_t = 1.0)]
    pub conversation_turn_delay_ratio: f64,

    // ------------------------------------------------------------------
    // Lengths
    // ------------------------------------------------------------------
    /// Mean input sequence length (tokens)
    #[arg(long, default_value_t = 128.0)]
    pub isl_mean: f64,

    /// Standard deviation of input sequence length
    #[arg(long, default_value_t = 0.0)]
    pub isl_stddev: f64,

    /// Mean output sequence length (tokens)
    #[arg(long, default_value_t = 128.0)]
    pub osl_mean: f64,

    /// Standard deviation of output sequence length
    #[arg(long, default_value_t = 0.0)]
    pub osl_stddev: f64,

    /// Weighted (isl,osl) buckets, e.g. "256,128:60;1024,256:40"
    #[arg(long)]
    pub sequence_distribution: Option<String>,

    /// Number of distinct shared prompt prefixes to cycle through
    #[arg(long, default_value_t = 0)]
    pub prompt_prefix_pool_size: usize,

    /// Length of each shared prompt prefix (tokens)
    #[arg(long, default_value_t = 0)]
    pub prompt_prefix_length: usize,

    // ------------------------------------------------------------------
    // Output
    // ------------------------------------------------------------------
    /// Directory artifacts are written under
    #[arg(long, default_value = "artifacts")]
    pub artifact_dir: PathBuf,

    /// Run subdirectory name (derived from the model when omitted)
    #[arg(long)]
    pub run_name: Option<String>,

    // ------------------------------------------------------------------
    // Service
    // ------------------------------------------------------------------
    /// Upper bound on worker tasks
    #[arg(long)]
    pub workers_max: Option<usize>,

    /// Number of record processor tasks
    #[arg(long)]
    pub record_processors: Option<usize>,

    // ------------------------------------------------------------------
    // Goodput
    // ------------------------------------------------------------------
    /// SLO predicates, e.g. "time_to_first_token:100 inter_token_latency:3.4"
    #[arg(long)]
    pub goodput: Option<String>,

    /// Prefer the server-reported usage block over tokenizer counts
    #[arg(long)]
    pub prefer_usage_token_counts: bool,
}

impl ProfileArgs {
    /// Assemble and validate the run configuration
    pub fn into_config(self) -> Result<UserConfig> {
        let mut headers = BTreeMap::new();
        for header in &self.headers {
            let (name, value) = header.split_once(':').ok_or_else(|| {
                Error::Config(format!("header '{header}' is not of the form name:value"))
            })?;
            headers.insert(name.trim().to_string(), value.trim().to_string());
        }

        let mut config = UserConfig::default();
        config.endpoint.model = self.model;
        config.endpoint.url = self.url;
        config.endpoint.endpoint_type = self.endpoint_type.into();
        config.endpoint.streaming = self.streaming;
        config.endpoint.request_timeout = Duration::from_secs_f64(self.request_timeout_seconds);
        config.endpoint.api_key = self.api_key;
        config.endpoint.headers = headers;

        config.input.file = self.input_file;
        config.input.custom_dataset_type = self.custom_dataset_type.map(Into::into);
        config.input.fixed_schedule = self.fixed_schedule;
        config.input.fixed_schedule_auto_offset = self.fixed_schedule_auto_offset;
        config.input.fixed_schedule_start_offset_ms = self.fixed_schedule_start_offset;
        config.input.fixed_schedule_end_offset_ms = self.fixed_schedule_end_offset;
        config.input.random_seed = self.random_seed;

        config.load.concurrency = self.concurrency;
        config.load.request_rate = self.request_rate;
        config.load.request_rate_mode = self.request_rate_mode.into();
        config.load.request_count = self.request_count;
        config.load.benchmark_duration = self.benchmark_duration.map(Duration::from_secs_f64);
        config.load.grace_period = Duration::from_secs_f64(self.benchmark_grace_period);
        config.load.warmup_request_count = self.warmup_request_count;
        config.load.cancellation_rate = self.request_cancellation_rate;
        config.load.cancellation_delay = Duration::from_secs_f64(self.request_cancellation_delay);
        config.load.slice_duration = self.slice_duration.map(Duration::from_secs_f64);
        // Default stop condition: 100 requests, unless another condition
        // (duration or trace exhaustion) governs the run
        if config.load.request_count.is_none()
            && config.load.benchmark_duration.is_none()
            && !config.input.fixed_schedule
        {
            config.load.request_count = Some(100);
        }

        config.conversation.num = self.conversation_num;
        config.conversation.turn_mean = self.conversation_turn_mean;
        config.conversation.turn_stddev = self.conversation_turn_stddev;
        config.conversation.turn_delay_mean = self.conversation_turn_delay_mean;
        config.conversation.turn_delay_stddev = self.conversation_turn_delay_stddev;
        config.conversation.turn_delay_ratio = self.conversation_turn_delay_ratio;

        config.lengths.isl_mean = self.isl_mean;
        config.lengths.isl_stddev = self.isl_stddev;
        config.lengths.osl_mean = self.osl_mean;
        config.lengths.osl_stddev = self.osl_stddev;
        config.lengths.sequence_distribution = self.sequence_distribution;
        config.lengths.prompt_prefix_pool_size = self.prompt_prefix_pool_size;
        config.lengths.prompt_prefix_length = self.prompt_prefix_length;

        config.output.artifact_dir = self.artifact_dir;
        config.output.run_name = self.run_name;

        config.service.workers_max = self.workers_max;
        config.service.record_processors = self.record_processors;

        if let Some(goodput) = &self.goodput {
            config.goodput = UserConfig::parse_goodput(goodput)?;
        }
        config.prefer_usage_token_counts = self.prefer_usage_token_counts;

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> ProfileArgs {
        let mut argv = vec!["inferload", "profile"];
        argv.extend(args);
        match Cli::parse_from(argv).command {
            Commands::Profile(profile) => profile,
        }
    }

    #[test]
    fn test_minimal_invocation() {
        let config = parse(&["--model", "llama"]).into_config().unwrap();
        assert_eq!(config.endpoint.model, "llama");
        assert!(config.endpoint.streaming);
        // the default stop condition kicks in
        assert_eq!(config.load.request_count, Some(100));
    }

    #[test]
    fn test_rate_flags() {
        let config = parse(&[
            "--model", "m",
            "--request-rate", "50",
            "--request-rate-mode", "constant",
            "--request-count", "500",
            "--concurrency", "200",
        ])
        .into_config()
        .unwrap();
        assert_eq!(config.load.request_rate, Some(50.0));
        assert_eq!(config.load.request_rate_mode, RequestRateMode::Constant);
        assert_eq!(config.load.concurrency, Some(200));
    }

    #[test]
    fn test_duration_run_has_no_default_count() {
        let config = parse(&["--model", "m", "--benchmark-duration", "60"])
            .into_config()
            .unwrap();
        assert!(config.load.request_count.is_none());
        assert_eq!(
            config.load.benchmark_duration,
            Some(Duration::from_secs(60))
        );
    }

    #[test]
    fn test_goodput_parsing() {
        let config = parse(&["--model", "m", "--goodput", "time_to_first_token:100"])
            .into_config()
            .unwrap();
        assert_eq!(config.goodput.len(), 1);
        assert_eq!(config.goodput[0].threshold, 100.0);
    }

    #[test]
    fn test_invalid_combination_is_config_error() {
        let result = parse(&[
            "--model", "m",
            "--request-rate", "10",
            "--fixed-schedule",
            "--input-file", "trace.jsonl",
            "--custom-dataset-type", "mooncake-trace",
        ])
        .into_config();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_header_parsing() {
        let config = parse(&["--model", "m", "--header", "X-Env: staging"])
            .into_config()
            .unwrap();
        assert_eq!(config.endpoint.headers["X-Env"], "staging");

        assert!(parse(&["--model", "m", "--header", "garbage"])
            .into_config()
            .is_err());
    }

    #[test]
    fn test_streaming_can_be_disabled() {
        let config = parse(&["--model", "m", "--streaming", "false"])
            .into_config()
            .unwrap();
        assert!(!config.endpoint.streaming);
    }
}
