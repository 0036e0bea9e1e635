//! inferload - load generator and latency profiler for generative-AI
//! inference endpoints

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;

use inferload_core::aggregator::ProfileSummary;
use inferload_core::bus::{Event, MessageBus};
use inferload_core::config::UserConfig;
use inferload_core::context::RunContext;
use inferload_core::controller::Controller;
use inferload_core::error::Error;
use inferload_core::tokenizer::{HeuristicTokenizer, TokenizerRef};
use inferload_endpoints::HttpInferenceClient;
use inferload_export::ArtifactWriter;

mod cli;

/// Exit code for an interrupted run
const EXIT_INTERRUPTED: u8 = 130;

fn main() -> ExitCode {
    let cli = cli::Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        cli::Commands::Profile(args) => {
            let config = match args.into_config() {
                Ok(config) => config,
                Err(error) => {
                    eprintln!("error: {error}");
                    return ExitCode::from(1);
                }
            };

            let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
                Ok(runtime) => runtime,
                Err(error) => {
                    eprintln!("error: failed to start runtime: {error}");
                    return ExitCode::from(2);
                }
            };
            runtime.block_on(run_profile(config))
        }
    }
}

async fn run_profile(config: UserConfig) -> ExitCode {
    let config = Arc::new(config);
    let ctx = RunContext::new(config.input.random_seed);
    let tokenizer: TokenizerRef = Arc::new(HeuristicTokenizer::from_corpus(
        inferload_dataset::synthetic_corpus(),
    ));

    // Materialize the dataset before anything else runs
    let pool = match inferload_dataset::build_pool(&config, &ctx, tokenizer.as_ref()) {
        Ok(pool) => pool,
        Err(error) => return fail(&error),
    };

    let codec = inferload_endpoints::codec_for(config.endpoint.endpoint_type);
    let writer = match ArtifactWriter::new(&config.output.artifact_dir, &config.run_name()) {
        Ok(writer) => writer,
        Err(error) => return fail(&error),
    };
    if let Err(error) = writer.write_inputs(
        pool.conversations(),
        codec.as_ref(),
        &config.endpoint.model,
        config.endpoint.streaming,
    ) {
        return fail(&error);
    }

    let client = match HttpInferenceClient::new(&config.endpoint, codec, ctx.clock()) {
        Ok(client) => Arc::new(client),
        Err(error) => return fail(&error),
    };

    let bus = Arc::new(MessageBus::default());
    let shutdown = CancellationToken::new();
    let interrupted = Arc::new(AtomicBool::new(false));

    // First Ctrl+C drains gracefully; a second one aborts the process
    {
        let shutdown = shutdown.clone();
        let interrupted = Arc::clone(&interrupted);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, draining in-flight requests");
                interrupted.store(true, Ordering::SeqCst);
                shutdown.cancel();
            }
            if tokio::signal::ctrl_c().await.is_ok() {
                std::process::exit(EXIT_INTERRUPTED as i32);
            }
        });
    }

    let progress = spawn_progress_display(&bus, &config);

    let controller = Controller::new(
        Arc::clone(&config),
        ctx.clone(),
        Arc::clone(&bus),
        shutdown.clone(),
    );
    let outcome = match controller.run(client, tokenizer, Box::new(pool)).await {
        Ok(outcome) => outcome,
        Err(error) => return fail(&error),
    };
    progress.abort();

    if let Err(error) = writer.write_results(&outcome.summary, &config) {
        return fail(&error);
    }
    print_summary(&outcome.summary);
    println!("artifacts: {}", writer.run_dir().display());

    if interrupted.load(Ordering::SeqCst) {
        ExitCode::from(EXIT_INTERRUPTED)
    } else if outcome.aborted {
        ExitCode::from(2)
    } else {
        ExitCode::SUCCESS
    }
}

fn fail(error: &Error) -> ExitCode {
    tracing::error!(error = %error, "run failed");
    eprintln!("error: {error}");
    ExitCode::from(error.exit_code() as u8)
}

/// Live progress bar fed by aggregator events
fn spawn_progress_display(
    bus: &Arc<MessageBus>,
    config: &Arc<UserConfig>,
) -> tokio::task::JoinHandle<()> {
    let mut events = bus.subscribe();
    let expected = config.load.request_count;
    tokio::spawn(async move {
        let bar = match expected {
            Some(total) => {
                let bar = ProgressBar::new(total);
                bar.set_style(
                    ProgressStyle::default_bar()
                        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                        .expect("static template is valid")
                        .progress_chars("#>-"),
                );
                bar
            }
            None => {
                let bar = ProgressBar::new_spinner();
                bar.set_style(
                    ProgressStyle::default_spinner()
                        .template("{spinner:.green} [{elapsed_precise}] {pos} requests {msg}")
                        .expect("static template is valid"),
                );
                bar
            }
        };

        while let Ok(event) = events.recv().await {
            match event {
                Event::Progress(snapshot) => {
                    bar.set_position(snapshot.completed + snapshot.errors);
                    bar.set_message(format!(
                        "{} | p50 {:.1} ms | p99 {:.1} ms | errors {}",
                        snapshot.phase,
                        snapshot.p50_latency_ms,
                        snapshot.p99_latency_ms,
                        snapshot.errors,
                    ));
                }
                Event::PhaseChanged { phase } => {
                    bar.set_message(phase.to_string());
                }
                _ => {}
            }
        }
        bar.finish_and_clear();
    })
}

/// Console report: metric table plus the API error summary
fn print_summary(summary: &ProfileSummary) {
    println!();
    println!(
        "{:<36} {:>12} {:>12} {:>12} {:>12} {:>12}",
        "Metric", "mean", "p50", "p90", "p99", "max"
    );
    for entry in &summary.results {
        match (&entry.stats, entry.total) {
            (Some(stats), _) => {
                println!(
                    "{:<36} {:>12.3} {:>12.3} {:>12.3} {:>12.3} {:>12.3}",
                    format!("{} ({})", entry.header, entry.unit),
                    stats.mean,
                    stats.p50,
                    stats.p90,
                    stats.p99,
                    stats.max,
                );
            }
            (None, Some(total)) => {
                println!(
                    "{:<36} {:>12.3}",
                    format!("{} ({})", entry.header, entry.unit),
                    total,
                );
            }
            (None, None) => {}
        }
    }
    println!(
        "\ncompleted {} requests ({} errors, {} warmup) in {:.2}s",
        summary.completed, summary.errors, summary.warmup_records, summary.duration_secs
    );

    if !summary.error_summary.is_empty() {
        println!("\nAPI Error Summary:");
        for entry in &summary.error_summary {
            println!("  {:>6}x {}", entry.count, entry.error);
        }
    }
}
