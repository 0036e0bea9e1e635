//! Artifact writers for benchmark results
//!
//! Everything lands under `artifact_dir/<run_name>/`:
//!
//! - `inputs.json`: the formatted request payloads per session, written
//!   from the finalized dataset (before any request is sent), so it is
//!   byte-identical across runs for a fixed seed and configuration
//! - `profile_export.jsonl`: one processed record per line
//!   (metadata / metrics / error)
//! - `profile_export_summary.json`: final statistics plus the run
//!   configuration
//! - `profile_export_summary.csv`: one row per (metric, stat)
//! - `profile_export_timeslices.{csv,json}`: tidy per-window statistics,
//!   when slicing was enabled

#![warn(clippy::all)]

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;

use inferload_core::aggregator::ProfileSummary;
use inferload_core::client::RequestCodec;
use inferload_core::config::UserConfig;
use inferload_core::error::{Error, Result};
use inferload_core::metrics::{self, MetricValue};
use inferload_core::model::Conversation;

/// Writes the artifact set for one run
pub struct ArtifactWriter {
    run_dir: PathBuf,
}

impl ArtifactWriter {
    /// Create the run directory under the artifact directory
    pub fn new(artifact_dir: &Path, run_name: &str) -> Result<Self> {
        let run_dir = artifact_dir.join(run_name);
        std::fs::create_dir_all(&run_dir)?;
        Ok(Self { run_dir })
    }

    /// The directory artifacts are written into
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Write `inputs.json` from the finalized dataset.
    ///
    /// Payloads are formatted per turn without response history, exactly
    /// as the dataset defines them, which keeps the file independent of
    /// worker count and scheduling.
    pub fn write_inputs(
        &self,
        conversations: &[Arc<Conversation>],
        codec: &dyn RequestCodec,
        model: &str,
        streaming: bool,
    ) -> Result<PathBuf> {
        let data: Vec<serde_json::Value> = conversations
            .iter()
            .map(|conversation| {
                let payloads: Vec<serde_json::Value> = conversation
                    .turns
                    .iter()
                    .map(|turn| {
                        codec.format(
                            turn,
                            &[],
                            turn.model.as_deref().unwrap_or(model),
                            streaming && codec.supports_streaming(),
                        )
                    })
                    .collect();
                json!({
                    "session_id": conversation.id,
                    "payloads": payloads,
                })
            })
            .collect();

        let path = self.run_dir.join("inputs.json");
        write_json_file(&path, &json!({ "data": data }))?;
        Ok(path)
    }

    /// Write `profile_export.jsonl`: one record per line
    pub fn write_records_jsonl(&self, summary: &ProfileSummary) -> Result<PathBuf> {
        let path = self.run_dir.join("profile_export.jsonl");
        let mut writer = BufWriter::new(File::create(&path)?);
        for record in &summary.records {
            let metrics: serde_json::Map<String, serde_json::Value> = record
                .values
                .iter()
                .map(|(tag, value)| {
                    let unit = metrics::spec(tag).map(|spec| spec.unit).unwrap_or("");
                    let value = match value {
                        MetricValue::Scalar(v) => json!(v),
                        MetricValue::Series(vs) => json!(vs),
                    };
                    (tag.clone(), json!({"value": value, "unit": unit}))
                })
                .collect();
            let line = json!({
                "metadata": record.metadata,
                "metrics": metrics,
                "error": record.error,
            });
            serde_json::to_writer(&mut writer, &line)
                .map_err(|e| Error::Internal(format!("record serialization failed: {e}")))?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(path)
    }

    /// Write `profile_export_summary.json`: final stats plus run config
    pub fn write_summary_json(
        &self,
        summary: &ProfileSummary,
        config: &UserConfig,
    ) -> Result<PathBuf> {
        #[derive(Serialize)]
        struct SummaryFile<'a> {
            config: &'a UserConfig,
            duration_secs: f64,
            duration_measurement: &'a str,
            completed: u64,
            errors: u64,
            warmup_records: u64,
            was_aborted: bool,
            metrics: &'a [inferload_core::aggregator::MetricSummaryEntry],
            error_summary: &'a [inferload_core::aggregator::ErrorSummaryEntry],
        }

        let path = self.run_dir.join("profile_export_summary.json");
        write_json_file(
            &path,
            &SummaryFile {
                config,
                duration_secs: summary.duration_secs,
                duration_measurement: &summary.duration_measurement,
                completed: summary.completed,
                errors: summary.errors,
                warmup_records: summary.warmup_records,
                was_aborted: summary.was_aborted,
                metrics: &summary.results,
                error_summary: &summary.error_summary,
            },
        )?;
        Ok(path)
    }

    /// Write `profile_export_summary.csv`: one row per (metric, stat)
    pub fn write_summary_csv(&self, summary: &ProfileSummary) -> Result<PathBuf> {
        let path = self.run_dir.join("profile_export_summary.csv");
        let mut writer = csv::Writer::from_path(&path)
            .map_err(|e| Error::Internal(format!("cannot create {}: {e}", path.display())))?;
        writer
            .write_record(["Metric", "Unit", "Stat", "Value"])
            .map_err(csv_error)?;

        for entry in &summary.results {
            match (&entry.stats, entry.total) {
                (Some(stats), _) => {
                    for (stat, value) in stats.entries() {
                        let value = format_value(value);
                        writer
                            .write_record([
                                entry.tag.as_str(),
                                entry.unit.as_str(),
                                stat,
                                value.as_str(),
                            ])
                            .map_err(csv_error)?;
                    }
                }
                (None, Some(total)) => {
                    let total = format_value(total);
                    writer
                        .write_record([
                            entry.tag.as_str(),
                            entry.unit.as_str(),
                            "total",
                            total.as_str(),
                        ])
                        .map_err(csv_error)?;
                }
                (None, None) => {}
            }
        }
        writer.flush()?;
        Ok(path)
    }

    /// Write the timeslice artifacts; no-op when slicing was disabled
    pub fn write_timeslices(&self, summary: &ProfileSummary) -> Result<Vec<PathBuf>> {
        let Some(timeslices) = &summary.timeslices else {
            return Ok(Vec::new());
        };

        let json_path = self.run_dir.join("profile_export_timeslices.json");
        write_json_file(&json_path, timeslices)?;

        let csv_path = self.run_dir.join("profile_export_timeslices.csv");
        let mut writer = csv::Writer::from_path(&csv_path)
            .map_err(|e| Error::Internal(format!("cannot create {}: {e}", csv_path.display())))?;
        writer
            .write_record(["Timeslice", "Metric", "Unit", "Stat", "Value"])
            .map_err(csv_error)?;
        for slice in timeslices {
            let index = slice.index.to_string();
            for metric in &slice.metrics {
                for (stat, value) in metric.stats.entries() {
                    let value = format_value(value);
                    writer
                        .write_record([
                            index.as_str(),
                            metric.tag.as_str(),
                            metric.unit.as_str(),
                            stat,
                            value.as_str(),
                        ])
                        .map_err(csv_error)?;
                }
            }
        }
        writer.flush()?;

        Ok(vec![csv_path, json_path])
    }

    /// Write every post-run artifact, returning the written paths
    pub fn write_results(
        &self,
        summary: &ProfileSummary,
        config: &UserConfig,
    ) -> Result<Vec<PathBuf>> {
        let mut paths = vec![
            self.write_records_jsonl(summary)?,
            self.write_summary_json(summary, config)?,
            self.write_summary_csv(summary)?,
        ];
        paths.extend(self.write_timeslices(summary)?);
        tracing::info!(run_dir = %self.run_dir.display(), artifacts = paths.len(), "artifacts written");
        Ok(paths)
    }
}

fn write_json_file<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, value)
        .map_err(|e| Error::Internal(format!("cannot serialize {}: {e}", path.display())))?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

fn format_value(value: f64) -> String {
    format!("{value:.6}")
}

fn csv_error(error: csv::Error) -> Error {
    Error::Internal(format!("CSV write failed: {error}"))
}
