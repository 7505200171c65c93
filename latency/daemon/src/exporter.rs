//! Summary exporters
//!
//! Writes the final latency summary to a file as JSON or Prometheus text.

use crate::types::LatencySummary;
use anyhow::{bail, Context, Result};
use std::{
    fs::File,
    io::Write,
    path::{Path, PathBuf},
    str::FromStr,
};

/// Trait for summary exporters
pub trait MetricsExporter {
    /// Export a summary
    ///
    /// # Arguments
    ///
    /// * `summary` - Aggregated latency summary to export
    fn export(&self, summary: &LatencySummary) -> Result<()>;
}

/// Export format type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExporterType {
    /// JSON format
    Json,
    /// Prometheus text exposition format
    Prometheus,
}

impl FromStr for ExporterType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "json" => Ok(ExporterType::Json),
            "prometheus" | "prom" => Ok(ExporterType::Prometheus),
            _ => bail!("Unsupported format: {}. Use json or prometheus", s),
        }
    }
}

impl ExporterType {
    /// Build the exporter for this format writing to `output_path`
    pub fn exporter(self, output_path: PathBuf) -> Box<dyn MetricsExporter> {
        match self {
            ExporterType::Json => Box::new(JsonExporter::new(output_path, true)),
            ExporterType::Prometheus => Box::new(PrometheusExporter::new(output_path)),
        }
    }
}

fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    let mut file = File::create(path)
        .with_context(|| format!("Failed to create output file: {:?}", path))?;

    file.write_all(data)
        .with_context(|| format!("Failed to write to output file: {:?}", path))?;

    Ok(())
}

/// JSON exporter
pub struct JsonExporter {
    output_path: PathBuf,
    pretty: bool,
}

impl JsonExporter {
    pub fn new(output_path: PathBuf, pretty: bool) -> Self {
        Self {
            output_path,
            pretty,
        }
    }
}

impl MetricsExporter for JsonExporter {
    fn export(&self, summary: &LatencySummary) -> Result<()> {
        let json = if self.pretty {
            serde_json::to_string_pretty(summary)?
        } else {
            serde_json::to_string(summary)?
        };

        write_file(&self.output_path, json.as_bytes())
    }
}

/// Prometheus exporter
pub struct PrometheusExporter {
    output_path: PathBuf,
}

impl PrometheusExporter {
    pub fn new(output_path: PathBuf) -> Self {
        Self { output_path }
    }

    /// Render a summary in the Prometheus text format
    fn to_prometheus_format(summary: &LatencySummary) -> String {
        let mut output = String::new();
        let mode = summary.mode.name();

        output.push_str("# HELP pktlat_records_total Completed measurement records\n");
        output.push_str("# TYPE pktlat_records_total counter\n");
        output.push_str(&format!("pktlat_records_total{{mode=\"{}\"}} {}\n", mode, summary.total_records));
        output.push('\n');

        output.push_str("# HELP pktlat_duration_seconds Duration of the capture\n");
        output.push_str("# TYPE pktlat_duration_seconds gauge\n");
        output.push_str(&format!("pktlat_duration_seconds {}\n", summary.duration_seconds));
        output.push('\n');

        output.push_str("# HELP pktlat_latency_mean_milliseconds Mean latency per leg\n");
        output.push_str("# TYPE pktlat_latency_mean_milliseconds gauge\n");
        for leg in &summary.legs {
            output.push_str(&format!(
                "pktlat_latency_mean_milliseconds{{leg=\"{}\"}} {:.3}\n",
                leg.leg, leg.mean_ms
            ));
        }
        output.push('\n');

        output.push_str("# HELP pktlat_latency_samples_total Samples folded into the mean\n");
        output.push_str("# TYPE pktlat_latency_samples_total counter\n");
        for leg in &summary.legs {
            output.push_str(&format!("pktlat_latency_samples_total{{leg=\"{}\"}} {}\n", leg.leg, leg.samples));
        }
        output.push('\n');

        output.push_str("# HELP pktlat_latency_anomalies_total Negative latencies excluded from the mean\n");
        output.push_str("# TYPE pktlat_latency_anomalies_total counter\n");
        for leg in &summary.legs {
            output.push_str(&format!("pktlat_latency_anomalies_total{{leg=\"{}\"}} {}\n", leg.leg, leg.anomalies));
        }
        output.push('\n');

        let table = &summary.table;
        output.push_str("# HELP pktlat_table_events_total Correlation table counters\n");
        output.push_str("# TYPE pktlat_table_events_total counter\n");
        for (event, value) in [
            ("recorded", table.recorded),
            ("completed", table.completed),
            ("collisions", table.collisions),
            ("restarts", table.restarts),
            ("ignored", table.ignored),
        ] {
            output.push_str(&format!("pktlat_table_events_total{{event=\"{}\"}} {}\n", event, value));
        }
        output.push('\n');

        output.push_str("# HELP pktlat_driver_inputs_total Inputs read per capture point\n");
        output.push_str("# TYPE pktlat_driver_inputs_total counter\n");
        for driver in &summary.drivers {
            output.push_str(&format!("pktlat_driver_inputs_total{{driver=\"{}\"}} {}\n", escape_label(&driver.name), driver.inputs));
        }
        output.push('\n');

        output.push_str("# HELP pktlat_driver_parse_errors_total Inputs dropped as malformed\n");
        output.push_str("# TYPE pktlat_driver_parse_errors_total counter\n");
        for driver in &summary.drivers {
            output.push_str(&format!(
                "pktlat_driver_parse_errors_total{{driver=\"{}\"}} {}\n",
                escape_label(&driver.name),
                driver.parse_errors
            ));
        }
        output.push('\n');

        output
    }
}

/// Escape a label value for the Prometheus text format
fn escape_label(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            _ => escaped.push(c),
        }
    }
    escaped
}

impl MetricsExporter for PrometheusExporter {
    fn export(&self, summary: &LatencySummary) -> Result<()> {
        let prometheus_data = Self::to_prometheus_format(summary);
        write_file(&self.output_path, prometheus_data.as_bytes())
    }
}
