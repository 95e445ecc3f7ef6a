use crate::types::RankedReport;
use ::time::{format_description::well_known, OffsetDateTime};
use anyhow::{Context, Result};
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

/// How the ranked shortlist is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// One IP per line.
    #[default]
    Text,
    /// `IP<TAB>Nms` per line.
    Delay,
    /// Pretty JSON report.
    Json,
}

/// Open the destination up front so a bad path fails before any probing.
pub fn open_destination(path: Option<&Path>) -> Result<Box<dyn Write + Send>> {
    match path {
        Some(p) => {
            let file = File::create(p)
                .with_context(|| format!("failed to create output {}", p.display()))?;
            Ok(Box::new(io::BufWriter::new(file)))
        }
        None => Ok(Box::new(io::stdout())),
    }
}

/// Write the report. An empty shortlist writes nothing at all.
pub fn write_report<W: Write + ?Sized>(
    writer: &mut W,
    format: OutputFormat,
    report: &RankedReport,
) -> io::Result<()> {
    if report.entries.is_empty() {
        return Ok(());
    }
    match format {
        OutputFormat::Text => {
            for e in &report.entries {
                writeln!(writer, "{}", e.ip)?;
            }
        }
        OutputFormat::Delay => {
            for e in &report.entries {
                writeln!(writer, "{:<15}\t{}ms", e.ip.to_string(), e.delay_ms)?;
            }
        }
        OutputFormat::Json => {
            serde_json::to_writer_pretty(&mut *writer, report)?;
            writeln!(writer)?;
        }
    }
    writer.flush()
}

pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
