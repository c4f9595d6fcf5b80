//! Output sinks for carbs-on-board series.
//!
//! The core never decides the boundary format; callers pick a sink and hand
//! it the finished series.

use crate::types::CobPoint;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::str::FromStr;

/// Sink trait for writing a finished COB series
pub trait CobSink {
    fn write_series(&mut self, points: &[CobPoint]) -> Result<()>;
}

/// Supported output formats
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Json,
    Csv,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Json => f.write_str("json"),
            OutputFormat::Csv => f.write_str("csv"),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "csv" => Ok(OutputFormat::Csv),
            other => Err(Error::InvalidParameter(format!(
                "unknown output format: {}",
                other
            ))),
        }
    }
}

/// Pretty-printed JSON array of `{time, remainingGrams}`
pub struct JsonSink<W: Write> {
    writer: W,
}

impl<W: Write> JsonSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> CobSink for JsonSink<W> {
    fn write_series(&mut self, points: &[CobPoint]) -> Result<()> {
        serde_json::to_writer_pretty(&mut self.writer, points)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        tracing::debug!("Wrote {} points as JSON", points.len());
        Ok(())
    }
}

/// A row in the CSV output
#[derive(Debug, Serialize)]
struct CsvRow {
    time: String,
    remaining_grams: f64,
}

impl From<&CobPoint> for CsvRow {
    fn from(point: &CobPoint) -> Self {
        CsvRow {
            time: point.time.to_rfc3339(),
            remaining_grams: point.remaining_grams,
        }
    }
}

/// CSV with a `time,remaining_grams` header
pub struct CsvSink<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> CsvSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: csv::WriterBuilder::new().has_headers(true).from_writer(writer),
        }
    }

    pub fn into_inner(self) -> Result<W> {
        self.writer
            .into_inner()
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))
    }
}

impl<W: Write> CobSink for CsvSink<W> {
    fn write_series(&mut self, points: &[CobPoint]) -> Result<()> {
        for point in points {
            self.writer.serialize(CsvRow::from(point))?;
        }
        self.writer.flush()?;
        tracing::debug!("Wrote {} points as CSV", points.len());
        Ok(())
    }
}

/// Boxed sink for the requested format
pub fn sink_for<'w, W: Write + 'w>(format: OutputFormat, writer: W) -> Box<dyn CobSink + 'w> {
    match format {
        OutputFormat::Json => Box::new(JsonSink::new(writer)),
        OutputFormat::Csv => Box::new(CsvSink::new(writer)),
    }
}
