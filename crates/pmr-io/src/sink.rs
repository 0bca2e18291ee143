//! # Result Sinks
//!
//! Where verdicts go. A sink is selected by name and verbosity at startup
//! and fed every [`Record`] in generation order, then the final
//! [`RunReport`].
//!
//! Passing verdicts are emitted at `info`, failing ones at `warning`.

use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::report::{Record, RunReport};

/// Verbosity, lowest first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

impl OutputLevel {
    pub fn of(record: &Record) -> Self {
        if record.verdict.passed {
            Self::Info
        } else {
            Self::Warning
        }
    }
}

impl fmt::Display for OutputLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        };
        f.write_str(name)
    }
}

impl FromStr for OutputLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warning" | "warn" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown output level '{}'", other)),
        }
    }
}

/// Built-in sink kinds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    /// Human-readable lines on stdout.
    #[default]
    Print,
    /// Human-readable lines in a file.
    File,
    /// One JSON object per line, to a file or stdout.
    Json,
}

impl FromStr for SinkKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "print" => Ok(Self::Print),
            "file" => Ok(Self::File),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown output type '{}'", other)),
        }
    }
}

/// Consumer of result records.
pub trait ResultSink: Send {
    fn emit(&mut self, record: &Record) -> io::Result<()>;

    /// Called once after the last record.
    fn finish(&mut self, _report: &RunReport) -> io::Result<()> {
        Ok(())
    }
}

/// Build the sink for `kind`. `output` is required for [`SinkKind::File`].
pub fn open_sink(
    kind: SinkKind,
    output: Option<&Path>,
    level: OutputLevel,
) -> io::Result<Box<dyn ResultSink>> {
    let sink: Box<dyn ResultSink> = match (kind, output) {
        (SinkKind::Print, _) => Box::new(TextSink::new(io::stdout(), level)),
        (SinkKind::File, Some(path)) => {
            Box::new(TextSink::new(BufWriter::new(File::create(path)?), level))
        }
        (SinkKind::File, None) => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "the file sink needs an output path",
            ))
        }
        (SinkKind::Json, Some(path)) => {
            Box::new(JsonSink::new(BufWriter::new(File::create(path)?), level))
        }
        (SinkKind::Json, None) => Box::new(JsonSink::new(io::stdout(), level)),
    };
    Ok(sink)
}

// =============================================================================
// Text
// =============================================================================

/// `[LEVEL] PASS|FAIL <descriptor>: <message>` lines.
pub struct TextSink<W> {
    out: W,
    level: OutputLevel,
}

impl<W: Write + Send> TextSink<W> {
    pub fn new(out: W, level: OutputLevel) -> Self {
        Self { out, level }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> ResultSink for TextSink<W> {
    fn emit(&mut self, record: &Record) -> io::Result<()> {
        let level = OutputLevel::of(record);
        if level < self.level {
            return Ok(());
        }
        let outcome = if record.verdict.passed { "PASS" } else { "FAIL" };
        write!(self.out, "[{}] {} {}", level, outcome, record.descriptor)?;
        if let Some(message) = &record.verdict.message {
            write!(self.out, ": {}", message)?;
        }
        if let Some(image) = &record.descriptor.image {
            write!(self.out, " (image kept at {})", image.display())?;
        }
        writeln!(self.out)
    }

    fn finish(&mut self, report: &RunReport) -> io::Result<()> {
        if OutputLevel::Info >= self.level {
            writeln!(self.out, "[{}] {}", OutputLevel::Info, report)?;
        }
        self.out.flush()
    }
}

// =============================================================================
// JSON lines
// =============================================================================

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum JsonLine<'a> {
    Verdict {
        level: OutputLevel,
        #[serde(flatten)]
        record: &'a Record,
    },
    Summary {
        #[serde(flatten)]
        report: &'a RunReport,
    },
}

/// One JSON object per record, then a summary object.
pub struct JsonSink<W> {
    out: W,
    level: OutputLevel,
}

impl<W: Write + Send> JsonSink<W> {
    pub fn new(out: W, level: OutputLevel) -> Self {
        Self { out, level }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn write_line(&mut self, line: &JsonLine<'_>) -> io::Result<()> {
        serde_json::to_writer(&mut self.out, line)?;
        writeln!(self.out)
    }
}

impl<W: Write + Send> ResultSink for JsonSink<W> {
    fn emit(&mut self, record: &Record) -> io::Result<()> {
        let level = OutputLevel::of(record);
        if level < self.level {
            return Ok(());
        }
        self.write_line(&JsonLine::Verdict { level, record })
    }

    fn finish(&mut self, report: &RunReport) -> io::Result<()> {
        self.write_line(&JsonLine::Summary { report })?;
        self.out.flush()
    }
}

// =============================================================================
// In memory
// =============================================================================

/// Keeps every record. Used when embedding the engine.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub records: Vec<Record>,
    pub report: Option<RunReport>,
}

impl ResultSink for MemorySink {
    fn emit(&mut self, record: &Record) -> io::Result<()> {
        self.records.push(record.clone());
        Ok(())
    }

    fn finish(&mut self, report: &RunReport) -> io::Result<()> {
        self.report = Some(report.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::Verdict;
    use crate::report::PlanDescriptor;
    use pmr_core::EngineKind;

    fn record(sequence: usize, verdict: Verdict) -> Record {
        Record {
            sequence,
            descriptor: PlanDescriptor {
                region: 0,
                epoch: Some(1),
                engine: EngineKind::Partial,
                permutation: 1,
                prefix: 2,
                writes: 2,
                applied: vec![4, 2],
                marker: None,
                image: None,
            },
            verdict,
        }
    }

    #[test]
    fn test_level_ordering_and_parsing() {
        assert!(OutputLevel::Debug < OutputLevel::Info);
        assert!(OutputLevel::Warning < OutputLevel::Critical);
        assert_eq!("WARNING".parse::<OutputLevel>(), Ok(OutputLevel::Warning));
        assert!("loud".parse::<OutputLevel>().is_err());
    }

    #[test]
    fn test_text_sink_formats_failure() {
        let mut sink = TextSink::new(Vec::new(), OutputLevel::Info);
        sink.emit(&record(0, Verdict::fail("bad list"))).unwrap();
        let text = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(
            text,
            "[WARNING] FAIL region 0 epoch 1 permutation 1 prefix 2/2 (partial) order [4, 2]: bad list\n"
        );
    }

    #[test]
    fn test_text_sink_filters_by_level() {
        let mut sink = TextSink::new(Vec::new(), OutputLevel::Warning);
        sink.emit(&record(0, Verdict::pass())).unwrap();
        sink.emit(&record(1, Verdict::fail("x"))).unwrap();
        sink.finish(&RunReport::default()).unwrap();
        let text = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(text.lines().count(), 1);
        assert!(text.starts_with("[WARNING] FAIL"));
    }

    #[test]
    fn test_json_sink_lines() {
        let mut sink = JsonSink::new(Vec::new(), OutputLevel::Debug);
        sink.emit(&record(0, Verdict::pass())).unwrap();
        let mut report = RunReport::default();
        report.record(&record(0, Verdict::pass()));
        sink.finish(&report).unwrap();

        let text = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["type"], "verdict");
        assert_eq!(lines[0]["level"], "info");
        assert_eq!(lines[0]["descriptor"]["engine"], "partial");
        assert_eq!(lines[0]["verdict"]["passed"], true);
        assert_eq!(lines[1]["type"], "summary");
        assert_eq!(lines[1]["candidates"], 1);
    }

    #[test]
    fn test_file_sink_requires_path() {
        assert!(open_sink(SinkKind::File, None, OutputLevel::Info).is_err());
    }
}
