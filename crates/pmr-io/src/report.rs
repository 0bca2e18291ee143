//! Plan descriptors, result records and the per-run summary.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use pmr_core::EngineKind;

use crate::checker::Verdict;

/// Identifies the candidate behind a verdict, precisely enough to rebuild it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanDescriptor {
    pub region: usize,
    /// `None` when the whole region was reordered as one unit.
    pub epoch: Option<usize>,
    pub engine: EngineKind,
    pub permutation: u64,
    pub prefix: usize,
    /// Number of writes in the unit.
    pub writes: usize,
    /// Trace indices of the applied writes, in application order.
    pub applied: Vec<usize>,
    /// Most recent marker seen before the unit was dispatched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub marker: Option<String>,
    /// Scratch image kept for inspection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<PathBuf>,
}

impl fmt::Display for PlanDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "region {}", self.region)?;
        if let Some(epoch) = self.epoch {
            write!(f, " epoch {}", epoch)?;
        }
        write!(
            f,
            " permutation {} prefix {}/{} ({}) order {:?}",
            self.permutation, self.prefix, self.writes, self.engine, self.applied
        )?;
        if let Some(marker) = &self.marker {
            write!(f, " after '{}'", marker)?;
        }
        Ok(())
    }
}

/// One line of the result log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Record {
    /// Position in generation order, counted over the whole run.
    pub sequence: usize,
    pub descriptor: PlanDescriptor,
    pub verdict: Verdict,
}

/// Totals for a finished run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub regions: usize,
    pub epochs: usize,
    pub candidates: usize,
    pub passed: usize,
    pub failed: usize,
    /// Every failing record, in generation order.
    pub failures: Vec<Record>,
}

impl RunReport {
    pub fn record(&mut self, record: &Record) {
        self.candidates += 1;
        if record.verdict.passed {
            self.passed += 1;
        } else {
            self.failed += 1;
            self.failures.push(record.clone());
        }
    }

    /// `true` when every candidate passed.
    #[inline]
    pub fn is_consistent(&self) -> bool {
        self.failed == 0
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} candidate(s) from {} region(s), {} epoch(s): {} passed, {} failed",
            self.candidates, self.regions, self.epochs, self.passed, self.failed
        )
    }
}
