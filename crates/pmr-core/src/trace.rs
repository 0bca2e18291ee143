//! # Trace Parser
//!
//! Turns the operation log into an ordered [`Trace`]. Records are one per
//! line; the pmemcheck layout that joins records with `|` on a single line is
//! accepted as well.
//!
//! ```text
//! START
//! STORE;0x0;0xff;0x8
//! FLUSH;0x0;0x40
//! FENCE
//! STOP
//! ```
//!
//! The whole trace is parsed and its region markers validated before anything
//! is replayed: region scoping drives every later decision, so a trace with
//! bad nesting is rejected outright.

use std::io::BufRead;

use serde::{Deserialize, Serialize};

use crate::error::TraceError;
use crate::op::{OpKind, Operation};
use crate::registry::OperationRegistry;

/// What to do with a record whose tag has no constructor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownOperationPolicy {
    #[default]
    Error,
    /// Skip the record and log a warning (newer trace formats).
    Skip,
}

/// Parser settings.
#[derive(Debug, Clone)]
pub struct TraceOptions {
    /// Field delimiter inside a record.
    pub delimiter: char,
    /// Separator between records sharing one line.
    pub record_separator: char,
    pub unknown_operations: UnknownOperationPolicy,
    /// Reject a region still open at the end of the trace.
    pub strict_regions: bool,
}

impl Default for TraceOptions {
    fn default() -> Self {
        Self {
            delimiter: ';',
            record_separator: '|',
            unknown_operations: UnknownOperationPolicy::Error,
            strict_regions: true,
        }
    }
}

/// A parsed, validated trace.
#[derive(Debug, Clone, Default)]
pub struct Trace {
    ops: Vec<Operation>,
    explicit_regions: bool,
}

impl Trace {
    /// Build a trace from already-constructed operations, validating region nesting.
    pub fn from_operations(ops: Vec<Operation>, strict_regions: bool) -> Result<Self, TraceError> {
        let explicit_regions = validate_regions(&ops, strict_regions)?;
        Ok(Self {
            ops,
            explicit_regions,
        })
    }

    #[inline]
    pub fn ops(&self) -> &[Operation] {
        &self.ops
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// `true` if the trace carries START/STOP markers. Without them the whole
    /// trace is a single implicit region.
    #[inline]
    pub fn has_explicit_regions(&self) -> bool {
        self.explicit_regions
    }

    /// Number of stores, memsets and memcpys in the trace.
    pub fn write_count(&self) -> usize {
        self.ops.iter().filter(|op| op.is_write()).count()
    }
}

/// Parse and validate a whole trace.
pub fn parse_trace<R: BufRead>(
    reader: R,
    registry: &OperationRegistry,
    options: &TraceOptions,
) -> Result<Trace, TraceError> {
    let mut ops = Vec::new();
    let mut index = 0usize;

    for line in reader.lines() {
        let line = line?;
        for record in line.split(options.record_separator) {
            let record = record.trim();
            if record.is_empty() {
                continue;
            }
            match registry.parse(record, options.delimiter, index) {
                Ok(op) => ops.push(op),
                Err(TraceError::UnknownOperation { record, tag })
                    if options.unknown_operations == UnknownOperationPolicy::Skip =>
                {
                    tracing::warn!("Skipping unknown operation '{}' at record {}", tag, record);
                }
                Err(e) => return Err(e),
            }
            index += 1;
        }
    }

    tracing::debug!("Parsed {} operations from {} records", ops.len(), index);
    Trace::from_operations(ops, options.strict_regions)
}

/// Check that START/STOP markers pair up one level deep.
///
/// Returns whether the trace uses explicit regions at all.
pub fn validate_regions(ops: &[Operation], strict: bool) -> Result<bool, TraceError> {
    let mut open: Option<usize> = None;
    let mut explicit = false;

    for op in ops {
        match op.kind() {
            OpKind::RegionStart => {
                explicit = true;
                if let Some(start) = open {
                    return Err(TraceError::malformed(
                        op.index(),
                        format!("region start inside region opened at record {}", start),
                    ));
                }
                open = Some(op.index());
            }
            OpKind::RegionStop => {
                explicit = true;
                if open.take().is_none() {
                    return Err(TraceError::malformed(
                        op.index(),
                        "region stop without matching start",
                    ));
                }
            }
            _ => {}
        }
    }

    if let Some(start) = open {
        if strict {
            return Err(TraceError::malformed(
                start,
                "region start without matching stop",
            ));
        }
        tracing::warn!(
            "Region opened at record {} is never closed; closing it at end of trace",
            start
        );
    }

    Ok(explicit)
}
