//! # Replay
//!
//! Walks a validated trace through the region/epoch state machine, hands each
//! unit of writes to the reorder engine, materializes every plan as a scratch
//! image and asks the checker about it.
//!
//! ```text
//!   Init --START--> InRegion --FLUSH..FENCE--> Dispatching --> InRegion
//!                      |                                          |
//!                      +---------------STOP----> Dispatching --> Init
//!   end of trace --> Done
//! ```
//!
//! Writes stay pending until every byte they touched has been flushed and a
//! fence has followed. Only then are they committed to the base image that
//! the next epoch starts from; unflushed writes carry over.

use std::io;
use std::mem;
use std::path::PathBuf;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use thiserror::Error;

use tempfile::{PathPersistError, TempPath};

use pmr_core::{
    AddressRange, OpKind, Operation, Payload, ReorderEngine, ReorderPlan, ReorderScope, Trace,
};

use crate::checker::{Checker, CheckerError};
use crate::image::{ImageError, MemoryImage};
use crate::report::{PlanDescriptor, Record, RunReport};
use crate::sink::ResultSink;

/// Platform and scheduling parameters of one run.
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    /// The persistence domain includes the CPU caches: stores are durable
    /// on arrival and every fence is a barrier.
    pub eadr: bool,
    /// Candidates of one unit checked concurrently.
    pub jobs: usize,
    /// Where candidate images are written.
    pub scratch_dir: PathBuf,
    pub keep_failing_images: bool,
}

impl ReplayConfig {
    pub fn new(scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            eadr: false,
            jobs: 1,
            scratch_dir: scratch_dir.into(),
            keep_failing_images: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("failed to materialize {context}: {source}")]
    Image {
        context: String,
        #[source]
        source: ImageError,
    },

    #[error(transparent)]
    Checker(#[from] CheckerError),

    #[error("failed to write results: {0}")]
    Sink(#[source] io::Error),

    #[error("scratch file {}: {source}", .path.display())]
    Scratch {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Where the replay is in the trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayState {
    /// Outside any region.
    Init,
    InRegion,
    /// Checking the candidates of a closed unit.
    Dispatching,
    Done,
}

/// Drives one trace against one engine and one checker.
pub struct Replayer {
    config: ReplayConfig,
    engine: Box<dyn ReorderEngine>,
    checker: Arc<dyn Checker>,
}

impl Replayer {
    pub fn new(
        config: ReplayConfig,
        engine: Box<dyn ReorderEngine>,
        checker: Arc<dyn Checker>,
    ) -> Self {
        Self {
            config,
            engine,
            checker,
        }
    }

    pub fn config(&self) -> &ReplayConfig {
        &self.config
    }

    /// Replay `trace` on top of `image`, emitting one record per candidate.
    ///
    /// Fail verdicts are reported, not returned: the run only errors when a
    /// candidate cannot be built, the checker cannot be invoked, or the sink
    /// cannot be written.
    pub async fn run(
        &self,
        trace: &Trace,
        image: MemoryImage,
        sink: &mut dyn ResultSink,
    ) -> Result<RunReport, ReplayError> {
        std::fs::create_dir_all(&self.config.scratch_dir).map_err(|source| {
            ReplayError::Scratch {
                path: self.config.scratch_dir.clone(),
                source,
            }
        })?;

        tracing::info!(
            "Replaying {} operations ({} writes) with the {} engine{}",
            trace.len(),
            trace.write_count(),
            self.engine.kind(),
            if self.config.eadr { " (eADR)" } else { "" }
        );

        let mut run = Run::new(self, image, sink);
        if !trace.has_explicit_regions() {
            run.open_region();
        }

        for op in trace.ops() {
            run.step(op).await?;
        }

        // Unclosed explicit regions were already reported by validation.
        if run.state == ReplayState::InRegion {
            run.close_region().await?;
        }
        run.transition(ReplayState::Done);
        run.finish()
    }

    /// Build, snapshot and check one candidate.
    async fn check_candidate(
        &self,
        base: &MemoryImage,
        unit: &[Operation],
        plan: ReorderPlan,
        sequence: usize,
        mut descriptor: PlanDescriptor,
    ) -> Result<Record, ReplayError> {
        let mut image = base.clone();
        for &position in plan.applied() {
            if let Err(source) = image.apply(&unit[position]) {
                tracing::error!("Cannot apply {} to candidate {}", unit[position], descriptor);
                return Err(ReplayError::Image {
                    context: descriptor.to_string(),
                    source,
                });
            }
        }

        // Removed on drop, including when this future is abandoned mid-check.
        let scratch = TempPath::from_path(
            self.config
                .scratch_dir
                .join(format!("candidate-{:06}.img", sequence)),
        );
        image.snapshot(&scratch).map_err(|source| ReplayError::Image {
            context: descriptor.to_string(),
            source,
        })?;

        let verdict = match self.checker.check(&scratch).await {
            Ok(verdict) => verdict,
            Err(e) => {
                tracing::error!("Checker could not run on candidate {}", descriptor);
                return Err(e.into());
            }
        };

        if !verdict.passed && self.config.keep_failing_images {
            let kept = scratch
                .keep()
                .map_err(|PathPersistError { error, path }| ReplayError::Scratch {
                    path: path.to_path_buf(),
                    source: error,
                })?;
            descriptor.image = Some(kept);
        } else {
            let path = scratch.to_path_buf();
            scratch
                .close()
                .map_err(|source| ReplayError::Scratch { path, source })?;
        }

        Ok(Record {
            sequence,
            descriptor,
            verdict,
        })
    }
}

// =============================================================================
// Run state
// =============================================================================

/// A write that has not reached the persistence domain yet.
struct PendingWrite {
    op: Operation,
    unflushed: Vec<AddressRange>,
}

impl PendingWrite {
    fn new(op: &Operation, eadr: bool) -> Self {
        let unflushed = match op.range() {
            Some(range) if !eadr && !range.is_empty() => vec![range],
            _ => Vec::new(),
        };
        Self {
            op: op.clone(),
            unflushed,
        }
    }

    fn flush(&mut self, range: &AddressRange) {
        self.unflushed = self
            .unflushed
            .iter()
            .flat_map(|pending| pending.subtract(range))
            .collect();
    }

    #[inline]
    fn is_flushed(&self) -> bool {
        self.unflushed.is_empty()
    }
}

struct Run<'a> {
    replayer: &'a Replayer,
    sink: &'a mut dyn ResultSink,
    report: RunReport,
    state: ReplayState,
    /// Everything known to be durable.
    committed: MemoryImage,
    /// `committed` as of the current region's start.
    region_base: MemoryImage,
    region_writes: Vec<Operation>,
    pending: Vec<PendingWrite>,
    flushed_since_barrier: bool,
    region: usize,
    epoch: usize,
    /// Units dispatched in the current region.
    dispatched: usize,
    marker: Option<String>,
    sequence: usize,
}

impl<'a> Run<'a> {
    fn new(replayer: &'a Replayer, image: MemoryImage, sink: &'a mut dyn ResultSink) -> Self {
        Self {
            replayer,
            sink,
            report: RunReport::default(),
            state: ReplayState::Init,
            region_base: image.clone(),
            committed: image,
            region_writes: Vec::new(),
            pending: Vec::new(),
            flushed_since_barrier: false,
            region: 0,
            epoch: 0,
            dispatched: 0,
            marker: None,
            sequence: 0,
        }
    }

    fn transition(&mut self, next: ReplayState) {
        tracing::trace!("{:?} -> {:?}", self.state, next);
        self.state = next;
    }

    #[inline]
    fn scope(&self) -> ReorderScope {
        self.replayer.engine.scope()
    }

    async fn step(&mut self, op: &Operation) -> Result<(), ReplayError> {
        match op.kind() {
            OpKind::RegionStart => {
                if self.state == ReplayState::Init {
                    self.open_region();
                } else {
                    tracing::warn!("Ignoring {} inside region {}", op, self.region);
                }
            }
            OpKind::RegionStop => {
                if self.state == ReplayState::InRegion {
                    self.close_region().await?;
                } else {
                    tracing::warn!("Ignoring {} outside any region", op);
                }
            }
            OpKind::RegisterFile => {
                if let Payload::File(mapping) = op.payload() {
                    self.committed.register(mapping.clone());
                    if self.state == ReplayState::InRegion {
                        self.region_base.register(mapping.clone());
                    }
                }
            }
            OpKind::Marker => {
                if let Payload::Text(text) = op.payload() {
                    self.marker = Some(text.clone());
                }
            }
            OpKind::Store | OpKind::Memset | OpKind::Memcpy => {
                if self.state == ReplayState::InRegion {
                    self.pending
                        .push(PendingWrite::new(op, self.replayer.config.eadr));
                    if self.scope() == ReorderScope::Region {
                        self.region_writes.push(op.clone());
                    }
                } else {
                    self.commit(op)?;
                }
            }
            OpKind::Flush => {
                if self.state == ReplayState::InRegion {
                    if let Some(range) = op.range() {
                        for write in &mut self.pending {
                            write.flush(&range);
                        }
                    }
                    self.flushed_since_barrier = true;
                }
            }
            OpKind::Fence => {
                if self.state == ReplayState::InRegion
                    && (self.flushed_since_barrier || self.replayer.config.eadr)
                {
                    self.close_epoch().await?;
                }
            }
        }
        Ok(())
    }

    fn open_region(&mut self) {
        tracing::debug!("Region {} opened", self.region);
        self.region_base = self.committed.clone();
        self.epoch = 0;
        self.dispatched = 0;
        self.flushed_since_barrier = false;
        self.transition(ReplayState::InRegion);
    }

    /// A barrier: check the epoch, then persist what was flushed.
    async fn close_epoch(&mut self) -> Result<(), ReplayError> {
        self.flushed_since_barrier = false;
        if self.pending.is_empty() {
            return Ok(());
        }

        self.transition(ReplayState::Dispatching);
        if self.scope() == ReorderScope::Epoch {
            let unit = self.pending_ops();
            self.dispatch(self.committed.clone(), unit, Some(self.epoch))
                .await?;
        }

        let (flushed, carried): (Vec<_>, Vec<_>) = mem::take(&mut self.pending)
            .into_iter()
            .partition(PendingWrite::is_flushed);
        tracing::debug!(
            "Epoch {} of region {} closed: {} committed, {} carried over",
            self.epoch,
            self.region,
            flushed.len(),
            carried.len()
        );
        for write in &flushed {
            self.commit(&write.op)?;
        }
        self.pending = carried;
        self.report.epochs += 1;
        self.epoch += 1;
        self.transition(ReplayState::InRegion);
        Ok(())
    }

    async fn close_region(&mut self) -> Result<(), ReplayError> {
        self.transition(ReplayState::Dispatching);

        if !self.pending.is_empty() {
            if self.scope() == ReorderScope::Epoch {
                let unit = self.pending_ops();
                self.dispatch(self.committed.clone(), unit, Some(self.epoch))
                    .await?;
            }
            self.report.epochs += 1;
        }

        if self.scope() == ReorderScope::Region {
            let unit = mem::take(&mut self.region_writes);
            self.dispatch(self.region_base.clone(), unit, None).await?;
        } else if self.dispatched == 0 {
            self.dispatch(self.committed.clone(), Vec::new(), Some(self.epoch))
                .await?;
        }

        for write in mem::take(&mut self.pending) {
            self.commit(&write.op)?;
        }
        tracing::debug!(
            "Region {} closed after {} unit(s)",
            self.region,
            self.dispatched
        );
        self.report.regions += 1;
        self.region += 1;
        self.transition(ReplayState::Init);
        Ok(())
    }

    fn pending_ops(&self) -> Vec<Operation> {
        self.pending.iter().map(|write| write.op.clone()).collect()
    }

    fn commit(&mut self, op: &Operation) -> Result<(), ReplayError> {
        self.committed
            .apply(op)
            .map_err(|source| ReplayError::Image {
                context: format!("committed state at {}", op),
                source,
            })
    }

    /// Check every plan the engine generates for `unit`, emitting verdicts
    /// in generation order.
    async fn dispatch(
        &mut self,
        base: MemoryImage,
        unit: Vec<Operation>,
        epoch: Option<usize>,
    ) -> Result<(), ReplayError> {
        let replayer = self.replayer;
        let engine = replayer.engine.kind();
        let first = self.sequence;
        let region = self.region;
        let marker = self.marker.clone();
        let base = &base;
        let unit = &unit[..];

        let mut candidates = stream::iter(replayer.engine.generate(unit).enumerate())
            .map(move |(offset, plan)| {
                let descriptor = PlanDescriptor {
                    region,
                    epoch,
                    engine,
                    permutation: plan.permutation,
                    prefix: plan.prefix,
                    writes: unit.len(),
                    applied: plan.applied().iter().map(|&p| unit[p].index()).collect(),
                    marker: marker.clone(),
                    image: None,
                };
                replayer.check_candidate(base, unit, plan, first + offset, descriptor)
            })
            .buffered(replayer.config.jobs.max(1));

        while let Some(record) = candidates.next().await {
            let record = record?;
            if record.verdict.passed {
                tracing::debug!("PASS {}", record.descriptor);
            } else {
                tracing::debug!("FAIL {}", record.descriptor);
            }
            self.report.record(&record);
            self.sink.emit(&record).map_err(ReplayError::Sink)?;
            self.sequence += 1;
        }

        self.dispatched += 1;
        Ok(())
    }

    fn finish(self) -> Result<RunReport, ReplayError> {
        self.sink.finish(&self.report).map_err(ReplayError::Sink)?;
        tracing::info!("{}", self.report);
        Ok(self.report)
    }
}
