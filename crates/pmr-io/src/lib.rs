//! # pmr-io: the replay side of pmr
//!
//! Takes a parsed trace and a target file and does the actual work:
//! materializes candidate images, runs the checker on each, reports verdicts.

pub mod checker;
pub mod image;
pub mod replay;
pub mod report;
pub mod sink;

pub use checker::{
    load_checker, Checker, CheckerError, CheckerKind, CheckerSpec, FnChecker, LibraryChecker,
    ProcessChecker, Verdict,
};
pub use image::{ImageError, MemoryImage};
pub use replay::{ReplayConfig, ReplayError, ReplayState, Replayer};
pub use report::{PlanDescriptor, Record, RunReport};
pub use sink::{open_sink, JsonSink, MemorySink, OutputLevel, ResultSink, SinkKind, TextSink};
