//! # pmr-core: the trace model of pmr
//!
//! Everything that can be decided from the operation log alone:
//!
//! - [`Operation`]: one typed trace event (store, flush, fence, ...).
//! - [`OperationRegistry`]: tag → constructor table used by the parser.
//! - [`parse_trace`]: log text → validated [`Trace`].
//! - [`ReorderEngine`]: strategies enumerating the legal store orderings of
//!   one reorderable unit.
//!
//! Nothing here touches the target file or the checker; see `pmr-io`.

pub mod error;
pub mod op;
pub mod registry;
pub mod reorder;
pub mod trace;

pub use error::TraceError;
pub use op::{AddressRange, FileMapping, OpKind, Operation, Payload};
pub use registry::{canonical_tag, OperationRegistry};
pub use reorder::{EngineKind, Plans, ReorderEngine, ReorderPlan, ReorderScope};
pub use trace::{parse_trace, validate_regions, Trace, TraceOptions, UnknownOperationPolicy};
