//! Cut-flow accounting and histogram aggregation for physics-process samples.
//!
//! The pipeline has two passes over the event store. `analyze` applies the
//! ordered selection steps of each cutflow to every atomic process and
//! accumulates per-step event counts and weighted sums into a [`CutflowTable`]
//! that can be persisted and resumed. `fill` then populates the registered
//! [`Distribution`]s for every process, category, and systematic variant,
//! normalizes them against the cutflow table, and stages the histogram
//! collections for reporting or limit setting.

pub mod config;
pub mod cutflow;
pub mod expr;
pub mod histogram;
pub mod plot;
pub mod process;
pub mod report;
pub mod selection;
pub mod store;
pub mod systematics;

pub use config::AnalysisConfig;
pub use cutflow::{Cutflow, CutflowTable, StepCounter};
pub use expr::CompiledExpr;
pub use histogram::Histogram;
pub use plot::{Distribution, HistogramFile, PlotBook};
pub use process::{AtomicProcess, CombinedProcess, Process, ProcessRegistry};
pub use selection::{CutflowSpec, SelectionStep};
pub use store::{EventStore, MemoryStore};
pub use systematics::{expand_systematics, ShapeSystematics, Variant};
