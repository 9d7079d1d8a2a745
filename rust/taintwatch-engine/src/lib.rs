//! Taintwatch Engine: dynamic taint analysis over a host VM's instruction hook.

pub mod args;
pub mod config;
pub mod context;
pub mod detect;
pub mod dispatch;
pub mod flatten;
pub mod record;
pub mod region;
pub mod report;
pub mod search;
pub mod tables;

pub use args::{ArgumentError, CallArguments, CallLayout, CallVariant};
pub use config::{ConfigError, RunMode, RuntimeConfig, Settings};
pub use context::{EngineContext, FrameFilter, RunState};
pub use detect::{Detector, Pipeline, TraceRecord, Verdict};
pub use flatten::{AnomalyReason, FlattenAnomaly};
pub use record::CallRecord;
pub use region::{RegionTracker, TaintRegion};
pub use report::Report;
pub use search::{PatternSearch, RegexSearch};
pub use tables::LookupTables;
