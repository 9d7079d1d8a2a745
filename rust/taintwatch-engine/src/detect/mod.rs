//! Detection pipeline: detectors inspect the intercepted call in a fixed order
//! and the first verdict ends the run.

mod command;
mod denylist;
mod general;
mod reverse_shell;
mod trace;

pub use command::{MaliciousCommandDetector, MALICIOUS_COMMANDS};
pub use denylist::{DenylistDetector, DENYLIST};
pub use general::GeneralDetector;
pub use reverse_shell::{reverse_shell_verdict, ReverseShellDetector, ReverseShellState};
pub use trace::{TraceCallback, TraceDetector, TraceRecord};

use crate::args::CallArguments;
use crate::record::CallRecord;
use crate::search::GuardedSearch;
use taintwatch_core::values::Value;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub detector: &'static str,
    pub description: String,
    pub line: u32,
}

impl Verdict {
    pub fn new(detector: &'static str, description: impl Into<String>, line: u32) -> Self {
        Self { detector, description: description.into(), line }
    }
}

/// The call a detector looks at.
pub struct CallSite<'a> {
    pub record: &'a CallRecord,
    pub args: &'a CallArguments<'a>,
    pub in_region: bool,
}

/// Services available to detectors while they run.
pub struct DetectCx<'a> {
    pub search: GuardedSearch<'a>,
    pub trace: &'a mut TraceCallback,
}

pub trait Detector {
    fn id(&self) -> &'static str;
    fn inspect(&mut self, site: &CallSite<'_>, cx: &mut DetectCx<'_>) -> Option<Verdict>;
}

#[derive(Default)]
pub struct Pipeline {
    detectors: Vec<Box<dyn Detector>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in detectors; debug runs trace every call first.
    pub fn standard(debug: bool) -> Self {
        let mut pipeline = Self::new();
        if debug {
            pipeline.push(TraceDetector);
        }
        pipeline.push(GeneralDetector);
        pipeline.push(MaliciousCommandDetector);
        pipeline.push(ReverseShellDetector::default());
        pipeline.push(DenylistDetector);
        pipeline
    }

    pub fn push(&mut self, detector: impl Detector + 'static) {
        self.detectors.push(Box::new(detector));
    }

    pub fn ids(&self) -> Vec<&'static str> {
        self.detectors.iter().map(|d| d.id()).collect()
    }

    pub fn run(&mut self, site: &CallSite<'_>, cx: &mut DetectCx<'_>) -> Option<Verdict> {
        for detector in &mut self.detectors {
            if let Some(verdict) = detector.inspect(site, cx) {
                info!(
                    detector = verdict.detector,
                    call = %site.record.qualified_name(),
                    line = verdict.line,
                    "{}",
                    verdict.description
                );
                return Some(verdict);
            }
        }
        None
    }
}

/// Command text carried by call arguments: each string, and each list or
/// tuple of strings joined with spaces.
pub(crate) fn command_texts(args: &[Value]) -> Vec<String> {
    args.iter()
        .filter_map(|arg| match arg {
            Value::Str(s) => Some(s.to_string()),
            Value::List(_) | Value::Tuple(_) => {
                let items = arg.sequence_items().unwrap_or_default();
                let words: Vec<&str> = items.iter().filter_map(Value::as_str).collect();
                (!words.is_empty()).then(|| words.join(" "))
            }
            _ => None,
        })
        .collect()
}
