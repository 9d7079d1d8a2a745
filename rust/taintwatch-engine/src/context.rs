//! All per-run engine state.

use crate::config::{RuntimeConfig, Settings};
use crate::detect::{Pipeline, TraceCallback, Verdict};
use crate::flatten::FlattenAnomaly;
use crate::record::CallRecord;
use crate::region::RegionTracker;
use crate::report::Report;
use crate::search::{PatternSearch, RegexSearch, SuspendGuard};
use crate::tables::LookupTables;
use std::cell::Cell;
use std::fmt;
use taintwatch_core::frame::FrameId;
use taintwatch_core::host::Host;
use tracing::info;

/// Filename prefix of interpreter-internal code.
pub const INTERNAL_PREFIX: &str = "<frozen";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Waiting for the first frame of the main script.
    Initializing,
    Recording,
    /// The detection pipeline is running.
    Analysing,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Initializing => write!(f, "initializing"),
            RunState::Recording => write!(f, "recording"),
            RunState::Analysing => write!(f, "analysing"),
        }
    }
}

/// Decides which frames the dispatcher analyses.
#[derive(Debug, Clone)]
pub struct FrameFilter {
    main_file: String,
    library_prefix: Option<String>,
    last: Option<(FrameId, bool)>,
}

impl FrameFilter {
    pub fn new(main_file: impl Into<String>, library_prefix: Option<String>) -> Self {
        Self { main_file: main_file.into(), library_prefix, last: None }
    }

    pub fn is_main_file(&self, filename: &str) -> bool {
        filename == self.main_file
    }

    /// False for library and interpreter-internal code.
    pub fn accepts(&mut self, frame: FrameId, filename: &str) -> bool {
        if let Some((id, verdict)) = self.last {
            if id == frame {
                return verdict;
            }
        }
        let excluded = filename.starts_with(INTERNAL_PREFIX)
            || self.library_prefix.as_deref().is_some_and(|prefix| filename.starts_with(prefix));
        self.last = Some((frame, !excluded));
        !excluded
    }
}

pub struct EngineContext {
    pub(crate) config: RuntimeConfig,
    pub(crate) tables: LookupTables,
    pub(crate) filter: FrameFilter,
    pub(crate) state: RunState,
    pub(crate) record: CallRecord,
    pub(crate) regions: RegionTracker,
    pub(crate) pipeline: Pipeline,
    pub(crate) searcher: Box<dyn PatternSearch>,
    pub(crate) hook_enabled: Cell<bool>,
    pub(crate) verdict: Option<Verdict>,
    pub(crate) anomalies: Vec<FlattenAnomaly>,
    pub(crate) script_file: String,
    pub trace_callback: TraceCallback,
}

impl EngineContext {
    pub fn new(script_file: impl Into<String>, config: RuntimeConfig) -> Self {
        let script_file = script_file.into();
        Self {
            pipeline: Pipeline::standard(config.is_debug()),
            filter: FrameFilter::new(script_file.clone(), None),
            config,
            tables: LookupTables::builtin(),
            state: RunState::Initializing,
            record: CallRecord::invalid(),
            regions: RegionTracker::new(),
            searcher: Box::new(RegexSearch::new()),
            hook_enabled: Cell::new(true),
            verdict: None,
            anomalies: Vec::new(),
            script_file,
            trace_callback: None,
        }
    }

    /// Engine configured from a settings file: its runtime options, library
    /// prefix, and extra table records.
    pub fn from_settings(script_file: impl Into<String>, settings: &Settings) -> Self {
        let mut tables = LookupTables::builtin();
        tables.extend(settings.descriptors().cloned());
        Self::new(script_file, settings.runtime.clone())
            .with_tables(tables)
            .with_library_prefix(settings.library_prefix.clone())
    }

    pub fn with_tables(mut self, tables: LookupTables) -> Self {
        self.tables = tables;
        self
    }

    pub fn with_library_prefix(mut self, prefix: Option<String>) -> Self {
        self.filter = FrameFilter::new(self.script_file.clone(), prefix);
        self
    }

    pub fn with_searcher(mut self, searcher: Box<dyn PatternSearch>) -> Self {
        self.searcher = searcher;
        self
    }

    pub fn with_pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn set_trace_callback(&mut self, callback: impl FnMut(&crate::detect::TraceRecord) + 'static) {
        self.trace_callback = Some(Box::new(callback));
    }

    /// Replace every table target in `host` with its tagged stand-in.
    pub fn install(&self, host: &mut dyn Host) -> usize {
        if !self.config.enable {
            info!("engine disabled; no hooks installed");
            return 0;
        }
        let _guard = self.suspend();
        self.tables.install(host)
    }

    /// Disable the instruction hook until the guard drops.
    pub fn suspend(&self) -> SuspendGuard<'_> {
        SuspendGuard::new(&self.hook_enabled)
    }

    pub fn hook_enabled(&self) -> bool {
        self.hook_enabled.get()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn tables(&self) -> &LookupTables {
        &self.tables
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn verdict(&self) -> Option<&Verdict> {
        self.verdict.as_ref()
    }

    pub fn record(&self) -> &CallRecord {
        &self.record
    }

    pub fn in_region(&self) -> bool {
        self.regions.in_region()
    }

    pub fn region_depth(&self) -> usize {
        self.regions.depth()
    }

    pub fn anomalies(&self) -> &[FlattenAnomaly] {
        &self.anomalies
    }

    pub fn script_file(&self) -> &str {
        &self.script_file
    }

    pub fn report(&self) -> Report {
        Report::new(&self.script_file, self.verdict.as_ref(), &self.config, self.anomalies.len())
    }
}

impl fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineContext")
            .field("script_file", &self.script_file)
            .field("state", &self.state)
            .field("config", &self.config)
            .field("regions", &self.regions.depth())
            .field("verdict", &self.verdict)
            .field("anomalies", &self.anomalies.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_filter_excludes_library_and_internal_code() {
        let mut filter = FrameFilter::new("main.py", Some("/usr/lib/py/".into()));
        assert!(filter.is_main_file("main.py"));
        assert!(filter.accepts(FrameId(0), "main.py"));
        assert!(filter.accepts(FrameId(1), "helper.py"));
        assert!(!filter.accepts(FrameId(2), "/usr/lib/py/json/decoder.py"));
        assert!(!filter.accepts(FrameId(3), "<frozen importlib._bootstrap>"));
    }

    #[test]
    fn test_frame_filter_caches_the_last_frame() {
        let mut filter = FrameFilter::new("main.py", None);
        assert!(!filter.accepts(FrameId(4), "<frozen x>"));
        // the cached decision for frame 4 wins
        assert!(!filter.accepts(FrameId(4), "main.py"));
        assert!(filter.accepts(FrameId(5), "main.py"));
    }

    #[test]
    fn test_settings_extend_tables_and_set_prefix() {
        let settings = Settings::parse(
            "library_prefix = \"/lib/\"\n[runtime]\nrun_mode = \"debug\"\n[[sink]]\nmodule = \"shellkit\"\nfunc = \"run\"\nobject_kind = \"function\"\nthreat = \"command-exec\"\n",
        )
        .unwrap();
        let engine = EngineContext::from_settings("main.py", &settings);
        assert!(engine.config().is_debug());
        assert!(engine.tables().get("shellkit-run").is_some());
        assert!(engine.tables().get("os-system").is_some());
        assert_eq!(engine.state(), RunState::Initializing);
        assert!(!engine.report().is_malicious);
    }

    #[test]
    fn test_suspend_guard_restores_hook() {
        let engine = EngineContext::new("main.py", RuntimeConfig::default());
        {
            let _guard = engine.suspend();
            assert!(!engine.hook_enabled());
        }
        assert!(engine.hook_enabled());
    }
}
