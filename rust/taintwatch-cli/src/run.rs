//! One analysis run: settings, sandbox, engine install, and the outcome.

use crate::loader::{load_program, CliError};
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use taintwatch_core::CodeObject;
use taintwatch_engine::{EngineContext, Report, Settings, TraceRecord};
use taintwatch_vm::{Effect, Sandbox, Vm, VmError};
use tracing::{info, warn};

pub const EXIT_CLEAN: i32 = 0;
pub const EXIT_ERROR: i32 = 1;
pub const EXIT_MALICIOUS: i32 = 3;

/// Everything a run needs besides the program itself.
#[derive(Debug, Clone, Default)]
pub struct AnalysisOptions {
    /// `key=value,key=value` runtime options, applied over the config file.
    pub options: Option<String>,
    /// A `taintwatch.toml` settings file.
    pub config: Option<PathBuf>,
    /// Lines served to `input()`.
    pub stdin: Vec<String>,
    /// `sys.argv[1:]`.
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub instruction_limit: Option<u64>,
}

impl AnalysisOptions {
    /// File settings with the option string applied on top.
    pub fn settings(&self) -> Result<Settings, CliError> {
        let mut settings = match &self.config {
            Some(path) => Settings::load_from(path)?,
            None => Settings::default(),
        };
        if let Some(options) = &self.options {
            settings.runtime.apply_options(options)?;
        }
        Ok(settings)
    }

    fn sandbox(&self, script: &str) -> Sandbox {
        let argv = std::iter::once(script.to_string()).chain(self.args.iter().cloned());
        self.env
            .iter()
            .fold(Sandbox::default().with_stdin(self.stdin.iter().cloned()).with_argv(argv), |sandbox, (k, v)| {
                sandbox.with_env(k.clone(), v.clone())
            })
    }
}

/// Outcome of one run.
#[derive(Debug)]
pub struct Analysis {
    pub report: Report,
    /// Debug trace records, empty outside debug mode.
    pub traces: Vec<TraceRecord>,
    pub output: Vec<String>,
    pub effects: Vec<Effect>,
    /// The script failed for a reason other than a verdict.
    pub error: Option<VmError>,
}

impl Analysis {
    pub fn exit_code(&self) -> i32 {
        if self.report.is_malicious {
            EXIT_MALICIOUS
        } else if self.error.is_some() {
            EXIT_ERROR
        } else {
            EXIT_CLEAN
        }
    }
}

pub fn analyse(path: &Path, options: &AnalysisOptions) -> Result<Analysis, CliError> {
    let code = load_program(path)?;
    analyse_code(code, options)
}

/// Run an already loaded program. The report names the program's filename.
pub fn analyse_code(code: Rc<CodeObject>, options: &AnalysisOptions) -> Result<Analysis, CliError> {
    let settings = options.settings()?;
    let script = code.filename.clone();
    let mut engine = EngineContext::from_settings(script.as_str(), &settings);

    let traces: Rc<RefCell<Vec<TraceRecord>>> = Rc::default();
    if settings.runtime.is_debug() {
        let sink = Rc::clone(&traces);
        engine.set_trace_callback(move |record| sink.borrow_mut().push(record.clone()));
    }

    let mut vm = Vm::with_sandbox(options.sandbox(&script));
    if let Some(limit) = options.instruction_limit {
        vm.set_instruction_limit(limit);
    }
    let installed = engine.install(&mut vm);
    info!(script = %script, installed, "engine installed");

    let result = vm.run_main(code, &mut engine);
    let report = engine.report();
    let error = match result {
        Ok(_) => None,
        Err(VmError::Terminated) if report.is_malicious => None,
        Err(err) => {
            warn!(error = %err, "script did not complete");
            Some(err)
        }
    };
    info!(malicious = report.is_malicious, instructions = vm.instruction_count(), "analysis finished");

    let traces = traces.take();
    Ok(Analysis {
        report,
        traces,
        output: vm.output().to_vec(),
        effects: vm.effects().to_vec(),
        error,
    })
}
