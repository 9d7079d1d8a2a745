//! Debug trace of every analysed call.

use super::{CallSite, DetectCx, Detector, Verdict};
use serde::Serialize;
use taintwatch_core::tagged::ObjectKind;
use tracing::debug;

/// Receives one record per analysed call in debug runs.
pub type TraceCallback = Option<Box<dyn FnMut(&TraceRecord)>>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceRecord {
    pub module: Option<String>,
    pub class: Option<String>,
    pub method: Option<String>,
    pub func: Option<String>,
    #[serde(rename = "hook type")]
    pub hook_type: Option<&'static str>,
    #[serde(rename = "config type")]
    pub config_type: Option<ObjectKind>,
    pub opcode: String,
    pub oparg: u32,
    pub line: u32,
    pub params: Vec<serde_json::Value>,
    #[serde(rename = "indirect taint")]
    pub indirect_taint: bool,
}

impl TraceRecord {
    pub fn from_site(site: &CallSite<'_>) -> Self {
        let record = site.record;
        Self {
            module: record.module.clone(),
            class: record.class.clone(),
            method: record.method.clone(),
            func: record.func.clone(),
            hook_type: record.hook.map(|k| k.type_name()),
            config_type: record.descriptor.as_ref().map(|d| d.object_kind),
            opcode: record.opcode.map(|op| op.name().to_string()).unwrap_or_default(),
            oparg: record.oparg,
            line: record.line,
            params: site.args.flattened().iter().map(|v| v.to_json()).collect(),
            indirect_taint: site.in_region,
        }
    }
}

/// Never reports; emits a [`TraceRecord`] for each call.
#[derive(Debug, Default)]
pub struct TraceDetector;

impl Detector for TraceDetector {
    fn id(&self) -> &'static str {
        "trace"
    }

    fn inspect(&mut self, site: &CallSite<'_>, cx: &mut DetectCx<'_>) -> Option<Verdict> {
        let record = TraceRecord::from_site(site);
        debug!(
            call = %site.record.qualified_name(),
            opcode = %record.opcode,
            line = record.line,
            indirect_taint = record.indirect_taint,
            "call traced"
        );
        if let Some(cb) = cx.trace.as_mut() {
            cb(&record);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::CallArguments;
    use crate::detect::testing::{descriptor, record_for, taint};
    use crate::search::{GuardedSearch, RegexSearch};
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;
    use taintwatch_core::bytecode::{Instruction, OpCode};
    use taintwatch_core::tagged::{TagKind, ThreatKind};
    use taintwatch_core::values::Value;

    #[test]
    fn test_trace_record_keys_and_callback() {
        let seen: Rc<RefCell<Vec<TraceRecord>>> = Rc::default();
        let sink = Rc::clone(&seen);
        let mut trace: TraceCallback = Some(Box::new(move |r: &TraceRecord| sink.borrow_mut().push(r.clone())));

        let record = record_for(descriptor(TagKind::Threat, "os", "system", Some(ThreatKind::CommandExec)));
        let stack = vec![Value::None, taint()];
        let args = CallArguments::extract(&stack, &Instruction::new(OpCode::CallFunction, 1)).unwrap();
        let site = CallSite { record: &record, args: &args, in_region: true };
        let search = RegexSearch::new();
        let enabled = Cell::new(true);
        let mut cx = DetectCx { search: GuardedSearch::new(&search, &enabled), trace: &mut trace };

        assert!(TraceDetector.inspect(&site, &mut cx).is_none());
        let seen = seen.borrow();
        assert_eq!(seen.len(), 1);
        let json = serde_json::to_value(&seen[0]).unwrap();
        assert_eq!(json["module"], "os");
        assert_eq!(json["hook type"], "ThreatObject");
        assert_eq!(json["config type"], "function");
        assert_eq!(json["opcode"], "CALL_FUNCTION");
        assert_eq!(json["indirect taint"], true);
        assert_eq!(json["params"].as_array().map(Vec::len), Some(1));
    }
}
