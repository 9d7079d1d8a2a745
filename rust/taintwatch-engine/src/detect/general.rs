use super::{CallSite, DetectCx, Detector, Verdict};
use taintwatch_core::tagged::{contains_kind_shallow, TagKind};

pub const TAINT_REACHES_SINK: &str = "Taint data reach threat callables";

/// Any threat sink called with taint among its arguments.
#[derive(Debug, Default)]
pub struct GeneralDetector;

impl Detector for GeneralDetector {
    fn id(&self) -> &'static str {
        "general"
    }

    fn inspect(&mut self, site: &CallSite<'_>, _cx: &mut DetectCx<'_>) -> Option<Verdict> {
        if site.record.hook != Some(TagKind::Threat) {
            return None;
        }
        site.args
            .flattened()
            .iter()
            .any(|arg| contains_kind_shallow(arg, TagKind::Taint))
            .then(|| Verdict::new(self.id(), TAINT_REACHES_SINK, site.record.line))
    }
}
