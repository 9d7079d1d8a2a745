use super::{CallSite, DetectCx, Detector, Verdict};

/// `(module, name)` pairs whose mere use is reported.
pub const DENYLIST: &[(&str, &str)] = &[("scapy.all", "sniff"), ("wget", "download")];
pub const ILLEGAL_OPERATIONS: &str = "Illegal Operations";

#[derive(Debug, Default)]
pub struct DenylistDetector;

impl Detector for DenylistDetector {
    fn id(&self) -> &'static str {
        "denylist"
    }

    fn inspect(&mut self, site: &CallSite<'_>, _cx: &mut DetectCx<'_>) -> Option<Verdict> {
        let module = site.record.module.as_deref()?;
        let name = site.record.callable_name()?;
        DENYLIST
            .iter()
            .any(|&(m, n)| m == module && n == name)
            .then(|| Verdict::new(self.id(), ILLEGAL_OPERATIONS, site.record.line))
    }
}
