use super::{command_texts, CallSite, DetectCx, Detector, Verdict};
use taintwatch_core::tagged::TagKind;

pub const MALICIOUS_COMMANDS: &[&str] = &["reg add", "reg delete", "pyinstaller"];
pub const MALICIOUS_COMMAND: &str = "Execute Malicious Command";

/// Command-execution sinks whose command text matches a known-bad pattern.
#[derive(Debug, Default)]
pub struct MaliciousCommandDetector;

impl Detector for MaliciousCommandDetector {
    fn id(&self) -> &'static str {
        "malicious-command"
    }

    fn inspect(&mut self, site: &CallSite<'_>, cx: &mut DetectCx<'_>) -> Option<Verdict> {
        if site.record.hook != Some(TagKind::Threat) || !site.record.is_command_sink() {
            return None;
        }
        let texts = command_texts(site.args.flattened());
        let hit = texts
            .iter()
            .any(|text| MALICIOUS_COMMANDS.iter().any(|pattern| cx.search.search(pattern, text)));
        hit.then(|| Verdict::new(self.id(), MALICIOUS_COMMAND, site.record.line))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use taintwatch_core::tagged::ThreatKind;
    use taintwatch_core::values::Value;

    fn words(items: &[&str]) -> Value {
        Value::list(items.iter().map(Value::str).collect())
    }

    #[test]
    fn test_registry_edit_in_a_list_matches() {
        let record = record_for(descriptor(TagKind::Threat, "subprocess", "call", Some(ThreatKind::CommandExec)));
        let verdict = inspect(&mut MaliciousCommandDetector, &record, &[words(&["reg", "add", "HKCU\\Software"])]);
        assert_eq!(verdict.map(|v| v.description), Some(MALICIOUS_COMMAND.to_string()));
    }

    #[test]
    fn test_harmless_commands_do_not_match() {
        let record = record_for(descriptor(TagKind::Threat, "subprocess", "call", Some(ThreatKind::CommandExec)));
        assert!(inspect(&mut MaliciousCommandDetector, &record, &[words(&["copy", "file"])]).is_none());
    }

    #[test]
    fn test_any_argument_position_is_searched() {
        let record = record_for(descriptor(TagKind::Threat, "os", "system", Some(ThreatKind::CommandExec)));
        let args = [Value::Int(0), Value::str("pyinstaller --onefile x.py")];
        assert!(inspect(&mut MaliciousCommandDetector, &record, &args).is_some());
    }

    #[test]
    fn test_code_exec_sinks_are_not_command_sinks() {
        let record = record_for(descriptor(TagKind::Threat, "builtins", "eval", Some(ThreatKind::CodeExec)));
        assert!(inspect(&mut MaliciousCommandDetector, &record, &[Value::str("reg add")]).is_none());
    }
}
