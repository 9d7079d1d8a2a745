//! ANSI color helpers for terminal output.

pub fn red(s: &str) -> String {
    format!("\x1b[31m{}\x1b[0m", s)
}

pub fn yellow(s: &str) -> String {
    format!("\x1b[33m{}\x1b[0m", s)
}

/// Right-aligned bold label, red for findings and green otherwise.
pub fn verdict_label(malicious: bool) -> String {
    if malicious {
        format!("\x1b[1;31m{:>12}\x1b[0m", "MALICIOUS")
    } else {
        format!("\x1b[1;32m{:>12}\x1b[0m", "clean")
    }
}
