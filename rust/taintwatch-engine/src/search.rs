//! Pattern search service used by the detectors.

use regex::Regex;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use tracing::warn;

/// `search(pattern, text) -> match?`
pub trait PatternSearch {
    fn search(&self, pattern: &str, text: &str) -> bool;
}

/// `regex`-backed search with a per-pattern compile cache.
#[derive(Debug, Default)]
pub struct RegexSearch {
    cache: RefCell<HashMap<String, Option<Regex>>>,
}

impl RegexSearch {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PatternSearch for RegexSearch {
    fn search(&self, pattern: &str, text: &str) -> bool {
        let mut cache = self.cache.borrow_mut();
        let compiled = cache.entry(pattern.to_string()).or_insert_with(|| match Regex::new(pattern) {
            Ok(re) => Some(re),
            Err(err) => {
                warn!(pattern, error = %err, "invalid detector pattern");
                None
            }
        });
        compiled.as_ref().is_some_and(|re| re.is_match(text))
    }
}

/// Clears a hook-enabled flag for its lifetime and restores the previous
/// state on drop, including during unwinding.
#[must_use = "the hook is re-enabled as soon as the guard is dropped"]
pub struct SuspendGuard<'a> {
    flag: &'a Cell<bool>,
    previous: bool,
}

impl<'a> SuspendGuard<'a> {
    pub fn new(flag: &'a Cell<bool>) -> Self {
        let previous = flag.replace(false);
        Self { flag, previous }
    }
}

impl Drop for SuspendGuard<'_> {
    fn drop(&mut self) {
        self.flag.set(self.previous);
    }
}

/// Runs searches with the owning engine's hook suspended.
pub struct GuardedSearch<'a> {
    inner: &'a dyn PatternSearch,
    hook_enabled: &'a Cell<bool>,
}

impl<'a> GuardedSearch<'a> {
    pub fn new(inner: &'a dyn PatternSearch, hook_enabled: &'a Cell<bool>) -> Self {
        Self { inner, hook_enabled }
    }

    pub fn search(&self, pattern: &str, text: &str) -> bool {
        let _guard = SuspendGuard::new(self.hook_enabled);
        self.inner.search(pattern, text)
    }
}
