//! The result printed at the end of a run.

use crate::config::{RunMode, RuntimeConfig};
use crate::detect::Verdict;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Report {
    pub file_name: String,
    pub is_malicious: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,
    #[serde(flatten)]
    pub debug: Option<DebugFields>,
}

/// Extra fields of debug runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DebugFields {
    pub is_jump_branch: bool,
    pub run_mode: RunMode,
    pub detect_timeout: u64,
    pub memory_limit: u64,
    pub flatten_anomalies: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

impl Report {
    pub fn new(file_name: &str, verdict: Option<&Verdict>, config: &RuntimeConfig, flatten_anomalies: usize) -> Self {
        let debug = config.is_debug().then(|| DebugFields {
            is_jump_branch: config.jump_branch,
            run_mode: config.run_mode,
            detect_timeout: config.detect_timeout,
            memory_limit: config.memory_limit,
            flatten_anomalies,
            line: verdict.map(|v| v.line),
        });
        Self {
            file_name: file_name.to_string(),
            is_malicious: verdict.is_some(),
            desc: verdict.map(|v| v.description.clone()),
            debug,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!("{{\"FileName\":{:?},\"IsMalicious\":{}}}", self.file_name, self.is_malicious)
        })
    }
}
