use std::{
    collections::{BTreeMap, VecDeque},
    sync::Mutex,
};

use {
    chrono::{DateTime, Utc},
    serde::Serialize,
};

use crate::classify::{RecoveryKind, Severity};

/// Diagnostic record of one handled error.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    pub kind: String,
    pub severity: Severity,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery_strategy: Option<RecoveryKind>,
}

impl ErrorInfo {
    #[must_use]
    pub fn new(kind: impl Into<String>, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            severity,
            message: message.into(),
            occurred_at: Utc::now(),
            retry_count: 0,
            max_retries: 0,
            recovery_strategy: None,
        }
    }

    #[must_use]
    pub fn with_retries(mut self, retry_count: u32, max_retries: u32) -> Self {
        self.retry_count = retry_count;
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_strategy(mut self, strategy: RecoveryKind) -> Self {
        self.recovery_strategy = Some(strategy);
        self
    }
}

/// Capped rolling history of [`ErrorInfo`]; the oldest entry is evicted
/// first. Used for reporting only.
#[derive(Debug)]
pub struct ErrorHistory {
    capacity: usize,
    entries: Mutex<VecDeque<ErrorInfo>>,
}

impl ErrorHistory {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn record(&self, info: ErrorInfo) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if self.capacity == 0 {
            return;
        }
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(info);
    }

    /// Most recent entries, newest last.
    #[must_use]
    pub fn recent(&self, limit: usize) -> Vec<ErrorInfo> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let skip = entries.len().saturating_sub(limit);
        entries.iter().skip(skip).cloned().collect()
    }

    #[must_use]
    pub fn counts_by_kind(&self) -> BTreeMap<String, usize> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut counts = BTreeMap::new();
        for info in entries.iter() {
            *counts.entry(info.kind.clone()).or_insert(0) += 1;
        }
        counts
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keep only the newest `keep` entries and release spare buffer space.
    pub fn compact(&self, keep: usize) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let excess = entries.len().saturating_sub(keep);
        entries.drain(..excess);
        entries.shrink_to_fit();
    }
}
