use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use anyhow::{Result, anyhow, bail};
use serde::Serialize;

use crate::callgraph::MethodId;

/// Exception-thrower classification of a method.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(tag = "kind", content = "parameters", rename_all = "snake_case")]
pub(crate) enum MethodSummary {
    #[default]
    None,
    /// Every path leaves the method by throwing.
    AlwaysThrows,
    /// The method throws when any of these parameters is null.
    Conditional(BTreeSet<usize>),
}

/// Write-once summary collection filled while building summaries.
#[derive(Debug, Default)]
pub(crate) struct SummaryStoreBuilder {
    entries: Mutex<BTreeMap<MethodId, MethodSummary>>,
}

impl SummaryStoreBuilder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record the summary of a method; each method is written at most once.
    pub(crate) fn record(&self, method: MethodId, summary: MethodSummary) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("summary store lock poisoned"))?;
        if entries.contains_key(&method) {
            bail!("summary for {method} recorded twice");
        }
        entries.insert(method, summary);
        Ok(())
    }

    /// Close the write phase; the returned store is read-only.
    pub(crate) fn freeze(self) -> Result<SummaryStore> {
        let entries = self
            .entries
            .into_inner()
            .map_err(|_| anyhow!("summary store lock poisoned"))?;
        Ok(SummaryStore { entries })
    }
}

/// Read-only summaries consumed while analysing nullness.
#[derive(Debug, Default)]
pub(crate) struct SummaryStore {
    entries: BTreeMap<MethodId, MethodSummary>,
}

impl SummaryStore {
    /// Summary of a method, `MethodSummary::None` when nothing was recorded.
    pub(crate) fn get(&self, method: &MethodId) -> &MethodSummary {
        static NONE: MethodSummary = MethodSummary::None;
        self.entries.get(method).unwrap_or(&NONE)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&MethodId, &MethodSummary)> {
        self.entries.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
