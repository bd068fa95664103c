//! Arbitration-id filters derived from message names

use crate::signals::{MessageDatabase, MessageDefinition};
use crate::transport::HardwareFilter;
use std::collections::{BTreeMap, HashSet};

/// Labelled sets of arbitration ids, built up incrementally by the caller
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterSet {
    entries: BTreeMap<String, HashSet<u32>>,
}

impl FilterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the ids stored under `label`
    pub fn insert(&mut self, label: impl Into<String>, ids: HashSet<u32>) {
        self.entries.insert(label.into(), ids);
    }

    pub fn get(&self, label: &str) -> Option<&HashSet<u32>> {
        self.entries.get(label)
    }

    pub fn remove(&mut self, label: &str) -> Option<HashSet<u32>> {
        self.entries.remove(label)
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Union of the ids under every label
    pub fn ids(&self) -> HashSet<u32> {
        self.entries.values().flatten().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// One exact-match transport filter per id, ascending
    ///
    /// Ids above the 11-bit range are matched as extended frames.
    pub fn to_hardware_filters(&self) -> Vec<HardwareFilter> {
        let mut ids: Vec<u32> = self.ids().into_iter().collect();
        ids.sort_unstable();
        ids.into_iter()
            .map(|id| HardwareFilter::exact(id, id > crate::types::MAX_STANDARD_ID))
            .collect()
    }
}

/// Derives id sets from case-sensitive substring matches on message names
pub struct FilterBuilder;

impl FilterBuilder {
    /// Ids of every definition whose name contains `name_substring`
    pub fn build<'a, I>(definitions: I, name_substring: &str) -> HashSet<u32>
    where
        I: IntoIterator<Item = &'a MessageDefinition>,
    {
        definitions
            .into_iter()
            .filter(|def| def.name.contains(name_substring))
            .map(|def| def.id)
            .collect()
    }

    /// [`FilterBuilder::build`] over a whole database
    pub fn build_from(database: &MessageDatabase, name_substring: &str) -> HashSet<u32> {
        Self::build(database.messages(), name_substring)
    }

    /// Build the ids for `name_substring` and store them under that label
    ///
    /// Returns how many ids matched.
    pub fn add(
        filter_set: &mut FilterSet,
        database: &MessageDatabase,
        name_substring: &str,
    ) -> usize {
        let ids = Self::build_from(database, name_substring);
        log::info!(
            "Filter '{}' matched {} message(s)",
            name_substring,
            ids.len()
        );
        let count = ids.len();
        filter_set.insert(name_substring, ids);
        count
    }

    /// Empty a previously built set for reuse
    pub fn clear(filter_set: &mut FilterSet) {
        filter_set.clear();
    }
}
