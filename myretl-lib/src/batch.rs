//! Per-table batch accumulation inside a target worker
//!
//! Upsert-able events (INSERT/UPDATE/INIT) are buffered per mapping rule and
//! flushed as one multi-row statement when the slot reaches the batch size or
//! its oldest row exceeds the flush interval. Rows keep insertion order;
//! a second row for the same primary key overwrites the first in place
//! (last write wins within a batch). Slots of different mapping rules never
//! merge, even when they address the same target table.

use crate::config::MappingRule;
use crate::events::Row;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Pending rows for one mapping rule
#[derive(Debug)]
pub struct BatchSlot {
    pub mapping_key: String,
    pub target_table: String,
    pub primary_key: String,
    rows: Vec<Row>,
    /// Serialized pk value → position in `rows`
    positions: HashMap<String, usize>,
    first_at: Instant,
}

impl BatchSlot {
    fn new(rule: &MappingRule) -> Self {
        Self {
            mapping_key: rule.key.clone(),
            target_table: rule.target_table.clone(),
            primary_key: rule.primary_key.clone(),
            rows: Vec::new(),
            positions: HashMap::new(),
            first_at: Instant::now(),
        }
    }

    fn push(&mut self, row: Row) {
        match row.get(&self.primary_key).map(|v| v.to_string()) {
            Some(pk) => match self.positions.get(&pk) {
                Some(&idx) => self.rows[idx] = row,
                None => {
                    self.positions.insert(pk, self.rows.len());
                    self.rows.push(row);
                }
            },
            // No primary key in the row: nothing to coalesce on
            None => self.rows.push(row),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn age(&self) -> Duration {
        self.first_at.elapsed()
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }
}

/// All pending slots of one target worker
#[derive(Debug, Default)]
pub struct BatchAccumulator {
    slots: HashMap<String, BatchSlot>,
}

impl BatchAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a row to the rule's slot; returns the slot size afterwards
    pub fn push(&mut self, rule: &MappingRule, row: Row) -> usize {
        let slot = self
            .slots
            .entry(rule.key.clone())
            .or_insert_with(|| BatchSlot::new(rule));
        slot.push(row);
        slot.len()
    }

    /// Remove and return the slot for a mapping rule, if it has rows
    pub fn take(&mut self, mapping_key: &str) -> Option<BatchSlot> {
        self.slots.remove(mapping_key).filter(|s| !s.is_empty())
    }

    /// Remove and return every slot whose oldest row is older than `max_age`
    pub fn take_due(&mut self, max_age: Duration) -> Vec<BatchSlot> {
        let due: Vec<String> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.age() >= max_age)
            .map(|(key, _)| key.clone())
            .collect();
        due.into_iter().filter_map(|key| self.take(&key)).collect()
    }

    /// Drain everything, used for the final flush on shutdown
    pub fn take_all(&mut self) -> Vec<BatchSlot> {
        self.slots
            .drain()
            .map(|(_, slot)| slot)
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn pending_rows(&self) -> usize {
        self.slots.values().map(BatchSlot::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.values().all(BatchSlot::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rule(key: &str, target_table: &str) -> MappingRule {
        MappingRule {
            key: key.to_string(),
            source_name: "source1".to_string(),
            table: "users".to_string(),
            schema: "shop".to_string(),
            target_name: "target1".to_string(),
            target_table: target_table.to_string(),
            primary_key: "id".to_string(),
            columns: Vec::new(),
            filter: None,
            init_query: None,
        }
    }

    fn row(id: i64, name: &str) -> Row {
        let mut r = Row::new();
        r.insert("id".to_string(), json!(id));
        r.insert("name".to_string(), json!(name));
        r
    }

    #[test]
    fn test_coalesce_last_write_wins_in_place() {
        // Spec seed 2: two INSERTs with the same id leave one row with the
        // second insert's values, at the first insert's position.
        let mut acc = BatchAccumulator::new();
        let r = rule("source1.users", "users");
        acc.push(&r, row(1, "first"));
        acc.push(&r, row(2, "other"));
        assert_eq!(acc.push(&r, row(1, "second")), 2);

        let slot = acc.take("source1.users").unwrap();
        let rows = slot.rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("id"), Some(&json!(1)));
        assert_eq!(rows[0].get("name"), Some(&json!("second")));
        assert_eq!(rows[1].get("id"), Some(&json!(2)));
    }

    #[test]
    fn test_rules_never_share_a_slot() {
        let mut acc = BatchAccumulator::new();
        let a = rule("source1.users", "users");
        let b = rule("source2.users", "users");
        acc.push(&a, row(1, "a"));
        acc.push(&b, row(1, "b"));
        assert_eq!(acc.pending_rows(), 2);
        assert_eq!(acc.take("source1.users").unwrap().len(), 1);
        assert_eq!(acc.take("source2.users").unwrap().len(), 1);
    }

    #[test]
    fn test_take_due_by_age() {
        let mut acc = BatchAccumulator::new();
        let r = rule("source1.users", "users");
        acc.push(&r, row(1, "a"));
        assert!(acc.take_due(Duration::from_secs(60)).is_empty());
        let due = acc.take_due(Duration::ZERO);
        assert_eq!(due.len(), 1);
        assert!(acc.is_empty());
    }

    #[test]
    fn test_take_all_drains() {
        let mut acc = BatchAccumulator::new();
        acc.push(&rule("a", "t1"), row(1, "x"));
        acc.push(&rule("b", "t2"), row(2, "y"));
        let all = acc.take_all();
        assert_eq!(all.len(), 2);
        assert!(acc.is_empty());
        assert_eq!(acc.pending_rows(), 0);
    }

    #[test]
    fn test_missing_pk_rows_append() {
        let mut acc = BatchAccumulator::new();
        let r = rule("source1.users", "users");
        let mut no_pk = Row::new();
        no_pk.insert("name".to_string(), json!("anon"));
        acc.push(&r, no_pk.clone());
        acc.push(&r, no_pk);
        assert_eq!(acc.pending_rows(), 2);
    }

    #[test]
    fn test_take_empty_key_is_none() {
        let mut acc = BatchAccumulator::new();
        assert!(acc.take("nope").is_none());
    }
}
