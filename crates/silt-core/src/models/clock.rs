//! Vector clocks for causal conflict detection.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Causal relation between two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Causality {
    Equal,
    /// Self happened before other (other dominates).
    Before,
    /// Other happened before self (self dominates).
    After,
    /// Neither dominates; the edits were concurrent.
    Concurrent,
}

/// Per-client counters used to detect concurrent edits.
///
/// Missing keys are treated as zero. `A <= B` iff every counter of A is
/// at most the matching counter of B.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock(BTreeMap<String, u64>);

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, client_id: &str) -> u64 {
        self.0.get(client_id).copied().unwrap_or(0)
    }

    /// Bump this client's counter; called on every local write.
    pub fn increment(&mut self, client_id: &str) {
        *self.0.entry(client_id.to_string()).or_insert(0) += 1;
    }

    /// Pointwise maximum of both clocks.
    pub fn merge(&mut self, other: &Self) {
        for (client, counter) in &other.0 {
            let entry = self.0.entry(client.clone()).or_insert(0);
            *entry = (*entry).max(*counter);
        }
    }

    pub fn compare(&self, other: &Self) -> Causality {
        let mut self_ahead = false;
        let mut other_ahead = false;

        for (client, counter) in &self.0 {
            match counter.cmp(&other.get(client)) {
                std::cmp::Ordering::Greater => self_ahead = true,
                std::cmp::Ordering::Less => other_ahead = true,
                std::cmp::Ordering::Equal => {}
            }
        }
        for (client, counter) in &other.0 {
            if self.get(client) < *counter {
                other_ahead = true;
            }
        }

        match (self_ahead, other_ahead) {
            (false, false) => Causality::Equal,
            (false, true) => Causality::Before,
            (true, false) => Causality::After,
            (true, true) => Causality::Concurrent,
        }
    }

    /// The client holding the highest counter, ties broken by greatest
    /// client id. Used as a deterministic tie-breaker in resolution.
    pub fn dominant_writer(&self) -> Option<&str> {
        self.0
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| a.0.cmp(b.0)))
            .map(|(client, _)| client.as_str())
    }
}
