//! Admission ordering and preemption victim selection.

use std::cmp::Ordering;

pub use crate::config::{AdmissionOrder, PreemptionPolicy};
use crate::core::request::{Priority, Request};

/// Sort key for priority admission.
///
/// Ordered by (priority DESC, arrival ASC): the greatest entry goes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PriorityEntry {
    priority: Priority,
    arrival: u64,
}

impl PartialOrd for PriorityEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PriorityEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first, then earlier arrival
        match self.priority.cmp(&other.priority) {
            Ordering::Equal => other.arrival.cmp(&self.arrival),
            ord => ord,
        }
    }
}

/// Index of the next waiting entry to consider.
///
/// `entries` yields `(priority, arrival)` in queue order.
pub fn next_candidate(
    order: AdmissionOrder,
    entries: impl Iterator<Item = (Priority, u64)>,
) -> Option<usize> {
    match order {
        AdmissionOrder::FirstComeFirstServed => entries
            .enumerate()
            .min_by_key(|&(_, (_, arrival))| arrival)
            .map(|(i, _)| i),
        AdmissionOrder::Priority => entries
            .enumerate()
            .max_by_key(|&(_, (priority, arrival))| PriorityEntry { priority, arrival })
            .map(|(i, _)| i),
    }
}

/// Index of the running request to swap out.
///
/// `running` is in admission order, so the last entry is the most recently
/// admitted. Among equal priorities the most recent one is chosen.
pub fn select_victim(policy: PreemptionPolicy, running: &[Request]) -> Option<usize> {
    match policy {
        PreemptionPolicy::MostRecentlyAdmitted => running.len().checked_sub(1),
        PreemptionPolicy::LowestPriority => running
            .iter()
            .enumerate()
            .rev()
            .min_by_key(|(_, r)| r.priority())
            .map(|(i, _)| i),
    }
}

/// Lowest-priority running request with priority strictly below `below`.
pub fn lowest_priority_below(running: &[Request], below: Priority) -> Option<usize> {
    running
        .iter()
        .enumerate()
        .rev()
        .filter(|(_, r)| r.priority() < below)
        .min_by_key(|(_, r)| r.priority())
        .map(|(i, _)| i)
}
