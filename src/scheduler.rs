//! Test partitioning across parallel workers.
//!
//! The partitioner splits a set of test ids into one batch per worker so
//! that each batch takes roughly the same wall-clock time, using recorded
//! durations from the repository. Scheduling to minimise makespan is NP
//! complete in general, so a longest-processing-time approximation is used:
//!
//! 1. Bucket ids by group key (ids sharing a key always land together).
//! 2. Classify each group: **timed** (every member has a recorded
//!    duration), **partial** (some recorded, total non-zero) or **untimed**.
//! 3. Place timed groups, largest first, into the partition with the lowest
//!    accumulated time (ties: fewest ids); then partial groups the same way.
//! 4. Spread untimed groups round-robin so brand-new tests do not clump
//!    onto one worker.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::Duration;

use regex::Regex;

use crate::repository::TestTimes;

/// Maps a test id to the key of the group it must be scheduled with.
///
/// Returning `None` leaves the id in a group of its own.
pub trait GroupOf {
    fn group_of(&self, test_id: &str) -> Option<String>;
}

/// Groups tests by the prefix matched by a regex anchored at the start of
/// the id.
///
/// This is the `group_regex` configuration key: for example
/// `([^\.]+\.)+` groups tests by everything up to their final dotted
/// component, keeping a class's tests on one worker.
pub struct RegexGroup {
    regex: Regex,
}

impl RegexGroup {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(RegexGroup {
            regex: Regex::new(pattern)?,
        })
    }
}

impl GroupOf for RegexGroup {
    fn group_of(&self, test_id: &str) -> Option<String> {
        // Anchored-at-start match semantics.
        self.regex
            .find(test_id)
            .filter(|m| m.start() == 0)
            .map(|m| m.as_str().to_string())
    }
}

struct Slot {
    time: Duration,
    ids: Vec<String>,
}

/// Partitions `test_ids` into exactly `concurrency` disjoint batches whose
/// union is the input. Empty batches are preserved so callers can index
/// batches by worker.
pub fn partition_tests(
    test_ids: &[String],
    concurrency: usize,
    times: &TestTimes,
    grouper: Option<&dyn GroupOf>,
) -> Vec<Vec<String>> {
    let concurrency = concurrency.max(1);

    // Bucket ids by group key, preserving first-appearance order so that
    // equal-duration groups schedule deterministically.
    let mut group_order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<String>> = HashMap::new();
    for id in test_ids {
        let key = grouper
            .and_then(|g| g.group_of(id))
            .filter(|k| !k.is_empty())
            .unwrap_or_else(|| id.clone());
        match groups.entry(key) {
            Entry::Occupied(mut entry) => entry.get_mut().push(id.clone()),
            Entry::Vacant(entry) => {
                group_order.push(entry.key().clone());
                entry.insert(vec![id.clone()]);
            }
        }
    }

    let mut timed: Vec<(String, Duration)> = Vec::new();
    let mut partially_timed: Vec<(String, Duration)> = Vec::new();
    let mut untimed: Vec<String> = Vec::new();
    for key in group_order {
        let members = &groups[&key];
        let mut unknown_members = 0usize;
        let mut total = Duration::ZERO;
        for id in members {
            match times.known.get(id) {
                Some(duration) => total += *duration,
                None => unknown_members += 1,
            }
        }
        if unknown_members == 0 {
            timed.push((key, total));
        } else if total > Duration::ZERO {
            partially_timed.push((key, total));
        } else {
            untimed.push(key);
        }
    }
    timed.sort_by(|a, b| b.1.cmp(&a.1));
    partially_timed.sort_by(|a, b| b.1.cmp(&a.1));

    let mut slots: Vec<Slot> = (0..concurrency)
        .map(|_| Slot {
            time: Duration::ZERO,
            ids: Vec::new(),
        })
        .collect();

    let mut consume = |queue: Vec<(String, Duration)>, slots: &mut Vec<Slot>| {
        for (key, duration) in queue {
            let target = slots
                .iter()
                .enumerate()
                .min_by_key(|(index, slot)| (slot.time, slot.ids.len(), *index))
                .map(|(index, _)| index)
                .expect("at least one partition");
            slots[target].time += duration;
            slots[target].ids.extend(groups[&key].iter().cloned());
        }
    };
    consume(timed, &mut slots);
    consume(partially_timed, &mut slots);

    for (target, key) in (0..concurrency).cycle().zip(untimed) {
        slots[target].ids.extend(groups[&key].iter().cloned());
    }

    slots.into_iter().map(|slot| slot.ids).collect()
}
