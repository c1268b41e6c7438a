//! Score-ordered member set used by the in-process KV backend

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::ops::Bound;

/// f64 with a total order so it can key a BTreeSet
#[derive(Debug, Clone, Copy)]
struct Score(f64);

impl PartialEq for Score {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0) == Ordering::Equal
    }
}

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Members ordered by (score, member), matching Redis ordering for ties
#[derive(Debug, Clone, Default)]
pub struct SortedSet {
    scores: HashMap<String, f64>,
    ordered: BTreeSet<(Score, String)>,
}

impl SortedSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or re-score a member; true if it was not present before
    pub fn insert(&mut self, member: &str, score: f64) -> bool {
        match self.scores.insert(member.to_string(), score) {
            Some(previous) => {
                self.ordered.remove(&(Score(previous), member.to_string()));
                self.ordered.insert((Score(score), member.to_string()));
                false
            }
            None => {
                self.ordered.insert((Score(score), member.to_string()));
                true
            }
        }
    }

    pub fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                self.ordered.remove(&(Score(score), member.to_string()));
                true
            }
            None => false,
        }
    }

    pub fn score(&self, member: &str) -> Option<f64> {
        self.scores.get(member).copied()
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// All members in ascending (score, member) order
    pub fn members(&self) -> impl DoubleEndedIterator<Item = &str> {
        self.ordered.iter().map(|(_, member)| member.as_str())
    }

    /// Members with `min <= score <= max`, ascending
    pub fn range_by_score(&self, min: f64, max: f64) -> Vec<&str> {
        if min > max {
            return Vec::new();
        }
        self.ordered
            .range((Bound::Included((Score(min), String::new())), Bound::Unbounded))
            .take_while(|(score, _)| score.0 <= max)
            .map(|(_, member)| member.as_str())
            .collect()
    }

    /// Remove members with `min <= score <= max`, returning how many went
    pub fn remove_range_by_score(&mut self, min: f64, max: f64) -> u64 {
        let doomed: Vec<String> = self
            .range_by_score(min, max)
            .into_iter()
            .map(String::from)
            .collect();
        for member in &doomed {
            self.remove(member);
        }
        doomed.len() as u64
    }
}
