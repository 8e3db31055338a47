// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Router
//!
//! Pure routing logic: given an exchange kind, its binding table and a routing key,
//! decide which queues receive a published message. No I/O happens here; brokers
//! call [`route`] on every publish.
//!
//! Topic binding keys are dot-separated words where `*` stands for exactly one word
//! and `#` for zero or more words. A `#` may be followed by more words, which then
//! have to match the tail of the routing key.

use crate::{exchange::ExchangeKind, message::MAX_ROUTING_KEY_LEN};
use std::collections::{BTreeMap, BTreeSet};

const WORD_SEPARATOR: char = '.';
const SINGLE_WORD: &str = "*";
const ANY_WORDS: &str = "#";

/// Binding patterns of one exchange, grouped per queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindingTable {
    bindings: BTreeMap<String, BTreeSet<String>>,
}

impl BindingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a binding. Binding the same pattern twice is a no-op.
    pub fn bind(&mut self, queue: &str, pattern: &str) {
        self.bindings
            .entry(queue.to_owned())
            .or_default()
            .insert(pattern.to_owned());
    }

    /// Drops every binding of `queue`.
    pub fn unbind_queue(&mut self, queue: &str) {
        self.bindings.remove(queue);
    }

    pub fn queues(&self) -> impl Iterator<Item = &str> {
        self.bindings.keys().map(String::as_str)
    }

}

/// Returns the set of queues a message published with `routing_key` is delivered to.
///
/// Each queue appears at most once, however many of its bindings match. Empty or
/// oversized keys never match a direct or topic binding.
pub fn route(kind: &ExchangeKind, bindings: &BindingTable, routing_key: &str) -> BTreeSet<String> {
    if *kind != ExchangeKind::Fanout && !is_valid_routing_key(routing_key) {
        return BTreeSet::new();
    }

    match kind {
        ExchangeKind::Fanout => bindings.queues().map(str::to_owned).collect(),
        ExchangeKind::Direct => select(bindings, |pattern| pattern == routing_key),
        ExchangeKind::Topic => {
            let key: Vec<&str> = routing_key.split(WORD_SEPARATOR).collect();
            select(bindings, |pattern| {
                let pattern: Vec<&str> = pattern.split(WORD_SEPARATOR).collect();
                topic_matches(&pattern, &key)
            })
        }
    }
}

fn select(bindings: &BindingTable, matches: impl Fn(&str) -> bool) -> BTreeSet<String> {
    bindings
        .bindings
        .iter()
        .filter(|(_, patterns)| patterns.iter().any(|p| matches(p)))
        .map(|(queue, _)| queue.clone())
        .collect()
}

fn is_valid_routing_key(routing_key: &str) -> bool {
    !routing_key.is_empty() && routing_key.len() <= MAX_ROUTING_KEY_LEN
}

/// Word-wise wildcard match of a topic binding pattern against a routing key.
///
/// Runs in a single pass, backtracking only to the most recent `#`: on a mismatch
/// that `#` absorbs one more key word and matching resumes right after it.
pub fn topic_matches(pattern: &[&str], key: &[&str]) -> bool {
    let (mut p, mut k) = (0, 0);
    // (pattern index after the last `#`, key index that `#` currently stops at)
    let mut resume: Option<(usize, usize)> = None;

    while k < key.len() {
        match pattern.get(p) {
            Some(&ANY_WORDS) => {
                resume = Some((p + 1, k));
                p += 1;
            }
            Some(&word) if word == SINGLE_WORD || word == key[k] => {
                p += 1;
                k += 1;
            }
            _ => match resume {
                Some((after_hash, absorbed)) => {
                    resume = Some((after_hash, absorbed + 1));
                    p = after_hash;
                    k = absorbed + 1;
                }
                None => return false,
            },
        }
    }

    pattern[p..].iter().all(|word| *word == ANY_WORDS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(pattern: &str, key: &str) -> bool {
        let mut table = BindingTable::new();
        table.bind("q", pattern);
        route(&ExchangeKind::Topic, &table, key).contains("q")
    }

    fn animals() -> BindingTable {
        let mut table = BindingTable::new();
        table.bind("Q1", "*.orange.*");
        table.bind("Q2", "*.*.rabbit");
        table.bind("Q2", "lazy.#");
        table
    }

    fn routed(table: &BindingTable, key: &str) -> Vec<String> {
        route(&ExchangeKind::Topic, table, key).into_iter().collect()
    }

    #[test]
    fn topic_animals() {
        let table = animals();

        assert_eq!(routed(&table, "quick.orange.rabbit"), vec!["Q1", "Q2"]);
        assert_eq!(routed(&table, "lazy.orange.elephant"), vec!["Q1", "Q2"]);
        assert_eq!(routed(&table, "quick.orange.fox"), vec!["Q1"]);
        assert_eq!(routed(&table, "lazy.brown.fox"), vec!["Q2"]);
        assert_eq!(routed(&table, "lazy.pink.rabbit"), vec!["Q2"]);
        assert!(routed(&table, "quick.brown.fox").is_empty());
    }

    #[test]
    fn topic_word_count_mismatch_is_dropped() {
        let table = animals();

        assert!(routed(&table, "orange").is_empty());
        assert!(routed(&table, "quick.orange.new.rabbit").is_empty());
        // reconciled by `#`
        assert_eq!(routed(&table, "lazy.orange.new.rabbit"), vec!["Q2"]);
    }

    #[test]
    fn hash_alone_matches_any_non_empty_key() {
        assert!(matches("#", "a"));
        assert!(matches("#", "a.b.c"));
        assert!(!matches("#", ""));
    }

    #[test]
    fn hash_matches_zero_words() {
        assert!(matches("lazy.#", "lazy"));
        assert!(matches("#.critical", "critical"));
        assert!(matches("kern.#.critical", "kern.critical"));
    }

    #[test]
    fn hash_with_trailing_anchor() {
        assert!(matches("#.critical", "kern.disk.critical"));
        assert!(!matches("#.critical", "kern.critical.info"));
        assert!(matches("#.b", "a.b.b"));
        assert!(matches("a.#.b.*", "a.x.b.y.b.z"));
        assert!(!matches("a.#.b.*", "a.x.b"));
        assert!(matches("#.#", "x"));
        assert!(matches("*.#.*", "x.y"));
        assert!(!matches("*.#.*", "x"));
    }

    #[test]
    fn literal_pattern_behaves_like_direct() {
        assert!(matches("kern.critical", "kern.critical"));
        assert!(!matches("kern.critical", "kern.critical.x"));
        assert!(!matches("kern.critical", "kern"));
    }

    #[test]
    fn oversized_topic_key_is_dropped() {
        let key = vec!["a"; 200].join(".");
        assert!(key.len() > MAX_ROUTING_KEY_LEN);
        assert!(!matches("#", &key));
    }

    #[test]
    fn fanout_ignores_routing_key() {
        let mut table = BindingTable::new();
        table.bind("a", "");
        table.bind("b", "whatever");

        for key in ["", "x", "quick.orange.rabbit"] {
            assert_eq!(
                route(&ExchangeKind::Fanout, &table, key).into_iter().collect::<Vec<_>>(),
                vec!["a", "b"]
            );
        }
    }

    #[test]
    fn direct_requires_exact_match() {
        let mut table = BindingTable::new();
        table.bind("errors", "error");
        table.bind("all", "info");
        table.bind("all", "warning");
        table.bind("all", "error");

        let routed = |key| {
            route(&ExchangeKind::Direct, &table, key)
                .into_iter()
                .collect::<Vec<_>>()
        };

        assert_eq!(routed("error"), vec!["all", "errors"]);
        assert_eq!(routed("info"), vec!["all"]);
        assert!(routed("*").is_empty());
        assert!(routed("critical").is_empty());
    }

    #[test]
    fn direct_never_matches_empty_or_oversized_key() {
        let long = "x".repeat(300);
        let mut table = BindingTable::new();
        table.bind("empty", "");
        table.bind("long", &long);

        assert!(route(&ExchangeKind::Direct, &table, "").is_empty());
        assert!(route(&ExchangeKind::Direct, &table, &long).is_empty());
    }

    #[test]
    fn unbind_queue_removes_all_patterns() {
        let mut table = animals();
        table.unbind_queue("Q2");

        assert_eq!(table.queues().collect::<Vec<_>>(), vec!["Q1"]);
        assert!(routed(&table, "lazy.brown.fox").is_empty());
    }
}
