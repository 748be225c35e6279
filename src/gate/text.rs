//! Text helpers shared by the transcript gate, reply sanitizing and the
//! barge-in probe.

use std::collections::HashSet;

/// Lowercases, maps everything outside `[a-z0-9\s']` to a space and collapses
/// whitespace.
pub fn normalize(text: &str) -> String {
    let mapped: String = text
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '\'' || c.is_whitespace() {
                c
            } else {
                ' '
            }
        })
        .collect();
    mapped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalized tokens, including single characters.
pub fn tokens(text: &str) -> Vec<String> {
    normalize(text).split(' ').filter(|t| !t.is_empty()).map(str::to_string).collect()
}

fn overlap_set(text: &str) -> HashSet<String> {
    tokens(text).into_iter().filter(|t| t.chars().count() >= 2).collect()
}

/// Jaccard overlap of the two texts' token sets, ignoring one-letter tokens.
/// Zero when either side has no tokens.
pub fn token_overlap(a: &str, b: &str) -> f64 {
    let left = overlap_set(a);
    let right = overlap_set(b);
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }
    let shared = left.intersection(&right).count();
    let union = left.union(&right).count();
    shared as f64 / union as f64
}

pub fn alnum_count(text: &str) -> usize {
    text.chars().filter(|c| c.is_alphanumeric()).count()
}

/// Length of the longest run of one repeated non-space character.
pub fn longest_char_run(text: &str) -> usize {
    let mut longest = 0;
    let mut current = 0;
    let mut previous: Option<char> = None;
    for c in text.chars() {
        if c.is_whitespace() {
            previous = None;
            current = 0;
            continue;
        }
        if previous == Some(c) {
            current += 1;
        } else {
            current = 1;
            previous = Some(c);
        }
        longest = longest.max(current);
    }
    longest
}

/// Distinct alphanumeric characters over all alphanumeric characters.
pub fn char_diversity(text: &str) -> f64 {
    let chars: Vec<char> = text.chars().filter(|c| c.is_alphanumeric()).collect();
    if chars.is_empty() {
        return 0.0;
    }
    let distinct: HashSet<&char> = chars.iter().collect();
    distinct.len() as f64 / chars.len() as f64
}

pub fn token_diversity(tokens: &[String]) -> f64 {
    if tokens.is_empty() {
        return 0.0;
    }
    let distinct: HashSet<&String> = tokens.iter().collect();
    distinct.len() as f64 / tokens.len() as f64
}

/// Joins two transcript fragments without a space before trailing punctuation.
pub fn join_fragments(head: &str, tail: &str) -> String {
    let head = head.trim();
    let tail = tail.trim();
    if head.is_empty() {
        return tail.to_string();
    }
    if tail.is_empty() {
        return head.to_string();
    }
    if tail.starts_with([',', '.', '!', '?', ';', ':']) {
        format!("{head}{tail}")
    } else {
        format!("{head} {tail}")
    }
}
