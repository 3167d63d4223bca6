//! Type-aware comparison of program output against expected output.

use itertools::{EitherOrBoth, Itertools};
use serde_json::{Number, Value};

use crate::core::domain::{ComparePolicy, ExpectedOutput, FloatTolerance, WhitespaceMode};

#[derive(Clone, Debug, PartialEq)]
pub enum Comparison {
    Match,
    Mismatch { actual: String },
}

impl Comparison {
    pub fn is_match(&self) -> bool {
        matches!(self, Comparison::Match)
    }
}

pub fn compare_output(expected: &ExpectedOutput, stdout: &str, policy: &ComparePolicy) -> Comparison {
    match expected {
        ExpectedOutput::Value(expected) => {
            // The harness writes the return value as the last line.
            let line = stdout.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
            match serde_json::from_str::<Value>(line.trim()) {
                Ok(actual) if values_match(expected, &actual, policy) => Comparison::Match,
                Ok(actual) => Comparison::Mismatch {
                    actual: actual.to_string(),
                },
                Err(_) => Comparison::Mismatch {
                    actual: line.to_string(),
                },
            }
        }
        ExpectedOutput::Text(expected) => {
            if text_matches(expected, stdout, policy) {
                Comparison::Match
            } else {
                Comparison::Mismatch {
                    actual: stdout.to_string(),
                }
            }
        }
    }
}

pub fn values_match(expected: &Value, actual: &Value, policy: &ComparePolicy) -> bool {
    match (expected, actual) {
        (Value::Number(e), Value::Number(a)) => numbers_match(e, a, policy.float_tolerance),
        (Value::Array(e), Value::Array(a)) => {
            if e.len() != a.len() {
                return false;
            }
            if policy.order_sensitive {
                e.iter().zip(a).all(|(e, a)| values_match(e, a, policy))
            } else {
                multiset_match(e, a, policy)
            }
        }
        (Value::Object(e), Value::Object(a)) => {
            e.len() == a.len()
                && e.iter()
                    .all(|(key, e)| a.get(key).is_some_and(|a| values_match(e, a, policy)))
        }
        (e, a) => e == a,
    }
}

/// Integers compare exactly; anything fractional compares exactly unless
/// the problem declared a tolerance.
fn numbers_match(expected: &Number, actual: &Number, tolerance: Option<FloatTolerance>) -> bool {
    match (integer(expected), integer(actual)) {
        (Some(e), Some(a)) => return e == a,
        (Some(n), None) if tolerance.is_none() => return actual.as_f64().is_some_and(|a| integral_equals(a, n)),
        (None, Some(n)) if tolerance.is_none() => return expected.as_f64().is_some_and(|e| integral_equals(e, n)),
        _ => {}
    }
    let (Some(e), Some(a)) = (expected.as_f64(), actual.as_f64()) else {
        return false;
    };
    match tolerance {
        Some(tolerance) => tolerance.accepts(e, a),
        None => e == a,
    }
}

/// Every JSON integer fits in an `i128`, signed or not.
fn integer(n: &Number) -> Option<i128> {
    n.as_i64().map(i128::from).or_else(|| n.as_u64().map(i128::from))
}

fn integral_equals(float: f64, integer: i128) -> bool {
    // 2^127 is exact in an f64; anything at or beyond it cannot equal an i128.
    const BOUND: f64 = 170_141_183_460_469_231_731_687_303_715_884_105_728.0;
    float.fract() == 0.0 && float.abs() < BOUND && float as i128 == integer
}

fn multiset_match(expected: &[Value], actual: &[Value], policy: &ComparePolicy) -> bool {
    if policy.float_tolerance.is_some() {
        return perfect_matching(expected, actual, policy);
    }
    // Exact matching is an equivalence, so any first match is as good as another.
    let mut used = vec![false; actual.len()];
    expected.iter().all(|e| {
        let found = actual
            .iter()
            .enumerate()
            .find(|(i, a)| !used[*i] && values_match(e, a, policy))
            .map(|(i, _)| i);
        match found {
            Some(i) => {
                used[i] = true;
                true
            }
            None => false,
        }
    })
}

/// A tolerance is not transitive, so pair elements with augmenting paths
/// (Kuhn's algorithm) rather than first fit.
fn perfect_matching(expected: &[Value], actual: &[Value], policy: &ComparePolicy) -> bool {
    let candidates = expected
        .iter()
        .map(|e| {
            actual
                .iter()
                .positions(|a| values_match(e, a, policy))
                .collect_vec()
        })
        .collect_vec();
    if candidates.iter().any(Vec::is_empty) {
        return false;
    }

    let mut owner: Vec<Option<usize>> = vec![None; actual.len()];
    (0..expected.len()).all(|i| {
        let mut visited = vec![false; actual.len()];
        augment(i, &candidates, &mut owner, &mut visited)
    })
}

fn augment(i: usize, candidates: &[Vec<usize>], owner: &mut [Option<usize>], visited: &mut [bool]) -> bool {
    for &j in &candidates[i] {
        if visited[j] {
            continue;
        }
        visited[j] = true;
        let free = match owner[j] {
            None => true,
            Some(k) => augment(k, candidates, owner, visited),
        };
        if free {
            owner[j] = Some(i);
            return true;
        }
    }
    false
}

pub fn text_matches(expected: &str, actual: &str, policy: &ComparePolicy) -> bool {
    let tolerance = policy.float_tolerance;
    match policy.whitespace {
        WhitespaceMode::Exact => expected == actual,
        WhitespaceMode::Trailing => {
            let mut expected = significant_lines(expected);
            let mut actual = significant_lines(actual);
            if !policy.order_sensitive {
                expected.sort_unstable();
                actual.sort_unstable();
            }
            expected
                .iter()
                .zip_longest(actual.iter())
                .all(|pair| match pair {
                    EitherOrBoth::Both(e, a) => line_matches(e, a, tolerance),
                    _ => false,
                })
        }
        WhitespaceMode::Tokens => {
            let mut expected = expected.split_whitespace().collect_vec();
            let mut actual = actual.split_whitespace().collect_vec();
            if !policy.order_sensitive {
                expected.sort_unstable();
                actual.sort_unstable();
            }
            expected
                .iter()
                .zip_longest(actual.iter())
                .all(|pair| match pair {
                    EitherOrBoth::Both(e, a) => token_matches(e, a, tolerance),
                    _ => false,
                })
        }
    }
}

fn significant_lines(text: &str) -> Vec<&str> {
    let mut lines = text.lines().map(str::trim_end).collect_vec();
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines
}

fn line_matches(expected: &str, actual: &str, tolerance: Option<FloatTolerance>) -> bool {
    if expected == actual {
        return true;
    }
    if tolerance.is_none() {
        return false;
    }
    expected
        .split_whitespace()
        .zip_longest(actual.split_whitespace())
        .all(|pair| match pair {
            EitherOrBoth::Both(e, a) => token_matches(e, a, tolerance),
            _ => false,
        })
}

fn token_matches(expected: &str, actual: &str, tolerance: Option<FloatTolerance>) -> bool {
    if expected == actual {
        return true;
    }
    let Some(tolerance) = tolerance else {
        return false;
    };
    match (expected.parse::<f64>(), actual.parse::<f64>()) {
        (Ok(e), Ok(a)) => tolerance.accepts(e, a),
        _ => false,
    }
}
