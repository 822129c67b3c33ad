//! Token-set similarity used for loop convergence and query-cycle detection.
//!
//! Two independent scores combined by simple average:
//!
//! 1. **Normalized Jaccard** over the token *sets* of both strings.
//! 2. **Longest-common-subsequence ratio** over the token *sequences*,
//!    normalized to `[0, 1]` by the longer sequence.
//!
//! Tokens are lowercased alphanumeric runs. Both scores are order-free of
//! any clock or randomness, so the same pair of strings always yields the
//! same result.

use std::collections::BTreeSet;

/// Lowercased alphanumeric runs of `text`, as an ordered set.
pub fn tokenize(text: &str) -> BTreeSet<String> {
    token_seq(text).into_iter().collect()
}

/// Lowercased alphanumeric runs of `text`, in order of appearance.
fn token_seq(text: &str) -> Vec<String> {
    text.split(|ch: char| !ch.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Jaccard index of the token sets of `a` and `b`.
///
/// Two empty strings are identical (1.0); one empty side scores 0.0.
pub fn jaccard(a: &str, b: &str) -> f64 {
    let set_a = tokenize(a);
    let set_b = tokenize(b);
    if set_a.is_empty() && set_b.is_empty() {
        return 1.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}

/// Longest-common-subsequence ratio of the token sequences of `a` and `b`,
/// normalized by the longer sequence.
pub fn lcs_ratio(a: &str, b: &str) -> f64 {
    let seq_a = token_seq(a);
    let seq_b = token_seq(b);
    if seq_a.is_empty() && seq_b.is_empty() {
        return 1.0;
    }
    let longest = seq_a.len().max(seq_b.len());
    if longest == 0 {
        return 0.0;
    }
    lcs_len(&seq_a, &seq_b) as f64 / longest as f64
}

/// Classic two-row LCS dynamic program over token slices.
fn lcs_len(a: &[String], b: &[String]) -> usize {
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];
    for tok_a in a {
        for (j, tok_b) in b.iter().enumerate() {
            curr[j + 1] = if tok_a == tok_b {
                prev[j] + 1
            } else {
                prev[j + 1].max(curr[j])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Mean of [`jaccard`] and [`lcs_ratio`].
pub fn combined_similarity(a: &str, b: &str) -> f64 {
    (jaccard(a, b) + lcs_ratio(a, b)) / 2.0
}

/// Whether two consecutive answers are similar enough to count as a stable
/// pair (loop convergence).
pub fn is_fixed_point(a: &str, b: &str, threshold: f64) -> bool {
    combined_similarity(a, b) >= threshold
}

/// Whether `query` repeats any prior query above `threshold`.
pub fn is_query_cycle(query: &str, history: &[String], threshold: f64) -> bool {
    history
        .iter()
        .any(|prior| combined_similarity(query, prior) >= threshold)
}
