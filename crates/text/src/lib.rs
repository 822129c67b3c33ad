//! Deterministic text utilities shared by recall, consolidation, and the
//! loop controller: token-set similarity, query normalization, and intent
//! classification. No I/O, no clock.

mod query;
mod similarity;

pub use query::{QueryMode, classify_mode, is_identifier, normalize_query, suggest_budget};
pub use similarity::{
    combined_similarity, is_fixed_point, is_query_cycle, jaccard, lcs_ratio, tokenize,
};
