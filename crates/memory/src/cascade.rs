//! The recall strategy ladder.
//!
//! Rungs are tried in a fixed order; the first rung with any candidate wins
//! and later rungs never run:
//!
//! 1. `AND`          — all normalized terms co-occur.
//! 2. `REDUCED_AND`  — drop the shortest droppable term and retry, down to
//!    one term. Identifiers are dropped last: a query that names
//!    `write_item` should lose its filler words first.
//! 3. `PREFIX_AND`   — star-expand terms of length ≥ 5. Skipped when the
//!    bound tokenizer stems (stemming already matches inflections).
//! 4. `OR_FALLBACK`  — any term matches; ranked by coverage (distinct query
//!    terms present), BM25 order breaking ties via stable sort.
//! 5. `LIKE`         — substring scan, only when FTS5 is unavailable.
//!
//! Mount scoping post-filters results against the mount's corpus rows; the
//! ladder itself is unchanged (FTS `MATCH` does not compose with joins
//! portably).

use std::collections::HashSet;

use rusqlite::params;
use tracing::debug;

use crate::error::Result;
use crate::schema::{MemoryItem, SearchFilters, SearchMeta, SearchStrategy};
use crate::store::{MemoryStore, item_from_row};

/// Cap on raw FTS candidates examined per rung.
const CANDIDATE_CAP: usize = 200;

/// Minimum term length for prefix expansion.
const PREFIX_MIN_LEN: usize = 5;

pub(crate) fn search(
    store: &MemoryStore,
    raw_query: &str,
    filters: &SearchFilters,
    limit: usize,
) -> Result<(Vec<MemoryItem>, SearchMeta)> {
    let normalized = memctl_text::normalize_query(raw_query);
    let mut terms: Vec<String> = normalized.split_whitespace().map(String::from).collect();
    if terms.is_empty() {
        // Everything was a stop word; search with the raw tokens instead of
        // returning nothing for a legitimate query like "what is this".
        terms = raw_query.split_whitespace().map(String::from).collect();
    }
    let original_terms = terms.clone();

    if terms.is_empty() {
        return Ok((
            Vec::new(),
            SearchMeta {
                strategy: SearchStrategy::And,
                original_terms,
                effective_terms: Vec::new(),
                dropped_terms: Vec::new(),
                candidate_count: 0,
                top_score: None,
            },
        ));
    }

    let mount_scope = match &filters.mount_id {
        Some(mount_id) => Some(mount_item_ids(store, mount_id)?),
        None => None,
    };

    if !store.fts_available() {
        return like_scan(store, &original_terms, filters, mount_scope.as_ref(), limit);
    }

    // ── AND ──────────────────────────────────────────────────────────────────
    let match_expr = terms.iter().map(|t| quote(t)).collect::<Vec<_>>().join(" AND ");
    let candidates = fts_candidates(store, &match_expr)?;
    if !candidates.is_empty() {
        let items = materialize(store, &candidates, filters, mount_scope.as_ref(), limit)?;
        return Ok((
            items,
            meta(SearchStrategy::And, &original_terms, &terms, &[], &candidates),
        ));
    }

    // ── REDUCED_AND ──────────────────────────────────────────────────────────
    let mut dropped: Vec<String> = Vec::new();
    while terms.len() > 1 {
        let victim = drop_candidate(&terms);
        dropped.push(terms.remove(victim));
        let match_expr = terms.iter().map(|t| quote(t)).collect::<Vec<_>>().join(" AND ");
        let candidates = fts_candidates(store, &match_expr)?;
        if !candidates.is_empty() {
            let items = materialize(store, &candidates, filters, mount_scope.as_ref(), limit)?;
            return Ok((
                items,
                meta(
                    SearchStrategy::ReducedAnd,
                    &original_terms,
                    &terms,
                    &dropped,
                    &candidates,
                ),
            ));
        }
    }

    // ── PREFIX_AND ───────────────────────────────────────────────────────────
    if !store.tokenizer().stems() {
        let starred: Vec<String> = original_terms
            .iter()
            .map(|t| {
                if t.chars().count() >= PREFIX_MIN_LEN {
                    format!("{}*", quote(t))
                } else {
                    quote(t)
                }
            })
            .collect();
        let match_expr = starred.join(" AND ");
        let candidates = fts_candidates(store, &match_expr)?;
        if !candidates.is_empty() {
            let items = materialize(store, &candidates, filters, mount_scope.as_ref(), limit)?;
            return Ok((
                items,
                meta(
                    SearchStrategy::PrefixAnd,
                    &original_terms,
                    &starred,
                    &[],
                    &candidates,
                ),
            ));
        }
    }

    // ── OR_FALLBACK ──────────────────────────────────────────────────────────
    let match_expr = original_terms
        .iter()
        .map(|t| quote(t))
        .collect::<Vec<_>>()
        .join(" OR ");
    let candidates = fts_candidates(store, &match_expr)?;
    if !candidates.is_empty() {
        let mut items = materialize(
            store,
            &candidates,
            filters,
            mount_scope.as_ref(),
            CANDIDATE_CAP,
        )?;
        // Coverage ranking: distinct query terms present, descending; the
        // underlying BM25 order survives ties because the sort is stable.
        let query_terms: Vec<String> = original_terms.iter().map(|t| t.to_lowercase()).collect();
        items.sort_by_key(|item| std::cmp::Reverse(coverage(item, &query_terms)));
        items.truncate(limit);
        return Ok((
            items,
            meta(
                SearchStrategy::OrFallback,
                &original_terms,
                &original_terms,
                &[],
                &candidates,
            ),
        ));
    }

    debug!(query = raw_query, "cascade exhausted with no candidates");
    Ok((
        Vec::new(),
        SearchMeta {
            strategy: SearchStrategy::OrFallback,
            original_terms: original_terms.clone(),
            effective_terms: original_terms,
            dropped_terms: dropped,
            candidate_count: 0,
            top_score: None,
        },
    ))
}

/// Index of the term REDUCED_AND should drop next: the shortest
/// non-identifier, or the shortest term overall when only identifiers
/// remain. Ties resolve to the later term.
fn drop_candidate(terms: &[String]) -> usize {
    let pick = |ids: bool| -> Option<usize> {
        terms
            .iter()
            .enumerate()
            .filter(|(_, t)| memctl_text::is_identifier(t) == ids)
            .min_by(|(ia, a), (ib, b)| {
                a.chars()
                    .count()
                    .cmp(&b.chars().count())
                    .then(ib.cmp(ia))
            })
            .map(|(i, _)| i)
    };
    pick(false).or_else(|| pick(true)).unwrap_or(0)
}

/// FTS5 string-quote a term (embedded quotes doubled).
fn quote(term: &str) -> String {
    format!("\"{}\"", term.replace('"', "\"\""))
}

/// Run one MATCH and return (item_id, bm25) ordered best-first with a
/// deterministic id tie-break.
fn fts_candidates(store: &MemoryStore, match_expr: &str) -> Result<Vec<(String, f64)>> {
    let mut stmt = store.conn().prepare(
        "SELECT item_id, bm25(memory_fts) AS rank
         FROM memory_fts WHERE memory_fts MATCH ?1
         ORDER BY rank, item_id LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![match_expr, CANDIDATE_CAP as i64], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
    })?;
    let mut candidates = Vec::new();
    for row in rows {
        candidates.push(row?);
    }
    Ok(candidates)
}

/// Fetch candidate items in rank order and apply read-side filters.
fn materialize(
    store: &MemoryStore,
    candidates: &[(String, f64)],
    filters: &SearchFilters,
    mount_scope: Option<&HashSet<String>>,
    limit: usize,
) -> Result<Vec<MemoryItem>> {
    let mut items = Vec::new();
    for (item_id, _) in candidates {
        if items.len() >= limit {
            break;
        }
        let Some(item) = store.read_item(item_id)? else {
            continue;
        };
        if !passes(&item, filters, mount_scope) {
            continue;
        }
        items.push(item);
    }
    Ok(items)
}

fn passes(
    item: &MemoryItem,
    filters: &SearchFilters,
    mount_scope: Option<&HashSet<String>>,
) -> bool {
    if !filters.include_archived && item.archived {
        return false;
    }
    if filters.injectable_only && !item.injectable {
        return false;
    }
    if let Some(tier) = filters.tier {
        if item.tier != tier {
            return false;
        }
    }
    if let Some(item_type) = &filters.item_type {
        if &item.item_type != item_type {
            return false;
        }
    }
    if let Some(scope) = &filters.scope {
        if item.scope.as_deref().unwrap_or("") != scope {
            return false;
        }
    }
    if let Some(scope_ids) = mount_scope {
        if !scope_ids.contains(&item.id) {
            return false;
        }
    }
    true
}

/// Distinct lowercased query terms appearing in the item's searchable text.
fn coverage(item: &MemoryItem, query_terms: &[String]) -> usize {
    let text = format!("{} {} {}", item.title, item.content, item.tags.join(" "));
    let tokens = memctl_text::tokenize(&text);
    query_terms
        .iter()
        .filter(|t| tokens.contains(t.as_str()))
        .count()
}

/// Item ids produced from a mount's corpus files; used for scoped recall.
fn mount_item_ids(store: &MemoryStore, mount_id: &str) -> Result<HashSet<String>> {
    let mut ids = HashSet::new();
    for row in store.list_corpus_hashes(Some(mount_id))? {
        ids.extend(row.item_ids);
    }
    Ok(ids)
}

/// Substring fallback when FTS5 is unavailable. No ranking guarantee.
fn like_scan(
    store: &MemoryStore,
    terms: &[String],
    filters: &SearchFilters,
    mount_scope: Option<&HashSet<String>>,
    limit: usize,
) -> Result<(Vec<MemoryItem>, SearchMeta)> {
    let mut seen = HashSet::new();
    let mut candidates = Vec::new();
    for term in terms {
        let pattern = format!("%{term}%");
        let mut stmt = store.conn().prepare(&format!(
            "SELECT {} FROM memory_items
             WHERE title LIKE ?1 OR content LIKE ?1
             ORDER BY id LIMIT ?2",
            crate::store::ITEM_COLUMNS
        ))?;
        let rows = stmt.query_map(params![pattern, CANDIDATE_CAP as i64], item_from_row)?;
        for row in rows {
            let item = row?;
            if seen.insert(item.id.clone()) {
                candidates.push(item);
            }
        }
    }

    let candidate_count = candidates.len();
    let items: Vec<MemoryItem> = candidates
        .into_iter()
        .filter(|item| passes(item, filters, mount_scope))
        .take(limit)
        .collect();

    Ok((
        items,
        SearchMeta {
            strategy: SearchStrategy::Like,
            original_terms: terms.to_vec(),
            effective_terms: terms.to_vec(),
            dropped_terms: Vec::new(),
            candidate_count,
            top_score: None,
        },
    ))
}

fn meta(
    strategy: SearchStrategy,
    original: &[String],
    effective: &[String],
    dropped: &[String],
    candidates: &[(String, f64)],
) -> SearchMeta {
    SearchMeta {
        strategy,
        original_terms: original.to_vec(),
        effective_terms: effective.to_vec(),
        dropped_terms: dropped.to_vec(),
        candidate_count: candidates.len(),
        // bm25() reports better matches as smaller values; flip the sign so
        // the reported score reads higher-is-better.
        top_score: candidates.first().map(|(_, rank)| -rank),
    }
}
