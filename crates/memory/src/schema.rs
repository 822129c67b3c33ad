//! The memctl data model: items, proposals, events, links, corpus hashes,
//! mounts, and search metadata.
//!
//! Everything here is a plain serde value object; the store owns the rows
//! and hands out deep copies. Closed vocabularies (tier, link kind, event
//! action, search strategy) are tagged enums — string forms exist only at
//! the serialization boundary.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Lifecycle tier of a memory item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MemoryTier {
    Stm,
    Mtm,
    Ltm,
}

impl MemoryTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryTier::Stm => "STM",
            MemoryTier::Mtm => "MTM",
            MemoryTier::Ltm => "LTM",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "STM" => Some(MemoryTier::Stm),
            "MTM" => Some(MemoryTier::Mtm),
            "LTM" => Some(MemoryTier::Ltm),
            _ => None,
        }
    }
}

/// Directed relationship label between two items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkKind {
    Supersedes,
    Supports,
    Contradicts,
    Refines,
}

impl LinkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkKind::Supersedes => "supersedes",
            LinkKind::Supports => "supports",
            LinkKind::Contradicts => "contradicts",
            LinkKind::Refines => "refines",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "supersedes" => Some(LinkKind::Supersedes),
            "supports" => Some(LinkKind::Supports),
            "contradicts" => Some(LinkKind::Contradicts),
            "refines" => Some(LinkKind::Refines),
            _ => None,
        }
    }
}

/// Audit event action. Append-only; one row per store mutation or notable
/// read-side operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventAction {
    Write,
    Read,
    Update,
    Archive,
    Consolidate,
    Search,
    LoopIter,
    PolicyReject,
    PolicyQuarantine,
    Reindex,
    Sync,
    Mount,
    Import,
    Export,
}

impl EventAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventAction::Write => "write",
            EventAction::Read => "read",
            EventAction::Update => "update",
            EventAction::Archive => "archive",
            EventAction::Consolidate => "consolidate",
            EventAction::Search => "search",
            EventAction::LoopIter => "loop_iter",
            EventAction::PolicyReject => "policy_reject",
            EventAction::PolicyQuarantine => "policy_quarantine",
            EventAction::Reindex => "reindex",
            EventAction::Sync => "sync",
            EventAction::Mount => "mount",
            EventAction::Import => "import",
            EventAction::Export => "export",
        }
    }
}

/// Where an item came from and why it deserved storage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Provenance {
    /// Source kind: `cli`, `ingest`, `import`, `chat`, `mcp`, ...
    pub kind: String,
    /// Source identifier: a path, a session id, a tool name.
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub why_store: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl Provenance {
    pub fn new(kind: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            source: source.into(),
            why_store: None,
            session_id: None,
        }
    }

    pub fn is_present(&self) -> bool {
        !self.kind.trim().is_empty() && !self.source.trim().is_empty()
    }
}

/// The primary unit of memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryItem {
    /// UUID v7 string — lexicographically sortable, stable for life.
    pub id: String,
    pub title: String,
    pub content: String,
    /// Always `SHA256(content)` in lowercase hex.
    pub content_hash: String,
    pub tier: MemoryTier,
    /// Open vocabulary: `fact`, `decision`, `convention`, `note`, `pointer`, ...
    pub item_type: String,
    /// Normalized: sorted, deduplicated, lowercased.
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    pub injectable: bool,
    pub archived: bool,
    pub usage_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub provenance: Provenance,
}

impl MemoryItem {
    /// Build a fresh STM item with a minted id and computed content hash.
    pub fn new(
        title: impl Into<String>,
        content: impl Into<String>,
        item_type: impl Into<String>,
        tags: Vec<String>,
        provenance: Provenance,
    ) -> Self {
        let content = content.into();
        let now = Utc::now();
        Self {
            id: Uuid::now_v7().to_string(),
            title: title.into(),
            content_hash: content_hash(&content),
            content,
            tier: MemoryTier::Stm,
            item_type: item_type.into(),
            tags: normalize_tags(tags),
            scope: None,
            injectable: true,
            archived: false,
            usage_count: 0,
            created_at: now,
            updated_at: now,
            provenance,
        }
    }

    /// Recompute the hash from current content (content-addressing invariant).
    pub fn rehash(&mut self) {
        self.content_hash = content_hash(&self.content);
    }
}

/// Candidate item submitted for policy evaluation before any write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryProposal {
    pub title: String,
    pub content: String,
    pub item_type: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    pub provenance: Provenance,
    /// Required justification — a proposal without one is quarantined.
    pub why_store: String,
}

impl MemoryProposal {
    /// Promote an evaluated proposal to an item (the caller supplies the
    /// verdict's injectable flag).
    pub fn into_item(self, injectable: bool) -> MemoryItem {
        let mut provenance = self.provenance;
        if provenance.why_store.is_none() && !self.why_store.trim().is_empty() {
            provenance.why_store = Some(self.why_store);
        }
        let mut item = MemoryItem::new(self.title, self.content, self.item_type, self.tags, provenance);
        item.scope = self.scope;
        item.injectable = injectable;
        item
    }
}

/// Immutable audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEvent {
    pub action: EventAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Directed typed link between two items.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryLink {
    pub from_id: String,
    pub to_id: String,
    pub kind: LinkKind,
    pub created_at: DateTime<Utc>,
}

/// One row per ingested file; the idempotence anchor for re-ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorpusHash {
    /// SHA-256 of the file bytes, lowercase hex.
    pub file_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_id: Option<String>,
    pub rel_path: String,
    pub extension: String,
    pub size_bytes: u64,
    pub mtime_epoch: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lang_hint: Option<String>,
    /// Item ids produced by chunking this file.
    pub item_ids: Vec<String>,
    pub archived: bool,
}

/// A registered folder; the unit of scoping and delta sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mount {
    pub id: String,
    pub path: String,
    pub display_name: String,
    #[serde(default)]
    pub ignore_patterns: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lang_hint: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// FTS tokenizer binding metadata (single row).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenizerMeta {
    pub tokenizer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reindex_at: Option<DateTime<Utc>>,
    pub reindex_count: i64,
}

/// Which rung of the cascade produced a result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SearchStrategy {
    And,
    ReducedAnd,
    PrefixAnd,
    OrFallback,
    Like,
}

impl SearchStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchStrategy::And => "AND",
            SearchStrategy::ReducedAnd => "REDUCED_AND",
            SearchStrategy::PrefixAnd => "PREFIX_AND",
            SearchStrategy::OrFallback => "OR_FALLBACK",
            SearchStrategy::Like => "LIKE",
        }
    }
}

/// How a recall was answered: which strategy, which terms survived.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchMeta {
    pub strategy: SearchStrategy,
    pub original_terms: Vec<String>,
    pub effective_terms: Vec<String>,
    pub dropped_terms: Vec<String>,
    pub candidate_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_score: Option<f64>,
}

/// Read-side filters applied after the cascade.
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub tier: Option<MemoryTier>,
    pub item_type: Option<String>,
    pub scope: Option<String>,
    /// Restrict results to items produced from this mount's corpus.
    pub mount_id: Option<String>,
    pub include_archived: bool,
    /// Drop quarantined items (used when building injection blocks).
    pub injectable_only: bool,
}

/// Lowercase hex SHA-256 of a string.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Lowercase hex SHA-256 of raw bytes (file hashing).
pub fn bytes_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Sort, dedup, lowercase.
pub fn normalize_tags(tags: Vec<String>) -> Vec<String> {
    let mut tags: Vec<String> = tags
        .into_iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    tags.sort();
    tags.dedup();
    tags
}

/// RFC 3339 with second precision, always UTC.
pub fn to_rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_item_hashes_its_content() {
        let item = MemoryItem::new("t", "hello", "note", vec![], Provenance::new("cli", "stdin"));
        assert_eq!(item.content_hash, content_hash("hello"));
        assert_eq!(item.tier, MemoryTier::Stm);
        assert!(item.injectable);
    }

    #[test]
    fn tags_are_sorted_deduped_lowercased() {
        let tags = normalize_tags(vec![
            "Docs".to_string(),
            "api".to_string(),
            "docs".to_string(),
            "  ".to_string(),
        ]);
        assert_eq!(tags, vec!["api".to_string(), "docs".to_string()]);
    }

    #[test]
    fn proposal_justification_lands_in_provenance() {
        let proposal = MemoryProposal {
            title: "t".into(),
            content: "c".into(),
            item_type: "note".into(),
            tags: vec![],
            scope: None,
            provenance: Provenance::new("cli", "propose"),
            why_store: "captures a team decision".into(),
        };
        let item = proposal.into_item(true);
        assert_eq!(
            item.provenance.why_store.as_deref(),
            Some("captures a team decision")
        );
    }

    #[test]
    fn tier_round_trips_through_strings() {
        for tier in [MemoryTier::Stm, MemoryTier::Mtm, MemoryTier::Ltm] {
            assert_eq!(MemoryTier::parse(tier.as_str()), Some(tier));
        }
        assert_eq!(MemoryTier::parse("xtm"), None);
    }

    #[test]
    fn strategy_tags_match_wire_names() {
        assert_eq!(SearchStrategy::ReducedAnd.as_str(), "REDUCED_AND");
        assert_eq!(SearchStrategy::OrFallback.as_str(), "OR_FALLBACK");
    }
}
