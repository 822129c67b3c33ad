//! memctl's persistent memory store: a single SQLite file (WAL) holding
//! items, revisions, events, links, corpus hashes, and mounts, mirrored
//! into an FTS5 index for recall through the strategy cascade.

mod cascade;
mod consolidate;
mod error;
mod inject;
mod schema;
mod store;
mod transfer;

pub use consolidate::{ConsolidationReport, TAG_JACCARD_THRESHOLD, consolidate};
pub use error::{Result, StoreError};
pub use inject::{FORMAT_VERSION, estimate_tokens, render_injection_block};
pub use schema::{
    CorpusHash, EventAction, LinkKind, MemoryEvent, MemoryItem, MemoryLink, MemoryProposal,
    MemoryTier, Mount, Provenance, SearchFilters, SearchMeta, SearchStrategy, TokenizerMeta,
    bytes_hash, content_hash, normalize_tags, to_rfc3339,
};
pub use store::{MemoryStore, StoreStats, TokenizerPreset};
pub use transfer::{ImportOptions, ImportReport, export_items, import_items};
