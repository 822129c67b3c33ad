//! Corpus-side machinery: extractor dispatch, paragraph chunking, file
//! discovery, mount registration, 3-tier delta sync, and the structural
//! inspect digest.

mod chunk;
mod extract;
mod ingest;
mod inspect;
mod sync;

pub use chunk::{MAX_CHUNK_CHARS, ParagraphChunks, infer_tags, infer_title};
pub use extract::{ExtractError, Extractor, ExtractorRegistry};
pub use ingest::{FileOutcome, IngestReport, discover_files, ingest_file, ingest_paths};
pub use inspect::{InspectReport, is_stale};
pub use sync::{SyncMode, SyncReport, ensure_mount, sync_mount};
