//! Structural inspect: a deterministic corpus digest built purely from
//! `corpus_hashes` and `memory_mounts` rows — no file contents are read.
//!
//! Observations fire against four thresholds whose semantics are frozen
//! (values come from [`memctl_config::InspectConfig`]): folder dominance,
//! chunk density, extension concentration, and sparseness. Output paths are
//! always mount-relative.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use serde::Serialize;

use memctl_config::InspectConfig;
use memctl_memory::{MemoryStore, Mount, estimate_tokens};

use crate::ingest::{discover_files, mtime_epoch};

#[derive(Debug, Clone, Serialize)]
pub struct FolderStat {
    pub name: String,
    pub files: usize,
    pub chunks: usize,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtensionStat {
    pub extension: String,
    pub files: usize,
    pub chunks: usize,
    pub bytes: u64,
    /// Share of all chunks held by this extension, 0.0–1.0.
    pub chunk_share: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LargestFile {
    pub rel_path: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct InspectReport {
    pub mount_id: String,
    pub display_name: String,
    pub files: usize,
    pub chunks: usize,
    pub bytes: u64,
    pub folders: Vec<FolderStat>,
    pub extensions: Vec<ExtensionStat>,
    pub largest: Vec<LargestFile>,
    pub observations: Vec<String>,
    pub thresholds: InspectConfig,
    /// Orchestration metadata for the JSON variant.
    pub auto_mounted: bool,
    pub synced: bool,
}

impl InspectReport {
    pub fn build(store: &MemoryStore, mount: &Mount, config: &InspectConfig) -> Result<Self> {
        let rows: Vec<_> = store
            .list_corpus_hashes(Some(&mount.id))?
            .into_iter()
            .filter(|r| !r.archived)
            .collect();

        let files = rows.len();
        let chunks: usize = rows.iter().map(|r| r.item_ids.len()).sum();
        let bytes: u64 = rows.iter().map(|r| r.size_bytes).sum();

        let mut folder_map: BTreeMap<String, FolderStat> = BTreeMap::new();
        let mut ext_map: BTreeMap<String, (usize, usize, u64)> = BTreeMap::new();
        for row in &rows {
            let folder = if row.rel_path.contains('/') {
                row.rel_path.split('/').next().unwrap_or(".").to_string()
            } else {
                ".".to_string()
            };
            let entry = folder_map.entry(folder.clone()).or_insert(FolderStat {
                name: folder,
                files: 0,
                chunks: 0,
                bytes: 0,
            });
            entry.files += 1;
            entry.chunks += row.item_ids.len();
            entry.bytes += row.size_bytes;

            let ext = if row.extension.is_empty() {
                "(none)".to_string()
            } else {
                row.extension.clone()
            };
            let ext_entry = ext_map.entry(ext).or_insert((0, 0, 0));
            ext_entry.0 += 1;
            ext_entry.1 += row.item_ids.len();
            ext_entry.2 += row.size_bytes;
        }

        let folders: Vec<FolderStat> = folder_map.into_values().collect();
        let extensions: Vec<ExtensionStat> = ext_map
            .into_iter()
            .map(|(extension, (files, ext_chunks, bytes))| ExtensionStat {
                extension,
                files,
                chunks: ext_chunks,
                bytes,
                chunk_share: if chunks == 0 {
                    0.0
                } else {
                    ext_chunks as f64 / chunks as f64
                },
            })
            .collect();

        let mut largest: Vec<LargestFile> = rows
            .iter()
            .map(|r| LargestFile {
                rel_path: r.rel_path.clone(),
                size_bytes: r.size_bytes,
            })
            .collect();
        largest.sort_by(|a, b| b.size_bytes.cmp(&a.size_bytes).then(a.rel_path.cmp(&b.rel_path)));
        largest.truncate(5);

        let observations = observations(config, files, chunks, &folders, &extensions);

        Ok(Self {
            mount_id: mount.id.clone(),
            display_name: mount.display_name.clone(),
            files,
            chunks,
            bytes,
            folders,
            extensions,
            largest,
            observations,
            thresholds: *config,
            auto_mounted: false,
            synced: false,
        })
    }

    /// Token-budgeted text block; whole lines only.
    pub fn render_text(&self, token_budget: usize) -> String {
        let mut lines = vec![format!(
            "[inspect {}] files={} chunks={} bytes={}",
            self.display_name, self.files, self.chunks, self.bytes
        )];
        for folder in &self.folders {
            lines.push(format!(
                "  folder {}/: {} files, {} chunks",
                folder.name, folder.files, folder.chunks
            ));
        }
        for ext in &self.extensions {
            lines.push(format!(
                "  .{}: {} files, {} chunks ({:.0}%)",
                ext.extension,
                ext.files,
                ext.chunks,
                ext.chunk_share * 100.0
            ));
        }
        if !self.largest.is_empty() {
            lines.push("  largest:".to_string());
            for file in &self.largest {
                lines.push(format!("    {} ({} bytes)", file.rel_path, file.size_bytes));
            }
        }
        for obs in &self.observations {
            lines.push(format!("  note: {obs}"));
        }

        let mut block = String::new();
        let mut spent = 0usize;
        for line in lines {
            let cost = estimate_tokens(&line) + 1;
            if spent + cost > token_budget && !block.is_empty() {
                break;
            }
            if !block.is_empty() {
                block.push('\n');
            }
            block.push_str(&line);
            spent += cost;
        }
        block
    }
}

fn observations(
    config: &InspectConfig,
    files: usize,
    chunks: usize,
    folders: &[FolderStat],
    extensions: &[ExtensionStat],
) -> Vec<String> {
    let mut out = Vec::new();

    if chunks <= config.sparse_threshold {
        out.push(format!(
            "corpus is sparse ({chunks} chunk{} total)",
            if chunks == 1 { "" } else { "s" }
        ));
    }
    if chunks > 0 {
        for folder in folders {
            let share = folder.chunks as f64 / chunks as f64;
            if share >= config.dominance_frac && folder.name != "." {
                out.push(format!(
                    "folder {}/ holds {:.0}% of all chunks",
                    folder.name,
                    share * 100.0
                ));
            }
        }
        for ext in extensions {
            if ext.chunk_share >= config.ext_concentration_frac {
                out.push(format!(
                    ".{} holds {:.0}% of all chunks",
                    ext.extension,
                    ext.chunk_share * 100.0
                ));
            }
        }
    }
    if files > 0 {
        let density = chunks as f64 / files as f64;
        if density < config.low_density_threshold {
            out.push(format!(
                "low chunk density ({density:.2} chunks per file)"
            ));
        }
    }
    out
}

/// Compare (rel_path, size, mtime) triples on disk against stored rows.
/// Any difference means the mount is stale and a sync would change state.
pub fn is_stale(store: &MemoryStore, mount: &Mount) -> Result<bool> {
    let root = Path::new(&mount.path);
    let rows = store.list_corpus_hashes(Some(&mount.id))?;
    let stored: BTreeMap<&str, (u64, i64)> = rows
        .iter()
        .filter(|r| !r.archived)
        .map(|r| (r.rel_path.as_str(), (r.size_bytes, r.mtime_epoch)))
        .collect();

    let files = discover_files(root, &mount.ignore_patterns)?;
    let mut seen = 0usize;
    for abs_path in &files {
        let rel = abs_path
            .strip_prefix(root)
            .unwrap_or(abs_path)
            .to_string_lossy()
            .replace('\\', "/");
        let Ok(metadata) = std::fs::metadata(abs_path) else {
            return Ok(true);
        };
        match stored.get(rel.as_str()) {
            None => return Ok(true),
            Some(&(size, mtime)) => {
                if size != metadata.len() || mtime != mtime_epoch(&metadata) {
                    return Ok(true);
                }
            }
        }
        seen += 1;
    }
    Ok(seen != stored.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use memctl_memory::{CorpusHash, TokenizerPreset};

    fn mount() -> Mount {
        Mount {
            id: "m-1".to_string(),
            path: "/corpus".to_string(),
            display_name: "corpus".to_string(),
            ignore_patterns: Vec::new(),
            lang_hint: None,
            created_at: Utc::now(),
        }
    }

    fn open_store() -> (tempfile::TempDir, MemoryStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = MemoryStore::open(&dir.path().join("memory.db"), TokenizerPreset::Fr)
            .expect("open store");
        (dir, store)
    }

    fn row(rel_path: &str, ext: &str, size: u64, n_items: usize) -> CorpusHash {
        CorpusHash {
            file_hash: format!("hash-{rel_path}"),
            mount_id: Some("m-1".to_string()),
            rel_path: rel_path.to_string(),
            extension: ext.to_string(),
            size_bytes: size,
            mtime_epoch: 1_700_000_000,
            lang_hint: None,
            item_ids: (0..n_items).map(|i| format!("{rel_path}-{i}")).collect(),
            archived: false,
        }
    }

    #[test]
    fn totals_and_breakdowns_are_computed() {
        let (_dir, mut store) = open_store();
        store.upsert_corpus_hash(&row("docs/a.md", "md", 100, 3)).expect("row");
        store.upsert_corpus_hash(&row("docs/b.md", "md", 50, 2)).expect("row");
        store.upsert_corpus_hash(&row("src/main.rs", "rs", 200, 1)).expect("row");

        let report =
            InspectReport::build(&store, &mount(), &InspectConfig::default()).expect("build");
        assert_eq!(report.files, 3);
        assert_eq!(report.chunks, 6);
        assert_eq!(report.bytes, 350);
        assert_eq!(report.folders.len(), 2);
        assert_eq!(report.extensions.len(), 2);
        assert_eq!(report.largest[0].rel_path, "src/main.rs");
    }

    #[test]
    fn dominance_observation_fires_at_threshold() {
        let (_dir, mut store) = open_store();
        store.upsert_corpus_hash(&row("big/a.md", "md", 10, 8)).expect("row");
        store.upsert_corpus_hash(&row("small/b.md", "md", 10, 2)).expect("row");

        let report =
            InspectReport::build(&store, &mount(), &InspectConfig::default()).expect("build");
        assert!(
            report.observations.iter().any(|o| o.contains("big/")),
            "got: {:?}",
            report.observations
        );
    }

    #[test]
    fn extension_concentration_observation_fires() {
        let (_dir, mut store) = open_store();
        store.upsert_corpus_hash(&row("a.md", "md", 10, 9)).expect("row");
        store.upsert_corpus_hash(&row("b.rs", "rs", 10, 1)).expect("row");

        let report =
            InspectReport::build(&store, &mount(), &InspectConfig::default()).expect("build");
        assert!(
            report.observations.iter().any(|o| o.contains(".md holds")),
            "got: {:?}",
            report.observations
        );
    }

    #[test]
    fn sparse_corpus_observation_fires() {
        let (_dir, mut store) = open_store();
        store.upsert_corpus_hash(&row("only.md", "md", 10, 1)).expect("row");

        let report =
            InspectReport::build(&store, &mount(), &InspectConfig::default()).expect("build");
        assert!(
            report.observations.iter().any(|o| o.contains("sparse")),
            "got: {:?}",
            report.observations
        );
    }

    #[test]
    fn archived_rows_are_excluded() {
        let (_dir, mut store) = open_store();
        let mut gone = row("gone.md", "md", 10, 4);
        gone.archived = true;
        store.upsert_corpus_hash(&gone).expect("row");

        let report =
            InspectReport::build(&store, &mount(), &InspectConfig::default()).expect("build");
        assert_eq!(report.files, 0);
        assert_eq!(report.chunks, 0);
    }

    #[test]
    fn text_rendering_respects_the_budget() {
        let (_dir, mut store) = open_store();
        for i in 0..30 {
            store
                .upsert_corpus_hash(&row(&format!("dir{i}/file{i}.md"), "md", 10, 2))
                .expect("row");
        }
        let report =
            InspectReport::build(&store, &mount(), &InspectConfig::default()).expect("build");
        let block = report.render_text(30);
        assert!(estimate_tokens(&block) <= 40, "block too large");
        assert!(block.starts_with("[inspect"));
    }

    #[test]
    fn paths_are_mount_relative() {
        let (_dir, mut store) = open_store();
        store.upsert_corpus_hash(&row("docs/a.md", "md", 10, 1)).expect("row");
        let report =
            InspectReport::build(&store, &mount(), &InspectConfig::default()).expect("build");
        let rendered = report.render_text(500);
        assert!(!rendered.contains("/corpus/"), "absolute paths leaked: {rendered}");
    }
}
