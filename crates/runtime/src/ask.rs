//! One-shot folder Q&A.
//!
//! Orchestration order: auto-mount, staleness-gated sync, structural
//! inspect (capped), scoped recall with the remaining budget, then a
//! single passive loop iteration. The answer is the only thing a caller
//! should print to stdout; progress belongs on stderr via tracing.

use std::path::Path;

use anyhow::Result;
use tracing::info;

use memctl_config::AppConfig;
use memctl_ingest::{ExtractorRegistry, InspectReport, SyncMode, ensure_mount, is_stale, sync_mount};
use memctl_llm::LlmInvoker;
use memctl_memory::{MemoryStore, SearchFilters, render_injection_block};
use memctl_policy::PolicyEngine;
use memctl_text::suggest_budget;

use crate::controller::{LoopConfig, run_loop};
use crate::protocol::LoopProtocol;

#[derive(Debug, Clone)]
pub struct AskOptions {
    pub sync_mode: SyncMode,
    /// Token cap for the inspect digest portion of the context.
    pub inspect_cap: usize,
    /// Total context budget; 0 means derive from the question length.
    pub budget: usize,
    pub loop_config: LoopConfig,
}

impl Default for AskOptions {
    fn default() -> Self {
        Self {
            sync_mode: SyncMode::Auto,
            inspect_cap: 300,
            budget: 0,
            loop_config: LoopConfig {
                protocol: LoopProtocol::Passive,
                max_calls: 1,
                ..Default::default()
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct AskOutcome {
    pub answer: String,
    pub mount_id: String,
    pub auto_mounted: bool,
    pub synced: bool,
    pub iterations: usize,
}

#[allow(clippy::too_many_arguments)]
pub async fn ask(
    store: &mut MemoryStore,
    engine: &PolicyEngine,
    registry: &ExtractorRegistry,
    invoker: &dyn LlmInvoker,
    config: &AppConfig,
    folder: &Path,
    question: &str,
    options: &AskOptions,
) -> Result<AskOutcome> {
    let (mount, auto_mounted) = ensure_mount(store, folder)?;

    let synced = match options.sync_mode {
        SyncMode::Never => false,
        SyncMode::Always => {
            sync_mount(store, engine, registry, &mount, false)?;
            true
        }
        SyncMode::Auto => {
            if auto_mounted || is_stale(store, &mount)? {
                sync_mount(store, engine, registry, &mount, false)?;
                true
            } else {
                false
            }
        }
    };

    let budget = if options.budget == 0 {
        suggest_budget(question.chars().count())
    } else {
        options.budget
    };
    let inspect_cap = options.inspect_cap.min(budget);

    let mut report = InspectReport::build(store, &mount, &config.inspect)?;
    report.auto_mounted = auto_mounted;
    report.synced = synced;
    let inspect_block = report.render_text(inspect_cap);

    let recall_budget = budget.saturating_sub(memctl_memory::estimate_tokens(&inspect_block));
    let filters = SearchFilters {
        mount_id: Some(mount.id.clone()),
        injectable_only: true,
        ..Default::default()
    };
    let (items, meta) = store.search_fulltext(question, &filters, 8)?;
    info!(
        strategy = meta.strategy.as_str(),
        items = items.len(),
        "ask recall complete"
    );
    let recall_block = render_injection_block(&items, recall_budget.max(1));

    let initial_context = format!("{inspect_block}\n\n{recall_block}");
    let mut loop_config = options.loop_config.clone();
    loop_config.mount_id = Some(mount.id.clone());

    let outcome = run_loop(store, invoker, question, &initial_context, &loop_config, None).await?;
    Ok(AskOutcome {
        answer: outcome.answer,
        mount_id: mount.id,
        auto_mounted,
        synced,
        iterations: outcome.iterations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use memctl_llm::MockInvoker;
    use memctl_memory::TokenizerPreset;
    use std::fs;

    #[tokio::test]
    async fn ask_mounts_syncs_and_answers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let corpus = dir.path().join("corpus");
        fs::create_dir_all(&corpus).expect("mkdir");
        fs::write(corpus.join("notes.md"), "# Widgets\n\nthe widget spins clockwise")
            .expect("write");

        let mut store = MemoryStore::open(&dir.path().join("memory.db"), TokenizerPreset::Fr)
            .expect("open");
        let engine = PolicyEngine::new();
        let registry = ExtractorRegistry::new();
        let mock = MockInvoker::new(vec!["the widget spins clockwise".to_string()]);

        let outcome = ask(
            &mut store,
            &engine,
            &registry,
            &mock,
            &AppConfig::default(),
            &corpus,
            "which way does the widget spin",
            &AskOptions::default(),
        )
        .await
        .expect("ask");

        assert!(outcome.auto_mounted);
        assert!(outcome.synced);
        assert_eq!(outcome.iterations, 1);
        assert_eq!(outcome.answer, "the widget spins clockwise");

        // The mock saw the corpus content in its prompt.
        let prompts = mock.recorded_prompts();
        assert!(prompts[0].contains("widget spins clockwise"), "context missing");
        assert!(prompts[0].contains("[inspect"), "inspect block missing");
    }

    #[tokio::test]
    async fn second_ask_skips_the_sync() {
        let dir = tempfile::tempdir().expect("tempdir");
        let corpus = dir.path().join("corpus");
        fs::create_dir_all(&corpus).expect("mkdir");
        fs::write(corpus.join("notes.md"), "stable corpus file").expect("write");

        let mut store = MemoryStore::open(&dir.path().join("memory.db"), TokenizerPreset::Fr)
            .expect("open");
        let engine = PolicyEngine::new();
        let registry = ExtractorRegistry::new();

        let first = MockInvoker::new(vec!["answer one".to_string()]);
        ask(
            &mut store,
            &engine,
            &registry,
            &first,
            &AppConfig::default(),
            &corpus,
            "anything",
            &AskOptions::default(),
        )
        .await
        .expect("first ask");

        let second = MockInvoker::new(vec!["answer two".to_string()]);
        let outcome = ask(
            &mut store,
            &engine,
            &registry,
            &second,
            &AppConfig::default(),
            &corpus,
            "anything again",
            &AskOptions::default(),
        )
        .await
        .expect("second ask");
        assert!(!outcome.auto_mounted);
        assert!(!outcome.synced, "unchanged corpus must not re-sync");
    }
}
