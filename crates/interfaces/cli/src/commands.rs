//! Subcommand implementations. stdout carries data (ids, items, JSON,
//! answers, injection blocks); progress and diagnostics go to stderr
//! through tracing.

use std::io::{BufRead, IsTerminal, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use memctl_config::AppConfig;
use memctl_ingest::{
    ExtractorRegistry, InspectReport, SyncMode, discover_files, ensure_mount, ingest_paths,
    is_stale, sync_mount,
};
use memctl_llm::{InputMode, LlmInvoker, SubprocessInvoker};
use memctl_memory::{
    EventAction, ImportOptions, MemoryItem, MemoryStore, Provenance, SearchFilters,
    TokenizerPreset, export_items, import_items,
};
use memctl_policy::{Candidate, PolicyEngine};
use memctl_runtime::server::audit::AuditLog;
use memctl_runtime::server::guard::{GuardConfig, PathGuard};
use memctl_runtime::server::{McpServer, ServerContext};
use memctl_runtime::{
    AskOptions, ChatOptions, ChatSession, LoopConfig, LoopProtocol, history, parse_trace, replay,
    run_loop,
};

use crate::{App, CliOutcome};

// ── push / pull ───────────────────────────────────────────────────────────────

pub(crate) fn push(app: &mut App, sources: &[String], full: bool) -> Result<CliOutcome> {
    let engine = PolicyEngine::new();
    let registry = ExtractorRegistry::new();
    let mut total = memctl_ingest::IngestReport::default();
    let mut any_input = false;

    for source in sources {
        let path = PathBuf::from(source);
        let (root, files) = if path.is_dir() {
            (path.clone(), discover_files(&path, &[])?)
        } else if path.is_file() {
            let root = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            (root, vec![path.clone()])
        } else {
            // Treat as a glob rooted at the current directory.
            let glob = globset::GlobBuilder::new(source)
                .literal_separator(false)
                .build()
                .with_context(|| format!("bad glob '{source}'"))?
                .compile_matcher();
            let cwd = PathBuf::from(".");
            let files = discover_files(&cwd, &[])?
                .into_iter()
                .filter(|p| glob.is_match(p.strip_prefix(&cwd).unwrap_or(p)))
                .collect();
            (cwd, files)
        };

        if files.is_empty() {
            warn!(source, "no files matched");
            continue;
        }
        any_input = true;
        let report = ingest_paths(&mut app.store, &engine, &registry, None, &root, &files, full)?;
        merge_reports(&mut total, &report);
    }

    if !any_input {
        return Ok(CliOutcome::Operational("no input files".to_string()));
    }
    if app.json {
        println!("{}", serde_json::to_string(&total)?);
    } else {
        println!(
            "ingested {} files ({} skipped), wrote {} items ({} quarantined, {} rejected)",
            total.files_ingested,
            total.files_skipped,
            total.items_written,
            total.items_quarantined,
            total.items_rejected
        );
    }
    Ok(CliOutcome::Ok)
}

fn merge_reports(total: &mut memctl_ingest::IngestReport, report: &memctl_ingest::IngestReport) {
    total.files_scanned += report.files_scanned;
    total.files_skipped += report.files_skipped;
    total.files_ingested += report.files_ingested;
    total.items_written += report.items_written;
    total.items_quarantined += report.items_quarantined;
    total.items_rejected += report.items_rejected;
    total.duplicates += report.duplicates;
    total.errors += report.errors;
}

pub(crate) fn pull(
    app: &mut App,
    title: &str,
    item_type: &str,
    tags: &[String],
    scope: Option<&str>,
    why: Option<&str>,
) -> Result<CliOutcome> {
    let mut content = String::new();
    std::io::stdin()
        .read_to_string(&mut content)
        .context("reading stdin")?;
    let content = content.trim().to_string();
    if content.is_empty() {
        return Ok(CliOutcome::Operational("empty input on stdin".to_string()));
    }

    let engine = PolicyEngine::new();
    let mut item = MemoryItem::new(
        title,
        content,
        item_type,
        tags.to_vec(),
        Provenance {
            kind: "cli".to_string(),
            source: "pull".to_string(),
            why_store: why.map(String::from),
            session_id: None,
        },
    );
    item.scope = scope.map(String::from);

    let verdict = engine.evaluate_item(Candidate {
        title: &item.title,
        content: &item.content,
        item_type: &item.item_type,
        provenance_present: true,
        justification_present: why.is_some(),
    });
    if verdict.is_reject() {
        app.store.append_event(
            EventAction::PolicyReject,
            None,
            Some(serde_json::json!({ "rule": verdict.rule_id, "source": "pull" })),
        )?;
        return Ok(CliOutcome::Operational(format!(
            "rejected by policy rule {}: {}",
            verdict.rule_id.as_deref().unwrap_or("?"),
            verdict.reason
        )));
    }
    if let Some(existing) = app.store.find_by_hash(&item.content_hash, item.scope.as_deref())? {
        return Ok(CliOutcome::Operational(format!(
            "identical content already stored as {}",
            existing.id
        )));
    }

    app.store.write_item(&item, &verdict, "cli pull")?;
    if app.json {
        println!(
            "{}",
            serde_json::json!({ "id": item.id, "decision": verdict.decision.as_str() })
        );
    } else {
        println!("{}", item.id);
    }
    Ok(CliOutcome::Ok)
}

// ── search / show / stats ─────────────────────────────────────────────────────

pub(crate) fn search(
    app: &mut App,
    query: &str,
    filters: &SearchFilters,
    limit: usize,
) -> Result<CliOutcome> {
    let (items, meta) = app.store.search_fulltext(query, filters, limit)?;
    if app.json {
        println!(
            "{}",
            serde_json::json!({ "items": items, "meta": meta })
        );
    } else {
        for item in &items {
            println!("{}\t[{}]\t{}", item.id, item.tier.as_str(), item.title);
        }
        info!(
            strategy = meta.strategy.as_str(),
            candidates = meta.candidate_count,
            dropped = ?meta.dropped_terms,
            "search complete"
        );
    }
    Ok(CliOutcome::Ok)
}

pub(crate) fn show(app: &App, id: &str) -> Result<CliOutcome> {
    let Some(item) = app.store.read_item(id)? else {
        return Ok(CliOutcome::Operational(format!("no item with id '{id}'")));
    };
    let revisions = app.store.revisions(id)?;
    let links = app.store.links_from(id)?;

    if app.json {
        println!(
            "{}",
            serde_json::json!({ "item": item, "revisions": revisions, "links": links })
        );
        return Ok(CliOutcome::Ok);
    }

    println!("id:        {}", item.id);
    println!("title:     {}", item.title);
    println!("tier:      {}", item.tier.as_str());
    println!("type:      {}", item.item_type);
    println!("tags:      {}", item.tags.join(", "));
    println!("scope:     {}", item.scope.as_deref().unwrap_or("-"));
    println!("injectable:{}", item.injectable);
    println!("archived:  {}", item.archived);
    println!("usage:     {}", item.usage_count);
    println!("source:    {} ({})", item.provenance.source, item.provenance.kind);
    println!();
    println!("{}", item.content);
    if !revisions.is_empty() {
        println!();
        for (rev, decision, rule, reason, at) in &revisions {
            println!(
                "rev {rev}: {decision}{} at {at}{}",
                rule.as_deref()
                    .map(|r| format!(" ({r})"))
                    .unwrap_or_default(),
                reason
                    .as_deref()
                    .map(|r| format!(" — {r}"))
                    .unwrap_or_default()
            );
        }
    }
    for link in &links {
        println!("link: {} -> {} ({})", link.from_id, link.to_id, link.kind.as_str());
    }
    Ok(CliOutcome::Ok)
}

pub(crate) fn stats(app: &App) -> Result<CliOutcome> {
    let stats = app.store.stats()?;
    if app.json {
        println!("{}", serde_json::to_string(&stats)?);
        return Ok(CliOutcome::Ok);
    }
    println!("items:       {} (STM {}, MTM {}, LTM {})", stats.total_items, stats.stm, stats.mtm, stats.ltm);
    println!("archived:    {}", stats.archived);
    println!("quarantined: {}", stats.quarantined);
    println!("events:      {}", stats.events);
    println!("links:       {}", stats.links);
    println!("corpus:      {} files across {} mounts", stats.corpus_files, stats.mounts);
    println!(
        "fts:         {} (tokenizer {}, {} reindexes)",
        if stats.fts_enabled { "enabled" } else { "disabled" },
        stats.tokenizer,
        stats.reindex_count
    );
    Ok(CliOutcome::Ok)
}

pub(crate) fn consolidate(app: &mut App, scope: Option<&str>) -> Result<CliOutcome> {
    let engine = PolicyEngine::new();
    let report = memctl_memory::consolidate(&mut app.store, &engine, scope)?;
    if app.json {
        println!("{}", serde_json::to_string(&report)?);
    } else {
        println!(
            "examined {} items, merged {} clusters, archived {}, promoted {}",
            report.examined,
            report.clusters,
            report.archived.len(),
            report.promoted.len()
        );
    }
    Ok(CliOutcome::Ok)
}

// ── loop ──────────────────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
pub(crate) async fn run_loop_command(
    app: &mut App,
    question: &str,
    protocol: LoopProtocol,
    max_calls: usize,
    llm: Option<&str>,
    trace_path: Option<&Path>,
    replay_path: Option<&Path>,
    timeout_secs: u64,
    deadline_secs: Option<u64>,
) -> Result<CliOutcome> {
    let config = LoopConfig {
        protocol,
        max_calls,
        per_call_timeout: Duration::from_secs(timeout_secs),
        deadline: deadline_secs.map(Duration::from_secs),
        ..Default::default()
    };

    if let Some(replay_path) = replay_path {
        let raw = std::fs::read_to_string(replay_path)
            .with_context(|| format!("reading trace {}", replay_path.display()))?;
        let records = parse_trace(&raw)?;
        let outcome = replay(&mut app.store, &records, &config)?;
        println!("{}", outcome.answer);
        info!(
            iterations = outcome.iterations,
            stop = outcome.stop.as_str(),
            "trace replayed"
        );
        return Ok(CliOutcome::Ok);
    }

    let Some(invoker) = build_invoker(llm) else {
        return Ok(CliOutcome::Operational(
            "--llm COMMAND is required unless --replay is given".to_string(),
        ));
    };

    // Initial context arrives on stdin when piped in.
    let mut initial_context = String::new();
    if !std::io::stdin().is_terminal() {
        std::io::stdin()
            .read_to_string(&mut initial_context)
            .context("reading context from stdin")?;
    }

    let mut trace_file = match trace_path {
        Some(path) => Some(
            std::fs::File::create(path)
                .with_context(|| format!("creating trace {}", path.display()))?,
        ),
        None => None,
    };
    let trace_out: Option<&mut (dyn Write + Send)> = match trace_file.as_mut() {
        Some(file) => Some(file),
        None => None,
    };

    let outcome = run_loop(
        &mut app.store,
        invoker.as_ref(),
        question,
        &initial_context,
        &config,
        trace_out,
    )
    .await?;

    println!("{}", outcome.answer);
    info!(
        iterations = outcome.iterations,
        stop = outcome.stop.as_str(),
        timed_out = outcome.timed_out,
        "loop finished"
    );
    Ok(CliOutcome::Ok)
}

fn build_invoker(llm: Option<&str>) -> Option<Box<dyn LlmInvoker>> {
    let command_line = llm?.trim();
    let mut parts = command_line.split_whitespace();
    let command = parts.next()?;
    let args: Vec<String> = parts.map(String::from).collect();
    Some(Box::new(SubprocessInvoker::new(
        command,
        args,
        InputMode::Stdin,
    )))
}

// ── mount / sync / inspect ────────────────────────────────────────────────────

pub(crate) fn mount(app: &mut App, path: Option<&Path>, ignore: &[String]) -> Result<CliOutcome> {
    match path {
        Some(path) => {
            let (mount, created) = ensure_mount(&mut app.store, path)?;
            if !ignore.is_empty() {
                app.store.update_mount_ignore(&mount.id, ignore)?;
            }
            if app.json {
                println!(
                    "{}",
                    serde_json::json!({ "mount": mount, "created": created })
                );
            } else {
                println!("{}\t{}", mount.id, mount.path);
            }
            Ok(CliOutcome::Ok)
        }
        None => {
            let mounts = app.store.list_mounts()?;
            if app.json {
                println!("{}", serde_json::json!({ "mounts": mounts }));
            } else {
                for mount in &mounts {
                    println!("{}\t{}\t{}", mount.id, mount.display_name, mount.path);
                }
            }
            Ok(CliOutcome::Ok)
        }
    }
}

pub(crate) fn sync(app: &mut App, path: Option<&Path>, full: bool) -> Result<CliOutcome> {
    let engine = PolicyEngine::new();
    let registry = ExtractorRegistry::new();

    let mounts = match path {
        Some(path) => vec![ensure_mount(&mut app.store, path)?.0],
        None => app.store.list_mounts()?,
    };
    if mounts.is_empty() {
        return Ok(CliOutcome::Operational("no mounts registered".to_string()));
    }

    let mut reports = Vec::new();
    for mount in &mounts {
        let report = sync_mount(&mut app.store, &engine, &registry, mount, full)?;
        reports.push((mount.id.clone(), report));
    }

    if app.json {
        let payload: Vec<_> = reports
            .iter()
            .map(|(id, r)| serde_json::json!({ "mount_id": id, "report": r }))
            .collect();
        println!("{}", serde_json::to_string(&payload)?);
    } else {
        for (id, report) in &reports {
            println!(
                "{id}: ingested {}, skipped {}, refreshed {}, orphaned {}",
                report.ingested, report.skipped_metadata, report.refreshed_metadata, report.orphaned
            );
        }
    }
    Ok(CliOutcome::Ok)
}

pub(crate) fn inspect(
    app: &mut App,
    path: &Path,
    sync_mode: SyncMode,
    budget: usize,
) -> Result<CliOutcome> {
    let engine = PolicyEngine::new();
    let registry = ExtractorRegistry::new();
    let (mount, created) = ensure_mount(&mut app.store, path)?;

    let synced = match sync_mode {
        SyncMode::Never => false,
        SyncMode::Always => {
            sync_mount(&mut app.store, &engine, &registry, &mount, false)?;
            true
        }
        SyncMode::Auto => {
            if created || is_stale(&app.store, &mount)? {
                sync_mount(&mut app.store, &engine, &registry, &mount, false)?;
                true
            } else {
                false
            }
        }
    };

    let mut report = InspectReport::build(&app.store, &mount, &app.config.inspect)?;
    report.auto_mounted = created;
    report.synced = synced;

    if app.json {
        println!("{}", serde_json::to_string(&report)?);
    } else {
        println!("{}", report.render_text(budget));
    }
    Ok(CliOutcome::Ok)
}

// ── ask / chat ────────────────────────────────────────────────────────────────

pub(crate) async fn ask(
    app: &mut App,
    path: &Path,
    question: &str,
    llm: Option<&str>,
    sync_mode: SyncMode,
    inspect_cap: usize,
    budget: usize,
) -> Result<CliOutcome> {
    let Some(invoker) = build_invoker(llm) else {
        return Ok(CliOutcome::Operational("--llm COMMAND is required".to_string()));
    };
    let engine = PolicyEngine::new();
    let registry = ExtractorRegistry::new();
    let options = AskOptions {
        sync_mode,
        inspect_cap,
        budget,
        ..Default::default()
    };

    let outcome = memctl_runtime::ask(
        &mut app.store,
        &engine,
        &registry,
        invoker.as_ref(),
        &app.config,
        path,
        question,
        &options,
    )
    .await?;
    println!("{}", outcome.answer);
    Ok(CliOutcome::Ok)
}

pub(crate) async fn chat(
    app: &mut App,
    llm: Option<&str>,
    persist: bool,
    folder: Option<&Path>,
    session_id: Option<&str>,
) -> Result<CliOutcome> {
    let Some(invoker) = build_invoker(llm) else {
        return Ok(CliOutcome::Operational("--llm COMMAND is required".to_string()));
    };
    let engine = PolicyEngine::new();
    let registry = ExtractorRegistry::new();

    let mount_id = match folder {
        Some(folder) => {
            let (mount, created) = ensure_mount(&mut app.store, folder)?;
            if created || is_stale(&app.store, &mount)? {
                sync_mount(&mut app.store, &engine, &registry, &mount, false)?;
            }
            Some(mount.id)
        }
        None => None,
    };

    let options = ChatOptions {
        persist,
        mount_id,
        context_budget: 800,
        session_id: session_id.map(String::from),
        ..Default::default()
    };
    let mut session = ChatSession::new(
        app.config.chat.history_max,
        app.config.chat.history_char_budget,
    );

    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        eprint!("> ");
        let Some(line) = lines.next() else { break };
        let line = line.context("reading chat input")?;
        let question = line.trim();
        if question.is_empty() {
            continue;
        }
        if question == "exit" || question == "quit" {
            break;
        }
        let answer = memctl_runtime::chat_turn(
            &mut app.store,
            &engine,
            invoker.as_ref(),
            Some(&mut session),
            question,
            &options,
        )
        .await?;
        println!("{answer}");
        if let Err(err) = history::append_turn(question, &answer) {
            warn!(%err, "could not persist chat history");
        }
    }
    Ok(CliOutcome::Ok)
}

// ── export / import ───────────────────────────────────────────────────────────

pub(crate) fn export(app: &mut App, filters: &SearchFilters) -> Result<CliOutcome> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let count = export_items(&mut app.store, filters, &mut out)?;
    info!(items = count, "export written to stdout");
    Ok(CliOutcome::Ok)
}

pub(crate) fn import(
    app: &mut App,
    file: Option<&Path>,
    preserve_ids: bool,
    dry_run: bool,
) -> Result<CliOutcome> {
    let engine = PolicyEngine::new();
    let options = ImportOptions {
        preserve_ids,
        dry_run,
    };

    let report = match file {
        Some(path) => {
            let file = std::fs::File::open(path)
                .with_context(|| format!("opening {}", path.display()))?;
            let mut reader = std::io::BufReader::new(file);
            import_items(&mut app.store, &engine, &mut reader, options)?
        }
        None => {
            let stdin = std::io::stdin();
            let mut reader = stdin.lock();
            import_items(&mut app.store, &engine, &mut reader, options)?
        }
    };

    if app.json {
        println!("{}", serde_json::to_string(&report)?);
    } else {
        println!(
            "imported {} ({} quarantined), {} duplicates, {} rejected, {} errors{}",
            report.imported,
            report.quarantined,
            report.duplicates,
            report.rejected,
            report.errors,
            if dry_run { " [dry run]" } else { "" }
        );
    }
    if report.is_failure() {
        return Ok(CliOutcome::Operational(
            "nothing imported and at least one line errored".to_string(),
        ));
    }
    Ok(CliOutcome::Ok)
}

// ── serve / reindex ───────────────────────────────────────────────────────────

pub(crate) async fn serve(
    db_path: &Path,
    config_path: Option<&Path>,
    root: Option<&Path>,
    audit_log: Option<&Path>,
    llm: Option<&str>,
) -> Result<CliOutcome> {
    let guard_config = GuardConfig {
        root: root.map(Path::to_path_buf),
        ..Default::default()
    };
    let guard = match PathGuard::validate(db_path, guard_config) {
        Ok(guard) => guard,
        Err(err) => return Ok(CliOutcome::Operational(format!("path guard: {err}"))),
    };

    let config = match config_path {
        Some(path) => AppConfig::load_or_default(path),
        None => AppConfig::detect_for_db(db_path),
    };
    let tokenizer =
        TokenizerPreset::parse(&config.store.fts_tokenizer).unwrap_or(TokenizerPreset::Fr);
    let store = MemoryStore::open(db_path, tokenizer)?;

    let audit = match audit_log {
        Some(path) => AuditLog::to_file(path)
            .with_context(|| format!("opening audit log {}", path.display()))?,
        None => AuditLog::to_stderr(),
    };

    let invoker = build_invoker(llm).unwrap_or_else(|| Box::new(UnconfiguredInvoker));
    let ctx = ServerContext::new(store, invoker, config, guard, audit);
    let mut server = McpServer::new(ctx);
    server.serve_stdio().await?;
    Ok(CliOutcome::Ok)
}

/// Stands in when `serve` runs without `--llm`: LLM-backed tools fail with
/// a message naming the missing flag; everything else works.
struct UnconfiguredInvoker;

#[async_trait::async_trait]
impl LlmInvoker for UnconfiguredInvoker {
    async fn invoke(&self, _prompt: &str, _timeout: Duration) -> memctl_llm::Result<String> {
        Err(memctl_llm::InvokeError::Spawn {
            command: "(none)".to_string(),
            source: std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no LLM configured; start the server with --llm COMMAND",
            ),
        })
    }
}

pub(crate) fn reindex(app: &mut App, tokenizer: Option<&str>) -> Result<CliOutcome> {
    match app.store.rebuild_fts(tokenizer) {
        Ok((items, elapsed)) => {
            if app.json {
                println!(
                    "{}",
                    serde_json::json!({
                        "items": items,
                        "ms": elapsed.as_millis() as u64,
                        "tokenizer": app.store.tokenizer().name(),
                    })
                );
            } else {
                println!(
                    "reindexed {} items with tokenizer {} in {:?}",
                    items,
                    app.store.tokenizer().name(),
                    elapsed
                );
            }
            Ok(CliOutcome::Ok)
        }
        Err(memctl_memory::StoreError::Validation(message)) => {
            Ok(CliOutcome::Operational(message))
        }
        Err(err) => Err(err.into()),
    }
}
