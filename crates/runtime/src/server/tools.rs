//! The MCP tool surface.
//!
//! Each tool maps to one store operation. Tools are stateless; everything
//! they touch lives in [`ServerContext`], handed in by the dispatcher
//! after the guard, session, and rate-limit layers have run. A tool
//! returns [`ToolOutput`] — `ok` with a payload, or `blocked` with the
//! refusing rule — and reserves `Err` for genuine failures.

use std::io::BufRead;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde_json::{Value, json};

use memctl_ingest::{InspectReport, SyncMode, ensure_mount, sync_mount};
use memctl_memory::{
    EventAction, MemoryItem, MemoryProposal, MemoryTier, Provenance, SearchFilters,
    export_items, import_items, ImportOptions, render_injection_block,
};
use memctl_policy::{Candidate, Decision};

use crate::ask::{AskOptions, ask};
use crate::controller::{LoopConfig, run_loop};
use crate::protocol::LoopProtocol;
use crate::server::ServerContext;
use crate::server::audit::AuditOutcome;
use crate::server::ratelimit::ToolClass;

#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub outcome: AuditOutcome,
    pub payload: Value,
}

impl ToolOutput {
    pub fn ok(payload: Value) -> Self {
        Self {
            outcome: AuditOutcome::Ok,
            payload,
        }
    }

    pub fn blocked(payload: Value) -> Self {
        Self {
            outcome: AuditOutcome::Blocked,
            payload,
        }
    }
}

#[async_trait]
pub trait McpTool: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    async fn execute(&self, ctx: &mut ServerContext, args: &Value) -> Result<ToolOutput>;
}

/// Central registry for the tool surface.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Box<dyn McpTool>>,
}

impl ToolRegistry {
    pub fn register(&mut self, tool: Box<dyn McpTool>) {
        self.tools.push(tool);
    }

    pub fn get(&self, name: &str) -> Option<&dyn McpTool> {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.as_ref())
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    /// The full built-in surface.
    pub fn builtin() -> Self {
        let mut registry = Self::default();
        registry.register(Box::new(RecallTool));
        registry.register(Box::new(SearchTool));
        registry.register(Box::new(ProposeTool));
        registry.register(Box::new(WriteTool));
        registry.register(Box::new(ReadTool));
        registry.register(Box::new(StatsTool));
        registry.register(Box::new(ConsolidateTool));
        registry.register(Box::new(MountTool));
        registry.register(Box::new(SyncTool));
        registry.register(Box::new(InspectTool));
        registry.register(Box::new(AskTool));
        registry.register(Box::new(ExportTool));
        registry.register(Box::new(ImportTool));
        registry.register(Box::new(LoopTool));
        registry.register(Box::new(ReindexTool));
        registry
    }
}

// ── Argument helpers ──────────────────────────────────────────────────────────

fn req_str<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| anyhow!("missing required argument '{key}'"))
}

fn opt_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
}

fn opt_usize(args: &Value, key: &str, default: usize) -> usize {
    args.get(key)
        .and_then(Value::as_u64)
        .map(|v| v as usize)
        .unwrap_or(default)
}

fn opt_bool(args: &Value, key: &str, default: bool) -> bool {
    args.get(key).and_then(Value::as_bool).unwrap_or(default)
}

fn opt_tags(args: &Value) -> Vec<String> {
    args.get("tags")
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

fn filters_from(args: &Value) -> SearchFilters {
    SearchFilters {
        tier: opt_str(args, "tier").and_then(MemoryTier::parse),
        item_type: opt_str(args, "type").map(String::from),
        scope: opt_str(args, "scope").map(String::from),
        mount_id: opt_str(args, "mount").map(String::from),
        include_archived: opt_bool(args, "include_archived", false),
        injectable_only: false,
    }
}

fn item_summary(item: &MemoryItem) -> Value {
    json!({
        "id": item.id,
        "title": item.title,
        "tier": item.tier.as_str(),
        "type": item.item_type,
        "tags": item.tags,
        "injectable": item.injectable,
    })
}

fn policy_blocked(rule_id: Option<&str>, reason: &str) -> ToolOutput {
    ToolOutput::blocked(json!({ "policy": rule_id, "reason": reason }))
}

// ── Read-side tools ───────────────────────────────────────────────────────────

struct RecallTool;

#[async_trait]
impl McpTool for RecallTool {
    fn name(&self) -> &'static str {
        "recall"
    }
    fn description(&self) -> &'static str {
        "Search memory and return a budgeted injection block."
    }

    async fn execute(&self, ctx: &mut ServerContext, args: &Value) -> Result<ToolOutput> {
        let query = req_str(args, "query")?;
        let limit = opt_usize(args, "limit", 5);
        let budget = opt_usize(args, "budget", 600);
        let mut filters = filters_from(args);
        filters.injectable_only = true;

        let (items, meta) = ctx.store.search_fulltext(query, &filters, limit)?;
        let block = render_injection_block(&items, budget);
        Ok(ToolOutput::ok(json!({
            "block": block,
            "items": items.iter().map(item_summary).collect::<Vec<_>>(),
            "meta": meta,
        })))
    }
}

struct SearchTool;

#[async_trait]
impl McpTool for SearchTool {
    fn name(&self) -> &'static str {
        "search"
    }
    fn description(&self) -> &'static str {
        "Full-text search with cascade metadata."
    }

    async fn execute(&self, ctx: &mut ServerContext, args: &Value) -> Result<ToolOutput> {
        let query = req_str(args, "query")?;
        let limit = opt_usize(args, "limit", 10);
        let filters = filters_from(args);
        let (items, meta) = ctx.store.search_fulltext(query, &filters, limit)?;
        Ok(ToolOutput::ok(json!({ "items": items, "meta": meta })))
    }
}

struct ReadTool;

#[async_trait]
impl McpTool for ReadTool {
    fn name(&self) -> &'static str {
        "read"
    }
    fn description(&self) -> &'static str {
        "Read one item by id, optionally bumping its usage count."
    }

    async fn execute(&self, ctx: &mut ServerContext, args: &Value) -> Result<ToolOutput> {
        let id = req_str(args, "id")?;
        let item = if opt_bool(args, "touch", false) {
            ctx.store.touch_item(id)?
        } else {
            ctx.store.read_item(id)?
        };
        match item {
            Some(item) => Ok(ToolOutput::ok(serde_json::to_value(item)?)),
            None => Err(anyhow!("no item with id '{id}'")),
        }
    }
}

struct StatsTool;

#[async_trait]
impl McpTool for StatsTool {
    fn name(&self) -> &'static str {
        "stats"
    }
    fn description(&self) -> &'static str {
        "Store counters: tiers, quarantine, events, corpus, FTS state."
    }

    async fn execute(&self, ctx: &mut ServerContext, _args: &Value) -> Result<ToolOutput> {
        let stats = ctx.store.stats()?;
        Ok(ToolOutput::ok(serde_json::to_value(stats)?))
    }
}

// ── Write-side tools ──────────────────────────────────────────────────────────

struct WriteTool;

#[async_trait]
impl McpTool for WriteTool {
    fn name(&self) -> &'static str {
        "write"
    }
    fn description(&self) -> &'static str {
        "Directly write one item through the policy engine."
    }

    async fn execute(&self, ctx: &mut ServerContext, args: &Value) -> Result<ToolOutput> {
        let title = req_str(args, "title")?;
        let content = req_str(args, "content")?;
        let item_type = opt_str(args, "type").unwrap_or("note");

        if let Err(err) = ctx.guard.charge_write(content.len()) {
            return Ok(ToolOutput::blocked(json!({ "guard": err.to_string() })));
        }

        let mut item = MemoryItem::new(
            title,
            content,
            item_type,
            opt_tags(args),
            Provenance {
                kind: "mcp".to_string(),
                source: "write".to_string(),
                why_store: opt_str(args, "reason").map(String::from),
                session_id: Some(ctx.current_session.clone()),
            },
        );
        item.scope = opt_str(args, "scope").map(String::from);

        let verdict = ctx.engine.evaluate_item(Candidate {
            title: &item.title,
            content: &item.content,
            item_type: &item.item_type,
            provenance_present: true,
            justification_present: item.provenance.why_store.is_some(),
        });
        if verdict.is_reject() {
            ctx.store.append_event(
                EventAction::PolicyReject,
                None,
                Some(json!({ "rule": verdict.rule_id, "source": "mcp:write" })),
            )?;
            return Ok(policy_blocked(verdict.rule_id.as_deref(), &verdict.reason));
        }
        if ctx
            .store
            .find_by_hash(&item.content_hash, item.scope.as_deref())?
            .is_some()
        {
            return Ok(ToolOutput::ok(json!({ "duplicate": true })));
        }
        let revision_id = ctx.store.write_item(&item, &verdict, "mcp write")?;
        ctx.sessions.note_write(&ctx.current_session.clone());
        Ok(ToolOutput::ok(json!({
            "id": item.id,
            "revision_id": revision_id,
            "decision": verdict.decision.as_str(),
        })))
    }
}

struct ProposeTool;

#[async_trait]
impl McpTool for ProposeTool {
    fn name(&self) -> &'static str {
        "propose"
    }
    fn description(&self) -> &'static str {
        "Submit a memory proposal with its why_store justification."
    }

    async fn execute(&self, ctx: &mut ServerContext, args: &Value) -> Result<ToolOutput> {
        let title = req_str(args, "title")?;
        let content = req_str(args, "content")?;
        let why_store = req_str(args, "why_store")?;

        if let Err(err) = ctx.guard.charge_write(content.len()) {
            return Ok(ToolOutput::blocked(json!({ "guard": err.to_string() })));
        }
        let session = ctx.current_session.clone();
        if !ctx.sessions.note_proposal(&session) {
            return Ok(ToolOutput::blocked(json!({
                "reason": "per-turn proposal cap reached"
            })));
        }

        let proposal = MemoryProposal {
            title: title.to_string(),
            content: content.to_string(),
            item_type: opt_str(args, "type").unwrap_or("note").to_string(),
            tags: opt_tags(args),
            scope: opt_str(args, "scope").map(String::from),
            provenance: Provenance {
                kind: "mcp".to_string(),
                source: "propose".to_string(),
                why_store: Some(why_store.to_string()),
                session_id: Some(session.clone()),
            },
            why_store: why_store.to_string(),
        };

        let verdict = ctx.engine.evaluate_proposal(Candidate {
            title: &proposal.title,
            content: &proposal.content,
            item_type: &proposal.item_type,
            provenance_present: true,
            justification_present: true,
        });
        if verdict.is_reject() {
            ctx.store.append_event(
                EventAction::PolicyReject,
                None,
                Some(json!({ "rule": verdict.rule_id, "source": "mcp:propose" })),
            )?;
            return Ok(policy_blocked(verdict.rule_id.as_deref(), &verdict.reason));
        }

        let item = proposal.into_item(verdict.decision == Decision::Accept);
        if ctx
            .store
            .find_by_hash(&item.content_hash, item.scope.as_deref())?
            .is_some()
        {
            return Ok(ToolOutput::ok(json!({ "duplicate": true })));
        }
        ctx.store.write_item(&item, &verdict, why_store)?;
        ctx.sessions.note_write(&session);
        Ok(ToolOutput::ok(json!({
            "id": item.id,
            "decision": verdict.decision.as_str(),
            "rule_id": verdict.rule_id,
        })))
    }
}

struct ConsolidateTool;

#[async_trait]
impl McpTool for ConsolidateTool {
    fn name(&self) -> &'static str {
        "consolidate"
    }
    fn description(&self) -> &'static str {
        "Deterministic STM merge and tier promotion."
    }

    async fn execute(&self, ctx: &mut ServerContext, args: &Value) -> Result<ToolOutput> {
        let report =
            memctl_memory::consolidate(&mut ctx.store, &ctx.engine, opt_str(args, "scope"))?;
        Ok(ToolOutput::ok(serde_json::to_value(report)?))
    }
}

// ── Mount / corpus tools ──────────────────────────────────────────────────────

struct MountTool;

#[async_trait]
impl McpTool for MountTool {
    fn name(&self) -> &'static str {
        "mount"
    }
    fn description(&self) -> &'static str {
        "List mounts, or register the given path."
    }

    async fn execute(&self, ctx: &mut ServerContext, args: &Value) -> Result<ToolOutput> {
        match opt_str(args, "path") {
            Some(path) => {
                let (mount, created) = ensure_mount(&mut ctx.store, Path::new(path))?;
                Ok(ToolOutput::ok(json!({ "mount": mount, "created": created })))
            }
            None => {
                let mounts = ctx.store.list_mounts()?;
                Ok(ToolOutput::ok(json!({ "mounts": mounts })))
            }
        }
    }
}

struct SyncTool;

#[async_trait]
impl McpTool for SyncTool {
    fn name(&self) -> &'static str {
        "sync"
    }
    fn description(&self) -> &'static str {
        "Run the 3-tier delta sync over one mount."
    }

    async fn execute(&self, ctx: &mut ServerContext, args: &Value) -> Result<ToolOutput> {
        let path = req_str(args, "path")?;
        let full = opt_bool(args, "full", false);
        let (mount, _created) = ensure_mount(&mut ctx.store, Path::new(path))?;
        let report = sync_mount(&mut ctx.store, &ctx.engine, &ctx.extractors, &mount, full)?;
        Ok(ToolOutput::ok(serde_json::to_value(report)?))
    }
}

struct InspectTool;

#[async_trait]
impl McpTool for InspectTool {
    fn name(&self) -> &'static str {
        "inspect"
    }
    fn description(&self) -> &'static str {
        "Structural corpus digest with rule-based observations."
    }

    async fn execute(&self, ctx: &mut ServerContext, args: &Value) -> Result<ToolOutput> {
        let path = req_str(args, "path")?;
        let (mount, created) = ensure_mount(&mut ctx.store, Path::new(path))?;
        let mut report = InspectReport::build(&ctx.store, &mount, &ctx.config.inspect)?;
        report.auto_mounted = created;
        Ok(ToolOutput::ok(serde_json::to_value(report)?))
    }
}

// ── Orchestration tools ───────────────────────────────────────────────────────

struct AskTool;

#[async_trait]
impl McpTool for AskTool {
    fn name(&self) -> &'static str {
        "ask"
    }
    fn description(&self) -> &'static str {
        "One-shot folder question answering."
    }

    async fn execute(&self, ctx: &mut ServerContext, args: &Value) -> Result<ToolOutput> {
        let path = req_str(args, "path")?;
        let question = req_str(args, "question")?;
        let mut options = AskOptions::default();
        if let Some(mode) = opt_str(args, "sync").and_then(SyncMode::parse) {
            options.sync_mode = mode;
        }
        let outcome = ask(
            &mut ctx.store,
            &ctx.engine,
            &ctx.extractors,
            ctx.invoker.as_ref(),
            &ctx.config,
            Path::new(path),
            question,
            &options,
        )
        .await?;
        Ok(ToolOutput::ok(json!({
            "answer": outcome.answer,
            "mount_id": outcome.mount_id,
            "auto_mounted": outcome.auto_mounted,
            "synced": outcome.synced,
            "iterations": outcome.iterations,
        })))
    }
}

struct LoopTool;

#[async_trait]
impl McpTool for LoopTool {
    fn name(&self) -> &'static str {
        "loop"
    }
    fn description(&self) -> &'static str {
        "Bounded recall-answer loop over the store."
    }

    async fn execute(&self, ctx: &mut ServerContext, args: &Value) -> Result<ToolOutput> {
        let question = req_str(args, "question")?;
        let initial_context = opt_str(args, "context").unwrap_or("");
        let mut config = LoopConfig {
            max_calls: opt_usize(args, "max_calls", 3),
            ..Default::default()
        };
        if let Some(protocol) = opt_str(args, "protocol").and_then(LoopProtocol::parse) {
            config.protocol = protocol;
        }
        if let Some(mount) = opt_str(args, "mount") {
            config.mount_id = Some(mount.to_string());
        }

        let outcome = run_loop(
            &mut ctx.store,
            ctx.invoker.as_ref(),
            question,
            initial_context,
            &config,
            None,
        )
        .await?;
        Ok(ToolOutput::ok(json!({
            "answer": outcome.answer,
            "iterations": outcome.iterations,
            "stop": outcome.stop.as_str(),
            "timed_out": outcome.timed_out,
        })))
    }
}

// ── Transfer tools ────────────────────────────────────────────────────────────

struct ExportTool;

#[async_trait]
impl McpTool for ExportTool {
    fn name(&self) -> &'static str {
        "export"
    }
    fn description(&self) -> &'static str {
        "Export matching items as JSONL."
    }

    async fn execute(&self, ctx: &mut ServerContext, args: &Value) -> Result<ToolOutput> {
        let filters = filters_from(args);
        let mut buffer: Vec<u8> = Vec::new();
        let count = export_items(&mut ctx.store, &filters, &mut buffer)?;
        let jsonl = String::from_utf8(buffer).context("export stream was not UTF-8")?;
        Ok(ToolOutput::ok(json!({ "count": count, "jsonl": jsonl })))
    }
}

struct ImportTool;

#[async_trait]
impl McpTool for ImportTool {
    fn name(&self) -> &'static str {
        "import"
    }
    fn description(&self) -> &'static str {
        "Import JSONL items through policy and hash dedup."
    }

    async fn execute(&self, ctx: &mut ServerContext, args: &Value) -> Result<ToolOutput> {
        let jsonl = req_str(args, "jsonl")?;
        let line_count = jsonl.lines().filter(|l| !l.trim().is_empty()).count();

        if let Err(err) = ctx.guard.check_import_batch(line_count) {
            return Ok(ToolOutput::blocked(json!({ "guard": err.to_string() })));
        }
        if let Err(err) = ctx.guard.charge_write(jsonl.len()) {
            return Ok(ToolOutput::blocked(json!({ "guard": err.to_string() })));
        }
        // One token per item on top of the dispatch token.
        let extra = line_count.saturating_sub(1) as f64;
        let session = ctx.current_session.clone();
        if extra > 0.0 && !ctx.limiter.try_acquire(&session, ToolClass::Write, extra) {
            return Ok(ToolOutput::blocked(json!({
                "reason": "write rate limit exceeded for import batch"
            })));
        }

        let options = ImportOptions {
            preserve_ids: opt_bool(args, "preserve_ids", false),
            dry_run: opt_bool(args, "dry_run", false),
        };
        let mut reader = std::io::BufReader::new(jsonl.as_bytes());
        let reader: &mut dyn BufRead = &mut reader;
        let report = import_items(&mut ctx.store, &ctx.engine, reader, options)?;
        ctx.sessions.note_write(&session);
        Ok(ToolOutput::ok(serde_json::to_value(report)?))
    }
}

struct ReindexTool;

#[async_trait]
impl McpTool for ReindexTool {
    fn name(&self) -> &'static str {
        "reindex"
    }
    fn description(&self) -> &'static str {
        "Rebuild the FTS index, optionally switching tokenizer."
    }

    async fn execute(&self, ctx: &mut ServerContext, args: &Value) -> Result<ToolOutput> {
        let (items, elapsed) = ctx.store.rebuild_fts(opt_str(args, "tokenizer"))?;
        Ok(ToolOutput::ok(json!({
            "items": items,
            "ms": elapsed.as_millis() as u64,
            "tokenizer": ctx.store.tokenizer().name(),
        })))
    }
}
