//! The bounded recall-answer loop.
//!
//! The LLM only proposes; every stopping decision is made here:
//!
//! 1. `llm_stop`     — the envelope said stop (passive counts as stop).
//! 2. `fixed_point`  — consecutive answers similar above threshold for
//!    `stable_steps` answers in a row.
//! 3. `query_cycle`  — the proposed query repeats a prior one.
//! 4. `no_new_items` — recall produced nothing absent from context.
//! 5. `max_calls`    — iteration budget exhausted (also reported on
//!    deadline or per-call timeout, with the timeout marker set).
//!
//! Every iteration emits a trace record; traces replay without an LLM.

use std::collections::HashSet;
use std::io::Write;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use tracing::{debug, info, warn};

use memctl_llm::{InvokeError, LlmInvoker};
use memctl_memory::{MemoryItem, MemoryStore, SearchFilters, render_injection_block};
use memctl_text::{combined_similarity, is_query_cycle};

use crate::protocol::{Directive, LoopProtocol, parse_reply};
use crate::trace::{StopCondition, TraceRecord};

#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub protocol: LoopProtocol,
    pub max_calls: usize,
    pub fixed_point_threshold: f64,
    /// Consecutive similar answers required for `fixed_point`.
    pub stable_steps: usize,
    pub query_threshold: f64,
    pub stop_on_no_new_items: bool,
    pub per_call_timeout: Duration,
    /// Optional overall deadline for the whole loop.
    pub deadline: Option<Duration>,
    pub recall_limit: usize,
    /// Token budget for the context block fed back to the LLM.
    pub context_budget: usize,
    /// Restrict recall to one mount's corpus.
    pub mount_id: Option<String>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            protocol: LoopProtocol::Json,
            max_calls: 3,
            fixed_point_threshold: 0.92,
            stable_steps: 2,
            query_threshold: 0.90,
            stop_on_no_new_items: true,
            per_call_timeout: memctl_llm::DEFAULT_TIMEOUT,
            deadline: None,
            recall_limit: 5,
            context_budget: 1200,
            mount_id: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoopOutcome {
    pub answer: String,
    pub iterations: usize,
    pub stop: StopCondition,
    pub timed_out: bool,
    pub trace: Vec<TraceRecord>,
}

/// Run the loop against `store`, starting from `initial_context` (an
/// injection block assembled by the caller). Trace records stream to
/// `trace_out` as JSONL when provided.
pub async fn run_loop(
    store: &mut MemoryStore,
    invoker: &dyn LlmInvoker,
    question: &str,
    initial_context: &str,
    config: &LoopConfig,
    mut trace_out: Option<&mut (dyn Write + Send)>,
) -> Result<LoopOutcome> {
    let started = Instant::now();
    let mut context_items: Vec<MemoryItem> = Vec::new();
    let mut context_ids: HashSet<String> = HashSet::new();
    let mut query_history: Vec<String> = Vec::new();
    let mut trace: Vec<TraceRecord> = Vec::new();

    let mut previous_answer: Option<String> = None;
    let mut stable_window = 0usize;

    let mut iteration = 0usize;
    loop {
        if let Some(deadline) = config.deadline {
            if started.elapsed() >= deadline {
                warn!(?deadline, "loop deadline reached");
                let record = terminal_record(
                    iteration,
                    None,
                    None,
                    StopCondition::MaxCalls,
                    previous_answer.clone().unwrap_or_default(),
                    true,
                );
                emit(store, &mut trace, &mut trace_out, record);
                return Ok(outcome(trace, iteration, StopCondition::MaxCalls, true));
            }
        }
        if iteration >= config.max_calls {
            let record = terminal_record(
                iteration,
                None,
                None,
                StopCondition::MaxCalls,
                previous_answer.clone().unwrap_or_default(),
                false,
            );
            emit(store, &mut trace, &mut trace_out, record);
            return Ok(outcome(trace, iteration, StopCondition::MaxCalls, false));
        }
        iteration += 1;

        let prompt = assemble_prompt(
            initial_context,
            &context_items,
            question,
            config,
        );
        let reply = match invoker.invoke(&prompt, config.per_call_timeout).await {
            Ok(reply) => reply,
            Err(InvokeError::Timeout(elapsed)) => {
                warn!(?elapsed, iteration, "llm call timed out");
                let record = terminal_record(
                    iteration,
                    None,
                    None,
                    StopCondition::MaxCalls,
                    previous_answer.clone().unwrap_or_default(),
                    true,
                );
                emit(store, &mut trace, &mut trace_out, record);
                return Ok(outcome(trace, iteration, StopCondition::MaxCalls, true));
            }
            Err(err) => return Err(err).context("llm invocation failed"),
        };

        let directive: Directive = parse_reply(config.protocol, &reply);
        let answer = directive.answer.clone();

        let similarity = previous_answer
            .as_deref()
            .map(|prev| combined_similarity(prev, &answer));
        match similarity {
            Some(score) if score >= config.fixed_point_threshold => stable_window += 1,
            _ => stable_window = 1,
        }
        previous_answer = Some(answer.clone());

        // Passive runs exactly one iteration; an explicit stop is the same
        // terminal condition.
        if config.protocol == LoopProtocol::Passive || directive.stop {
            let record = terminal_record(
                iteration,
                directive.query.clone(),
                similarity,
                StopCondition::LlmStop,
                answer,
                false,
            );
            emit(store, &mut trace, &mut trace_out, record);
            return Ok(outcome(trace, iteration, StopCondition::LlmStop, false));
        }

        if stable_window >= config.stable_steps.max(2) {
            let record = terminal_record(
                iteration,
                directive.query.clone(),
                similarity,
                StopCondition::FixedPoint,
                answer,
                false,
            );
            emit(store, &mut trace, &mut trace_out, record);
            return Ok(outcome(trace, iteration, StopCondition::FixedPoint, false));
        }

        let Some(query) = directive.query.filter(|_| directive.need_more) else {
            let record = terminal_record(
                iteration,
                None,
                similarity,
                StopCondition::LlmStop,
                answer,
                false,
            );
            emit(store, &mut trace, &mut trace_out, record);
            return Ok(outcome(trace, iteration, StopCondition::LlmStop, false));
        };

        if is_query_cycle(&query, &query_history, config.query_threshold) {
            let record = terminal_record(
                iteration,
                Some(query),
                similarity,
                StopCondition::QueryCycle,
                answer,
                false,
            );
            emit(store, &mut trace, &mut trace_out, record);
            return Ok(outcome(trace, iteration, StopCondition::QueryCycle, false));
        }
        query_history.push(query.clone());

        let added = recall_new(store, &query, &context_ids, config)?;
        if added.is_empty() && config.stop_on_no_new_items {
            let record = terminal_record(
                iteration,
                Some(query),
                similarity,
                StopCondition::NoNewItems,
                answer,
                false,
            );
            emit(store, &mut trace, &mut trace_out, record);
            return Ok(outcome(trace, iteration, StopCondition::NoNewItems, false));
        }

        let added_ids: Vec<String> = added.iter().map(|i| i.id.clone()).collect();
        for item in added {
            context_ids.insert(item.id.clone());
            // Newest additions go first so budget trimming keeps them.
            context_items.insert(0, item);
        }

        let record = TraceRecord {
            iteration,
            query: Some(query),
            similarity,
            action: "continue".to_string(),
            added_item_ids: added_ids,
            answer,
            timed_out: false,
        };
        debug!(iteration, added = record.added_item_ids.len(), "loop iteration continues");
        emit(store, &mut trace, &mut trace_out, record);
    }
}

/// Reproduce a recorded loop without an LLM. Recalls are re-run and must
/// return exactly the recorded item sets; the final answer is the last
/// record's answer.
pub fn replay(
    store: &mut MemoryStore,
    records: &[TraceRecord],
    config: &LoopConfig,
) -> Result<LoopOutcome> {
    if records.is_empty() {
        bail!("trace is empty; nothing to replay");
    }

    let mut seen: HashSet<String> = HashSet::new();
    for record in records {
        let Some(query) = &record.query else {
            continue;
        };
        let expects_recall = record.action == "continue" || record.action == "no_new_items";
        if !expects_recall {
            continue;
        }
        let added = recall_new(store, query, &seen, config)?;
        let got: HashSet<&str> = added.iter().map(|i| i.id.as_str()).collect();
        let want: HashSet<&str> = record.added_item_ids.iter().map(String::as_str).collect();
        if got != want {
            bail!(
                "replay divergence at iteration {}: recall for '{}' returned {:?}, trace recorded {:?}",
                record.iteration,
                query,
                got,
                want
            );
        }
        seen.extend(record.added_item_ids.iter().cloned());
    }

    let last = records.last().unwrap_or_else(|| unreachable!());
    let stop = last.stop_condition().unwrap_or(StopCondition::MaxCalls);
    info!(iterations = records.len(), "trace replayed");
    Ok(LoopOutcome {
        answer: last.answer.clone(),
        iterations: records.len(),
        stop,
        timed_out: last.timed_out,
        trace: records.to_vec(),
    })
}

/// Parse a JSONL trace stream.
pub fn parse_trace(input: &str) -> Result<Vec<TraceRecord>> {
    let mut records = Vec::new();
    for (idx, line) in input.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: TraceRecord = serde_json::from_str(line)
            .with_context(|| format!("trace line {}", idx + 1))?;
        records.push(record);
    }
    Ok(records)
}

fn recall_new(
    store: &mut MemoryStore,
    query: &str,
    context_ids: &HashSet<String>,
    config: &LoopConfig,
) -> Result<Vec<MemoryItem>> {
    let filters = SearchFilters {
        injectable_only: true,
        mount_id: config.mount_id.clone(),
        ..Default::default()
    };
    let (items, _meta) = store
        .search_fulltext(query, &filters, config.recall_limit)
        .context("recall during loop")?;
    Ok(items
        .into_iter()
        .filter(|item| !context_ids.contains(&item.id))
        .collect())
}

fn assemble_prompt(
    initial_context: &str,
    context_items: &[MemoryItem],
    question: &str,
    config: &LoopConfig,
) -> String {
    let mut prompt = String::new();
    if !initial_context.trim().is_empty() {
        prompt.push_str(initial_context.trim_end());
        prompt.push_str("\n\n");
    }
    if !context_items.is_empty() {
        prompt.push_str(&render_injection_block(context_items, config.context_budget));
        prompt.push_str("\n\n");
    }
    if config.protocol == LoopProtocol::Json {
        prompt.push_str(
            "First line of your reply must be a JSON envelope \
             {\"need_more\": bool, \"query\": string?, \"stop\": bool}; \
             the answer follows on subsequent lines.\n\n",
        );
    }
    if config.protocol == LoopProtocol::Regex {
        prompt.push_str(
            "To request another recall, include one line formatted as \
             'QUERY: <terms>'.\n\n",
        );
    }
    prompt.push_str("QUESTION: ");
    prompt.push_str(question);
    prompt.push('\n');
    prompt
}

fn terminal_record(
    iteration: usize,
    query: Option<String>,
    similarity: Option<f64>,
    stop: StopCondition,
    answer: String,
    timed_out: bool,
) -> TraceRecord {
    TraceRecord {
        iteration,
        query,
        similarity,
        action: stop.as_str().to_string(),
        added_item_ids: Vec::new(),
        answer,
        timed_out,
    }
}

fn emit(
    store: &mut MemoryStore,
    trace: &mut Vec<TraceRecord>,
    out: &mut Option<&mut (dyn Write + Send)>,
    record: TraceRecord,
) {
    if let Some(writer) = out {
        if let Ok(line) = serde_json::to_string(&record) {
            // Trace emission is best-effort; a full disk must not kill the loop.
            let _ = writeln!(writer, "{line}");
        }
    }
    let _ = store.append_event(
        memctl_memory::EventAction::LoopIter,
        None,
        Some(serde_json::json!({
            "iteration": record.iteration,
            "action": record.action,
        })),
    );
    trace.push(record);
}

fn outcome(
    trace: Vec<TraceRecord>,
    iterations: usize,
    stop: StopCondition,
    timed_out: bool,
) -> LoopOutcome {
    let answer = trace
        .last()
        .map(|r| r.answer.clone())
        .unwrap_or_default();
    LoopOutcome {
        answer,
        iterations,
        stop,
        timed_out,
        trace,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memctl_llm::MockInvoker;
    use memctl_memory::{MemoryItem, Provenance, TokenizerPreset};
    use memctl_policy::{Candidate, PolicyEngine};

    fn open_store() -> (tempfile::TempDir, MemoryStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = MemoryStore::open(&dir.path().join("memory.db"), TokenizerPreset::Fr)
            .expect("open store");
        (dir, store)
    }

    fn seed(store: &mut MemoryStore, content: &str) {
        let engine = PolicyEngine::new();
        let item = MemoryItem::new("seed", content, "note", vec![], Provenance::new("cli", "t"));
        let verdict = engine.evaluate_item(Candidate {
            title: &item.title,
            content: &item.content,
            item_type: &item.item_type,
            provenance_present: true,
            justification_present: true,
        });
        store.write_item(&item, &verdict, "seed").expect("write");
    }

    fn envelope(need_more: bool, query: Option<&str>, stop: bool, answer: &str) -> String {
        let env = serde_json::json!({
            "need_more": need_more,
            "query": query,
            "stop": stop,
        });
        format!("{env}\n{answer}")
    }

    #[tokio::test]
    async fn llm_stop_ends_after_one_call() {
        let (_dir, mut store) = open_store();
        let mock = MockInvoker::new(vec![envelope(false, None, true, "done answer")]);
        let outcome = run_loop(
            &mut store,
            &mock,
            "question",
            "",
            &LoopConfig::default(),
            None,
        )
        .await
        .expect("loop");
        assert_eq!(outcome.stop, StopCondition::LlmStop);
        assert_eq!(outcome.iterations, 1);
        assert_eq!(outcome.answer, "done answer");
        assert_eq!(mock.calls(), 1);
    }

    #[tokio::test]
    async fn passive_protocol_runs_exactly_one_iteration() {
        let (_dir, mut store) = open_store();
        let mock = MockInvoker::new(vec!["plain answer".to_string()]);
        let config = LoopConfig {
            protocol: LoopProtocol::Passive,
            max_calls: 5,
            ..Default::default()
        };
        let outcome = run_loop(&mut store, &mock, "q", "", &config, None)
            .await
            .expect("loop");
        assert_eq!(outcome.iterations, 1);
        assert_eq!(outcome.answer, "plain answer");
        assert_eq!(mock.calls(), 1);
    }

    #[tokio::test]
    async fn fixed_point_stops_after_two_identical_answers() {
        let (_dir, mut store) = open_store();
        seed(&mut store, "facts about the cascade design");
        seed(&mut store, "facts about the reindex design");

        let mock = MockInvoker::new(vec![
            envelope(true, Some("cascade design"), false, "early draft of the answer"),
            envelope(true, Some("reindex design"), false, "the final stable answer text"),
            envelope(true, Some("anything else"), false, "the final stable answer text"),
        ]);
        let config = LoopConfig {
            max_calls: 5,
            ..Default::default()
        };
        let outcome = run_loop(&mut store, &mock, "q", "", &config, None)
            .await
            .expect("loop");
        assert_eq!(outcome.stop, StopCondition::FixedPoint);
        assert_eq!(outcome.iterations, 3);
        assert_eq!(mock.calls(), 3);
        assert_eq!(outcome.trace.last().map(|r| r.action.as_str()), Some("fixed_point"));
    }

    #[tokio::test]
    async fn query_cycle_is_detected() {
        let (_dir, mut store) = open_store();
        seed(&mut store, "facts about the cascade design");

        let mock = MockInvoker::new(vec![
            envelope(true, Some("cascade design"), false, "draft one entirely"),
            envelope(true, Some("cascade design"), false, "different second draft"),
        ]);
        let outcome = run_loop(&mut store, &mock, "q", "", &LoopConfig::default(), None)
            .await
            .expect("loop");
        assert_eq!(outcome.stop, StopCondition::QueryCycle);
        assert_eq!(outcome.iterations, 2);
    }

    #[tokio::test]
    async fn no_new_items_stops_the_loop() {
        let (_dir, mut store) = open_store();
        let mock = MockInvoker::new(vec![envelope(
            true,
            Some("matches nothing at all"),
            false,
            "draft",
        )]);
        let outcome = run_loop(&mut store, &mock, "q", "", &LoopConfig::default(), None)
            .await
            .expect("loop");
        assert_eq!(outcome.stop, StopCondition::NoNewItems);
        assert_eq!(outcome.iterations, 1);
    }

    #[tokio::test]
    async fn max_calls_bounds_the_loop() {
        let (_dir, mut store) = open_store();
        seed(&mut store, "alpha subsystem facts");
        seed(&mut store, "beta subsystem facts");
        seed(&mut store, "gamma subsystem facts");

        let mock = MockInvoker::new(vec![
            envelope(true, Some("alpha subsystem"), false, "draft one here"),
            envelope(true, Some("beta subsystem"), false, "draft two differs"),
            envelope(true, Some("gamma subsystem"), false, "draft three differs more"),
            envelope(true, Some("delta subsystem"), false, "never reached"),
        ]);
        let config = LoopConfig {
            max_calls: 3,
            ..Default::default()
        };
        let outcome = run_loop(&mut store, &mock, "q", "", &config, None)
            .await
            .expect("loop");
        assert_eq!(outcome.stop, StopCondition::MaxCalls);
        assert_eq!(mock.calls(), 3, "LLM must not be invoked past max_calls");
        assert!(!outcome.timed_out);
    }

    #[tokio::test]
    async fn deadline_reports_max_calls_with_timeout_marker() {
        let (_dir, mut store) = open_store();
        let mock = MockInvoker::new(vec![]);
        let config = LoopConfig {
            deadline: Some(Duration::ZERO),
            ..Default::default()
        };
        let outcome = run_loop(&mut store, &mock, "q", "", &config, None)
            .await
            .expect("loop");
        assert_eq!(outcome.stop, StopCondition::MaxCalls);
        assert!(outcome.timed_out);
        assert_eq!(mock.calls(), 0);
    }

    #[tokio::test]
    async fn trace_replays_to_the_same_answer() {
        let (_dir, mut store) = open_store();
        seed(&mut store, "alpha subsystem facts");
        seed(&mut store, "beta subsystem facts");

        let mock = MockInvoker::new(vec![
            envelope(true, Some("alpha subsystem"), false, "draft one here"),
            envelope(true, Some("beta subsystem"), false, "draft two differs"),
            envelope(false, None, true, "final answer text"),
        ]);
        let config = LoopConfig {
            max_calls: 5,
            ..Default::default()
        };
        let mut trace_buf: Vec<u8> = Vec::new();
        let outcome = {
            let writer: &mut (dyn Write + Send) = &mut trace_buf;
            run_loop(&mut store, &mock, "q", "", &config, Some(writer))
                .await
                .expect("loop")
        };

        let trace_text = String::from_utf8(trace_buf).expect("utf8");
        let records = parse_trace(&trace_text).expect("parse");
        assert_eq!(records.len(), outcome.trace.len());

        let replayed = replay(&mut store, &records, &config).expect("replay");
        assert_eq!(replayed.answer, outcome.answer);
        assert_eq!(replayed.stop, StopCondition::LlmStop);
    }
}
