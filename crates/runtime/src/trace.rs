//! Loop trace records.
//!
//! One JSONL record per iteration. Traces are replayable: the stored query
//! and added-item sets let a later run reproduce the final answer without
//! any LLM, verifying that recall still returns what it returned then.

use serde::{Deserialize, Serialize};

/// Why the loop ended. The five conditions the controller enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopCondition {
    LlmStop,
    FixedPoint,
    QueryCycle,
    NoNewItems,
    MaxCalls,
}

impl StopCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopCondition::LlmStop => "llm_stop",
            StopCondition::FixedPoint => "fixed_point",
            StopCondition::QueryCycle => "query_cycle",
            StopCondition::NoNewItems => "no_new_items",
            StopCondition::MaxCalls => "max_calls",
        }
    }
}

/// Per-iteration trace. `action` is `"continue"` or a stop condition tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceRecord {
    pub iteration: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    /// Combined similarity of this answer against the previous one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f64>,
    pub action: String,
    #[serde(default)]
    pub added_item_ids: Vec<String>,
    pub answer: String,
    #[serde(default)]
    pub timed_out: bool,
}

impl TraceRecord {
    pub fn is_terminal(&self) -> bool {
        self.action != "continue"
    }

    pub fn stop_condition(&self) -> Option<StopCondition> {
        match self.action.as_str() {
            "llm_stop" => Some(StopCondition::LlmStop),
            "fixed_point" => Some(StopCondition::FixedPoint),
            "query_cycle" => Some(StopCondition::QueryCycle),
            "no_new_items" => Some(StopCondition::NoNewItems),
            "max_calls" => Some(StopCondition::MaxCalls),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_round_trip_through_jsonl() {
        let record = TraceRecord {
            iteration: 2,
            query: Some("cascade rungs".to_string()),
            similarity: Some(0.51),
            action: "continue".to_string(),
            added_item_ids: vec!["a".to_string(), "b".to_string()],
            answer: "partial answer".to_string(),
            timed_out: false,
        };
        let line = serde_json::to_string(&record).expect("serialize");
        let parsed: TraceRecord = serde_json::from_str(&line).expect("parse");
        assert_eq!(parsed.iteration, 2);
        assert_eq!(parsed.added_item_ids.len(), 2);
        assert!(!parsed.is_terminal());
    }

    #[test]
    fn terminal_actions_map_back_to_conditions() {
        for condition in [
            StopCondition::LlmStop,
            StopCondition::FixedPoint,
            StopCondition::QueryCycle,
            StopCondition::NoNewItems,
            StopCondition::MaxCalls,
        ] {
            let record = TraceRecord {
                iteration: 1,
                query: None,
                similarity: None,
                action: condition.as_str().to_string(),
                added_item_ids: vec![],
                answer: String::new(),
                timed_out: false,
            };
            assert!(record.is_terminal());
            assert_eq!(record.stop_condition(), Some(condition));
        }
    }
}
