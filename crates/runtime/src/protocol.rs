//! Loop refinement protocols.
//!
//! The LLM proposes, the controller disposes. Three dialects:
//!
//! - `json` — the reply's first line is an envelope
//!   `{"need_more": bool, "query": string?, "stop": bool}`; everything
//!   after it is the answer.
//! - `regex` — a single `QUERY: ...` line anywhere in the reply is the
//!   refinement directive; the line is stripped from the answer.
//! - `passive` — no refinement; the whole reply is the answer and the loop
//!   runs exactly one iteration.
//!
//! A malformed envelope degrades to passive for that reply — the
//! controller never guesses at intent.

use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopProtocol {
    Json,
    Regex,
    Passive,
}

impl LoopProtocol {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "json" => Some(LoopProtocol::Json),
            "regex" => Some(LoopProtocol::Regex),
            "passive" => Some(LoopProtocol::Passive),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LoopProtocol::Json => "json",
            LoopProtocol::Regex => "regex",
            LoopProtocol::Passive => "passive",
        }
    }
}

/// What the LLM asked for, plus the answer text with directives stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    pub need_more: bool,
    pub query: Option<String>,
    pub stop: bool,
    pub answer: String,
}

#[derive(Debug, Deserialize)]
struct JsonEnvelope {
    #[serde(default)]
    need_more: bool,
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    stop: bool,
}

fn query_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^QUERY:\s*(.+)$").unwrap_or_else(|e| panic!("query regex: {e}"))
    })
}

/// Parse one raw LLM reply under the given protocol.
pub fn parse_reply(protocol: LoopProtocol, raw: &str) -> Directive {
    match protocol {
        LoopProtocol::Passive => Directive {
            need_more: false,
            query: None,
            stop: true,
            answer: raw.trim().to_string(),
        },
        LoopProtocol::Json => {
            let mut lines = raw.splitn(2, '\n');
            let first = lines.next().unwrap_or("").trim();
            let rest = lines.next().unwrap_or("").trim();
            match serde_json::from_str::<JsonEnvelope>(first) {
                Ok(envelope) => Directive {
                    need_more: envelope.need_more,
                    query: envelope
                        .query
                        .map(|q| q.trim().to_string())
                        .filter(|q| !q.is_empty()),
                    stop: envelope.stop,
                    answer: rest.to_string(),
                },
                Err(_) => Directive {
                    need_more: false,
                    query: None,
                    stop: true,
                    answer: raw.trim().to_string(),
                },
            }
        }
        LoopProtocol::Regex => {
            let query = query_line_re()
                .captures(raw)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().trim().to_string())
                .filter(|q| !q.is_empty());
            let answer = query_line_re().replace_all(raw, "").trim().to_string();
            Directive {
                need_more: query.is_some(),
                query,
                stop: false,
                answer,
            }
        }
    }
}
