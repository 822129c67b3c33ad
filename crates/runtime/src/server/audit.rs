//! JSONL audit log, schema v1.
//!
//! One record per tool call, success or failure. Fields may be added in
//! minor versions, never removed. Raw content never appears in a record —
//! only a 120-char preview, the content SHA-256, and the byte length.
//! Emission is fire-and-forget: a failing audit sink must not disturb
//! tool execution.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;

use memctl_memory::content_hash;

pub const AUDIT_SCHEMA_VERSION: u32 = 1;

/// Preview length for content digests.
const PREVIEW_CHARS: usize = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Ok,
    Error,
    Blocked,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Ok => "ok",
            AuditOutcome::Error => "error",
            AuditOutcome::Blocked => "blocked",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AuditRecord {
    pub v: u32,
    pub ts: String,
    pub request_id: String,
    pub tool: String,
    pub session: String,
    /// Root-relative database path.
    pub db: String,
    pub outcome: AuditOutcome,
    pub d: Value,
    pub ms: u64,
}

/// Append-only audit sink.
pub struct AuditLog {
    out: Box<dyn Write + Send>,
}

impl AuditLog {
    pub fn to_stderr() -> Self {
        Self {
            out: Box::new(std::io::stderr()),
        }
    }

    pub fn to_file(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            out: Box::new(file),
        })
    }

    pub fn to_writer(out: Box<dyn Write + Send>) -> Self {
        Self { out }
    }

    /// Emit one record. Failures are swallowed.
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &mut self,
        request_id: &str,
        tool: &str,
        session: &str,
        db: &str,
        outcome: AuditOutcome,
        detail: Value,
        elapsed_ms: u64,
    ) {
        let record = AuditRecord {
            v: AUDIT_SCHEMA_VERSION,
            ts: Utc::now().to_rfc3339(),
            request_id: request_id.to_string(),
            tool: tool.to_string(),
            session: session.to_string(),
            db: db.to_string(),
            outcome,
            d: detail,
            ms: elapsed_ms,
        };
        if let Ok(line) = serde_json::to_string(&record) {
            let _ = writeln!(self.out, "{line}");
            let _ = self.out.flush();
        }
    }
}

/// Privacy-preserving stand-in for raw content in audit details.
pub fn content_digest(content: &str) -> Value {
    let preview: String = content.chars().take(PREVIEW_CHARS).collect();
    serde_json::json!({
        "preview": preview,
        "sha256": content_hash(content),
        "bytes": content.len(),
    })
}
