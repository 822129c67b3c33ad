//! Interactive chat history, persisted as one JSONL file per day under the
//! platform data directory. Only the REPL reads it back; the store never
//! does.

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub question: String,
    pub answer: String,
    pub at: chrono::DateTime<Utc>,
}

fn history_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("memctl")
        .join("history")
}

/// Today's history file path.
pub fn history_file_path() -> PathBuf {
    history_dir().join(format!("{}.jsonl", Utc::now().format("%Y-%m-%d")))
}

pub fn append_turn(question: &str, answer: &str) -> Result<()> {
    let path = history_file_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating history dir {}", parent.display()))?;
    }
    let turn = HistoryTurn {
        question: question.to_string(),
        answer: answer.to_string(),
        at: Utc::now(),
    };
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("opening {}", path.display()))?;
    writeln!(file, "{}", serde_json::to_string(&turn)?)?;
    Ok(())
}

pub fn clear_history() -> Result<()> {
    let path = history_file_path();
    if path.exists() {
        fs::remove_file(&path).with_context(|| format!("removing {}", path.display()))?;
    }
    Ok(())
}

pub fn export_history(dest: &std::path::Path) -> Result<()> {
    let path = history_file_path();
    if !path.exists() {
        fs::write(dest, "")?;
        return Ok(());
    }
    fs::copy(&path, dest)
        .with_context(|| format!("copying history to {}", dest.display()))?;
    Ok(())
}
