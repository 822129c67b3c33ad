//! In-memory session tracking. Single-process, never persisted.

use std::collections::HashMap;

/// Proposals accepted from one session within a single turn.
pub const MAX_PROPOSALS_PER_TURN: u64 = 10;

pub const DEFAULT_SESSION: &str = "default";

#[derive(Debug, Default, Clone)]
pub struct SessionState {
    pub turns: u64,
    pub writes_this_turn: u64,
    pub proposals_this_turn: u64,
    /// Request id of the turn in progress; tool calls sharing a request id
    /// belong to one turn.
    last_request_id: Option<String>,
}

#[derive(Debug, Default)]
pub struct SessionTracker {
    sessions: HashMap<String, SessionState>,
}

impl SessionTracker {
    /// Session id from the transport context, with the singleton fallback.
    pub fn derive(explicit: Option<&str>) -> String {
        explicit
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_SESSION)
            .to_string()
    }

    /// Note a tool call for `request_id`. A new request id opens a new
    /// turn (counter bump, per-turn tallies reset); repeat ids join the
    /// turn in progress.
    pub fn begin_turn(&mut self, session: &str, request_id: &str) {
        let state = self.sessions.entry(session.to_string()).or_default();
        if state.last_request_id.as_deref() != Some(request_id) {
            state.turns += 1;
            state.writes_this_turn = 0;
            state.proposals_this_turn = 0;
            state.last_request_id = Some(request_id.to_string());
        }
    }

    pub fn note_write(&mut self, session: &str) {
        self.sessions
            .entry(session.to_string())
            .or_default()
            .writes_this_turn += 1;
    }

    /// Returns false when the per-turn proposal cap is hit.
    pub fn note_proposal(&mut self, session: &str) -> bool {
        let state = self.sessions.entry(session.to_string()).or_default();
        if state.proposals_this_turn >= MAX_PROPOSALS_PER_TURN {
            return false;
        }
        state.proposals_this_turn += 1;
        true
    }

    pub fn state(&self, session: &str) -> Option<&SessionState> {
        self.sessions.get(session)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_context_falls_back_to_the_default_singleton() {
        assert_eq!(SessionTracker::derive(None), "default");
        assert_eq!(SessionTracker::derive(Some("")), "default");
        assert_eq!(SessionTracker::derive(Some("  ")), "default");
        assert_eq!(SessionTracker::derive(Some("mcp-abc")), "mcp-abc");
    }

    #[test]
    fn turns_count_and_reset_per_turn_tallies() {
        let mut tracker = SessionTracker::default();
        tracker.begin_turn("s", "req-1");
        tracker.note_write("s");
        tracker.note_write("s");
        assert_eq!(tracker.state("s").unwrap().writes_this_turn, 2);

        tracker.begin_turn("s", "req-2");
        let state = tracker.state("s").unwrap();
        assert_eq!(state.turns, 2);
        assert_eq!(state.writes_this_turn, 0);
    }

    #[test]
    fn same_request_id_shares_one_turn() {
        let mut tracker = SessionTracker::default();
        tracker.begin_turn("s", "req-1");
        tracker.note_write("s");
        tracker.begin_turn("s", "req-1");
        let state = tracker.state("s").unwrap();
        assert_eq!(state.turns, 1);
        assert_eq!(state.writes_this_turn, 1, "tallies survive within a turn");
    }

    #[test]
    fn proposal_cap_applies_per_turn() {
        let mut tracker = SessionTracker::default();
        tracker.begin_turn("s", "req-1");
        for _ in 0..MAX_PROPOSALS_PER_TURN {
            assert!(tracker.note_proposal("s"));
        }
        assert!(!tracker.note_proposal("s"));

        tracker.begin_turn("s", "req-2");
        assert!(tracker.note_proposal("s"), "cap resets with the turn");
    }

    #[test]
    fn sessions_are_isolated() {
        let mut tracker = SessionTracker::default();
        tracker.begin_turn("a", "req-1");
        tracker.begin_turn("b", "req-1");
        tracker.note_write("a");
        assert_eq!(tracker.state("a").unwrap().writes_this_turn, 1);
        assert_eq!(tracker.state("b").unwrap().writes_this_turn, 0);
        assert_eq!(tracker.session_count(), 2);
    }
}
