//! Query normalization, intent classification, and budget suggestion.
//!
//! Normalization strips high-frequency English and French words so that the
//! FTS cascade starts from discriminating terms, while preserving anything
//! that looks like a code identifier verbatim (mixed case, underscores,
//! dotted paths, ALL-CAPS acronyms). Diacritics are left intact — folding is
//! the tokenizer's job, not ours.

use std::sync::OnceLock;

use regex::Regex;

/// English + French articles, prepositions, and question words stripped from
/// queries before the cascade runs.
const STOP_WORDS: &[&str] = &[
    // English
    "the", "and", "for", "was", "has", "are", "not", "this", "that", "with", "from", "have",
    "you", "can", "its", "will", "but", "they", "all", "been", "also", "into", "more", "than",
    "when", "who", "what", "how", "why", "where", "which", "out", "our", "new", "now", "does",
    "did", "about", "some", "any", "a", "an", "of", "in", "on", "to", "is", "it", "do", "be",
    // French
    "le", "la", "les", "un", "une", "des", "du", "de", "et", "ou", "dans", "sur", "pour",
    "par", "avec", "sans", "est", "sont", "que", "qui", "quoi", "quel", "quelle", "quels",
    "quelles", "comment", "pourquoi", "quand", "ce", "cette", "ces", "son", "sa", "ses", "au",
    "aux", "en",
];

/// First-verb lists for [`classify_mode`].
const EXPLORE_VERBS: &[&str] = &[
    "how", "where", "what", "which", "why", "when", "who", "explain", "describe", "find",
    "show", "list", "search", "explore", "understand", "comment", "pourquoi", "trouve",
    "explique", "montre",
];
const MODIFY_VERBS: &[&str] = &[
    "add", "replace", "refactor", "fix", "create", "write", "update", "delete", "remove",
    "rename", "implement", "change", "modify", "insert", "ajoute", "corrige", "remplace",
    "modifie", "implemente",
];

fn identifier_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // underscore names | dotted paths | ALL_CAPS acronyms (>= 2 chars)
        Regex::new(r"^(?:\w*_\w*|[A-Za-z0-9]+(?:\.[A-Za-z0-9]+)+|[A-Z0-9]{2,})$")
            .unwrap_or_else(|e| panic!("identifier regex: {e}"))
    })
}

/// True for tokens that must survive normalization verbatim. The cascade
/// also consults this when choosing which term to drop first.
pub fn is_identifier(token: &str) -> bool {
    if identifier_re().is_match(token) {
        return true;
    }
    // Mixed case with an internal capital: camelCase or PascalCase beyond
    // plain sentence capitalization (e.g. `MemoryStore`, `writeItem`).
    let has_lower = token.chars().any(|c| c.is_lowercase());
    let internal_upper = token.chars().skip(1).any(|c| c.is_uppercase());
    has_lower && internal_upper
}

/// Strip stop words while preserving identifiers; collapse whitespace.
pub fn normalize_query(raw: &str) -> String {
    raw.split_whitespace()
        .map(|tok| tok.trim_matches(|c: char| !c.is_alphanumeric() && c != '_' && c != '.'))
        .filter(|tok| !tok.is_empty())
        .filter(|tok| is_identifier(tok) || !STOP_WORDS.contains(&tok.to_lowercase().as_str()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Whether a prompt reads as exploration or modification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMode {
    Exploration,
    Modification,
}

/// Deterministic first-verb classification. Unmatched or tied prompts
/// resolve to [`QueryMode::Exploration`].
pub fn classify_mode(prompt: &str) -> QueryMode {
    let first = prompt
        .split_whitespace()
        .next()
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .unwrap_or_default();

    if MODIFY_VERBS.contains(&first.as_str()) && !EXPLORE_VERBS.contains(&first.as_str()) {
        QueryMode::Modification
    } else {
        QueryMode::Exploration
    }
}

/// Piecewise-constant token budget for a question of `question_chars` length.
pub fn suggest_budget(question_chars: usize) -> usize {
    match question_chars {
        0..80 => 600,
        80..200 => 800,
        200..400 => 1200,
        _ => 1500,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_words_are_stripped() {
        assert_eq!(normalize_query("what is the REST convention"), "REST convention");
    }

    #[test]
    fn french_stop_words_are_stripped() {
        assert_eq!(
            normalize_query("quelle est la convention pour les endpoints"),
            "convention endpoints"
        );
    }

    #[test]
    fn underscore_identifiers_survive() {
        assert_eq!(normalize_query("where is write_item defined"), "write_item defined");
    }

    #[test]
    fn dotted_paths_survive() {
        assert_eq!(normalize_query("what does config.store.fts do"), "config.store.fts");
    }

    #[test]
    fn camel_case_survives_even_as_stop_word_lookalike() {
        // `An` would be a stop word; `AnIdentifier` has an internal capital.
        assert_eq!(normalize_query("explain AnIdentifier here"), "AnIdentifier here");
    }

    #[test]
    fn all_caps_acronyms_survive() {
        assert_eq!(normalize_query("what is the FTS index"), "FTS index");
    }

    #[test]
    fn diacritics_are_preserved() {
        assert_eq!(normalize_query("la sécurité du serveur"), "sécurité serveur");
    }

    #[test]
    fn exploration_is_the_default_mode() {
        assert_eq!(classify_mode("how does sync work"), QueryMode::Exploration);
        assert_eq!(classify_mode(""), QueryMode::Exploration);
        assert_eq!(classify_mode("banana stand"), QueryMode::Exploration);
    }

    #[test]
    fn modification_verbs_classify_as_modification() {
        assert_eq!(classify_mode("add a retry to the store"), QueryMode::Modification);
        assert_eq!(classify_mode("Fix the cascade ordering"), QueryMode::Modification);
        assert_eq!(classify_mode("refactor: extract the guard"), QueryMode::Modification);
    }

    #[test]
    fn budget_brackets_match_contract() {
        assert_eq!(suggest_budget(0), 600);
        assert_eq!(suggest_budget(79), 600);
        assert_eq!(suggest_budget(80), 800);
        assert_eq!(suggest_budget(199), 800);
        assert_eq!(suggest_budget(200), 1200);
        assert_eq!(suggest_budget(399), 1200);
        assert_eq!(suggest_budget(400), 1500);
        assert_eq!(suggest_budget(10_000), 1500);
    }
}
