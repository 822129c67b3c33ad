//! The detection rule table.
//!
//! Rules are evaluated in table order within a severity class; reject rules
//! always run before quarantine rules. Each rule is (id, compiled pattern,
//! severity, optional post-match validator). The validator lets a shape
//! match be confirmed before firing — payment cards are Luhn-checked so
//! build numbers and timestamps do not quarantine a document.

use std::sync::LazyLock;

use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Severity {
    Reject,
    Quarantine,
}

pub(crate) struct Rule {
    pub id: &'static str,
    pub severity: Severity,
    pub pattern: &'static Regex,
    pub validate: Option<fn(&str) -> bool>,
}

macro_rules! re {
    ($name:ident, $pattern:expr) => {
        static $name: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new($pattern).unwrap_or_else(|e| panic!("rule pattern {}: {e}", stringify!($name)))
        });
    };
}

// ── Secrets (reject) ──────────────────────────────────────────────────────────

re!(AWS_ACCESS_KEY, r"\bAKIA[0-9A-Z]{16}\b");
re!(GITHUB_PAT, r"\bghp_[A-Za-z0-9]{36,}\b");
re!(GITHUB_FINE_GRAINED, r"\bgithub_pat_[A-Za-z0-9_]{22,}\b");
re!(SLACK_TOKEN, r"\bxox[baprs]-[A-Za-z0-9-]{10,}\b");
re!(GOOGLE_API_KEY, r"\bAIza[0-9A-Za-z_\-]{35}\b");
re!(OPENAI_KEY, r"\bsk-[A-Za-z0-9_\-]{20,}\b");
re!(
    GENERIC_API_KEY,
    r#"(?i)\b(?:api[_-]?key|secret[_-]?key|access[_-]?token)\b["']?\s*[:=]\s*["']?\S{8,}"#
);
re!(BEARER_TOKEN, r"(?i)\bbearer\s+[A-Za-z0-9_\-.=]{20,}");
re!(
    PEM_PRIVATE_KEY,
    r"-----BEGIN (?:RSA |EC |OPENSSH |DSA |PGP )?PRIVATE KEY-----"
);
re!(
    JWT_TOKEN,
    r"\beyJ[A-Za-z0-9_\-]{8,}\.[A-Za-z0-9_\-]{8,}\.[A-Za-z0-9_\-]{8,}\b"
);

// ── Prompt injection (reject) ─────────────────────────────────────────────────

re!(
    IGNORE_PREVIOUS,
    r"(?i)\bignore\s+(?:all\s+)?(?:previous|prior|above|earlier)\s+(?:instructions|directives|prompts|messages)"
);
re!(
    DISREGARD_RULES,
    r"(?i)\bdisregard\s+(?:your|all|any|the)\s+(?:instructions|rules|guidelines|training)"
);
re!(
    UNRESTRICTED_ROLE,
    r"(?i)\byou\s+are\s+(?:now\s+)?(?:a|an)\s+(?:unrestricted|jailbroken|uncensored)"
);
re!(ROLE_OVERRIDE_MARKER, r"(?im)^\s*(?:system|assistant)\s*:\s+\S");
re!(
    NEW_INSTRUCTIONS,
    r"(?i)\byour\s+new\s+(?:instructions|task|role|objective)\s+(?:is|are)\b"
);
re!(
    REVEAL_SYSTEM_PROMPT,
    r"(?i)\b(?:reveal|print|show|repeat)\s+(?:your|the)\s+system\s+prompt\b"
);
re!(DAN_MODE, r"(?i)\bdo\s+anything\s+now\b|\bDAN\s+mode\b");
re!(
    BYPASS_SAFETY,
    r"(?i)\b(?:bypass|disable|override)\s+(?:your\s+)?(?:safety|content)\s+(?:filters?|guidelines|rules)\b"
);

// ── Instructional blocks (reject) ─────────────────────────────────────────────

re!(TOOL_INVOCATION_XML, r"(?i)<\s*(?:tool_use|function_call|invoke)\b");
re!(TOOL_CALLS_JSON, r#""tool_calls"\s*:\s*\["#);
re!(
    READER_SELF_INSTRUCTION,
    r"(?i)\bwhen\s+you\s+read\s+this\s*,?\s*(?:you\s+must|always|immediately)\b"
);
re!(
    EXFIL_IMPERATIVE,
    r"(?i)\b(?:send|post|upload|exfiltrate)\s+(?:all\s+)?(?:your|the)\s+(?:memory|memories|data|contents)\s+to\b"
);
re!(
    EXECUTE_COMMAND,
    r"(?i)\b(?:run|execute)\s+the\s+following\s+(?:shell\s+)?command\b"
);
re!(
    ALWAYS_INCLUDE_BLOCK,
    r"(?i)\balways\s+include\s+this\s+(?:text|block|instruction)\b"
);
re!(HIDDEN_COMMENT_INSTRUCTION, r"(?i)<!--\s*(?:ai|assistant|llm)\s*:");
re!(
    MARKDOWN_EXFIL_LINK,
    r"(?i)!\[[^\]]*\]\(https?://[^)]*[?&](?:data|q|payload)="
);

// ── Softer instructional patterns (quarantine) ────────────────────────────────

re!(
    REMEMBER_ALWAYS,
    r"(?i)\bplease\s+remember\s+(?:to|that)\s+always\b"
);
re!(ACT_AS_ROLE, r"(?i)\bact\s+as\s+(?:a|an)\s+[a-z]");
re!(
    FROM_NOW_ON,
    r"(?i)\bfrom\s+now\s+on\s*,?\s*(?:you|answer|respond|reply)\b"
);
re!(TEMPLATE_PLACEHOLDER, r"\{\{\s*[a-z_]+\s*\}\}");

// ── PII (quarantine only) ─────────────────────────────────────────────────────

re!(PII_EMAIL, r"\b[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}\b");
re!(PII_PHONE, r"(?:\+|\b00)\d{1,3}[\s.\-]?\d{1,4}(?:[\s.\-]?\d{2,4}){2,4}\b");
re!(PII_PAYMENT_CARD, r"\b(?:\d[ \-]?){12,18}\d\b");
re!(PII_IBAN, r"\b[A-Z]{2}\d{2}[A-Z0-9]{10,30}\b");
re!(PII_NATIONAL_ID, r"\b\d{3}-\d{2}-\d{4}\b");

/// Luhn checksum over the digits of a shape match.
fn luhn_valid(text: &str) -> bool {
    let digits: Vec<u32> = text.chars().filter_map(|c| c.to_digit(10)).collect();
    if digits.len() < 13 || digits.len() > 19 {
        return false;
    }
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 { doubled - 9 } else { doubled }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}

/// IBAN shape matches must carry at least ten digits; this keeps uppercase
/// project codes out of quarantine.
fn iban_digit_density(text: &str) -> bool {
    text.chars().filter(|c| c.is_ascii_digit()).count() >= 10
}

/// The full table, evaluation order = declaration order.
pub(crate) fn rule_table() -> Vec<Rule> {
    vec![
        // Secrets
        Rule { id: "secret-aws-access-key", severity: Severity::Reject, pattern: &AWS_ACCESS_KEY, validate: None },
        Rule { id: "secret-github-pat", severity: Severity::Reject, pattern: &GITHUB_PAT, validate: None },
        Rule { id: "secret-github-pat-fine-grained", severity: Severity::Reject, pattern: &GITHUB_FINE_GRAINED, validate: None },
        Rule { id: "secret-slack-token", severity: Severity::Reject, pattern: &SLACK_TOKEN, validate: None },
        Rule { id: "secret-google-api-key", severity: Severity::Reject, pattern: &GOOGLE_API_KEY, validate: None },
        Rule { id: "secret-openai-key", severity: Severity::Reject, pattern: &OPENAI_KEY, validate: None },
        Rule { id: "secret-generic-api-key", severity: Severity::Reject, pattern: &GENERIC_API_KEY, validate: None },
        Rule { id: "secret-bearer-token", severity: Severity::Reject, pattern: &BEARER_TOKEN, validate: None },
        Rule { id: "secret-pem-private-key", severity: Severity::Reject, pattern: &PEM_PRIVATE_KEY, validate: None },
        Rule { id: "secret-jwt-token", severity: Severity::Reject, pattern: &JWT_TOKEN, validate: None },
        // Prompt injection
        Rule { id: "inject-ignore-previous", severity: Severity::Reject, pattern: &IGNORE_PREVIOUS, validate: None },
        Rule { id: "inject-disregard-rules", severity: Severity::Reject, pattern: &DISREGARD_RULES, validate: None },
        Rule { id: "inject-unrestricted-role", severity: Severity::Reject, pattern: &UNRESTRICTED_ROLE, validate: None },
        Rule { id: "inject-role-override-marker", severity: Severity::Reject, pattern: &ROLE_OVERRIDE_MARKER, validate: None },
        Rule { id: "inject-new-instructions", severity: Severity::Reject, pattern: &NEW_INSTRUCTIONS, validate: None },
        Rule { id: "inject-reveal-system-prompt", severity: Severity::Reject, pattern: &REVEAL_SYSTEM_PROMPT, validate: None },
        Rule { id: "inject-dan-mode", severity: Severity::Reject, pattern: &DAN_MODE, validate: None },
        Rule { id: "inject-bypass-safety", severity: Severity::Reject, pattern: &BYPASS_SAFETY, validate: None },
        // Instructional blocks
        Rule { id: "instr-tool-invocation", severity: Severity::Reject, pattern: &TOOL_INVOCATION_XML, validate: None },
        Rule { id: "instr-tool-calls-json", severity: Severity::Reject, pattern: &TOOL_CALLS_JSON, validate: None },
        Rule { id: "instr-reader-self-instruction", severity: Severity::Reject, pattern: &READER_SELF_INSTRUCTION, validate: None },
        Rule { id: "instr-exfil-imperative", severity: Severity::Reject, pattern: &EXFIL_IMPERATIVE, validate: None },
        Rule { id: "instr-execute-command", severity: Severity::Reject, pattern: &EXECUTE_COMMAND, validate: None },
        Rule { id: "instr-always-include", severity: Severity::Reject, pattern: &ALWAYS_INCLUDE_BLOCK, validate: None },
        Rule { id: "instr-hidden-comment", severity: Severity::Reject, pattern: &HIDDEN_COMMENT_INSTRUCTION, validate: None },
        Rule { id: "instr-markdown-exfil", severity: Severity::Reject, pattern: &MARKDOWN_EXFIL_LINK, validate: None },
        // Softer instructional patterns
        Rule { id: "softinstr-remember-always", severity: Severity::Quarantine, pattern: &REMEMBER_ALWAYS, validate: None },
        Rule { id: "softinstr-act-as-role", severity: Severity::Quarantine, pattern: &ACT_AS_ROLE, validate: None },
        Rule { id: "softinstr-from-now-on", severity: Severity::Quarantine, pattern: &FROM_NOW_ON, validate: None },
        Rule { id: "softinstr-template-placeholder", severity: Severity::Quarantine, pattern: &TEMPLATE_PLACEHOLDER, validate: None },
        // PII
        Rule { id: "pii-payment-card", severity: Severity::Quarantine, pattern: &PII_PAYMENT_CARD, validate: Some(luhn_valid) },
        Rule { id: "pii-email", severity: Severity::Quarantine, pattern: &PII_EMAIL, validate: None },
        Rule { id: "pii-phone", severity: Severity::Quarantine, pattern: &PII_PHONE, validate: None },
        Rule { id: "pii-iban", severity: Severity::Quarantine, pattern: &PII_IBAN, validate: Some(iban_digit_density) },
        Rule { id: "pii-national-id", severity: Severity::Quarantine, pattern: &PII_NATIONAL_ID, validate: None },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn luhn_accepts_known_good_number() {
        assert!(luhn_valid("4539 1488 0343 6467"));
    }

    #[test]
    fn luhn_rejects_off_by_one() {
        assert!(!luhn_valid("4539 1488 0343 6468"));
    }

    #[test]
    fn luhn_rejects_short_runs() {
        assert!(!luhn_valid("1234 5678"));
    }

    #[test]
    fn iban_density_filters_project_codes() {
        assert!(iban_digit_density("FR7630006000011234567890189"));
        assert!(!iban_digit_density("EN24PROJECTPLANFORNEXTYEAR"));
    }

    #[test]
    fn table_has_expected_rule_families() {
        let table = rule_table();
        let count = |prefix: &str| table.iter().filter(|r| r.id.starts_with(prefix)).count();
        assert_eq!(count("secret-"), 10);
        assert_eq!(count("inject-"), 8);
        assert_eq!(count("instr-"), 8);
        assert_eq!(count("softinstr-"), 4);
        assert_eq!(count("pii-"), 5);
    }
}
