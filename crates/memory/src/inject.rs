//! Injection block rendering.
//!
//! The block is a stable, versioned contract (`format_version = 1`): a
//! header line carrying version and token budget, then one entry per item
//! with tier tag, id, title, tags, and content. The budget is enforced by
//! prefix trimming at item granularity — an item is either fully present or
//! absent, never cut mid-sentence.

use crate::schema::MemoryItem;

pub const FORMAT_VERSION: u32 = 1;

/// Rough token estimate: four characters per token, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Render items into a budgeted block. Quarantined and archived items are
/// skipped no matter what the caller passed in.
pub fn render_injection_block(items: &[MemoryItem], token_budget: usize) -> String {
    let header = format!("[memctl:inject v{FORMAT_VERSION} budget={token_budget}]");
    let mut block = header.clone();
    let mut spent = estimate_tokens(&header);
    let mut included = 0usize;

    for item in items {
        if !item.injectable || item.archived {
            continue;
        }
        let entry = render_entry(item);
        let cost = estimate_tokens(&entry);
        if spent + cost > token_budget {
            break;
        }
        block.push('\n');
        block.push_str(&entry);
        spent += cost;
        included += 1;
    }

    if included == 0 {
        block.push_str("\n(no items within budget)");
    }
    block
}

fn render_entry(item: &MemoryItem) -> String {
    let tags = if item.tags.is_empty() {
        String::new()
    } else {
        let rendered: Vec<String> = item.tags.iter().map(|t| format!("#{t}")).collect();
        format!(" {}", rendered.join(" "))
    };
    format!(
        "- [{}] {} {}{}\n  {}",
        item.tier.as_str(),
        item.id,
        item.title,
        tags,
        item.content.replace('\n', "\n  "),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{MemoryTier, Provenance};

    fn item(content: &str) -> MemoryItem {
        MemoryItem::new(
            "title",
            content,
            "note",
            vec!["alpha".to_string()],
            Provenance::new("cli", "unit"),
        )
    }

    #[test]
    fn header_carries_version_and_budget() {
        let block = render_injection_block(&[], 500);
        assert!(block.starts_with("[memctl:inject v1 budget=500]"));
    }

    #[test]
    fn entries_carry_tier_id_title_tags() {
        let sample = item("some content here");
        let block = render_injection_block(std::slice::from_ref(&sample), 500);
        assert!(block.contains("[STM]"));
        assert!(block.contains(&sample.id));
        assert!(block.contains("#alpha"));
        assert!(block.contains("some content here"));
    }

    #[test]
    fn budget_trims_whole_items_only() {
        let items: Vec<MemoryItem> = (0..10)
            .map(|i| item(&format!("filler content number {i} {}", "word ".repeat(40))))
            .collect();
        let block = render_injection_block(&items, 120);
        // Every included entry is complete: its content tail must be present.
        let included = block.matches("- [STM]").count();
        assert!(included < items.len());
        for line in block.lines().filter(|l| l.starts_with("- [STM]")) {
            assert!(line.contains("title"));
        }
    }

    #[test]
    fn quarantined_items_never_render() {
        let mut quarantined = item("sensitive content");
        quarantined.injectable = false;
        let clean = item("ordinary content");
        let block = render_injection_block(&[quarantined.clone(), clean.clone()], 500);
        assert!(!block.contains(&quarantined.id));
        assert!(block.contains(&clean.id));
    }

    #[test]
    fn archived_items_never_render() {
        let mut archived = item("old content");
        archived.archived = true;
        archived.tier = MemoryTier::Mtm;
        let block = render_injection_block(std::slice::from_ref(&archived), 500);
        assert!(!block.contains(&archived.id));
        assert!(block.contains("(no items within budget)"));
    }
}
