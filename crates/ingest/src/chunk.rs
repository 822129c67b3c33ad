//! Paragraph chunking and title/tag inference.
//!
//! Extracted text splits on blank lines; adjacent short paragraphs merge
//! until the soft maximum. A single paragraph longer than the maximum is
//! hard-split at a whitespace boundary so no chunk ever exceeds the store's
//! content limit. The chunk sequence is lazy and single-pass — downstream
//! consumers must not assume it can be re-iterated.

use std::path::Path;

/// Soft maximum characters per merged chunk.
pub const MAX_CHUNK_CHARS: usize = 2000;

/// Lazy paragraph chunker over extracted text.
pub struct ParagraphChunks<'a> {
    paragraphs: std::vec::IntoIter<&'a str>,
    pending: Option<String>,
    /// Oversized-paragraph remainder being drained piecewise.
    overflow: Option<String>,
    max_chars: usize,
}

impl<'a> ParagraphChunks<'a> {
    pub fn new(text: &'a str) -> Self {
        Self::with_max(text, MAX_CHUNK_CHARS)
    }

    pub fn with_max(text: &'a str, max_chars: usize) -> Self {
        let paragraphs: Vec<&str> = text
            .split("\n\n")
            .flat_map(|block| block.split("\r\n\r\n"))
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();
        Self {
            paragraphs: paragraphs.into_iter(),
            pending: None,
            overflow: None,
            max_chars: max_chars.max(1),
        }
    }

    /// Split an oversized paragraph at the last whitespace before the
    /// limit; falls back to a hard char cut for pathological tokens.
    fn split_oversized(&self, paragraph: &str) -> (String, Option<String>) {
        let chars: Vec<char> = paragraph.chars().collect();
        if chars.len() <= self.max_chars {
            return (paragraph.to_string(), None);
        }
        let window = &chars[..self.max_chars];
        let cut = window
            .iter()
            .rposition(|c| c.is_whitespace())
            .unwrap_or(self.max_chars - 1)
            + 1;
        let head: String = chars[..cut].iter().collect();
        let tail: String = chars[cut..].iter().collect();
        let tail = tail.trim().to_string();
        (
            head.trim_end().to_string(),
            if tail.is_empty() { None } else { Some(tail) },
        )
    }
}

impl Iterator for ParagraphChunks<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        loop {
            // Drain any oversized-paragraph remainder first.
            if let Some(overflow) = self.overflow.take() {
                let (head, rest) = self.split_oversized(&overflow);
                self.overflow = rest;
                return Some(head);
            }

            let Some(paragraph) = self.paragraphs.next() else {
                return self.pending.take();
            };

            if paragraph.chars().count() > self.max_chars {
                // Flush whatever was accumulating, then start draining.
                let flushed = self.pending.take();
                self.overflow = Some(paragraph.to_string());
                if let Some(chunk) = flushed {
                    return Some(chunk);
                }
                continue;
            }

            match self.pending.take() {
                None => self.pending = Some(paragraph.to_string()),
                Some(mut accumulated) => {
                    if accumulated.chars().count() + 2 + paragraph.chars().count() <= self.max_chars
                    {
                        accumulated.push_str("\n\n");
                        accumulated.push_str(paragraph);
                        self.pending = Some(accumulated);
                    } else {
                        self.pending = Some(paragraph.to_string());
                        return Some(accumulated);
                    }
                }
            }
        }
    }
}

/// Title: first markdown heading when present, else the path stem.
pub fn infer_title(text: &str, path: &Path) -> String {
    for line in text.lines() {
        let trimmed = line.trim();
        if let Some(heading) = trimmed.strip_prefix('#') {
            let heading = heading.trim_start_matches('#').trim();
            if !heading.is_empty() {
                return heading.to_string();
            }
        }
    }
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "untitled".to_string())
}

/// Tags: directory components below the mount root, lowercased, deduped.
pub fn infer_tags(rel_path: &Path) -> Vec<String> {
    let mut tags: Vec<String> = rel_path
        .parent()
        .map(|parent| {
            parent
                .components()
                .map(|c| c.as_os_str().to_string_lossy().to_lowercase())
                .filter(|c| !c.is_empty() && c != ".")
                .collect()
        })
        .unwrap_or_default();
    tags.sort();
    tags.dedup();
    tags
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn blank_lines_split_paragraphs() {
        let chunks: Vec<String> =
            ParagraphChunks::with_max("first paragraph\n\nsecond paragraph", 16).collect();
        assert_eq!(chunks, vec!["first paragraph", "second paragraph"]);
    }

    #[test]
    fn short_paragraphs_merge_up_to_the_limit() {
        let chunks: Vec<String> = ParagraphChunks::with_max("aa\n\nbb\n\ncc", 10).collect();
        // "aa\n\nbb" is 6 chars; adding "cc" (+2 separator) stays within 10.
        assert_eq!(chunks, vec!["aa\n\nbb\n\ncc"]);
    }

    #[test]
    fn merge_stops_at_the_soft_maximum() {
        let chunks: Vec<String> =
            ParagraphChunks::with_max("aaaa\n\nbbbb\n\ncccc", 10).collect();
        assert_eq!(chunks, vec!["aaaa\n\nbbbb", "cccc"]);
    }

    #[test]
    fn oversized_paragraph_is_hard_split_on_whitespace() {
        let long = "word ".repeat(100);
        let chunks: Vec<String> = ParagraphChunks::with_max(&long, 30).collect();
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 30, "chunk too long: {}", chunk.len());
            assert!(!chunk.contains("wo rd"), "split must land between words");
        }
    }

    #[test]
    fn empty_text_yields_no_chunks() {
        assert_eq!(ParagraphChunks::new("").count(), 0);
        assert_eq!(ParagraphChunks::new("\n\n\n\n").count(), 0);
    }

    #[test]
    fn default_maximum_bounds_every_chunk() {
        let text = "paragraph body. ".repeat(600);
        for chunk in ParagraphChunks::new(&text) {
            assert!(chunk.chars().count() <= MAX_CHUNK_CHARS);
        }
    }

    #[test]
    fn title_prefers_markdown_heading() {
        let title = infer_title("intro\n# Real Title\nbody", &PathBuf::from("docs/notes.md"));
        assert_eq!(title, "Real Title");
    }

    #[test]
    fn title_falls_back_to_path_stem() {
        let title = infer_title("no heading here", &PathBuf::from("docs/setup-guide.md"));
        assert_eq!(title, "setup-guide");
    }

    #[test]
    fn tags_come_from_directories_below_root() {
        let tags = infer_tags(&PathBuf::from("Docs/API/readme.md"));
        assert_eq!(tags, vec!["api".to_string(), "docs".to_string()]);
    }

    #[test]
    fn root_level_files_have_no_tags() {
        assert!(infer_tags(&PathBuf::from("readme.md")).is_empty());
    }
}
