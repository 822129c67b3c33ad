//! Extension-dispatched text extraction.
//!
//! Every extractor is a pure `bytes -> String` function. Plain-text
//! families are handled in-crate; binary office/PDF formats are external
//! collaborators that callers register at startup. Asking for an
//! unregistered binary format is an explicit error naming the missing
//! dependency — never a silent skip.

use std::collections::HashMap;

use thiserror::Error;

/// Extraction failure. Its own enum so ingestion can tell a missing
/// optional dependency from a genuinely unreadable file.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("no extractor for .{extension}: {hint}")]
    MissingExtractor { extension: String, hint: String },
    #[error(".{extension} bytes are not valid UTF-8 text")]
    Undecodable { extension: String },
}

pub type Extractor = fn(&[u8]) -> Result<String, ExtractError>;

/// Extensions read directly as UTF-8 text (lossy on stray bytes).
const TEXT_EXTENSIONS: &[&str] = &[
    "md", "markdown", "txt", "text", "rst", "adoc", "org", "rs", "py", "js", "ts", "jsx", "tsx",
    "java", "go", "c", "h", "cpp", "hpp", "cc", "cs", "rb", "php", "swift", "kt", "scala", "sh",
    "bash", "zsh", "fish", "sql", "html", "htm", "css", "scss", "xml", "json", "jsonl", "yaml",
    "yml", "toml", "ini", "cfg", "conf", "env", "csv", "tsv", "tex", "log", "makefile", "dockerfile",
];

/// Binary formats whose extractors are external collaborators.
const BINARY_FORMATS: &[(&str, &str)] = &[
    ("pdf", "register a PDF extractor (e.g. a pdftotext wrapper)"),
    ("docx", "register a DOCX extractor (e.g. a docx-to-text wrapper)"),
    ("xlsx", "register an XLSX extractor"),
    ("pptx", "register a PPTX extractor"),
    ("odt", "register an ODT extractor"),
];

fn extract_text(bytes: &[u8]) -> Result<String, ExtractError> {
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

/// Registry mapping lowercased extensions to extractor functions.
pub struct ExtractorRegistry {
    extractors: HashMap<String, Extractor>,
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        let mut extractors: HashMap<String, Extractor> = HashMap::new();
        for ext in TEXT_EXTENSIONS {
            extractors.insert((*ext).to_string(), extract_text as Extractor);
        }
        Self { extractors }
    }

    /// Install (or replace) an extractor for one extension.
    pub fn register(&mut self, extension: &str, extractor: Extractor) {
        self.extractors.insert(extension.to_lowercase(), extractor);
    }

    pub fn supports(&self, extension: &str) -> bool {
        self.extractors.contains_key(&extension.to_lowercase())
    }

    /// Extract text from `bytes` for a file with `extension`.
    pub fn extract(&self, extension: &str, bytes: &[u8]) -> Result<String, ExtractError> {
        let key = extension.to_lowercase();
        if let Some(extractor) = self.extractors.get(&key) {
            return extractor(bytes);
        }
        if let Some((_, hint)) = BINARY_FORMATS.iter().find(|(ext, _)| *ext == key) {
            return Err(ExtractError::MissingExtractor {
                extension: key,
                hint: (*hint).to_string(),
            });
        }
        // Unknown extension: accept it when it decodes cleanly.
        match std::str::from_utf8(bytes) {
            Ok(text) => Ok(text.to_string()),
            Err(_) => Err(ExtractError::Undecodable { extension: key }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markdown_reads_directly() {
        let registry = ExtractorRegistry::new();
        let text = registry.extract("md", b"# Title\n\nbody").expect("extract");
        assert_eq!(text, "# Title\n\nbody");
    }

    #[test]
    fn pdf_without_extractor_names_the_dependency() {
        let registry = ExtractorRegistry::new();
        let err = registry.extract("pdf", b"%PDF-1.4").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("pdf"), "got: {message}");
        assert!(message.contains("extractor"), "got: {message}");
    }

    #[test]
    fn registered_extractor_takes_over() {
        let mut registry = ExtractorRegistry::new();
        fn fake_pdf(_bytes: &[u8]) -> Result<String, ExtractError> {
            Ok("extracted pdf text".to_string())
        }
        registry.register("pdf", fake_pdf);
        let text = registry.extract("PDF", b"%PDF-1.4").expect("extract");
        assert_eq!(text, "extracted pdf text");
    }

    #[test]
    fn unknown_extension_with_valid_utf8_passes_through() {
        let registry = ExtractorRegistry::new();
        let text = registry.extract("weird", b"plain enough").expect("extract");
        assert_eq!(text, "plain enough");
    }

    #[test]
    fn unknown_extension_with_binary_bytes_errors() {
        let registry = ExtractorRegistry::new();
        let err = registry.extract("bin", &[0xff, 0xfe, 0x00, 0x01]).unwrap_err();
        assert!(err.to_string().contains("not valid UTF-8"));
    }
}
