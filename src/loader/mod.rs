//! Turning raw document bytes into normalized text.
//!
//! A [`Loader`] is a pure transform from bytes to [`LoadedDocument`]. The
//! [`LoaderRegistry`] picks a loader by declared mime type and enforces the
//! configured size ceiling while streaming the input.

mod archive;
mod html;
mod json;
mod markdown;
mod text;

pub use archive::ArchiveLoader;
pub use html::HtmlLoader;
pub use json::JsonLoader;
pub use markdown::MarkdownLoader;
pub use text::PlainTextLoader;

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use crate::config::LoaderConfig;
use crate::error::{RagError, RagResult};
use crate::types::TextSpan;

/// Kind of structural region found by a loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    Page { number: u32 },
    Heading { level: u8 },
    Table,
    CodeBlock,
    /// Named part of a container (archive entry, top-level JSON key)
    Entry,
}

impl SectionKind {
    /// Units the chunker keeps whole when they fit in one window.
    pub fn is_atomic(&self) -> bool {
        matches!(self, Self::Table | Self::CodeBlock)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    pub kind: SectionKind,
    pub label: Option<String>,
    pub span: TextSpan,
}

impl Section {
    pub fn new(kind: SectionKind, label: Option<String>, span: TextSpan) -> Self {
        Self { kind, label, span }
    }

    fn shifted(&self, offset: usize) -> Self {
        Self {
            kind: self.kind,
            label: self.label.clone(),
            span: TextSpan::new(self.span.start + offset, self.span.end + offset),
        }
    }
}

/// Structural hints over a document's normalized text, used for citations
/// and to keep tables and code blocks together.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StructuralMap {
    pub sections: Vec<Section>,
}

impl StructuralMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, section: Section) {
        if !section.span.is_empty() {
            self.sections.push(section);
        }
    }

    /// Append another map whose offsets start at `offset` in this document.
    pub fn extend_shifted(&mut self, other: &StructuralMap, offset: usize) {
        self.sections
            .extend(other.sections.iter().map(|s| s.shifted(offset)));
    }

    /// Atomic units sorted by start offset.
    pub fn atomic_units(&self) -> Vec<TextSpan> {
        let mut units: Vec<TextSpan> = self
            .sections
            .iter()
            .filter(|s| s.kind.is_atomic())
            .map(|s| s.span)
            .collect();
        units.sort_by_key(|s| (s.start, s.end));
        units
    }

    /// Page number containing `offset`, if the document has pages.
    pub fn page_at(&self, offset: usize) -> Option<u32> {
        self.sections.iter().find_map(|s| match s.kind {
            SectionKind::Page { number } if s.span.contains(offset) => Some(number),
            _ => None,
        })
    }

    /// Heading path (outermost first) or entry name enclosing `offset`.
    pub fn section_at(&self, offset: usize) -> Option<String> {
        let mut headings: Vec<(u8, &str)> = self
            .sections
            .iter()
            .filter(|s| s.span.contains(offset))
            .filter_map(|s| match (s.kind, s.label.as_deref()) {
                (SectionKind::Heading { level }, Some(label)) => Some((level, label)),
                (SectionKind::Entry, Some(label)) => Some((0, label)),
                _ => None,
            })
            .collect();
        if headings.is_empty() {
            return None;
        }
        headings.sort_by_key(|(level, _)| *level);
        Some(
            headings
                .into_iter()
                .map(|(_, label)| label)
                .collect::<Vec<_>>()
                .join(" > "),
        )
    }
}

/// Output of a loader.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadedDocument {
    pub text: String,
    pub structure: StructuralMap,
    /// Title discovered in the content (HTML `<title>`, first markdown H1)
    pub title: Option<String>,
}

pub trait Loader: Send + Sync {
    fn name(&self) -> &'static str;

    /// Mime types this loader handles, lowercase without parameters.
    fn mime_types(&self) -> &'static [&'static str];

    fn load(&self, bytes: &[u8]) -> RagResult<LoadedDocument>;
}

/// Strip parameters and case from a declared mime type.
pub fn normalize_mime(mime: &str) -> String {
    mime.split(';').next().unwrap_or("").trim().to_ascii_lowercase()
}

/// Guess a mime type from a file extension.
pub fn mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    let mime = match ext.as_str() {
        "txt" | "text" | "log" | "csv" | "rst" => "text/plain",
        "md" | "markdown" | "mdx" => "text/markdown",
        "html" | "htm" | "xhtml" => "text/html",
        "json" => "application/json",
        "zip" => "application/zip",
        "pdf" => "application/pdf",
        _ => return None,
    };
    Some(mime)
}

/// Decode UTF-8 and normalize line endings. A leading BOM is dropped.
pub(crate) fn decode_text(bytes: &[u8]) -> RagResult<String> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| RagError::corrupt(format!("invalid UTF-8 at byte {}", e.valid_up_to())))?;
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    if !text.contains('\r') {
        return Ok(text.to_string());
    }
    Ok(text.replace("\r\n", "\n").replace('\r', "\n"))
}

/// Registered loaders keyed by mime type.
pub struct LoaderRegistry {
    loaders: HashMap<String, Arc<dyn Loader>>,
    config: LoaderConfig,
}

impl LoaderRegistry {
    /// Registry without any handler.
    pub fn empty(config: LoaderConfig) -> Self {
        Self {
            loaders: HashMap::new(),
            config,
        }
    }

    /// Registry with the built-in text, markdown, HTML, JSON and ZIP loaders.
    pub fn with_defaults(config: LoaderConfig) -> Self {
        let max_bytes = config.max_bytes;
        let mut registry = Self::empty(config);
        let leaves: Vec<Arc<dyn Loader>> = vec![
            Arc::new(PlainTextLoader),
            Arc::new(MarkdownLoader),
            Arc::new(HtmlLoader),
            Arc::new(JsonLoader),
        ];
        for loader in &leaves {
            registry.register(loader.clone());
        }
        registry.register(Arc::new(ArchiveLoader::new(leaves, max_bytes)));
        registry
    }

    pub fn register(&mut self, loader: Arc<dyn Loader>) {
        for mime in loader.mime_types() {
            self.loaders.insert((*mime).to_string(), loader.clone());
        }
    }

    pub fn max_bytes(&self) -> u64 {
        self.config.max_bytes
    }

    pub fn supports(&self, mime: &str) -> bool {
        self.resolve(mime).is_ok()
    }

    /// Find the loader for `mime`; unknown `text/*` types fall back to plain text.
    pub fn resolve(&self, mime: &str) -> RagResult<Arc<dyn Loader>> {
        let mime = normalize_mime(mime);
        if let Some(loader) = self.loaders.get(&mime) {
            return Ok(loader.clone());
        }
        if mime.starts_with("text/") {
            if let Some(loader) = self.loaders.get("text/plain") {
                return Ok(loader.clone());
            }
        }
        Err(RagError::unsupported(mime))
    }

    /// Load an in-memory buffer.
    pub fn load(&self, bytes: &[u8], mime: &str) -> RagResult<LoadedDocument> {
        let loader = self.resolve(mime)?;
        if bytes.len() as u64 > self.config.max_bytes {
            return Err(RagError::TooLarge {
                limit: self.config.max_bytes,
            });
        }
        self.run(loader.as_ref(), bytes)
    }

    /// Stream `reader` in fixed-size pieces, failing with `TooLarge` as soon
    /// as the ceiling is crossed instead of reading the rest.
    /// At most `max_bytes + 1` bytes are ever pulled from `reader`.
    pub fn load_reader<R: Read>(&self, reader: R, mime: &str) -> RagResult<LoadedDocument> {
        let loader = self.resolve(mime)?;
        let limit = self.config.max_bytes;
        let mut reader = reader.take(limit.saturating_add(1));
        let mut buffer = vec![0u8; self.config.read_buffer_bytes.max(1024)];
        let mut bytes = Vec::new();

        loop {
            let read = reader.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            if (bytes.len() + read) as u64 > limit {
                return Err(RagError::TooLarge { limit });
            }
            bytes.extend_from_slice(&buffer[..read]);
        }

        self.run(loader.as_ref(), &bytes)
    }

    fn run(&self, loader: &dyn Loader, bytes: &[u8]) -> RagResult<LoadedDocument> {
        let loaded = loader.load(bytes)?;
        tracing::debug!(
            target: "loader",
            "{} produced {} bytes of text with {} sections",
            loader.name(),
            loaded.text.len(),
            loaded.structure.sections.len()
        );
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> LoaderRegistry {
        LoaderRegistry::with_defaults(LoaderConfig::default())
    }

    #[test]
    fn test_normalize_mime_strips_parameters() {
        assert_eq!(normalize_mime("Text/HTML; charset=UTF-8"), "text/html");
        assert_eq!(normalize_mime("application/json"), "application/json");
    }

    #[test]
    fn test_pdf_is_unsupported() {
        let err = registry().load(b"%PDF-1.7", "application/pdf").unwrap_err();
        assert!(matches!(err, RagError::UnsupportedType { mime } if mime == "application/pdf"));
    }

    #[test]
    fn test_unknown_text_subtype_falls_back_to_plain() {
        let loaded = registry().load(b"a,b\n1,2", "text/csv").unwrap();
        assert_eq!(loaded.text, "a,b\n1,2");
    }

    #[test]
    fn test_too_large_buffer() {
        let registry = LoaderRegistry::with_defaults(LoaderConfig {
            max_bytes: 8,
            read_buffer_bytes: 4,
        });
        assert!(matches!(
            registry.load(b"0123456789", "text/plain"),
            Err(RagError::TooLarge { limit: 8 })
        ));
    }

    #[test]
    fn test_load_reader_stops_at_ceiling() {
        struct Endless {
            served: usize,
        }
        impl Read for Endless {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                buf.fill(b'a');
                self.served += buf.len();
                Ok(buf.len())
            }
        }

        let registry = LoaderRegistry::with_defaults(LoaderConfig {
            max_bytes: 10_000,
            read_buffer_bytes: 1024,
        });
        let mut reader = Endless { served: 0 };
        let result = registry.load_reader(&mut reader, "text/plain");
        assert!(matches!(result, Err(RagError::TooLarge { .. })));
        assert_eq!(reader.served, 10_001);
    }

    #[test]
    fn test_unsupported_type_checked_before_reading() {
        let registry = registry();
        let reader = std::io::repeat(0).take(u64::MAX);
        assert!(matches!(
            registry.load_reader(reader, "image/png"),
            Err(RagError::UnsupportedType { .. })
        ));
    }

    #[test]
    fn test_section_at_builds_heading_path() {
        let mut map = StructuralMap::new();
        map.push(Section::new(
            SectionKind::Heading { level: 1 },
            Some("Guide".into()),
            TextSpan::new(0, 100),
        ));
        map.push(Section::new(
            SectionKind::Heading { level: 2 },
            Some("Install".into()),
            TextSpan::new(40, 80),
        ));
        map.push(Section::new(
            SectionKind::Page { number: 2 },
            None,
            TextSpan::new(50, 100),
        ));

        assert_eq!(map.section_at(10).as_deref(), Some("Guide"));
        assert_eq!(map.section_at(45).as_deref(), Some("Guide > Install"));
        assert_eq!(map.page_at(45), None);
        assert_eq!(map.page_at(60), Some(2));
        assert_eq!(map.section_at(200), None);
    }

    #[test]
    fn test_mime_for_path() {
        assert_eq!(mime_for_path(Path::new("a/notes.MD")), Some("text/markdown"));
        assert_eq!(mime_for_path(Path::new("report.pdf")), Some("application/pdf"));
        assert_eq!(mime_for_path(Path::new("binary")), None);
    }
}
