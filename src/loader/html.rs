use regex::Regex;
use std::sync::LazyLock;

use super::{LoadedDocument, Loader, Section, SectionKind, StructuralMap};
use crate::error::{RagError, RagResult};
use crate::types::TextSpan;

static TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<!--.*?-->|<![^>]*>|<(/?)([a-zA-Z][a-zA-Z0-9]*)\b[^>]*?(/?)>")
        .expect("static regex is valid")
});

/// Elements whose content is never text.
const SKIPPED: &[&str] = &["script", "style", "noscript", "template", "svg"];

/// Elements that start a new line of text.
const BLOCKS: &[&str] = &[
    "p", "div", "section", "article", "header", "footer", "main", "nav", "aside", "ul", "ol",
    "li", "dl", "dt", "dd", "blockquote", "figure", "figcaption", "form", "hr", "br", "tr",
    "table", "thead", "tbody", "pre", "h1", "h2", "h3", "h4", "h5", "h6",
];

/// HTML reduced to readable text. Scripts and styles are dropped; headings,
/// tables and `<pre>` blocks become sections.
#[derive(Debug, Default, Clone, Copy)]
pub struct HtmlLoader;

impl Loader for HtmlLoader {
    fn name(&self) -> &'static str {
        "html"
    }

    fn mime_types(&self) -> &'static [&'static str] {
        &["text/html", "application/xhtml+xml"]
    }

    fn load(&self, bytes: &[u8]) -> RagResult<LoadedDocument> {
        // Web pages in the wild are not always valid UTF-8; replace rather than reject
        let html = String::from_utf8_lossy(bytes);
        if html.trim().is_empty() {
            return Err(RagError::corrupt("empty HTML document"));
        }
        Ok(extract(&html))
    }
}

#[derive(Default)]
struct TextBuilder {
    text: String,
    pending_space: bool,
}

impl TextBuilder {
    fn push_text(&mut self, raw: &str, preformatted: bool) {
        if preformatted {
            self.pending_space = false;
            self.text.push_str(raw);
            return;
        }
        let mut words = raw.split_whitespace().peekable();
        if words.peek().is_none() {
            self.pending_space |= !raw.is_empty();
            return;
        }
        if raw.starts_with(char::is_whitespace) {
            self.pending_space = true;
        }
        for (i, word) in words.enumerate() {
            let at_line_start = self.text.is_empty() || self.text.ends_with('\n');
            if (i > 0 || self.pending_space) && !at_line_start {
                self.text.push(' ');
            }
            self.text.push_str(word);
        }
        self.pending_space = raw.ends_with(char::is_whitespace);
    }

    fn push_separator(&mut self, separator: &str) {
        if !self.text.is_empty() && !self.text.ends_with('\n') {
            self.text.push_str(separator);
        }
        self.pending_space = false;
    }

    /// End the current line.
    fn newline(&mut self) {
        self.pending_space = false;
        if !self.text.is_empty() && !self.text.ends_with('\n') {
            self.text.push('\n');
        }
    }

    /// End the current paragraph with one blank line.
    fn blank_line(&mut self) {
        self.newline();
        if !self.text.is_empty() && !self.text.ends_with("\n\n") {
            self.text.push('\n');
        }
    }

    fn trim_end(&mut self) {
        let trimmed = self.text.trim_end().len();
        self.text.truncate(trimmed);
    }
}

fn extract(html: &str) -> LoadedDocument {
    let mut out = TextBuilder::default();
    let mut structure = StructuralMap::new();
    let mut title: Option<String> = None;

    let mut skip_depth: Option<&str> = None;
    let mut in_title = false;
    let mut title_text = String::new();
    let mut pre_start: Option<usize> = None;
    let mut table_start: Option<usize> = None;
    let mut first_cell = true;
    let mut open_heading: Option<(u8, usize)> = None;
    let mut headings: Vec<(u8, String, usize)> = Vec::new();

    let mut cursor = 0;
    for caps in TAG.captures_iter(html) {
        let Some(whole) = caps.get(0) else { continue };
        let between = &html[cursor..whole.start()];
        cursor = whole.end();

        if skip_depth.is_none() {
            if in_title {
                title_text.push_str(&decode_entities(between));
            } else if !between.is_empty() {
                out.push_text(&decode_entities(between), pre_start.is_some());
            }
        }

        // Comment or doctype
        let Some(name) = caps.get(2) else { continue };
        let name = name.as_str().to_ascii_lowercase();
        let closing = caps.get(1).is_some_and(|m| !m.as_str().is_empty());

        if let Some(skipped) = skip_depth {
            if closing && name == skipped {
                skip_depth = None;
            }
            continue;
        }

        if name == "title" {
            in_title = !closing;
            if closing && title.is_none() {
                let cleaned = title_text.split_whitespace().collect::<Vec<_>>().join(" ");
                if !cleaned.is_empty() {
                    title = Some(cleaned);
                }
            }
            continue;
        }
        let self_closing = caps.get(3).is_some_and(|m| !m.as_str().is_empty());
        if !closing && !self_closing {
            if let Some(skipped) = SKIPPED.iter().find(|s| **s == name) {
                skip_depth = Some(*skipped);
                continue;
            }
        }

        let heading = name
            .strip_prefix('h')
            .and_then(|level| level.parse::<u8>().ok())
            .filter(|level| (1..=6).contains(level));

        match (name.as_str(), closing) {
            ("td" | "th", false) => {
                if !first_cell {
                    out.push_separator(" | ");
                }
                first_cell = false;
            }
            ("tr", false) => first_cell = true,
            ("tr", true) => out.newline(),
            ("table", false) => {
                out.newline();
                table_start = Some(out.text.len());
            }
            ("table", true) => {
                out.trim_end();
                if let Some(start) = table_start.take() {
                    structure.push(Section::new(
                        SectionKind::Table,
                        None,
                        TextSpan::new(start.min(out.text.len()), out.text.len()),
                    ));
                }
                out.newline();
            }
            ("pre", false) => {
                out.newline();
                pre_start = Some(out.text.len());
            }
            ("pre", true) => {
                if let Some(start) = pre_start.take() {
                    out.trim_end();
                    structure.push(Section::new(
                        SectionKind::CodeBlock,
                        None,
                        TextSpan::new(start.min(out.text.len()), out.text.len()),
                    ));
                }
                out.blank_line();
            }
            _ if heading.is_some() => {
                let level = heading.unwrap_or(1);
                out.blank_line();
                if closing {
                    if let Some((open_level, start)) = open_heading.take() {
                        let label = out.text[start..].trim().to_string();
                        if !label.is_empty() {
                            headings.push((open_level, label, start));
                        }
                    }
                } else {
                    open_heading = Some((level, out.text.len()));
                }
            }
            _ if BLOCKS.contains(&name.as_str()) => {
                if matches!(name.as_str(), "p" | "div" | "section" | "article") && closing {
                    out.blank_line();
                } else {
                    out.newline();
                }
            }
            _ => {}
        }
    }

    if skip_depth.is_none() && cursor < html.len() {
        out.push_text(&decode_entities(&html[cursor..]), pre_start.is_some());
    }
    out.trim_end();
    let text = out.text;

    for (i, (level, label, start)) in headings.iter().enumerate() {
        let end = headings[i + 1..]
            .iter()
            .find(|(next_level, _, _)| next_level <= level)
            .map_or(text.len(), |(_, _, next_start)| *next_start);
        structure.push(Section::new(
            SectionKind::Heading { level: *level },
            Some(label.clone()),
            TextSpan::new((*start).min(text.len()), end.min(text.len())),
        ));
    }

    LoadedDocument {
        text,
        structure,
        title,
    }
}

/// Decode the common named entities and numeric character references.
fn decode_entities(raw: &str) -> String {
    if !raw.contains('&') {
        return raw.to_string();
    }
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let Some(semi) = tail[..tail.len().min(12)].find(';') else {
            out.push('&');
            rest = &tail[1..];
            continue;
        };
        let entity = &tail[1..semi];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" | "#39" => Some('\''),
            "nbsp" => Some(' '),
            _ => entity.strip_prefix('#').and_then(|num| {
                let code = match num.strip_prefix(['x', 'X']) {
                    Some(hex) => u32::from_str_radix(hex, 16).ok(),
                    None => num.parse::<u32>().ok(),
                };
                code.and_then(char::from_u32)
            }),
        };
        match decoded {
            Some(c) => {
                out.push(c);
                rest = &tail[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<html><head><title>Backup  Policy</title>
<style>body { color: red; }</style></head>
<body>
<script>var x = "<p>not text</p>";</script>
<h1>Backups</h1>
<p>Nightly backups run at <b>02:00</b> &amp; are kept for 30&nbsp;days.</p>
<!-- hidden comment -->
<h2>Retention</h2>
<table><tr><th>Tier</th><th>Days</th></tr><tr><td>Hot</td><td>7</td></tr></table>
<pre>rsync -a /data /backup</pre>
</body></html>"#;

    #[test]
    fn test_strips_scripts_styles_and_comments() {
        let loaded = HtmlLoader.load(PAGE.as_bytes()).unwrap();
        assert!(!loaded.text.contains("color"));
        assert!(!loaded.text.contains("not text"));
        assert!(!loaded.text.contains("hidden"));
        assert!(loaded.text.contains("Nightly backups run at 02:00 & are kept for 30 days."));
        assert_eq!(loaded.title.as_deref(), Some("Backup Policy"));
    }

    #[test]
    fn test_tables_and_pre_are_atomic_sections() {
        let loaded = HtmlLoader.load(PAGE.as_bytes()).unwrap();
        let units = loaded.structure.atomic_units();
        assert_eq!(units.len(), 2);
        let table = &loaded.text[units[0].start..units[0].end];
        assert_eq!(table, "Tier | Days\nHot | 7");
        let pre = &loaded.text[units[1].start..units[1].end];
        assert_eq!(pre, "rsync -a /data /backup");
    }

    #[test]
    fn test_heading_sections() {
        let loaded = HtmlLoader.load(PAGE.as_bytes()).unwrap();
        let offset = loaded.text.find("Hot").unwrap();
        assert_eq!(
            loaded.structure.section_at(offset).as_deref(),
            Some("Backups > Retention")
        );
    }

    #[test]
    fn test_decode_entities() {
        assert_eq!(decode_entities("a &lt;b&gt; &#65;&#x42; & c"), "a <b> AB & c");
        assert_eq!(decode_entities("&unknown; x"), "&unknown; x");
    }

    #[test]
    fn test_empty_document_is_corrupt() {
        assert!(HtmlLoader.load(b"   ").is_err());
    }
}
