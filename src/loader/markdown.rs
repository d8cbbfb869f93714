use super::{LoadedDocument, Loader, Section, SectionKind, StructuralMap, decode_text};
use crate::error::RagResult;
use crate::types::TextSpan;

/// Markdown kept verbatim, with headings, fenced code blocks and pipe
/// tables recorded as sections.
#[derive(Debug, Default, Clone, Copy)]
pub struct MarkdownLoader;

impl Loader for MarkdownLoader {
    fn name(&self) -> &'static str {
        "markdown"
    }

    fn mime_types(&self) -> &'static [&'static str] {
        &["text/markdown", "text/x-markdown"]
    }

    fn load(&self, bytes: &[u8]) -> RagResult<LoadedDocument> {
        let text = decode_text(bytes)?;
        let (structure, title) = scan(&text);
        Ok(LoadedDocument {
            text,
            structure,
            title,
        })
    }
}

/// Lines with their starting byte offset, without the trailing newline.
fn lines_with_offsets(text: &str) -> impl Iterator<Item = (usize, &str)> {
    let mut offset = 0;
    text.split_inclusive('\n').map(move |raw| {
        let start = offset;
        offset += raw.len();
        (start, raw.strip_suffix('\n').unwrap_or(raw))
    })
}

fn heading_level(line: &str) -> Option<(u8, &str)> {
    let trimmed = line.trim_start_matches(' ');
    if line.len() - trimmed.len() > 3 {
        return None;
    }
    let hashes = trimmed.bytes().take_while(|b| *b == b'#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    let rest = &trimmed[hashes..];
    if !rest.is_empty() && !rest.starts_with([' ', '\t']) {
        return None;
    }
    let label = rest.trim().trim_end_matches('#').trim();
    if label.is_empty() {
        return None;
    }
    Some((hashes as u8, label))
}

fn fence_marker(line: &str) -> Option<&'static str> {
    let trimmed = line.trim_start();
    if trimmed.starts_with("```") {
        Some("```")
    } else if trimmed.starts_with("~~~") {
        Some("~~~")
    } else {
        None
    }
}

fn is_table_row(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.starts_with('|') && trimmed.len() > 1
}

fn scan(text: &str) -> (StructuralMap, Option<String>) {
    let mut structure = StructuralMap::new();
    let mut headings: Vec<(u8, String, usize)> = Vec::new();
    let mut title = None;

    let mut fence: Option<(&'static str, usize)> = None;
    let mut table: Option<(usize, usize, usize)> = None; // start, end, rows

    for (start, line) in lines_with_offsets(text) {
        let end = start + line.len();

        if let Some((marker, fence_start)) = fence {
            if line.trim_start().starts_with(marker) {
                structure.push(Section::new(
                    SectionKind::CodeBlock,
                    None,
                    TextSpan::new(fence_start, end),
                ));
                fence = None;
            }
            continue;
        }

        if is_table_row(line) {
            table = match table {
                Some((table_start, _, rows)) => Some((table_start, end, rows + 1)),
                None => Some((start, end, 1)),
            };
            continue;
        }
        if let Some((table_start, table_end, rows)) = table.take() {
            if rows >= 2 {
                structure.push(Section::new(
                    SectionKind::Table,
                    None,
                    TextSpan::new(table_start, table_end),
                ));
            }
        }

        if let Some(marker) = fence_marker(line) {
            fence = Some((marker, start));
            continue;
        }

        if let Some((level, label)) = heading_level(line) {
            if level == 1 && title.is_none() {
                title = Some(label.to_string());
            }
            headings.push((level, label.to_string(), start));
        }
    }

    if let Some((table_start, table_end, rows)) = table {
        if rows >= 2 {
            structure.push(Section::new(
                SectionKind::Table,
                None,
                TextSpan::new(table_start, table_end),
            ));
        }
    }
    if let Some((_, fence_start)) = fence {
        // Unclosed fence runs to the end of the document
        structure.push(Section::new(
            SectionKind::CodeBlock,
            None,
            TextSpan::new(fence_start, text.len()),
        ));
    }

    // A heading's section ends where the next heading of the same or a higher level starts
    for (i, (level, label, start)) in headings.iter().enumerate() {
        let end = headings[i + 1..]
            .iter()
            .find(|(next_level, _, _)| next_level <= level)
            .map_or(text.len(), |(_, _, next_start)| *next_start);
        structure.push(Section::new(
            SectionKind::Heading { level: *level },
            Some(label.clone()),
            TextSpan::new(*start, end),
        ));
    }

    (structure, title)
}
