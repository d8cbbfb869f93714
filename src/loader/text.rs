use super::{LoadedDocument, Loader, Section, SectionKind, StructuralMap, decode_text};
use crate::error::RagResult;
use crate::types::TextSpan;

const FORM_FEED: char = '\u{000C}';

/// Plain text. Form feeds mark page breaks and are replaced by a newline.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainTextLoader;

impl Loader for PlainTextLoader {
    fn name(&self) -> &'static str {
        "text"
    }

    fn mime_types(&self) -> &'static [&'static str] {
        &["text/plain"]
    }

    fn load(&self, bytes: &[u8]) -> RagResult<LoadedDocument> {
        let decoded = decode_text(bytes)?;
        if !decoded.contains(FORM_FEED) {
            return Ok(LoadedDocument {
                text: decoded,
                ..Default::default()
            });
        }

        let mut text = String::with_capacity(decoded.len());
        let mut structure = StructuralMap::new();
        for (index, page) in decoded.split(FORM_FEED).enumerate() {
            if index > 0 {
                text.push('\n');
            }
            let start = text.len();
            text.push_str(page);
            structure.push(Section::new(
                SectionKind::Page {
                    number: index as u32 + 1,
                },
                None,
                TextSpan::new(start, text.len()),
            ));
        }

        Ok(LoadedDocument {
            text,
            structure,
            title: None,
        })
    }
}
