use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::Arc;

use super::{LoadedDocument, Loader, Section, SectionKind, StructuralMap, mime_for_path};
use crate::error::{RagError, RagResult};
use crate::types::TextSpan;

/// ZIP archives. Each entry with a known text type is loaded by the matching
/// leaf loader and becomes an `Entry` section named after its path.
pub struct ArchiveLoader {
    leaves: HashMap<&'static str, Arc<dyn Loader>>,
    max_unpacked_bytes: u64,
}

impl ArchiveLoader {
    pub fn new(leaves: Vec<Arc<dyn Loader>>, max_unpacked_bytes: u64) -> Self {
        let mut by_mime = HashMap::new();
        for loader in leaves {
            for mime in loader.mime_types() {
                by_mime.insert(*mime, loader.clone());
            }
        }
        Self {
            leaves: by_mime,
            max_unpacked_bytes,
        }
    }
}

impl Loader for ArchiveLoader {
    fn name(&self) -> &'static str {
        "zip"
    }

    fn mime_types(&self) -> &'static [&'static str] {
        &["application/zip", "application/x-zip-compressed"]
    }

    fn load(&self, bytes: &[u8]) -> RagResult<LoadedDocument> {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
            .map_err(|e| RagError::corrupt(format!("invalid zip archive: {e}")))?;

        let mut text = String::new();
        let mut structure = StructuralMap::new();
        let mut unpacked = 0u64;

        for index in 0..archive.len() {
            let mut entry = archive
                .by_index(index)
                .map_err(|e| RagError::corrupt(format!("zip entry {index}: {e}")))?;
            if entry.is_dir() {
                continue;
            }
            let name = entry.name().to_string();
            let Some(loader) = mime_for_path(Path::new(&name)).and_then(|m| self.leaves.get(m))
            else {
                tracing::debug!(target: "loader", "skipping archive entry '{name}'");
                continue;
            };

            // Bound the decompressed size, not the declared one
            let remaining = self.max_unpacked_bytes.saturating_sub(unpacked);
            let mut content = Vec::new();
            (&mut entry)
                .take(remaining + 1)
                .read_to_end(&mut content)
                .map_err(|e| RagError::corrupt(format!("zip entry '{name}': {e}")))?;
            if content.len() as u64 > remaining {
                return Err(RagError::TooLarge {
                    limit: self.max_unpacked_bytes,
                });
            }
            unpacked += content.len() as u64;

            let loaded = loader.load(&content).map_err(|e| match e {
                RagError::CorruptInput { reason } => {
                    RagError::corrupt(format!("zip entry '{name}': {reason}"))
                }
                other => other,
            })?;
            if loaded.text.trim().is_empty() {
                continue;
            }

            if !text.is_empty() {
                text.push_str("\n\n");
            }
            let start = text.len();
            text.push_str(&loaded.text);
            structure.extend_shifted(&loaded.structure, start);
            structure.push(Section::new(
                SectionKind::Entry,
                Some(name),
                TextSpan::new(start, text.len()),
            ));
        }

        if text.is_empty() {
            return Err(RagError::corrupt("archive contains no loadable entries"));
        }

        Ok(LoadedDocument {
            text,
            structure,
            title: None,
        })
    }
}
