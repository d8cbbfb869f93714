use serde_json::Value;

use super::{LoadedDocument, Loader, Section, SectionKind, StructuralMap};
use crate::error::{RagError, RagResult};
use crate::types::TextSpan;

/// JSON rendered as readable text: one entry per top-level key or array item.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonLoader;

impl Loader for JsonLoader {
    fn name(&self) -> &'static str {
        "json"
    }

    fn mime_types(&self) -> &'static [&'static str] {
        &["application/json", "text/json"]
    }

    fn load(&self, bytes: &[u8]) -> RagResult<LoadedDocument> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| RagError::corrupt(format!("invalid JSON: {e}")))?;

        let entries: Vec<(String, &Value)> = match &value {
            Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v)).collect(),
            Value::Array(items) => items
                .iter()
                .enumerate()
                .map(|(i, v)| (format!("[{i}]"), v))
                .collect(),
            scalar => {
                return Ok(LoadedDocument {
                    text: render(scalar)?,
                    ..Default::default()
                });
            }
        };

        let mut text = String::new();
        let mut structure = StructuralMap::new();
        for (label, entry) in entries {
            if !text.is_empty() {
                text.push_str("\n\n");
            }
            let start = text.len();
            text.push_str(&label);
            text.push_str(": ");
            text.push_str(&render(entry)?);
            structure.push(Section::new(
                SectionKind::Entry,
                Some(label),
                TextSpan::new(start, text.len()),
            ));
        }

        let title = match &value {
            Value::Object(map) => map
                .get("title")
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        };

        Ok(LoadedDocument {
            text,
            structure,
            title,
        })
    }
}

/// Strings are emitted bare, everything else pretty-printed.
fn render(value: &Value) -> RagResult<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        other => Ok(serde_json::to_string_pretty(other)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_keys_become_entries() {
        let loaded = JsonLoader
            .load(br#"{"title": "Runbook", "steps": ["stop", "start"]}"#)
            .unwrap();
        assert_eq!(loaded.title.as_deref(), Some("Runbook"));
        assert!(loaded.text.contains("steps: [\n"));
        assert!(loaded.text.contains("title: Runbook"));
        assert_eq!(loaded.structure.sections.len(), 2);

        let offset = loaded.text.find("stop").unwrap();
        assert_eq!(loaded.structure.section_at(offset).as_deref(), Some("steps"));
    }

    #[test]
    fn test_arrays_are_indexed() {
        let loaded = JsonLoader.load(br#"["alpha", {"k": 1}]"#).unwrap();
        assert!(loaded.text.starts_with("[0]: alpha\n\n[1]: {"));
    }

    #[test]
    fn test_malformed_json_is_corrupt() {
        let err = JsonLoader.load(b"{\"unterminated\": ").unwrap_err();
        assert!(matches!(err, RagError::CorruptInput { .. }));
    }
}
