//! Ingest command.

use anyhow::{Context, bail};
use std::path::{Path, PathBuf};

use crate::loader::mime_for_path;
use crate::pipeline::{AccessScope, Pipeline};
use crate::types::{
    CollectionId, DocumentId, DocumentRecord, DocumentRequest, DocumentStatus, SourceRef,
};

#[derive(Debug, Default)]
pub struct IngestOptions {
    pub sources: Vec<String>,
    pub collection: String,
    pub url: bool,
    pub text: Option<String>,
    pub id: Option<String>,
    pub mime: Option<String>,
    pub title: Option<String>,
    pub tags: Vec<(String, String)>,
    pub json: bool,
}

/// Storage keys are paths relative to the working directory.
fn storage_key(source: &str, cwd: &Path) -> anyhow::Result<String> {
    let path = PathBuf::from(source);
    let relative = if path.is_absolute() {
        path.strip_prefix(cwd)
            .with_context(|| format!("{source} is outside the current directory"))?
            .to_path_buf()
    } else {
        path
    };
    Ok(relative.to_string_lossy().into_owned())
}

fn build_requests(options: &IngestOptions) -> anyhow::Result<Vec<DocumentRequest>> {
    if let Some(text) = &options.text {
        let id = options
            .id
            .as_deref()
            .map_or_else(DocumentId::generate, DocumentId::new);
        let mime = options.mime.clone().unwrap_or_else(|| "text/plain".to_string());
        return Ok(vec![DocumentRequest::new(
            id,
            SourceRef::Inline(text.clone()),
            mime,
        )]);
    }

    if options.sources.is_empty() {
        bail!("nothing to ingest: pass files, URLs with --url, or --text");
    }
    if options.id.is_some() && options.sources.len() > 1 {
        bail!("--id applies to a single source");
    }

    let cwd = std::env::current_dir()?;
    options
        .sources
        .iter()
        .map(|source| {
            let (reference, guessed) = if options.url {
                // Empty mime defers to the server's Content-Type
                (SourceRef::Url(source.clone()), Some(""))
            } else {
                let key = storage_key(source, &cwd)?;
                let guessed = mime_for_path(Path::new(&key));
                (SourceRef::Key(key), guessed)
            };
            let Some(mime) = options.mime.as_deref().or(guessed) else {
                bail!("cannot guess the type of {source}; pass --mime");
            };
            let id = options.id.clone().unwrap_or_else(|| source.clone());
            Ok(DocumentRequest::new(id.as_str(), reference, mime))
        })
        .collect()
}

pub async fn run(pipeline: &Pipeline, options: IngestOptions) -> anyhow::Result<()> {
    let mut requests = build_requests(&options)?;
    for request in &mut requests {
        request.title = options.title.clone();
        for (key, value) in &options.tags {
            request.tags.insert(key.clone(), value.as_str().into());
        }
    }

    let collection = CollectionId::new(options.collection.as_str());
    let results = pipeline
        .ingest_batch(&AccessScope::any(), &collection, requests)
        .await?;

    let mut records: Vec<DocumentRecord> = Vec::new();
    let mut failures = 0;
    for result in results {
        match result {
            Ok(record) => {
                if record.status != DocumentStatus::Ready {
                    failures += 1;
                }
                records.push(record);
            }
            Err(e) => {
                failures += 1;
                eprintln!("Error: {e}");
            }
        }
    }

    if options.json {
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else {
        for record in &records {
            match &record.error {
                None => println!(
                    "{}  {}  {} chunks",
                    record.status, record.id, record.chunk_count
                ),
                Some(error) => println!("{}  {}  {}", record.status, record.id, error.message),
            }
        }
    }

    if failures > 0 {
        bail!("{failures} document(s) failed to ingest");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inline_text_request() {
        let options = IngestOptions {
            text: Some("pasted".to_string()),
            id: Some("snippet".to_string()),
            collection: "kb".to_string(),
            ..Default::default()
        };
        let requests = build_requests(&options).unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].id.as_str(), "snippet");
        assert_eq!(requests[0].mime, "text/plain");
    }

    #[test]
    fn test_file_mime_is_guessed() {
        let options = IngestOptions {
            sources: vec!["docs/guide.md".to_string(), "page.html".to_string()],
            collection: "kb".to_string(),
            ..Default::default()
        };
        let requests = build_requests(&options).unwrap();
        assert_eq!(requests[0].mime, "text/markdown");
        assert_eq!(requests[0].source, SourceRef::Key("docs/guide.md".to_string()));
        assert_eq!(requests[1].mime, "text/html");
    }

    #[test]
    fn test_unknown_extension_needs_mime() {
        let options = IngestOptions {
            sources: vec!["drawing.dwg".to_string()],
            collection: "kb".to_string(),
            ..Default::default()
        };
        assert!(build_requests(&options).is_err());
    }

    #[test]
    fn test_id_with_many_sources_is_rejected() {
        let options = IngestOptions {
            sources: vec!["a.md".to_string(), "b.md".to_string()],
            id: Some("x".to_string()),
            collection: "kb".to_string(),
            ..Default::default()
        };
        assert!(build_requests(&options).is_err());
    }

    #[test]
    fn test_urls_defer_mime_to_server() {
        let options = IngestOptions {
            sources: vec!["https://example.com/faq".to_string()],
            url: true,
            collection: "kb".to_string(),
            ..Default::default()
        };
        let requests = build_requests(&options).unwrap();
        assert_eq!(requests[0].mime, "");
        assert!(matches!(requests[0].source, SourceRef::Url(_)));
    }
}
