//! Query command.

use crate::pipeline::{AccessScope, Pipeline};
use crate::retrieve::{QueryRequest, QueryResult};
use crate::store::Filter;
use crate::types::{CollectionId, DocumentId};

#[derive(Debug, Default)]
pub struct QueryOptions {
    pub text: String,
    pub collections: Vec<String>,
    pub k: Option<usize>,
    pub filters: Vec<(String, String)>,
    pub documents: Vec<String>,
    pub json: bool,
}

fn build_request(options: &QueryOptions) -> QueryRequest {
    let collections = options
        .collections
        .iter()
        .map(|c| CollectionId::new(c.as_str()))
        .collect();
    let mut request = QueryRequest::new(collections, options.text.as_str());
    request.k = options.k;

    let mut filter = Filter {
        document_ids: options
            .documents
            .iter()
            .map(|d| DocumentId::new(d.as_str()))
            .collect(),
        ..Filter::default()
    };
    for (key, value) in &options.filters {
        filter = filter.with_equals(key.as_str(), value.as_str());
    }
    if !filter.is_empty() {
        request.filter = Some(filter);
    }
    request
}

fn print_human(result: &QueryResult) {
    if result.matches.is_empty() {
        println!("No matches above the relevance cutoff.");
    }
    for (rank, m) in result.matches.iter().enumerate() {
        let citation = &m.citation;
        let mut origin = citation
            .title
            .clone()
            .unwrap_or_else(|| citation.document_id.to_string());
        if let Some(section) = &citation.section {
            origin.push_str(&format!(" > {section}"));
        }
        if let Some(page) = citation.page {
            origin.push_str(&format!(" (page {page})"));
        }

        println!(
            "{}. [{:.3}] {} #{} in {}",
            rank + 1,
            m.score,
            origin,
            citation.seq,
            m.collection
        );
        let preview: String = m.text.chars().take(200).collect();
        println!("   {}", preview.replace('\n', " "));
    }
    for failure in &result.failed_collections {
        eprintln!(
            "Warning: collection '{}' unavailable: {}",
            failure.collection, failure.error.message
        );
    }
}

pub async fn run(pipeline: &Pipeline, options: QueryOptions) -> anyhow::Result<()> {
    let request = build_request(&options);
    let result = pipeline.query(&AccessScope::any(), &request).await?;
    if options.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_human(&result);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_without_filters() {
        let options = QueryOptions {
            text: "retry".to_string(),
            collections: vec!["kb".to_string()],
            ..Default::default()
        };
        let request = build_request(&options);
        assert!(request.filter.is_none());
        assert_eq!(request.k, None);
    }

    #[test]
    fn test_request_with_filters() {
        let options = QueryOptions {
            text: "retry".to_string(),
            collections: vec!["kb".to_string(), "faq".to_string()],
            k: Some(3),
            filters: vec![("team".to_string(), "search".to_string())],
            documents: vec!["guide".to_string()],
            json: false,
        };
        let request = build_request(&options);
        let filter = request.filter.unwrap();
        assert_eq!(filter.document_ids, vec![DocumentId::new("guide")]);
        assert!(filter.has_metadata());
        assert_eq!(request.collections.len(), 2);
        assert_eq!(request.k, Some(3));
    }
}
