//! Document and collection management commands.

use crate::pipeline::{AccessScope, Pipeline};
use crate::types::{CollectionId, DocumentId, DocumentRecord};

fn print_record(record: &DocumentRecord) {
    println!("Document:   {}", record.id);
    println!("Collection: {}", record.collection);
    println!("Source:     {}", record.source);
    println!("Status:     {}", record.status);
    if let Some(title) = &record.title {
        println!("Title:      {title}");
    }
    println!("Chunks:     {}", record.chunk_count);
    println!("Text bytes: {}", record.text_len);
    if let Some(error) = &record.error {
        println!("Error:      {} ({:?})", error.message, error.kind);
    }
    println!("Updated:    {}", record.updated_at.to_rfc3339());
}

pub fn run_status(pipeline: &Pipeline, id: &str, json: bool) -> anyhow::Result<()> {
    let record = pipeline.ingest_status(&AccessScope::any(), &DocumentId::new(id))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        print_record(&record);
    }
    Ok(())
}

pub fn run_list(pipeline: &Pipeline, collection: &str, json: bool) -> anyhow::Result<()> {
    let records = pipeline.list_documents(&AccessScope::any(), &CollectionId::new(collection))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    if records.is_empty() {
        println!("No documents in '{collection}'.");
    }
    for record in &records {
        println!(
            "{:<10} {:>6} chunks  {}",
            record.status.to_string(),
            record.chunk_count,
            record.id
        );
    }
    Ok(())
}

pub async fn run_delete_document(
    pipeline: &Pipeline,
    collection: &str,
    id: &str,
) -> anyhow::Result<()> {
    let removed = pipeline
        .delete_document(
            &AccessScope::any(),
            &CollectionId::new(collection),
            &DocumentId::new(id),
        )
        .await?;
    println!("Deleted '{id}' ({removed} chunks) from '{collection}'");
    Ok(())
}

pub async fn run_delete_collection(pipeline: &Pipeline, collection: &str) -> anyhow::Result<()> {
    let removed = pipeline
        .delete_collection(&AccessScope::any(), &CollectionId::new(collection))
        .await?;
    println!(
        "Deleted collection '{collection}' ({} documents)",
        removed.len()
    );
    Ok(())
}
