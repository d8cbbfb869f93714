//! CLI argument parsing using clap.

use clap::{
    Parser, Subcommand,
    builder::styling::{AnsiColor, Effects, Styles},
};
use std::path::PathBuf;

fn clap_cargo_style() -> Styles {
    Styles::styled()
        .header(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .usage(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// Parse `key=value` pairs for tags and filters.
pub fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("expected key=value, got '{raw}'")),
    }
}

/// Retrieval pipeline for grounding chat responses
#[derive(Parser, Debug)]
#[command(
    name = "groundwork",
    version = env!("CARGO_PKG_VERSION"),
    about = "Ingest documents into vector collections and retrieve cited context",
    next_line_help = true,
    styles = clap_cargo_style(),
    after_help = "Quick Start:\n  $ groundwork init\n  $ groundwork ingest docs/guide.md --collection kb\n  $ groundwork query \"how do I configure retries\" --collection kb\n\nIngestion and queries share state only with a persistent store backend (tantivy, sqlite, qdrant)."
)]
pub struct Cli {
    /// Path to custom settings.toml file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Show detailed loading information
    #[arg(long, global = true)]
    pub info: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize project
    #[command(about = "Set up .groundwork directory with default configuration")]
    Init {
        /// Force overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Show current configuration settings
    #[command(about = "Display active settings")]
    Config,

    /// Ingest documents into a collection
    #[command(
        about = "Load, chunk, embed and store documents",
        after_help = "Examples:\n  groundwork ingest notes.md guide.html --collection kb\n  groundwork ingest https://example.com/faq --url --collection kb\n  groundwork ingest --text \"pasted snippet\" --id snippet-1 --collection kb\n  groundwork ingest report.txt --collection kb --tag team=search"
    )]
    Ingest {
        /// Files relative to the current directory, or URLs with --url
        #[arg(value_name = "SOURCE")]
        sources: Vec<String>,

        /// Target collection
        #[arg(long)]
        collection: String,

        /// Treat sources as URLs to fetch
        #[arg(long)]
        url: bool,

        /// Ingest this text instead of files
        #[arg(long, conflicts_with_all = ["sources", "url"])]
        text: Option<String>,

        /// Document id (single source only; defaults to the source, random for --text)
        #[arg(long)]
        id: Option<String>,

        /// Declared mime type (defaults to a guess from the file extension)
        #[arg(long)]
        mime: Option<String>,

        /// Document title
        #[arg(long)]
        title: Option<String>,

        /// Tag copied onto every chunk, as key=value
        #[arg(long = "tag", value_parser = parse_key_value)]
        tags: Vec<(String, String)>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Query one or more collections
    #[command(
        about = "Retrieve the most relevant chunks with citations",
        after_help = "Examples:\n  groundwork query \"retry policy\" --collection kb\n  groundwork query \"pricing\" --collection kb --collection faq -k 10\n  groundwork query \"owners\" --collection kb --filter team=search --json"
    )]
    Query {
        /// Query text
        text: String,

        /// Collections to search (repeatable)
        #[arg(long = "collection", required = true)]
        collections: Vec<String>,

        /// Number of results (defaults to retrieval.top_k)
        #[arg(short)]
        k: Option<usize>,

        /// Metadata equality filter, as key=value
        #[arg(long = "filter", value_parser = parse_key_value)]
        filters: Vec<(String, String)>,

        /// Restrict to these document ids
        #[arg(long = "document")]
        documents: Vec<String>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Show the ingestion status of a document
    #[command(about = "Show ingestion status of a document")]
    Status {
        /// Document id
        id: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// List documents in a collection
    #[command(about = "List documents registered in a collection")]
    List {
        /// Collection name
        collection: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Delete one document
    #[command(name = "delete-document", about = "Delete a document and its chunks")]
    DeleteDocument {
        /// Document id
        id: String,

        /// Collection holding the document
        #[arg(long)]
        collection: String,
    },

    /// Delete a collection
    #[command(
        name = "delete-collection",
        about = "Delete a collection with all documents and chunks"
    )]
    DeleteCollection {
        /// Collection name
        collection: String,
    },
}
