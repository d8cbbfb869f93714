use clap::Parser;
use std::sync::Arc;

use groundwork::Settings;
use groundwork::cli::commands::{documents, ingest, init, query};
use groundwork::cli::{Cli, Commands};
use groundwork::pipeline::Pipeline;

fn load_settings(cli: &Cli) -> anyhow::Result<Settings> {
    let settings = match &cli.config {
        Some(path) => Settings::load_from(path),
        None => Settings::load(),
    };
    settings.map_err(|e| anyhow::anyhow!("Configuration error: {e}"))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    // Init must work before any configuration exists
    if let Commands::Init { force } = cli.command {
        return init::run_init(force);
    }

    let settings = load_settings(&cli)?;
    groundwork::logging::init_with_config(&settings.logging);
    if cli.info {
        eprintln!(
            "Loaded settings: store={:?}, embedding={:?} ({} dims), data_dir={}",
            settings.store.backend,
            settings.embedding.backend,
            settings.embedding.dimension,
            settings.data_dir.display()
        );
    }

    if let Commands::Config = cli.command {
        return init::run_config(&settings);
    }

    let pipeline = Pipeline::from_settings(Arc::new(settings)).await?;

    match cli.command {
        Commands::Init { .. } | Commands::Config => Ok(()),
        Commands::Ingest {
            sources,
            collection,
            url,
            text,
            id,
            mime,
            title,
            tags,
            json,
        } => {
            let options = ingest::IngestOptions {
                sources,
                collection,
                url,
                text,
                id,
                mime,
                title,
                tags,
                json,
            };
            ingest::run(&pipeline, options).await
        }
        Commands::Query {
            text,
            collections,
            k,
            filters,
            documents,
            json,
        } => {
            let options = query::QueryOptions {
                text,
                collections,
                k,
                filters,
                documents,
                json,
            };
            query::run(&pipeline, options).await
        }
        Commands::Status { id, json } => documents::run_status(&pipeline, &id, json),
        Commands::List { collection, json } => documents::run_list(&pipeline, &collection, json),
        Commands::DeleteDocument { id, collection } => {
            documents::run_delete_document(&pipeline, &collection, &id).await
        }
        Commands::DeleteCollection { collection } => {
            documents::run_delete_collection(&pipeline, &collection).await
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
