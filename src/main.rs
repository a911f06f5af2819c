use std::path::PathBuf;

use clap::{Parser, Subcommand};
use semsearch::{Result, SemError};
use semsearch::commands::{
    crawl_site, delete_document, delete_documents_matching, list_documents, search, show_config,
    show_status,
};
use semsearch::config::{Config, get_config_dir};

#[derive(Parser)]
#[command(name = "semsearch")]
#[command(about = "Crawl a site into a vector index and search it by meaning")]
#[command(version)]
struct Cli {
    /// Directory holding config.toml (defaults to ~/.semsearch)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl from a URL (or the configured base URL) and index every page
    Crawl {
        /// Seed URL; defaults to crawler.base_url
        url: Option<String>,
    },
    /// Search indexed pages by meaning
    Search {
        /// Query text; multiple words are joined with spaces
        #[arg(required = true, num_args = 1..)]
        query: Vec<String>,
        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },
    /// List the ids of all indexed documents
    List,
    /// Delete a document by id, or every document whose id contains a substring
    Delete {
        /// Document id (its URL)
        #[arg(required_unless_present = "matching", conflicts_with = "matching")]
        id: Option<String>,
        /// Delete every document whose id contains this substring
        #[arg(long)]
        matching: Option<String>,
    },
    /// Show embedding backend and store health
    Status,
    /// Show the current configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config_dir = match cli.config_dir {
        Some(dir) => dir,
        None => get_config_dir().map_err(|e| SemError::Config(e.to_string()))?,
    };
    let config = Config::load(&config_dir)?;

    match cli.command {
        Commands::Crawl { url } => {
            crawl_site(&config, url.as_deref()).await?;
        }
        Commands::Search { query, json } => {
            search(&config, &query.join(" "), json).await?;
        }
        Commands::List => {
            list_documents(&config).await?;
        }
        Commands::Delete { id, matching } => {
            if let Some(pattern) = matching {
                delete_documents_matching(&config, &pattern).await?;
            } else if let Some(id) = id {
                delete_document(&config, &id).await?;
            }
        }
        Commands::Status => {
            show_status(&config).await?;
        }
        Commands::Config => {
            show_config(&config);
        }
    }

    Ok(())
}
