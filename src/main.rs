use std::path::PathBuf;

use clap::{Parser, Subcommand};
use claimlens::Result;
use claimlens::commands::{assess, ingest, init_config, query, repair, show_config, show_status};

#[derive(Parser)]
#[command(name = "claimlens")]
#[command(about = "Hybrid retrieval and ensemble decision engine for insurance claims")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write or inspect the configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
    /// Ingest a policy or reference document
    Ingest {
        /// Path to a plain-text document
        file: PathBuf,
        /// Document identifier; defaults to the file stem
        #[arg(long)]
        document_id: Option<String>,
        /// Policy type tag for the document, e.g. "auto" or "life"
        #[arg(long)]
        policy_type: Option<String>,
    },
    /// Search indexed documents
    Query {
        /// Query text
        text: String,
        /// Maximum results to return
        #[arg(long, default_value_t = 5)]
        limit: usize,
        /// Restrict results to one document
        #[arg(long)]
        document: Option<String>,
    },
    /// Assess a claim described by a JSON file
    Assess {
        /// Path to the claim request JSON
        file: PathBuf,
    },
    /// Show store statistics and gateway health
    Status,
    /// Validate and repair the dual-store index
    Repair,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Config { show } => {
            if show {
                show_config()?;
            } else {
                init_config()?;
            }
        }
        Commands::Ingest {
            file,
            document_id,
            policy_type,
        } => {
            ingest(&file, document_id, policy_type).await?;
        }
        Commands::Query {
            text,
            limit,
            document,
        } => {
            query(&text, limit, document).await?;
        }
        Commands::Assess { file } => {
            assess(&file).await?;
        }
        Commands::Status => {
            show_status().await?;
        }
        Commands::Repair => {
            repair().await?;
        }
    }

    Ok(())
}
