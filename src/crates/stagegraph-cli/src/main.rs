//! # stagegraph
//!
//! Runs order workflows with checkpointing from the command line.

use anyhow::Context;
use clap::{Parser, Subcommand};
use stagegraph_cli::{logging, render_status, render_summary, App, ConfigLoader};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "stagegraph")]
#[command(about = "Run checkpointed order workflows", long_about = None)]
#[command(version)]
struct Cli {
    /// Extra config file layered over the user and project files
    #[arg(short, long, global = true, env = "STAGEGRAPH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an order from a JSON file
    Run {
        /// Path to the order JSON
        #[arg(short, long)]
        order: PathBuf,

        /// Workflow id (defaults to the order id)
        #[arg(long)]
        id: Option<String>,
    },

    /// Resume a checkpointed workflow
    Resume {
        id: String,
    },

    /// Show the checkpoint of a workflow
    Status {
        id: String,

        /// Print the full snapshot as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete the checkpoint of a workflow
    Clear {
        id: String,
    },

    /// Print stages, routes and loop ceilings
    Graph,

    /// Run every order JSON in a directory
    Batch {
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::new()
        .with_explicit(cli.config)
        .load()
        .await
        .context("Failed to load configuration")?;
    logging::init(&config.logging)?;

    let app = App::offline(config).await?;

    match cli.command {
        Commands::Run { order, id } => {
            let snapshot = app
                .run(&order, id)
                .await
                .with_context(|| format!("Failed to run {}", order.display()))?;
            print!("{}", render_summary(&snapshot));
        }
        Commands::Resume { id } => {
            let snapshot = app.resume(&id).await?;
            print!("{}", render_summary(&snapshot));
        }
        Commands::Status { id, json } => {
            let snapshot = app.status(&id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                print!("{}", render_status(&snapshot));
            }
        }
        Commands::Clear { id } => {
            app.clear(&id).await?;
            println!("Cleared checkpoint for '{}'", id);
        }
        Commands::Graph => {
            print!("{}", app.graph());
        }
        Commands::Batch { dir } => {
            let results = app.batch(&dir).await?;
            let mut failures = 0;
            for (id, outcome) in &results {
                match outcome {
                    Ok(snapshot) => println!("{}: {:?} ({})", id, snapshot.phase, snapshot.status),
                    Err(e) => {
                        failures += 1;
                        println!("{}: error: {}", id, e);
                    }
                }
            }
            println!("{} orders, {} errors", results.len(), failures);
        }
    }

    Ok(())
}
