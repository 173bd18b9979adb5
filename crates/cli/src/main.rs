use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
use commands::{execute_node_command, NodeArgs};

#[derive(Parser)]
#[command(name = "acablock")]
#[command(about = "Acablock - Replicated academic records ledger")]
#[command(version = "0.1.0")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a node and open the records menu
    Node(NodeArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Node(args) => execute_node_command(args).await,
    }
}
