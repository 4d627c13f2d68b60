mod cli;
mod server;

use clap::Parser;
use cli::{Cli, Commands};
use storyrelay::config::Config;
use storyrelay::observability;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    observability::init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => server::run(args.address).await?,
        Commands::Jobs(args) => server::list_jobs(args.status.as_deref(), args.limit)?,
        Commands::Config => println!("{}", Config::load()?.to_toml()?),
    }

    Ok(())
}
