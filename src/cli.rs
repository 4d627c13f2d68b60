use clap::{Parser, Subcommand};
use std::net::SocketAddr;

#[derive(Parser, Debug)]
#[command(name = "storyrelay")]
#[command(about = "Harvests stories on a schedule and relays them to blob storage", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the pipeline workers, the fetch schedule and the operator API
    Run(RunArgs),
    /// List stored jobs (reads the job store directly; stop the daemon first)
    Jobs(JobsArgs),
    /// Print the effective configuration as TOML (secrets omitted)
    Config,
}

#[derive(clap::Args, Debug)]
pub struct RunArgs {
    /// Address to bind the operator API to (overrides server.bind_addr)
    #[arg(long)]
    pub address: Option<SocketAddr>,
}

#[derive(clap::Args, Debug)]
pub struct JobsArgs {
    /// Only jobs in this state: waiting, active, completed or failed
    #[arg(long)]
    pub status: Option<String>,

    /// Maximum number of jobs to print, newest first
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}
