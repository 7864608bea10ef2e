use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print version information
    Version,
    /// Start the gateway
    Start,
}

pub fn parse() -> Cli {
    Cli::parse()
}
