//! # Hivesync
//!
//! Hivesync follows the Hive blockchain through a fleet of public API nodes. `hivesync` is a binary
//! crate for a command line application streaming blocks to the log.

use anyhow::Result;
use clap::{Parser, Subcommand};

mod stream;
use stream::Stream;

mod status;
use status::Status;

mod common;

#[derive(Debug, Parser)]
#[clap(about, version)]
struct Cli {
    #[clap(subcommand)]
    command: Subcommands,
}

#[derive(Debug, Subcommand)]
enum Subcommands {
    /// Stream blocks, transactions and operations from the fleet until interrupted.
    Stream(Stream),
    /// Discover the capabilities of every node in the fleet once and print them.
    Status(Status),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info,hivesync=debug,hivesync_core=debug");
    }
    env_logger::init();

    match cli.command {
        Subcommands::Stream(cmd) => cmd.run().await,
        Subcommands::Status(cmd) => cmd.run().await,
    }
}
