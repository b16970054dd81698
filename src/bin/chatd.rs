// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use clap::Parser;

/// Single-process chat/broker server built on io_uring.
#[derive(Parser, Debug)]
struct Cli {
    /// Address to bind the listening socket to.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to bind the listening socket to.
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Listen backlog passed to `listen(2)`.
    #[arg(long, default_value_t = 4096)]
    backlog: i32,

    /// Number of submission/completion queue entries to allocate for the io_uring instance.
    #[arg(long, default_value_t = 256)]
    ring_entries: u32,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    chatd::server::run(&cli.host, cli.port, cli.backlog, cli.ring_entries)?;
    Ok(())
}
