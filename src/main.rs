//! endpoint: a peer-to-peer message endpoint
//!
//! Every instance is both a server and a client:
//! - Accepts connections on its listen port and hands each one to a worker
//! - Opens outbound connections to other endpoints on request
//! - Exchanges length-prefixed messages resilient to partial reads and writes
//! - Driven interactively through `#` commands on standard input
//! - Configuration via CLI arguments or TOML file

mod command;
mod config;
mod dispatcher;
mod net;
mod package;
mod queue;
mod registry;
mod sink;
mod supervisor;
mod worker;

use config::Config;
use dispatcher::Dispatcher;
use sink::{LogSink, PrintFilter, TracingSink};
use std::sync::mpsc;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        max_message = config.max_message,
        tick_ms = config.tick_ms,
        "Starting endpoint"
    );

    // everything enabled until the user narrows it with #p
    let sink: Arc<dyn LogSink> = Arc::new(TracingSink::new(PrintFilter::ALL));

    let (commands_tx, commands_rx) = mpsc::channel();
    let (mut dispatcher, waker) = Dispatcher::new(&config, commands_rx, Arc::clone(&sink))?;

    // stdin reader feeds the dispatcher and wakes its poll; it detaches
    // when the process exits
    let _stdin = command::spawn_stdin_source(commands_tx, waker, Arc::clone(&sink))?;

    dispatcher.run()?;
    Ok(())
}
