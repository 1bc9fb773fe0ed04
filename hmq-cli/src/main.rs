//! hmq-cli - Command-line producer for hmq

mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use hmq_broker::Producer;
use hmq_client::ClientConfig;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hmq-cli")]
#[command(about = "Command-line producer for the hmq broker")]
#[command(version)]
struct Cli {
    /// Broker address
    #[arg(short, long, default_value = "127.0.0.1:8888", env = "HMQ_BROKER_ADDR")]
    broker: String,

    /// Send timeout in milliseconds
    #[arg(long, default_value_t = 3000)]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum SendMode {
    /// Wait for the broker to store each message
    Sync,
    /// Send without waiting; results are reported as they arrive
    Async,
    /// Send without expecting a response
    Oneway,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Send messages to a topic
    Send {
        /// Topic name
        #[arg(short, long)]
        topic: String,

        /// Message body (or @file to read from file)
        body: String,

        /// Message keys
        #[arg(short, long)]
        keys: Option<String>,

        /// Message tags
        #[arg(long)]
        tags: Option<String>,

        /// Extra property as name=value (repeatable)
        #[arg(short, long = "property")]
        properties: Vec<String>,

        /// Number of copies to send
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u32,

        #[arg(short, long, value_enum, default_value_t = SendMode::Sync)]
        mode: SendMode,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let producer = Producer::with_client_config(&cli.broker, ClientConfig::from_env())
        .with_send_msg_timeout(Duration::from_millis(cli.timeout_ms));
    producer.start();

    let result = commands::execute(&producer, cli.command).await;
    producer.shutdown();

    match result {
        Ok(output) => {
            println!("{}", output);
            Ok(())
        }
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(1);
        }
    }
}
