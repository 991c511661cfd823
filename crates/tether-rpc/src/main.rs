//! Tether RPC - calculator service over Tether's TCP transport.
//!
//! `serve` exposes the calculator Provider until interrupted; `call` connects
//! to a running server, invokes one function and prints its result as JSON.

mod calculator;
mod handler;

use anyhow::Result;
use clap::{Parser, Subcommand};
use handler::{CalculatorHandler, Credentials};
use serde_json::Value;
use std::sync::Arc;
use tether::{Provider, TcpConnector, TcpServer};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "tether-rpc")]
#[command(about = "Calculator service over Tether's TCP transport")]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the calculator until interrupted
    Serve {
        /// Port to listen on (0 = auto-assign)
        #[arg(short, long, default_value = "0")]
        port: u16,

        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Password clients must send in their header
        #[arg(long)]
        password: Option<String>,
    },

    /// Call one function on a running server
    Call {
        /// Server port
        #[arg(short, long)]
        port: u16,

        /// Server host
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Password to send in the header
        #[arg(long)]
        password: Option<String>,

        /// Dotted function path, e.g. `scientific.pow`
        path: String,

        /// Arguments, each parsed as JSON (bare words are sent as strings)
        args: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging; stdout is reserved for the port line and call results.
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    match args.command {
        Command::Serve {
            port,
            host,
            password,
        } => serve(&host, port, password).await,
        Command::Call {
            port,
            host,
            password,
            path,
            args,
        } => call(&host, port, password, &path, &args).await,
    }
}

async fn serve(host: &str, port: u16, password: Option<String>) -> Result<()> {
    info!("Starting Tether RPC calculator");

    let handler = Arc::new(CalculatorHandler::new(password));
    let mut server = TcpServer::open((host, port), handler).await?;

    // Print port for the launching process to read (intentional stdout)
    println!("RPC_PORT={}", server.port());

    info!("Calculator running on {}", server.addr());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");
    server.close();

    Ok(())
}

fn parse_argument(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

async fn call(
    host: &str,
    port: u16,
    password: Option<String>,
    path: &str,
    raw_args: &[String],
) -> Result<()> {
    let connector = TcpConnector::new(Credentials { password }, None::<Provider>);
    connector.connect((host, port)).await?;

    let function = path
        .split('.')
        .fold(connector.driver(), |driver, segment| driver.member(segment));
    let outcome = function
        .call(raw_args.iter().map(|raw| parse_argument(raw)).collect())
        .await;
    connector.close().await?;

    println!("{}", serde_json::to_string(&outcome?)?);
    Ok(())
}
