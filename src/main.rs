//! `routepool`: issue GET/POST requests through the pooled client.

use clap::{Args, Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;

use routepool::config::{load_config, ClientConfig};
use routepool::observability::{logging, metrics};
use routepool::{HttpClient, HttpRequest, Response};

#[derive(Parser)]
#[command(name = "routepool")]
#[command(about = "Send HTTP requests over a per-route connection pool", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a GET request
    Get(RequestArgs),
    /// Send a POST request
    Post {
        #[command(flatten)]
        request: RequestArgs,

        /// Request body
        #[arg(short, long, default_value = "")]
        data: String,
    },
}

#[derive(Args)]
struct RequestArgs {
    /// Target URL (http only)
    url: String,

    /// Extra header, `name:value`; may repeat
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,

    /// Send the request this many times, one after another
    #[arg(short = 'n', long, default_value_t = 1)]
    count: u32,

    /// Give up waiting for each response after this long
    #[arg(long, default_value_t = 30_000)]
    timeout_ms: u64,

    /// Print each response as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ClientConfig::default(),
    };

    logging::init_logging(&config.observability.log_level);
    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let (args, body) = match cli.command {
        Commands::Get(args) => (args, None),
        Commands::Post { request, data } => (request, Some(data)),
    };

    let mut request = HttpRequest::new(&args.url)?;
    for header in &args.headers {
        let (name, value) = header
            .split_once(':')
            .ok_or_else(|| format!("header must be name:value, got '{header}'"))?;
        request = request.header(name.trim(), value.trim())?;
    }
    if let Some(body) = &body {
        request = request.body(body.clone());
    }

    let client = HttpClient::new(&config);
    let timeout = Duration::from_millis(args.timeout_ms);
    let mut failed = false;

    for attempt in 1..=args.count {
        let future = match &body {
            Some(_) => client.post(&request).await?,
            None => client.get(&request).await?,
        };
        let response = future.wait_timeout(timeout).await?;
        tracing::debug!(attempt, connection_id = ?future.connection_id(), "Request finished");

        failed |= !response.is_success();
        if args.json {
            println!("{}", serde_json::to_string_pretty(&response_json(&response))?);
        } else {
            print_response(&response);
        }
    }

    client.close().await;
    if failed {
        std::process::exit(1);
    }
    Ok(())
}

fn print_response(response: &Response) {
    if !response.is_success() {
        let cause = response
            .cause()
            .map(ToString::to_string)
            .unwrap_or_else(|| "unknown".to_string());
        eprintln!("Error: request failed: {cause}");
        return;
    }
    if let (Some(status), Some(version)) = (response.status(), response.version()) {
        println!("{version:?} {status}");
    }
    for (name, value) in response.headers() {
        println!("{}: {}", name, value.to_str().unwrap_or("<binary>"));
    }
    println!();
    println!("{}", response.text());
}

fn response_json(response: &Response) -> serde_json::Value {
    let headers: Vec<_> = response
        .headers()
        .iter()
        .map(|(name, value)| json!([name.as_str(), value.to_str().unwrap_or("<binary>")]))
        .collect();
    json!({
        "success": response.is_success(),
        "status": response.status().map(|status| status.as_u16()),
        "version": response.version().map(|version| format!("{version:?}")),
        "headers": headers,
        "body": response.text(),
        "cause": response.cause().map(ToString::to_string),
    })
}
