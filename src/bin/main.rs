use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use azofly_bridge::config::{self, BridgeConfig, BridgeSettings, KafkaSettings, merge_settings};
use azofly_bridge::{Bridge, EchoHandler, MemoryTransport, RequestOptions, Responder, Transport};
use clap::{Parser, Subcommand};
use serde_json::Value;

/// Request/response client for pub/sub rendering backends
#[derive(Parser)]
#[command(name = "azofly-bridge")]
#[command(version)]
#[command(about = "Send correlated requests over a publish/subscribe transport")]
struct Cli {
    /// Config file layered over the user config (~/.config/azofly/azofly.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Comma-separated Kafka brokers, overriding the config files
    #[arg(long, global = true, value_delimiter = ',')]
    brokers: Option<Vec<String>>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one request and print the response payload
    Request {
        /// Path to request (e.g., /about)
        path: String,

        /// Request method
        #[arg(long, default_value = "GET")]
        method: String,

        /// Header as NAME:VALUE, may be repeated
        #[arg(long = "header", value_parser = parse_header)]
        headers: Vec<(String, String)>,

        /// JSON request body
        #[arg(long, value_parser = parse_json)]
        body: Option<Value>,

        /// Response timeout in milliseconds (default: from config)
        #[arg(long)]
        timeout: Option<u64>,

        /// Print only the decoded `state` of the response
        #[arg(long)]
        state: bool,

        /// Serve the request in-process with the echo handler instead of a broker
        #[arg(long)]
        loopback: bool,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print a config file with every default filled in
    Init,
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected NAME:VALUE, got {raw:?}"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("empty header name in {raw:?}"));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

fn parse_json(raw: &str) -> Result<Value, String> {
    serde_json::from_str(raw).map_err(|e| format!("invalid JSON body: {e}"))
}

fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("Error: {}", message);
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Config {
            command: ConfigCommands::Init,
        } => match config::render_settings(&config::defaults::default_settings()) {
            Ok(text) => print!("{}", text),
            Err(e) => fail(e),
        },
        Commands::Request {
            path,
            method,
            headers,
            body,
            timeout,
            state,
            loopback,
        } => {
            let settings = config::load_layered(cli.config.as_deref()).unwrap_or_else(|e| fail(e));
            let cli_settings = cli.brokers.map(|brokers| BridgeSettings {
                kafka: Some(KafkaSettings {
                    brokers: Some(brokers),
                    ..KafkaSettings::default()
                }),
                ..BridgeSettings::default()
            });
            let settings = merge_settings(Some(settings), cli_settings).unwrap_or_default();
            let bridge_config = BridgeConfig::from_settings(settings);

            let mut options = RequestOptions::new().method(method);
            for (name, value) in headers {
                options = options.header(name, value);
            }
            if let Some(body) = body {
                options = options.body(body);
            }
            if let Some(ms) = timeout {
                options = options.timeout(Duration::from_millis(ms));
            }

            let output = if loopback {
                let transport = Arc::new(MemoryTransport::new(bridge_config.channel_capacity));
                let responder =
                    Responder::new(Arc::clone(&transport), EchoHandler, &bridge_config);
                let _serving = responder.start().unwrap_or_else(|e| fail(e));
                run_request(
                    Bridge::with_shared_transport(transport, bridge_config),
                    &path,
                    options,
                    state,
                )
                .await
            } else {
                run_over_broker(bridge_config, &path, options, state).await
            };

            match serde_json::to_string_pretty(&output) {
                Ok(text) => println!("{}", text),
                Err(e) => fail(e),
            }
        }
    }
}

#[cfg(feature = "kafka")]
async fn run_over_broker(
    bridge_config: BridgeConfig,
    path: &str,
    options: RequestOptions,
    state: bool,
) -> Value {
    let transport =
        azofly_bridge::KafkaTransport::new(&bridge_config).unwrap_or_else(|e| fail(e));
    run_request(Bridge::new(transport, bridge_config), path, options, state).await
}

#[cfg(not(feature = "kafka"))]
async fn run_over_broker(
    _bridge_config: BridgeConfig,
    _path: &str,
    _options: RequestOptions,
    _state: bool,
) -> Value {
    fail("built without the `kafka` feature; use --loopback or rebuild with --features kafka")
}

async fn run_request<T: Transport>(
    bridge: Bridge<T>,
    path: &str,
    options: RequestOptions,
    state: bool,
) -> Value {
    if let Err(e) = bridge.start(|err| log::error!("Response subscription lost: {}", err)) {
        fail(e);
    }

    let result = if state {
        bridge
            .fetch_data(path, options)
            .await
            .map(|state| state.unwrap_or(Value::Null))
    } else {
        bridge.request(path, options).await
    };

    bridge.shutdown();
    result.unwrap_or_else(|e| fail(e))
}
