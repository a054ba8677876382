//! # WireRPC CLI Entry Point
//!
//! ## Usage
//!
//! ```bash
//! # Serve the built-in echo (1) and metrics (2) services
//! wirerpc serve -b 0.0.0.0:7000
//!
//! # One call, weighted across two providers
//! wirerpc call -p 127.0.0.1:7000:80 -p 127.0.0.1:7001:20 -s 1 -d hello
//!
//! # 100k calls from 64 concurrent callers
//! wirerpc bench -p 127.0.0.1:7000 -s 1 -n 100000 -c 64
//! ```

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use argh::FromArgs;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use wirerpc_cli::{builtin_registry, parse_providers, run_bench};
use wirerpc_client::{App, CallOptions, TransportLease};
use wirerpc_common::{ClientConfig, Codec, ServerConfig};
use wirerpc_metrics::CallMetrics;
use wirerpc_server::{DispatchHandler, TcpServer};

#[derive(FromArgs)]
/// wirerpc - multiplexed binary RPC over TCP
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Serve(ServeArgs),
    Call(CallArgs),
    Bench(BenchArgs),
}

#[derive(FromArgs)]
#[argh(subcommand, name = "serve")]
/// run a server with the built-in services
struct ServeArgs {
    /// address to bind to, overrides the config file
    #[argh(option, short = 'b')]
    bind: Option<String>,

    /// JSON server config file
    #[argh(option)]
    config: Option<String>,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "call")]
/// make a single call and print its status and result
struct CallArgs {
    /// provider as ADDR[:WEIGHT], repeatable
    #[argh(option, short = 'p', long = "provider")]
    providers: Vec<String>,

    /// service id
    #[argh(option, short = 's')]
    service: i32,

    /// call parameters, sent as UTF-8 bytes
    #[argh(option, short = 'd', default = "String::new()")]
    data: String,

    /// call timeout in milliseconds
    #[argh(option, long = "timeout-ms")]
    timeout_ms: Option<u64>,

    /// JSON client config file
    #[argh(option)]
    config: Option<String>,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "bench")]
/// fire many calls and print the client metrics as JSON
struct BenchArgs {
    /// provider as ADDR[:WEIGHT], repeatable
    #[argh(option, short = 'p', long = "provider")]
    providers: Vec<String>,

    /// service id
    #[argh(option, short = 's')]
    service: i32,

    /// total number of calls
    #[argh(option, short = 'n', default = "10000")]
    calls: usize,

    /// number of concurrent callers
    #[argh(option, short = 'c', default = "16")]
    concurrency: usize,

    /// call parameters, sent as UTF-8 bytes
    #[argh(option, short = 'd', default = "String::new()")]
    data: String,

    /// JSON client config file
    #[argh(option)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // Keep `call` output clean for piping.
    if !matches!(cli.command, Commands::Call(_)) {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    match cli.command {
        Commands::Serve(args) => run_serve(args).await,
        Commands::Call(args) => run_call(args).await,
        Commands::Bench(args) => {
            let app = connect(args.config.as_deref(), &args.providers).await?;
            let snapshot = run_bench(
                app.clone(),
                args.service,
                Bytes::from(args.data),
                args.calls,
                args.concurrency,
            )
            .await;
            app.close().await;
            println!("{}", snapshot.to_json()?);
            Ok(())
        }
    }
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => ServerConfig::from_file(path)
            .with_context(|| format!("failed to load server config {}", path))?,
        None => ServerConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.bind = bind;
    }

    let metrics = Arc::new(CallMetrics::new());
    let dispatch = DispatchHandler::new(
        builtin_registry(metrics.clone()),
        Codec::from_kind(config.serializer),
    )
    .with_metrics(metrics);
    let server = TcpServer::bind(config, dispatch).await?;

    let token = CancellationToken::new();
    let signal = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received Ctrl-C, shutting down");
        }
        signal.cancel();
    });

    server.serve(token).await?;
    Ok(())
}

async fn run_call(args: CallArgs) -> Result<()> {
    let app = connect(args.config.as_deref(), &args.providers).await?;

    let mut options = CallOptions::new();
    if let Some(ms) = args.timeout_ms {
        options = options.with_timeout(std::time::Duration::from_millis(ms));
    }
    let outcome = app.call(args.service, Bytes::from(args.data), options).await;
    app.close().await;

    let response = outcome.context("call failed")?;
    println!("{}", response.status);
    println!("{}", String::from_utf8_lossy(&response.result));
    Ok(())
}

async fn connect(config: Option<&str>, providers: &[String]) -> Result<Arc<App>> {
    if providers.is_empty() {
        bail!("at least one provider is required (-p ADDR[:WEIGHT])");
    }
    let config = match config {
        Some(path) => ClientConfig::from_file(path)
            .with_context(|| format!("failed to load client config {}", path))?,
        None => ClientConfig::default(),
    };
    let providers = parse_providers(providers)?;
    Ok(App::connect(config, TransportLease::standalone(), providers).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_serve() {
        let cli: Cli = Cli::from_args(&["wirerpc"], &["serve", "-b", "127.0.0.1:7100"]).unwrap();
        match cli.command {
            Commands::Serve(ServeArgs { bind, config }) => {
                assert_eq!(bind.as_deref(), Some("127.0.0.1:7100"));
                assert!(config.is_none());
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_cli_parse_call() {
        let cli: Cli = Cli::from_args(
            &["wirerpc"],
            &[
                "call", "-p", "127.0.0.1:7000:80", "-p", "127.0.0.1:7001", "-s", "1", "-d", "hi",
                "--timeout-ms", "250",
            ],
        )
        .unwrap();
        match cli.command {
            Commands::Call(args) => {
                assert_eq!(args.providers.len(), 2);
                assert_eq!(args.service, 1);
                assert_eq!(args.data, "hi");
                assert_eq!(args.timeout_ms, Some(250));
            }
            _ => panic!("Expected Call command"),
        }
    }

    #[test]
    fn test_cli_parse_bench_defaults() {
        let cli: Cli = Cli::from_args(&["wirerpc"], &["bench", "-p", "127.0.0.1:7000", "-s", "2"]).unwrap();
        match cli.command {
            Commands::Bench(args) => {
                assert_eq!(args.calls, 10000);
                assert_eq!(args.concurrency, 16);
                assert!(args.data.is_empty());
            }
            _ => panic!("Expected Bench command"),
        }
    }

    #[test]
    fn test_cli_requires_service() {
        assert!(Cli::from_args(&["wirerpc"], &["call", "-p", "127.0.0.1:7000"]).is_err());
    }

    #[tokio::test]
    async fn test_connect_requires_providers() {
        assert!(connect(None, &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_serve_rejects_bad_config_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), r#"{"weight": 1000}"#).unwrap();
        let args = ServeArgs {
            bind: Some("127.0.0.1:0".into()),
            config: Some(file.path().display().to_string()),
        };
        assert!(run_serve(args).await.is_err());
    }
}
