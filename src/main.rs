use anyhow::Context;
use clap::Parser;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use wallet_batch::adapters::{PaperChain, PaperChainConfig, PaperSeed};
use wallet_batch::cli::{Cli, Commands};
use wallet_batch::config::{AppConfig, LoggingConfig};
use wallet_batch::domain::{SweepRequest, TradeBatchRequest, TransferBatchRequest};
use wallet_batch::service::BatchService;
use wallet_batch::signing::InMemoryNonceLedger;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load_from(&cli.config_dir)
        .with_context(|| format!("failed to load configuration from {}", cli.config_dir.display()))?;
    init_logging(&config.logging);

    if let Err(problems) = config.validate() {
        for problem in &problems {
            error!("config: {}", problem);
        }
        anyhow::bail!("invalid configuration ({} problems)", problems.len());
    }

    if let Commands::CheckConfig = cli.command {
        println!("{:#?}", config);
        return Ok(());
    }

    let seed: PaperSeed = match &cli.seed {
        Some(path) => read_json(path)?,
        None => {
            warn!("no --seed given, every paper balance starts at zero");
            PaperSeed::default()
        }
    };
    let chain = Arc::new(PaperChain::from_seed(
        PaperChainConfig {
            latency: Duration::from_millis(cli.latency_ms),
            ..PaperChainConfig::default()
        },
        &seed,
    ));

    let service = BatchService::paper(config, chain, Arc::new(InMemoryNonceLedger::new()));
    service.start();

    let outcome = tokio::select! {
        outcome = run_command(&service, &cli.command) => outcome,
        _ = shutdown_signal() => {
            warn!("interrupted, shutting down");
            Ok(())
        }
    };

    service.shutdown().await;
    outcome
}

async fn run_command(service: &BatchService, command: &Commands) -> anyhow::Result<()> {
    match command {
        Commands::Trade { request, wait_secs } => {
            let request: TradeBatchRequest = read_json(request)?;
            let request_id = service.trades().submit_batch_trade(request)?;
            info!(request_id = %request_id, "trade batch submitted");

            let result = service
                .trades()
                .wait_for_result(&request_id, Duration::from_secs(*wait_secs))
                .await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Transfer { request } => {
            let request: TransferBatchRequest = read_json(request)?;
            let result = service.transfers().submit_batch_transfer(request).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Sweep { request } => {
            let request: SweepRequest = read_json(request)?;
            let result = service.transfers().sweep_funds(request).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::CheckConfig => {}
    }
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,wallet_batch={}", config.level)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if config.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
