//! Bridge orchestrator command line.
//!
//! # Architecture Overview
//!
//! ```text
//!   TransferRequest
//!        │
//!        ▼
//!  ┌──────────────┐  ensure_allowance    ┌───────────────┐
//!  │              │  submit_transfer     │ source ledger │
//!  │              │─────────────────────▶│  (EVM / mem)  │
//!  │              │                      └───────────────┘
//!  │              │  confirm, sign, poll ┌───────────────┐
//!  │ Orchestrator │─────────────────────▶│   authority   │
//!  │              │                      │(axelard / mem)│
//!  │              │  submit_execution    └───────────────┘
//!  │              │─────────────────────▶┌───────────────┐
//!  │              │  balance check       │  dest ledger  │
//!  └──────┬───────┘                      └───────────────┘
//!         ▼
//!   TransferOutcome
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use bridge_orchestrator::authority::{AxelardClient, InMemoryAuthority, IN_MEMORY_SIGNER};
use bridge_orchestrator::config::{load_config, OrchestratorConfig};
use bridge_orchestrator::ledger::{EvmLedger, InMemoryLedger, LedgerClient};
use bridge_orchestrator::lifecycle::{signals, Shutdown};
use bridge_orchestrator::observability::{logging, metrics};
use bridge_orchestrator::orchestrator::{
    Orchestrator, OrchestratorBuilder, Phase, TransferRegistry, TransferRequest,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser)]
#[command(name = "bridge-orchestrator")]
#[command(about = "Drive cross-chain token transfers through a bridge authority", long_about = None)]
struct Cli {
    /// TOML configuration file; defaults apply when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Move tokens between two configured chains
    Transfer {
        #[arg(long)]
        from_chain: String,
        #[arg(long)]
        to_chain: String,
        #[arg(long, default_value = "USDC")]
        symbol: String,
        /// Amount in the smallest unit
        #[arg(long)]
        amount: u128,
        #[arg(long)]
        sender: String,
        #[arg(long)]
        recipient: String,
    },
    /// Resume a failed transfer from its last reached phase
    Resume { id: Uuid },
    /// Register every configured gateway with the authority
    Register,
    /// Run transfers against in-memory ledgers and authority
    Simulate {
        #[arg(long, default_value_t = 10)]
        transfers: usize,
        #[arg(long, default_value_t = 1_000_000_000)]
        amount: u128,
        #[arg(long, default_value = "USDC")]
        symbol: String,
    },
    /// Print saved transfer states
    Status { id: Option<Uuid> },
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => OrchestratorConfig::default(),
    };

    logging::init_tracing(&config.observability);
    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    match cli.command {
        Commands::Transfer {
            from_chain,
            to_chain,
            symbol,
            amount,
            sender,
            recipient,
        } => {
            let orchestrator = connect(&config).await?;
            let request = TransferRequest {
                source_chain: from_chain,
                dest_chain: to_chain,
                symbol,
                amount,
                sender,
                recipient,
            };
            let outcome = orchestrator.initiate_transfer(request).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if !outcome.is_success() {
                std::process::exit(1);
            }
        }
        Commands::Resume { id } => {
            let orchestrator = connect(&config).await?;
            let outcome = orchestrator.resume(id).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if !outcome.is_success() {
                std::process::exit(1);
            }
        }
        Commands::Register => {
            let orchestrator = connect(&config).await?;
            let chains = orchestrator.register_gateways().await?;
            println!("Registered gateways for: {}", chains.join(", "));
        }
        Commands::Simulate {
            transfers,
            amount,
            symbol,
        } => simulate(&config, transfers, amount, &symbol).await?,
        Commands::Status { id } => {
            let Some(path) = &config.transfers.state_file else {
                return Err("transfers.state_file is not configured".into());
            };
            let registry = TransferRegistry::load_from_file(path)?;
            match id {
                Some(id) => match registry.get(id) {
                    Some(state) => println!("{}", serde_json::to_string_pretty(&state)?),
                    None => return Err(format!("transfer {} not found", id).into()),
                },
                None => {
                    for state in registry.list() {
                        println!(
                            "{}  {:<16}  {} → {}  {} {}",
                            state.id,
                            state.phase,
                            state.request.source_chain,
                            state.request.dest_chain,
                            state.request.amount,
                            state.request.symbol
                        );
                    }
                }
            }
        }
    }

    Ok(())
}

/// Wire the orchestrator to the configured chains and `axelard`.
async fn connect(config: &OrchestratorConfig) -> Result<Arc<Orchestrator>, BoxError> {
    if config.chains.len() < 2 {
        return Err("at least two chains must be configured".into());
    }

    let authority = Arc::new(AxelardClient::new(config.authority.clone()));
    let mut builder = OrchestratorBuilder::from_config(config, authority);
    for chain in &config.chains {
        let ledger = EvmLedger::connect(chain.clone()).await?;
        builder = builder.ledger(Arc::new(ledger), chain.max_concurrent_submissions);
    }
    if let Some(path) = &config.transfers.state_file {
        builder = builder.registry(TransferRegistry::load_from_file(path)?);
    }

    let orchestrator = Arc::new(builder.build());
    install_shutdown(&orchestrator);
    Ok(orchestrator)
}

fn install_shutdown(orchestrator: &Arc<Orchestrator>) {
    let shutdown = Shutdown::new();
    orchestrator.abort_on_shutdown(shutdown.subscribe());
    signals::spawn_signal_handler(shutdown);
}

/// Drive `count` transfers between two in-memory chains.
async fn simulate(
    config: &OrchestratorConfig,
    count: usize,
    amount: u128,
    symbol: &str,
) -> Result<(), BoxError> {
    let names: Vec<String> = if config.chains.len() >= 2 {
        config.chains.iter().take(2).map(|c| c.name.clone()).collect()
    } else {
        vec!["Ethereum".to_string(), "Polygon".to_string()]
    };

    let ledgers: Vec<Arc<InMemoryLedger>> = names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            Arc::new(
                InMemoryLedger::new(name.clone())
                    .with_gateway(format!("{:#042x}", 0xa000 + i))
                    .with_token(symbol)
                    .with_trusted_signer(IN_MEMORY_SIGNER),
            )
        })
        .collect();
    let authority = ledgers.iter().fold(
        InMemoryAuthority::new(config.authority.registration_policy),
        |authority, ledger| authority.attach(ledger.clone()),
    );

    let mut builder = OrchestratorBuilder::from_config(config, Arc::new(authority));
    for ledger in &ledgers {
        let limit = config
            .chain(ledger.chain())
            .map_or(4, |c| c.max_concurrent_submissions);
        builder = builder.ledger(ledger.clone(), limit);
    }
    let orchestrator = Arc::new(builder.build());
    install_shutdown(&orchestrator);
    orchestrator.register_gateways().await?;

    let requests: Vec<TransferRequest> = (0..count)
        .map(|i| {
            let sender = format!("{:#042x}", 0x1000 + i);
            ledgers[0].mint(&sender, symbol, amount);
            TransferRequest {
                source_chain: names[0].clone(),
                dest_chain: names[1].clone(),
                symbol: symbol.to_string(),
                amount,
                sender,
                recipient: format!("{:#042x}", 0x2000 + i),
            }
        })
        .collect();

    let outcomes = orchestrator.run_all(requests).await;
    let reconciled = outcomes
        .iter()
        .filter(|o| matches!(o, Ok(outcome) if outcome.phase == Phase::Reconciled))
        .count();
    for outcome in outcomes.iter() {
        match outcome {
            Ok(o) if !o.is_success() => println!(
                "{} failed after {}: {}",
                o.id,
                o.last_phase,
                o.error.as_ref().map_or("unknown", |e| e.message.as_str())
            ),
            Err(e) => println!("rejected: {}", e),
            _ => {}
        }
    }
    println!("{}/{} transfers reconciled", reconciled, count);
    Ok(())
}
