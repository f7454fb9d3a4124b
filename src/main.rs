use std::sync::Arc;

use eyre::{eyre, WrapErr};
use xanchor_relayer::config::Config;
use xanchor_relayer::correlator::SequenceCorrelator;
use xanchor_relayer::evm::EvmBridgeClient;
use xanchor_relayer::fetcher::AttestationFetcher;
use xanchor_relayer::guardian::GuardianRestClient;
use xanchor_relayer::terra::TerraBridgeClient;
use xanchor_relayer::{metrics, Cancellation, ChainId, RelayOrchestrator, RelayRequest, TransferLeg};

const USAGE: &str = "usage: xanchor-relayer relay <evm-tx-hash> [--round-trip]";

/// Parsed command line
#[derive(Debug, PartialEq, Eq)]
struct RelayCommand {
    tx_hash: String,
    round_trip: bool,
}

fn parse_args(args: &[String]) -> eyre::Result<RelayCommand> {
    match args {
        [command, rest @ ..] if command == "relay" => {
            let mut tx_hash = None;
            let mut round_trip = false;
            for arg in rest {
                match arg.as_str() {
                    "--round-trip" => round_trip = true,
                    flag if flag.starts_with("--") => return Err(eyre!("unknown flag {}\n{}", flag, USAGE)),
                    value if tx_hash.is_none() => tx_hash = Some(value.to_string()),
                    _ => return Err(eyre!("{}", USAGE)),
                }
            }
            let tx_hash = tx_hash.ok_or_else(|| eyre!("{}", USAGE))?;
            Ok(RelayCommand { tx_hash, round_trip })
        }
        _ => Err(eyre!("{}", USAGE)),
    }
}

fn main() -> eyre::Result<()> {
    // Install color-eyre for better error reporting
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    init_logging();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = parse_args(&args)?;

    let config = Config::load()?;
    tracing::info!(
        evm_chain = %config.evm_chain(),
        terra_chain_id = %config.terra.chain_id,
        round_trip = command.round_trip,
        "Configuration loaded"
    );

    let (cancel_handle, cancellation) = Cancellation::new();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        cancel_handle.cancel();
    });

    let route = config.route()?;
    let evm = Arc::new(
        EvmBridgeClient::new(
            &config.evm.rpc_url,
            config.evm_chain(),
            &config.evm.core_bridge_address,
            &config.evm.xanchor_bridge_address,
            &config.evm.private_key,
        )?
        .with_cancellation(cancellation.clone()),
    );
    let terra = Arc::new(
        TerraBridgeClient::new(
            &config.terra.lcd_url,
            &config.terra.chain_id,
            &config.terra.xanchor_bridge_address,
            &config.terra.mnemonic,
        )?
        .with_cancellation(cancellation.clone()),
    );
    let guardian = Arc::new(GuardianRestClient::new(&config.guardian_rpc_url)?);

    // Map the origin submission to its leg
    let messages = evm
        .sequences_from_receipt(&command.tx_hash)
        .await
        .wrap_err("Failed to read origin transaction")?;
    let leg = TransferLeg::from_published(
        route.origin_chain,
        ChainId::TERRA,
        &messages,
        &route.origin_instruction_emitter,
        &route.origin_token_emitter,
    )?;
    tracing::info!(
        sequence = leg.sequence,
        token_sequence = ?leg.token_sequence(),
        "Origin submission parsed"
    );

    let orchestrator = RelayOrchestrator::new(
        AttestationFetcher::new(guardian).with_poll_interval(config.poll_interval()),
        SequenceCorrelator::new(terra.clone(), config.correlation_policy()),
        terra,
        evm,
        route,
        config.relay_settings(),
    )?;
    let mut request = if command.round_trip {
        RelayRequest::round_trip(leg)
    } else {
        RelayRequest::one_way(leg)
    };

    let result = orchestrator.run(&mut request, &cancellation).await;

    tracing::debug!(metrics = %metrics::gather(), "Final metrics");
    for record in request.legs() {
        tracing::info!(
            origin = %record.leg.origin_chain,
            dest = %record.leg.dest_chain,
            sequence = record.leg.sequence,
            status = ?record.status,
            digest = ?record.digest.map(hex::encode),
            "Leg summary"
        );
    }

    let state = result?;
    tracing::info!(shape = ?request.shape(), state = ?state, "Cross Anchor Relayer finished");
    Ok(())
}

/// Initialize tracing/logging with structured output
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,xanchor_relayer=debug"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_target(true))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true))
            .with(filter)
            .init();
    }
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, cancelling relay");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, cancelling relay");
        }
    }
}
