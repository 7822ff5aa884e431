pub mod config;
pub mod context;
pub mod mempool;
pub mod miner;
pub mod staker;
pub mod wallet;

use std::sync::Arc;
use std::time::Duration;

use stakd_chainstate::{build_genesis, ChainState, FlushMode};
use stakd_consensus::{chain_params, ChainParams};
use stakd_log as logging;
use stakd_log::{log_error, log_info, log_warn};
use stakd_storage::memory::MemoryStore;
use stakd_storage::KeyValueStore;
use tokio::sync::watch;

pub use config::{parse_args_from, CliAction, Config};
pub use context::{ChainInfo, NodeContext, NodeError};
pub use mempool::{Mempool, MempoolError, MempoolErrorKind};
pub use miner::{BlockAssembler, BlockTemplate, MinerError};
pub use staker::{run_staker, Clock, StakeOutcome, Staker, StakerState, SystemClock};
pub use wallet::{Wallet, WalletCoin, WalletError};

pub async fn run_entry() -> Result<(), String> {
    match config::parse_args()? {
        CliAction::PrintHelp => {
            println!("{}", config::usage());
            Ok(())
        }
        CliAction::PrintVersion => {
            println!("stakd {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        CliAction::Run(config) => run_with_config(config).await,
    }
}

/// Opens the chain over `store`, creating a genesis block paid to the
/// wallet's default script when the store is empty.
pub fn open_node<S: KeyValueStore>(
    params: ChainParams,
    store: Arc<S>,
    wallet: Wallet,
    mempool_bytes: usize,
) -> Result<NodeContext<S>, NodeError> {
    let genesis = build_genesis(&params, &wallet.default_script()?);
    let chain = ChainState::open(store, params.consensus.clone(), &genesis)?;
    Ok(NodeContext::new(
        params,
        chain,
        Mempool::new(mempool_bytes),
        wallet,
    ))
}

async fn run_with_config(config: Config) -> Result<(), String> {
    logging::init(logging::LogConfig {
        level: config.log_level,
        format: config.log_format,
        timestamps: config.log_timestamps,
    });
    if config.conf_path.exists() {
        log_info!("using config file {}", config.conf_path.display());
    }

    let params = chain_params(config.network);
    let mut wallet = Wallet::new(config.network);
    wallet.generate_key().map_err(|err| err.to_string())?;
    wallet.set_reserve_balance(config.reserve_balance);
    let ctx = Arc::new(
        open_node(
            params,
            Arc::new(MemoryStore::new()),
            wallet,
            mempool::DEFAULT_MAX_MEMPOOL_BYTES,
        )
        .map_err(|err| err.to_string())?,
    );
    log_chain_info(&ctx);

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut sigterm = match signal(SignalKind::terminate()) {
                    Ok(signal) => signal,
                    Err(err) => {
                        log_warn!("failed to install SIGTERM handler: {err}");
                        let _ = tokio::signal::ctrl_c().await;
                        let _ = shutdown_tx.send(true);
                        return;
                    }
                };
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = sigterm.recv() => {},
                }
            }
            #[cfg(not(unix))]
            {
                let _ = tokio::signal::ctrl_c().await;
            }

            log_info!("Signal received; requesting shutdown.");
            let _ = shutdown_tx.send(true);
        });
    }

    let staker_task = if config.staking {
        let staker = Staker::new(Arc::clone(&ctx), SystemClock);
        Some(tokio::spawn(run_staker(
            staker,
            Duration::from_millis(config.stake_interval_ms),
            shutdown_rx.clone(),
        )))
    } else {
        log_info!("staking disabled");
        None
    };

    while !*shutdown_rx.borrow() {
        if shutdown_rx.changed().await.is_err() {
            break;
        }
    }
    drop(shutdown_tx);
    if let Some(task) = staker_task {
        if let Err(err) = task.await {
            log_error!("staker task failed: {err}");
        }
    }

    let flushed = ctx
        .with_chain(|chain| chain.flush_state(FlushMode::Always))
        .map_err(|err| err.to_string())?;
    if let Err(err) = flushed {
        log_error!("final flush failed: {err}");
    }
    log_chain_info(&ctx);
    Ok(())
}

fn log_chain_info<S: KeyValueStore>(ctx: &NodeContext<S>) {
    match ctx.chain_info() {
        Ok(info) => match serde_json::to_string(&info) {
            Ok(json) => log_info!("chain info {json}"),
            Err(err) => log_warn!("failed to encode chain info: {err}"),
        },
        Err(err) => log_warn!("chain info unavailable: {err}"),
    }
}
