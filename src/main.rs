use color_eyre::eyre::{
    Result,
    WrapErr,
    eyre,
};
use itertools::Itertools;
use squares_client::{
    activity::{
        ActivityFeed,
        DEFAULT_FEED_CAPACITY,
        EventWatcher,
    },
    config::{
        AppConfig,
        ConfigFile,
        DEFAULT_LOCAL_RPC_URL,
        DEFAULT_SEPOLIA_RPC_URL,
        NetworkKind,
    },
    error::ValidationError,
    ledger::{
        RemoteLedger,
        WalletSession,
        rpc::{
            RpcLedger,
            RpcWallet,
        },
        simulated::{
            SimulatedLedger,
            SimulatedWallet,
        },
    },
    orchestrator::TransactionOrchestrator,
    poller::PollingScheduler,
    sync::{
        GameSync,
        SyncSnapshot,
    },
    telemetry,
    types::{
        Address,
        Amount,
        SquareIndex,
    },
};
use std::sync::Arc;
use tracing::{
    info,
    warn,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Command {
    Watch,
    Scenario,
}

fn print_usage_and_exit() -> ! {
    println!(
        "Usage: squares-client <watch | scenario> [--config <path>] [--sepolia | --local]\n\
         [--rpc-url <url>] [--contract <address>] [--player <address>]\n\
         [--chain-id <id>] [--poll-ms <ms>] [--log-dir <path>]\n\
         \n\
         Commands:\n\
           watch               Mirror a deployed squares contract until Ctrl-C\n\
           scenario            Play a full round against the in-memory contract\n\
         \n\
         Flags:\n\
           --config <path>     JSON config file; flags override its values\n\
           --sepolia           Connect to Sepolia (default RPC {})\n\
           --local             Connect to a local node (default RPC {})\n\
           --rpc-url <url>     Override the RPC URL for the selected network\n\
           --contract <addr>   Address of the deployed squares contract\n\
           --player <addr>     Node-managed account to watch as the player\n\
           --chain-id <id>     Expected chain id (defaults to the network's)\n\
           --poll-ms <ms>      Refresh interval in milliseconds\n\
           --log-dir <path>    Write daily rolling logs to this directory",
        DEFAULT_SEPOLIA_RPC_URL, DEFAULT_LOCAL_RPC_URL,
    );
    std::process::exit(0);
}

fn parse_cli_args() -> Result<(Command, AppConfig)> {
    let mut args = std::env::args().skip(1);
    let command = match args.next().as_deref() {
        Some("watch") => Command::Watch,
        Some("scenario") => Command::Scenario,
        Some("--help" | "-h") | None => print_usage_and_exit(),
        Some(other) => return Err(eyre!("Unknown command: {other}")),
    };

    let mut config_path: Option<String> = None;
    let mut cli = ConfigFile::default();

    fn value(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<String> {
        args.next()
            .ok_or_else(|| eyre!("{flag} requires an argument"))
    }

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                if config_path.is_some() {
                    return Err(eyre!("--config may only be specified once"));
                }
                config_path = Some(value(&mut args, "--config")?);
            }
            "--sepolia" | "--local" => {
                if cli.network.is_some() {
                    return Err(eyre!(
                        "Multiple network flags provided; choose one of --sepolia/--local"
                    ));
                }
                cli.network = Some(if arg == "--sepolia" {
                    NetworkKind::Sepolia
                } else {
                    NetworkKind::Local
                });
            }
            "--rpc-url" => cli.rpc_url = Some(value(&mut args, "--rpc-url")?),
            "--contract" => {
                let raw = value(&mut args, "--contract")?;
                cli.contract = Some(raw.parse().wrap_err("Invalid --contract address")?);
            }
            "--player" => {
                let raw = value(&mut args, "--player")?;
                cli.player = Some(raw.parse().wrap_err("Invalid --player address")?);
            }
            "--chain-id" => {
                let raw = value(&mut args, "--chain-id")?;
                cli.chain_id = Some(raw.parse().wrap_err("Invalid --chain-id")?);
            }
            "--poll-ms" => {
                let raw = value(&mut args, "--poll-ms")?;
                cli.poll_interval_ms = Some(raw.parse().wrap_err("Invalid --poll-ms")?);
            }
            "--log-dir" => cli.log_dir = Some(value(&mut args, "--log-dir")?),
            "--help" | "-h" => print_usage_and_exit(),
            other => return Err(eyre!("Unknown argument: {other}")),
        }
    }

    let file = match config_path {
        Some(path) => ConfigFile::load(&path)?,
        None => ConfigFile::default(),
    };
    let config = file.overlay(cli).resolve()?;
    Ok((command, config))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let (command, config) = parse_cli_args()?;
    let _log_guard = telemetry::init_tracing(config.log_dir.as_deref());
    match command {
        Command::Watch => watch(config).await,
        Command::Scenario => scenario(config).await,
    }
}

fn log_snapshot(snapshot: &SyncSnapshot, player: Option<Address>) {
    let derived = &snapshot.derived;
    let winner = match (derived.winning_index, derived.winner) {
        (Some(index), Some(winner)) => format!("square {index} won by {}", winner.short()),
        (Some(index), None) => format!("square {index} unowned, no winner"),
        (None, _) => "-".to_string(),
    };
    let mine = player
        .map(|player| snapshot.squares.owned_by(&player).iter().join(", "))
        .unwrap_or_default();
    info!(
        cycle = snapshot.cycle,
        phase = %snapshot.game.phase(),
        price = %snapshot.game.entry_price,
        sold = derived.total_sold,
        pool = %derived.prize_pool,
        %winner,
        %mine,
        "board"
    );
}

async fn watch(config: AppConfig) -> Result<()> {
    let contract = config
        .contract
        .ok_or_else(|| eyre!("watch needs a contract address (--contract or config)"))?;
    let url = config.network.url().to_string();
    info!(%url, %contract, "connecting to squares contract");

    let ledger = Arc::new(
        RpcLedger::new(url.clone(), contract, config.request_timeout)
            .wrap_err("Failed to create RPC client")?,
    );
    if let Some(player) = config.player {
        let wallet = RpcWallet::connect(url, Some(player), config.request_timeout)
            .await
            .wrap_err("Failed to query the node's chain id")?;
        match wallet.current_chain_id() {
            Some(chain_id) if chain_id != config.expected_chain_id => warn!(
                chain_id,
                expected = config.expected_chain_id,
                "node is on a different network than expected"
            ),
            _ => {}
        }
        match wallet.balance_of(player).await {
            Ok(balance) => info!(player = %player.short(), %balance, "player balance"),
            Err(err) => warn!(?err, "failed to read player balance"),
        }
    }

    let sync = Arc::new(GameSync::new(ledger.clone()));
    let poller = Arc::new(PollingScheduler::new(sync.clone(), config.backoff));
    let feed = Arc::new(ActivityFeed::new(config.player, DEFAULT_FEED_CAPACITY));
    let mut snapshots = sync.subscribe();
    poller.start(config.poll_interval);
    let watcher = EventWatcher::spawn(ledger.as_ref(), feed.clone(), poller.clone());

    let mut last_activity = None;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                log_snapshot(&snapshot, config.player);
                if let Some(entry) = feed.entries().into_iter().next()
                    && last_activity.as_ref() != Some(&entry)
                {
                    info!("{entry}");
                    last_activity = Some(entry);
                }
                if let Some(player) = config.player {
                    check_divergence(ledger.as_ref(), &snapshot, player).await;
                }
            }
        }
    }

    watcher.stop();
    poller.stop();
    Ok(())
}

/// The contract's own list of the player's squares can lag or lead the full table
/// around purchase races. The table wins; disagreement is only logged.
async fn check_divergence<L: RemoteLedger>(ledger: &L, snapshot: &SyncSnapshot, player: Address) {
    let cached = snapshot.squares.owned_by(&player);
    match ledger.my_squares(player).await {
        Ok(mut remote) => {
            remote.sort();
            if remote != cached {
                warn!(
                    cached = %cached.iter().join(", "),
                    remote = %remote.iter().join(", "),
                    "getMySquares disagrees with the ownership table"
                );
            }
        }
        Err(err) => warn!(?err, "failed to read getMySquares"),
    }
}

async fn scenario(config: AppConfig) -> Result<()> {
    let admin = Address::new([0x01; 20]);
    let alice = Address::new([0xA1; 20]);
    let bob = Address::new([0xB0; 20]);
    let price = Amount::from_ether("0.1")?;

    let ledger = Arc::new(SimulatedLedger::new(admin, price, config.expected_chain_id));
    ledger.fund(alice, Amount::from_ether("1")?);
    ledger.fund(bob, Amount::from_ether("1")?);
    let sync = Arc::new(GameSync::new(ledger.clone()));
    let poller = Arc::new(PollingScheduler::new(sync.clone(), config.backoff));
    let feed = Arc::new(ActivityFeed::new(Some(alice), DEFAULT_FEED_CAPACITY));
    poller.start(config.poll_interval);
    let watcher = EventWatcher::spawn(ledger.as_ref(), feed.clone(), poller.clone());
    sync.refresh_all().await;

    let orchestrator = |address: Address| {
        TransactionOrchestrator::new(
            sync.clone(),
            Arc::new(SimulatedWallet::connected(ledger.clone(), address)),
            config.expected_chain_id,
            config.receipt_timeout,
        )
    };
    let admin_tx = orchestrator(admin);
    let alice_tx = orchestrator(alice);
    let bob_tx = orchestrator(bob);

    let receipts = admin_tx.start_new_round().await?;
    info!(steps = receipts.len(), "round started");

    for (player, tx, index) in [(alice, &alice_tx, 12), (alice, &alice_tx, 47), (bob, &bob_tx, 53)]
    {
        let index = SquareIndex::new(index).ok_or_else(|| eyre!("square {index} is off the board"))?;
        tx.toggle_square(index)?;
        let receipt = tx.purchase_selected().await?;
        info!(player = %player.short(), square = %index, tx = %receipt.tx, "square bought");
    }
    log_snapshot(&sync.snapshot(), Some(alice));

    let taken = SquareIndex::new(53).ok_or_else(|| eyre!("square 53 is off the board"))?;
    match alice_tx.toggle_square(taken) {
        Err(ValidationError::SquareAlreadyOwned(index)) => {
            info!(square = %index, "taken square cannot be selected")
        }
        other => warn!(?other, "expected the owned square to be refused"),
    }

    match admin_tx.end_game(19, 29).await {
        Err(err) => info!(reason = %err, "ending on an unowned square was rejected"),
        Ok(_) => warn!("ending on an unowned square unexpectedly succeeded"),
    }

    admin_tx.end_game(15, 23).await?;
    let snapshot = sync.snapshot();
    log_snapshot(&snapshot, Some(alice));
    info!(
        winner = ?snapshot.derived.winner.map(|w| w.short()),
        bob_balance = %ledger.balance(&bob),
        "round settled"
    );

    let receipts = admin_tx.start_new_round().await?;
    info!(steps = receipts.len(), "next round started");
    log_snapshot(&sync.snapshot(), Some(alice));

    for entry in feed.entries().iter().rev() {
        info!("{entry}");
    }
    for tx in admin_tx.history().iter().rev() {
        info!(kind = %tx.kind, hash = ?tx.hash, status = ?tx.status, "admin transaction");
    }

    watcher.stop();
    poller.stop();
    Ok(())
}
