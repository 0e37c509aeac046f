use crate::{
    config::SEPOLIA_CHAIN_ID,
    ledger::{
        LedgerCall,
        ReceiptStatus,
        simulated::{
            SimulatedLedger,
            SimulatedWallet,
        },
    },
    orchestrator::TransactionOrchestrator,
    poller::{
        Backoff,
        PollingScheduler,
    },
    sync::GameSync,
    types::{
        Address,
        Amount,
        SquareIndex,
    },
};
use std::{
    sync::Arc,
    time::Duration,
};

pub type SimulatedOrchestrator = TransactionOrchestrator<SimulatedLedger, SimulatedWallet>;

pub const ENTRY_PRICE_ETHER: &str = "0.1";
pub const STARTING_BALANCE_ETHER: &str = "10";
pub const RECEIPT_TIMEOUT: Duration = Duration::from_secs(30);

/// A simulated contract with an admin, two funded players and a shared cache.
pub struct TestContext {
    ledger: Arc<SimulatedLedger>,
    sync: Arc<GameSync<SimulatedLedger>>,
}

impl TestContext {
    pub fn new() -> Self {
        let ledger = Arc::new(SimulatedLedger::new(
            Self::owner(),
            Self::entry_price(),
            SEPOLIA_CHAIN_ID,
        ));
        let balance = Amount::from_ether(STARTING_BALANCE_ETHER).unwrap_or(Amount::ZERO);
        ledger.fund(Self::alice(), balance);
        ledger.fund(Self::bob(), balance);
        let sync = Arc::new(GameSync::new(ledger.clone()));
        Self { ledger, sync }
    }

    pub fn owner() -> Address {
        Address::new([0x01; 20])
    }

    pub fn alice() -> Address {
        Address::new([0xA1; 20])
    }

    pub fn bob() -> Address {
        Address::new([0xB0; 20])
    }

    pub fn entry_price() -> Amount {
        Amount::from_ether(ENTRY_PRICE_ETHER).unwrap_or(Amount::ZERO)
    }

    pub fn square(index: u8) -> SquareIndex {
        SquareIndex::new(index).unwrap_or_else(|| panic!("square {index} is off the board"))
    }

    pub fn ledger(&self) -> Arc<SimulatedLedger> {
        self.ledger.clone()
    }

    pub fn sync(&self) -> Arc<GameSync<SimulatedLedger>> {
        self.sync.clone()
    }

    pub fn wallet(&self, address: Address) -> SimulatedWallet {
        SimulatedWallet::connected(self.ledger.clone(), address)
    }

    pub fn orchestrator_for(&self, address: Address) -> SimulatedOrchestrator {
        self.orchestrator_with_wallet(self.wallet(address))
    }

    pub fn orchestrator_with_wallet(&self, wallet: SimulatedWallet) -> SimulatedOrchestrator {
        TransactionOrchestrator::new(
            self.sync.clone(),
            Arc::new(wallet),
            SEPOLIA_CHAIN_ID,
            RECEIPT_TIMEOUT,
        )
    }

    pub fn poller(&self) -> PollingScheduler<SimulatedLedger> {
        PollingScheduler::new(self.sync.clone(), Backoff::default())
    }

    /// Starts the round directly on the ledger, bypassing the client.
    pub fn start_round(&self) {
        self.ledger.execute(Self::owner(), LedgerCall::StartGame);
    }

    /// Buys `index` for `player` directly on the ledger, as another client would.
    pub fn buy_directly(&self, player: Address, index: u8) -> ReceiptStatus {
        self.ledger.execute(player, LedgerCall::BuySquare {
            index: Self::square(index),
            value: Self::entry_price(),
        })
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}
