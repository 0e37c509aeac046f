//! In-memory squares contract with the same rules as the deployed one, plus knobs
//! for injecting the failures a real node produces.

use crate::{
    error::{
        LedgerError,
        LedgerResult,
    },
    ledger::{
        LedgerCall,
        LedgerEvent,
        LedgerLog,
        Receipt,
        ReceiptStatus,
        RemoteLedger,
        WalletSession,
    },
    types::{
        Address,
        Amount,
        GRID_SIZE,
        SquareIndex,
        TxId,
    },
};
use futures::{
    StreamExt,
    stream::BoxStream,
};
use sha2::{
    Digest,
    Sha256,
};
use std::{
    collections::HashMap,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
    },
    time::Duration,
};
use tokio::sync::{
    broadcast,
    watch,
};

const EVENT_BUFFER: usize = 64;

#[derive(Debug)]
struct ContractState {
    entry_price: Amount,
    started: bool,
    ended: bool,
    home_digit: u64,
    away_digit: u64,
    admin: Address,
    squares: Vec<Option<Address>>,
}

impl ContractState {
    fn clear_round(&mut self) {
        self.started = false;
        self.ended = false;
        self.home_digit = 0;
        self.away_digit = 0;
        self.squares = vec![None; GRID_SIZE];
    }

    fn sold(&self) -> u64 {
        self.squares.iter().filter(|owner| owner.is_some()).count() as u64
    }
}

#[derive(Debug)]
struct QueuedTx {
    tx: TxId,
    from: Address,
    call: LedgerCall,
}

#[derive(Debug, Default)]
struct Faults {
    failing_reads: u32,
    failing_functions: HashMap<&'static str, u32>,
    next_send_error: Option<LedgerError>,
    hold_blocks: bool,
    read_latency: Option<Duration>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CallCounters {
    pub scalar_reads: u64,
    pub batch_reads: u64,
    pub sends: u64,
}

#[derive(Debug)]
struct Inner {
    contract: ContractState,
    balances: HashMap<Address, Amount>,
    mempool: Vec<QueuedTx>,
    receipts: HashMap<TxId, Receipt>,
    block_number: u64,
    nonce: u64,
    faults: Faults,
    counters: CallCounters,
}

pub struct SimulatedLedger {
    chain_id: u64,
    inner: Mutex<Inner>,
    blocks: watch::Sender<u64>,
    events: broadcast::Sender<LedgerLog>,
}

impl SimulatedLedger {
    pub fn new(admin: Address, entry_price: Amount, chain_id: u64) -> Self {
        let (blocks, _) = watch::channel(0);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            chain_id,
            inner: Mutex::new(Inner {
                contract: ContractState {
                    entry_price,
                    started: false,
                    ended: false,
                    home_digit: 0,
                    away_digit: 0,
                    admin,
                    squares: vec![None; GRID_SIZE],
                },
                balances: HashMap::new(),
                mempool: Vec::new(),
                receipts: HashMap::new(),
                block_number: 0,
                nonce: 0,
                faults: Faults::default(),
                counters: CallCounters::default(),
            }),
            blocks,
            events,
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn fund(&self, address: Address, amount: Amount) {
        let mut inner = self.lock();
        let balance = inner.balances.entry(address).or_default();
        *balance = balance.checked_add(amount).unwrap_or(*balance);
    }

    pub fn balance(&self, address: &Address) -> Amount {
        self.lock().balances.get(address).copied().unwrap_or_default()
    }

    pub fn counters(&self) -> CallCounters {
        self.lock().counters
    }

    /// The next `count` reads of any kind fail with a transport error.
    pub fn fail_next_reads(&self, count: u32) {
        self.lock().faults.failing_reads = count;
    }

    /// The next `count` calls of the named view function fail with a transport error.
    pub fn fail_function(&self, function: &'static str, count: u32) {
        self.lock().faults.failing_functions.insert(function, count);
    }

    /// The next `send` fails with `error` before reaching the contract.
    pub fn fail_next_send(&self, error: LedgerError) {
        self.lock().faults.next_send_error = Some(error);
    }

    /// Every read sleeps for `latency` before answering.
    pub fn set_read_latency(&self, latency: Duration) {
        self.lock().faults.read_latency = Some(latency);
    }

    /// While held, submitted transactions stay in the mempool without receipts.
    pub fn hold_blocks(&self) {
        self.lock().faults.hold_blocks = true;
    }

    /// Mines everything queued while blocks were held, and stops holding.
    pub fn release_blocks(&self) {
        let logs = {
            let mut inner = self.lock();
            inner.faults.hold_blocks = false;
            Self::mine_pending(&mut inner)
        };
        self.publish(logs);
    }

    pub fn pending_transactions(&self) -> usize {
        self.lock().mempool.len()
    }

    /// Runs `call` from `from` straight through the contract, as another client would.
    pub fn execute(&self, from: Address, call: LedgerCall) -> ReceiptStatus {
        let (logs, status) = {
            let mut inner = self.lock();
            if Self::debit(&mut inner, from, call.value()).is_err() {
                return ReceiptStatus::Reverted("insufficient funds".into());
            }
            let tx = Self::next_tx_id(&mut inner, &from, &call);
            inner.mempool.push(QueuedTx { tx, from, call });
            let logs = Self::mine_pending(&mut inner);
            let status = inner
                .receipts
                .get(&tx)
                .map(|receipt| receipt.status.clone())
                .unwrap_or(ReceiptStatus::Reverted("not mined".into()));
            (logs, status)
        };
        self.publish(logs);
        status
    }

    fn publish(&self, logs: Vec<LedgerLog>) {
        let height = self.lock().block_number;
        for log in logs {
            // no subscribers is fine
            let _ = self.events.send(log);
        }
        self.blocks.send_replace(height);
    }

    fn next_tx_id(inner: &mut Inner, from: &Address, call: &LedgerCall) -> TxId {
        inner.nonce += 1;
        let mut hasher = Sha256::new();
        hasher.update(inner.nonce.to_be_bytes());
        hasher.update(from.as_bytes());
        hasher.update(call.function_name().as_bytes());
        TxId::new(hasher.finalize().into())
    }

    fn mine_pending(inner: &mut Inner) -> Vec<LedgerLog> {
        let queued = std::mem::take(&mut inner.mempool);
        if queued.is_empty() {
            return Vec::new();
        }
        inner.block_number += 1;
        let block_number = inner.block_number;
        let mut logs = Vec::new();
        for QueuedTx { tx, from, call } in queued {
            let status = match Self::apply(inner, from, &call) {
                Ok(events) => {
                    logs.extend(events.into_iter().map(|event| LedgerLog {
                        tx: Some(tx),
                        event,
                    }));
                    ReceiptStatus::Success
                }
                Err(reason) => {
                    Self::refund(inner, from, call.value());
                    ReceiptStatus::Reverted(reason.to_string())
                }
            };
            inner.receipts.insert(
                tx,
                Receipt {
                    tx,
                    block_number,
                    status,
                },
            );
        }
        logs
    }

    /// Takes `value` from `from`, or returns the balance that fell short.
    fn debit(inner: &mut Inner, from: Address, value: Amount) -> Result<(), Amount> {
        let balance = inner.balances.get(&from).copied().unwrap_or_default();
        if balance < value {
            return Err(balance);
        }
        inner.balances.insert(from, balance.saturating_sub(value));
        Ok(())
    }

    fn refund(inner: &mut Inner, to: Address, value: Amount) {
        if value == Amount::ZERO {
            return;
        }
        let balance = inner.balances.entry(to).or_default();
        *balance = balance.checked_add(value).unwrap_or(*balance);
    }

    fn apply(
        inner: &mut Inner,
        from: Address,
        call: &LedgerCall,
    ) -> Result<Vec<LedgerEvent>, &'static str> {
        let contract = &mut inner.contract;
        let only_admin = |contract: &ContractState| {
            if contract.admin == from {
                Ok(())
            } else {
                Err("caller is not the owner")
            }
        };
        match call {
            LedgerCall::BuySquare { index, value } => {
                if !contract.started {
                    return Err("game not started");
                }
                if contract.ended {
                    return Err("game already ended");
                }
                if contract.squares[index.as_usize()].is_some() {
                    return Err("square already owned");
                }
                if *value != contract.entry_price {
                    return Err("incorrect entry price");
                }
                contract.squares[index.as_usize()] = Some(from);
                Ok(vec![LedgerEvent::SquarePurchased {
                    player: from,
                    index: *index,
                }])
            }
            LedgerCall::StartGame => {
                only_admin(contract)?;
                if contract.started {
                    return Err("game already started");
                }
                contract.started = true;
                Ok(vec![LedgerEvent::GameStarted])
            }
            LedgerCall::EndGame {
                home_score,
                away_score,
            } => {
                only_admin(contract)?;
                if !contract.started {
                    return Err("game not started");
                }
                if contract.ended {
                    return Err("game already ended");
                }
                let home = (home_score % 10) as u8;
                let away = (away_score % 10) as u8;
                let index = SquareIndex::from_digits(home, away)
                    .ok_or("invalid winning square")?;
                let winner =
                    contract.squares[index.as_usize()].ok_or("no winner")?;
                let prize = contract.entry_price.saturating_mul(contract.sold());
                contract.ended = true;
                contract.home_digit = u64::from(home);
                contract.away_digit = u64::from(away);
                Self::refund(inner, winner, prize);
                Ok(vec![LedgerEvent::GameEnded {
                    home_score: *home_score,
                    away_score: *away_score,
                    winner: Some(winner),
                    prize,
                }])
            }
            LedgerCall::ForceReset => {
                only_admin(contract)?;
                contract.clear_round();
                Ok(Vec::new())
            }
            LedgerCall::ResetGame => {
                only_admin(contract)?;
                if !contract.ended {
                    return Err("game not ended");
                }
                contract.clear_round();
                Ok(Vec::new())
            }
        }
    }

    async fn read<T>(
        &self,
        function: &'static str,
        batch: bool,
        f: impl FnOnce(&ContractState) -> T,
    ) -> LedgerResult<T> {
        let latency = self.lock().faults.read_latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let mut inner = self.lock();
        if batch {
            inner.counters.batch_reads += 1;
        } else {
            inner.counters.scalar_reads += 1;
        }
        if inner.faults.failing_reads > 0 {
            inner.faults.failing_reads -= 1;
            return Err(LedgerError::Transport(format!("{function}: connection reset")));
        }
        if let Some(remaining) = inner.faults.failing_functions.get_mut(function)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(LedgerError::Transport(format!("{function}: connection reset")));
        }
        Ok(f(&inner.contract))
    }
}

impl RemoteLedger for SimulatedLedger {
    async fn entry_price(&self) -> LedgerResult<Amount> {
        self.read("entryPrice", false, |c| c.entry_price).await
    }

    async fn game_started(&self) -> LedgerResult<bool> {
        self.read("gameStarted", false, |c| c.started).await
    }

    async fn game_ended(&self) -> LedgerResult<bool> {
        self.read("gameEnded", false, |c| c.ended).await
    }

    async fn home_score_last_digit(&self) -> LedgerResult<u64> {
        self.read("homeScoreLastDigit", false, |c| c.home_digit).await
    }

    async fn away_score_last_digit(&self) -> LedgerResult<u64> {
        self.read("awayScoreLastDigit", false, |c| c.away_digit).await
    }

    async fn owner(&self) -> LedgerResult<Address> {
        self.read("owner", false, |c| c.admin).await
    }

    async fn squares(&self) -> LedgerResult<Vec<Option<Address>>> {
        self.read("squares", true, |c| c.squares.clone()).await
    }

    async fn my_squares(&self, player: Address) -> LedgerResult<Vec<SquareIndex>> {
        self.read("getMySquares", false, |c| {
            SquareIndex::all()
                .filter(|index| c.squares[index.as_usize()] == Some(player))
                .collect()
        })
        .await
    }

    async fn send(&self, from: Address, call: LedgerCall) -> LedgerResult<TxId> {
        let (tx, logs) = {
            let mut inner = self.lock();
            inner.counters.sends += 1;
            if let Some(err) = inner.faults.next_send_error.take() {
                return Err(err);
            }
            let value = call.value();
            if let Err(balance) = Self::debit(&mut inner, from, value) {
                return Err(LedgerError::InsufficientFunds(format!(
                    "balance {balance} is below transaction value {value}"
                )));
            }
            let tx = Self::next_tx_id(&mut inner, &from, &call);
            inner.mempool.push(QueuedTx { tx, from, call });
            let logs = if inner.faults.hold_blocks {
                Vec::new()
            } else {
                Self::mine_pending(&mut inner)
            };
            (tx, logs)
        };
        self.publish(logs);
        Ok(tx)
    }

    async fn wait_for_receipt(&self, tx: TxId) -> LedgerResult<Receipt> {
        let mut blocks = self.blocks.subscribe();
        loop {
            {
                let inner = self.lock();
                if let Some(receipt) = inner.receipts.get(&tx) {
                    return Ok(receipt.clone());
                }
                if !inner.mempool.iter().any(|queued| queued.tx == tx) {
                    return Err(LedgerError::Transport(format!("unknown transaction {tx}")));
                }
            }
            blocks
                .changed()
                .await
                .map_err(|_| LedgerError::Transport("ledger shut down".into()))?;
        }
    }

    fn subscribe(&self) -> BoxStream<'static, LedgerResult<LedgerLog>> {
        let rx = self.events.subscribe();
        futures::stream::unfold(rx, |mut rx| async move {
            match rx.recv().await {
                Ok(log) => Some((Ok(log), rx)),
                Err(broadcast::error::RecvError::Lagged(missed)) => Some((
                    Err(LedgerError::Transport(format!(
                        "event stream lagged, {missed} events dropped"
                    ))),
                    rx,
                )),
                Err(broadcast::error::RecvError::Closed) => None,
            }
        })
        .boxed()
    }
}

/// Wallet connected to a [`SimulatedLedger`].
#[derive(Clone)]
pub struct SimulatedWallet {
    ledger: Arc<SimulatedLedger>,
    address: Option<Address>,
    chain_id: Option<u64>,
}

impl SimulatedWallet {
    pub fn connected(ledger: Arc<SimulatedLedger>, address: Address) -> Self {
        let chain_id = Some(ledger.chain_id());
        Self {
            ledger,
            address: Some(address),
            chain_id,
        }
    }

    pub fn disconnected(ledger: Arc<SimulatedLedger>) -> Self {
        Self {
            ledger,
            address: None,
            chain_id: None,
        }
    }

    pub fn on_chain(mut self, chain_id: u64) -> Self {
        self.chain_id = Some(chain_id);
        self
    }
}

impl WalletSession for SimulatedWallet {
    fn current_address(&self) -> Option<Address> {
        self.address
    }

    fn current_chain_id(&self) -> Option<u64> {
        self.chain_id
    }

    async fn balance_of(&self, address: Address) -> LedgerResult<Amount> {
        Ok(self.ledger.balance(&address))
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;

    const CHAIN: u64 = 11155111;

    fn admin() -> Address {
        Address::new([0xAD; 20])
    }

    fn alice() -> Address {
        Address::new([0xA1; 20])
    }

    fn price() -> Amount {
        Amount::from_ether("0.1").unwrap()
    }

    fn started_ledger() -> SimulatedLedger {
        let ledger = SimulatedLedger::new(admin(), price(), CHAIN);
        ledger.fund(alice(), Amount::from_ether("1").unwrap());
        assert_eq!(ledger.execute(admin(), LedgerCall::StartGame), ReceiptStatus::Success);
        ledger
    }

    #[tokio::test]
    async fn send__buy_square_marks_owner_and_debits_value() {
        // given
        let ledger = started_ledger();
        let index = SquareIndex::new(12).unwrap();

        // when
        let tx = ledger
            .send(alice(), LedgerCall::BuySquare { index, value: price() })
            .await
            .unwrap();
        let receipt = ledger.wait_for_receipt(tx).await.unwrap();

        // then
        assert_eq!(receipt.status, ReceiptStatus::Success);
        let owners = ledger.squares().await.unwrap();
        assert_eq!(owners[12], Some(alice()));
        assert_eq!(ledger.balance(&alice()), Amount::from_ether("0.9").unwrap());
    }

    #[tokio::test]
    async fn send__second_purchase_of_same_square_reverts_and_refunds() {
        // given
        let ledger = started_ledger();
        let index = SquareIndex::new(47).unwrap();
        let call = LedgerCall::BuySquare { index, value: price() };
        ledger.execute(alice(), call.clone());

        // when
        let tx = ledger.send(alice(), call).await.unwrap();
        let receipt = ledger.wait_for_receipt(tx).await.unwrap();

        // then
        assert_eq!(
            receipt.status,
            ReceiptStatus::Reverted("square already owned".into())
        );
        assert_eq!(ledger.balance(&alice()), Amount::from_ether("0.9").unwrap());
    }

    #[tokio::test]
    async fn send__end_game_on_unowned_winning_square_reverts_with_no_winner() {
        // given
        let ledger = started_ledger();

        // when
        let status = ledger.execute(
            admin(),
            LedgerCall::EndGame {
                home_score: 19,
                away_score: 29,
            },
        );

        // then
        assert_eq!(status, ReceiptStatus::Reverted("no winner".into()));
        assert!(!ledger.game_ended().await.unwrap());
    }

    #[tokio::test]
    async fn send__insufficient_balance_is_rejected_before_mining() {
        // given
        let ledger = started_ledger();
        let broke = Address::new([0xB0; 20]);
        let index = SquareIndex::new(1).unwrap();

        // when
        let result = ledger
            .send(broke, LedgerCall::BuySquare { index, value: price() })
            .await;

        // then
        assert!(matches!(result, Err(LedgerError::InsufficientFunds(_))));
        assert_eq!(ledger.pending_transactions(), 0);
    }

    #[tokio::test]
    async fn wait_for_receipt__resolves_after_blocks_are_released() {
        // given
        let ledger = Arc::new(started_ledger());
        ledger.hold_blocks();
        let tx = ledger.send(admin(), LedgerCall::ForceReset).await.unwrap();
        let waiter = {
            let ledger = ledger.clone();
            tokio::spawn(async move { ledger.wait_for_receipt(tx).await })
        };
        tokio::task::yield_now().await;
        assert!(ledger.game_started().await.unwrap());

        // when
        ledger.release_blocks();

        // then
        let receipt = waiter.await.unwrap().unwrap();
        assert_eq!(receipt.status, ReceiptStatus::Success);
        assert!(!ledger.game_started().await.unwrap());
    }

    #[tokio::test]
    async fn fail_function__only_affects_the_named_read() {
        // given
        let ledger = started_ledger();
        ledger.fail_function("owner", 1);

        // when
        let owner = ledger.owner().await;
        let started = ledger.game_started().await;

        // then
        assert!(matches!(owner, Err(LedgerError::Transport(_))));
        assert_eq!(started, Ok(true));
        assert_eq!(ledger.owner().await, Ok(admin()));
    }
}
