//! Seams to the outside world: the remote contract and the player's wallet.
//!
//! Everything behind these traits is slow, eventually consistent and fallible. The
//! rest of the crate only ever talks to them through [`RemoteLedger`] and
//! [`WalletSession`], so the same sync/orchestration code runs against a JSON-RPC
//! node ([`rpc`]) or the in-memory contract used by tests ([`simulated`]).

use crate::{
    error::LedgerResult,
    orchestrator::ActionKind,
    types::{
        Address,
        Amount,
        SquareIndex,
        TxId,
    },
};
use futures::stream::BoxStream;

pub mod rpc;
pub mod simulated;

/// A state-changing contract call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LedgerCall {
    BuySquare { index: SquareIndex, value: Amount },
    StartGame,
    EndGame { home_score: u32, away_score: u32 },
    /// Clears an active or ended round.
    ForceReset,
    /// Clears a round that has already ended.
    ResetGame,
}

impl LedgerCall {
    pub fn kind(&self) -> ActionKind {
        match self {
            LedgerCall::BuySquare { .. } => ActionKind::Purchase,
            LedgerCall::StartGame => ActionKind::StartGame,
            LedgerCall::EndGame { .. } => ActionKind::EndGame,
            LedgerCall::ForceReset | LedgerCall::ResetGame => ActionKind::ForceReset,
        }
    }

    pub fn function_name(&self) -> &'static str {
        match self {
            LedgerCall::BuySquare { .. } => "buySquare",
            LedgerCall::StartGame => "startGame",
            LedgerCall::EndGame { .. } => "endGame",
            LedgerCall::ForceReset => "forceReset",
            LedgerCall::ResetGame => "resetGame",
        }
    }

    /// Native value attached to the transaction.
    pub fn value(&self) -> Amount {
        match self {
            LedgerCall::BuySquare { value, .. } => *value,
            _ => Amount::ZERO,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReceiptStatus {
    Success,
    Reverted(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Receipt {
    pub tx: TxId,
    pub block_number: u64,
    pub status: ReceiptStatus,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LedgerEvent {
    SquarePurchased {
        player: Address,
        index: SquareIndex,
    },
    GameStarted,
    GameEnded {
        home_score: u32,
        away_score: u32,
        winner: Option<Address>,
        prize: Amount,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LedgerLog {
    pub tx: Option<TxId>,
    pub event: LedgerEvent,
}

pub trait RemoteLedger: Send + Sync + 'static {
    fn entry_price(&self) -> impl Future<Output = LedgerResult<Amount>> + Send;

    fn game_started(&self) -> impl Future<Output = LedgerResult<bool>> + Send;

    fn game_ended(&self) -> impl Future<Output = LedgerResult<bool>> + Send;

    fn home_score_last_digit(&self) -> impl Future<Output = LedgerResult<u64>> + Send;

    fn away_score_last_digit(&self) -> impl Future<Output = LedgerResult<u64>> + Send;

    /// Contract admin.
    fn owner(&self) -> impl Future<Output = LedgerResult<Address>> + Send;

    /// Owner of every square in a single round-trip, `None` for unowned squares.
    fn squares(
        &self,
    ) -> impl Future<Output = LedgerResult<Vec<Option<Address>>>> + Send;

    /// The contract's own view of a player's squares. Can disagree with
    /// [`RemoteLedger::squares`] around purchase races; never used to drive the cache.
    fn my_squares(
        &self,
        player: Address,
    ) -> impl Future<Output = LedgerResult<Vec<SquareIndex>>> + Send;

    /// Signs and submits `call` from `from`, returning once the ledger accepted it.
    fn send(
        &self,
        from: Address,
        call: LedgerCall,
    ) -> impl Future<Output = LedgerResult<TxId>> + Send;

    /// Resolves once `tx` has been included in a block.
    fn wait_for_receipt(
        &self,
        tx: TxId,
    ) -> impl Future<Output = LedgerResult<Receipt>> + Send;

    fn subscribe(&self) -> BoxStream<'static, LedgerResult<LedgerLog>>;
}

pub trait WalletSession: Send + Sync + 'static {
    fn current_address(&self) -> Option<Address>;

    fn current_chain_id(&self) -> Option<u64>;

    fn balance_of(
        &self,
        address: Address,
    ) -> impl Future<Output = LedgerResult<Amount>> + Send;
}
