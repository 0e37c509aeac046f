use crate::{
    ledger::LedgerCall,
    orchestrator::ActionKind,
    types::{
        Address,
        SquareIndex,
    },
};
use thiserror::Error;

pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

/// Failure reported by a remote ledger or wallet call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("user declined the signature request")]
    UserDeclined,
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),
    #[error("wrong network: expected chain {expected}, connected to {actual}")]
    WrongNetwork { expected: u64, actual: u64 },
    #[error("execution reverted: {0}")]
    Reverted(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("request timed out")]
    Timeout,
    #[error("malformed ledger response: {0}")]
    Decode(String),
}

impl LedgerError {
    /// Transport-level failures, as opposed to answers from the ledger itself.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            LedgerError::Transport(_) | LedgerError::Timeout | LedgerError::Decode(_)
        )
    }
}

/// Scalar contract field read by the game state store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GameField {
    EntryPrice,
    Started,
    Ended,
    HomeDigit,
    AwayDigit,
    Admin,
}

impl std::fmt::Display for GameField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            GameField::EntryPrice => "entryPrice",
            GameField::Started => "gameStarted",
            GameField::Ended => "gameEnded",
            GameField::HomeDigit => "homeScoreLastDigit",
            GameField::AwayDigit => "awayScoreLastDigit",
            GameField::Admin => "owner",
        };
        f.write_str(name)
    }
}

/// A field that could not be read during a refresh; it keeps its previous value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to read {field}: {error}")]
pub struct FieldReadError {
    pub field: GameField,
    pub error: LedgerError,
}

/// A local precondition that failed before anything was sent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("wallet is not connected")]
    WalletNotConnected,
    #[error("no square selected")]
    NothingSelected,
    #[error("square {0} is already owned")]
    SquareAlreadyOwned(SquareIndex),
    #[error("the round has ended; squares can no longer be bought")]
    RoundEnded,
    #[error("admin address has not been loaded yet")]
    AdminUnknown,
    #[error("{caller} is not the game admin")]
    NotAdmin { caller: Address },
}

/// Classified outcome of a failed transaction attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TxError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("a {0} transaction is already in flight")]
    InFlightConflict(ActionKind),
    #[error("signature request was declined")]
    UserDeclined,
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),
    #[error("wrong network: switch to chain {expected} (wallet is on {actual})")]
    WrongNetwork { expected: u64, actual: u64 },
    #[error("{0}")]
    RemoteRevert(String),
    #[error("network error: {0}")]
    Transport(String),
    #[error("timed out waiting for the ledger")]
    Timeout,
}

impl TxError {
    /// Only transport failures and timeouts are worth resubmitting unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TxError::Transport(_) | TxError::Timeout)
    }

    /// Declined signatures are the user's own choice and are not reported back.
    pub fn is_silent(&self) -> bool {
        matches!(self, TxError::UserDeclined)
    }

    /// Message for the player, or `None` when nothing should be shown.
    pub fn user_message(&self) -> Option<String> {
        match self {
            TxError::UserDeclined => None,
            TxError::InsufficientFunds(_) => {
                Some("Insufficient funds to cover the entry price".to_string())
            }
            TxError::WrongNetwork { .. } => {
                Some("Please switch your wallet to the game's network".to_string())
            }
            TxError::Transport(_) | TxError::Timeout => {
                Some(format!("{self}. Please try again."))
            }
            other => Some(other.to_string()),
        }
    }
}

/// First failed sub-step of a compound admin operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{} failed after {} completed step(s): {error}", .step.function_name(), .completed.len())]
pub struct StepFailure {
    pub step: LedgerCall,
    pub completed: Vec<LedgerCall>,
    pub error: TxError,
}

impl From<LedgerError> for TxError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::UserDeclined => TxError::UserDeclined,
            LedgerError::InsufficientFunds(msg) => TxError::InsufficientFunds(msg),
            LedgerError::WrongNetwork { expected, actual } => {
                TxError::WrongNetwork { expected, actual }
            }
            LedgerError::Reverted(reason) => TxError::RemoteRevert(reason),
            LedgerError::Transport(msg) => TxError::Transport(msg),
            LedgerError::Decode(msg) => TxError::Transport(msg),
            LedgerError::Timeout => TxError::Timeout,
        }
    }
}
