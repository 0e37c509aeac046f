//! The canonical cache: both stores plus the snapshot derived from them.
//!
//! Every mutation goes through a refresh gate, so refresh cycles (poller ticks and
//! forced refreshes after confirmations) never interleave. Readers only ever see
//! published [`SyncSnapshot`]s, which are immutable.

use crate::{
    derive::derive,
    error::{
        FieldReadError,
        LedgerError,
    },
    game_state::GameStateStore,
    ledger::RemoteLedger,
    squares::SquareOwnershipCache,
    types::{
        DerivedSnapshot,
        GameState,
        OwnershipTable,
    },
};
use chrono::{
    DateTime,
    Utc,
};
use std::sync::Arc;
use tokio::sync::{
    Mutex,
    watch,
};
use tracing::debug;

/// Game state, ownership table and derived values that belong together.
#[derive(Clone, Debug)]
pub struct SyncSnapshot {
    pub game: GameState,
    pub squares: Arc<OwnershipTable>,
    pub derived: DerivedSnapshot,
    /// Number of publishes so far; 0 before the first refresh.
    pub cycle: u64,
    pub refreshed_at: Option<DateTime<Utc>>,
}

impl SyncSnapshot {
    fn initial() -> Self {
        let game = GameState::default();
        let squares = Arc::new(OwnershipTable::empty());
        let derived = derive(&game, &squares);
        Self {
            game,
            squares,
            derived,
            cycle: 0,
            refreshed_at: None,
        }
    }
}

/// What went wrong during a refresh cycle. Failures are never fatal.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub cycle: u64,
    pub field_errors: Vec<FieldReadError>,
    pub squares_error: Option<LedgerError>,
    /// Set when every read in the cycle failed at the transport level.
    pub transport_down: bool,
}

impl RefreshReport {
    pub fn is_clean(&self) -> bool {
        self.field_errors.is_empty() && self.squares_error.is_none()
    }
}

pub struct GameSync<L> {
    ledger: Arc<L>,
    game_state: GameStateStore<L>,
    squares: SquareOwnershipCache<L>,
    snapshot_tx: watch::Sender<Arc<SyncSnapshot>>,
    refresh_gate: Mutex<u64>,
}

impl<L: RemoteLedger> GameSync<L> {
    pub fn new(ledger: Arc<L>) -> Self {
        let (snapshot_tx, _) = watch::channel(Arc::new(SyncSnapshot::initial()));
        Self {
            game_state: GameStateStore::new(ledger.clone()),
            squares: SquareOwnershipCache::new(ledger.clone()),
            ledger,
            snapshot_tx,
            refresh_gate: Mutex::new(0),
        }
    }

    pub fn ledger(&self) -> &Arc<L> {
        &self.ledger
    }

    pub fn game_state(&self) -> &GameStateStore<L> {
        &self.game_state
    }

    pub fn squares(&self) -> &SquareOwnershipCache<L> {
        &self.squares
    }

    pub fn snapshot(&self) -> Arc<SyncSnapshot> {
        self.snapshot_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<SyncSnapshot>> {
        self.snapshot_tx.subscribe()
    }

    /// Refreshes both stores and publishes a new snapshot.
    pub async fn refresh_all(&self) -> RefreshReport {
        self.refresh_cycle_with(|| true)
            .await
            .unwrap_or_default()
    }

    /// Fetches both stores concurrently, then applies them only if `is_current` still
    /// holds once the reads have settled. Returns `None` when the results were
    /// discarded.
    pub async fn refresh_cycle_with(
        &self,
        is_current: impl Fn() -> bool,
    ) -> Option<RefreshReport> {
        let mut cycle = self.refresh_gate.lock().await;
        if !is_current() {
            return None;
        }
        let (reading, table) = tokio::join!(self.game_state.fetch(), self.squares.fetch());
        if !is_current() {
            debug!("discarding refresh results from a cancelled cycle");
            return None;
        }
        let transport_down = reading.all_failed_in_transport()
            && table.as_ref().err().is_some_and(LedgerError::is_transport);
        let field_errors = self.game_state.apply(reading);
        let squares_error = match table {
            Ok(table) => {
                self.squares.apply(table);
                None
            }
            Err(err) => Some(err),
        };
        let report = RefreshReport {
            cycle: self.publish(&mut cycle),
            field_errors,
            squares_error,
            transport_down,
        };
        Some(report)
    }

    /// Refreshes only the ownership table, then republishes.
    pub async fn refresh_squares(&self) -> Result<(), LedgerError> {
        let mut cycle = self.refresh_gate.lock().await;
        let result = self.squares.refresh().await;
        self.publish(&mut cycle);
        result
    }

    /// Refreshes only the scalar fields, then republishes.
    pub async fn refresh_game_state(&self) -> Vec<FieldReadError> {
        let mut cycle = self.refresh_gate.lock().await;
        let errors = self.game_state.refresh().await;
        self.publish(&mut cycle);
        errors
    }

    fn publish(&self, cycle: &mut u64) -> u64 {
        *cycle += 1;
        let game = self.game_state.get();
        let squares = self.squares.table();
        let derived = derive(&game, &squares);
        debug!(
            cycle = *cycle,
            sold = derived.total_sold,
            pool = %derived.prize_pool,
            "publishing snapshot"
        );
        self.snapshot_tx.send_replace(Arc::new(SyncSnapshot {
            game,
            squares,
            derived,
            cycle: *cycle,
            refreshed_at: Some(Utc::now()),
        }));
        *cycle
    }
}
