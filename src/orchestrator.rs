//! Submission and confirmation of state-changing contract calls.
//!
//! Each [`ActionKind`] owns one slot. A slot moves
//! `Idle -> Submitting -> Pending(hash) -> Confirmed | Failed -> Idle`, and a second
//! submission for a kind whose slot is busy is refused before anything reaches the
//! wallet or the ledger.

use crate::{
    error::{
        StepFailure,
        TxError,
        ValidationError,
    },
    ledger::{
        LedgerCall,
        Receipt,
        ReceiptStatus,
        RemoteLedger,
        WalletSession,
    },
    sync::GameSync,
    types::{
        Address,
        GameState,
        OwnershipTable,
        SquareIndex,
        TxId,
    },
};
use chrono::{
    DateTime,
    Utc,
};
use serde::Serialize;
use std::{
    collections::{
        BTreeSet,
        HashMap,
        VecDeque,
    },
    fmt,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
    },
    time::Duration,
};
use tracing::{
    debug,
    error,
    info,
    warn,
};

const HISTORY_LIMIT: usize = 50;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum ActionKind {
    Purchase,
    StartGame,
    EndGame,
    ForceReset,
}

impl ActionKind {
    pub const ALL: [ActionKind; 4] = [
        ActionKind::Purchase,
        ActionKind::StartGame,
        ActionKind::EndGame,
        ActionKind::ForceReset,
    ];
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ActionKind::Purchase => "purchase",
            ActionKind::StartGame => "start game",
            ActionKind::EndGame => "end game",
            ActionKind::ForceReset => "force reset",
        };
        f.write_str(label)
    }
}

/// Where a kind's slot currently is.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TxPhase {
    Idle,
    Submitting,
    Pending(TxId),
    Confirmed(TxId),
    Failed(TxError),
}

impl TxPhase {
    pub fn is_idle(&self) -> bool {
        matches!(self, TxPhase::Idle)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TxStatus {
    Submitting,
    Pending,
    Confirmed,
    Failed(TxError),
}

/// Record of one submission attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingTransaction {
    pub kind: ActionKind,
    pub call: Option<LedgerCall>,
    /// Absent when the call never reached the ledger.
    pub hash: Option<TxId>,
    pub submitted_at: DateTime<Utc>,
    pub status: TxStatus,
}

/// A user-facing action before local validation has turned it into a contract call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxRequest {
    /// Buys the lowest selected square.
    Purchase,
    StartGame,
    EndGame { home_score: u32, away_score: u32 },
    ForceReset,
    ResetGame,
}

impl TxRequest {
    pub fn kind(&self) -> ActionKind {
        match self {
            TxRequest::Purchase => ActionKind::Purchase,
            TxRequest::StartGame => ActionKind::StartGame,
            TxRequest::EndGame { .. } => ActionKind::EndGame,
            TxRequest::ForceReset | TxRequest::ResetGame => ActionKind::ForceReset,
        }
    }

    fn admin_call(&self) -> Option<LedgerCall> {
        match *self {
            TxRequest::Purchase => None,
            TxRequest::StartGame => Some(LedgerCall::StartGame),
            TxRequest::EndGame {
                home_score,
                away_score,
            } => Some(LedgerCall::EndGame {
                home_score,
                away_score,
            }),
            TxRequest::ForceReset => Some(LedgerCall::ForceReset),
            TxRequest::ResetGame => Some(LedgerCall::ResetGame),
        }
    }
}

/// Squares the player has picked but not bought yet.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SquareSelection(BTreeSet<SquareIndex>);

impl SquareSelection {
    /// Selects or deselects `index`, returning whether it is now selected. Owned
    /// squares and squares of an ended round cannot be selected.
    pub fn toggle(
        &mut self,
        index: SquareIndex,
        game: &GameState,
        squares: &OwnershipTable,
    ) -> Result<bool, ValidationError> {
        if self.0.remove(&index) {
            return Ok(false);
        }
        if game.ended {
            return Err(ValidationError::RoundEnded);
        }
        if squares.is_owned(index) {
            return Err(ValidationError::SquareAlreadyOwned(index));
        }
        self.0.insert(index);
        Ok(true)
    }

    pub fn lowest(&self) -> Option<SquareIndex> {
        self.0.first().copied()
    }

    pub fn contains(&self, index: SquareIndex) -> bool {
        self.0.contains(&index)
    }

    pub fn iter(&self) -> impl Iterator<Item = SquareIndex> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }
}

/// Steps that take the board from its current phase to a freshly started round.
pub fn round_restart_plan(game: &GameState) -> Vec<LedgerCall> {
    match (game.started, game.ended) {
        (_, true) => vec![LedgerCall::ResetGame, LedgerCall::StartGame],
        (true, false) => vec![LedgerCall::ForceReset, LedgerCall::StartGame],
        (false, false) => vec![LedgerCall::StartGame],
    }
}

pub struct TransactionOrchestrator<L, W> {
    sync: Arc<GameSync<L>>,
    wallet: Arc<W>,
    expected_chain_id: u64,
    receipt_timeout: Duration,
    slots: Mutex<HashMap<ActionKind, TxPhase>>,
    selection: Mutex<SquareSelection>,
    history: Mutex<VecDeque<PendingTransaction>>,
}

/// Holds a kind's slot; dropping it returns the slot to `Idle`.
struct SlotGuard<'a> {
    slots: &'a Mutex<HashMap<ActionKind, TxPhase>>,
    kind: ActionKind,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        lock(self.slots).remove(&self.kind);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<L, W> TransactionOrchestrator<L, W>
where
    L: RemoteLedger,
    W: WalletSession,
{
    pub fn new(
        sync: Arc<GameSync<L>>,
        wallet: Arc<W>,
        expected_chain_id: u64,
        receipt_timeout: Duration,
    ) -> Self {
        Self {
            sync,
            wallet,
            expected_chain_id,
            receipt_timeout,
            slots: Mutex::new(HashMap::new()),
            selection: Mutex::new(SquareSelection::default()),
            history: Mutex::new(VecDeque::new()),
        }
    }

    pub fn phase(&self, kind: ActionKind) -> TxPhase {
        lock(&self.slots).get(&kind).cloned().unwrap_or(TxPhase::Idle)
    }

    /// Finished attempts, newest first.
    pub fn history(&self) -> Vec<PendingTransaction> {
        lock(&self.history).iter().cloned().collect()
    }

    pub fn selection(&self) -> SquareSelection {
        lock(&self.selection).clone()
    }

    /// Toggles `index` in the selection against the latest snapshot.
    pub fn toggle_square(&self, index: SquareIndex) -> Result<bool, ValidationError> {
        let snapshot = self.sync.snapshot();
        lock(&self.selection).toggle(index, &snapshot.game, &snapshot.squares)
    }

    pub fn clear_selection(&self) {
        lock(&self.selection).clear();
    }

    pub async fn purchase_selected(&self) -> Result<Receipt, TxError> {
        self.submit(TxRequest::Purchase).await
    }

    pub async fn start_game(&self) -> Result<Receipt, TxError> {
        self.submit(TxRequest::StartGame).await
    }

    pub async fn end_game(&self, home_score: u32, away_score: u32) -> Result<Receipt, TxError> {
        self.submit(TxRequest::EndGame {
            home_score,
            away_score,
        })
        .await
    }

    pub async fn force_reset(&self) -> Result<Receipt, TxError> {
        self.submit(TxRequest::ForceReset).await
    }

    pub async fn reset_game(&self) -> Result<Receipt, TxError> {
        self.submit(TxRequest::ResetGame).await
    }

    /// Validates, submits and waits for `request` to be confirmed or to fail. The
    /// slot for its kind is back to `Idle` when this returns.
    pub async fn submit(&self, request: TxRequest) -> Result<Receipt, TxError> {
        let kind = request.kind();
        let _slot = self.claim(kind)?;
        let submitted_at = Utc::now();
        let prepared = match request.admin_call() {
            Some(call) => self.prepare_admin(call),
            None => self.prepare_purchase().await,
        };
        match prepared {
            Ok((from, call)) => self.execute(kind, from, call).await,
            Err(err) => {
                debug!(%kind, ?err, "transaction rejected locally");
                self.record(kind, None, None, submitted_at, TxStatus::Failed(err.clone()));
                Err(err)
            }
        }
    }

    /// Starts a fresh round from whatever phase the cached state is in, confirming
    /// each step before issuing the next. Holds the start-game slot throughout.
    pub async fn start_new_round(&self) -> Result<Vec<Receipt>, StepFailure> {
        let plan = round_restart_plan(&self.sync.snapshot().game);
        let fail = |step: &LedgerCall, completed: &[LedgerCall], error: TxError| StepFailure {
            step: step.clone(),
            completed: completed.to_vec(),
            error,
        };
        let first = plan.first().cloned().unwrap_or(LedgerCall::StartGame);
        let _slot = self
            .claim(ActionKind::StartGame)
            .map_err(|error| fail(&first, &[], error))?;
        let steps: Vec<_> = plan.iter().map(LedgerCall::function_name).collect();
        info!(?steps, "starting a new round");

        let mut completed = Vec::new();
        let mut receipts = Vec::new();
        for step in plan {
            let kind = step.kind();
            let _step_slot = if kind == ActionKind::StartGame {
                None
            } else {
                Some(
                    self.claim(kind)
                        .map_err(|error| fail(&step, &completed, error))?,
                )
            };
            let result = match self.prepare_admin(step.clone()) {
                Ok((from, call)) => self.execute(kind, from, call).await,
                Err(err) => {
                    self.record(
                        kind,
                        Some(step.clone()),
                        None,
                        Utc::now(),
                        TxStatus::Failed(err.clone()),
                    );
                    Err(err)
                }
            };
            match result {
                Ok(receipt) => {
                    receipts.push(receipt);
                    completed.push(step);
                }
                Err(error) => {
                    warn!(step = step.function_name(), ?error, "new round aborted");
                    return Err(fail(&step, &completed, error));
                }
            }
        }
        Ok(receipts)
    }

    fn claim(&self, kind: ActionKind) -> Result<SlotGuard<'_>, TxError> {
        let mut slots = lock(&self.slots);
        if slots.contains_key(&kind) {
            debug!(%kind, "refusing duplicate submission");
            return Err(TxError::InFlightConflict(kind));
        }
        slots.insert(kind, TxPhase::Submitting);
        Ok(SlotGuard {
            slots: &self.slots,
            kind,
        })
    }

    fn set_phase(&self, kind: ActionKind, phase: TxPhase) {
        lock(&self.slots).insert(kind, phase);
    }

    fn connected_account(&self) -> Result<Address, TxError> {
        let address = self
            .wallet
            .current_address()
            .ok_or(ValidationError::WalletNotConnected)?;
        let chain_id = self
            .wallet
            .current_chain_id()
            .ok_or(ValidationError::WalletNotConnected)?;
        if chain_id != self.expected_chain_id {
            return Err(TxError::WrongNetwork {
                expected: self.expected_chain_id,
                actual: chain_id,
            });
        }
        Ok(address)
    }

    fn prepare_admin(&self, call: LedgerCall) -> Result<(Address, LedgerCall), TxError> {
        let from = self.connected_account()?;
        let admin = self
            .sync
            .snapshot()
            .game
            .admin
            .ok_or(ValidationError::AdminUnknown)?;
        if admin != from {
            return Err(ValidationError::NotAdmin { caller: from }.into());
        }
        Ok((from, call))
    }

    async fn prepare_purchase(&self) -> Result<(Address, LedgerCall), TxError> {
        let from = self.connected_account()?;
        let index = lock(&self.selection)
            .lowest()
            .ok_or(ValidationError::NothingSelected)?;
        let snapshot = self.sync.snapshot();
        if snapshot.game.ended {
            return Err(ValidationError::RoundEnded.into());
        }
        if snapshot.squares.is_owned(index) {
            return Err(ValidationError::SquareAlreadyOwned(index).into());
        }
        let price = snapshot.game.entry_price;
        let balance = self.wallet.balance_of(from).await?;
        if balance < price {
            return Err(TxError::InsufficientFunds(format!(
                "balance {balance} is below the entry price {price}"
            )));
        }
        Ok((from, LedgerCall::BuySquare {
            index,
            value: price,
        }))
    }

    async fn execute(
        &self,
        kind: ActionKind,
        from: Address,
        call: LedgerCall,
    ) -> Result<Receipt, TxError> {
        let ledger = self.sync.ledger();
        let submitted_at = Utc::now();
        let hash = match ledger.send(from, call.clone()).await {
            Ok(hash) => hash,
            Err(err) => {
                let err = TxError::from(err);
                self.report_failure(kind, &err);
                self.record(kind, Some(call), None, submitted_at, TxStatus::Failed(err.clone()));
                return Err(err);
            }
        };
        info!(%kind, %hash, function = call.function_name(), "transaction submitted");
        self.set_phase(kind, TxPhase::Pending(hash));

        let outcome =
            match tokio::time::timeout(self.receipt_timeout, ledger.wait_for_receipt(hash))
                .await
            {
                Err(_) => Err(TxError::Timeout),
                Ok(Err(err)) => Err(err.into()),
                Ok(Ok(receipt)) => match &receipt.status {
                    ReceiptStatus::Success => Ok(receipt),
                    ReceiptStatus::Reverted(reason) => {
                        Err(TxError::RemoteRevert(reason.clone()))
                    }
                },
            };

        match outcome {
            Ok(receipt) => {
                info!(%kind, %hash, block = receipt.block_number, "transaction confirmed");
                self.set_phase(kind, TxPhase::Confirmed(hash));
                self.after_confirmation(kind).await;
                self.record(kind, Some(call), Some(hash), submitted_at, TxStatus::Confirmed);
                Ok(receipt)
            }
            Err(err) => {
                self.report_failure(kind, &err);
                self.set_phase(kind, TxPhase::Failed(err.clone()));
                self.record(
                    kind,
                    Some(call),
                    Some(hash),
                    submitted_at,
                    TxStatus::Failed(err.clone()),
                );
                Err(err)
            }
        }
    }

    /// Purchases refresh the ownership table before the scalar fields, so the sold
    /// count never runs ahead of the table.
    async fn after_confirmation(&self, kind: ActionKind) {
        match kind {
            ActionKind::Purchase => {
                self.clear_selection();
                if let Err(err) = self.sync.refresh_squares().await {
                    warn!(?err, "square refresh after purchase failed");
                }
                let errors = self.sync.refresh_game_state().await;
                if !errors.is_empty() {
                    warn!(failed = errors.len(), "game state refresh after purchase was partial");
                }
            }
            _ => {
                let report = self.sync.refresh_all().await;
                if !report.is_clean() {
                    warn!(?report, "refresh after confirmation was partial");
                }
            }
        }
    }

    fn report_failure(&self, kind: ActionKind, err: &TxError) {
        if err.is_silent() {
            debug!(%kind, "signature request declined");
        } else {
            error!(%kind, ?err, "transaction failed");
        }
    }

    fn record(
        &self,
        kind: ActionKind,
        call: Option<LedgerCall>,
        hash: Option<TxId>,
        submitted_at: DateTime<Utc>,
        status: TxStatus,
    ) {
        let mut history = lock(&self.history);
        history.push_front(PendingTransaction {
            kind,
            call,
            hash,
            submitted_at,
            status,
        });
        history.truncate(HISTORY_LIMIT);
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::{
        error::LedgerError,
        ledger::simulated::{
            SimulatedLedger,
            SimulatedWallet,
        },
        types::Amount,
    };

    const CHAIN_ID: u64 = 11_155_111;

    struct Fixture {
        ledger: Arc<SimulatedLedger>,
        sync: Arc<GameSync<SimulatedLedger>>,
    }

    impl Fixture {
        async fn new(started: bool) -> Self {
            let ledger = Arc::new(SimulatedLedger::new(admin(), price(), CHAIN_ID));
            ledger.fund(alice(), Amount::from_ether("1").unwrap());
            if started {
                ledger.execute(admin(), LedgerCall::StartGame);
            }
            let sync = Arc::new(GameSync::new(ledger.clone()));
            sync.refresh_all().await;
            Self { ledger, sync }
        }

        fn orchestrator(
            &self,
            wallet: SimulatedWallet,
        ) -> TransactionOrchestrator<SimulatedLedger, SimulatedWallet> {
            TransactionOrchestrator::new(
                self.sync.clone(),
                Arc::new(wallet),
                CHAIN_ID,
                Duration::from_secs(30),
            )
        }

        fn wallet(&self, address: Address) -> SimulatedWallet {
            SimulatedWallet::connected(self.ledger.clone(), address)
        }
    }

    fn admin() -> Address {
        Address::new([0x01; 20])
    }

    fn alice() -> Address {
        Address::new([0xAA; 20])
    }

    fn price() -> Amount {
        Amount::from_ether("0.1").unwrap()
    }

    fn square(index: u8) -> SquareIndex {
        SquareIndex::new(index).unwrap()
    }

    #[tokio::test]
    async fn purchase_selected__confirms_and_refreshes_cache() {
        // given
        let fixture = Fixture::new(true).await;
        let orchestrator = fixture.orchestrator(fixture.wallet(alice()));
        orchestrator.toggle_square(square(47)).unwrap();
        orchestrator.toggle_square(square(12)).unwrap();

        // when
        let receipt = orchestrator.purchase_selected().await.unwrap();

        // then
        assert_eq!(receipt.status, ReceiptStatus::Success);
        let snapshot = fixture.sync.snapshot();
        assert_eq!(snapshot.squares.owner_of(square(12)), Some(alice()));
        assert_eq!(snapshot.derived.total_sold, 1);
        assert!(orchestrator.selection().is_empty());
        assert_eq!(orchestrator.phase(ActionKind::Purchase), TxPhase::Idle);
        assert_eq!(orchestrator.history()[0].status, TxStatus::Confirmed);
    }

    #[tokio::test(start_paused = true)]
    async fn purchase_selected__ownership_table_is_published_before_game_state() {
        // given
        let fixture = Fixture::new(true).await;
        let orchestrator = fixture.orchestrator(fixture.wallet(alice()));
        orchestrator.toggle_square(square(12)).unwrap();
        fixture.ledger.set_read_latency(Duration::from_millis(10));
        let mut rx = fixture.sync.subscribe();
        let _ = rx.borrow_and_update();
        let observed = tokio::spawn(async move {
            let mut owners = Vec::new();
            while owners.len() < 2 && rx.changed().await.is_ok() {
                let snapshot = rx.borrow_and_update().clone();
                owners.push(snapshot.squares.owner_of(square(12)));
            }
            owners
        });

        // when
        orchestrator.purchase_selected().await.unwrap();

        // then
        assert_eq!(observed.await.unwrap(), vec![Some(alice()), Some(alice())]);
        assert!(orchestrator.selection().is_empty());
    }

    #[tokio::test]
    async fn history__keeps_submission_time_rather_than_confirmation_time() {
        // given
        let fixture = Fixture::new(false).await;
        let orchestrator = Arc::new(fixture.orchestrator(fixture.wallet(admin())));
        fixture.ledger.hold_blocks();
        let before_submit = Utc::now();
        let pending = tokio::spawn({
            let orchestrator = orchestrator.clone();
            async move { orchestrator.start_game().await }
        });
        while !matches!(orchestrator.phase(ActionKind::StartGame), TxPhase::Pending(_)) {
            tokio::task::yield_now().await;
        }
        let submitted_by = Utc::now();
        std::thread::sleep(std::time::Duration::from_millis(50));

        // when
        fixture.ledger.release_blocks();
        pending.await.unwrap().unwrap();

        // then
        let tx = &orchestrator.history()[0];
        assert_eq!(tx.status, TxStatus::Confirmed);
        assert!(tx.submitted_at >= before_submit);
        assert!(tx.submitted_at <= submitted_by);
    }

    #[tokio::test]
    async fn submit__second_submission_while_pending_is_refused_without_remote_call() {
        // given
        let fixture = Fixture::new(true).await;
        let orchestrator = Arc::new(fixture.orchestrator(fixture.wallet(admin())));
        fixture.ledger.hold_blocks();
        let first = tokio::spawn({
            let orchestrator = orchestrator.clone();
            async move { orchestrator.end_game(21, 14).await }
        });
        while !matches!(orchestrator.phase(ActionKind::EndGame), TxPhase::Pending(_)) {
            tokio::task::yield_now().await;
        }
        let sends_before = fixture.ledger.counters().sends;

        // when
        let second = orchestrator.end_game(21, 14).await;

        // then
        assert_eq!(second, Err(TxError::InFlightConflict(ActionKind::EndGame)));
        assert_eq!(fixture.ledger.counters().sends, sends_before);
        fixture.ledger.release_blocks();
        let first = first.await.unwrap();
        assert!(matches!(first, Err(TxError::RemoteRevert(_))));
        assert_eq!(orchestrator.phase(ActionKind::EndGame), TxPhase::Idle);
    }

    #[tokio::test]
    async fn purchase_selected__balance_below_price_is_rejected_locally() {
        // given
        let fixture = Fixture::new(true).await;
        let broke = Address::new([0xBB; 20]);
        fixture
            .ledger
            .fund(broke, Amount::from_ether("0.05").unwrap());
        let orchestrator = fixture.orchestrator(fixture.wallet(broke));
        orchestrator.toggle_square(square(5)).unwrap();

        // when
        let result = orchestrator.purchase_selected().await;

        // then
        assert!(matches!(result, Err(TxError::InsufficientFunds(_))));
        assert_eq!(fixture.ledger.counters().sends, 0);
        assert_eq!(orchestrator.phase(ActionKind::Purchase), TxPhase::Idle);
    }

    #[tokio::test]
    async fn purchase_selected__without_selection_is_a_validation_error() {
        let fixture = Fixture::new(true).await;
        let orchestrator = fixture.orchestrator(fixture.wallet(alice()));

        let result = orchestrator.purchase_selected().await;

        assert_eq!(
            result,
            Err(TxError::Validation(ValidationError::NothingSelected))
        );
        assert_eq!(fixture.ledger.counters().sends, 0);
    }

    #[tokio::test]
    async fn submit__wallet_on_wrong_chain_is_rejected_locally() {
        // given
        let fixture = Fixture::new(true).await;
        let orchestrator = fixture.orchestrator(fixture.wallet(admin()).on_chain(1));

        // when
        let result = orchestrator.end_game(3, 7).await;

        // then
        assert_eq!(
            result,
            Err(TxError::WrongNetwork {
                expected: CHAIN_ID,
                actual: 1
            })
        );
        assert_eq!(fixture.ledger.counters().sends, 0);
    }

    #[tokio::test]
    async fn submit__disconnected_wallet_is_rejected_locally() {
        let fixture = Fixture::new(true).await;
        let orchestrator =
            fixture.orchestrator(SimulatedWallet::disconnected(fixture.ledger.clone()));

        let result = orchestrator.start_game().await;

        assert_eq!(
            result,
            Err(TxError::Validation(ValidationError::WalletNotConnected))
        );
    }

    #[tokio::test]
    async fn submit__admin_action_from_player_is_rejected_locally() {
        let fixture = Fixture::new(false).await;
        let orchestrator = fixture.orchestrator(fixture.wallet(alice()));

        let result = orchestrator.start_game().await;

        assert_eq!(
            result,
            Err(TxError::Validation(ValidationError::NotAdmin { caller: alice() }))
        );
        assert_eq!(fixture.ledger.counters().sends, 0);
    }

    #[tokio::test]
    async fn end_game__unowned_winning_square_surfaces_no_winner_revert() {
        // given
        let fixture = Fixture::new(true).await;
        let orchestrator = fixture.orchestrator(fixture.wallet(admin()));

        // when
        let result = orchestrator.end_game(19, 29).await;

        // then
        assert_eq!(result, Err(TxError::RemoteRevert("no winner".into())));
        assert_eq!(orchestrator.phase(ActionKind::EndGame), TxPhase::Idle);
        assert!(!fixture.sync.snapshot().game.ended);
    }

    #[tokio::test]
    async fn submit__declined_signature_is_silent_and_not_retryable() {
        // given
        let fixture = Fixture::new(false).await;
        let orchestrator = fixture.orchestrator(fixture.wallet(admin()));
        fixture.ledger.fail_next_send(LedgerError::UserDeclined);

        // when
        let err = orchestrator.start_game().await.unwrap_err();

        // then
        assert_eq!(err, TxError::UserDeclined);
        assert!(err.is_silent());
        assert!(!err.is_retryable());
        assert_eq!(orchestrator.phase(ActionKind::StartGame), TxPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn submit__receipt_wait_is_bounded_by_timeout() {
        // given
        let fixture = Fixture::new(false).await;
        let orchestrator = fixture.orchestrator(fixture.wallet(admin()));
        fixture.ledger.hold_blocks();

        // when
        let result = orchestrator.start_game().await;

        // then
        assert_eq!(result, Err(TxError::Timeout));
        assert!(result.unwrap_err().is_retryable());
        assert_eq!(orchestrator.phase(ActionKind::StartGame), TxPhase::Idle);
    }

    #[tokio::test]
    async fn start_new_round__active_round_is_force_reset_before_start() {
        // given
        let fixture = Fixture::new(true).await;
        fixture.ledger.execute(alice(), LedgerCall::BuySquare {
            index: square(12),
            value: price(),
        });
        fixture.sync.refresh_all().await;
        let orchestrator = fixture.orchestrator(fixture.wallet(admin()));

        // when
        let receipts = orchestrator.start_new_round().await.unwrap();

        // then
        assert_eq!(receipts.len(), 2);
        let snapshot = fixture.sync.snapshot();
        assert!(snapshot.game.started);
        assert!(!snapshot.game.ended);
        assert_eq!(snapshot.derived.total_sold, 0);
        let calls: Vec<_> = orchestrator
            .history()
            .into_iter()
            .rev()
            .filter_map(|tx| tx.call)
            .collect();
        assert_eq!(calls, vec![LedgerCall::ForceReset, LedgerCall::StartGame]);
    }

    #[tokio::test]
    async fn start_new_round__aborts_on_first_failed_step() {
        // given
        let fixture = Fixture::new(true).await;
        let orchestrator = fixture.orchestrator(fixture.wallet(admin()));
        fixture
            .ledger
            .fail_next_send(LedgerError::Transport("connection reset".into()));

        // when
        let failure = orchestrator.start_new_round().await.unwrap_err();

        // then
        assert_eq!(failure.step, LedgerCall::ForceReset);
        assert!(failure.completed.is_empty());
        assert_eq!(failure.error, TxError::Transport("connection reset".into()));
        assert_eq!(fixture.ledger.counters().sends, 1);
        assert!(ActionKind::ALL
            .iter()
            .all(|kind| orchestrator.phase(*kind).is_idle()));
    }

    #[test]
    fn round_restart_plan__depends_on_round_phase() {
        let mut game = GameState::default();
        assert_eq!(round_restart_plan(&game), vec![LedgerCall::StartGame]);

        game.started = true;
        assert_eq!(round_restart_plan(&game), vec![
            LedgerCall::ForceReset,
            LedgerCall::StartGame
        ]);

        game.ended = true;
        assert_eq!(round_restart_plan(&game), vec![
            LedgerCall::ResetGame,
            LedgerCall::StartGame
        ]);
    }

    #[test]
    fn toggle__refuses_owned_squares_and_ended_rounds() {
        // given
        let mut selection = SquareSelection::default();
        let mut owners = vec![None; crate::types::GRID_SIZE];
        owners[12] = Some(alice());
        let squares = OwnershipTable::from_owners(owners).unwrap();
        let mut game = GameState {
            started: true,
            ..GameState::default()
        };

        // then
        assert_eq!(
            selection.toggle(square(12), &game, &squares),
            Err(ValidationError::SquareAlreadyOwned(square(12)))
        );
        assert_eq!(selection.toggle(square(13), &game, &squares), Ok(true));
        assert_eq!(selection.toggle(square(13), &game, &squares), Ok(false));
        game.ended = true;
        assert_eq!(
            selection.toggle(square(14), &game, &squares),
            Err(ValidationError::RoundEnded)
        );
    }
}
