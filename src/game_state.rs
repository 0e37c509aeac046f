//! Cached scalar fields of the squares contract.

use crate::{
    error::{
        FieldReadError,
        GameField,
        LedgerError,
        LedgerResult,
    },
    ledger::RemoteLedger,
    types::{
        Address,
        Amount,
        GRID_SIDE,
        GameState,
    },
};
use std::sync::{
    Arc,
    Mutex,
    PoisonError,
};
use tracing::warn;

/// Raw results of one round of scalar reads, before they are merged into the cache.
#[derive(Debug, Clone)]
pub struct GameStateReading {
    pub entry_price: LedgerResult<Amount>,
    pub started: LedgerResult<bool>,
    pub ended: LedgerResult<bool>,
    pub home_digit: LedgerResult<u64>,
    pub away_digit: LedgerResult<u64>,
    pub admin: LedgerResult<Address>,
}

impl GameStateReading {
    /// True when every read failed at the transport level.
    pub fn all_failed_in_transport(&self) -> bool {
        [
            self.entry_price.as_ref().err(),
            self.started.as_ref().err(),
            self.ended.as_ref().err(),
            self.home_digit.as_ref().err(),
            self.away_digit.as_ref().err(),
            self.admin.as_ref().err(),
        ]
        .into_iter()
        .all(|err| err.is_some_and(LedgerError::is_transport))
    }
}

pub struct GameStateStore<L> {
    ledger: Arc<L>,
    current: Mutex<GameState>,
}

impl<L: RemoteLedger> GameStateStore<L> {
    pub fn new(ledger: Arc<L>) -> Self {
        Self {
            ledger,
            current: Mutex::new(GameState::default()),
        }
    }

    /// Last applied state. Never touches the ledger.
    pub fn get(&self) -> GameState {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Issues all six reads concurrently.
    pub async fn fetch(&self) -> GameStateReading {
        let ledger = &self.ledger;
        let (entry_price, started, ended, home_digit, away_digit, admin) = tokio::join!(
            ledger.entry_price(),
            ledger.game_started(),
            ledger.game_ended(),
            ledger.home_score_last_digit(),
            ledger.away_score_last_digit(),
            ledger.owner(),
        );
        GameStateReading {
            entry_price,
            started,
            ended,
            home_digit,
            away_digit,
            admin,
        }
    }

    /// Merges a reading into the cache in one swap. Failed fields keep their previous
    /// value and are returned to the caller.
    pub(crate) fn apply(&self, reading: GameStateReading) -> Vec<FieldReadError> {
        let mut errors = Vec::new();
        let mut guard = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = &*guard;

        let entry_price = take(GameField::EntryPrice, reading.entry_price, &mut errors)
            .unwrap_or(previous.entry_price);
        let started =
            take(GameField::Started, reading.started, &mut errors).unwrap_or(previous.started);
        let ended = take(GameField::Ended, reading.ended, &mut errors).unwrap_or(previous.ended);
        let admin = take(GameField::Admin, reading.admin, &mut errors).or(previous.admin);
        let home_digit = digit(GameField::HomeDigit, reading.home_digit, &mut errors);
        let away_digit = digit(GameField::AwayDigit, reading.away_digit, &mut errors);

        let next = GameState {
            entry_price,
            started,
            ended,
            home_digit: if ended {
                home_digit.or(previous.home_digit)
            } else {
                None
            },
            away_digit: if ended {
                away_digit.or(previous.away_digit)
            } else {
                None
            },
            admin,
        };
        *guard = next;
        errors
    }

    pub(crate) async fn refresh(&self) -> Vec<FieldReadError> {
        let reading = self.fetch().await;
        self.apply(reading)
    }
}

fn take<T>(
    field: GameField,
    result: LedgerResult<T>,
    errors: &mut Vec<FieldReadError>,
) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(error) => {
            warn!(%field, ?error, "game state field read failed");
            errors.push(FieldReadError { field, error });
            None
        }
    }
}

fn digit(
    field: GameField,
    result: LedgerResult<u64>,
    errors: &mut Vec<FieldReadError>,
) -> Option<u8> {
    let checked = result.and_then(|value| {
        u8::try_from(value)
            .ok()
            .filter(|digit| *digit < GRID_SIDE)
            .ok_or_else(|| {
                LedgerError::Decode(format!("score digit {value} is not a single digit"))
            })
    });
    take(field, checked, errors)
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::{
        ledger::{
            LedgerCall,
            simulated::SimulatedLedger,
        },
        types::SquareIndex,
    };

    const CHAIN_ID: u64 = 11_155_111;

    fn admin() -> Address {
        Address::new([0x01; 20])
    }

    fn price() -> Amount {
        Amount::from_ether("0.1").unwrap()
    }

    #[tokio::test]
    async fn refresh__reads_all_fields_from_ledger() {
        // given
        let ledger = Arc::new(SimulatedLedger::new(admin(), price(), CHAIN_ID));
        ledger.execute(admin(), LedgerCall::StartGame);
        let store = GameStateStore::new(ledger.clone());

        // when
        let errors = store.refresh().await;

        // then
        assert!(errors.is_empty());
        let state = store.get();
        assert_eq!(state.entry_price, price());
        assert!(state.started);
        assert!(!state.ended);
        assert_eq!(state.admin, Some(admin()));
        assert_eq!(state.home_digit, None);
    }

    #[tokio::test]
    async fn refresh__failed_field_keeps_last_known_value() {
        // given
        let ledger = Arc::new(SimulatedLedger::new(admin(), price(), CHAIN_ID));
        let store = GameStateStore::new(ledger.clone());
        store.refresh().await;
        ledger.execute(admin(), LedgerCall::StartGame);
        ledger.fail_function("gameStarted", 1);

        // when
        let errors = store.refresh().await;

        // then
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, GameField::Started);
        let state = store.get();
        assert!(!state.started);
        assert_eq!(state.admin, Some(admin()));
    }

    #[tokio::test]
    async fn refresh__digits_only_defined_after_round_ended() {
        // given
        let ledger = Arc::new(SimulatedLedger::new(admin(), price(), CHAIN_ID));
        let player = Address::new([0xAA; 20]);
        ledger.fund(player, Amount::from_ether("1").unwrap());
        ledger.execute(admin(), LedgerCall::StartGame);
        ledger.execute(player, LedgerCall::BuySquare {
            index: SquareIndex::new(53).unwrap(),
            value: price(),
        });
        let store = GameStateStore::new(ledger.clone());
        store.refresh().await;
        assert_eq!(store.get().home_digit, None);
        ledger.execute(admin(), LedgerCall::EndGame {
            home_score: 15,
            away_score: 23,
        });

        // when
        store.refresh().await;

        // then
        let state = store.get();
        assert!(state.ended);
        assert_eq!(state.home_digit, Some(5));
        assert_eq!(state.away_digit, Some(3));
    }

    #[test]
    fn apply__out_of_range_digit_is_reported() {
        // given
        let ledger = Arc::new(SimulatedLedger::new(admin(), price(), CHAIN_ID));
        let store = GameStateStore::new(ledger);
        let reading = GameStateReading {
            entry_price: Ok(price()),
            started: Ok(true),
            ended: Ok(true),
            home_digit: Ok(12),
            away_digit: Ok(3),
            admin: Ok(admin()),
        };

        // when
        let errors = store.apply(reading);

        // then
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, GameField::HomeDigit);
        assert_eq!(store.get().home_digit, None);
        assert_eq!(store.get().away_digit, Some(3));
    }
}
