//! Mirror of the 100-entry ownership table.

use crate::{
    error::{
        LedgerError,
        LedgerResult,
    },
    ledger::RemoteLedger,
    types::{
        Address,
        GRID_SIZE,
        OwnershipTable,
        SquareIndex,
    },
};
use std::sync::{
    Arc,
    Mutex,
    PoisonError,
};

pub struct SquareOwnershipCache<L> {
    ledger: Arc<L>,
    table: Mutex<Arc<OwnershipTable>>,
}

impl<L: RemoteLedger> SquareOwnershipCache<L> {
    pub fn new(ledger: Arc<L>) -> Self {
        Self {
            ledger,
            table: Mutex::new(Arc::new(OwnershipTable::empty())),
        }
    }

    /// Reads every square in one batched round-trip.
    pub async fn fetch(&self) -> LedgerResult<OwnershipTable> {
        let owners = self.ledger.squares().await?;
        let len = owners.len();
        OwnershipTable::from_owners(owners).ok_or_else(|| {
            LedgerError::Decode(format!("expected {GRID_SIZE} squares, ledger returned {len}"))
        })
    }

    pub(crate) fn apply(&self, table: OwnershipTable) {
        *self.table.lock().unwrap_or_else(PoisonError::into_inner) = Arc::new(table);
    }

    /// On failure the previous table is kept.
    pub(crate) async fn refresh(&self) -> LedgerResult<()> {
        let table = self.fetch().await?;
        self.apply(table);
        Ok(())
    }

    pub fn table(&self) -> Arc<OwnershipTable> {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn owner_of(&self, index: SquareIndex) -> Option<Address> {
        self.table().owner_of(index)
    }

    /// Squares owned by `address` according to the cached table.
    pub fn my_squares(&self, address: &Address) -> Vec<SquareIndex> {
        self.table().owned_by(address)
    }
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
        types::Amount,
    };

    fn admin() -> Address {
        Address::new([0x01; 20])
    }

    fn alice() -> Address {
        Address::new([0xAA; 20])
    }

    fn price() -> Amount {
        Amount::from_ether("0.1").unwrap()
    }

    fn ledger_with_purchases(indices: &[u8]) -> Arc<SimulatedLedger> {
        let ledger = Arc::new(SimulatedLedger::new(admin(), price(), 11_155_111));
        ledger.fund(alice(), Amount::from_ether("10").unwrap());
        ledger.execute(admin(), LedgerCall::StartGame);
        for index in indices {
            ledger.execute(alice(), LedgerCall::BuySquare {
                index: SquareIndex::new(*index).unwrap(),
                value: price(),
            });
        }
        ledger
    }

    #[tokio::test]
    async fn refresh__uses_a_single_batched_read() {
        // given
        let ledger = ledger_with_purchases(&[12, 47]);
        let cache = SquareOwnershipCache::new(ledger.clone());

        // when
        cache.refresh().await.unwrap();

        // then
        let counters = ledger.counters();
        assert_eq!(counters.batch_reads, 1);
        assert_eq!(counters.scalar_reads, 0);
        assert_eq!(cache.owner_of(SquareIndex::new(12).unwrap()), Some(alice()));
        assert_eq!(cache.owner_of(SquareIndex::new(13).unwrap()), None);
    }

    #[tokio::test]
    async fn my_squares__filters_the_cached_table() {
        // given
        let ledger = ledger_with_purchases(&[47, 12]);
        let cache = SquareOwnershipCache::new(ledger.clone());
        cache.refresh().await.unwrap();

        // when
        let mine = cache.my_squares(&alice());

        // then
        assert_eq!(mine, vec![
            SquareIndex::new(12).unwrap(),
            SquareIndex::new(47).unwrap()
        ]);
        assert!(cache.my_squares(&admin()).is_empty());
    }

    #[tokio::test]
    async fn refresh__failure_keeps_previous_table() {
        // given
        let ledger = ledger_with_purchases(&[12]);
        let cache = SquareOwnershipCache::new(ledger.clone());
        cache.refresh().await.unwrap();
        ledger.fail_next_reads(1);

        // when
        let result = cache.refresh().await;

        // then
        assert!(matches!(result, Err(LedgerError::Transport(_))));
        assert_eq!(cache.table().sold_count(), 1);
    }
}
