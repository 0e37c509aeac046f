use serde::{
    Deserialize,
    Serialize,
};
use std::{
    fmt,
    str::FromStr,
};
use thiserror::Error;

/// Number of squares on the board (10 home digits x 10 away digits).
pub const GRID_SIZE: usize = 100;
pub const GRID_SIDE: u8 = 10;

const WEI_PER_ETHER: u128 = 1_000_000_000_000_000_000;
const ETHER_DECIMALS: usize = 18;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid address '{0}': expected 20 hex-encoded bytes")]
    Address(String),
    #[error("invalid transaction hash '{0}': expected 32 hex-encoded bytes")]
    TxId(String),
    #[error("invalid ether amount '{0}'")]
    Amount(String),
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[derive(Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address([u8; 20]);

impl Address {
    pub const ZERO: Address = Address([0u8; 20]);

    pub const fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }

    /// `0x12ab...cdef`, the form the board labels squares with.
    pub fn short(&self) -> String {
        let full = self.to_string();
        format!("{}...{}", &full[..6], &full[full.len() - 4..])
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for Address {
    type Err = ParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        let digits = trimmed.strip_prefix("0x").unwrap_or(trimmed);
        let bytes = hex::decode(digits).map_err(|_| ParseError::Address(raw.into()))?;
        let bytes: [u8; 20] = bytes
            .try_into()
            .map_err(|_| ParseError::Address(raw.into()))?;
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for Address {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.to_string()
    }
}

/// Native-currency amount in wei.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[derive(Serialize, Deserialize)]
pub struct Amount(u128);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub const fn from_wei(wei: u128) -> Self {
        Self(wei)
    }

    pub const fn wei(self) -> u128 {
        self.0
    }

    /// Parses a decimal ether string such as `"0.1"`.
    pub fn from_ether(raw: &str) -> Result<Self, ParseError> {
        let err = || ParseError::Amount(raw.to_string());
        let trimmed = raw.trim();
        let (whole, frac) = trimmed.split_once('.').unwrap_or((trimmed, ""));
        if whole.is_empty() && frac.is_empty() {
            return Err(err());
        }
        if frac.len() > ETHER_DECIMALS
            || !whole.chars().all(|c| c.is_ascii_digit())
            || !frac.chars().all(|c| c.is_ascii_digit())
        {
            return Err(err());
        }
        let whole: u128 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| err())?
        };
        let frac: u128 = if frac.is_empty() {
            0
        } else {
            let padded = format!("{frac:0<width$}", width = ETHER_DECIMALS);
            padded.parse().map_err(|_| err())?
        };
        whole
            .checked_mul(WEI_PER_ETHER)
            .and_then(|w| w.checked_add(frac))
            .map(Self)
            .ok_or_else(err)
    }

    pub fn checked_mul(self, count: u64) -> Option<Amount> {
        self.0.checked_mul(u128::from(count)).map(Amount)
    }

    pub fn saturating_mul(self, count: u64) -> Amount {
        Amount(self.0.saturating_mul(u128::from(count)))
    }

    pub fn saturating_sub(self, other: Amount) -> Amount {
        Amount(self.0.saturating_sub(other.0))
    }

    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / WEI_PER_ETHER;
        let frac = self.0 % WEI_PER_ETHER;
        if frac == 0 {
            return write!(f, "{whole} ETH");
        }
        let frac = format!("{frac:0>width$}", width = ETHER_DECIMALS);
        write!(f, "{whole}.{} ETH", frac.trim_end_matches('0'))
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct TxId([u8; 32]);

impl TxId {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let full = self.to_string();
        write!(f, "TxId({}..)", &full[..10])
    }
}

impl FromStr for TxId {
    type Err = ParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let digits = raw.trim().trim_start_matches("0x");
        let bytes = hex::decode(digits).map_err(|_| ParseError::TxId(raw.into()))?;
        let bytes: [u8; 32] =
            bytes.try_into().map_err(|_| ParseError::TxId(raw.into()))?;
        Ok(Self(bytes))
    }
}

/// Index into the 10x10 board: `home_digit * 10 + away_digit`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(Serialize, Deserialize)]
pub struct SquareIndex(u8);

impl SquareIndex {
    pub fn new(index: u8) -> Option<Self> {
        (usize::from(index) < GRID_SIZE).then_some(Self(index))
    }

    pub fn from_digits(home: u8, away: u8) -> Option<Self> {
        if home >= GRID_SIDE || away >= GRID_SIDE {
            return None;
        }
        Some(Self(home * GRID_SIDE + away))
    }

    pub fn all() -> impl Iterator<Item = SquareIndex> {
        (0..GRID_SIZE as u8).map(SquareIndex)
    }

    pub fn get(self) -> u8 {
        self.0
    }

    pub fn as_usize(self) -> usize {
        usize::from(self.0)
    }

    /// Home score digit for this square.
    pub fn row(self) -> u8 {
        self.0 / GRID_SIDE
    }

    /// Away score digit for this square.
    pub fn col(self) -> u8 {
        self.0 % GRID_SIDE
    }
}

impl fmt::Display for SquareIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}-{})", self.0, self.row(), self.col())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RoundPhase {
    NotStarted,
    Active,
    Ended,
}

impl fmt::Display for RoundPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RoundPhase::NotStarted => "Not Started",
            RoundPhase::Active => "Active",
            RoundPhase::Ended => "Ended",
        };
        write!(f, "{label}")
    }
}

/// Scalar contract fields as last read from the ledger.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize)]
pub struct GameState {
    pub entry_price: Amount,
    pub started: bool,
    pub ended: bool,
    /// Only `Some` once the round has ended.
    pub home_digit: Option<u8>,
    /// Only `Some` once the round has ended.
    pub away_digit: Option<u8>,
    pub admin: Option<Address>,
}

impl GameState {
    pub fn phase(&self) -> RoundPhase {
        match (self.started, self.ended) {
            (_, true) => RoundPhase::Ended,
            (true, false) => RoundPhase::Active,
            (false, false) => RoundPhase::NotStarted,
        }
    }

    pub fn is_admin(&self, address: &Address) -> bool {
        self.admin.as_ref() == Some(address)
    }
}

/// Owner of every square, indexed by [`SquareIndex`]. Always `GRID_SIZE` long.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnershipTable(Vec<Option<Address>>);

impl Default for OwnershipTable {
    fn default() -> Self {
        Self::empty()
    }
}

impl OwnershipTable {
    pub fn empty() -> Self {
        Self(vec![None; GRID_SIZE])
    }

    /// Builds a table from one owner per square; zero addresses count as unowned.
    pub fn from_owners(owners: Vec<Option<Address>>) -> Option<Self> {
        if owners.len() != GRID_SIZE {
            return None;
        }
        Some(Self(
            owners
                .into_iter()
                .map(|owner| owner.filter(|a| !a.is_zero()))
                .collect(),
        ))
    }

    pub fn owner_of(&self, index: SquareIndex) -> Option<Address> {
        self.0[index.as_usize()]
    }

    pub fn is_owned(&self, index: SquareIndex) -> bool {
        self.owner_of(index).is_some()
    }

    pub fn sold_count(&self) -> usize {
        self.0.iter().filter(|owner| owner.is_some()).count()
    }

    pub fn owned_by(&self, address: &Address) -> Vec<SquareIndex> {
        SquareIndex::all()
            .filter(|index| self.owner_of(*index).as_ref() == Some(address))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SquareIndex, Option<Address>)> + '_ {
        SquareIndex::all().zip(self.0.iter().copied())
    }
}

/// Values computed from a [`GameState`] and an [`OwnershipTable`]; never stored.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct DerivedSnapshot {
    pub total_sold: usize,
    pub prize_pool: Amount,
    pub winning_index: Option<SquareIndex>,
    pub winner: Option<Address>,
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;

    #[test]
    fn amount_from_ether__parses_fractional_values() {
        // given
        let raw = "0.1";

        // when
        let amount = Amount::from_ether(raw).unwrap();

        // then
        assert_eq!(amount.wei(), 100_000_000_000_000_000);
        assert_eq!(amount.to_string(), "0.1 ETH");
    }

    #[test]
    fn amount_from_ether__rejects_garbage_and_excess_precision() {
        assert!(Amount::from_ether("").is_err());
        assert!(Amount::from_ether("abc").is_err());
        assert!(Amount::from_ether("0.0000000000000000001").is_err());
    }

    #[test]
    fn amount_display__whole_ether_has_no_fraction() {
        assert_eq!(Amount::from_ether("3").unwrap().to_string(), "3 ETH");
        assert_eq!(Amount::from_wei(1).to_string(), "0.000000000000000001 ETH");
    }

    #[test]
    fn address_from_str__accepts_mixed_case_with_prefix() {
        // given
        let raw = "0x6a6583Ee56cd07E4c5f2a2d3E387F3F703F93194";

        // when
        let address: Address = raw.parse().unwrap();

        // then
        assert_eq!(address.to_string(), raw.to_lowercase());
        assert_eq!(address.short(), "0x6a65...3194");
    }

    #[test]
    fn address_from_str__rejects_wrong_length() {
        assert!("0x1234".parse::<Address>().is_err());
    }

    #[test]
    fn square_index_from_digits__maps_home_to_row_and_away_to_col() {
        // when
        let index = SquareIndex::from_digits(5, 3).unwrap();

        // then
        assert_eq!(index.get(), 53);
        assert_eq!((index.row(), index.col()), (5, 3));
        assert!(SquareIndex::from_digits(10, 0).is_none());
        assert!(SquareIndex::new(100).is_none());
    }

    #[test]
    fn ownership_table_from_owners__treats_zero_address_as_unowned() {
        // given
        let mut owners = vec![None; GRID_SIZE];
        owners[4] = Some(Address::ZERO);
        owners[7] = Some(Address::new([7u8; 20]));

        // when
        let table = OwnershipTable::from_owners(owners).unwrap();

        // then
        assert_eq!(table.sold_count(), 1);
        assert!(!table.is_owned(SquareIndex::new(4).unwrap()));
        assert!(OwnershipTable::from_owners(vec![None; 99]).is_none());
    }
}
