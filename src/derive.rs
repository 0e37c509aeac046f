use crate::types::{
    DerivedSnapshot,
    GameState,
    OwnershipTable,
    SquareIndex,
};

/// Computes sold count, prize pool and winner from the two cached views.
///
/// The winning square only exists once the round has ended and both score digits
/// are known. An ended round whose winning square was never bought yields
/// `winning_index = Some(..)` with `winner = None`.
pub fn derive(game: &GameState, squares: &OwnershipTable) -> DerivedSnapshot {
    let total_sold = squares.sold_count();
    let prize_pool = game.entry_price.saturating_mul(total_sold as u64);
    let winning_index = match (game.ended, game.home_digit, game.away_digit) {
        (true, Some(home), Some(away)) => SquareIndex::from_digits(home, away),
        _ => None,
    };
    let winner = winning_index.and_then(|index| squares.owner_of(index));
    DerivedSnapshot {
        total_sold,
        prize_pool,
        winning_index,
        winner,
    }
}
