//! Client for the on-chain football squares game: a locally consistent mirror of the
//! contract's state plus guarded submission of the game's transactions.

pub mod activity;
pub mod config;
pub mod derive;
pub mod error;
pub mod game_state;
pub mod ledger;
pub mod orchestrator;
pub mod poller;
pub mod squares;
pub mod sync;
pub mod telemetry;
pub mod types;

pub mod test_helpers;
